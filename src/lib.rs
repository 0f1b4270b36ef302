//! Private PE loader: maps, relocates, and initializes a Windows DLL
//! without registering it with the process's own loader, and redirects
//! a small closed set of a loaded module's imports (heap routines,
//! `FlsAlloc`, `GetProcAddress`, ...) to implementations that never
//! touch the host's default heap or FLS callback list.
//!
//! Only 64-bit PE images are supported. Non-Windows targets build (so
//! the crate can be developed and unit-tested cross-platform) but
//! every operation that needs the OS loader or virtual memory APIs
//! returns [`LoaderError::MalformedImage`] at that call site.

mod bootstrap;
mod error;
mod fls;
pub mod host;
mod loader;
mod mapper;
mod pe;
mod redirect;
mod registry;
mod resolver;
mod search;

use std::path::Path;

pub use error::{LoaderError, Result};

/// Brings the private loader up: reads the system root and installs
/// the process-wide loader state. Must run once before [`load`].
pub fn init() -> Result<()> {
    loader::init()
}

/// Privately loads the DLL at `path`, resolving and initializing its
/// transitive dependencies along the way. Returns the mapped base
/// address. Calling this again for an already-loaded path bumps its
/// reference count and returns the same base.
pub fn load(path: &Path) -> Result<*mut u8> {
    loader::global().load(path)
}

/// Drops one reference on the module mapped at `base`. Once the count
/// reaches zero, runs `DLL_PROCESS_DETACH` and unmaps the image.
/// Returns `false` if `base` names no module this loader tracks.
pub fn unload(base: *mut u8) -> bool {
    loader::global().unload(base)
}

/// Notifies every privately-loaded module of a new thread
/// (`DLL_THREAD_ATTACH`), in load order.
pub fn thread_attach() {
    loader::global().thread_attach()
}

/// Notifies every privately-loaded module of a thread's exit
/// (`DLL_THREAD_DETACH`), in reverse load order.
pub fn thread_detach() {
    loader::global().thread_detach()
}

/// Reports whether `addr` falls inside a privately-loaded module's
/// mapped address range. Used to decide whether a redirected routine
/// was called on our behalf or the host's.
pub fn contains(addr: *const u8) -> bool {
    loader::global().contains(addr)
}

/// Unloads every privately-loaded module, dependents before
/// dependencies. Call once during process shutdown.
pub fn shutdown() {
    loader::global().shutdown()
}

/// Maps `path` with the pre-allocator backend and holds it in the
/// bootstrap table. For mapping an embedding runtime's own client
/// libraries before [`init`] has run; [`init`] migrates every such
/// entry into the registry and finalizes it (import resolution, entry
/// point) once it runs.
pub fn load_during_bootstrap(path: &Path) -> Result<*mut u8> {
    loader::load_during_bootstrap(path)
}

/// Dispatches an FLS callback the host's own loader won't call
/// directly, if it's one a privately-loaded library registered via
/// `FlsAlloc`. `ctx` is the intercepting thread context (a `CONTEXT*`
/// on Windows); `pc` is the callback address. Returns `false` without
/// side effects if `pc` isn't a recognized callback.
///
/// # Safety
/// `ctx` must point to a valid, writable thread context for the thread
/// this call runs on.
pub unsafe fn private_lib_handle_cb(ctx: *mut std::ffi::c_void, pc: usize) -> bool {
    fls::private_lib_handle_cb(ctx, pc)
}
