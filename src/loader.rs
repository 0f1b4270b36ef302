//! Lifecycle Driver (component G): the loader's public surface. Owns
//! the module registry, bootstrap/search-path tables and system root
//! behind a single recursive lock, plus the private heap and FLS list
//! the redirection shim consults directly.
//!
//! The lock is reentrant (`parking_lot::ReentrantMutex`) because a
//! module's own `DllMain` can call back into a redirected routine
//! (`GetProcAddress`, `FlsAlloc`, ...) while this loader is still
//! mid-`load` on the same thread. State mutations are always short:
//! [`PrivateLoader::with_state`] never stays held across a call into
//! foreign code, so the inner `RefCell` never double-borrows even
//! under reentry.

use std::cell::RefCell;
use std::ffi::c_void;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use once_cell::sync::OnceCell;
use parking_lot::ReentrantMutex;

use crate::bootstrap::{self, BootstrapEntry, SearchPathTable};
use crate::error::{LoaderError, Result};
use crate::host::SectionMapper;
use crate::mapper::{self, MappedImage};
use crate::pe::headers::PeView;
use crate::redirect::PrivateHeap;
use crate::registry::{ModuleId, ModuleRegistry};

type DllEntryFn = unsafe extern "system" fn(*mut c_void, u32, *mut c_void) -> i32;

const DLL_PROCESS_DETACH: u32 = 0;
const DLL_PROCESS_ATTACH: u32 = 1;
const DLL_THREAD_ATTACH: u32 = 2;
const DLL_THREAD_DETACH: u32 = 3;

struct LoaderState {
    registry: ModuleRegistry,
    search_paths: SearchPathTable,
    system_root: PathBuf,
}

pub struct PrivateLoader {
    state: ReentrantMutex<RefCell<LoaderState>>,
    heap: PrivateHeap,
    fls: crate::fls::FlsList,
    process_heap: AtomicUsize,
    raw_mapper: Box<dyn SectionMapper>,
    section_mapper: Box<dyn SectionMapper>,
}

static LOADER: OnceCell<PrivateLoader> = OnceCell::new();

/// Returns the process-wide loader instance.
///
/// # Panics
/// Panics if [`init`] has not run yet — every substitute routine in
/// `redirect.rs` only becomes reachable after a module has been
/// loaded, which implies `init` already ran.
pub fn global() -> &'static PrivateLoader {
    LOADER.get().expect("PrivateLoader::init must run before use")
}

/// Brings the loader up:
/// 1. reads the system root;
/// 2. registers the host modules this process already has mapped
///    (`ntdll.dll`, the process's own image, `user32.dll` if present)
///    as `externally_loaded` records, so the first private import from
///    any of them resolves against the existing mapping instead of
///    triggering a second, private one;
/// 3. installs the process-wide singleton;
/// 4. migrates anything an embedding runtime pushed into the bootstrap
///    table (via [`load_during_bootstrap`]) into the real registry,
///    running the same protect/resolve/entry-point sequence a normal
///    load would have.
///
/// Must run exactly once, before the first `load` call.
pub fn init() -> Result<()> {
    let system_root = crate::host::read_system_root()?;
    log::info!("private loader starting, system root = {}", system_root.display());

    let mut registry = ModuleRegistry::new();
    for (name, base, size) in host_dependencies() {
        log::info!("registering host dependency {name} at {base:#x}, size {size:#x}");
        registry.insert(None, base, size, name, true);
    }

    let state = LoaderState {
        registry,
        search_paths: SearchPathTable::new(),
        system_root,
    };

    let loader = PrivateLoader {
        state: ReentrantMutex::new(RefCell::new(state)),
        heap: PrivateHeap::new(),
        fls: crate::fls::FlsList::new(),
        process_heap: AtomicUsize::new(current_process_heap()),
        raw_mapper: Box::new(crate::host::RawSectionMapper),
        section_mapper: Box::new(crate::host::WindowsSectionMapper),
    };

    LOADER
        .set(loader)
        .map_err(|_| LoaderError::ResourceExhaustion("loader already initialized"))?;

    bootstrap::mark_allocator_ready();

    let loader = global();
    for entry in bootstrap::drain_pre_init() {
        loader.finalize_bootstrap_entry(entry);
    }

    log::info!("private loader initialized");
    Ok(())
}

/// Maps `path` through the raw (pre-allocator) backend and records it
/// in the bootstrap table, without resolving its imports or running
/// its entry point yet. For an embedding runtime's own client libraries
/// that must be mapped before [`init`] has a registry to put them in;
/// [`init`] migrates every such entry into the registry and finalizes
/// it once it runs.
pub fn load_during_bootstrap(path: &Path) -> Result<*mut u8> {
    let short_name = file_name(path)?;
    let raw = crate::host::RawSectionMapper;
    let mapped = mapper::map_and_relocate(path, &raw)?;
    bootstrap::push_pre_init(BootstrapEntry {
        base: mapped.base as usize,
        size: mapped.size,
        name: short_name,
    })?;
    Ok(mapped.base)
}

#[cfg(windows)]
fn current_process_heap() -> usize {
    unsafe { winapi::um::heapapi::GetProcessHeap() as usize }
}

#[cfg(not(windows))]
fn current_process_heap() -> usize {
    0
}

fn file_name(path: &Path) -> Result<String> {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|s| s.to_string())
        .ok_or(LoaderError::MalformedImage("path has no file name component"))
}

/// Probes an already-mapped host module's headers with a fixed-size
/// window to read `size_of_image` before the true span is known —
/// mirrors `mapper::image_span`'s approach against on-disk bytes, just
/// against an in-memory module instead of a file buffer.
const HOST_PROBE_SIZE: usize = 0x1000;

/// Looks up an already-mapped host module by name (or the process's own
/// image when `name` is `None`) and reads its base/size/display name
/// off its own headers.
#[cfg(windows)]
fn host_module(name: Option<&str>) -> Option<(String, usize, usize)> {
    use std::ffi::CString;
    use winapi::um::libloaderapi::{GetModuleFileNameA, GetModuleHandleA};

    let handle = match name {
        Some(n) => {
            let c = CString::new(n).ok()?;
            unsafe { GetModuleHandleA(c.as_ptr()) }
        }
        None => unsafe { GetModuleHandleA(std::ptr::null()) },
    };
    if handle.is_null() {
        return None;
    }

    let base = handle as *const u8;
    let view = unsafe { PeView::new(base, HOST_PROBE_SIZE) }.ok()?;
    let size = view.optional_header().size_of_image as usize;

    let display_name = match name {
        Some(n) => n.to_string(),
        None => {
            let mut buf = [0u8; 260];
            let len = unsafe {
                GetModuleFileNameA(handle as *mut _, buf.as_mut_ptr() as *mut i8, buf.len() as u32)
            };
            if len == 0 {
                "<main>".to_string()
            } else {
                std::str::from_utf8(&buf[..len as usize])
                    .ok()
                    .and_then(|s| Path::new(s).file_name())
                    .and_then(|n| n.to_str())
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "<main>".to_string())
            }
        }
    };

    Some((display_name, base as usize, size))
}

#[cfg(not(windows))]
fn host_module(_name: Option<&str>) -> Option<(String, usize, usize)> {
    None
}

/// The host dependencies every already-mapped image needs recognized
/// before any private load can run: the process's own main image,
/// `ntdll.dll` (every process has it mapped before user code runs), and
/// `user32.dll` when the process happens to have it mapped already.
/// Missing ones (e.g. a console-subsystem process with no `user32.dll`)
/// are silently skipped — nothing downstream requires the full set.
fn host_dependencies() -> Vec<(String, usize, usize)> {
    [None, Some("ntdll.dll"), Some("user32.dll")]
        .into_iter()
        .filter_map(host_module)
        .collect()
}

impl PrivateLoader {
    /// Runs `f` with exclusive access to loader state. Kept deliberately
    /// short-lived by every caller in this module: never call into a
    /// module's own code (entry points, or anything reached through the
    /// redirection shim) while still inside this closure.
    fn with_state<R>(&self, f: impl FnOnce(&mut LoaderState) -> R) -> R {
        let guard = self.state.lock();
        let mut state = guard.borrow_mut();
        f(&mut state)
    }

    pub fn heap(&self) -> &PrivateHeap {
        &self.heap
    }

    pub fn fls(&self) -> &crate::fls::FlsList {
        &self.fls
    }

    pub fn owns_process_heap(&self, handle: *mut c_void) -> bool {
        self.process_heap.load(Ordering::Acquire) == handle as usize
    }

    pub fn registry_contains(&self, addr: usize) -> bool {
        self.with_state(|s| s.registry.contains(addr))
    }

    pub fn lookup_private_base(&self, name: &str) -> Option<usize> {
        self.with_state(|s| {
            s.registry
                .lookup_by_name(name)
                .and_then(|id| s.registry.get(id))
                .map(|r| r.base)
        })
    }

    pub fn private_module_name(&self, addr: usize) -> Option<String> {
        self.with_state(|s| {
            s.registry
                .module_containing(addr)
                .and_then(|id| s.registry.get(id))
                .map(|r| r.name.clone())
        })
    }

    pub fn module_base(&self, id: ModuleId) -> Option<usize> {
        self.with_state(|s| s.registry.get(id).map(|r| r.base))
    }

    pub fn module_size(&self, id: ModuleId) -> Option<usize> {
        self.with_state(|s| s.registry.get(id).map(|r| r.size))
    }

    /// Does `addr` fall inside a privately-loaded module's mapped span?
    pub fn contains(&self, addr: *const u8) -> bool {
        self.registry_contains(addr as usize)
    }

    /// Looks `symbol` up in the export table of whichever private
    /// module contains `module_base`. Used by the `GetProcAddress`
    /// substitute when a caller asks for a symbol this shim doesn't
    /// redirect. Does not chase forwarders — a direct lookup hitting a
    /// forwarder here is rare enough not to warrant it.
    pub fn resolve_export(&self, module_base: usize, symbol: &str) -> Option<usize> {
        let (base, size) = self.with_state(|s| {
            s.registry
                .module_containing(module_base)
                .and_then(|id| s.registry.get(id))
                .map(|r| (r.base, r.size))
        })?;
        let view = unsafe { PeView::new(base as *const u8, size) }.ok()?;
        match crate::pe::exports::find_by_name(&view, symbol).ok()? {
            Some(crate::pe::exports::Resolved::Address(addr)) => Some(addr as usize),
            _ => None,
        }
    }

    /// Loads `name`'s transitive dependency if not already registered,
    /// bumping its ref count if it is. Used by the resolver while
    /// walking a module's import table. `importer` anchors the new
    /// record immediately after the module that pulled it in, so list
    /// order stays dependents-before-dependencies even as the import
    /// graph is discovered depth-first.
    pub fn resolve_dependency(&self, name: &str, importer: ModuleId) -> Result<ModuleId> {
        if let Some(id) = self.with_state(|s| {
            s.registry.lookup_by_name(name).inspect(|&id| s.registry.bump_ref(id))
        }) {
            return Ok(id);
        }

        let path = self
            .with_state(|s| crate::search::resolve(name, s.search_paths.as_slice(), &s.system_root))
            .ok_or_else(|| LoaderError::DependencyNotFound(name.to_string()))?;

        self.load_and_link(&path, Some(importer))
    }

    /// Loads an explicitly requested library (no importer). Returns its
    /// mapped base address.
    pub fn load(&self, path: &Path) -> Result<*mut u8> {
        let short_name = file_name(path)?;
        if let Some(base) = self.with_state(|s| {
            s.registry
                .lookup_by_name(&short_name)
                .inspect(|&id| s.registry.bump_ref(id))
                .and_then(|id| s.registry.get(id))
                .map(|r| r.base)
        }) {
            return Ok(base as *mut u8);
        }

        let id = self.load_and_link(path, None)?;
        Ok(self.module_base(id).expect("just inserted") as *mut u8)
    }

    fn mapper_for(&self, use_raw_backend: bool) -> &dyn SectionMapper {
        if use_raw_backend {
            self.raw_mapper.as_ref()
        } else {
            self.section_mapper.as_ref()
        }
    }

    fn load_and_link(&self, path: &Path, after: Option<ModuleId>) -> Result<ModuleId> {
        let short_name = file_name(path)?;
        let use_raw_backend = !bootstrap::allocator_ready();
        let mapper = self.mapper_for(use_raw_backend);
        let mapped: MappedImage = mapper::map_and_relocate(path, mapper)?;

        if let Some(dir) = path.parent() {
            self.with_state(|s| {
                if let Err(e) = s.search_paths.push(dir.to_path_buf()) {
                    log::warn!("search path table full, dropping {}: {e}", dir.display());
                }
            });
        }

        let id = self.with_state(|s| {
            s.registry.insert(after, mapped.base as usize, mapped.size, short_name.clone(), false)
        });

        if let Err(e) = self.finish_load(id, &mapped, &short_name) {
            self.with_state(|s| {
                s.registry.remove(id);
            });
            unsafe { mapper.unmap(mapped.base, mapped.size) };
            return Err(e);
        }

        Ok(id)
    }

    /// Runs the same protect/resolve/entry-point sequence `load_and_link`
    /// does, for a module that is already mapped and already registered
    /// (used for both the normal path and bootstrap-entry migration).
    fn finish_load(&self, id: ModuleId, mapped: &MappedImage, short_name: &str) -> Result<()> {
        let view = unsafe { PeView::new(mapped.base, mapped.size) }
            .map_err(|_| LoaderError::MalformedImage("post-relocation validation failed"))?;

        mapper::protect_sections(&view)?;
        let touched = crate::resolver::resolve_imports(self, id, &view)?;

        let entry_rva = view.optional_header().address_of_entry_point;
        if entry_rva != 0 {
            let entry: DllEntryFn =
                unsafe { std::mem::transmute(mapped.base.add(entry_rva as usize)) };
            let ok = unsafe { entry(mapped.base as *mut c_void, DLL_PROCESS_ATTACH, std::ptr::null_mut()) };
            if ok == 0 {
                crate::resolver::unload_imports(self, &touched);
                return Err(LoaderError::EntryPointFailure(short_name.to_string()));
            }
        }

        Ok(())
    }

    /// Migrates one bootstrap-phase entry into the registry and
    /// finalizes it. Failures are logged and the entry is dropped
    /// rather than propagated — a bad bootstrap entry shouldn't fail
    /// `init` for every other module that did map cleanly.
    fn finalize_bootstrap_entry(&self, entry: BootstrapEntry) {
        let mapped = MappedImage {
            base: entry.base as *mut u8,
            size: entry.size,
        };
        let id = self.with_state(|s| {
            s.registry.insert(None, mapped.base as usize, mapped.size, entry.name.clone(), false)
        });

        if let Err(e) = self.finish_load(id, &mapped, &entry.name) {
            log::warn!("failed to finalize bootstrap module {}: {e}", entry.name);
            self.with_state(|s| {
                s.registry.remove(id);
            });
            unsafe { self.raw_mapper.unmap(mapped.base, mapped.size) };
        }
    }

    /// Drops one reference on the module mapped at `base`. Runs
    /// `DLL_PROCESS_DETACH` and unmaps the image once the count reaches
    /// zero. Returns `false` if `base` names no registered module.
    pub fn unload(&self, base: *mut u8) -> bool {
        let id = match self.with_state(|s| s.registry.lookup_by_base(base as usize)) {
            Some(id) => id,
            None => return false,
        };

        let reached_zero = self.with_state(|s| s.registry.release_ref(id));
        if !reached_zero {
            return true;
        }

        let Some((size, externally_loaded)) =
            self.with_state(|s| s.registry.get(id).map(|r| (r.size, r.externally_loaded)))
        else {
            return false;
        };

        if !externally_loaded {
            self.call_entry(base, size, DLL_PROCESS_DETACH);
            let use_raw_backend = !bootstrap::allocator_ready();
            unsafe { self.mapper_for(use_raw_backend).unmap(base, size) };
        }

        self.with_state(|s| {
            s.registry.remove(id);
        });
        true
    }

    fn call_entry(&self, base: *mut u8, size: usize, reason: u32) {
        let Ok(view) = (unsafe { PeView::new(base, size) }) else {
            return;
        };
        let entry_rva = view.optional_header().address_of_entry_point;
        if entry_rva == 0 {
            return;
        }
        let entry: DllEntryFn = unsafe { std::mem::transmute(base.add(entry_rva as usize)) };
        unsafe {
            entry(base as *mut c_void, reason, std::ptr::null_mut());
        }
    }

    /// Notifies every privately-loaded module of a new thread, in
    /// dependent-before-dependency order (same order modules were
    /// loaded in).
    pub fn thread_attach(&self) {
        let ids: Vec<ModuleId> = self.with_state(|s| s.registry.iter_forward().collect());
        for id in ids {
            self.notify_thread(id, DLL_THREAD_ATTACH);
        }
    }

    /// Notifies every privately-loaded module of a thread's exit, in
    /// reverse order — mirroring how the OS loader tears threads down
    /// relative to how it brings them up.
    pub fn thread_detach(&self) {
        let ids: Vec<ModuleId> = self.with_state(|s| s.registry.iter_forward().collect());
        for id in ids.into_iter().rev() {
            self.notify_thread(id, DLL_THREAD_DETACH);
        }
    }

    fn notify_thread(&self, id: ModuleId, reason: u32) {
        let Some((base, size, externally_loaded)) =
            self.with_state(|s| s.registry.get(id).map(|r| (r.base, r.size, r.externally_loaded)))
        else {
            return;
        };
        if externally_loaded {
            return;
        }
        self.call_entry(base as *mut u8, size, reason);
    }

    /// Unloads every privately-loaded module, dependents first.
    pub fn shutdown(&self) {
        loop {
            let Some(base) =
                self.with_state(|s| s.registry.head().and_then(|id| s.registry.get(id)).map(|r| r.base))
            else {
                break;
            };
            loop {
                if !self.unload(base as *mut u8) {
                    break;
                }
                if self.with_state(|s| s.registry.lookup_by_base(base)).is_none() {
                    break;
                }
            }
        }
        log::info!("private loader shutdown complete");
    }
}
