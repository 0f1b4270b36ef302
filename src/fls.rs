//! FLS (Fiber Local Storage) callback trampoline (component H): tracks
//! which FLS callback pointers belong to privately-loaded libraries, so
//! the `FlsAlloc` substitute in `redirect.rs` can recognize them later,
//! and [`private_lib_handle_cb`] actually dispatches to one when the
//! host can't call it directly (the pointer resolves into a region the
//! host's own loader never registered a module at, so nothing but this
//! crate knows it's a valid callback target).
//!
//! Guarded by its own non-recursive mutex — separate from the loader's
//! recursive lock, since callback dispatch can happen on a thread that
//! is simultaneously inside a `load`/`unload` call.

use parking_lot::Mutex;

/// Registered FLS callback pointers. A permanent sentinel entry (zero)
/// keeps the list non-empty so callers never need to special-case "no
/// callbacks registered yet".
pub struct FlsList {
    callbacks: Mutex<Vec<usize>>,
}

impl FlsList {
    pub fn new() -> Self {
        Self {
            callbacks: Mutex::new(vec![0]),
        }
    }

    /// Records a callback pointer. Idempotent. Entries are never
    /// removed: a library can be unloaded from the registry's
    /// perspective while a fiber still mid-flight calls its FLS
    /// destructor on another thread.
    pub fn register(&self, callback: usize) {
        let mut list = self.callbacks.lock();
        if !list.contains(&callback) {
            list.push(callback);
        }
    }

    pub fn is_registered(&self, callback: usize) -> bool {
        self.callbacks.lock().contains(&callback)
    }

    pub fn len(&self) -> usize {
        self.callbacks.lock().len()
    }
}

impl Default for FlsList {
    fn default() -> Self {
        Self::new()
    }
}

/// Dispatches a would-be FLS callback the host's own loader refuses to
/// call directly. `ctx` is the thread context captured at the point the
/// call was intercepted (a `CONTEXT*` on Windows); `pc` is the callback
/// address the host was about to transfer control to.
///
/// Returns `true` and actually runs the callback (with its single
/// `lpFlsData` argument taken from `Rcx`, matching the callback's own
/// calling convention) if `pc` is one this loader registered; `false`
/// if it recognizes nothing here, leaving the caller to fall back to
/// however it handles an unrecognized target.
///
/// On the success path this also walks the context forward as if the
/// intercepted call had completed normally: pops the return address
/// sitting at `Rsp` and resumes at it. This is the best-effort half of
/// the component — it assumes the interception point is a fresh `call`
/// (return address on top of stack, nothing else to unwind) and has no
/// way to be validated without a live host loader to intercept for
/// real.
///
/// # Safety
/// `ctx` must point to a valid, writable `CONTEXT` for the thread this
/// call is dispatching on.
#[cfg(windows)]
pub unsafe fn private_lib_handle_cb(ctx: *mut std::ffi::c_void, pc: usize) -> bool {
    use std::ffi::c_void;
    use winapi::um::winnt::CONTEXT;

    if !crate::loader::global().fls().is_registered(pc) {
        return false;
    }

    let context = &mut *(ctx as *mut CONTEXT);
    let arg = context.Rcx as *mut c_void;

    let callback: unsafe extern "system" fn(*mut c_void) = std::mem::transmute(pc);
    callback(arg);

    let return_addr = *(context.Rsp as *const u64);
    context.Rsp = context.Rsp.wrapping_add(8);
    context.Rip = return_addr;
    true
}

#[cfg(not(windows))]
pub unsafe fn private_lib_handle_cb(_ctx: *mut std::ffi::c_void, _pc: usize) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinel_present_from_the_start() {
        let list = FlsList::new();
        assert_eq!(list.len(), 1);
        assert!(list.is_registered(0));
    }

    #[test]
    fn register_is_idempotent() {
        let list = FlsList::new();
        list.register(0x1000);
        list.register(0x1000);
        assert_eq!(list.len(), 2);
    }

    #[test]
    fn unregistered_pointer_is_reported_as_such() {
        let list = FlsList::new();
        assert!(!list.is_registered(0x1234));
    }
}
