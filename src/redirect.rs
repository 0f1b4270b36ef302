//! Redirection Shim (component F): substitute implementations for a
//! closed, statically declared set of donor-module symbols, so a
//! privately-loaded library never shares the host's default heap,
//! unhandled-exception filter, or FLS callback registry.
//!
//! The private heap's own allocations are distinguished from
//! system-heap blocks by an exact ownership set rather than a
//! contiguous address range (see `DESIGN.md`, Open Questions): the
//! backing allocator is the process's global Rust allocator, which
//! gives no contiguity guarantee, so an explicit membership check is
//! the only sound predicate.

use std::alloc::Layout;
use std::collections::HashMap;
use std::collections::HashSet;
use std::ptr;

use parking_lot::Mutex;

const HEADER_SIZE: usize = std::mem::size_of::<u64>();
const HEADER_ALIGN: usize = std::mem::align_of::<u64>();

/// Private heap backing `RtlAllocateHeap`/`RtlReAllocateHeap`/
/// `RtlFreeHeap`/`RtlSizeHeap` when called against the process's
/// default heap. Every block is prefixed with an 8-byte size header;
/// the returned pointer points past the header.
pub struct PrivateHeap {
    live: Mutex<HashSet<usize>>,
}

impl PrivateHeap {
    pub fn new() -> Self {
        Self {
            live: Mutex::new(HashSet::new()),
        }
    }

    pub fn is_our_address(&self, p: *const u8) -> bool {
        if p.is_null() {
            return false;
        }
        self.live.lock().contains(&(p as usize))
    }

    fn layout_for(size: usize) -> Layout {
        Layout::from_size_align(size + HEADER_SIZE, HEADER_ALIGN)
            .expect("requested heap size overflows")
    }

    /// # Safety
    /// Caller must ensure `size` is a sane allocation request; this
    /// mirrors `RtlAllocateHeap`'s contract.
    pub unsafe fn allocate(&self, size: usize, zero_fill: bool) -> *mut u8 {
        let layout = Self::layout_for(size);
        let raw = if zero_fill {
            std::alloc::alloc_zeroed(layout)
        } else {
            std::alloc::alloc(layout)
        };
        if raw.is_null() {
            return ptr::null_mut();
        }
        *(raw as *mut u64) = size as u64;
        let user = raw.add(HEADER_SIZE);
        self.live.lock().insert(user as usize);
        user
    }

    /// Returns the size a block was allocated with, if we own it.
    pub fn size_of(&self, p: *mut u8) -> Option<usize> {
        if !self.is_our_address(p) {
            return None;
        }
        unsafe { Some(*(p.sub(HEADER_SIZE) as *const u64) as usize) }
    }

    /// # Safety
    /// `p` must be one of our own live blocks.
    pub unsafe fn free(&self, p: *mut u8) -> bool {
        let Some(size) = self.size_of(p) else {
            return false;
        };
        let layout = Self::layout_for(size);
        std::alloc::dealloc(p.sub(HEADER_SIZE), layout);
        self.live.lock().remove(&(p as usize));
        true
    }

    /// # Safety
    /// `p`, if non-null, must be one of our own live blocks.
    pub unsafe fn reallocate(&self, p: *mut u8, new_size: usize) -> *mut u8 {
        if p.is_null() {
            return self.allocate(new_size, false);
        }
        let Some(old_size) = self.size_of(p) else {
            return ptr::null_mut();
        };
        let new_ptr = self.allocate(new_size, false);
        if new_ptr.is_null() {
            return ptr::null_mut();
        }
        ptr::copy_nonoverlapping(p, new_ptr, old_size.min(new_size));
        self.free(p);
        new_ptr
    }
}

impl Default for PrivateHeap {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolves a donor-module symbol name to a substitute function
/// address, if one is declared for it. Linear scan over a handful of
/// entries per donor — not worth a `phf` dependency.
pub fn substitute_for(donor: &str, symbol: &str) -> Option<usize> {
    let table: &[(&str, &str)] = if donor.eq_ignore_ascii_case("ntdll.dll") {
        NTDLL_SYMBOLS
    } else if donor.eq_ignore_ascii_case("kernel32.dll") {
        KERNEL32_SYMBOLS
    } else {
        return None;
    };

    table
        .iter()
        .position(|&(name, _)| name == symbol)
        .map(|i| ADDRESSES.with(|m| *m.get(&(donor.to_ascii_lowercase(), table[i].0)).unwrap()))
}

// The symbol-name tables double as documentation of the closed set of
// donor symbols this shim substitutes; the actual function
// *addresses* are resolved lazily (a `fn` item's address isn't
// const-evaluable), see `ADDRESSES` below.
const NTDLL_SYMBOLS: &[(&str, &str)] = &[
    ("LdrSetDllManifestProber", "ignore"),
    ("RtlSetThreadPoolStartFunc", "ignore"),
    ("RtlSetUnhandledExceptionFilter", "ignore"),
    ("RtlAllocateHeap", "heap"),
    ("RtlReAllocateHeap", "heap"),
    ("RtlFreeHeap", "heap"),
    ("RtlSizeHeap", "heap"),
    ("RtlFreeUnicodeString", "free_string"),
    ("RtlFreeAnsiString", "free_string"),
    ("RtlFreeOemString", "free_string"),
];

const KERNEL32_SYMBOLS: &[(&str, &str)] = &[
    ("FlsAlloc", "fls_alloc"),
    ("GetModuleHandleA", "get_module_handle_a"),
    ("GetProcAddress", "get_proc_address"),
];

thread_local! {
    static ADDRESSES: HashMap<(String, &'static str), usize> = build_address_table();
}

fn build_address_table() -> HashMap<(String, &'static str), usize> {
    let mut m = HashMap::new();
    for &(name, _) in NTDLL_SYMBOLS {
        m.insert(("ntdll.dll".to_string(), name), substitutes::address_of_ntdll(name));
    }
    for &(name, _) in KERNEL32_SYMBOLS {
        m.insert(("kernel32.dll".to_string(), name), substitutes::address_of_kernel32(name));
    }
    m
}

/// The actual substitute function bodies. Kept separate from the table
/// above so the table stays a readable list of names while the
/// implementations live near each other for review.
pub mod substitutes {
    use super::*;
    use crate::loader::global;
    use winapi::shared::minwindef::{BOOL, DWORD, FALSE, LPVOID, TRUE};
    use winapi::shared::ntdef::{HANDLE, PVOID};

    pub fn address_of_ntdll(name: &str) -> usize {
        match name {
            "LdrSetDllManifestProber" => ignore_call_1 as usize,
            "RtlSetThreadPoolStartFunc" => ignore_call_1 as usize,
            "RtlSetUnhandledExceptionFilter" => ignore_call_1 as usize,
            "RtlAllocateHeap" => rtl_allocate_heap as usize,
            "RtlReAllocateHeap" => rtl_reallocate_heap as usize,
            "RtlFreeHeap" => rtl_free_heap as usize,
            "RtlSizeHeap" => rtl_size_heap as usize,
            "RtlFreeUnicodeString" => rtl_free_unicode_string as usize,
            "RtlFreeAnsiString" => rtl_free_unicode_string as usize,
            "RtlFreeOemString" => rtl_free_unicode_string as usize,
            other => unreachable!("no substitute registered for ntdll!{other}"),
        }
    }

    pub fn address_of_kernel32(name: &str) -> usize {
        match name {
            "FlsAlloc" => fls_alloc as usize,
            "GetModuleHandleA" => get_module_handle_a as usize,
            "GetProcAddress" => get_proc_address as usize,
            other => unreachable!("no substitute registered for kernel32!{other}"),
        }
    }

    /// Shared shape for the three "return success, ignore arguments"
    /// substitutes (`LdrSetDllManifestProber`,
    /// `RtlSetThreadPoolStartFunc`, `RtlSetUnhandledExceptionFilter`):
    /// all three take a single pointer-sized argument and return a
    /// status/pointer the caller treats as "it worked".
    unsafe extern "system" fn ignore_call_1(_arg: PVOID) -> PVOID {
        ptr::null_mut()
    }

    unsafe extern "system" fn rtl_allocate_heap(heap: HANDLE, flags: DWORD, size: usize) -> PVOID {
        const HEAP_ZERO_MEMORY: DWORD = 0x0000_0008;
        if !global().owns_process_heap(heap) {
            return forward::rtl_allocate_heap(heap, flags, size);
        }
        global().heap().allocate(size, flags & HEAP_ZERO_MEMORY != 0) as PVOID
    }

    unsafe extern "system" fn rtl_reallocate_heap(
        heap: HANDLE,
        flags: DWORD,
        p: PVOID,
        size: usize,
    ) -> PVOID {
        if !p.is_null() && !global().heap().is_our_address(p as *const u8) {
            return forward::rtl_reallocate_heap(heap, flags, p, size);
        }
        global().heap().reallocate(p as *mut u8, size) as PVOID
    }

    unsafe extern "system" fn rtl_free_heap(heap: HANDLE, _flags: DWORD, p: PVOID) -> BOOL {
        if !global().heap().is_our_address(p as *const u8) {
            return forward::rtl_free_heap(heap, _flags, p);
        }
        if global().heap().free(p as *mut u8) {
            TRUE
        } else {
            FALSE
        }
    }

    unsafe extern "system" fn rtl_size_heap(heap: HANDLE, _flags: DWORD, p: PVOID) -> usize {
        match global().heap().size_of(p as *mut u8) {
            Some(size) => size,
            None => forward::rtl_size_heap(heap, _flags, p),
        }
    }

    /// `RtlFreeUnicodeString`/`RtlFreeAnsiString`/`RtlFreeOemString`
    /// share one layout: a descriptor whose first field (after
    /// length/max-length) is the buffer pointer we must check for
    /// ownership.
    #[repr(C)]
    pub struct StringDescriptor {
        pub length: u16,
        pub max_length: u16,
        pub buffer: PVOID,
    }

    unsafe extern "system" fn rtl_free_unicode_string(desc: *mut StringDescriptor) {
        if desc.is_null() {
            return;
        }
        let buffer = (*desc).buffer;
        if global().heap().is_our_address(buffer as *const u8) {
            global().heap().free(buffer as *mut u8);
        } else if !buffer.is_null() {
            forward::rtl_free_unicode_string(desc);
            return;
        }
        (*desc).buffer = ptr::null_mut();
        (*desc).length = 0;
        (*desc).max_length = 0;
    }

    unsafe extern "system" fn fls_alloc(callback: LPVOID) -> DWORD {
        let pc = callback as usize;
        if global().registry_contains(pc) {
            global().fls().register(pc);
        }
        forward::fls_alloc(callback)
    }

    unsafe extern "system" fn get_module_handle_a(name: *const i8) -> HANDLE {
        if name.is_null() {
            return forward::get_module_handle_a(name);
        }
        let cname = std::ffi::CStr::from_ptr(name).to_string_lossy();
        if let Some(base) = global().lookup_private_base(&cname) {
            return base as HANDLE;
        }
        forward::get_module_handle_a(name)
    }

    unsafe extern "system" fn get_proc_address(module: HANDLE, name: *const i8) -> PVOID {
        let addr = module as usize;
        if global().registry_contains(addr) {
            // This handle names a host-invisible module, so the real
            // GetProcAddress has no idea it exists — resolve it
            // ourselves instead of forwarding.
            let symbol = std::ffi::CStr::from_ptr(name).to_string_lossy();
            if let Some(donor) = global().private_module_name(addr) {
                if let Some(sub) = super::substitute_for(&donor, &symbol) {
                    return sub as PVOID;
                }
            }
            return match global().resolve_export(addr, &symbol) {
                Some(resolved) => resolved as PVOID,
                None => ptr::null_mut(),
            };
        }
        forward::get_proc_address(module, name)
    }

    /// Thin wrappers around the native ntdll/kernel32 exports, resolved
    /// lazily by name and cached — used whenever a substitute above
    /// decides "not ours, forward it".
    mod forward {
        use super::*;
        use once_cell::sync::OnceCell;

        fn native(dll: &str, symbol: &str) -> usize {
            static CACHE: OnceCell<Mutex<HashMap<(String, String), usize>>> = OnceCell::new();
            let cache = CACHE.get_or_init(|| Mutex::new(HashMap::new()));
            let key = (dll.to_string(), symbol.to_string());
            if let Some(&addr) = cache.lock().get(&key) {
                return addr;
            }
            let addr = unsafe { crate::redirect::raw_lookup(dll, symbol) };
            cache.lock().insert(key, addr);
            addr
        }

        pub unsafe fn rtl_allocate_heap(heap: HANDLE, flags: DWORD, size: usize) -> PVOID {
            let f: unsafe extern "system" fn(HANDLE, DWORD, usize) -> PVOID =
                std::mem::transmute(native("ntdll.dll", "RtlAllocateHeap"));
            f(heap, flags, size)
        }

        pub unsafe fn rtl_reallocate_heap(
            heap: HANDLE,
            flags: DWORD,
            p: PVOID,
            size: usize,
        ) -> PVOID {
            let f: unsafe extern "system" fn(HANDLE, DWORD, PVOID, usize) -> PVOID =
                std::mem::transmute(native("ntdll.dll", "RtlReAllocateHeap"));
            f(heap, flags, p, size)
        }

        pub unsafe fn rtl_free_heap(heap: HANDLE, flags: DWORD, p: PVOID) -> BOOL {
            let f: unsafe extern "system" fn(HANDLE, DWORD, PVOID) -> BOOL =
                std::mem::transmute(native("ntdll.dll", "RtlFreeHeap"));
            f(heap, flags, p)
        }

        pub unsafe fn rtl_size_heap(heap: HANDLE, flags: DWORD, p: PVOID) -> usize {
            let f: unsafe extern "system" fn(HANDLE, DWORD, PVOID) -> usize =
                std::mem::transmute(native("ntdll.dll", "RtlSizeHeap"));
            f(heap, flags, p)
        }

        pub unsafe fn rtl_free_unicode_string(desc: *mut StringDescriptor) {
            let f: unsafe extern "system" fn(*mut StringDescriptor) =
                std::mem::transmute(native("ntdll.dll", "RtlFreeUnicodeString"));
            f(desc)
        }

        pub unsafe fn fls_alloc(callback: LPVOID) -> DWORD {
            let f: unsafe extern "system" fn(LPVOID) -> DWORD =
                std::mem::transmute(native("kernel32.dll", "FlsAlloc"));
            f(callback)
        }

        pub unsafe fn get_module_handle_a(name: *const i8) -> HANDLE {
            let f: unsafe extern "system" fn(*const i8) -> HANDLE =
                std::mem::transmute(native("kernel32.dll", "GetModuleHandleA"));
            f(name)
        }

        pub unsafe fn get_proc_address(module: HANDLE, name: *const i8) -> PVOID {
            let f: unsafe extern "system" fn(HANDLE, *const i8) -> PVOID =
                std::mem::transmute(native("kernel32.dll", "GetProcAddress"));
            f(module, name) as PVOID
        }
    }
}

/// # Safety
/// `dll`/`symbol` must name a module already resident in the process
/// (ntdll and kernel32 always are).
#[cfg(windows)]
unsafe fn raw_lookup(dll: &str, symbol: &str) -> usize {
    use winapi::um::libloaderapi::{GetModuleHandleA, GetProcAddress};
    let dll_c = std::ffi::CString::new(dll).unwrap();
    let sym_c = std::ffi::CString::new(symbol).unwrap();
    let module = GetModuleHandleA(dll_c.as_ptr());
    if module.is_null() {
        return 0;
    }
    GetProcAddress(module, sym_c.as_ptr()) as usize
}

#[cfg(not(windows))]
unsafe fn raw_lookup(_dll: &str, _symbol: &str) -> usize {
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heap_round_trips_size_and_ownership() {
        let heap = PrivateHeap::new();
        unsafe {
            let p = heap.allocate(32, false);
            assert!(!p.is_null());
            assert!(heap.is_our_address(p));
            assert_eq!(heap.size_of(p), Some(32));
            assert!(heap.free(p));
            assert!(!heap.is_our_address(p));
        }
    }

    #[test]
    fn zero_fill_flag_zeroes_the_block() {
        let heap = PrivateHeap::new();
        unsafe {
            let p = heap.allocate(16, true);
            let bytes = std::slice::from_raw_parts(p, 16);
            assert!(bytes.iter().all(|&b| b == 0));
            heap.free(p);
        }
    }

    #[test]
    fn foreign_pointer_is_never_ours() {
        let heap = PrivateHeap::new();
        let stack_var = 0u8;
        assert!(!heap.is_our_address(&stack_var as *const u8));
    }

    #[test]
    fn reallocate_preserves_prefix_bytes() {
        let heap = PrivateHeap::new();
        unsafe {
            let p = heap.allocate(4, false);
            ptr::write_bytes(p, 0xAB, 4);
            let p2 = heap.reallocate(p, 8);
            assert_eq!(heap.size_of(p2), Some(8));
            let bytes = std::slice::from_raw_parts(p2, 4);
            assert!(bytes.iter().all(|&b| b == 0xAB));
            heap.free(p2);
        }
    }

    #[test]
    fn symbol_table_matches_declared_donor_symbols() {
        assert!(NTDLL_SYMBOLS.iter().any(|&(n, _)| n == "RtlAllocateHeap"));
        assert!(KERNEL32_SYMBOLS.iter().any(|&(n, _)| n == "GetProcAddress"));
        assert!(!NTDLL_SYMBOLS.iter().any(|&(n, _)| n == "GetProcAddress"));
    }
}
