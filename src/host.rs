//! The two genuinely-external collaborators: the allocator backing
//! loader metadata, and the primitive used to map an image file into
//! memory.
//!
//! [`SectionMapper`] is wired into [`crate::loader::PrivateLoader`]
//! itself (it holds one instance per backend and picks between them per
//! load), so swapping in a fake mapper is enough to drive the loader
//! without a real mapped image. [`MetadataAllocator`] documents the
//! contract an embedding runtime's own tracked-allocation bookkeeping
//! would need to satisfy, but nothing in this crate currently routes
//! through it: [`crate::registry::ModuleRegistry`] deliberately uses
//! safe standard collections (see `DESIGN.md`, Open Questions), and
//! those don't expose a stable-Rust hook for a custom allocator.

use std::alloc::{self, Layout};
use std::path::Path;

use crate::error::{LoaderError, Result};

/// Backing store for loader metadata (module records, area-index nodes,
/// FLS callback entries). Out of scope per the design: the loader only
/// fixes the contract, not the implementation.
pub trait MetadataAllocator: Send + Sync {
    /// # Safety
    /// `layout` must have non-zero size.
    unsafe fn alloc(&self, layout: Layout) -> *mut u8;
    /// # Safety
    /// `ptr` must have been returned by a prior call to `alloc` on this
    /// allocator with the same `layout`.
    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout);
}

/// Default metadata allocator: the process's global Rust allocator.
/// Sufficient once the runtime's own allocator is live; the bootstrap
/// window (before that point) never calls into this trait, it only
/// touches the static bootstrap tables (see `bootstrap.rs`).
pub struct SystemMetadataAllocator;

impl MetadataAllocator for SystemMetadataAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        alloc::alloc(layout)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        alloc::dealloc(ptr, layout)
    }
}

/// The mapping primitive: puts a PE file's bytes into an executable
/// mapping and tears one down again. Two backends are selected by
/// whether the runtime's own allocator (and therefore its tracked-area
/// bookkeeping) is up yet — see `mapper.rs`.
pub trait SectionMapper: Send + Sync {
    /// Maps `path` as an image-mode mapping. Returns the base address
    /// and the mapping's span.
    fn map(&self, path: &Path) -> Result<(*mut u8, usize)>;
    /// Tears down a mapping previously returned by `map`.
    ///
    /// # Safety
    /// `base`/`size` must be exactly as returned by `map`.
    unsafe fn unmap(&self, base: *mut u8, size: usize);
}

/// Section-mapped backend: `CreateFileW` + `CreateFileMappingW` +
/// `MapViewOfFile`, requesting the view stay private to the caller
/// (writes never reach the file). This is the post-bootstrap backend;
/// the runtime is expected to register the mapped range in its own
/// tracked-code-area list as part of wiring this trait up.
pub struct WindowsSectionMapper;

impl SectionMapper for WindowsSectionMapper {
    fn map(&self, path: &Path) -> Result<(*mut u8, usize)> {
        crate::mapper::map_via_section(path)
    }

    unsafe fn unmap(&self, base: *mut u8, size: usize) {
        crate::mapper::unmap_section(base, size)
    }
}

/// Raw `VirtualAlloc`-backed mapper: used before the runtime's
/// allocator is live, so that client libraries execute without being on
/// the runtime's tracked-code-areas list.
pub struct RawSectionMapper;

impl SectionMapper for RawSectionMapper {
    fn map(&self, path: &Path) -> Result<(*mut u8, usize)> {
        crate::mapper::map_raw(path)
    }

    unsafe fn unmap(&self, base: *mut u8, size: usize) {
        crate::mapper::unmap_raw(base, size)
    }
}

/// Reads the system root (e.g. `C:\Windows`) from the registry, falling
/// back to the `SystemRoot` environment variable. Not expressed as a
/// trait like the two collaborators above: every process reads the
/// same key the same way, so there is nothing meaningful to inject.
pub fn read_system_root() -> Result<std::path::PathBuf> {
    match read_system_root_from_registry() {
        Ok(p) => Ok(p),
        Err(e) => {
            log::warn!("registry read for SystemRoot failed ({e}), falling back to environment");
            std::env::var_os("SystemRoot")
                .map(std::path::PathBuf::from)
                .ok_or_else(|| {
                    LoaderError::MalformedImage("SystemRoot not found in registry or environment")
                })
        }
    }
}

#[cfg(windows)]
fn read_system_root_from_registry() -> Result<std::path::PathBuf> {
    use std::os::windows::ffi::OsStringExt;
    use std::ptr;
    use winapi::shared::minwindef::{DWORD, HKEY};
    use winapi::um::winnt::{KEY_READ, REG_SZ};
    use winapi::um::winreg::{RegCloseKey, RegOpenKeyExW, RegQueryValueExW, HKEY_LOCAL_MACHINE};

    let subkey: Vec<u16> = "SYSTEM\\CurrentControlSet\\Control\\Windows\0"
        .encode_utf16()
        .collect();
    let value: Vec<u16> = "SystemRoot\0".encode_utf16().collect();

    unsafe {
        let mut hkey: HKEY = ptr::null_mut();
        let rc = RegOpenKeyExW(
            HKEY_LOCAL_MACHINE,
            subkey.as_ptr(),
            0,
            KEY_READ,
            &mut hkey,
        );
        if rc != 0 {
            return Err(LoaderError::MalformedImage("RegOpenKeyExW failed"));
        }

        let mut buf = [0u16; 260];
        let mut size: DWORD = (buf.len() * 2) as DWORD;
        let mut kind: DWORD = 0;
        let rc = RegQueryValueExW(
            hkey,
            value.as_ptr(),
            ptr::null_mut(),
            &mut kind,
            buf.as_mut_ptr() as *mut u8,
            &mut size,
        );
        RegCloseKey(hkey);
        if rc != 0 || kind != REG_SZ {
            return Err(LoaderError::MalformedImage("RegQueryValueExW failed"));
        }

        let len = (size as usize / 2).saturating_sub(1);
        let wide = &buf[..len];
        Ok(std::path::PathBuf::from(std::ffi::OsString::from_wide(wide)))
    }
}

#[cfg(not(windows))]
fn read_system_root_from_registry() -> Result<std::path::PathBuf> {
    Err(LoaderError::MalformedImage(
        "registry access is only available on Windows",
    ))
}
