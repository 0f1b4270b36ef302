//! Image Mapper (component A). Maps a PE file into memory and applies
//! base relocation if the load address differs from the preferred base.
//!
//! Two backends, selected by whether the runtime's own allocator is up
//! yet (`bootstrap::allocator_ready()`):
//! - [`map_raw`]/[`unmap_raw`]: a straight `VirtualAlloc`/`VirtualFree`
//!   mapping. Used pre-bootstrap so client libraries execute without
//!   appearing on the runtime's tracked-code-area list.
//! - [`map_via_section`]/[`unmap_section`]: `CreateFileW` +
//!   `CreateFileMappingW` + `MapViewOfFile`, an image-mode section
//!   mapping that keeps writes private to the view. Used once the
//!   runtime is up, so its mapping primitive can register the range.

use std::ffi::OsStr;
use std::os::windows::ffi::OsStrExt;
use std::path::Path;
use std::ptr;

use crate::error::{LoaderError, Result};
use crate::pe::headers::PeView;
use crate::pe::relocation;

/// Result of mapping and relocating one image.
pub struct MappedImage {
    pub base: *mut u8,
    pub size: usize,
}

fn to_wide(path: &Path) -> Vec<u16> {
    path.as_os_str()
        .encode_wide()
        .chain(std::iter::once(0))
        .collect()
}

fn image_span(file_bytes: &[u8]) -> Result<usize> {
    let view = unsafe { PeView::new(file_bytes.as_ptr(), file_bytes.len()) }
        .map_err(|_| LoaderError::MalformedImage("invalid PE headers"))?;
    Ok(view.optional_header().size_of_image as usize)
}

/// Reads the whole file into memory. Shared by both mapping backends:
/// section mapping still needs the raw bytes to validate headers before
/// committing to `CreateFileMappingW`, and the raw backend copies
/// section-by-section from this buffer.
fn read_file(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).map_err(LoaderError::FileNotFound)
}

/// `VirtualAlloc`-backed mapping: reserve+commit a region sized to the
/// image, copy headers, then copy each section's raw data (or
/// zero-fill for sections with no file backing).
pub fn map_raw(path: &Path) -> Result<(*mut u8, usize)> {
    let bytes = read_file(path)?;
    let view = unsafe { PeView::new(bytes.as_ptr(), bytes.len()) }
        .map_err(|_| LoaderError::MalformedImage("invalid PE headers"))?;
    let size = view.optional_header().size_of_image as usize;

    let base = win::virtual_alloc(size)?;
    unsafe {
        copy_image(&view, &bytes, base);
    }
    Ok((base, size))
}

/// # Safety
/// `base`/`size` must be exactly as returned by [`map_raw`].
pub unsafe fn unmap_raw(base: *mut u8, _size: usize) {
    win::virtual_free(base);
}

/// Section-mapped backend: maps the file itself as an image section so
/// the OS page cache backs the mapping, then relies on the same
/// relocation/protection pipeline as the raw backend.
pub fn map_via_section(path: &Path) -> Result<(*mut u8, usize)> {
    let bytes = read_file(path)?;
    let span = image_span(&bytes)?;
    let base = win::create_image_section(path, span)?;
    Ok((base, span))
}

/// # Safety
/// `base`/`size` must be exactly as returned by [`map_via_section`].
pub unsafe fn unmap_section(base: *mut u8, _size: usize) {
    win::unmap_view(base);
}

/// Copies headers and section data from the on-disk layout into the
/// already-allocated `base`.
///
/// # Safety
/// `base` must point to at least `view.optional_header().size_of_image`
/// writable bytes.
unsafe fn copy_image(view: &PeView, file_bytes: &[u8], base: *mut u8) {
    let headers_size = view.optional_header().size_of_headers as usize;
    ptr::copy_nonoverlapping(file_bytes.as_ptr(), base, headers_size.min(file_bytes.len()));

    for section in view.sections() {
        if section.virtual_address == 0 {
            continue;
        }
        let dst = base.add(section.virtual_address as usize);
        if section.size_of_raw_data == 0 {
            ptr::write_bytes(dst, 0, section.virtual_size as usize);
            continue;
        }
        let src_off = section.pointer_to_raw_data as usize;
        let copy_len = (section.size_of_raw_data as usize).min(section.virtual_size as usize);
        if src_off + copy_len <= file_bytes.len() {
            ptr::copy_nonoverlapping(file_bytes.as_ptr().add(src_off), dst, copy_len);
        }
        if section.virtual_size as usize > copy_len {
            ptr::write_bytes(dst.add(copy_len), 0, section.virtual_size as usize - copy_len);
        }
    }
}

/// Full load-time pipeline for one already-chosen backend: map through
/// `mapper`, then relocate if the actual base differs from the
/// preferred one, unwinding the mapping on failure.
pub fn map_and_relocate(path: &Path, mapper: &dyn crate::host::SectionMapper) -> Result<MappedImage> {
    let (base, size) = mapper.map(path)?;

    let result = (|| -> Result<()> {
        let view = unsafe { PeView::new(base, size) }
            .map_err(|_| LoaderError::MalformedImage("invalid PE headers after mapping"))?;
        let preferred = view.optional_header().image_base;
        unsafe { relocation::apply(&view, base as u64, preferred) }
    })();

    if let Err(e) = result {
        unsafe { mapper.unmap(base, size) };
        return Err(e);
    }

    Ok(MappedImage { base, size })
}

#[cfg(windows)]
mod win {
    use super::*;
    use winapi::shared::minwindef::DWORD;
    use winapi::um::errhandlingapi::GetLastError;
    use winapi::um::fileapi::{CreateFileW, OPEN_EXISTING};
    use winapi::um::handleapi::{CloseHandle, INVALID_HANDLE_VALUE};
    use winapi::um::memoryapi::{
        CreateFileMappingW, MapViewOfFile, UnmapViewOfFile, VirtualAlloc, VirtualFree,
    };
    use winapi::um::winnt::{
        FILE_SHARE_DELETE, FILE_SHARE_READ, FILE_SHARE_WRITE, GENERIC_READ, HANDLE,
        MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_EXECUTE_READWRITE, PAGE_READWRITE,
        SEC_IMAGE,
    };
    use winapi::um::winbase::{FILE_MAP_EXECUTE, FILE_MAP_READ};

    pub fn virtual_alloc(size: usize) -> Result<*mut u8> {
        let p = unsafe {
            VirtualAlloc(
                ptr::null_mut(),
                size,
                MEM_RESERVE | MEM_COMMIT,
                PAGE_EXECUTE_READWRITE,
            )
        };
        if p.is_null() {
            return Err(LoaderError::MalformedImage("VirtualAlloc failed"));
        }
        Ok(p as *mut u8)
    }

    pub fn virtual_free(base: *mut u8) {
        unsafe {
            VirtualFree(base as *mut _, 0, MEM_RELEASE);
        }
    }

    pub fn create_image_section(path: &Path, expected_size: usize) -> Result<*mut u8> {
        let wide = to_wide(path);
        unsafe {
            let file: HANDLE = CreateFileW(
                wide.as_ptr(),
                GENERIC_READ,
                FILE_SHARE_READ | FILE_SHARE_WRITE | FILE_SHARE_DELETE,
                ptr::null_mut(),
                OPEN_EXISTING,
                0,
                ptr::null_mut(),
            );
            if file == INVALID_HANDLE_VALUE {
                return Err(LoaderError::FileNotFound(std::io::Error::from_raw_os_error(
                    GetLastError() as i32,
                )));
            }

            let mapping = CreateFileMappingW(
                file,
                ptr::null_mut(),
                PAGE_READWRITE | SEC_IMAGE,
                0,
                0,
                ptr::null_mut(),
            );
            CloseHandle(file);
            if mapping.is_null() {
                return Err(LoaderError::MalformedImage("CreateFileMappingW failed"));
            }

            let view = MapViewOfFile(mapping, FILE_MAP_READ | FILE_MAP_EXECUTE, 0, 0, 0);
            CloseHandle(mapping);
            if view.is_null() {
                return Err(LoaderError::MalformedImage("MapViewOfFile failed"));
            }

            let _ = expected_size;
            Ok(view as *mut u8)
        }
    }

    pub fn unmap_view(base: *mut u8) {
        unsafe {
            UnmapViewOfFile(base as *mut _);
        }
    }

    pub fn virtual_protect(addr: *mut u8, size: usize, protect: DWORD) -> Result<DWORD> {
        let mut old = 0 as DWORD;
        let ok = unsafe { winapi::um::memoryapi::VirtualProtect(addr as *mut _, size, protect, &mut old) };
        if ok == 0 {
            return Err(LoaderError::MalformedImage("VirtualProtect failed"));
        }
        Ok(old)
    }
}

#[cfg(not(windows))]
mod win {
    use super::*;

    pub fn virtual_alloc(_size: usize) -> Result<*mut u8> {
        Err(LoaderError::MalformedImage("mapping only available on Windows"))
    }
    pub fn virtual_free(_base: *mut u8) {}
    pub fn create_image_section(_path: &Path, _expected_size: usize) -> Result<*mut u8> {
        Err(LoaderError::MalformedImage("mapping only available on Windows"))
    }
    pub fn unmap_view(_base: *mut u8) {}
    pub fn virtual_protect(_addr: *mut u8, _size: usize, _protect: u32) -> Result<u32> {
        Err(LoaderError::MalformedImage("mapping only available on Windows"))
    }
}

pub(crate) use win::virtual_protect;

/// Applies a section's characteristics as a page protection.
pub fn protect_sections(view: &PeView) -> Result<()> {
    use crate::pe::headers::{IMAGE_SCN_MEM_EXECUTE, IMAGE_SCN_MEM_READ, IMAGE_SCN_MEM_WRITE};
    use winapi::um::winnt::{
        PAGE_EXECUTE, PAGE_EXECUTE_READ, PAGE_EXECUTE_READWRITE, PAGE_EXECUTE_WRITECOPY,
        PAGE_NOACCESS, PAGE_READONLY, PAGE_READWRITE, PAGE_WRITECOPY,
    };

    for section in view.sections() {
        if section.virtual_address == 0 || section.size_of_raw_data == 0 {
            continue;
        }
        let addr = unsafe { (view.base() as *mut u8).add(section.virtual_address as usize) };
        let c = section.characteristics;
        let flags = match (
            c & IMAGE_SCN_MEM_EXECUTE != 0,
            c & IMAGE_SCN_MEM_READ != 0,
            c & IMAGE_SCN_MEM_WRITE != 0,
        ) {
            (false, false, false) => PAGE_NOACCESS,
            (false, false, true) => PAGE_WRITECOPY,
            (false, true, false) => PAGE_READONLY,
            (false, true, true) => PAGE_READWRITE,
            (true, false, false) => PAGE_EXECUTE,
            (true, false, true) => PAGE_EXECUTE_WRITECOPY,
            (true, true, false) => PAGE_EXECUTE_READ,
            (true, true, true) => PAGE_EXECUTE_READWRITE,
        };
        virtual_protect(addr, section.size_of_raw_data as usize, flags)?;
    }
    Ok(())
}
