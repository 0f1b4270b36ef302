//! Base relocation directory: walks `IMAGE_BASE_RELOCATION` blocks and
//! applies each entry as a signed delta between the actual and
//! preferred load addresses.

use crate::error::{LoaderError, Result};
use crate::pe::headers::{PeView, IMAGE_DIRECTORY_ENTRY_BASERELOC};

pub const IMAGE_REL_BASED_ABSOLUTE: u16 = 0;
pub const IMAGE_REL_BASED_HIGHLOW: u16 = 3;
pub const IMAGE_REL_BASED_DIR64: u16 = 10;

#[repr(C)]
struct ImageBaseRelocation {
    virtual_address: u32,
    size_of_block: u32,
}

/// Applies base relocations so a module mapped at `actual_base` behaves
/// as if it had been linked there. `preferred_base` comes from the
/// optional header. No-op if `actual_base == preferred_base`.
///
/// # Safety
/// `view` must describe a writable mapping (section protections not yet
/// finalized) at `actual_base`.
pub unsafe fn apply(view: &PeView, actual_base: u64, preferred_base: u64) -> Result<()> {
    if actual_base == preferred_base {
        return Ok(());
    }

    let dir = match view
        .data_directory(IMAGE_DIRECTORY_ENTRY_BASERELOC)
        .map_err(|_| LoaderError::MalformedImage("base relocation directory out of bounds"))?
    {
        Some(dir) => dir,
        None => return Err(LoaderError::NotRelocatable),
    };

    let delta = actual_base as i64 - preferred_base as i64;
    let reloc_base = view
        .rva(dir.virtual_address, 0)
        .map_err(|_| LoaderError::MalformedImage("base relocation directory out of bounds"))?;

    let mut offset = 0u32;
    while offset < dir.size {
        if offset as u64 + std::mem::size_of::<ImageBaseRelocation>() as u64 > dir.size as u64 {
            return Err(LoaderError::MalformedImage("truncated relocation block"));
        }
        let block = &*(reloc_base.add(offset as usize) as *const ImageBaseRelocation);
        if block.virtual_address == 0 && block.size_of_block == 0 {
            break;
        }
        if block.size_of_block < std::mem::size_of::<ImageBaseRelocation>() as u32 {
            return Err(LoaderError::RelocationFailed);
        }

        let entry_count =
            (block.size_of_block as usize - std::mem::size_of::<ImageBaseRelocation>()) / 2;
        let entries = (reloc_base.add(offset as usize)
            as *const u8)
            .add(std::mem::size_of::<ImageBaseRelocation>()) as *const u16;

        for i in 0..entry_count {
            let entry = *entries.add(i);
            let kind = entry >> 12;
            let rel_offset = (entry & 0x0FFF) as u32;
            let target_rva = block.virtual_address + rel_offset;
            let target = view
                .rva(target_rva, 8)
                .map_err(|_| LoaderError::RelocationFailed)? as *mut u8;

            match kind {
                IMAGE_REL_BASED_ABSOLUTE => {}
                IMAGE_REL_BASED_DIR64 => {
                    let p = target as *mut u64;
                    *p = (*p as i64 + delta) as u64;
                }
                IMAGE_REL_BASED_HIGHLOW => {
                    let p = target as *mut u32;
                    *p = (*p as i64 + delta) as u32;
                }
                other => {
                    log::warn!("unsupported base relocation type {other}");
                    return Err(LoaderError::UnsupportedFeature("relocation type"));
                }
            }
        }

        offset += block.size_of_block;
    }

    Ok(())
}
