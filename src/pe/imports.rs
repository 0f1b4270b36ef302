//! Import descriptor table: a lockstep walk of `OriginalFirstThunk`
//! and `FirstThunk`, with ordinal-only imports flagged for the caller
//! to reject.

use crate::error::{LoaderError, Result};
use crate::pe::headers::{read_c_str, PeView, IMAGE_DIRECTORY_ENTRY_IMPORT};

pub const IMAGE_ORDINAL_FLAG64: u64 = 0x8000_0000_0000_0000;

#[repr(C)]
struct RawImportDescriptor {
    original_first_thunk: u32,
    _time_date_stamp: u32,
    _forwarder_chain: u32,
    name: u32,
    first_thunk: u32,
}

/// One imported-module descriptor: its name and the RVAs of its two
/// thunk tables.
pub struct ImportDescriptor<'a> {
    pub dll_name: &'a str,
    pub original_first_thunk_rva: u32,
    pub first_thunk_rva: u32,
}

/// One resolved thunk entry: either a name to resolve, or (a declared
/// non-goal) an ordinal.
pub enum ThunkEntry<'a> {
    Name { hint: u16, name: &'a str },
    Ordinal(u16),
}

/// Iterates the import descriptor table of a mapped, already-validated
/// image. Returns `Ok(None)` (outer option implied via empty iterator)
/// when the module has no imports at all.
pub fn descriptors<'a>(view: &'a PeView) -> Result<Vec<ImportDescriptor<'a>>> {
    let dir = match view
        .data_directory(IMAGE_DIRECTORY_ENTRY_IMPORT)
        .map_err(|_| LoaderError::MalformedImage("import directory out of bounds"))?
    {
        Some(dir) => dir,
        None => return Ok(Vec::new()),
    };

    let mut out = Vec::new();
    let entry_size = std::mem::size_of::<RawImportDescriptor>();
    let mut offset = 0usize;
    loop {
        if offset as u64 + entry_size as u64 > dir.size as u64 {
            return Err(LoaderError::MalformedImage("truncated import descriptor table"));
        }
        let ptr = view
            .rva(dir.virtual_address + offset as u32, entry_size)
            .map_err(|_| LoaderError::MalformedImage("import descriptor out of bounds"))?;
        let desc = unsafe { &*(ptr as *const RawImportDescriptor) };
        if desc.name == 0 && desc.first_thunk == 0 && desc.original_first_thunk == 0 {
            break;
        }

        let name_ptr = view
            .rva(desc.name, 1)
            .map_err(|_| LoaderError::MalformedImage("import DLL name out of bounds"))?;
        let dll_name = unsafe { read_c_str(name_ptr, 260) }
            .ok_or(LoaderError::MalformedImage("unterminated import DLL name"))?;

        let lookup_rva = if desc.original_first_thunk != 0 {
            desc.original_first_thunk
        } else {
            desc.first_thunk
        };

        out.push(ImportDescriptor {
            dll_name,
            original_first_thunk_rva: lookup_rva,
            first_thunk_rva: desc.first_thunk,
        });

        offset += entry_size;
    }

    Ok(out)
}

/// Walks the lookup-table/IAT pair for one descriptor in lockstep,
/// yielding the resolved entry and the IAT slot's address for each.
pub fn thunks<'a>(
    view: &'a PeView,
    desc: &ImportDescriptor<'a>,
) -> Result<Vec<(ThunkEntry<'a>, *mut u64)>> {
    let mut out = Vec::new();
    let mut i = 0usize;
    loop {
        let lookup_ptr = view
            .rva(desc.original_first_thunk_rva + (i * 8) as u32, 8)
            .map_err(|_| LoaderError::MalformedImage("import lookup table out of bounds"))?
            as *const u64;
        let iat_ptr = view
            .rva(desc.first_thunk_rva + (i * 8) as u32, 8)
            .map_err(|_| LoaderError::MalformedImage("import address table out of bounds"))?
            as *mut u64;

        let raw = unsafe { *lookup_ptr };
        if raw == 0 {
            break;
        }

        if raw & IMAGE_ORDINAL_FLAG64 != 0 {
            let ordinal = (raw & 0xFFFF) as u16;
            out.push((ThunkEntry::Ordinal(ordinal), iat_ptr));
        } else {
            let hint_name_rva = (raw & 0x7FFF_FFFF) as u32;
            let hint_ptr = view
                .rva(hint_name_rva, 2)
                .map_err(|_| LoaderError::MalformedImage("import hint/name out of bounds"))?;
            let hint = unsafe { *(hint_ptr as *const u16) };
            let name_ptr = unsafe { hint_ptr.add(2) };
            let name = unsafe { read_c_str(name_ptr, 512) }
                .ok_or(LoaderError::MalformedImage("unterminated import name"))?;
            out.push((ThunkEntry::Name { hint, name }, iat_ptr));
        }

        i += 1;
    }

    Ok(out)
}

/// Splits a forwarder string `TargetDll.TargetSymbol` into its module
/// and symbol parts, appending `.dll` to the module portion as the
/// spec requires.
pub fn parse_forwarder(forwarder: &str) -> Option<(String, &str)> {
    let dot = forwarder.find('.')?;
    let (module, rest) = forwarder.split_at(dot);
    let symbol = &rest[1..];
    if module.is_empty() || symbol.is_empty() {
        return None;
    }
    Some((format!("{module}.dll"), symbol))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_forwarder() {
        let (dll, sym) = parse_forwarder("NTDLL.RtlAllocateHeap").unwrap();
        assert_eq!(dll, "NTDLL.dll");
        assert_eq!(sym, "RtlAllocateHeap");
    }

    #[test]
    fn rejects_forwarder_without_dot() {
        assert!(parse_forwarder("RtlAllocateHeap").is_none());
    }

    #[test]
    fn rejects_forwarder_with_empty_symbol() {
        assert!(parse_forwarder("NTDLL.").is_none());
    }
}
