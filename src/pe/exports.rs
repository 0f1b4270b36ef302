//! Export directory lookup, including forwarder detection: a linear
//! scan over the name table (no binary search — export tables here are
//! small enough that it isn't worth the ordering assumption), with a
//! forwarder range check against the export directory's own span.

use crate::error::{LoaderError, Result};
use crate::pe::headers::{read_c_str, PeView, IMAGE_DIRECTORY_ENTRY_EXPORT};

#[repr(C)]
struct ImageExportDirectory {
    _characteristics: u32,
    _time_date_stamp: u32,
    _major_version: u16,
    _minor_version: u16,
    _name: u32,
    base: u32,
    number_of_functions: u32,
    number_of_names: u32,
    address_of_functions: u32,
    address_of_names: u32,
    address_of_name_ordinals: u32,
}

/// The outcome of resolving one exported name.
pub enum Resolved {
    /// A real code address, already adjusted to the module's actual
    /// load address.
    Address(u64),
    /// The export is a forwarder string `TargetDll.TargetSymbol`.
    Forwarder(String),
}

/// Looks up `name` in `view`'s export table. Returns `Ok(None)` if the
/// module has no export directory or the name is absent — both benign,
/// distinguished from a malformed directory which is an error.
pub fn find_by_name(view: &PeView, name: &str) -> Result<Option<Resolved>> {
    let dir = match view
        .data_directory(IMAGE_DIRECTORY_ENTRY_EXPORT)
        .map_err(|_| LoaderError::MalformedImage("export directory out of bounds"))?
    {
        Some(dir) => dir,
        None => return Ok(None),
    };

    let exports = unsafe {
        let ptr = view
            .rva(dir.virtual_address, std::mem::size_of::<ImageExportDirectory>())
            .map_err(|_| LoaderError::MalformedImage("export directory out of bounds"))?;
        &*(ptr as *const ImageExportDirectory)
    };

    let names = view
        .rva(exports.address_of_names, exports.number_of_names as usize * 4)
        .map_err(|_| LoaderError::MalformedImage("export name table out of bounds"))?
        as *const u32;
    let ordinals = view
        .rva(
            exports.address_of_name_ordinals,
            exports.number_of_names as usize * 2,
        )
        .map_err(|_| LoaderError::MalformedImage("export ordinal table out of bounds"))?
        as *const u16;
    let functions = view
        .rva(
            exports.address_of_functions,
            exports.number_of_functions as usize * 4,
        )
        .map_err(|_| LoaderError::MalformedImage("export function table out of bounds"))?
        as *const u32;

    for i in 0..exports.number_of_names as usize {
        let name_rva = unsafe { *names.add(i) };
        let name_ptr = view
            .rva(name_rva, 1)
            .map_err(|_| LoaderError::MalformedImage("export name out of bounds"))?;
        let export_name = unsafe { read_c_str(name_ptr, 512) }
            .ok_or(LoaderError::MalformedImage("unterminated export name"))?;
        if export_name != name {
            continue;
        }

        let ordinal = unsafe { *ordinals.add(i) } as u32;
        if ordinal >= exports.number_of_functions {
            return Err(LoaderError::MalformedImage("export ordinal out of range"));
        }
        let function_rva = unsafe { *functions.add(ordinal as usize) };
        if function_rva == 0 {
            return Ok(None);
        }

        let export_start = dir.virtual_address;
        let export_end = export_start + dir.size;
        if function_rva >= export_start && function_rva < export_end {
            let fwd_ptr = view
                .rva(function_rva, 1)
                .map_err(|_| LoaderError::MalformedImage("forwarder string out of bounds"))?;
            let fwd = unsafe { read_c_str(fwd_ptr, 512) }
                .ok_or(LoaderError::MalformedImage("unterminated forwarder string"))?;
            return Ok(Some(Resolved::Forwarder(fwd.to_owned())));
        }

        let addr = view.base() as u64 + function_rva as u64;
        return Ok(Some(Resolved::Address(addr)));
    }

    Ok(None)
}
