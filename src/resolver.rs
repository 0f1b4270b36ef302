//! Import Resolver (component E): recursively loads a module's
//! transitive dependencies, then walks its IAT filling in resolved
//! addresses. Redirected donor symbols are substituted before a
//! dependency's own export table is even consulted; forwarder chains
//! are followed up to a bounded depth; writes go through a temporary
//! `PAGE_READWRITE` window since the IAT is typically read-only by the
//! time this runs.

use crate::error::{LoaderError, Result};
use crate::loader::PrivateLoader;
use crate::pe::exports::{self, Resolved};
use crate::pe::headers::PeView;
use crate::pe::imports::{self, ThunkEntry};
use crate::registry::ModuleId;

const MAX_FORWARDER_CHAIN: usize = 16;

/// Resolves every import of `importer`'s module. On success, returns
/// every dependency module this call loaded or ref-bumped (including
/// ones discovered only while following a forwarder chain) so the
/// caller can release them later if a step after import resolution
/// still fails. On the first unresolvable import, undoes those same
/// ref bumps itself before returning the error — the registry and area
/// index are left exactly as they were before this call started.
pub fn resolve_imports(loader: &PrivateLoader, importer: ModuleId, view: &PeView) -> Result<Vec<ModuleId>> {
    let mut touched = Vec::new();
    match resolve_imports_inner(loader, importer, view, &mut touched) {
        Ok(()) => Ok(touched),
        Err(e) => {
            unload_imports(loader, &touched);
            Err(e)
        }
    }
}

/// Releases every dependency ref a (possibly partial)
/// [`resolve_imports`] walk bumped, in reverse acquisition order. The
/// symmetric counterpart to the loads/bumps `resolve_dependency`
/// performs — matches `PrivateLoader::unload`'s own teardown path, so a
/// dependency that was freshly loaded for this call drops all the way
/// out, while one that already existed just loses the extra bump.
pub fn unload_imports(loader: &PrivateLoader, touched: &[ModuleId]) {
    for &id in touched.iter().rev() {
        if let Some(base) = loader.module_base(id) {
            loader.unload(base as *mut u8);
        }
    }
}

fn resolve_imports_inner(
    loader: &PrivateLoader,
    importer: ModuleId,
    view: &PeView,
    touched: &mut Vec<ModuleId>,
) -> Result<()> {
    for desc in imports::descriptors(view)? {
        let dep_id = loader.resolve_dependency(desc.dll_name, importer)?;
        touched.push(dep_id);
        let dep_base = loader
            .module_base(dep_id)
            .ok_or_else(|| LoaderError::DependencyNotFound(desc.dll_name.to_string()))?;
        let dep_size = loader.module_size(dep_id).unwrap_or(0);
        let dep_view = unsafe { PeView::new(dep_base as *const u8, dep_size) }
            .map_err(|_| LoaderError::MalformedImage("dependency re-validation failed"))?;

        for (entry, iat_slot) in imports::thunks(view, &desc)? {
            let name = match entry {
                ThunkEntry::Name { name, .. } => name,
                ThunkEntry::Ordinal(_) => {
                    return Err(LoaderError::UnsupportedFeature("ordinal-only imports"))
                }
            };

            let resolved = resolve_one(loader, importer, desc.dll_name, &dep_view, name, 0, touched)?;
            write_iat_slot(iat_slot, resolved)?;
        }
    }

    Ok(())
}

/// Resolves one imported symbol: first the redirection shim, then the
/// target module's export table, following forwarders recursively.
#[allow(clippy::too_many_arguments)]
fn resolve_one(
    loader: &PrivateLoader,
    importer: ModuleId,
    donor: &str,
    dep_view: &PeView,
    name: &str,
    depth: usize,
    touched: &mut Vec<ModuleId>,
) -> Result<u64> {
    if depth >= MAX_FORWARDER_CHAIN {
        return Err(LoaderError::UnsupportedFeature("forwarder chain too long"));
    }

    if let Some(addr) = crate::redirect::substitute_for(donor, name) {
        return Ok(addr as u64);
    }

    match exports::find_by_name(dep_view, name)? {
        Some(Resolved::Address(addr)) => Ok(addr),
        Some(Resolved::Forwarder(target)) => {
            let (fwd_dll, fwd_symbol) = imports::parse_forwarder(&target)
                .ok_or(LoaderError::MalformedImage("malformed forwarder string"))?;

            if let Some(addr) = crate::redirect::substitute_for(&fwd_dll, fwd_symbol) {
                return Ok(addr as u64);
            }

            let fwd_id = loader.resolve_dependency(&fwd_dll, importer)?;
            touched.push(fwd_id);
            let fwd_base = loader
                .module_base(fwd_id)
                .ok_or_else(|| LoaderError::DependencyNotFound(fwd_dll.clone()))?;
            let fwd_size = loader.module_size(fwd_id).unwrap_or(0);
            let fwd_view = unsafe { PeView::new(fwd_base as *const u8, fwd_size) }
                .map_err(|_| LoaderError::MalformedImage("forwarder target re-validation failed"))?;
            resolve_one(loader, importer, &fwd_dll, &fwd_view, fwd_symbol, depth + 1, touched)
        }
        None => Err(LoaderError::DependencyNotFound(format!("{donor}!{name}"))),
    }
}

fn write_iat_slot(slot: *mut u64, value: u64) -> Result<()> {
    let len = std::mem::size_of::<u64>();
    let old = crate::mapper::virtual_protect(slot as *mut u8, len, page_readwrite())?;
    unsafe {
        *slot = value;
    }
    crate::mapper::virtual_protect(slot as *mut u8, len, old)?;
    Ok(())
}

#[cfg(windows)]
fn page_readwrite() -> u32 {
    winapi::um::winnt::PAGE_READWRITE
}

#[cfg(not(windows))]
fn page_readwrite() -> u32 {
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forwarder_depth_guard_rejects_runaway_chains() {
        // A chain that never bottoms out must fail deterministically
        // rather than recurse forever; we can't build a live dependency
        // graph here, so this just pins the constant's presence and
        // value sanity.
        assert!(MAX_FORWARDER_CHAIN > 0);
        assert!(MAX_FORWARDER_CHAIN < 1024);
    }
}
