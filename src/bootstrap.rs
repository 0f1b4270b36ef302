//! Fixed-capacity bootstrap table and search-path table, plus the
//! allocator-readiness flag that gates which mapping backend
//! [`crate::mapper::map_and_relocate`] picks for a given load.
//!
//! [`PRE_INIT`] is the process-wide holding area an embedding runtime
//! pushes its own bootstrap-phase libraries into (mapped with the raw
//! backend, before [`crate::loader::init`] exists to register them
//! properly) — see [`push_pre_init`]. `init()` drains it and finalizes
//! each entry into the real registry.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use crate::error::{LoaderError, Result};

pub const BOOTSTRAP_CAPACITY: usize = 16;

/// A provisional module record, predating full registry bookkeeping.
#[derive(Clone)]
pub struct BootstrapEntry {
    pub base: usize,
    pub size: usize,
    pub name: String,
}

/// Fixed-capacity holding area for [`BootstrapEntry`] records, reserved
/// for modules an embedding runtime needs to account for before it has
/// wired up its own tracked-module bookkeeping.
#[derive(Default)]
pub struct BootstrapTable {
    entries: Vec<BootstrapEntry>,
}

impl BootstrapTable {
    pub fn new() -> Self {
        Self { entries: Vec::new() }
    }

    pub fn push(&mut self, entry: BootstrapEntry) -> Result<()> {
        if self.entries.len() >= BOOTSTRAP_CAPACITY {
            return Err(LoaderError::ResourceExhaustion("bootstrap module table full"));
        }
        self.entries.push(entry);
        Ok(())
    }

    /// Drains all entries. No pointer into this table survives the
    /// call — entries are moved out, not borrowed.
    pub fn drain(&mut self) -> Vec<BootstrapEntry> {
        std::mem::take(&mut self.entries)
    }
}

static PRE_INIT: Mutex<BootstrapTable> = Mutex::new(BootstrapTable { entries: Vec::new() });

/// Records a module mapped during bootstrap (before [`crate::loader::init`]
/// has run) so `init()` can migrate it into the registry and finalize it.
pub fn push_pre_init(entry: BootstrapEntry) -> Result<()> {
    PRE_INIT.lock().push(entry)
}

/// Drains every bootstrap-phase module recorded via [`push_pre_init`].
/// Called once by `init()`.
pub fn drain_pre_init() -> Vec<BootstrapEntry> {
    PRE_INIT.lock().drain()
}

/// Fixed-capacity table of client-library directories, derived from the
/// filenames of libraries loaded during bootstrap; used later to
/// resolve their transitive dependencies.
#[derive(Default)]
pub struct SearchPathTable {
    dirs: Vec<PathBuf>,
}

impl SearchPathTable {
    pub fn new() -> Self {
        Self { dirs: Vec::new() }
    }

    pub fn push(&mut self, dir: PathBuf) -> Result<()> {
        if self.dirs.len() >= BOOTSTRAP_CAPACITY {
            return Err(LoaderError::ResourceExhaustion("search path table full"));
        }
        if !self.dirs.contains(&dir) {
            self.dirs.push(dir);
        }
        Ok(())
    }

    pub fn as_slice(&self) -> &[PathBuf] {
        &self.dirs
    }
}

static ALLOCATOR_READY: AtomicBool = AtomicBool::new(false);

/// Whether the runtime's own allocator is live yet. Gates the choice of
/// mapping backend in `mapper.rs` and the bootstrap-vs-registry choice
/// for new module inserts.
pub fn allocator_ready() -> bool {
    ALLOCATOR_READY.load(Ordering::Acquire)
}

/// Marks the allocator as live. Idempotent; called once from
/// `PrivateLoader::init`'s migration step.
pub fn mark_allocator_ready() {
    ALLOCATOR_READY.store(true, Ordering::Release);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bootstrap_table_rejects_past_capacity() {
        let mut table = BootstrapTable::new();
        for i in 0..BOOTSTRAP_CAPACITY {
            table
                .push(BootstrapEntry {
                    base: i,
                    size: 0x1000,
                    name: format!("m{i}.dll"),
                })
                .unwrap();
        }
        let err = table
            .push(BootstrapEntry {
                base: 0xffff,
                size: 0x1000,
                name: "overflow.dll".into(),
            })
            .unwrap_err();
        assert!(matches!(err, LoaderError::ResourceExhaustion(_)));
    }

    #[test]
    fn drain_empties_the_table() {
        let mut table = BootstrapTable::new();
        table
            .push(BootstrapEntry {
                base: 1,
                size: 1,
                name: "a.dll".into(),
            })
            .unwrap();
        assert_eq!(table.drain().len(), 1);
        assert_eq!(table.drain().len(), 0);
    }

    #[test]
    fn search_path_table_dedupes() {
        let mut table = SearchPathTable::new();
        table.push(PathBuf::from("C:\\libs")).unwrap();
        table.push(PathBuf::from("C:\\libs")).unwrap();
        assert_eq!(table.as_slice().len(), 1);
    }
}
