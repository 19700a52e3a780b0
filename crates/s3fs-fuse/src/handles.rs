//! Open file handle table: maps the `u64` handle FUSE hands back on every
//! `read`/`write`/`flush`/`release` to the [`s3fs_core::OpenFile`] it was
//! issued for. Auto-incrementing starting at 1 — 0 is reserved as invalid,
//! matching the handle-table convention §4.6 shares with the inode table.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use dashmap::mapref::one::Ref;
use s3fs_core::OpenFile;

pub struct HandleTable {
    entries: DashMap<u64, OpenFile>,
    next: AtomicU64,
}

impl HandleTable {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            next: AtomicU64::new(1),
        }
    }

    pub fn insert(&self, open: OpenFile) -> u64 {
        let fh = self.next.fetch_add(1, Ordering::Relaxed);
        self.entries.insert(fh, open);
        fh
    }

    pub fn get(&self, fh: u64) -> Option<Ref<'_, u64, OpenFile>> {
        self.entries.get(&fh)
    }

    pub fn remove(&self, fh: u64) -> Option<OpenFile> {
        self.entries.remove(&fh).map(|(_, open)| open)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}
