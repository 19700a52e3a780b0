//! Bidirectional inode ↔ path table for the kernel adapter.
//!
//! The cache, transfer engine, and directory pipeline in `s3fs-core` never
//! see an inode number — they work on logical paths. This table is the only
//! place the two namespaces meet: it hands the kernel `u64` inodes for
//! `lookup`/`readdir` replies and tracks `nlookup` so an inode is only
//! dropped once the kernel has truly forgotten it.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

/// FUSE reserves 1 for the mount root.
pub const FUSE_ROOT_ID: u64 = 1;

struct InodeEntry {
    path: String,
    nlookup: AtomicU64,
}

pub struct InodeTable {
    by_inode: DashMap<u64, InodeEntry>,
    by_path: DashMap<String, u64>,
    next: AtomicU64,
}

impl InodeTable {
    pub fn new() -> Self {
        let by_inode = DashMap::new();
        by_inode.insert(
            FUSE_ROOT_ID,
            InodeEntry {
                path: String::new(),
                nlookup: AtomicU64::new(1),
            },
        );
        let by_path = DashMap::new();
        by_path.insert(String::new(), FUSE_ROOT_ID);
        Self {
            by_inode,
            by_path,
            next: AtomicU64::new(FUSE_ROOT_ID + 1),
        }
    }

    pub fn path_of(&self, inode: u64) -> Option<String> {
        self.by_inode.get(&inode).map(|e| e.path.clone())
    }

    pub fn inode_of(&self, path: &str) -> Option<u64> {
        self.by_path.get(path).map(|r| *r)
    }

    /// Allocates (or reuses) the inode for `path`, incrementing `nlookup`.
    /// Every `lookup`, `create`, `mkdir`, and `symlink` reply goes through
    /// this — per the FUSE spec, those are the only calls that count toward
    /// the kernel's reference on the inode.
    pub fn get_or_insert(&self, path: &str) -> u64 {
        if let Some(inode) = self.by_path.get(path) {
            let inode = *inode;
            if let Some(entry) = self.by_inode.get(&inode) {
                entry.nlookup.fetch_add(1, Ordering::Relaxed);
            }
            return inode;
        }
        self.insert_new(path, 1)
    }

    /// Same allocation, but `nlookup` starts at zero — used for `readdir`
    /// entries, which per spec must not bump the lookup count on their own.
    pub fn get_or_insert_no_lookup(&self, path: &str) -> u64 {
        if let Some(inode) = self.by_path.get(path) {
            return *inode;
        }
        self.insert_new(path, 0)
    }

    fn insert_new(&self, path: &str, nlookup: u64) -> u64 {
        let inode = self.next.fetch_add(1, Ordering::Relaxed);
        self.by_inode.insert(
            inode,
            InodeEntry {
                path: path.to_string(),
                nlookup: AtomicU64::new(nlookup),
            },
        );
        self.by_path.insert(path.to_string(), inode);
        inode
    }

    /// Decrements `nlookup` by `n`; evicts the inode once it reaches zero.
    /// The root inode is never evicted.
    pub fn forget(&self, inode: u64, n: u64) {
        if inode == FUSE_ROOT_ID {
            return;
        }
        let should_evict = match self.by_inode.get(&inode) {
            Some(entry) => {
                let previous = entry.nlookup.load(Ordering::Relaxed);
                let remaining = previous.saturating_sub(n);
                entry.nlookup.store(remaining, Ordering::Relaxed);
                remaining == 0
            }
            None => false,
        };
        if should_evict {
            if let Some((_, entry)) = self.by_inode.remove(&inode) {
                self.by_path.remove(&entry.path);
            }
        }
    }

    /// Removes the path→inode mapping without evicting the inode entry
    /// itself — the kernel may still hold cached dentries pointing at it,
    /// and only `forget` is a reliable eviction signal.
    pub fn invalidate_path(&self, path: &str) {
        self.by_path.remove(path);
    }

    pub fn update_path(&self, inode: u64, old_path: &str, new_path: String) {
        self.by_path.remove(old_path);
        self.by_path.insert(new_path.clone(), inode);
        if let Some(mut entry) = self.by_inode.get_mut(&inode) {
            entry.path = new_path;
        }
    }

    pub fn len(&self) -> usize {
        self.by_inode.len()
    }
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_inode_preexists_with_empty_path() {
        let table = InodeTable::new();
        assert_eq!(table.path_of(FUSE_ROOT_ID), Some(String::new()));
    }

    #[test]
    fn repeated_lookup_reuses_inode_and_bumps_count() {
        let table = InodeTable::new();
        let a = table.get_or_insert("a.txt");
        let b = table.get_or_insert("a.txt");
        assert_eq!(a, b);
    }

    #[test]
    fn forget_evicts_at_zero_but_never_evicts_root() {
        let table = InodeTable::new();
        let inode = table.get_or_insert("a.txt");
        table.forget(inode, 1);
        assert_eq!(table.path_of(inode), None);

        table.forget(FUSE_ROOT_ID, 1);
        assert_eq!(table.path_of(FUSE_ROOT_ID), Some(String::new()));
    }

    #[test]
    fn no_lookup_variant_does_not_pin_the_inode() {
        let table = InodeTable::new();
        let inode = table.get_or_insert_no_lookup("dir/child");
        // A single forget(1) must be enough to evict, since nlookup started at 0.
        table.forget(inode, 1);
        assert_eq!(table.inode_of("dir/child"), None);
    }

    #[test]
    fn update_path_moves_the_mapping() {
        let table = InodeTable::new();
        let inode = table.get_or_insert("old");
        table.update_path(inode, "old", "new".to_string());
        assert_eq!(table.inode_of("old"), None);
        assert_eq!(table.inode_of("new"), Some(inode));
    }
}
