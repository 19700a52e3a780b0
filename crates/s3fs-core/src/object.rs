//! The object model: a tagged sum over `{File, Directory, Symlink}` rather
//! than the virtual-inheritance hierarchy this is ported from — a common
//! `Stat` payload plus a `Kind` carrying the type-specific extras.

use std::collections::BTreeMap;
use std::fs::File as ScratchFile;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::SystemTime;

bitflags::bitflags! {
    /// Guarded by [`crate::file_state::FileState`]'s condvar, never read or
    /// written directly — see that module.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FileStatus: u8 {
        const DOWNLOADING = 0b0001;
        const UPLOADING   = 0b0010;
        const WRITING     = 0b0100;
        const DIRTY       = 0b1000;
    }
}

/// Attributes shared by every object, independent of its kind.
#[derive(Debug, Clone)]
pub struct Stat {
    pub path: String,
    pub etag: String,
    pub mtime: SystemTime,
    pub content_type: String,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub metadata: BTreeMap<String, String>,
}

impl Stat {
    /// URL-safe path suffix appended to the bucket URL. Directories and
    /// symlinks-as-markers never carry a trailing slash here; the directory
    /// placeholder convention adds one only at request-construction time.
    pub fn url_path(&self) -> &str {
        &self.path
    }
}

/// The per-kind extras a tagged-sum `Object` carries.
pub enum Kind {
    File(FileExtras),
    Directory(DirectoryExtras),
    Symlink { target: String },
}

/// Reserved user-metadata keys this crate writes/reads on file objects.
pub mod meta_keys {
    pub const MD5: &str = "s3fuse-md5";
    pub const MD5_ETAG: &str = "s3fuse-md5-etag";
    pub const KEY: &str = "s3fuse-key";
    pub const ENC_IV: &str = "s3fuse-enc-iv";
}

pub struct FileExtras {
    pub scratch: Option<ScratchFile>,
    pub ref_count: u32,
    status: AtomicU8,
    /// MD5 cached from the last successful flush/download, and the etag it
    /// was computed against — stale if the etag on `Stat` has since changed.
    pub cached_md5: Option<[u8; 16]>,
    pub md5_etag: Option<String>,
    /// Present only when client-side encryption is active for this file.
    pub encryption_key: Option<zeroize::Zeroizing<[u8; 32]>>,
}

impl FileExtras {
    pub fn new() -> Self {
        Self {
            scratch: None,
            ref_count: 0,
            status: AtomicU8::new(0),
            cached_md5: None,
            md5_etag: None,
            encryption_key: None,
        }
    }

    pub fn status(&self) -> FileStatus {
        FileStatus::from_bits_truncate(self.status.load(Ordering::SeqCst))
    }

    pub fn set_status(&self, status: FileStatus) {
        self.status.store(status.bits(), Ordering::SeqCst);
    }

    pub fn insert_status(&self, flag: FileStatus) {
        self.status.fetch_or(flag.bits(), Ordering::SeqCst);
    }

    pub fn remove_status(&self, flag: FileStatus) {
        self.status.fetch_and(!flag.bits(), Ordering::SeqCst);
    }
}

impl Default for FileExtras {
    fn default() -> Self {
        Self::new()
    }
}

pub struct DirectoryExtras {
    /// Populated only when `cache_directories` is enabled and a recent
    /// `readdir` already paid for a full listing.
    pub cached_children: Option<Vec<String>>,
}

impl DirectoryExtras {
    pub fn new() -> Self {
        Self {
            cached_children: None,
        }
    }
}

impl Default for DirectoryExtras {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Object {
    pub stat: Stat,
    pub kind: Kind,
    /// Negative-cache sentinel: `stat.size == 0` and this is `true` means
    /// "looked up, does not exist" rather than "an empty file".
    pub not_found: bool,
}

impl Object {
    pub fn not_found(path: String) -> Self {
        Self {
            stat: Stat {
                path,
                etag: String::new(),
                mtime: SystemTime::UNIX_EPOCH,
                content_type: String::new(),
                mode: 0,
                uid: 0,
                gid: 0,
                size: 0,
                metadata: BTreeMap::new(),
            },
            kind: Kind::File(FileExtras::new()),
            not_found: true,
        }
    }

    pub fn is_directory(&self) -> bool {
        matches!(self.kind, Kind::Directory(_))
    }

    pub fn is_file(&self) -> bool {
        matches!(self.kind, Kind::File(_))
    }

    pub fn as_file(&self) -> Option<&FileExtras> {
        match &self.kind {
            Kind::File(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_file_mut(&mut self) -> Option<&mut FileExtras> {
        match &mut self.kind {
            Kind::File(f) => Some(f),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_sentinel_has_zero_size() {
        let obj = Object::not_found("missing".to_string());
        assert!(obj.not_found);
        assert_eq!(obj.stat.size, 0);
    }

    #[test]
    fn file_status_bitset_tracks_flags_independently() {
        let file = FileExtras::new();
        file.insert_status(FileStatus::DOWNLOADING);
        file.insert_status(FileStatus::DIRTY);
        assert!(file.status().contains(FileStatus::DOWNLOADING));
        assert!(file.status().contains(FileStatus::DIRTY));
        assert!(!file.status().contains(FileStatus::UPLOADING));

        file.remove_status(FileStatus::DOWNLOADING);
        assert!(!file.status().contains(FileStatus::DOWNLOADING));
        assert!(file.status().contains(FileStatus::DIRTY));
    }
}
