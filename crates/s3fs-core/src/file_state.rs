//! The file state machine: open/read/write/truncate/flush/release, backed
//! by a real scratch file rather than an in-memory buffer, guarded by a
//! condition variable over the status bitset on [`crate::object::FileExtras`].

use std::fs::File;
use std::os::unix::fs::FileExt;
use std::sync::{Arc, Condvar, Mutex};

use s3fs_worker::Pool;
use tracing::instrument;

use crate::adapter::ServiceAdapter;
use crate::crypto;
use crate::error::FileStateError;
use crate::object::{meta_keys, FileStatus, Object};
use crate::stats::Stats;
use crate::transfer::{EncryptionContext, TransferEngine};

/// One open file: the scratch fd, the shared object (for stat/etag/status),
/// and the condvar waiters block on for state transitions.
pub struct OpenFile {
    pub object: Arc<Mutex<Object>>,
    pub scratch: Arc<File>,
    condvar: Condvar,
    guard: Mutex<()>,
}

impl OpenFile {
    fn wait_while(&self, predicate: impl Fn(FileStatus) -> bool) {
        let mut guard = self.guard.lock().unwrap();
        loop {
            let status = self
                .object
                .lock()
                .unwrap()
                .as_file()
                .map(|f| f.status())
                .unwrap_or_else(FileStatus::empty);
            if !predicate(status) {
                return;
            }
            guard = self.condvar.wait(guard).unwrap();
        }
    }

    fn notify_all(&self) {
        self.condvar.notify_all();
    }
}

/// Truncate the file to zero on open instead of downloading it — e.g. for
/// `O_TRUNC`.
pub const OPEN_TRUNCATE_TO_ZERO: u32 = 1;

pub struct FileStateMachine<'a> {
    pub pool: &'a Pool,
    pub adapter: &'a dyn ServiceAdapter,
    pub download_chunk_size: u64,
    pub upload_chunk_size: u64,
    pub transfer_retries: u32,
    pub scratch_dir: std::path::PathBuf,
    pub stats: &'a Stats,
    /// Master key used to unwrap a per-file key recovered from a reopened
    /// object's metadata; `None` when encryption is disabled entirely.
    pub volume_key: Option<crypto::Key>,
}

impl<'a> FileStateMachine<'a> {
    fn transfer_engine(&self) -> TransferEngine<'_> {
        TransferEngine {
            pool: self.pool,
            adapter: self.adapter,
            download_chunk_size: self.download_chunk_size,
            upload_chunk_size: self.upload_chunk_size,
            transfer_retries: self.transfer_retries,
            stats: self.stats,
        }
    }

    /// Opens `object`, downloading its current content into a fresh scratch
    /// file unless `flags` requests `OPEN_TRUNCATE_TO_ZERO`. Blocks the
    /// caller until the download (if any) completes.
    #[instrument(skip(self, object))]
    pub fn open(&self, object: Arc<Mutex<Object>>, flags: u32) -> Result<OpenFile, FileStateError> {
        // `tempfile_in` unlinks the backing file immediately after creating
        // it — the fd stays valid for the life of this `OpenFile`, but the
        // directory entry is gone, so scratch data never survives a crash
        // or restart.
        let scratch = Arc::new(tempfile::tempfile_in(&self.scratch_dir)?);

        let (url_path, size) = {
            let obj = object.lock().unwrap();
            (obj.stat.path.clone(), obj.stat.size)
        };

        if flags & OPEN_TRUNCATE_TO_ZERO != 0 {
            scratch.set_len(0)?;
            let mut obj = object.lock().unwrap();
            obj.stat.size = 0;
            if let Some(file) = obj.as_file_mut() {
                file.insert_status(FileStatus::DIRTY);
                file.ref_count += 1;
            }
        } else {
            scratch.set_len(size)?;
            {
                let obj = object.lock().unwrap();
                if let Some(file) = obj.as_file() {
                    file.insert_status(FileStatus::DOWNLOADING);
                }
            }

            let encryption = self.encryption_context(&object);
            let result = self.transfer_engine().download(&url_path, size, &scratch, encryption.as_ref());

            let mut obj = object.lock().unwrap();
            if let Some(file) = obj.as_file() {
                file.remove_status(FileStatus::DOWNLOADING);
                file.ref_count += 1;
            }
            result?;
        }

        Ok(OpenFile {
            object,
            scratch,
            condvar: Condvar::new(),
            guard: Mutex::new(()),
        })
    }

    /// Recovers the per-file key and IV, either from the in-memory cache
    /// left by a `create()` in this same process, or — for a file opened
    /// fresh, e.g. after a restart — by unwrapping the key stashed in the
    /// object's own metadata under the volume key. Returns `None` whenever
    /// encryption isn't in play for this file, in which case the transfer
    /// engine moves bytes unmodified.
    fn encryption_context(&self, object: &Arc<Mutex<Object>>) -> Option<EncryptionContext> {
        let obj = object.lock().unwrap();
        let file = obj.as_file()?;
        let iv = crypto::decode_iv(obj.stat.metadata.get(meta_keys::ENC_IV)?)?;

        if let Some(key) = file.encryption_key.clone() {
            return Some(EncryptionContext { key, iv });
        }

        let wrapped = crypto::decode_key(obj.stat.metadata.get(meta_keys::KEY)?)?;
        let volume_key = self.volume_key.as_ref()?;
        let key = crypto::unwrap_key(volume_key, &iv, &wrapped);
        Some(EncryptionContext { key, iv })
    }

    pub fn read(&self, open: &OpenFile, buf: &mut [u8], offset: u64) -> Result<usize, FileStateError> {
        open.wait_while(|status| status.contains(FileStatus::DOWNLOADING));
        Ok(open.scratch.read_at(buf, offset)?)
    }

    pub fn write(&self, open: &OpenFile, buf: &[u8], offset: u64) -> Result<usize, FileStateError> {
        {
            let obj = open.object.lock().unwrap();
            if let Some(file) = obj.as_file() {
                if file.status().contains(FileStatus::UPLOADING) {
                    return Err(FileStateError::UploadInProgress);
                }
                file.insert_status(FileStatus::WRITING | FileStatus::DIRTY);
            }
        }
        open.scratch.write_all_at(buf, offset)?;
        {
            let mut obj = open.object.lock().unwrap();
            obj.stat.size = obj.stat.size.max(offset + buf.len() as u64);
            if let Some(file) = obj.as_file() {
                file.remove_status(FileStatus::WRITING);
            }
        }
        Ok(buf.len())
    }

    pub fn truncate(&self, open: &OpenFile, size: u64) -> Result<(), FileStateError> {
        {
            let obj = open.object.lock().unwrap();
            if let Some(file) = obj.as_file() {
                if file.status().contains(FileStatus::UPLOADING) {
                    return Err(FileStateError::UploadInProgress);
                }
                file.insert_status(FileStatus::WRITING | FileStatus::DIRTY);
            }
        }
        open.scratch.set_len(size)?;
        {
            let mut obj = open.object.lock().unwrap();
            obj.stat.size = size;
            if let Some(file) = obj.as_file() {
                file.remove_status(FileStatus::WRITING);
            }
        }
        Ok(())
    }

    /// No-op if the file isn't dirty. Rejects with `UploadInProgress` if an
    /// upload or write is already pending; callers surface this as
    /// `-EBUSY`, never blocking the flusher behind another flush.
    #[instrument(skip(self, open))]
    pub fn flush(&self, open: &OpenFile) -> Result<(), FileStateError> {
        let (needs_flush, url_path, size, metadata) = {
            let obj = open.object.lock().unwrap();
            let Some(file) = obj.as_file() else {
                return Ok(());
            };
            let status = file.status();
            if status.contains(FileStatus::UPLOADING) || status.contains(FileStatus::WRITING) {
                return Err(FileStateError::UploadInProgress);
            }
            (
                status.contains(FileStatus::DIRTY),
                obj.stat.path.clone(),
                obj.stat.size,
                obj.stat.metadata.clone(),
            )
        };

        if !needs_flush {
            return Ok(());
        }

        {
            let obj = open.object.lock().unwrap();
            if let Some(file) = obj.as_file() {
                file.insert_status(FileStatus::UPLOADING);
            }
        }

        let encryption = self.encryption_context(&open.object);
        let result = self
            .transfer_engine()
            .upload(&url_path, size, &open.scratch, encryption.as_ref(), &metadata);

        let mut obj = open.object.lock().unwrap();
        if let Some(file) = obj.as_file() {
            file.remove_status(FileStatus::UPLOADING);
        }
        match result {
            Ok(etag) => {
                obj.stat.etag.clone_from(&etag);
                if let Some(file) = obj.as_file() {
                    file.remove_status(FileStatus::DIRTY);
                }
                drop(obj);
                open.notify_all();
                Ok(())
            }
            Err(e) => {
                drop(obj);
                open.notify_all();
                Err(e.into())
            }
        }
    }

    /// Decrements the ref-count; on the last release, flushes if dirty. The
    /// scratch file is dropped (and its storage reclaimed) regardless of
    /// flush outcome — open scratch data never survives past the last
    /// handle, matching the no-durable-local-cache contract.
    pub fn release(&self, open: OpenFile) -> Result<(), FileStateError> {
        let remaining = {
            let obj = open.object.lock().unwrap();
            obj.as_file().map_or(0, |file| {
                file.ref_count = file.ref_count.saturating_sub(1);
                file.ref_count
            })
        };

        if remaining == 0 {
            let dirty = open
                .object
                .lock()
                .unwrap()
                .as_file()
                .is_some_and(|f| f.status().contains(FileStatus::DIRTY));
            if dirty {
                self.flush(&open)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::S3Adapter;
    use crate::object::{FileExtras, Kind, Stat};
    use std::collections::BTreeMap;
    use std::time::SystemTime;

    fn test_object(path: &str, size: u64) -> Arc<Mutex<Object>> {
        Arc::new(Mutex::new(Object {
            stat: Stat {
                path: path.to_string(),
                etag: String::new(),
                mtime: SystemTime::now(),
                content_type: String::new(),
                mode: 0o644,
                uid: 0,
                gid: 0,
                size,
                metadata: BTreeMap::new(),
            },
            kind: Kind::File(FileExtras::new()),
            not_found: false,
        }))
    }

    fn test_pool() -> Pool {
        Pool::new(s3fs_worker::PoolConfig {
            workers_per_priority: 1,
            queue_capacity: 4,
            request_timeout_seconds: 5,
            watchdog_interval: std::time::Duration::from_millis(50),
            client_factory: Arc::new(|| {
                let signer = Arc::new(s3fs_worker::HmacSigner {
                    scheme: "AWS",
                    access_key: "AKID".to_string(),
                    secret_key: "secret".to_string(),
                    prefix: "x-amz-",
                });
                s3fs_worker::Request::new(
                    reqwest::blocking::Client::new(),
                    signer,
                    "https://example-bucket.s3.amazonaws.com".to_string(),
                )
            }),
        })
    }

    #[test]
    fn open_with_truncate_flag_sets_dirty_and_zero_size() {
        let pool = test_pool();
        let adapter = S3Adapter {
            bucket_name: "b".to_string(),
            access_key_id: "k".to_string(),
            secret_access_key: "s".to_string(),
            url_prefix: "https://example-bucket.s3.amazonaws.com".to_string(),
        };
        let machine = FileStateMachine {
            pool: &pool,
            adapter: &adapter,
            download_chunk_size: 1024,
            upload_chunk_size: 1024,
            transfer_retries: 1,
            scratch_dir: std::env::temp_dir(),
            stats: &Stats::default(),
            volume_key: None,
        };

        let object = test_object("a.txt", 100);
        let open = machine.open(object.clone(), OPEN_TRUNCATE_TO_ZERO).unwrap();
        assert_eq!(open.object.lock().unwrap().stat.size, 0);
        assert!(open
            .object
            .lock()
            .unwrap()
            .as_file()
            .unwrap()
            .status()
            .contains(FileStatus::DIRTY));
    }

    #[test]
    fn write_then_read_observes_the_write_before_flush() {
        let pool = test_pool();
        let adapter = S3Adapter {
            bucket_name: "b".to_string(),
            access_key_id: "k".to_string(),
            secret_access_key: "s".to_string(),
            url_prefix: "https://example-bucket.s3.amazonaws.com".to_string(),
        };
        let machine = FileStateMachine {
            pool: &pool,
            adapter: &adapter,
            download_chunk_size: 1024,
            upload_chunk_size: 1024,
            transfer_retries: 1,
            scratch_dir: std::env::temp_dir(),
            stats: &Stats::default(),
            volume_key: None,
        };

        let object = test_object("a.txt", 0);
        let open = machine.open(object, OPEN_TRUNCATE_TO_ZERO).unwrap();
        machine.write(&open, b"hello world", 0).unwrap();

        let mut buf = [0u8; 11];
        let n = machine.read(&open, &mut buf, 0).unwrap();
        assert_eq!(n, 11);
        assert_eq!(&buf, b"hello world");
    }

    #[test]
    fn write_extends_recorded_size_without_a_separate_truncate() {
        let pool = test_pool();
        let adapter = S3Adapter {
            bucket_name: "b".to_string(),
            access_key_id: "k".to_string(),
            secret_access_key: "s".to_string(),
            url_prefix: "https://example-bucket.s3.amazonaws.com".to_string(),
        };
        let machine = FileStateMachine {
            pool: &pool,
            adapter: &adapter,
            download_chunk_size: 1024,
            upload_chunk_size: 1024,
            transfer_retries: 1,
            scratch_dir: std::env::temp_dir(),
            stats: &Stats::default(),
            volume_key: None,
        };

        let object = test_object("a.txt", 0);
        let open = machine.open(object.clone(), OPEN_TRUNCATE_TO_ZERO).unwrap();
        assert_eq!(open.object.lock().unwrap().stat.size, 0);

        machine.write(&open, b"hello world", 0).unwrap();
        // No explicit truncate/setattr call — write() alone must carry the
        // new length forward so flush() doesn't ship a stale (too-small)
        // size to the upload.
        assert_eq!(open.object.lock().unwrap().stat.size, 11);

        machine.write(&open, b"!!!", 11).unwrap();
        assert_eq!(open.object.lock().unwrap().stat.size, 14);

        // A write fully inside the existing range must not shrink it back.
        machine.write(&open, b"H", 0).unwrap();
        assert_eq!(open.object.lock().unwrap().stat.size, 14);
    }

    #[test]
    fn encryption_context_unwraps_a_persisted_key_under_the_volume_key() {
        let pool = test_pool();
        let adapter = S3Adapter {
            bucket_name: "b".to_string(),
            access_key_id: "k".to_string(),
            secret_access_key: "s".to_string(),
            url_prefix: "https://example-bucket.s3.amazonaws.com".to_string(),
        };
        let volume_key = crypto::generate_key();
        let machine = FileStateMachine {
            pool: &pool,
            adapter: &adapter,
            download_chunk_size: 1024,
            upload_chunk_size: 1024,
            transfer_retries: 1,
            scratch_dir: std::env::temp_dir(),
            stats: &Stats::default(),
            volume_key: Some(volume_key.clone()),
        };

        let file_key = crypto::generate_key();
        let iv = crypto::generate_iv();
        let wrapped = crypto::wrap_key(&volume_key, &iv, &file_key);

        let object = test_object("a.txt", 0);
        object
            .lock()
            .unwrap()
            .stat
            .metadata
            .insert(meta_keys::KEY.to_string(), crypto::encode_key(&wrapped));
        object
            .lock()
            .unwrap()
            .stat
            .metadata
            .insert(meta_keys::ENC_IV.to_string(), crypto::encode_iv(&iv));

        let context = machine.encryption_context(&object).expect("encryption context");
        assert_eq!(*context.key, *file_key);
        assert_eq!(context.iv, iv);
    }

    #[test]
    fn encryption_context_is_none_without_encryption_metadata() {
        let pool = test_pool();
        let adapter = S3Adapter {
            bucket_name: "b".to_string(),
            access_key_id: "k".to_string(),
            secret_access_key: "s".to_string(),
            url_prefix: "https://example-bucket.s3.amazonaws.com".to_string(),
        };
        let machine = FileStateMachine {
            pool: &pool,
            adapter: &adapter,
            download_chunk_size: 1024,
            upload_chunk_size: 1024,
            transfer_retries: 1,
            scratch_dir: std::env::temp_dir(),
            stats: &Stats::default(),
            volume_key: None,
        };

        let object = test_object("a.txt", 0);
        assert!(machine.encryption_context(&object).is_none());
    }
}
