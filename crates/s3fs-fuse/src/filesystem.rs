//! `fuser::Filesystem` impl: the only layer in this crate that knows about
//! inodes, file handles, or FUSE reply types. Every callback resolves an
//! inode to a path via [`InodeTable`], delegates to the cache / transfer
//! engine / directory pipeline in `s3fs-core`, and translates the result
//! back into the matching `fuser` reply — it holds no cache or
//! transfer-engine state of its own.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use fuser::{
    FileAttr, FileType, Filesystem, KernelConfig, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory, ReplyEmpty,
    ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, ReplyXattr, Request as FuseRequest, TimeOrNow,
};
use libc::c_int;
use s3fs_core::object::meta_keys;
use s3fs_core::{
    crypto, Cache, Config, DirectoryOps, FileStateMachine, Hint, Kind, Object, S3Adapter, Service, ServiceAdapter,
    Stats, ToErrno, GsAdapter, OPEN_TRUNCATE_TO_ZERO,
};
use s3fs_worker::{HmacSigner, Pool, PoolConfig, Request as WireRequest};
use tracing::instrument;

use crate::handles::HandleTable;
use crate::inode::{InodeTable, FUSE_ROOT_ID};

const ATTR_TTL: Duration = Duration::from_secs(1);

fn build_adapter(config: &Config) -> Box<dyn ServiceAdapter> {
    let url_prefix = config.url_prefix.clone().unwrap_or_else(|| match config.service {
        Service::Aws => "https://s3.amazonaws.com".to_string(),
        Service::Gs => "https://storage.googleapis.com".to_string(),
        Service::Fvs => "https://s3.amazonaws.com".to_string(),
    });

    match config.service {
        Service::Gs => Box::new(GsAdapter {
            bucket_name: config.bucket_name.clone(),
            access_key_id: config.access_key_id.clone(),
            secret_access_key: config.secret_access_key.clone(),
            url_prefix,
        }),
        Service::Aws | Service::Fvs => Box::new(S3Adapter {
            bucket_name: config.bucket_name.clone(),
            access_key_id: config.access_key_id.clone(),
            secret_access_key: config.secret_access_key.clone(),
            url_prefix,
        }),
    }
}

fn build_pool(adapter: &dyn ServiceAdapter, config: &Config) -> Pool {
    let signer = adapter.signer();
    let bucket_url = adapter.bucket_url();
    let header_prefix: &'static str = match config.service {
        Service::Gs => "x-goog-",
        Service::Aws | Service::Fvs => "x-amz-",
    };
    let scheme: &'static str = match config.service {
        Service::Gs => "GOOG1",
        Service::Aws | Service::Fvs => "AWS",
    };
    let access_key = config.access_key_id.clone();
    let secret_key = config.secret_access_key.clone();
    let _ = signer; // the HmacSigner is reconstructed per worker rather than shared, see client_factory below

    Pool::new(PoolConfig {
        workers_per_priority: 4,
        queue_capacity: 256,
        request_timeout_seconds: config.transfer_timeout_in_s,
        watchdog_interval: Duration::from_millis(250),
        client_factory: Arc::new(move || {
            let signer = Arc::new(HmacSigner {
                scheme,
                access_key: access_key.clone(),
                secret_key: secret_key.clone(),
                prefix: header_prefix,
            });
            WireRequest::new(reqwest::blocking::Client::new(), signer, bucket_url.clone())
        }),
    })
}

/// Owns the inode/handle tables and the four core subsystems; every FUSE
/// callback is a thin translation over them.
pub struct S3FileSystem {
    pool: Pool,
    adapter: Box<dyn ServiceAdapter>,
    cache: Cache,
    stats: Arc<Stats>,
    inodes: InodeTable,
    handles: HandleTable,
    config: Config,
    scratch_dir: PathBuf,
    /// Master key for wrapping/unwrapping per-file keys; `None` unless
    /// `use_encryption` is on and `volume_key_file` loaded successfully.
    volume_key: Option<crypto::Key>,
}

impl S3FileSystem {
    pub fn new(config: Config) -> Self {
        let adapter = build_adapter(&config);
        let pool = build_pool(adapter.as_ref(), &config);
        let stats = Arc::new(Stats::default());
        let cache = Cache::new(config.max_objects_in_cache, stats.clone());
        let scratch_dir = std::env::temp_dir();
        let volume_key = if config.use_encryption {
            config.volume_key_file.as_deref().and_then(|path| {
                crypto::load_volume_key(Path::new(path))
                    .inspect_err(|e| tracing::error!(error = %e, "failed to load volume key; encryption disabled"))
                    .ok()
            })
        } else {
            None
        };
        Self {
            pool,
            adapter,
            cache,
            stats,
            inodes: InodeTable::new(),
            handles: HandleTable::new(),
            config,
            scratch_dir,
            volume_key,
        }
    }

    /// Handle the `main` binary retrieves before the filesystem is moved
    /// into `fuser::spawn_mount2`, so a signal handler can still log a
    /// snapshot on request.
    pub fn stats_handle(&self) -> Arc<Stats> {
        self.stats.clone()
    }

    fn directory_ops(&self) -> DirectoryOps<'_> {
        DirectoryOps {
            pool: &self.pool,
            cache: &self.cache,
        }
    }

    fn file_state_machine(&self) -> FileStateMachine<'_> {
        FileStateMachine {
            pool: &self.pool,
            adapter: self.adapter.as_ref(),
            download_chunk_size: self.config.download_chunk_size,
            upload_chunk_size: self.config.upload_chunk_size,
            transfer_retries: self.config.transfer_retries,
            scratch_dir: self.scratch_dir.clone(),
            stats: self.stats.as_ref(),
            volume_key: self.volume_key.clone(),
        }
    }

    fn path_of(&self, inode: u64) -> Result<String, c_int> {
        self.inodes.path_of(inode).ok_or(libc::ENOENT)
    }

    fn child_path(parent_path: &str, name: &str) -> String {
        if parent_path.is_empty() {
            name.to_string()
        } else {
            format!("{parent_path}/{name}")
        }
    }

    fn lookup_object(&self, path: &str, hint: Hint) -> Result<Arc<Mutex<Object>>, c_int> {
        self.cache.fetch(&self.pool, self.adapter.as_ref(), path, hint)
    }

    /// Single-object copy-then-delete, for renaming a plain file. The
    /// paginated multi-key pipeline in `DirectoryOps::rename` assumes `from`
    /// is itself a directory placeholder key (`from/`) — a bare file has no
    /// such key, so it gets its own one-copy, one-delete path instead.
    fn rename_file(&self, from: &str, to: &str) -> Result<(), c_int> {
        let copy_source = from.to_string();
        let dest = to.to_string();
        let status = self.pool.call(
            s3fs_worker::Priority::Pr0,
            Box::new(move |req: &mut WireRequest| {
                req.init("PUT");
                req.set_url(&format!("/{dest}"), None);
                req.set_header("x-amz-copy-source", &format!("/{copy_source}"));
                match req.run(30) {
                    Ok(()) if req.response_code == 200 => 0,
                    _ => -libc::EIO,
                }
            }),
        );
        if status != 0 {
            return Err(status);
        }

        let delete_source = from.to_string();
        let status = self.pool.call(
            s3fs_worker::Priority::Pr0,
            Box::new(move |req: &mut WireRequest| {
                req.init("DELETE");
                req.set_url(&format!("/{delete_source}"), None);
                match req.run(30) {
                    Ok(()) if matches!(req.response_code, 200 | 204 | 404) => 0,
                    _ => -libc::EIO,
                }
            }),
        );
        if status != 0 {
            return Err(status);
        }
        Ok(())
    }

    fn attr_for(&self, inode: u64, object: &Object) -> FileAttr {
        let kind = match &object.kind {
            Kind::Directory(_) => FileType::Directory,
            Kind::Symlink { .. } => FileType::Symlink,
            Kind::File(_) => FileType::RegularFile,
        };
        let perm = if object.stat.mode != 0 {
            (object.stat.mode & 0o7777) as u16
        } else if kind == FileType::Directory {
            self.config.default_mode as u16
        } else {
            0o644
        };
        FileAttr {
            ino: inode,
            size: object.stat.size,
            blocks: object.stat.size.div_ceil(512),
            atime: object.stat.mtime,
            mtime: object.stat.mtime,
            ctime: object.stat.mtime,
            crtime: object.stat.mtime,
            kind,
            perm,
            nlink: if kind == FileType::Directory { 2 } else { 1 },
            uid: if object.stat.uid != 0 { object.stat.uid } else { self.config.default_uid },
            gid: if object.stat.gid != 0 { object.stat.gid } else { self.config.default_gid },
            rdev: 0,
            blksize: 4096,
            flags: 0,
        }
    }
}

impl Filesystem for S3FileSystem {
    fn init(&mut self, _req: &FuseRequest<'_>, _config: &mut KernelConfig) -> Result<(), c_int> {
        tracing::info!(bucket = %self.config.bucket_name, "mounted");
        Ok(())
    }

    fn destroy(&mut self) {
        self.stats.log_snapshot();
        tracing::info!("unmounted");
    }

    #[instrument(skip(self, _req, reply))]
    fn lookup(&mut self, _req: &FuseRequest<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let Some(name) = name.to_str() else {
            reply.error(libc::EINVAL);
            return;
        };
        let Ok(parent_path) = self.path_of(parent) else {
            reply.error(libc::ENOENT);
            return;
        };
        let path = Self::child_path(&parent_path, name);

        match self.lookup_object(&path, Hint::None) {
            Ok(object) => {
                let inode = self.inodes.get_or_insert(&path);
                let attr = self.attr_for(inode, &object.lock().unwrap());
                reply.entry(&ATTR_TTL, &attr, 0);
            }
            Err(status) => reply.error(-status),
        }
    }

    fn forget(&mut self, _req: &FuseRequest<'_>, ino: u64, nlookup: u64) {
        self.inodes.forget(ino, nlookup);
    }

    #[instrument(skip(self, _req, reply))]
    fn getattr(&mut self, _req: &FuseRequest<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        let Ok(path) = self.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.lookup_object(&path, Hint::None) {
            Ok(object) => reply.attr(&ATTR_TTL, &self.attr_for(ino, &object.lock().unwrap())),
            Err(status) => reply.error(-status),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn setattr(
        &mut self,
        _req: &FuseRequest<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<TimeOrNow>,
        _mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let Ok(path) = self.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };

        if let Some(new_size) = size {
            if let Some(fh) = fh {
                if let Some(open) = self.handles.get(fh) {
                    if let Err(e) = self.file_state_machine().truncate(&open, new_size) {
                        reply.error(e.to_errno().unsigned_abs() as i32);
                        return;
                    }
                }
            }
        }

        match self.lookup_object(&path, Hint::None) {
            Ok(object) => {
                {
                    let mut obj = object.lock().unwrap();
                    if let Some(m) = mode {
                        obj.stat.mode = m;
                    }
                    if let Some(u) = uid {
                        obj.stat.uid = u;
                    }
                    if let Some(g) = gid {
                        obj.stat.gid = g;
                    }
                    if let Some(s) = size {
                        obj.stat.size = s;
                    }
                }
                reply.attr(&ATTR_TTL, &self.attr_for(ino, &object.lock().unwrap()));
            }
            Err(status) => reply.error(-status),
        }
    }

    fn readlink(&mut self, _req: &FuseRequest<'_>, ino: u64, reply: ReplyData) {
        let Ok(path) = self.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.lookup_object(&path, Hint::None) {
            Ok(object) => match &object.lock().unwrap().kind {
                Kind::Symlink { target } => reply.data(target.as_bytes()),
                _ => reply.error(libc::EINVAL),
            },
            Err(status) => reply.error(-status),
        }
    }

    fn mkdir(&mut self, _req: &FuseRequest<'_>, parent: u64, name: &OsStr, _mode: u32, _umask: u32, reply: ReplyEntry) {
        let Some(name) = name.to_str() else {
            reply.error(libc::EINVAL);
            return;
        };
        let Ok(parent_path) = self.path_of(parent) else {
            reply.error(libc::ENOENT);
            return;
        };
        let path = Self::child_path(&parent_path, name);
        let placeholder = format!("{path}/");

        let status = self.pool.call(
            s3fs_worker::Priority::Pr0,
            Box::new(move |req: &mut WireRequest| {
                req.init("PUT");
                req.set_url(&format!("/{placeholder}"), None);
                match req.run(30) {
                    Ok(()) if matches!(req.response_code, 200 | 201) => 0,
                    _ => -libc::EIO,
                }
            }),
        );
        if status != 0 {
            reply.error(-status);
            return;
        }

        self.cache.remove(&path);
        self.cache.invalidate_parent(&path);
        match self.lookup_object(&path, Hint::IsDir) {
            Ok(object) => {
                let inode = self.inodes.get_or_insert(&path);
                reply.entry(&ATTR_TTL, &self.attr_for(inode, &object.lock().unwrap()), 0);
            }
            Err(status) => reply.error(-status),
        }
    }

    fn unlink(&mut self, _req: &FuseRequest<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(name) = name.to_str() else {
            reply.error(libc::EINVAL);
            return;
        };
        let Ok(parent_path) = self.path_of(parent) else {
            reply.error(libc::ENOENT);
            return;
        };
        let path = Self::child_path(&parent_path, name);

        let status = self.pool.call(
            s3fs_worker::Priority::Pr0,
            Box::new(move |req: &mut WireRequest| {
                req.init("DELETE");
                req.set_url(&format!("/{path}"), None);
                match req.run(30) {
                    Ok(()) if matches!(req.response_code, 200 | 204 | 404) => 0,
                    _ => -libc::EIO,
                }
            }),
        );
        if status != 0 {
            reply.error(-status);
            return;
        }

        let full_path = Self::child_path(&parent_path, name);
        self.cache.remove(&full_path);
        self.cache.invalidate_parent(&full_path);
        self.inodes.invalidate_path(&full_path);
        reply.ok();
    }

    fn rmdir(&mut self, _req: &FuseRequest<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(name) = name.to_str() else {
            reply.error(libc::EINVAL);
            return;
        };
        let Ok(parent_path) = self.path_of(parent) else {
            reply.error(libc::ENOENT);
            return;
        };
        let path = Self::child_path(&parent_path, name);

        match self.directory_ops().remove(&path) {
            Ok(()) => {
                self.inodes.invalidate_path(&path);
                reply.ok();
            }
            Err(e) => reply.error(-e.to_errno()),
        }
    }

    fn symlink(&mut self, _req: &FuseRequest<'_>, parent: u64, link_name: &OsStr, target: &Path, reply: ReplyEntry) {
        let (Some(name), Some(target)) = (link_name.to_str(), target.to_str()) else {
            reply.error(libc::EINVAL);
            return;
        };
        let Ok(parent_path) = self.path_of(parent) else {
            reply.error(libc::ENOENT);
            return;
        };
        let path = Self::child_path(&parent_path, name);
        let body = target.as_bytes().to_vec();

        let status = self.pool.call(
            s3fs_worker::Priority::Pr0,
            Box::new(move |req: &mut WireRequest| {
                req.init("PUT");
                req.set_url(&format!("/{path}"), None);
                req.set_header("x-s3fs-symlink", "1");
                req.set_input_buffer(body.clone());
                match req.run(30) {
                    Ok(()) if req.response_code == 200 => 0,
                    _ => -libc::EIO,
                }
            }),
        );
        if status != 0 {
            reply.error(-status);
            return;
        }

        let full_path = Self::child_path(&parent_path, name);
        self.cache.remove(&full_path);
        self.cache.invalidate_parent(&full_path);
        let inode = self.inodes.get_or_insert(&full_path);
        let object = Arc::new(Mutex::new(Object {
            stat: s3fs_core::Stat {
                path: full_path,
                etag: String::new(),
                mtime: SystemTime::now(),
                content_type: String::new(),
                mode: 0o777,
                uid: self.config.default_uid,
                gid: self.config.default_gid,
                size: target.len() as u64,
                metadata: Default::default(),
            },
            kind: Kind::Symlink { target: target.to_string() },
            not_found: false,
        }));
        reply.entry(&ATTR_TTL, &self.attr_for(inode, &object.lock().unwrap()), 0);
    }

    #[instrument(skip(self, _req, reply))]
    fn rename(
        &mut self,
        _req: &FuseRequest<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let (Some(name), Some(newname)) = (name.to_str(), newname.to_str()) else {
            reply.error(libc::EINVAL);
            return;
        };
        let (Ok(parent_path), Ok(newparent_path)) = (self.path_of(parent), self.path_of(newparent)) else {
            reply.error(libc::ENOENT);
            return;
        };
        let from = Self::child_path(&parent_path, name);
        let to = Self::child_path(&newparent_path, newname);

        let is_dir = match self.lookup_object(&from, Hint::None) {
            Ok(object) => object.lock().unwrap().is_directory(),
            Err(status) => {
                reply.error(-status);
                return;
            }
        };

        let result = if is_dir {
            self.directory_ops().rename(&from, &to).map_err(|e| e.to_errno())
        } else {
            self.rename_file(&from, &to)
        };

        match result {
            Ok(()) => {
                self.cache.remove(&from);
                self.cache.invalidate_parent(&from);
                self.cache.invalidate_parent(&to);
                if let Some(inode) = self.inodes.inode_of(&from) {
                    self.inodes.update_path(inode, &from, to);
                }
                reply.ok();
            }
            Err(status) => reply.error(-status),
        }
    }

    #[instrument(skip(self, _req, reply))]
    fn open(&mut self, _req: &FuseRequest<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let Ok(path) = self.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let object = match self.lookup_object(&path, Hint::IsFile) {
            Ok(object) => object,
            Err(status) => {
                reply.error(-status);
                return;
            }
        };

        let truncate = flags & libc::O_TRUNC != 0;
        let state_flags = if truncate { OPEN_TRUNCATE_TO_ZERO } else { 0 };

        match self.file_state_machine().open(object, state_flags) {
            Ok(open) => {
                let fh = self.handles.insert(open);
                reply.opened(fh, 0);
            }
            Err(e) => reply.error(e.to_errno().unsigned_abs() as i32),
        }
    }

    fn create(
        &mut self,
        _req: &FuseRequest<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        let Some(name) = name.to_str() else {
            reply.error(libc::EINVAL);
            return;
        };
        let Ok(parent_path) = self.path_of(parent) else {
            reply.error(libc::ENOENT);
            return;
        };
        let path = Self::child_path(&parent_path, name);

        let status = self.pool.call(
            s3fs_worker::Priority::Pr0,
            Box::new(move |req: &mut WireRequest| {
                req.init("PUT");
                req.set_url(&format!("/{path}"), None);
                match req.run(30) {
                    Ok(()) if req.response_code == 200 => 0,
                    _ => -libc::EIO,
                }
            }),
        );
        if status != 0 {
            reply.error(-status);
            return;
        }

        let full_path = Self::child_path(&parent_path, name);
        self.cache.remove(&full_path);
        self.cache.invalidate_parent(&full_path);
        let object = match self
            .cache
            .fetch_after_create(&self.pool, self.adapter.as_ref(), &full_path, self.config.max_inconsistent_state_retries)
        {
            Ok(object) => object,
            Err(status) => {
                reply.error(-status);
                return;
            }
        };
        {
            let mut obj = object.lock().unwrap();
            obj.stat.mode = mode;
            if self.config.use_encryption && self.config.encrypt_new_files {
                if let Some(volume_key) = &self.volume_key {
                    let file_key = crypto::generate_key();
                    let iv = crypto::generate_iv();
                    let wrapped = crypto::wrap_key(volume_key, &iv, &file_key);
                    obj.stat.metadata.insert(meta_keys::KEY.to_string(), crypto::encode_key(&wrapped));
                    obj.stat.metadata.insert(meta_keys::ENC_IV.to_string(), crypto::encode_iv(&iv));
                    if let Some(file) = obj.as_file_mut() {
                        file.encryption_key = Some(file_key);
                    }
                }
            }
        }

        let _ = flags;
        match self.file_state_machine().open(object.clone(), OPEN_TRUNCATE_TO_ZERO) {
            Ok(open) => {
                let inode = self.inodes.get_or_insert(&full_path);
                let fh = self.handles.insert(open);
                reply.created(&ATTR_TTL, &self.attr_for(inode, &object.lock().unwrap()), 0, fh, 0);
            }
            Err(e) => reply.error(e.to_errno().unsigned_abs() as i32),
        }
    }

    fn read(
        &mut self,
        _req: &FuseRequest<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let Some(open) = self.handles.get(fh) else {
            reply.error(libc::EBADF);
            return;
        };
        let mut buf = vec![0u8; size as usize];
        match self.file_state_machine().read(&open, &mut buf, offset as u64) {
            Ok(n) => reply.data(&buf[..n]),
            Err(e) => reply.error(e.to_errno().unsigned_abs() as i32),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn write(
        &mut self,
        _req: &FuseRequest<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let Some(open) = self.handles.get(fh) else {
            reply.error(libc::EBADF);
            return;
        };
        match self.file_state_machine().write(&open, data, offset as u64) {
            Ok(n) => reply.written(n as u32),
            Err(e) => reply.error(e.to_errno().unsigned_abs() as i32),
        }
    }

    fn flush(&mut self, _req: &FuseRequest<'_>, _ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        let Some(open) = self.handles.get(fh) else {
            reply.error(libc::EBADF);
            return;
        };
        match self.file_state_machine().flush(&open) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno().unsigned_abs() as i32),
        }
    }

    fn release(
        &mut self,
        _req: &FuseRequest<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        let Some(open) = self.handles.remove(fh) else {
            reply.error(libc::EBADF);
            return;
        };
        match self.file_state_machine().release(open) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno().unsigned_abs() as i32),
        }
    }

    fn opendir(&mut self, _req: &FuseRequest<'_>, _ino: u64, _flags: i32, reply: ReplyOpen) {
        reply.opened(0, 0);
    }

    fn readdir(&mut self, _req: &FuseRequest<'_>, ino: u64, _fh: u64, offset: i64, mut reply: ReplyDirectory) {
        let Ok(path) = self.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };

        let mut entries: Vec<(String, FileType)> = vec![(".".to_string(), FileType::Directory), ("..".to_string(), FileType::Directory)];
        let result = self.directory_ops().read(&path, |name, is_dir| {
            entries.push((name.to_string(), if is_dir { FileType::Directory } else { FileType::RegularFile }));
        });
        if let Err(e) = result {
            reply.error(-e.to_errno());
            return;
        }

        for (idx, (name, kind)) in entries.iter().enumerate().skip(offset as usize) {
            let child_path = if name == "." {
                path.clone()
            } else if name == ".." {
                path.rsplit_once('/').map_or(String::new(), |(p, _)| p.to_string())
            } else {
                Self::child_path(&path, name)
            };
            let child_inode = self.inodes.get_or_insert_no_lookup(&child_path);
            if reply.add(child_inode, (idx + 1) as i64, *kind, name) {
                break;
            }
        }
        reply.ok();
    }

    fn releasedir(&mut self, _req: &FuseRequest<'_>, _ino: u64, _fh: u64, _flags: i32, reply: ReplyEmpty) {
        reply.ok();
    }

    fn statfs(&mut self, _req: &FuseRequest<'_>, _ino: u64, reply: ReplyStatfs) {
        // Object storage has no meaningful block/inode accounting; report
        // generous fixed figures so tools like `df` don't choke on zeros.
        reply.statfs(u64::MAX / 4096, u64::MAX / 4096, u64::MAX / 4096, 1_000_000, 1_000_000, 4096, 255, 4096);
    }

    fn getxattr(&mut self, _req: &FuseRequest<'_>, ino: u64, name: &OsStr, size: u32, reply: ReplyXattr) {
        let Ok(path) = self.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let Some(name) = name.to_str() else {
            reply.error(libc::EINVAL);
            return;
        };
        let object = match self.lookup_object(&path, Hint::None) {
            Ok(object) => object,
            Err(status) => {
                reply.error(-status);
                return;
            }
        };
        let Some(value) = object.lock().unwrap().stat.metadata.get(name).cloned() else {
            reply.error(libc::ENODATA);
            return;
        };
        if size == 0 {
            reply.size(value.len() as u32);
        } else if value.len() > size as usize {
            reply.error(libc::ERANGE);
        } else {
            reply.data(value.as_bytes());
        }
    }

    fn setxattr(
        &mut self,
        _req: &FuseRequest<'_>,
        ino: u64,
        name: &OsStr,
        value: &[u8],
        _flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        let (Ok(path), Some(name), Ok(value)) = (self.path_of(ino), name.to_str(), std::str::from_utf8(value)) else {
            reply.error(libc::EINVAL);
            return;
        };
        match self.lookup_object(&path, Hint::None) {
            Ok(object) => {
                object.lock().unwrap().stat.metadata.insert(name.to_string(), value.to_string());
                reply.ok();
            }
            Err(status) => reply.error(-status),
        }
    }

    fn listxattr(&mut self, _req: &FuseRequest<'_>, ino: u64, size: u32, reply: ReplyXattr) {
        let Ok(path) = self.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let object = match self.lookup_object(&path, Hint::None) {
            Ok(object) => object,
            Err(status) => {
                reply.error(-status);
                return;
            }
        };
        let joined: Vec<u8> = object
            .lock()
            .unwrap()
            .stat
            .metadata
            .keys()
            .flat_map(|k| k.bytes().chain(std::iter::once(0u8)))
            .collect();
        if size == 0 {
            reply.size(joined.len() as u32);
        } else if joined.len() > size as usize {
            reply.error(libc::ERANGE);
        } else {
            reply.data(&joined);
        }
    }

    fn removexattr(&mut self, _req: &FuseRequest<'_>, ino: u64, name: &OsStr, reply: ReplyEmpty) {
        let (Ok(path), Some(name)) = (self.path_of(ino), name.to_str()) else {
            reply.error(libc::EINVAL);
            return;
        };
        match self.lookup_object(&path, Hint::None) {
            Ok(object) => {
                object.lock().unwrap().stat.metadata.remove(name);
                reply.ok();
            }
            Err(status) => reply.error(-status),
        }
    }
}
