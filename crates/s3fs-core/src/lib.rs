//! Object model, metadata cache, transfer engine, file state machine, and
//! directory pipeline for a FUSE-mounted S3/GS-compatible object store.
//!
//! This crate sits on top of `s3fs-worker` (the request primitive and
//! worker pool) and knows nothing about the kernel — the `fuser` adapter in
//! `s3fs-fuse` is the only caller that deals with inodes, file handles, or
//! FUSE reply types.

pub mod adapter;
pub mod cache;
pub mod config;
pub mod crypto;
pub mod directory;
pub mod error;
pub mod file_state;
pub mod object;
pub mod stats;
pub mod transfer;
pub mod xml;

pub use adapter::{Capability, GsAdapter, S3Adapter, ServiceAdapter, UploadStrategy};
pub use cache::{Cache, Hint};
pub use config::{Config, ConfigError, Service};
pub use directory::DirectoryOps;
pub use error::ToErrno;
pub use file_state::{FileStateMachine, OpenFile, OPEN_TRUNCATE_TO_ZERO};
pub use object::{FileStatus, Kind, Object, Stat};
pub use stats::Stats;
pub use transfer::{EncryptionContext, TransferEngine};
