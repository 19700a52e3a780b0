//! Kernel adapter and CLI for mounting an S3/GS-compatible bucket as a POSIX
//! filesystem.
//!
//! This crate is a thin marshaling surface: it owns the inode table and the
//! open-handle table (the only state that is genuinely kernel-shaped) and
//! delegates every real decision — cache lookups, transfers, directory
//! pagination — to `s3fs-core`.

pub mod cli;
pub mod filesystem;
pub mod handles;
pub mod inode;

pub use cli::Cli;
pub use filesystem::S3FileSystem;
pub use handles::HandleTable;
pub use inode::{InodeTable, FUSE_ROOT_ID};
