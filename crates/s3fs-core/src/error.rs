//! Domain errors for every `s3fs-core` subsystem, and the single place that
//! maps them to the `libc` errno the kernel adapter returns.

use thiserror::Error;

/// Cache-level failures: fetch never returns this for a 404 (that's a
/// successful negative-cache hit), only for transport/consistency problems.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("request failed for {path}: {source}")]
    Request {
        path: String,
        #[source]
        source: s3fs_worker::RequestError,
    },
    #[error("object {path} did not become HEAD-able after {attempts} attempts")]
    Inconsistent { path: String, attempts: u32 },
}

/// Transfer-engine failures: a download or upload that did not complete.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("part {part} failed after {retries} retries: {reason}")]
    PartFailed {
        part: u32,
        retries: u32,
        reason: String,
    },
    #[error("upload aborted: {reason}")]
    UploadAborted { reason: String },
    #[error("server returned unexpected status {status} for {what}")]
    UnexpectedStatus { status: u16, what: &'static str },
    #[error("etag mismatch: expected {expected}, got {actual}")]
    EtagMismatch { expected: String, actual: String },
    #[error(transparent)]
    Request(#[from] s3fs_worker::RequestError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Xml(#[from] quick_xml::DeError),
}

/// File state machine failures.
#[derive(Debug, Error)]
pub enum FileStateError {
    #[error("operation would conflict with an in-flight upload")]
    UploadInProgress,
    #[error("operation would conflict with an in-flight download")]
    DownloadInProgress,
    #[error(transparent)]
    Transfer(#[from] TransferError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Directory operation failures.
#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("directory is not empty")]
    NotEmpty,
    #[error("rename of the root directory is not permitted")]
    RenameRoot,
    #[error("{0} of {1} entries failed to copy during rename")]
    PartialRename(usize, usize),
    #[error("request failed with status {0}")]
    RequestFailed(i32),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Transfer(#[from] TransferError),
    #[error(transparent)]
    Xml(#[from] quick_xml::DeError),
    #[error(transparent)]
    Request(#[from] s3fs_worker::RequestError),
}

/// Converts a domain error into the negative POSIX errno the kernel adapter
/// (and every other public operation, per the error-propagation convention)
/// returns. Centralized here so no caller re-derives the mapping.
pub trait ToErrno {
    fn to_errno(&self) -> i32;
}

impl ToErrno for CacheError {
    fn to_errno(&self) -> i32 {
        match self {
            CacheError::Request { .. } => -libc::EIO,
            CacheError::Inconsistent { .. } => -libc::EAGAIN,
        }
    }
}

impl ToErrno for TransferError {
    fn to_errno(&self) -> i32 {
        match self {
            TransferError::PartFailed { .. }
            | TransferError::UploadAborted { .. }
            | TransferError::UnexpectedStatus { .. }
            | TransferError::EtagMismatch { .. }
            | TransferError::Xml(_) => -libc::EIO,
            TransferError::Request(_) => -libc::EIO,
            TransferError::Io(e) => -e.raw_os_error().unwrap_or(libc::EIO),
        }
    }
}

impl ToErrno for FileStateError {
    fn to_errno(&self) -> i32 {
        match self {
            FileStateError::UploadInProgress | FileStateError::DownloadInProgress => -libc::EBUSY,
            FileStateError::Transfer(e) => e.to_errno(),
            FileStateError::Io(e) => -e.raw_os_error().unwrap_or(libc::EIO),
        }
    }
}

impl ToErrno for DirectoryError {
    fn to_errno(&self) -> i32 {
        match self {
            DirectoryError::NotEmpty => -libc::ENOTEMPTY,
            DirectoryError::RenameRoot => -libc::EINVAL,
            DirectoryError::PartialRename(..) | DirectoryError::RequestFailed(_) => -libc::EIO,
            DirectoryError::Cache(e) => e.to_errno(),
            DirectoryError::Transfer(e) => e.to_errno(),
            DirectoryError::Xml(_) => -libc::EIO,
            DirectoryError::Request(_) => -libc::EIO,
        }
    }
}

impl ToErrno for s3fs_worker::RequestError {
    fn to_errno(&self) -> i32 {
        match self {
            s3fs_worker::RequestError::Transport(_) => -libc::EIO,
            s3fs_worker::RequestError::Io(e) => -e.raw_os_error().unwrap_or(libc::EIO),
            s3fs_worker::RequestError::InvalidHeader(_) => -libc::EINVAL,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_empty_maps_to_enotempty() {
        assert_eq!(DirectoryError::NotEmpty.to_errno(), -libc::ENOTEMPTY);
    }

    #[test]
    fn upload_in_progress_maps_to_ebusy() {
        assert_eq!(FileStateError::UploadInProgress.to_errno(), -libc::EBUSY);
    }

    #[test]
    fn inconsistent_maps_to_eagain() {
        let e = CacheError::Inconsistent {
            path: "a".to_string(),
            attempts: 3,
        };
        assert_eq!(e.to_errno(), -libc::EAGAIN);
    }
}
