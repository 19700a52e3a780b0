//! The service adapter boundary: everything that differs between S3 and
//! Google Storage (URL scheme, header namespace, XML namespace, upload
//! protocol) lives behind this trait so the cache, transfer engine, and
//! directory pipeline never branch on backend.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::SystemTime;

use s3fs_worker::{HmacSigner, Signer};

use crate::object::{FileExtras, Kind, Object, Stat};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    MultipartDownload,
    MultipartUpload,
}

/// Per-backend URL scheme, signing, and header namespace.
pub trait ServiceAdapter: Send + Sync {
    fn url_prefix(&self) -> &str;
    fn bucket_url(&self) -> String;
    /// The `x-amz-`/`x-goog-` prefix used both for signed headers and for
    /// namespacing user metadata (`header_meta_prefix` = this + `meta-`).
    fn header_prefix(&self) -> &str;
    fn header_meta_prefix(&self) -> String {
        format!("{}meta-", self.header_prefix())
    }
    fn signer(&self) -> Arc<dyn Signer>;
    fn supports(&self, capability: Capability) -> bool;
    fn upload_strategy(&self) -> Box<dyn UploadStrategy>;

    /// Builds an `Object` from a successful probe at `probe_url_path` (the
    /// path — with or without trailing slash — that returned 2xx) and the
    /// HEAD response's headers, already lowercased by [`crate::Request`].
    /// User metadata is recovered by stripping [`Self::header_meta_prefix`]
    /// off every header that carries it; everything else maps to a fixed
    /// `Stat` field.
    fn object_from_probe(&self, logical_path: &str, probe_url_path: &str, headers: &BTreeMap<String, String>) -> Object {
        let is_directory = probe_url_path.ends_with('/') || probe_url_path.is_empty();
        let etag = headers
            .get("etag")
            .map(|v| v.trim_matches('"').to_string())
            .unwrap_or_default();
        let size = headers.get("content-length").and_then(|v| v.parse().ok()).unwrap_or(0);
        let content_type = headers.get("content-type").cloned().unwrap_or_default();
        let mtime = headers
            .get("last-modified")
            .and_then(|v| httpdate::parse_http_date(v).ok())
            .unwrap_or_else(SystemTime::now);

        let meta_prefix = self.header_meta_prefix();
        let metadata: BTreeMap<String, String> = headers
            .iter()
            .filter_map(|(k, v)| k.strip_prefix(meta_prefix.as_str()).map(|stripped| (stripped.to_string(), v.clone())))
            .collect();

        let stat = Stat {
            path: logical_path.to_string(),
            etag,
            mtime,
            content_type,
            mode: 0,
            uid: 0,
            gid: 0,
            size,
            metadata,
        };
        let kind = if is_directory {
            Kind::Directory(crate::object::DirectoryExtras::new())
        } else {
            Kind::File(FileExtras::new())
        };
        Object {
            stat,
            kind,
            not_found: false,
        }
    }
}

/// Selected by [`ServiceAdapter::upload_strategy`]; the S3 three-phase and
/// GS resumable-session protocols are different enough that modeling them as
/// one class hierarchy with a backend flag (as the source does) just pushes
/// the branching one level down — two implementations of one trait is
/// simpler.
pub trait UploadStrategy: Send {
    /// Human-readable name for logging.
    fn name(&self) -> &'static str;
}

pub struct S3Adapter {
    pub bucket_name: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub url_prefix: String,
}

impl ServiceAdapter for S3Adapter {
    fn url_prefix(&self) -> &str {
        &self.url_prefix
    }

    fn bucket_url(&self) -> String {
        format!("{}/{}", self.url_prefix, self.bucket_name)
    }

    fn header_prefix(&self) -> &str {
        "x-amz-"
    }

    fn signer(&self) -> Arc<dyn Signer> {
        Arc::new(HmacSigner {
            scheme: "AWS",
            access_key: self.access_key_id.clone(),
            secret_key: self.secret_access_key.clone(),
            prefix: "x-amz-",
        })
    }

    fn supports(&self, _capability: Capability) -> bool {
        true
    }

    fn upload_strategy(&self) -> Box<dyn UploadStrategy> {
        Box::new(S3MultipartUpload)
    }
}

pub struct GsAdapter {
    pub bucket_name: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub url_prefix: String,
}

impl ServiceAdapter for GsAdapter {
    fn url_prefix(&self) -> &str {
        &self.url_prefix
    }

    fn bucket_url(&self) -> String {
        format!("{}/{}", self.url_prefix, self.bucket_name)
    }

    fn header_prefix(&self) -> &str {
        "x-goog-"
    }

    fn signer(&self) -> Arc<dyn Signer> {
        Arc::new(HmacSigner {
            scheme: "GOOG1",
            access_key: self.access_key_id.clone(),
            secret_key: self.secret_access_key.clone(),
            prefix: "x-goog-",
        })
    }

    fn supports(&self, capability: Capability) -> bool {
        matches!(capability, Capability::MultipartDownload)
    }

    fn upload_strategy(&self) -> Box<dyn UploadStrategy> {
        Box::new(GsResumableUpload)
    }
}

pub struct S3MultipartUpload;

impl UploadStrategy for S3MultipartUpload {
    fn name(&self) -> &'static str {
        "s3-multipart"
    }
}

pub struct GsResumableUpload;

impl UploadStrategy for GsResumableUpload {
    fn name(&self) -> &'static str {
        "gs-resumable"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn s3_adapter_supports_both_multipart_capabilities() {
        let adapter = S3Adapter {
            bucket_name: "b".to_string(),
            access_key_id: "k".to_string(),
            secret_access_key: "s".to_string(),
            url_prefix: "https://s3.amazonaws.com".to_string(),
        };
        assert!(adapter.supports(Capability::MultipartDownload));
        assert!(adapter.supports(Capability::MultipartUpload));
        assert_eq!(adapter.upload_strategy().name(), "s3-multipart");
    }

    #[test]
    fn gs_adapter_only_supports_multipart_download() {
        let adapter = GsAdapter {
            bucket_name: "b".to_string(),
            access_key_id: "k".to_string(),
            secret_access_key: "s".to_string(),
            url_prefix: "https://storage.googleapis.com".to_string(),
        };
        assert!(adapter.supports(Capability::MultipartDownload));
        assert!(!adapter.supports(Capability::MultipartUpload));
        assert_eq!(adapter.upload_strategy().name(), "gs-resumable");
    }

    #[test]
    fn header_meta_prefix_derives_from_header_prefix() {
        let adapter = S3Adapter {
            bucket_name: "b".to_string(),
            access_key_id: "k".to_string(),
            secret_access_key: "s".to_string(),
            url_prefix: "https://s3.amazonaws.com".to_string(),
        };
        assert_eq!(adapter.header_meta_prefix(), "x-amz-meta-");
    }

    #[test]
    fn object_from_probe_reads_real_response_headers() {
        let adapter = S3Adapter {
            bucket_name: "b".to_string(),
            access_key_id: "k".to_string(),
            secret_access_key: "s".to_string(),
            url_prefix: "https://s3.amazonaws.com".to_string(),
        };
        let mut headers = BTreeMap::new();
        headers.insert("etag".to_string(), "\"abc123\"".to_string());
        headers.insert("content-length".to_string(), "42".to_string());
        headers.insert("content-type".to_string(), "text/plain".to_string());
        headers.insert("x-amz-meta-owner".to_string(), "alice".to_string());

        let object = adapter.object_from_probe("a.txt", "a.txt", &headers);
        assert_eq!(object.stat.etag, "abc123");
        assert_eq!(object.stat.size, 42);
        assert_eq!(object.stat.content_type, "text/plain");
        assert_eq!(object.stat.metadata.get("owner"), Some(&"alice".to_string()));
        assert!(object.is_file());
    }

    #[test]
    fn object_from_probe_detects_directory_from_trailing_slash() {
        let adapter = S3Adapter {
            bucket_name: "b".to_string(),
            access_key_id: "k".to_string(),
            secret_access_key: "s".to_string(),
            url_prefix: "https://s3.amazonaws.com".to_string(),
        };
        let object = adapter.object_from_probe("dir", "dir/", &BTreeMap::new());
        assert!(object.is_directory());
    }
}
