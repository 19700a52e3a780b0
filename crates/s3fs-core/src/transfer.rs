//! The file data-transfer engine: single/multipart download and upload,
//! with per-part retry and optional client-side encryption.

use std::collections::BTreeMap;
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::sync::{Arc, Mutex};

use s3fs_worker::{OutputMode, Pool, Priority, Request};
use tracing::instrument;

use crate::adapter::{Capability, ServiceAdapter};
use crate::crypto::{self, Key};
use crate::error::TransferError;
use crate::stats::Stats;
use crate::xml;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartStatus {
    Pending,
    Done,
    Failed,
}

/// Per-part status and retry count, indexed by part number — inspectable
/// without traversing a handle list.
pub struct MultipartLedger {
    parts: Mutex<Vec<(PartStatus, u32)>>,
}

impl MultipartLedger {
    fn new(count: usize) -> Self {
        Self {
            parts: Mutex::new(vec![(PartStatus::Pending, 0); count]),
        }
    }

    fn mark(&self, part: usize, status: PartStatus) {
        self.parts.lock().unwrap()[part].0 = status;
    }

    fn bump_retry(&self, part: usize) -> u32 {
        let mut parts = self.parts.lock().unwrap();
        parts[part].1 += 1;
        parts[part].1
    }

    pub fn status(&self, part: usize) -> PartStatus {
        self.parts.lock().unwrap()[part].0
    }

    /// Sum of retry counts across every part — reported to [`Stats`] from
    /// the calling thread once a round completes, since the per-part
    /// closures run on worker threads and can't hold a borrowed `&Stats`.
    fn total_retries(&self) -> u32 {
        self.parts.lock().unwrap().iter().map(|(_, retries)| *retries).sum()
    }
}

/// Optional per-file encryption context threaded through download/upload.
pub struct EncryptionContext {
    pub key: Key,
    pub iv: [u8; 16],
}

pub struct TransferEngine<'a> {
    pub pool: &'a Pool,
    pub adapter: &'a dyn ServiceAdapter,
    pub download_chunk_size: u64,
    pub upload_chunk_size: u64,
    pub transfer_retries: u32,
    pub stats: &'a Stats,
}

impl<'a> TransferEngine<'a> {
    /// Downloads `size` bytes from `url_path` into `scratch`, splitting into
    /// ranged GETs when the object is larger than `download_chunk_size` and
    /// the backend supports multipart download.
    #[instrument(skip(self, scratch, encryption))]
    pub fn download(
        &self,
        url_path: &str,
        size: u64,
        scratch: &Arc<File>,
        encryption: Option<&EncryptionContext>,
    ) -> Result<(), TransferError> {
        if size == 0 {
            return Ok(());
        }

        let multipart = size > self.download_chunk_size && self.adapter.supports(Capability::MultipartDownload);
        if !multipart {
            self.download_part(url_path, 0, size, scratch, encryption)?;
            self.stats.record_bytes_downloaded(size);
            return Ok(());
        }

        let chunk = self.download_chunk_size;
        let part_count = size.div_ceil(chunk) as usize;
        let ledger = Arc::new(MultipartLedger::new(part_count));

        let handles: Vec<_> = (0..part_count)
            .map(|part| {
                let offset = part as u64 * chunk;
                let part_size = chunk.min(size - offset);
                self.spawn_download_part(url_path, part, offset, part_size, scratch.clone(), encryption, ledger.clone())
            })
            .collect();

        for handle in handles {
            handle.wait();
        }

        for part in 0..part_count {
            if ledger.status(part) != PartStatus::Done {
                return Err(TransferError::PartFailed {
                    part: part as u32,
                    retries: self.transfer_retries,
                    reason: "exhausted retries".to_string(),
                });
            }
        }

        for _ in 0..ledger.total_retries() {
            self.stats.record_part_retry();
        }
        self.stats.record_bytes_downloaded(size);
        Ok(())
    }

    fn spawn_download_part(
        &self,
        url_path: &str,
        part: usize,
        offset: u64,
        size: u64,
        scratch: Arc<File>,
        encryption: Option<&EncryptionContext>,
        ledger: Arc<MultipartLedger>,
    ) -> s3fs_worker::AsyncHandle {
        let url_path = url_path.to_string();
        let retries = self.transfer_retries;
        let key_iv = encryption.map(|e| (e.key.clone(), e.iv));

        self.pool.post(
            Priority::PrReq1,
            Box::new(move |req: &mut Request| {
                for _attempt in 0..=retries {
                    req.init("GET");
                    req.set_url(&format!("/{url_path}"), None);
                    req.set_header("range", &format!("bytes={}-{}", offset, offset + size - 1));
                    req.set_output_mode(OutputMode::File {
                        file: scratch.try_clone().expect("scratch fd clone"),
                        offset,
                    });

                    match req.run(30) {
                        Ok(()) if req.response_code == 206 || req.response_code == 200 => {
                            if let Some((key, iv)) = &key_iv {
                                if let Err(e) = decrypt_range_in_place(&scratch, offset, size, key, iv) {
                                    tracing::warn!(part, error = %e, "decrypt failed");
                                    ledger.bump_retry(part);
                                    continue;
                                }
                            }
                            ledger.mark(part, PartStatus::Done);
                            return 0;
                        }
                        _ => {
                            ledger.bump_retry(part);
                        }
                    }
                }
                ledger.mark(part, PartStatus::Failed);
                -libc::EIO
            }),
        )
    }

    fn download_part(
        &self,
        url_path: &str,
        offset: u64,
        size: u64,
        scratch: &Arc<File>,
        encryption: Option<&EncryptionContext>,
    ) -> Result<(), TransferError> {
        let status = self.pool.call(Priority::PrReq1, {
            let url_path = url_path.to_string();
            let scratch = scratch.clone();
            Box::new(move |req: &mut Request| {
                req.init("GET");
                req.set_url(&format!("/{url_path}"), None);
                if offset > 0 || size > 0 {
                    req.set_header("range", &format!("bytes={}-{}", offset, offset + size - 1));
                }
                req.set_output_mode(OutputMode::File {
                    file: scratch.try_clone().expect("scratch fd clone"),
                    offset,
                });
                match req.run(30) {
                    Ok(()) if matches!(req.response_code, 200 | 206) => 0,
                    Ok(()) => -libc::EIO,
                    Err(_) => -libc::EIO,
                }
            })
        });

        if status != 0 {
            return Err(TransferError::UnexpectedStatus {
                status: 0,
                what: "download",
            });
        }

        if let Some(ctx) = encryption {
            decrypt_range_in_place(scratch, offset, size, &ctx.key, &ctx.iv)?;
        }

        Ok(())
    }

    /// Uploads `size` bytes read from `scratch`, single PUT below
    /// `upload_chunk_size`, multipart above it via whichever protocol
    /// [`ServiceAdapter::upload_strategy`] names for this backend. `metadata`
    /// is sent as `x-{prefix}meta-*` headers on the PUT/initiate call so it
    /// survives the round trip (notably the encryption key/IV markers).
    /// Returns the object's final etag on success.
    #[instrument(skip(self, scratch, encryption, metadata))]
    pub fn upload(
        &self,
        url_path: &str,
        size: u64,
        scratch: &File,
        encryption: Option<&EncryptionContext>,
        metadata: &BTreeMap<String, String>,
    ) -> Result<String, TransferError> {
        if size <= self.upload_chunk_size {
            return self.upload_single(url_path, size, scratch, encryption, metadata);
        }
        match self.adapter.upload_strategy().name() {
            "gs-resumable" => self.upload_resumable_gs(url_path, size, scratch, encryption, metadata),
            _ => self.upload_multipart_s3(url_path, size, scratch, encryption, metadata),
        }
    }

    fn meta_headers(&self, metadata: &BTreeMap<String, String>) -> Vec<(String, String)> {
        let prefix = self.adapter.header_meta_prefix();
        metadata.iter().map(|(k, v)| (format!("{prefix}{k}"), v.clone())).collect()
    }

    fn upload_single(
        &self,
        url_path: &str,
        size: u64,
        scratch: &File,
        encryption: Option<&EncryptionContext>,
        metadata: &BTreeMap<String, String>,
    ) -> Result<String, TransferError> {
        let mut buf = vec![0u8; size as usize];
        scratch.read_exact_at(&mut buf, 0)?;
        if let Some(ctx) = encryption {
            crypto::encrypt_at(&ctx.key, &ctx.iv, 0, &mut buf).expect("ctr encryption is infallible for valid keys");
        }
        let content_md5 = crypto::md5_base64(&buf);
        let expected_hex = crypto::md5_hex(&buf);
        let meta_headers = self.meta_headers(metadata);

        let url_path = url_path.to_string();
        let result: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
        let result_clone = result.clone();
        let status = self.pool.call(
            Priority::PrReq1,
            Box::new(move |req: &mut Request| {
                req.init("PUT");
                req.set_url(&format!("/{url_path}"), None);
                req.set_header("content-md5", &content_md5);
                for (k, v) in &meta_headers {
                    req.set_header(k, v);
                }
                req.set_input_buffer(buf.clone());
                match req.run(30) {
                    Ok(()) if req.response_code == 200 => {
                        let etag = req.response_header("etag").unwrap_or("").trim_matches('"').to_string();
                        *result_clone.lock().unwrap() = Some(etag);
                        0
                    }
                    Ok(()) => -libc::EIO,
                    Err(_) => -libc::EIO,
                }
            }),
        );

        if status != 0 {
            return Err(TransferError::UnexpectedStatus {
                status: 0,
                what: "single-part upload",
            });
        }

        let etag = result.lock().unwrap().clone().unwrap_or_default();
        if etag.len() == 32 && etag != expected_hex {
            return Err(TransferError::EtagMismatch {
                expected: expected_hex,
                actual: etag,
            });
        }
        self.stats.record_bytes_uploaded(size);
        Ok(etag)
    }

    fn upload_multipart_s3(
        &self,
        url_path: &str,
        size: u64,
        scratch: &File,
        encryption: Option<&EncryptionContext>,
        metadata: &BTreeMap<String, String>,
    ) -> Result<String, TransferError> {
        let upload_id = self.initiate_multipart(url_path, metadata)?;
        let chunk = self.upload_chunk_size;
        let part_count = size.div_ceil(chunk) as usize;

        let mut etags = vec![String::new(); part_count];
        let mut failed = false;
        let mut total_retries = 0u32;

        for part in 0..part_count {
            let offset = part as u64 * chunk;
            let part_size = chunk.min(size - offset);
            let mut buf = vec![0u8; part_size as usize];
            scratch.read_exact_at(&mut buf, offset)?;
            if let Some(ctx) = encryption {
                crypto::encrypt_at(&ctx.key, &ctx.iv, offset, &mut buf)
                    .expect("ctr encryption is infallible for valid keys");
            }

            match self.upload_part(url_path, &upload_id, (part + 1) as u32, buf) {
                Ok((etag, retries)) => {
                    etags[part] = etag;
                    total_retries += retries;
                }
                Err(_) => {
                    failed = true;
                    break;
                }
            }
        }

        for _ in 0..total_retries {
            self.stats.record_part_retry();
        }

        if failed {
            self.abort_multipart(url_path, &upload_id);
            return Err(TransferError::UploadAborted {
                reason: "a part failed after exhausting retries".to_string(),
            });
        }

        let etag = self.complete_multipart(url_path, &upload_id, &etags)?;
        self.stats.record_bytes_uploaded(size);
        Ok(etag)
    }

    fn initiate_multipart(&self, url_path: &str, metadata: &BTreeMap<String, String>) -> Result<String, TransferError> {
        let url_path = url_path.to_string();
        let meta_headers = self.meta_headers(metadata);
        let body: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
        let body_clone = body.clone();
        let status = self.pool.call(
            Priority::PrReq1,
            Box::new(move |req: &mut Request| {
                req.init("POST");
                req.set_url(&format!("/{url_path}"), Some("uploads"));
                for (k, v) in &meta_headers {
                    req.set_header(k, v);
                }
                match req.run(30) {
                    Ok(()) if req.response_code == 200 => {
                        *body_clone.lock().unwrap() = req.response_body.clone();
                        0
                    }
                    _ => -libc::EIO,
                }
            }),
        );
        if status != 0 {
            return Err(TransferError::UnexpectedStatus {
                status: 0,
                what: "initiate multipart upload",
            });
        }
        let body = body.lock().unwrap();
        Ok(xml::parse_initiate_multipart(&body)?.upload_id)
    }

    /// Returns the uploaded part's etag and the number of retries it took —
    /// the retry count is reported to [`Stats`] by the caller, since the
    /// retry loop runs inside a worker-thread closure that can't hold a
    /// borrowed `&Stats`.
    fn upload_part(&self, url_path: &str, upload_id: &str, part_number: u32, buf: Vec<u8>) -> Result<(String, u32), TransferError> {
        let url_path = url_path.to_string();
        let query = format!("partNumber={part_number}&uploadId={upload_id}");
        let result: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
        let result_clone = result.clone();
        let retry_count: Arc<Mutex<u32>> = Arc::new(Mutex::new(0));
        let retry_count_clone = retry_count.clone();
        let retries = self.transfer_retries;

        let status = self.pool.call(
            Priority::PrReq1,
            Box::new(move |req: &mut Request| {
                for attempt in 0..=retries {
                    req.init("PUT");
                    req.set_url(&format!("/{url_path}"), Some(&query));
                    req.set_input_buffer(buf.clone());
                    if let Ok(()) = req.run(30) {
                        if req.response_code == 200 {
                            let etag = req.response_header("etag").unwrap_or("").trim_matches('"').to_string();
                            *result_clone.lock().unwrap() = Some(etag);
                            return 0;
                        }
                    }
                    if attempt < retries {
                        *retry_count_clone.lock().unwrap() += 1;
                    }
                }
                -libc::EIO
            }),
        );

        if status != 0 {
            return Err(TransferError::PartFailed {
                part: part_number,
                retries: self.transfer_retries,
                reason: "exhausted retries".to_string(),
            });
        }
        let etag = result.lock().unwrap().clone().unwrap_or_default();
        let retries_used = *retry_count.lock().unwrap();
        Ok((etag, retries_used))
    }

    fn complete_multipart(&self, url_path: &str, upload_id: &str, etags: &[String]) -> Result<String, TransferError> {
        let doc = xml::CompleteMultipartUpload {
            parts: etags
                .iter()
                .enumerate()
                .map(|(i, etag)| xml::CompletedPart {
                    part_number: (i + 1) as u32,
                    etag: etag.clone(),
                })
                .collect(),
        };
        let body = xml::serialize_complete_multipart(&doc)
            .map_err(|reason| TransferError::UploadAborted { reason })?
            .into_bytes();

        let url_path = url_path.to_string();
        let query = format!("uploadId={upload_id}");
        let response: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
        let response_clone = response.clone();

        let status = self.pool.call(
            Priority::PrReq1,
            Box::new(move |req: &mut Request| {
                req.init("POST");
                req.set_url(&format!("/{url_path}"), Some(&query));
                req.set_input_buffer(body.clone());
                match req.run(30) {
                    Ok(()) if req.response_code == 200 => {
                        *response_clone.lock().unwrap() = req.response_body.clone();
                        0
                    }
                    _ => -libc::EIO,
                }
            }),
        );

        if status != 0 {
            self.abort_multipart(url_path.as_str(), upload_id);
            return Err(TransferError::UploadAborted {
                reason: "complete-multipart-upload request failed".to_string(),
            });
        }

        let response = response.lock().unwrap();
        Ok(xml::parse_complete_multipart(&response)?.etag.trim_matches('"').to_string())
    }

    fn abort_multipart(&self, url_path: &str, upload_id: &str) {
        let url_path = url_path.to_string();
        let query = format!("uploadId={upload_id}");
        self.pool.call(
            Priority::PrReq1,
            Box::new(move |req: &mut Request| {
                req.init("DELETE");
                req.set_url(&format!("/{url_path}"), Some(&query));
                let _ = req.run(30);
                0
            }),
        );
    }

    /// Google Storage's resumable-upload protocol: a `start`-flagged POST
    /// negotiates a one-time session URI (returned as `Location`), then the
    /// body is PUT to that URI in chunks, each announcing its byte range via
    /// `Content-Range`. The server replies `308 Resume Incomplete` for every
    /// chunk but the last, so uploads can resume after a dropped connection
    /// without re-sending bytes already accepted — a different shape from
    /// S3's multipart (parts committed independently, completed by listing
    /// etags) but serving the same "large upload, retryable in pieces" need.
    fn upload_resumable_gs(
        &self,
        url_path: &str,
        size: u64,
        scratch: &File,
        encryption: Option<&EncryptionContext>,
        metadata: &BTreeMap<String, String>,
    ) -> Result<String, TransferError> {
        let session_url = self.start_resumable_session(url_path, size, metadata)?;
        let chunk = self.upload_chunk_size;
        let part_count = size.div_ceil(chunk) as usize;
        let mut etag = String::new();

        for part in 0..part_count {
            let offset = part as u64 * chunk;
            let part_size = chunk.min(size - offset);
            let mut buf = vec![0u8; part_size as usize];
            scratch.read_exact_at(&mut buf, offset)?;
            if let Some(ctx) = encryption {
                crypto::encrypt_at(&ctx.key, &ctx.iv, offset, &mut buf)
                    .expect("ctr encryption is infallible for valid keys");
            }
            if let Some(final_etag) = self.upload_resumable_chunk(&session_url, offset, buf, size)? {
                etag = final_etag;
            }
        }

        self.stats.record_bytes_uploaded(size);
        Ok(etag)
    }

    fn start_resumable_session(
        &self,
        url_path: &str,
        size: u64,
        metadata: &BTreeMap<String, String>,
    ) -> Result<String, TransferError> {
        let url_path = url_path.to_string();
        let meta_headers = self.meta_headers(metadata);
        let location: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
        let location_clone = location.clone();
        let status = self.pool.call(
            Priority::PrReq1,
            Box::new(move |req: &mut Request| {
                req.init("POST");
                req.set_url(&format!("/{url_path}"), Some("uploadType=resumable"));
                req.set_header("x-goog-resumable", "start");
                req.set_header("content-length", "0");
                req.set_header("x-upload-content-length", &size.to_string());
                for (k, v) in &meta_headers {
                    req.set_header(k, v);
                }
                match req.run(30) {
                    Ok(()) if req.response_code == 200 => {
                        *location_clone.lock().unwrap() = req.response_header("location").map(str::to_string);
                        0
                    }
                    _ => -libc::EIO,
                }
            }),
        );
        if status != 0 {
            return Err(TransferError::UnexpectedStatus {
                status: 0,
                what: "start resumable session",
            });
        }
        location.lock().unwrap().clone().ok_or(TransferError::UnexpectedStatus {
            status: 0,
            what: "resumable session response missing Location header",
        })
    }

    /// PUTs one chunk to the session URI negotiated by
    /// [`Self::start_resumable_session`]. Returns `Some(etag)` once the
    /// server reports the upload complete (`200`/`201`), `None` while it's
    /// still asking for more chunks (`308`).
    fn upload_resumable_chunk(
        &self,
        session_url: &str,
        offset: u64,
        buf: Vec<u8>,
        total_size: u64,
    ) -> Result<Option<String>, TransferError> {
        let session_url = session_url.to_string();
        let end = offset + buf.len() as u64 - 1;
        let content_range = format!("bytes {offset}-{end}/{total_size}");
        let result: Arc<Mutex<(u16, Option<String>)>> = Arc::new(Mutex::new((0, None)));
        let result_clone = result.clone();
        let status = self.pool.call(
            Priority::PrReq1,
            Box::new(move |req: &mut Request| {
                req.init("PUT");
                req.set_absolute_url(&session_url);
                req.set_header("content-range", &content_range);
                req.set_input_buffer(buf.clone());
                match req.run(30) {
                    Ok(()) => {
                        let etag = req.response_header("etag").map(|v| v.trim_matches('"').to_string());
                        *result_clone.lock().unwrap() = (req.response_code, etag);
                        0
                    }
                    Err(_) => -libc::EIO,
                }
            }),
        );
        if status != 0 {
            return Err(TransferError::UnexpectedStatus {
                status: 0,
                what: "resumable chunk upload",
            });
        }
        let (code, etag) = result.lock().unwrap().clone();
        match code {
            308 => Ok(None),
            200 | 201 => Ok(Some(etag.unwrap_or_default())),
            other => Err(TransferError::UnexpectedStatus {
                status: other,
                what: "resumable chunk upload",
            }),
        }
    }
}

fn decrypt_range_in_place(scratch: &File, offset: u64, size: u64, key: &Key, iv: &[u8; 16]) -> Result<(), TransferError> {
    let mut buf = vec![0u8; size as usize];
    scratch.read_exact_at(&mut buf, offset)?;
    crypto::decrypt_at(key, iv, offset, &mut buf).expect("ctr decryption is infallible for valid keys");
    scratch.write_all_at(&buf, offset)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ledger_tracks_per_part_status_independently() {
        let ledger = MultipartLedger::new(3);
        ledger.mark(0, PartStatus::Done);
        ledger.mark(1, PartStatus::Failed);
        assert_eq!(ledger.status(0), PartStatus::Done);
        assert_eq!(ledger.status(1), PartStatus::Failed);
        assert_eq!(ledger.status(2), PartStatus::Pending);
    }

    #[test]
    fn ledger_retry_count_increments() {
        let ledger = MultipartLedger::new(1);
        assert_eq!(ledger.bump_retry(0), 1);
        assert_eq!(ledger.bump_retry(0), 2);
    }

    #[test]
    fn ledger_total_retries_sums_across_parts() {
        let ledger = MultipartLedger::new(3);
        ledger.bump_retry(0);
        ledger.bump_retry(0);
        ledger.bump_retry(2);
        assert_eq!(ledger.total_retries(), 3);
    }
}
