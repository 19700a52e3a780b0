//! The authenticated HTTP request/response primitive (layer L0).
//!
//! One `Request` is owned by one worker for its entire lifetime (see
//! [`crate::Pool`]): `init` resets it for reuse instead of allocating a new
//! one per call, so the underlying `reqwest::blocking::Client` (and its
//! connection pool / TLS session cache) survives across requests.

use std::collections::BTreeMap;
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::signing::{self, SigningInput};

/// Shared, lock-free timeout bookkeeping for one `Request`.
///
/// Split out from `Request` itself so the pool's watchdog can hold an
/// `Arc<TimeoutState>` and poll `check_timeout` from another thread while
/// `Request::run` is blocked inside a synchronous HTTP call — sharing the
/// whole `Request` would require a lock that `run` holds for the entire
/// call, defeating the point of an out-of-band watchdog.
#[derive(Default)]
pub struct TimeoutState {
    started_at_ms: AtomicU64,
    timeout_ms: AtomicU64,
}

impl TimeoutState {
    fn start(&self, timeout: Duration) {
        self.timeout_ms.store(timeout.as_millis() as u64, Ordering::Relaxed);
        self.started_at_ms.store(now_ms(), Ordering::Relaxed);
    }

    fn stop(&self) {
        self.started_at_ms.store(0, Ordering::Relaxed);
    }

    pub fn check_timeout(&self) -> bool {
        let started = self.started_at_ms.load(Ordering::Relaxed);
        if started == 0 {
            return false;
        }
        let bound = self.timeout_ms.load(Ordering::Relaxed);
        now_ms().saturating_sub(started) > bound
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("scratch file I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid header value {0:?}")]
    InvalidHeader(String),
}

/// Where the response body lands.
pub enum OutputMode {
    /// Accumulate into memory — used for HEAD responses and small GETs.
    Buffer,
    /// Write at `offset` into an already-open file — used for multipart
    /// download parts, which complete out of order at disjoint offsets.
    File { file: File, offset: u64 },
}

impl Default for OutputMode {
    fn default() -> Self {
        OutputMode::Buffer
    }
}

/// A credentials signer: given the pieces of the canonical string and the
/// header namespace, produces the secret-derived signature and the
/// `Authorization` header value to send. `S3Signer`/`GsSigner` in
/// `s3fs-core` implement this against their respective header prefixes.
pub trait Signer: Send + Sync {
    fn header_prefix(&self) -> &str;
    fn authorization_header(&self, headers: &BTreeMap<String, String>, input: &SigningInput<'_>) -> String;
}

/// A generic AWS-style (`"AWS " + key + ":" + signature`) signer. Both the
/// S3 and Google Storage XML-API backends use this scheme; only the header
/// prefix and the scheme keyword differ, so `scheme` and `prefix` are
/// parameters rather than separate types.
pub struct HmacSigner {
    pub scheme: &'static str,
    pub access_key: String,
    pub secret_key: String,
    pub prefix: &'static str,
}

impl Signer for HmacSigner {
    fn header_prefix(&self) -> &str {
        self.prefix
    }

    fn authorization_header(&self, headers: &BTreeMap<String, String>, input: &SigningInput<'_>) -> String {
        let signature = signing::sign(&self.secret_key, headers, self.prefix, input);
        format!("{} {}:{}", self.scheme, self.access_key, signature)
    }
}

/// One authenticated HTTP request, reusable across calls via [`Request::init`].
pub struct Request {
    client: reqwest::blocking::Client,
    signer: std::sync::Arc<dyn Signer>,
    url_prefix: String,

    method: String,
    url: String,
    path: String,
    headers: BTreeMap<String, String>,
    input_buffer: Vec<u8>,
    output_mode: OutputMode,

    pub response_code: u16,
    pub response_headers: BTreeMap<String, String>,
    pub response_body: Vec<u8>,

    timeout_state: Arc<TimeoutState>,
}

impl Request {
    pub fn new(client: reqwest::blocking::Client, signer: std::sync::Arc<dyn Signer>, url_prefix: String) -> Self {
        Self {
            client,
            signer,
            url_prefix,
            method: String::new(),
            url: String::new(),
            path: String::new(),
            headers: BTreeMap::new(),
            input_buffer: Vec::new(),
            output_mode: OutputMode::Buffer,
            response_code: 0,
            response_headers: BTreeMap::new(),
            response_body: Vec::new(),
            timeout_state: Arc::new(TimeoutState::default()),
        }
    }

    /// A cloneable handle a watchdog can poll without touching `Request`'s
    /// own (thread-confined) mutable state.
    pub fn timeout_handle(&self) -> Arc<TimeoutState> {
        self.timeout_state.clone()
    }

    /// Resets all mutable state for a new call. Must be called before every
    /// `run` — nothing from the previous call is allowed to leak.
    pub fn init(&mut self, method: &str) {
        self.method.clear();
        self.method.push_str(method);
        self.url.clear();
        self.path.clear();
        self.headers.clear();
        self.input_buffer.clear();
        self.output_mode = OutputMode::Buffer;
        self.response_code = 0;
        self.response_headers.clear();
        self.response_body.clear();
        self.timeout_state.stop();
    }

    pub fn set_url(&mut self, path: &str, query: Option<&str>) {
        self.path = path.to_string();
        self.url = format!("{}{}", self.url_prefix, path);
        if let Some(q) = query {
            self.url.push('?');
            self.url.push_str(q);
        }
    }

    /// Targets a full URL returned by the server itself (e.g. a GS resumable
    /// session's `Location` header) instead of one composed from
    /// `url_prefix` + a bucket-relative path. The signer still signs against
    /// `path`, so callers that need a signed request against an absolute URL
    /// must derive `path` separately; GS resumable chunk PUTs don't sign at
    /// all past session start, so this is used unsigned in practice.
    pub fn set_absolute_url(&mut self, url: &str) {
        self.url = url.to_string();
    }

    /// Headers are case-insensitive on the wire; we normalize to lowercase
    /// so later lookups and the signer's prefix scan don't need to.
    pub fn set_header(&mut self, key: &str, value: &str) {
        self.headers.insert(key.to_ascii_lowercase(), value.to_string());
    }

    pub fn set_input_buffer(&mut self, bytes: Vec<u8>) {
        self.input_buffer = bytes;
    }

    pub fn set_output_mode(&mut self, mode: OutputMode) {
        self.output_mode = mode;
    }

    pub fn response_header(&self, key: &str) -> Option<&str> {
        self.response_headers.get(&key.to_ascii_lowercase()).map(String::as_str)
    }

    /// Signs, transmits, and awaits the reply, populating `response_code`,
    /// `response_headers`, and either `response_body` or the configured
    /// output file. `timeout_seconds` both bounds the HTTP call and is the
    /// value `check_timeout` compares the elapsed time against.
    pub fn run(&mut self, timeout_seconds: u64) -> Result<(), RequestError> {
        let timeout = Duration::from_secs(timeout_seconds);

        let date = httpdate::fmt_http_date(SystemTime::now());
        self.set_header("date", &date);

        let content_md5 = self.headers.get("content-md5").cloned().unwrap_or_default();
        let content_type = self.headers.get("content-type").cloned().unwrap_or_default();

        let signing_input = SigningInput {
            method: &self.method,
            content_md5: &content_md5,
            content_type: &content_type,
            date: &date,
            path: &self.path,
        };
        let authorization = self.signer.authorization_header(&self.headers, &signing_input);
        self.set_header("authorization", &authorization);

        self.timeout_state.start(timeout);

        let method = reqwest::Method::from_bytes(self.method.as_bytes())
            .map_err(|_| RequestError::InvalidHeader(self.method.clone()))?;
        let mut builder = self.client.request(method, &self.url).timeout(timeout);
        for (k, v) in &self.headers {
            if k == "authorization" || k == "date" {
                continue; // set explicitly below so casing matches the wire format services expect
            }
            builder = builder.header(k.as_str(), v.as_str());
        }
        builder = builder
            .header("Date", date.as_str())
            .header("Authorization", authorization.as_str());
        if !self.input_buffer.is_empty() {
            builder = builder.body(self.input_buffer.clone());
        }

        let result = builder.send();
        self.timeout_state.stop();
        let response = result?;

        self.response_code = response.status().as_u16();
        for (name, value) in response.headers() {
            if let Ok(v) = value.to_str() {
                self.response_headers.insert(name.as_str().to_ascii_lowercase(), v.to_string());
            }
        }

        let body = response.bytes()?;
        match &mut self.output_mode {
            OutputMode::Buffer => self.response_body = body.to_vec(),
            OutputMode::File { file, offset } => {
                file.write_all_at(&body, *offset)?;
            }
        }

        Ok(())
    }

    /// Observable predicate used by the pool's watchdog: has this request
    /// been inside `run` longer than its bound? Safe to call from any
    /// thread while another thread is blocked inside `run`.
    pub fn check_timeout(&self) -> bool {
        self.timeout_state.check_timeout()
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn test_request() -> Request {
        let signer = Arc::new(HmacSigner {
            scheme: "AWS",
            access_key: "AKIDEXAMPLE".to_string(),
            secret_key: "secret".to_string(),
            prefix: "x-amz-",
        });
        Request::new(
            reqwest::blocking::Client::new(),
            signer,
            "https://example-bucket.s3.amazonaws.com".to_string(),
        )
    }

    #[test]
    fn init_clears_prior_state() {
        let mut req = test_request();
        req.init("GET");
        req.set_header("x-amz-meta-foo", "bar");
        req.response_code = 200;
        req.response_body = vec![1, 2, 3];

        req.init("PUT");
        assert_eq!(req.method, "PUT");
        assert!(req.headers.is_empty());
        assert_eq!(req.response_code, 0);
        assert!(req.response_body.is_empty());
    }

    #[test]
    fn set_url_composes_prefix_and_query() {
        let mut req = test_request();
        req.init("GET");
        req.set_url("/a/b.txt", Some("max-keys=2"));
        assert_eq!(req.url, "https://example-bucket.s3.amazonaws.com/a/b.txt?max-keys=2");
    }

    #[test]
    fn headers_normalize_to_lowercase() {
        let mut req = test_request();
        req.init("GET");
        req.set_header("X-Amz-Meta-Foo", "bar");
        assert_eq!(req.headers.get("x-amz-meta-foo"), Some(&"bar".to_string()));
    }

    #[test]
    fn check_timeout_false_when_idle() {
        let req = test_request();
        assert!(!req.check_timeout());
    }

    #[test]
    fn set_absolute_url_bypasses_the_url_prefix() {
        let mut req = test_request();
        req.init("PUT");
        req.set_absolute_url("https://upload.example.com/session/abc123");
        assert_eq!(req.url, "https://upload.example.com/session/abc123");
    }
}
