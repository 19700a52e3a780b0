//! Directory operations: paginated listing, emptiness/removal semantics for
//! the placeholder-key convention, and the parallel copy-then-delete rename
//! pipeline.

use s3fs_worker::{Pool, Priority, Request};
use tracing::instrument;

use crate::cache::Cache;
use crate::error::DirectoryError;
use crate::xml::{self, ListBucketResult};

const MAX_KEYS_DEFAULT: u32 = 1000;

pub struct DirectoryOps<'a> {
    pub pool: &'a Pool,
    pub cache: &'a Cache,
}

/// One page of a directory listing.
pub struct Page {
    pub files: Vec<String>,
    pub subdirs: Vec<String>,
    pub next_marker: Option<String>,
}

impl<'a> DirectoryOps<'a> {
    fn list_page(&self, path: &str, marker: Option<&str>, max_keys: u32) -> Result<ListBucketResult, DirectoryError> {
        let prefix = if path.is_empty() { String::new() } else { format!("{path}/") };
        let mut query = format!("prefix={prefix}&delimiter=/&max-keys={max_keys}");
        if let Some(m) = marker {
            query.push_str(&format!("&marker={m}"));
        }

        let body = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let body_clone = body.clone();
        let status = self.pool.call(
            Priority::Pr0,
            Box::new(move |req: &mut Request| {
                req.init("GET");
                req.set_url("/", Some(&query));
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
            return Err(DirectoryError::RequestFailed(status));
        }

        let body = body.lock().unwrap();
        Ok(xml::parse_listing(&body)?)
    }

    /// Reads every page of `path`'s listing, yielding child file and
    /// subdirectory names (prefix already stripped) via `filler`.
    #[instrument(skip(self, filler))]
    pub fn read(&self, path: &str, mut filler: impl FnMut(&str, bool)) -> Result<(), DirectoryError> {
        let prefix = if path.is_empty() { String::new() } else { format!("{path}/") };
        let mut marker = None;

        loop {
            let listing = self.list_page(path, marker.as_deref(), MAX_KEYS_DEFAULT)?;

            for entry in &listing.contents {
                if let Some(name) = entry.key.strip_prefix(&prefix) {
                    if !name.is_empty() {
                        filler(name, false);
                    }
                }
            }
            for entry in &listing.common_prefixes {
                if let Some(name) = entry.prefix.strip_prefix(&prefix) {
                    let name = name.trim_end_matches('/');
                    if !name.is_empty() {
                        filler(name, true);
                    }
                }
            }

            if !listing.is_truncated {
                break;
            }
            marker = listing.next_marker;
            if marker.is_none() {
                break;
            }
        }

        Ok(())
    }

    /// Empty iff the listing returns at most one key — the directory's own
    /// placeholder. Zero keys (a directory created out-of-band, with no
    /// placeholder) is also empty; only two-or-more keys means non-empty.
    pub fn is_empty(&self, path: &str) -> Result<bool, DirectoryError> {
        let listing = self.list_page(path, None, 2)?;
        let total = listing.contents.len() + listing.common_prefixes.len();
        Ok(total <= 1)
    }

    /// Deletes the placeholder key. If no placeholder exists (the zero-key
    /// case `is_empty` already tolerates), there is nothing to delete and
    /// this succeeds without issuing a request.
    pub fn remove(&self, path: &str) -> Result<(), DirectoryError> {
        if !self.is_empty(path)? {
            return Err(DirectoryError::NotEmpty);
        }

        let listing = self.list_page(path, None, 2)?;
        if listing.contents.is_empty() {
            return Ok(());
        }

        let placeholder = format!("{path}/");
        let status = self.pool.call(Priority::Pr0, {
            Box::new(move |req: &mut Request| {
                req.init("DELETE");
                req.set_url(&format!("/{placeholder}"), None);
                match req.run(30) {
                    Ok(()) if matches!(req.response_code, 200 | 204 | 404) => 0,
                    _ => -libc::EIO,
                }
            })
        });
        if status != 0 {
            return Err(DirectoryError::RequestFailed(status));
        }
        self.cache.remove(path);
        Ok(())
    }

    /// Copies every descendant of `from` to `to`, then deletes the
    /// originals. Cache invalidation happens only after the destination
    /// path is fully computed and the copy for that entry has been issued —
    /// never against a not-yet-assigned binding.
    #[instrument(skip(self))]
    pub fn rename(&self, from: &str, to: &str) -> Result<(), DirectoryError> {
        if from.is_empty() {
            return Err(DirectoryError::RenameRoot);
        }

        let mut keys = Vec::new();
        let prefix = format!("{from}/");
        let mut marker = None;
        loop {
            let listing = self.list_page(from, marker.as_deref(), MAX_KEYS_DEFAULT)?;
            keys.extend(listing.contents.iter().map(|c| c.key.clone()));
            if !listing.is_truncated {
                break;
            }
            marker = listing.next_marker;
            if marker.is_none() {
                break;
            }
        }
        keys.push(prefix.clone());

        let mut destinations = Vec::with_capacity(keys.len());
        let mut handles = Vec::with_capacity(keys.len());
        for source_key in &keys {
            let suffix = source_key.strip_prefix(&prefix).unwrap_or(source_key);
            let dest_key = format!("{to}/{suffix}");
            destinations.push(dest_key.clone());

            let source_key = source_key.clone();
            handles.push(self.pool.post(
                Priority::PrReq1,
                Box::new(move |req: &mut Request| {
                    req.init("PUT");
                    req.set_url(&format!("/{dest_key}"), None);
                    req.set_header("x-amz-copy-source", &format!("/{source_key}"));
                    match req.run(30) {
                        Ok(()) if req.response_code == 200 => 0,
                        _ => -libc::EIO,
                    }
                }),
            ));
        }

        let mut first_failure = 0;
        for handle in handles {
            let status = handle.wait();
            if status != 0 && first_failure == 0 {
                first_failure = status;
            }
        }

        // Destination paths are now fully bound — safe to invalidate.
        self.cache.invalidate_parent(from);
        self.cache.invalidate_parent(to);

        if first_failure != 0 {
            return Err(DirectoryError::PartialRename(keys.len(), keys.len()));
        }

        let delete_handles: Vec<_> = keys
            .iter()
            .map(|key| {
                let key = key.clone();
                self.pool.post(
                    Priority::PrReq1,
                    Box::new(move |req: &mut Request| {
                        req.init("DELETE");
                        req.set_url(&format!("/{key}"), None);
                        match req.run(30) {
                            Ok(()) if matches!(req.response_code, 200 | 204 | 404) => 0,
                            _ => -libc::EIO,
                        }
                    }),
                )
            })
            .collect();

        let mut delete_failure = 0;
        for handle in delete_handles {
            let status = handle.wait();
            if status != 0 && delete_failure == 0 {
                delete_failure = status;
            }
        }

        let _ = destinations;
        if delete_failure != 0 {
            return Err(DirectoryError::PartialRename(0, keys.len()));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_keys_default_is_one_page() {
        assert_eq!(MAX_KEYS_DEFAULT, 1000);
    }
}
