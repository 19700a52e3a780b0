//! The bounded object metadata cache: LRU by path, single-flight HEADs,
//! negative caching for 404s.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use lru::LruCache;
use s3fs_worker::{Attach, Pool, Priority, Request, SingleFlight};
use tracing::instrument;

use crate::adapter::ServiceAdapter;
use crate::error::{CacheError, ToErrno};
use crate::object::Object;
use crate::stats::Stats;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hint {
    IsDir,
    IsFile,
    None,
}

pub struct Cache {
    entries: Mutex<LruCache<String, Arc<Mutex<Object>>>>,
    single_flight: SingleFlight<String, Result<Arc<Mutex<Object>>, i32>>,
    stats: Arc<Stats>,
}

impl Cache {
    pub fn new(capacity: usize, stats: Arc<Stats>) -> Self {
        let capacity = std::num::NonZeroUsize::new(capacity.max(1)).unwrap();
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            single_flight: SingleFlight::new(),
            stats,
        }
    }

    /// Convenience wrapper around [`Self::fetch`] that discards the
    /// not-found/error distinction callers that only want a hit-or-miss view
    /// don't need.
    pub fn get(&self, pool: &Pool, adapter: &dyn ServiceAdapter, path: &str) -> Option<Arc<Mutex<Object>>> {
        self.fetch(pool, adapter, path, Hint::None).ok()
    }

    /// Returns the cached entry for `path`, fetching it with a single HEAD
    /// (or two, on a hint miss) if absent. Concurrent fetches for the same
    /// path share one in-flight request — losing racers adopt the winner's
    /// result rather than issuing their own HEAD.
    #[instrument(skip(self, pool, adapter), fields(path))]
    pub fn fetch(
        &self,
        pool: &Pool,
        adapter: &dyn ServiceAdapter,
        path: &str,
        hint: Hint,
    ) -> Result<Arc<Mutex<Object>>, i32> {
        if let Some(entry) = self.entries.lock().unwrap().get(path) {
            self.stats.record_cache_hit();
            if entry.lock().unwrap().not_found {
                return Err(-libc::ENOENT);
            }
            return Ok(entry.clone());
        }

        self.stats.record_cache_miss();

        match self.single_flight.attach(path.to_string()) {
            Attach::Leader => {
                self.stats.record_single_flight_leader();
                let result = head_object(pool, adapter, path, hint).map(Arc::new);
                self.single_flight.publish(&path.to_string(), result.clone());
                if let Ok(obj) = &result {
                    self.entries.lock().unwrap().put(path.to_string(), obj.clone());
                }
                match result {
                    Ok(obj) => {
                        if obj.lock().unwrap().not_found {
                            Err(-libc::ENOENT)
                        } else {
                            Ok(obj)
                        }
                    }
                    Err(status) => Err(status),
                }
            }
            waiter @ Attach::Waiter(_) => {
                self.stats.record_single_flight_waiter();
                waiter.wait_blocking().unwrap_or(Err(-libc::EIO))
            }
        }
    }

    /// Fetches `path` immediately after a create/PUT against it, retrying
    /// with a linear backoff if the object briefly isn't HEAD-able yet — a
    /// real object store's read-after-write consistency window, narrow but
    /// not always zero. Gives up after `max_retries` attempts with
    /// [`CacheError::Inconsistent`] rather than looping forever; any other
    /// fetch failure is returned immediately, unretried.
    pub fn fetch_after_create(
        &self,
        pool: &Pool,
        adapter: &dyn ServiceAdapter,
        path: &str,
        max_retries: u32,
    ) -> Result<Arc<Mutex<Object>>, i32> {
        for attempt in 0..=max_retries {
            match self.fetch(pool, adapter, path, Hint::IsFile) {
                Ok(obj) => return Ok(obj),
                Err(status) if status == -libc::ENOENT && attempt < max_retries => {
                    self.remove(path);
                    std::thread::sleep(Duration::from_millis(50 * u64::from(attempt + 1)));
                }
                Err(status) => return Err(status),
            }
        }
        Err(CacheError::Inconsistent {
            path: path.to_string(),
            attempts: max_retries + 1,
        }
        .to_errno())
    }

    pub fn remove(&self, path: &str) {
        self.entries.lock().unwrap().pop(path);
    }

    /// Invalidates the cache entry for `path`'s parent directory — required
    /// before any mutation that would change what a future HEAD of the
    /// parent's listing would return.
    pub fn invalidate_parent(&self, path: &str) {
        if let Some((parent, _)) = path.rsplit_once('/') {
            self.remove(parent);
        } else if !path.is_empty() {
            self.remove("");
        }
    }
}

fn head_object(
    pool: &Pool,
    adapter: &dyn ServiceAdapter,
    path: &str,
    hint: Hint,
) -> Result<Object, i32> {
    let (first, second): (String, Option<String>) = match hint {
        Hint::IsFile => (path.to_string(), Some(format!("{path}/"))),
        Hint::IsDir | Hint::None => (format!("{path}/"), Some(path.to_string())),
    };

    if let Some(obj) = probe(pool, adapter, path, &first)? {
        return Ok(obj);
    }
    if let Some(probe_path) = second {
        if let Some(obj) = probe(pool, adapter, path, &probe_path)? {
            return Ok(obj);
        }
    }
    Ok(Object::not_found(path.to_string()))
}

fn probe(pool: &Pool, adapter: &dyn ServiceAdapter, logical_path: &str, probe_url_path: &str) -> Result<Option<Object>, i32> {
    let url_path = probe_url_path.to_string();
    let logical = logical_path.to_string();
    let headers: Arc<Mutex<BTreeMap<String, String>>> = Arc::new(Mutex::new(BTreeMap::new()));
    let headers_out = headers.clone();
    let status = pool.call(
        Priority::Pr0,
        Box::new(move |req: &mut Request| {
            req.init("HEAD");
            req.set_url(&format!("/{url_path}"), None);
            match req.run(30) {
                Ok(()) => {
                    *headers_out.lock().unwrap() = req.response_headers.clone();
                    req.response_code as i32
                }
                Err(_) => -1,
            }
        }),
    );

    if status == 200 {
        let headers = headers.lock().unwrap();
        Ok(Some(adapter.object_from_probe(&logical, probe_url_path, &headers)))
    } else if status == 404 {
        Ok(None)
    } else {
        Err(-libc::EIO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_cache_starts_empty() {
        let cache = Cache::new(4, Arc::new(Stats::default()));
        assert!(cache.entries.lock().unwrap().is_empty());
    }

    #[test]
    fn invalidate_parent_strips_last_segment() {
        let cache = Cache::new(4, Arc::new(Stats::default()));
        cache
            .entries
            .lock()
            .unwrap()
            .put("a/b".to_string(), Arc::new(Mutex::new(Object::not_found("a/b".to_string()))));
        cache.invalidate_parent("a/b/c");
        assert!(cache.entries.lock().unwrap().get("a/b").is_none());
    }

    #[test]
    fn a_cache_hit_is_recorded_in_shared_stats() {
        let stats = Arc::new(Stats::default());
        let cache = Cache::new(4, stats.clone());
        cache
            .entries
            .lock()
            .unwrap()
            .put("a".to_string(), Arc::new(Mutex::new(Object::not_found("a".to_string()))));

        let pool = unreachable_pool();
        let adapter = unreachable_adapter();
        let _ = cache.fetch(&pool, &adapter, "a", Hint::None);

        assert_eq!(stats.snapshot().cache_hits, 1);
    }

    fn unreachable_pool() -> Pool {
        Pool::new(s3fs_worker::PoolConfig {
            workers_per_priority: 1,
            queue_capacity: 1,
            request_timeout_seconds: 1,
            watchdog_interval: Duration::from_secs(60),
            client_factory: Arc::new(|| {
                let signer = Arc::new(s3fs_worker::HmacSigner {
                    scheme: "AWS",
                    access_key: "AKID".to_string(),
                    secret_key: "secret".to_string(),
                    prefix: "x-amz-",
                });
                Request::new(reqwest::blocking::Client::new(), signer, "https://example.invalid".to_string())
            }),
        })
    }

    fn unreachable_adapter() -> crate::adapter::S3Adapter {
        crate::adapter::S3Adapter {
            bucket_name: "b".to_string(),
            access_key_id: "k".to_string(),
            secret_access_key: "s".to_string(),
            url_prefix: "https://example.invalid".to_string(),
        }
    }
}
