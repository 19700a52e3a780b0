//! The bounded, priority-aware worker pool (layer L1).
//!
//! A fixed number of OS threads per priority pull work items off their
//! queue and run them against a long-lived [`Request`]. A dedicated
//! watchdog thread periodically calls `check_timeout` on every worker's
//! current request; a worker stuck past its bound gets its handle completed
//! with `-ETIMEDOUT` and a replacement worker is spawned in its place. This
//! mirrors a simple polling watchdog rather than a deadline-heap scheduler —
//! the pool is a small fixed set of workers, not an arbitrary number of
//! outstanding deadlines, so a periodic scan is the right amount of
//! machinery.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::handle::AsyncHandle;
use crate::queue::Queues;
use crate::request::{Request, TimeoutState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    /// Ordinary traffic: metadata lookups, small reads and writes.
    Pr0,
    /// Traffic that must not queue behind `Pr0` work — e.g. the part of a
    /// rename pipeline's retry budget, or requests issued while holding a
    /// lock other callers are waiting on.
    PrReq1,
}

impl Priority {
    pub const COUNT: usize = 2;

    pub fn index(self) -> usize {
        match self {
            Priority::Pr0 => 0,
            Priority::PrReq1 => 1,
        }
    }
}

/// A unit of work: given the worker's long-lived `Request`, do something
/// with it and return a status (an errno-style `i32`, 0 for success).
pub type WorkFn = Box<dyn FnOnce(&mut Request) -> i32 + Send + 'static>;

pub(crate) struct WorkItem {
    pub(crate) work: WorkFn,
    pub(crate) handle: AsyncHandle,
}

pub struct PoolConfig {
    pub workers_per_priority: usize,
    pub queue_capacity: usize,
    pub request_timeout_seconds: u64,
    pub watchdog_interval: Duration,
    /// Builds one worker's long-lived `Request` (client, signer, url
    /// prefix). Called once per worker thread, including replacements.
    pub client_factory: Arc<dyn Fn() -> Request + Send + Sync>,
}

#[derive(Default)]
struct Slot {
    current: Mutex<Option<(Arc<TimeoutState>, AsyncHandle)>>,
    retired: AtomicBool,
}

type Registry = Arc<Mutex<Vec<(Priority, Arc<Slot>)>>>;

pub struct Pool {
    queues: Arc<Queues>,
    #[allow(dead_code)]
    registry: Registry,
    config: Arc<PoolConfig>,
}

impl Pool {
    pub fn new(config: PoolConfig) -> Self {
        let config = Arc::new(config);
        let queues = Arc::new(Queues::new(config.queue_capacity));
        let registry: Registry = Arc::new(Mutex::new(Vec::new()));

        for priority in [Priority::Pr0, Priority::PrReq1] {
            for _ in 0..config.workers_per_priority {
                spawn_worker(priority, queues.clone(), registry.clone(), config.clone());
            }
        }

        std::thread::spawn({
            let queues = queues.clone();
            let registry = registry.clone();
            let config = config.clone();
            move || watchdog_loop(registry, queues, config)
        });

        Self {
            queues,
            registry,
            config,
        }
    }

    /// Enqueues `work` at `priority` and returns immediately with a handle
    /// the caller can wait on. Blocks the *poster* if that priority's queue
    /// is already full — this is by design, not a bug: a bounded queue is
    /// what keeps an overloaded backend from turning into unbounded memory
    /// growth.
    pub fn post(&self, priority: Priority, work: WorkFn) -> AsyncHandle {
        let handle = AsyncHandle::new();
        let item = WorkItem {
            work,
            handle: handle.clone(),
        };
        self.queues
            .sender(priority)
            .send(item)
            .expect("worker pool queue disconnected: all workers exited");
        handle
    }

    /// Enqueues `work` and blocks until it completes, returning its status.
    pub fn call(&self, priority: Priority, work: WorkFn) -> i32 {
        self.post(priority, work).wait()
    }

    pub fn request_timeout_seconds(&self) -> u64 {
        self.config.request_timeout_seconds
    }

    pub fn queue_depth(&self, priority: Priority) -> usize {
        self.queues.depth(priority)
    }
}

fn spawn_worker(priority: Priority, queues: Arc<Queues>, registry: Registry, config: Arc<PoolConfig>) {
    let slot = Arc::new(Slot::default());
    registry.lock().expect("registry poisoned").push((priority, slot.clone()));
    let receiver = queues.receiver(priority);

    let respawn_queues = queues.clone();
    let respawn_registry = registry.clone();
    let respawn_config = config.clone();

    std::thread::spawn(move || {
        let mut request = (config.client_factory)();
        loop {
            let item = match receiver.recv() {
                Ok(item) => item,
                Err(_) => break,
            };

            *slot.current.lock().expect("slot poisoned") = Some((request.timeout_handle(), item.handle.clone()));
            let work = item.work;
            let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| work(&mut request)));
            *slot.current.lock().expect("slot poisoned") = None;

            let status = match outcome {
                Ok(status) => status,
                Err(payload) => {
                    tracing::error!(?priority, "worker pool item panicked, completing with -ECANCELED");
                    drop(payload);
                    item.handle.complete(-libc::ECANCELED);
                    slot.retired.store(true, Ordering::Relaxed);
                    spawn_worker(priority, respawn_queues, respawn_registry, respawn_config);
                    break;
                }
            };
            item.handle.complete(status);

            if slot.retired.load(Ordering::Relaxed) {
                break;
            }
        }
    });
}

fn watchdog_loop(registry: Registry, queues: Arc<Queues>, config: Arc<PoolConfig>) {
    loop {
        std::thread::sleep(config.watchdog_interval);

        let entries: Vec<(Priority, Arc<Slot>)> = registry.lock().expect("registry poisoned").clone();
        for (priority, slot) in &entries {
            let timed_out_handle = {
                let current = slot.current.lock().expect("slot poisoned");
                current.as_ref().and_then(|(timeout_state, handle)| {
                    if timeout_state.check_timeout() {
                        Some(handle.clone())
                    } else {
                        None
                    }
                })
            };

            if let Some(handle) = timed_out_handle {
                // `complete` is idempotent: if the worker finished between our
                // check and here, this is a silent no-op and no replacement
                // is spawned.
                if handle.complete(-(libc::ETIMEDOUT)) {
                    slot.retired.store(true, Ordering::Relaxed);
                    spawn_worker(*priority, queues.clone(), registry.clone(), config.clone());
                }
            }
        }

        let mut registry = registry.lock().expect("registry poisoned");
        registry.retain(|(_, slot)| {
            !(slot.retired.load(Ordering::Relaxed) && slot.current.lock().expect("slot poisoned").is_none())
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::HmacSigner;
    use std::sync::atomic::AtomicUsize;

    fn test_config(workers: usize, timeout_seconds: u64) -> PoolConfig {
        PoolConfig {
            workers_per_priority: workers,
            queue_capacity: 8,
            request_timeout_seconds: timeout_seconds,
            watchdog_interval: Duration::from_millis(20),
            client_factory: Arc::new(|| {
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
            }),
        }
    }

    #[test]
    fn call_runs_work_and_returns_status() {
        let pool = Pool::new(test_config(1, 30));
        let status = pool.call(Priority::Pr0, Box::new(|_req| 0));
        assert_eq!(status, 0);
    }

    #[test]
    fn work_items_run_concurrently_across_workers() {
        let pool = Pool::new(test_config(4, 30));
        let counter = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let counter = counter.clone();
                pool.post(
                    Priority::Pr0,
                    Box::new(move |_req| {
                        counter.fetch_add(1, Ordering::SeqCst);
                        0
                    }),
                )
            })
            .collect();
        for h in handles {
            assert_eq!(h.wait(), 0);
        }
        assert_eq!(counter.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn panicking_work_item_completes_with_ecanceled_and_pool_keeps_working() {
        let pool = Pool::new(test_config(1, 30));
        let panicking = pool.call(Priority::Pr0, Box::new(|_req| panic!("boom")));
        assert_eq!(panicking, -libc::ECANCELED);

        // The pool replaces the panicked worker in place; subsequent work
        // must still complete normally rather than hang forever.
        let ok = pool.call(Priority::Pr0, Box::new(|_req| 0));
        assert_eq!(ok, 0);
    }

    #[test]
    fn priorities_use_independent_queues() {
        let pool = Pool::new(test_config(1, 30));
        assert_eq!(pool.queue_depth(Priority::Pr0), 0);
        assert_eq!(pool.queue_depth(Priority::PrReq1), 0);
    }
}
