use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Pending,
    Completed(i32),
}

struct Inner {
    state: Mutex<State>,
    cond: Condvar,
}

/// A one-shot completion cell shared between a work item's poster and the
/// worker that eventually runs it.
///
/// `AsyncHandle` is cheap to clone (it's an `Arc` around a mutex + condvar);
/// every clone observes the same completion. `complete` is idempotent in the
/// sense that only the first call has any effect — this is what lets the
/// pool's watchdog race a slow worker to completion without double-firing.
#[derive(Clone)]
pub struct AsyncHandle {
    inner: Arc<Inner>,
}

impl AsyncHandle {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::Pending),
                cond: Condvar::new(),
            }),
        }
    }

    /// Completes the handle with `status`, waking all waiters.
    ///
    /// Returns `true` if this call transitioned the handle from pending to
    /// completed, `false` if it was already completed (e.g. by a watchdog
    /// timeout racing a worker's normal completion). Callers that need the
    /// "drop the result silently if someone beat us to it" rule from the
    /// worker loop should check this return value.
    pub fn complete(&self, status: i32) -> bool {
        let mut state = self.inner.state.lock().unwrap();
        if matches!(*state, State::Pending) {
            *state = State::Completed(status);
            self.inner.cond.notify_all();
            true
        } else {
            false
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(*self.inner.state.lock().unwrap(), State::Completed(_))
    }

    /// Blocks until the handle completes, returning its status.
    pub fn wait(&self) -> i32 {
        let mut state = self.inner.state.lock().unwrap();
        loop {
            match *state {
                State::Completed(status) => return status,
                State::Pending => state = self.inner.cond.wait(state).unwrap(),
            }
        }
    }

    /// Blocks until the handle completes or `timeout` elapses.
    ///
    /// Returns `None` on timeout without altering the handle's state — the
    /// caller is expected to be a plain reader, not the thing responsible
    /// for completing the handle on timeout (that's the pool's watchdog).
    pub fn wait_timeout(&self, timeout: Duration) -> Option<i32> {
        let (mut state, result) = self
            .inner
            .cond
            .wait_timeout_while(self.inner.state.lock().unwrap(), timeout, |s| {
                matches!(s, State::Pending)
            })
            .unwrap();
        let _ = &mut state;
        match *state {
            State::Completed(status) => Some(status),
            State::Pending => {
                debug_assert!(result.timed_out());
                None
            }
        }
    }
}

impl Default for AsyncHandle {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn completes_once() {
        let h = AsyncHandle::new();
        assert!(h.complete(0));
        assert!(!h.complete(-1), "second completion must be a no-op");
        assert_eq!(h.wait(), 0);
    }

    #[test]
    fn wait_blocks_until_complete() {
        let h = AsyncHandle::new();
        let h2 = h.clone();
        let worker = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            h2.complete(42);
        });
        assert_eq!(h.wait(), 42);
        worker.join().unwrap();
    }

    #[test]
    fn wait_timeout_expires() {
        let h = AsyncHandle::new();
        assert_eq!(h.wait_timeout(Duration::from_millis(10)), None);
        assert!(!h.is_completed());
    }

    #[test]
    fn wait_timeout_observes_late_completion() {
        let h = AsyncHandle::new();
        let h2 = h.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            h2.complete(7);
        });
        assert_eq!(h.wait_timeout(Duration::from_millis(500)), Some(7));
    }
}
