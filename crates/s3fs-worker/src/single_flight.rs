//! Request deduplication: when several callers ask for the same key at
//! once, only one of them does the work and the rest attach to its result.
//!
//! Generalized from the leader/waiter pattern of a read-coalescing cache —
//! here keyed by an arbitrary `K` rather than a fixed read key, so
//! `s3fs-core`'s metadata cache can single-flight concurrent `HEAD`s for the
//! same path through the same mechanism.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Mutex;

use tokio::sync::broadcast;

const BROADCAST_CAPACITY: usize = 1;

/// What a caller should do after calling [`SingleFlight::attach`].
pub enum Attach<V> {
    /// No other caller is in flight for this key — do the work, then call
    /// [`SingleFlight::publish`] with the result.
    Leader,
    /// Another caller is already doing the work; await its result here.
    Waiter(broadcast::Receiver<V>),
}

impl<V: Clone> Attach<V> {
    /// Blocks the calling OS thread until the leader publishes, without
    /// requiring a tokio runtime to already be running on this thread — the
    /// worker pool's callers are plain `std::thread`s, so waiting on a
    /// `tokio::sync::broadcast::Receiver` needs its own minimal executor
    /// rather than an ambient one. Returns `None` if this was the leader
    /// (nothing to wait for) or the channel closed without a publish.
    pub fn wait_blocking(self) -> Option<V> {
        match self {
            Attach::Leader => None,
            Attach::Waiter(mut rx) => tokio::runtime::Builder::new_current_thread()
                .build()
                .expect("failed to start single-flight wait runtime")
                .block_on(rx.recv())
                .ok(),
        }
    }
}

pub struct SingleFlight<K, V> {
    inflight: Mutex<HashMap<K, broadcast::Sender<V>>>,
}

impl<K, V> Default for SingleFlight<K, V>
where
    K: Eq + Hash,
{
    fn default() -> Self {
        Self {
            inflight: Mutex::new(HashMap::new()),
        }
    }
}

impl<K, V> SingleFlight<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers interest in `key`. The first caller for a given key becomes
    /// the leader and is responsible for calling [`Self::publish`] exactly
    /// once; every other concurrent caller for the same key gets a receiver
    /// that wakes up with the leader's result.
    pub fn attach(&self, key: K) -> Attach<V> {
        let mut inflight = self.inflight.lock().expect("single-flight map poisoned");
        match inflight.entry(key) {
            Entry::Occupied(entry) => Attach::Waiter(entry.get().subscribe()),
            Entry::Vacant(entry) => {
                let (tx, _rx) = broadcast::channel(BROADCAST_CAPACITY);
                entry.insert(tx);
                Attach::Leader
            }
        }
    }

    /// Delivers the leader's result to every waiter and clears the in-flight
    /// entry so the next call for this key starts a fresh round.
    pub fn publish(&self, key: &K, value: V) {
        let sender = {
            let mut inflight = self.inflight.lock().expect("single-flight map poisoned");
            inflight.remove(key)
        };
        if let Some(sender) = sender {
            let _ = sender.send(value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_caller_is_leader_second_is_waiter() {
        let sf: SingleFlight<String, i32> = SingleFlight::new();
        assert!(matches!(sf.attach("a".to_string()), Attach::Leader));
        assert!(matches!(sf.attach("a".to_string()), Attach::Waiter(_)));
    }

    #[test]
    fn distinct_keys_are_independent() {
        let sf: SingleFlight<String, i32> = SingleFlight::new();
        assert!(matches!(sf.attach("a".to_string()), Attach::Leader));
        assert!(matches!(sf.attach("b".to_string()), Attach::Leader));
    }

    #[test]
    fn publish_wakes_waiter_and_clears_entry() {
        let sf: SingleFlight<String, i32> = SingleFlight::new();
        assert!(matches!(sf.attach("a".to_string()), Attach::Leader));
        let mut rx = match sf.attach("a".to_string()) {
            Attach::Waiter(rx) => rx,
            Attach::Leader => panic!("expected waiter"),
        };

        sf.publish(&"a".to_string(), 42);
        assert_eq!(rx.try_recv().unwrap(), 42);

        // entry was cleared, so this round starts fresh
        assert!(matches!(sf.attach("a".to_string()), Attach::Leader));
    }
}
