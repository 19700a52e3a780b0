//! Bounded, per-priority work queues.
//!
//! Each priority gets its own `crossbeam-channel` bounded queue and its own
//! fleet of workers (see [`crate::pool::Pool`]); posting to a full queue
//! blocks the poster rather than growing unboundedly, which is itself one of
//! the documented suspension points for callers.

use crossbeam_channel::{Receiver, Sender, bounded};

use crate::pool::{Priority, WorkItem};

pub struct Queues {
    senders: [Sender<WorkItem>; Priority::COUNT],
    receivers: [Receiver<WorkItem>; Priority::COUNT],
}

impl Queues {
    pub fn new(capacity: usize) -> Self {
        let (s0, r0) = bounded(capacity);
        let (s1, r1) = bounded(capacity);
        Self {
            senders: [s0, s1],
            receivers: [r0, r1],
        }
    }

    pub fn sender(&self, priority: Priority) -> Sender<WorkItem> {
        self.senders[priority.index()].clone()
    }

    pub fn receiver(&self, priority: Priority) -> Receiver<WorkItem> {
        self.receivers[priority.index()].clone()
    }

    pub fn depth(&self, priority: Priority) -> usize {
        self.receivers[priority.index()].len()
    }
}
