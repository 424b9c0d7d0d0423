//! Dispatch priority within a partition.
//!
//! Dequeue is not FIFO: the highest score goes first, and jobs with equal
//! scores leave in intake order.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use chrono::{DateTime, Utc};

use crate::model::Job;
use crate::queue::Receipt;

/// Bonus for commands and administrative messages.
pub const COMMAND_BOOST: u32 = 1000;

/// Messages younger than this get a freshness bonus of one point per second
/// of remaining window.
pub const FRESHNESS_WINDOW_SECS: i64 = 300;

/// Score a job at enqueue time. Always non-negative.
pub fn priority_of(job: &Job, now: DateTime<Utc>) -> u32 {
    let boost = if job.admin || job.is_command() {
        COMMAND_BOOST
    } else {
        0
    };
    let age = (now - job.submitted_at).num_seconds().max(0);
    let freshness = (FRESHNESS_WINDOW_SECS - age).clamp(0, FRESHNESS_WINDOW_SECS) as u32;
    boost + freshness
}

#[derive(Debug)]
pub(crate) struct Queued {
    pub priority: u32,
    pub seq: u64,
    pub job: Job,
    pub receipt: Option<Receipt>,
}

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for Queued {}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Queued {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Max-heap on (priority, earliest intake).
#[derive(Debug, Default)]
pub(crate) struct PriorityQueue {
    heap: BinaryHeap<Queued>,
    next_seq: u64,
}

impl PriorityQueue {
    pub fn push(&mut self, job: Job, priority: u32, receipt: Option<Receipt>) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Queued {
            priority,
            seq,
            job,
            receipt,
        });
    }

    pub fn pop(&mut self) -> Option<Queued> {
        self.heap.pop()
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}
