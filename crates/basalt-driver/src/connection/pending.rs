//! Per-connection table of in-flight requests keyed by stream id.
//!
//! Entries are inserted by the dispatching thread and removed by
//! whichever thread observes the terminal event first — response
//! arrival, slot timeout, or defunct fan-out. [`PendingRequests::complete`]
//! is a compare-and-clear, so removal is exactly-once under that race.

use std::sync::{Arc, Mutex};

use basalt_protocol::Response;

use crate::completion::Completion;
use crate::error::{DriverError, DriverResult};

pub(crate) type RequestCompletion = Arc<Completion<Response>>;

struct Slots {
    entries: Vec<Option<RequestCompletion>>,
    in_flight: usize,
    /// Scan start hint: no id below this is free.
    next_free: usize,
}

/// Lock-protected stream-slot table with a fixed capacity.
pub(crate) struct PendingRequests {
    slots: Mutex<Slots>,
    capacity: usize,
}

impl PendingRequests {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            slots: Mutex::new(Slots {
                entries: (0..capacity).map(|_| None).collect(),
                in_flight: 0,
                next_free: 0,
            }),
            capacity,
        }
    }

    /// Leases the lowest free stream id to `completion`.
    ///
    /// The slot stays leased until [`complete`](Self::complete) releases
    /// it; a second request can never observe the same id in between.
    pub(crate) fn reserve(&self, completion: RequestCompletion) -> DriverResult<i16> {
        let mut slots = self.slots.lock().expect("pending lock");
        let start = slots.next_free;
        for id in start..self.capacity {
            if slots.entries[id].is_none() {
                slots.entries[id] = Some(completion);
                slots.in_flight += 1;
                slots.next_free = id + 1;
                return Ok(id as i16);
            }
        }
        Err(DriverError::PoolExhausted)
    }

    /// Compare-and-clear removal. Returns the completion when `stream`
    /// was leased, `None` for stale or duplicate ids.
    pub(crate) fn complete(&self, stream: i16) -> Option<RequestCompletion> {
        if stream < 0 || stream as usize >= self.capacity {
            return None;
        }
        let mut slots = self.slots.lock().expect("pending lock");
        let taken = slots.entries[stream as usize].take();
        if taken.is_some() {
            slots.in_flight -= 1;
            slots.next_free = slots.next_free.min(stream as usize);
        }
        taken
    }

    /// Drains every pending entry and fails it with `error`. Used on
    /// the defunct path; losing a completion race with a caller-side
    /// deadline is fine.
    pub(crate) fn fail_all(&self, error: DriverError) {
        let drained: Vec<RequestCompletion> = {
            let mut slots = self.slots.lock().expect("pending lock");
            slots.in_flight = 0;
            slots.next_free = 0;
            slots.entries.iter_mut().filter_map(Option::take).collect()
        };
        for completion in drained {
            completion.try_complete(Err(error.clone()));
        }
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.slots.lock().expect("pending lock").in_flight
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }
}
