//! Shared priority/FIFO ordering primitive backing both Egress Buffer
//! implementations ("`(priority desc, next_attempt_at asc,
//! insertion_order asc)` order"). Kept as a plain, lock-free-of-async
//! structure so both `InMemoryEgressBuffer` and `DiskSpillEgressBuffer`
//! share one implementation of the ordering/eviction/in-flight rules and
//! only differ in whether `add`/`ack` also touch a file.

use std::collections::HashMap;

use uuid::Uuid;

use super::message::CloudMessage;

#[derive(Debug, Clone)]
struct Entry {
    message: CloudMessage,
    insertion_order: u64,
}

impl Entry {
    /// Key whose *max* is "most eligible to go next": higher priority
    /// first, then earlier `next_attempt_at`, then earlier insertion
    /// (the two `Reverse`s turn "smaller is better" into "larger is
    /// better" so a single `max_by_key` picks the right entry).
    fn dispatch_rank(&self) -> (u8, std::cmp::Reverse<u64>, std::cmp::Reverse<u64>) {
        (
            self.message.priority as u8,
            std::cmp::Reverse(self.message.next_attempt_at),
            std::cmp::Reverse(self.insertion_order),
        )
    }

    /// Key whose *min* is "least eligible, evict this first": lowest
    /// priority, then oldest insertion.
    fn eviction_rank(&self) -> (u8, u64) {
        (self.message.priority as u8, self.insertion_order)
    }
}

/// Result of pushing a message onto the queue: whether the hard cap
/// forced an eviction, and what was evicted (for the `BufferFull`
/// counter).
pub struct PushOutcome {
    pub evicted: Option<CloudMessage>,
}

pub struct OrderedQueue {
    queued: Vec<Entry>,
    in_flight: HashMap<Uuid, CloudMessage>,
    next_insertion: u64,
    max_size: usize,
    closed: bool,
}

impl OrderedQueue {
    pub fn new(max_size: usize) -> Self {
        OrderedQueue {
            queued: Vec::new(),
            in_flight: HashMap::new(),
            next_insertion: 0,
            max_size,
            closed: false,
        }
    }

    /// Rebuild a queue from messages recovered off disk, preserving their
    /// original insertion relationship by the order they're handed in.
    pub fn from_recovered(max_size: usize, messages: Vec<CloudMessage>) -> Self {
        let mut queue = OrderedQueue::new(max_size);
        for message in messages {
            queue.push(message);
        }
        queue
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn close(&mut self) {
        self.closed = true;
    }

    pub fn len(&self) -> usize {
        self.queued.len() + self.in_flight.len()
    }

    /// Pushes a message, evicting the lowest-priority oldest entry first
    /// if the hard cap is already reached.
    pub fn push(&mut self, message: CloudMessage) -> PushOutcome {
        let evicted = if self.queued.len() >= self.max_size {
            self.evict_worst()
        } else {
            None
        };
        let insertion_order = self.next_insertion;
        self.next_insertion += 1;
        self.queued.push(Entry { message, insertion_order });
        PushOutcome { evicted }
    }

    fn evict_worst(&mut self) -> Option<CloudMessage> {
        if self.queued.is_empty() {
            return None;
        }
        let worst_idx = self
            .queued
            .iter()
            .enumerate()
            .min_by_key(|(_, e)| e.eviction_rank())
            .map(|(i, _)| i)
            .expect("queued is non-empty");
        Some(self.queued.remove(worst_idx).message)
    }

    /// Returns the highest-ranked entry that is due at `now`, moving it
    /// into the in-flight set. `None` if nothing is due yet.
    pub fn pop_due(&mut self, now: u64) -> Option<CloudMessage> {
        let best_idx = self
            .queued
            .iter()
            .enumerate()
            .filter(|(_, e)| e.message.next_attempt_at <= now)
            .max_by_key(|(_, e)| e.dispatch_rank())
            .map(|(i, _)| i)?;
        let entry = self.queued.remove(best_idx);
        self.in_flight.insert(entry.message.id, entry.message.clone());
        Some(entry.message)
    }

    /// Earliest `next_attempt_at` across everything still queued (not
    /// in-flight), for callers deciding how long to sleep before
    /// rescanning.
    pub fn earliest_wait(&self) -> Option<u64> {
        self.queued.iter().map(|e| e.message.next_attempt_at).min()
    }

    /// Idempotent: acking an id no longer in flight (already acked, or
    /// never dequeued) is a silent no-op.
    pub fn ack(&mut self, id: Uuid) -> Option<CloudMessage> {
        self.in_flight.remove(&id)
    }

    /// Re-enqueues a previously dequeued (in-flight) message with an
    /// incremented retry count and the given `next_attempt_at`. No-op if
    /// the message isn't in flight (already acked, or unknown id).
    pub fn requeue(&mut self, id: Uuid, next_attempt_at: u64) -> bool {
        let Some(mut message) = self.in_flight.remove(&id) else {
            return false;
        };
        message.retries += 1;
        message.next_attempt_at = next_attempt_at.max(message.created_at);
        let insertion_order = self.next_insertion;
        self.next_insertion += 1;
        self.queued.push(Entry { message, insertion_order });
        true
    }
}
