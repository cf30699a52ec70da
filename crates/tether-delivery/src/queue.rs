//! Bounded priority queue shared by every producer and the reporter pool.
//!
//! Entries are ordered by priority (ascending, lower is more urgent), then by
//! due time (ascending), then by insertion order. The heap sits behind a
//! plain mutex that is only held for the push/pop itself; waiting consumers
//! park on a [`Notify`] and each insertion wakes exactly one of them.
//!
//! `dequeue` hands out the most urgent entry even if it is not due yet. The
//! consumer is expected to [`DeliveryQueue::put_back`] such entries and then
//! [`DeliveryQueue::wait_until`] their due time.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::request::PendingRequest;
use crate::DeliveryError;

/// Default capacity: ten entries per second for one hour.
pub const DEFAULT_CAPACITY: usize = 10 * 60 * 60;

/// Default number of delivery attempts per request.
pub const DEFAULT_RETRY_LIMIT: u32 = 5;

/// Heap slot. `BinaryHeap` is a max-heap, so the ordering is reversed to
/// surface the smallest `(priority, due, seq)` first.
#[derive(Debug)]
struct Slot {
    seq: u64,
    request: PendingRequest,
}

impl Slot {
    fn key(&self) -> (i32, Instant, u64) {
        (self.request.priority, self.request.due, self.seq)
    }
}

impl PartialEq for Slot {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Slot {}

impl PartialOrd for Slot {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Slot {
    fn cmp(&self, other: &Self) -> Ordering {
        other.key().cmp(&self.key())
    }
}

/// Thread-safe, bounded, priority-ordered buffer of outbound requests.
pub struct DeliveryQueue {
    heap: Mutex<BinaryHeap<Slot>>,
    available: Notify,
    capacity: usize,
    retry_limit: u32,
    next_seq: AtomicU64,
    dropped: AtomicU64,
}

impl DeliveryQueue {
    /// Create a queue with the default capacity and retry limit.
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_CAPACITY, DEFAULT_RETRY_LIMIT)
    }

    /// Create a queue with custom limits.
    pub fn with_limits(capacity: usize, retry_limit: u32) -> Self {
        Self {
            heap: Mutex::new(BinaryHeap::new()),
            available: Notify::new(),
            capacity,
            retry_limit,
            next_seq: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Add a fresh request. Never blocks.
    ///
    /// `retries_left` is reset to the queue's retry limit. If the queue is
    /// full the request is dropped and a warning is logged.
    pub fn enqueue(&self, request: PendingRequest) {
        if let Err(e) = self.try_enqueue(request) {
            warn!(error = %e, "dropping outbound request");
        }
    }

    /// Like [`enqueue`](Self::enqueue) but reports a full queue to the caller.
    pub fn try_enqueue(&self, mut request: PendingRequest) -> Result<(), DeliveryError> {
        request.retries_left = self.retry_limit;
        debug!(
            id = %request.id,
            method = %request.method,
            path = %request.path,
            priority = request.priority,
            "enqueue"
        );
        self.insert(request, true)
    }

    /// Re-insert a request that failed delivery, keeping its retry budget.
    pub fn reschedule(&self, request: PendingRequest) {
        let id = request.id;
        if let Err(e) = self.insert(request, true) {
            warn!(%id, error = %e, "dropping rescheduled request");
        }
    }

    /// Return a request that was dequeued before its due time.
    ///
    /// Unlike [`reschedule`](Self::reschedule) this does not wake another
    /// consumer: the caller is the one going to wait for it.
    pub fn put_back(&self, request: PendingRequest) {
        let id = request.id;
        if let Err(e) = self.insert(request, false) {
            warn!(%id, error = %e, "dropping premature request");
        }
    }

    /// Wait for the most urgent entry and remove it.
    ///
    /// Cancel-safe: an entry is only removed in the same poll that returns it.
    pub async fn dequeue(&self) -> PendingRequest {
        loop {
            if let Some(request) = self.try_dequeue() {
                return request;
            }
            // notify_one stores a permit when nobody is waiting, so an
            // insertion racing with this check is not lost.
            self.available.notified().await;
        }
    }

    /// Remove the most urgent entry if there is one.
    pub fn try_dequeue(&self) -> Option<PendingRequest> {
        self.lock().pop().map(|slot| slot.request)
    }

    /// Sleep until `due`, returning early if a new entry is inserted.
    pub async fn wait_until(&self, due: Instant) {
        tokio::select! {
            _ = tokio::time::sleep_until(due) => {}
            _ = self.available.notified() => {}
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn retry_limit(&self) -> u32 {
        self.retry_limit
    }

    /// Number of requests rejected because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(AtomicOrdering::Relaxed)
    }

    fn insert(&self, request: PendingRequest, wake: bool) -> Result<(), DeliveryError> {
        {
            let mut heap = self.lock();
            if heap.len() >= self.capacity {
                self.dropped.fetch_add(1, AtomicOrdering::Relaxed);
                return Err(DeliveryError::QueueFull {
                    capacity: self.capacity,
                });
            }
            let seq = self.next_seq.fetch_add(1, AtomicOrdering::Relaxed);
            heap.push(Slot { seq, request });
        }
        if wake {
            self.available.notify_one();
        }
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, BinaryHeap<Slot>> {
        // The heap is always left consistent, so a poisoned lock is usable.
        self.heap.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for DeliveryQueue {
    fn default() -> Self {
        Self::new()
    }
}
