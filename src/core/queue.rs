//! Purpose: Blocking multi-producer, single-consumer queue with an epoch barrier.
//! Exports: `BarrierQueue`, `QueueConsumer`, `EpochBatch`, `EpochTicket`, `ProducerRegistration`.
//! Role: Fan-in substrate between per-file readers and the epoch merger.
//! Invariants: All queue state lives under one mutex; enqueue and mark-done never block.
//! Invariants: The done count is zeroed exactly once per epoch, by the consumer, after draining.
//! Invariants: Producers that stop early deregister, so the barrier never waits on them.
//! Invariants: At most one `QueueConsumer` exists per queue; dropping it aborts the queue.

use std::collections::VecDeque;
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use tracing::debug;

struct QueueState<T> {
    pending: VecDeque<T>,
    done: usize,
    expected: usize,
    epoch: u64,
    aborted: bool,
}

impl<T> QueueState<T> {
    fn epoch_complete(&self) -> bool {
        self.done >= self.expected
    }
}

/// Epoch a producer marked done; pass it back to [`BarrierQueue::wait_for_epoch_reset`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct EpochTicket(u64);

impl EpochTicket {
    pub fn epoch(self) -> u64 {
        self.0
    }
}

pub struct BarrierQueue<T> {
    state: Mutex<QueueState<T>>,
    consumer_wake: Condvar,
    epoch_reset: Condvar,
    consumer_taken: AtomicBool,
}

impl<T> BarrierQueue<T> {
    /// Creates a queue whose barrier waits for `expected_producers` marks per epoch.
    pub fn new(expected_producers: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                pending: VecDeque::new(),
                done: 0,
                expected: expected_producers,
                epoch: 0,
                aborted: false,
            }),
            consumer_wake: Condvar::new(),
            epoch_reset: Condvar::new(),
            consumer_taken: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn enqueue(&self, item: T) {
        let mut state = self.lock();
        state.pending.push_back(item);
        drop(state);
        self.consumer_wake.notify_one();
    }

    pub fn bulk_enqueue(&self, items: impl IntoIterator<Item = T>) {
        let mut state = self.lock();
        let before = state.pending.len();
        state.pending.extend(items);
        let added = state.pending.len() > before;
        drop(state);
        if added {
            self.consumer_wake.notify_one();
        }
    }

    /// Advisory only: producers may enqueue right after this returns.
    pub fn is_empty(&self) -> bool {
        self.lock().pending.is_empty()
    }

    pub fn len(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn mark_producer_epoch_done(&self) -> EpochTicket {
        let mut state = self.lock();
        state.done += 1;
        let ticket = EpochTicket(state.epoch);
        debug!(epoch = state.epoch, done = state.done, expected = state.expected, "producer marked epoch done");
        drop(state);
        self.consumer_wake.notify_all();
        ticket
    }

    /// Blocks until the consumer resets the epoch named by `ticket`, or the queue is aborted.
    pub fn wait_for_epoch_reset(&self, ticket: EpochTicket) {
        let state = self.lock();
        let _state = self
            .epoch_reset
            .wait_while(state, |state| state.epoch == ticket.0 && !state.aborted)
            .unwrap_or_else(PoisonError::into_inner);
    }

    /// Marks this producer done and waits for the consumer to open the next epoch.
    pub fn finish_epoch(&self) {
        let ticket = self.mark_producer_epoch_done();
        self.wait_for_epoch_reset(ticket);
    }

    pub fn is_epoch_complete(&self) -> bool {
        self.lock().epoch_complete()
    }

    pub fn done_count(&self) -> usize {
        self.lock().done
    }

    pub fn expected_producers(&self) -> usize {
        self.lock().expected
    }

    pub fn epoch(&self) -> u64 {
        self.lock().epoch
    }

    /// Removes one producer from the barrier. Called when a producer's stream ends.
    pub fn deregister_producer(&self) {
        let mut state = self.lock();
        state.expected = state.expected.saturating_sub(1);
        debug!(expected = state.expected, epoch = state.epoch, "producer deregistered");
        drop(state);
        self.consumer_wake.notify_all();
    }

    /// Guard that deregisters one producer when dropped.
    pub fn registration(&self) -> ProducerRegistration<'_, T> {
        ProducerRegistration { queue: self }
    }

    /// True once every producer has deregistered.
    pub fn is_closed(&self) -> bool {
        self.lock().expected == 0
    }

    /// Releases every blocked producer and consumer. Producers should stop on their next iteration.
    pub fn abort(&self) {
        let mut state = self.lock();
        if state.aborted {
            return;
        }
        state.aborted = true;
        drop(state);
        debug!("queue aborted");
        self.epoch_reset.notify_all();
        self.consumer_wake.notify_all();
    }

    pub fn is_aborted(&self) -> bool {
        self.lock().aborted
    }

    /// Hands out the single consumer handle; later calls return `None`.
    pub fn consumer(self: &Arc<Self>) -> Option<QueueConsumer<T>> {
        if self.consumer_taken.swap(true, Ordering::AcqRel) {
            return None;
        }
        Some(QueueConsumer {
            queue: Arc::clone(self),
            local: VecDeque::new(),
        })
    }
}

pub struct ProducerRegistration<'a, T> {
    queue: &'a BarrierQueue<T>,
}

impl<T> Drop for ProducerRegistration<'_, T> {
    fn drop(&mut self) {
        self.queue.deregister_producer();
    }
}

/// Records of one closed epoch. `closed` is set when no producers remain.
#[derive(Debug)]
pub struct EpochBatch<T> {
    pub records: Vec<T>,
    pub closed: bool,
}

/// Consumer side of a [`BarrierQueue`].
///
/// Keeps a local buffer that is refilled by swapping the shared FIFO out
/// under the lock, then drained without holding it.
pub struct QueueConsumer<T> {
    queue: Arc<BarrierQueue<T>>,
    local: VecDeque<T>,
}

impl<T> QueueConsumer<T> {
    pub fn queue(&self) -> &Arc<BarrierQueue<T>> {
        &self.queue
    }

    /// Blocks until an item is available. FIFO across all producers.
    pub fn dequeue(&mut self) -> T {
        loop {
            if let Some(item) = self.local.pop_front() {
                return item;
            }
            let state = self.queue.lock();
            let mut state = self
                .queue
                .consumer_wake
                .wait_while(state, |state| state.pending.is_empty())
                .unwrap_or_else(PoisonError::into_inner);
            mem::swap(&mut self.local, &mut state.pending);
        }
    }

    /// Like `dequeue`, but returns `None` once the queue is empty and closed or aborted.
    pub fn dequeue_until_closed(&mut self) -> Option<T> {
        if let Some(item) = self.local.pop_front() {
            return Some(item);
        }
        let state = self.queue.lock();
        let mut state = self
            .queue
            .consumer_wake
            .wait_while(state, |state| {
                state.pending.is_empty() && state.expected > 0 && !state.aborted
            })
            .unwrap_or_else(PoisonError::into_inner);
        mem::swap(&mut self.local, &mut state.pending);
        drop(state);
        self.local.pop_front()
    }

    pub fn try_dequeue(&mut self) -> Option<T> {
        if self.local.is_empty() {
            let mut state = self.queue.lock();
            mem::swap(&mut self.local, &mut state.pending);
        }
        self.local.pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.local.is_empty() && self.queue.is_empty()
    }

    /// Waits for the current epoch to complete and takes every record queued so far.
    ///
    /// Producers stay blocked until [`QueueConsumer::reset_epoch`] is called.
    pub fn drain_epoch(&mut self) -> EpochBatch<T> {
        let state = self.queue.lock();
        let mut state = self
            .queue
            .consumer_wake
            .wait_while(state, |state| !state.epoch_complete() && !state.aborted)
            .unwrap_or_else(PoisonError::into_inner);
        let closed = state.expected == 0 || state.aborted;
        let mut records: Vec<T> = self.local.drain(..).collect();
        records.extend(state.pending.drain(..));
        debug!(epoch = state.epoch, records = records.len(), closed, "drained epoch");
        EpochBatch { records, closed }
    }

    /// Opens the next epoch and releases every producer waiting on the current one.
    pub fn reset_epoch(&mut self) {
        let mut state = self.queue.lock();
        state.done = 0;
        state.epoch += 1;
        debug!(epoch = state.epoch, "epoch reset");
        drop(state);
        self.queue.epoch_reset.notify_all();
    }
}

impl<T> Drop for QueueConsumer<T> {
    fn drop(&mut self) {
        self.queue.abort();
    }
}
