//! Bounded single-producer/multi-consumer work queue with steal support
//!
//! Each worker owns one `WorkQueue`. The owner pushes and polls; other
//! workers steal from the consumer end via CAS on the queue indices.
//! Overflow spills to the global injector.

use crate::task::{monotonic_ns, Task};
use crossbeam_deque::Injector;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU64, AtomicUsize, Ordering};

/// Unbounded multi-producer/multi-consumer FIFO for externally submitted
/// and overflowed tasks.
pub(crate) type GlobalQueue = Injector<Box<Task>>;

/// Ring buffer capacity; must be a power of two.
const BUFFER_CAPACITY: usize = 128;
const MASK: usize = BUFFER_CAPACITY - 1;

/// Local-queue watermark above which a submission requests help.
pub(crate) const QUEUE_SIZE_OFFLOAD_THRESHOLD: usize = 96;

/// Minimum age before a task becomes eligible for stealing, preserving
/// producer-consumer locality.
pub(crate) const WORK_STEALING_TIME_RESOLUTION_NS: u64 = 100_000;

/// One ring slot. `submission_time` is valid while `task` is non-null and
/// is published by the owner before the pointer, so stealers can judge a
/// task's age without dereferencing it.
struct Slot {
    task: AtomicPtr<Task>,
    submission_time: AtomicU64,
}

impl Slot {
    fn empty() -> Self {
        Self {
            task: AtomicPtr::new(ptr::null_mut()),
            submission_time: AtomicU64::new(0),
        }
    }
}

/// Bounded local run queue owned by a single worker.
///
/// The head slot (`last_scheduled`) holds the most recent unfair push and is
/// polled first, giving semi-FIFO order: the newest task runs next while the
/// task it displaced goes to the buffer tail. Only the owner writes the
/// producer index; the owner and stealers race on the consumer index via CAS,
/// so a task is extracted exactly once.
pub(crate) struct WorkQueue {
    /// Ring of parked tasks between the head slot and the consumer end
    buffer: Box<[Slot]>,

    /// Most recent unfair push; polled before the buffer
    last_scheduled: AtomicPtr<Task>,

    /// Submission time of the head task, readable without dereferencing.
    /// Written before the pointer swap, so a stale read can only make a
    /// task look newer than it is — stealing then refuses, never duplicates.
    last_scheduled_time: AtomicU64,

    /// Next free buffer index; owner-only writes
    producer_index: AtomicUsize,

    /// Next occupied buffer index; CAS-contended by owner poll and stealers
    consumer_index: AtomicUsize,
}

impl WorkQueue {
    /// Create an empty queue
    pub(crate) fn new() -> Self {
        Self {
            buffer: (0..BUFFER_CAPACITY).map(|_| Slot::empty()).collect(),
            last_scheduled: AtomicPtr::new(ptr::null_mut()),
            last_scheduled_time: AtomicU64::new(0),
            producer_index: AtomicUsize::new(0),
            consumer_index: AtomicUsize::new(0),
        }
    }

    /// Unfair push: the task takes the head slot and the task it displaces
    /// moves to the buffer tail. Returns false if the displaced task
    /// overflowed to the global queue.
    pub(crate) fn add(&self, task: Box<Task>, global: &GlobalQueue) -> bool {
        match self.swap_last_scheduled(task) {
            None => true,
            Some(displaced) => self.add_last(displaced, global),
        }
    }

    /// Fair push to the buffer tail. Returns false if the task overflowed
    /// to the global queue.
    pub(crate) fn add_last(&self, task: Box<Task>, global: &GlobalQueue) -> bool {
        match self.try_add_last(task) {
            Ok(()) => true,
            Err(overflow) => {
                global.push(overflow);
                false
            }
        }
    }

    /// Owner-only consumer: head slot first, then the oldest buffered task.
    pub(crate) fn poll(&self) -> Option<Box<Task>> {
        self.take_last_scheduled().or_else(|| self.poll_buffer())
    }

    /// Steal one task from `victim` into this (the thief's) queue.
    ///
    /// Only tasks older than [`WORK_STEALING_TIME_RESOLUTION_NS`] are
    /// eligible. Contended steals fail rather than block. The stolen task is
    /// re-inserted through `add`, so it may displace this queue's head.
    pub(crate) fn try_steal(&self, victim: &WorkQueue, global: &GlobalQueue) -> bool {
        let now = monotonic_ns();
        if let Some(task) = victim.steal_from_buffer(now) {
            self.add(task, global);
            return true;
        }
        if victim.buffer_size() == 0 {
            if let Some(task) = victim.steal_last_scheduled(now) {
                self.add(task, global);
                return true;
            }
        }
        false
    }

    /// Number of buffered tasks, excluding the head slot. Non-atomic
    /// snapshot; the consumer index is read first so the difference cannot
    /// underflow.
    pub(crate) fn buffer_size(&self) -> usize {
        let tail = self.consumer_index.load(Ordering::Relaxed);
        let head = self.producer_index.load(Ordering::Relaxed);
        head.wrapping_sub(tail)
    }

    /// Total queued tasks including the head slot (racy snapshot)
    pub(crate) fn size(&self) -> usize {
        let head_occupied = !self.last_scheduled.load(Ordering::Relaxed).is_null();
        self.buffer_size() + usize::from(head_occupied)
    }

    fn swap_last_scheduled(&self, task: Box<Task>) -> Option<Box<Task>> {
        self.last_scheduled_time
            .store(task.submission_time_ns(), Ordering::Relaxed);
        let new = Box::into_raw(task);
        let old = self.last_scheduled.swap(new, Ordering::AcqRel);
        if old.is_null() {
            None
        } else {
            // The swap transferred ownership of `old` back to us.
            Some(unsafe { Box::from_raw(old) })
        }
    }

    fn take_last_scheduled(&self) -> Option<Box<Task>> {
        let ptr = self.last_scheduled.swap(ptr::null_mut(), Ordering::AcqRel);
        if ptr.is_null() {
            None
        } else {
            Some(unsafe { Box::from_raw(ptr) })
        }
    }

    /// Thief-side head steal, gated on task age. The CAS transfers
    /// ownership: it succeeds for exactly one contender.
    fn steal_last_scheduled(&self, now: u64) -> Option<Box<Task>> {
        let observed = self.last_scheduled.load(Ordering::Acquire);
        if observed.is_null() {
            return None;
        }
        let submitted = self.last_scheduled_time.load(Ordering::Acquire);
        if now.saturating_sub(submitted) < WORK_STEALING_TIME_RESOLUTION_NS {
            return None;
        }
        if self
            .last_scheduled
            .compare_exchange(observed, ptr::null_mut(), Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            return Some(unsafe { Box::from_raw(observed) });
        }
        None
    }

    fn try_add_last(&self, task: Box<Task>) -> Result<(), Box<Task>> {
        if self.buffer_size() >= BUFFER_CAPACITY - 1 {
            return Err(task);
        }
        let head = self.producer_index.load(Ordering::Relaxed);
        let slot = &self.buffer[head & MASK];
        // A consumer that reserved this index may not have emptied the slot
        // yet; losing that race means the queue is close to overflowing, so
        // the task goes to the global queue instead.
        if !slot.task.load(Ordering::Acquire).is_null() {
            return Err(task);
        }
        slot.submission_time
            .store(task.submission_time_ns(), Ordering::Relaxed);
        slot.task.store(Box::into_raw(task), Ordering::Release);
        self.producer_index.fetch_add(1, Ordering::Release);
        Ok(())
    }

    fn poll_buffer(&self) -> Option<Box<Task>> {
        loop {
            let tail = self.consumer_index.load(Ordering::Relaxed);
            if tail == self.producer_index.load(Ordering::Acquire) {
                return None;
            }
            if self
                .consumer_index
                .compare_exchange(
                    tail,
                    tail.wrapping_add(1),
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                return Some(self.take_slot(tail));
            }
        }
    }

    /// Thief-side buffer steal from the consumer (oldest) end.
    ///
    /// The age check reads the slot's time field, not the task itself; if
    /// the slot was recycled in between, the index CAS fails and nothing is
    /// taken. A successful CAS therefore always extracts the task whose age
    /// was checked.
    fn steal_from_buffer(&self, now: u64) -> Option<Box<Task>> {
        loop {
            let tail = self.consumer_index.load(Ordering::Acquire);
            let head = self.producer_index.load(Ordering::Acquire);
            if head.wrapping_sub(tail) == 0 {
                return None;
            }
            let slot = &self.buffer[tail & MASK];
            if slot.task.load(Ordering::Acquire).is_null() {
                // Another consumer owns this index but has not emptied the
                // slot yet; report contention instead of spinning on it.
                return None;
            }
            let submitted = slot.submission_time.load(Ordering::Acquire);
            if now.saturating_sub(submitted) < WORK_STEALING_TIME_RESOLUTION_NS {
                return None;
            }
            if self
                .consumer_index
                .compare_exchange(
                    tail,
                    tail.wrapping_add(1),
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                return Some(self.take_slot(tail));
            }
        }
    }

    fn take_slot(&self, index: usize) -> Box<Task> {
        let slot = &self.buffer[index & MASK];
        let ptr = slot.task.swap(ptr::null_mut(), Ordering::AcqRel);
        debug_assert!(!ptr.is_null(), "consumed an unpublished queue slot");
        // Winning the consumer-index CAS made us the sole owner of this slot.
        unsafe { Box::from_raw(ptr) }
    }
}

impl Drop for WorkQueue {
    fn drop(&mut self) {
        let last = *self.last_scheduled.get_mut();
        if !last.is_null() {
            drop(unsafe { Box::from_raw(last) });
        }
        for slot in self.buffer.iter_mut() {
            let ptr = *slot.task.get_mut();
            if !ptr.is_null() {
                drop(unsafe { Box::from_raw(ptr) });
            }
        }
    }
}
