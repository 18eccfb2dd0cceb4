//! Scheduler: dispatch entry point, pool resizing, shutdown
//!
//! The scheduler owns the worker array, the global queue, the CPU permits
//! and the retired-worker stack. Dispatch prefers the calling worker's local
//! queue and falls back to the global queue; both paths may revive a parked
//! worker or grow the pool.

use crate::permits::CpuPermits;
use crate::queue::{GlobalQueue, QUEUE_SIZE_OFFLOAD_THRESHOLD};
use crate::task::{Task, TaskMode};
use crate::worker::{with_current_worker, Worker, WorkerRun, WorkerState, STEAL_ATTEMPTS};
use crate::SchedulerError;
use parking_lot::Mutex;
use rand::Rng;
use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::thread::{self, JoinHandle};

/// Hard cap on `max_pool_size`, far above any sane configuration
const MAX_SUPPORTED_POOL_SIZE: usize = 1 << 21;

/// Default `max_pool_size` multiplier over the core pool size
const MAX_POOL_FACTOR: usize = 1024;

/// Sink for panics escaping dispatched tasks.
///
/// The worker survives the panic; the payload is handed here out-of-band.
pub trait PanicHandler: Send + Sync {
    /// Called on the worker thread that caught the panic
    fn handle(&self, payload: Box<dyn Any + Send>);
}

/// Default panic sink that reports to stderr.
pub struct StderrPanicHandler;

impl PanicHandler for StderrPanicHandler {
    fn handle(&self, payload: Box<dyn Any + Send>) {
        let message = if let Some(message) = payload.downcast_ref::<&str>() {
            *message
        } else if let Some(message) = payload.downcast_ref::<String>() {
            message.as_str()
        } else {
            "non-string panic payload"
        };
        eprintln!("weft: dispatched task panicked: {message}");
    }
}

/// Workers that finished their local queues and parked indefinitely,
/// available for immediate revival. Most recently retired first.
pub(crate) struct RetiredStack {
    workers: Mutex<Vec<usize>>,
}

impl RetiredStack {
    fn new() -> Self {
        Self {
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Enroll a worker; re-enrolling while already a member is a no-op, so a
    /// worker appears at most once.
    pub(crate) fn push(&self, index: usize) {
        let mut workers = self.workers.lock();
        if !workers.contains(&index) {
            workers.push(index);
        }
    }

    /// Take the most recently retired worker
    pub(crate) fn pop(&self) -> Option<usize> {
        self.workers.lock().pop()
    }

    /// Drop a worker that revived itself instead of being popped, so only
    /// parked workers remain members
    pub(crate) fn remove(&self, index: usize) {
        let mut workers = self.workers.lock();
        if let Some(position) = workers.iter().position(|&member| member == index) {
            workers.remove(position);
        }
    }
}

/// Outcome of attempting to place a task on the calling worker's queue
enum Submission {
    Added,
    AddedRequiresHelp,
    NotAdded(Box<Task>),
}

/// State shared between the scheduler handle and its worker threads
pub(crate) struct Shared {
    core_pool_size: usize,
    max_pool_size: usize,

    /// One slot per potential worker; each slot is written at most once and
    /// read without locks
    workers: Box<[OnceLock<Arc<Worker>>]>,

    /// Number of assigned worker slots; grows by CAS so every index is
    /// handed out exactly once
    created_workers: AtomicUsize,

    /// Workers currently executing probably-blocking tasks
    pub(crate) blocking_workers: AtomicUsize,

    terminated: AtomicBool,

    pub(crate) global_queue: GlobalQueue,
    pub(crate) cpu_permits: CpuPermits,
    pub(crate) retired: RetiredStack,

    join_handles: Mutex<Vec<JoinHandle<()>>>,

    /// Worker creations that have passed the termination check but not yet
    /// pushed their join handle; `close` waits for this to drain
    spawns_in_flight: AtomicUsize,

    pub(crate) panic_handler: Arc<dyn PanicHandler>,

    /// Back-reference to the owning `Arc`, needed to hand worker threads
    /// their own handle on the shared state
    self_handle: Weak<Shared>,
}

impl Shared {
    pub(crate) fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    pub(crate) fn created_workers(&self) -> usize {
        self.created_workers.load(Ordering::Acquire)
    }

    /// Worker at `index`, or None for an unassigned slot or one whose
    /// publication is still racing the `created_workers` bump
    pub(crate) fn worker_at(&self, index: usize) -> Option<&Arc<Worker>> {
        self.workers.get(index).and_then(|slot| slot.get())
    }

    /// Find CPU capacity for freshly enqueued work: revive a retired worker,
    /// grow the pool while blocking workers outnumber the cores, or wake any
    /// parked worker.
    pub(crate) fn request_cpu_worker(&self) {
        if self.cpu_permits.available() == 0 {
            return;
        }
        while let Some(index) = self.retired.pop() {
            let Some(worker) = self.worker_at(index) else {
                continue;
            };
            // Only a worker still parked counts as a hand-off; an entry left
            // behind by a self-revived worker is discarded and the request
            // falls through to creating or waking capacity instead.
            if worker.state() == WorkerState::Parking {
                worker.unpark();
                return;
            }
        }
        let created = self.created_workers();
        let blocking = self.blocking_workers.load(Ordering::SeqCst);
        if created.saturating_sub(blocking) < self.core_pool_size {
            self.create_worker();
            return;
        }
        self.unpark_any();
    }

    fn create_worker(&self) -> bool {
        // Registered before the termination check so that a concurrent
        // `close` either stops the creation here or waits for its handle.
        // Both sides use SeqCst: one of them must observe the other.
        self.spawns_in_flight.fetch_add(1, Ordering::SeqCst);
        let created =
            !self.terminated.load(Ordering::SeqCst) && self.try_create_worker();
        self.spawns_in_flight.fetch_sub(1, Ordering::SeqCst);
        created
    }

    fn try_create_worker(&self) -> bool {
        loop {
            if self.is_terminated() {
                return false;
            }
            let created = self.created_workers.load(Ordering::Acquire);
            if created >= self.max_pool_size || self.cpu_permits.available() == 0 {
                return false;
            }
            let blocking = self.blocking_workers.load(Ordering::SeqCst);
            if created.saturating_sub(blocking) >= self.core_pool_size {
                return false;
            }
            if self
                .created_workers
                .compare_exchange(created, created + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                continue;
            }

            let worker = Arc::new(Worker::new(created));
            if self.workers[created].set(worker.clone()).is_err() {
                unreachable!("worker slot {created} assigned twice");
            }
            let shared = self
                .self_handle
                .upgrade()
                .expect("shared state outlives its workers");
            let run = WorkerRun::new(shared, worker);
            let handle = thread::Builder::new()
                .name(format!("weft-worker-{created}"))
                .spawn(move || run.run())
                .expect("failed to spawn worker thread");
            self.join_handles.lock().push(handle);
            return true;
        }
    }

    /// Probe a few random slots for a parked worker. The race where the
    /// victim wakes up on its own first is benign: the unpark token just
    /// makes its next park return immediately.
    fn unpark_any(&self) {
        let created = self.created_workers();
        if created == 0 {
            return;
        }
        let mut rng = rand::thread_rng();
        for _ in 0..STEAL_ATTEMPTS {
            let index = rng.gen_range(0..created);
            if let Some(worker) = self.worker_at(index) {
                if worker.state() == WorkerState::Parking {
                    worker.unpark();
                    return;
                }
            }
        }
    }
}

/// Elastic work-stealing pool of worker threads for short CPU-bound units
/// of work that can absorb possibly-blocking units without a separate pool.
///
/// Admission to CPU-bound scheduling is gated by `core_pool_size` permits;
/// blocking tasks release their permit for the duration, letting the pool
/// grow up to `max_pool_size` threads.
pub struct Scheduler {
    shared: Arc<Shared>,
}

impl Scheduler {
    /// Create a scheduler with `core_pool_size` CPU permits and the default
    /// thread cap of `core_pool_size * 1024`.
    pub fn new(core_pool_size: usize) -> Result<Self, SchedulerError> {
        let max = core_pool_size
            .saturating_mul(MAX_POOL_FACTOR)
            .min(MAX_SUPPORTED_POOL_SIZE);
        Self::with_pool_sizes(core_pool_size, max)
    }

    /// Create a scheduler with explicit pool bounds
    pub fn with_pool_sizes(
        core_pool_size: usize,
        max_pool_size: usize,
    ) -> Result<Self, SchedulerError> {
        Self::with_panic_handler(core_pool_size, max_pool_size, Arc::new(StderrPanicHandler))
    }

    /// Create a scheduler with explicit pool bounds and a custom sink for
    /// panics escaping dispatched tasks
    pub fn with_panic_handler(
        core_pool_size: usize,
        max_pool_size: usize,
        panic_handler: Arc<dyn PanicHandler>,
    ) -> Result<Self, SchedulerError> {
        if core_pool_size < 1 {
            return Err(SchedulerError::InvalidCorePoolSize(core_pool_size));
        }
        if max_pool_size < core_pool_size {
            return Err(SchedulerError::InvalidMaxPoolSize {
                core: core_pool_size,
                max: max_pool_size,
            });
        }
        if max_pool_size > MAX_SUPPORTED_POOL_SIZE {
            return Err(SchedulerError::UnsupportedPoolSize(max_pool_size));
        }

        Ok(Self {
            shared: Arc::new_cyclic(|self_handle| Shared {
                core_pool_size,
                max_pool_size,
                workers: (0..max_pool_size).map(|_| OnceLock::new()).collect(),
                created_workers: AtomicUsize::new(0),
                blocking_workers: AtomicUsize::new(0),
                terminated: AtomicBool::new(false),
                global_queue: GlobalQueue::new(),
                cpu_permits: CpuPermits::new(core_pool_size),
                retired: RetiredStack::new(),
                join_handles: Mutex::new(Vec::new()),
                spawns_in_flight: AtomicUsize::new(0),
                panic_handler,
                self_handle: self_handle.clone(),
            }),
        })
    }

    /// Dispatch a non-blocking unit of work with semi-FIFO local placement
    pub fn dispatch<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.dispatch_with(f, TaskMode::NonBlocking, false);
    }

    /// Dispatch a unit of work with an explicit mode; `fair` requests strict
    /// tail insertion into the local queue instead of head placement.
    ///
    /// The task runs exactly once unless the scheduler is closed before a
    /// worker polls it, in which case it runs at most once.
    pub fn dispatch_with<F>(&self, f: F, mode: TaskMode, fair: bool)
    where
        F: FnOnce() + Send + 'static,
    {
        assert!(
            !self.shared.is_terminated(),
            "dispatch on a closed scheduler"
        );
        let task = Box::new(Task::new(f, mode));
        match self.submit_to_local_queue(task, fair) {
            Submission::Added => {}
            Submission::AddedRequiresHelp => self.shared.request_cpu_worker(),
            Submission::NotAdded(task) => {
                self.shared.global_queue.push(task);
                self.shared.request_cpu_worker();
            }
        }
    }

    /// Place the task on the calling worker's local queue when the caller is
    /// a worker of this scheduler and admission allows it.
    fn submit_to_local_queue(&self, task: Box<Task>, fair: bool) -> Submission {
        with_current_worker(|current| {
            let Some(current) = current else {
                return Submission::NotAdded(task);
            };
            let Some(shared) = current.shared.upgrade() else {
                return Submission::NotAdded(task);
            };
            if !Arc::ptr_eq(&shared, &self.shared) {
                return Submission::NotAdded(task);
            }
            let worker = &current.worker;

            let mut result = Submission::Added;
            if task.mode() == TaskMode::NonBlocking {
                if worker.state() == WorkerState::Blocking {
                    // A blocking worker producing CPU work hints that more
                    // CPU capacity is needed.
                    result = Submission::AddedRequiresHelp;
                } else if !worker.try_acquire_cpu(&shared.cpu_permits) {
                    return Submission::NotAdded(task);
                }
            }

            let kept_local = if fair {
                worker.local_queue.add_last(task, &shared.global_queue)
            } else {
                worker.local_queue.add(task, &shared.global_queue)
            };
            if !kept_local {
                return Submission::AddedRequiresHelp;
            }
            if worker.local_queue.buffer_size() >= QUEUE_SIZE_OFFLOAD_THRESHOLD {
                return Submission::AddedRequiresHelp;
            }
            result
        })
    }

    /// Mark the scheduler terminated and join every created worker.
    /// Idempotent; subsequent calls return immediately.
    pub fn close(&self) {
        if self.shared.terminated.swap(true, Ordering::SeqCst) {
            return;
        }
        let current = thread::current().id();
        loop {
            // Snapshot before draining: once the counter reads zero, every
            // spawned handle is already in `join_handles`, so an empty drain
            // after a zero snapshot means no worker can be missed.
            let spawning = self.shared.spawns_in_flight.load(Ordering::SeqCst);
            let handles: Vec<_> = self.shared.join_handles.lock().drain(..).collect();
            if handles.is_empty() {
                if spawning == 0 {
                    break;
                }
                // A racing dispatch is still spawning a worker; wait for its
                // handle to land so it gets joined too.
                thread::yield_now();
                continue;
            }
            for handle in handles {
                if handle.thread().id() == current {
                    continue;
                }
                handle.thread().unpark();
                handle.join().expect("failed to join worker thread");
            }
        }
    }

    /// Number of CPU permits
    pub fn core_pool_size(&self) -> usize {
        self.shared.core_pool_size
    }

    /// Upper bound on worker threads
    pub fn max_pool_size(&self) -> usize {
        self.shared.max_pool_size
    }

    /// Number of workers created so far
    pub fn created_workers(&self) -> usize {
        self.shared.created_workers()
    }

    /// Whether `close` has begun
    pub fn is_terminated(&self) -> bool {
        self.shared.is_terminated()
    }
}

impl Default for Scheduler {
    /// Scheduler with one CPU permit per available core
    fn default() -> Self {
        Self::new(num_cpus::get()).expect("default pool sizes are valid")
    }
}

impl fmt::Display for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shared = &self.shared;
        let mut cpu_workers = 0;
        let mut blocking_workers = 0;
        let mut parked_workers = 0;
        let mut retired_workers = 0;
        let mut finished_workers = 0;
        let mut queue_sizes = Vec::new();

        for index in 0..shared.created_workers() {
            let Some(worker) = shared.worker_at(index) else {
                continue;
            };
            let size = worker.local_queue.size();
            match worker.state() {
                WorkerState::CpuAcquired => {
                    cpu_workers += 1;
                    queue_sizes.push(format!("{size}c"));
                }
                WorkerState::Blocking => {
                    blocking_workers += 1;
                    queue_sizes.push(format!("{size}b"));
                }
                WorkerState::Parking => parked_workers += 1,
                WorkerState::Retiring => {
                    retired_workers += 1;
                    if size > 0 {
                        queue_sizes.push(format!("{size}r"));
                    }
                }
                WorkerState::Finished => finished_workers += 1,
            }
        }

        write!(
            f,
            "[core pool size = {}, CPU workers = {}, blocking workers = {}, \
             parked workers = {}, retired workers = {}, finished workers = {}, \
             running workers queues = [{}], global queue size = {}]",
            shared.core_pool_size,
            cpu_workers,
            blocking_workers,
            parked_workers,
            retired_workers,
            finished_workers,
            queue_sizes.join(", "),
            shared.global_queue.len(),
        )
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.close();
    }
}
