//! Worker thread: state machine, find-task/execute/idle loop
//!
//! Workers prefer the global queue when they hold a CPU permit, then their
//! local queue, then stealing from a random victim. Idle workers spin, then
//! yield, then park with an adaptive timeout; workers without a permit park
//! indefinitely on the retired stack until the scheduler revives them.

use crate::permits::CpuPermits;
use crate::queue::{WorkQueue, WORK_STEALING_TIME_RESOLUTION_NS};
use crate::rng::XorShift32;
use crate::scheduler::Shared;
use crate::task::{monotonic_ns, Task, TaskMode};
use rand::Rng;
use std::cell::RefCell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::thread::{self, Thread};
use std::time::Duration;

/// Random probes per steal round and per `unpark_any` round
pub(crate) const STEAL_ATTEMPTS: usize = 4;

/// Busy-loop iterations before an idle CPU worker starts yielding
const MAX_SPINS: u32 = 1000;

/// Yields before an idle CPU worker starts parking
const MAX_YIELDS: u32 = 500;

/// Adaptive park ceiling
const MAX_PARK_TIME_NS: u64 = 1_000_000_000;

/// Initial adaptive park time
const MIN_PARK_TIME_NS: u64 = {
    let quarter = WORK_STEALING_TIME_RESOLUTION_NS / 4;
    let floored = if quarter < 10 { 10 } else { quarter };
    if floored > MAX_PARK_TIME_NS {
        MAX_PARK_TIME_NS
    } else {
        floored
    }
};

/// Lifecycle state of a worker. Written only by the owning thread; other
/// threads read it to pick unpark targets and build diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum WorkerState {
    /// Holds a CPU permit and schedules non-blocking work
    CpuAcquired = 0,
    /// Executing a probably-blocking task without a permit
    Blocking = 1,
    /// Parked, either with an adaptive timeout or indefinitely
    Parking = 2,
    /// No permit; draining the local queue before parking
    Retiring = 3,
    /// Exited the main loop
    Finished = 4,
}

impl WorkerState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::CpuAcquired,
            1 => Self::Blocking,
            2 => Self::Parking,
            3 => Self::Retiring,
            4 => Self::Finished,
            _ => unreachable!("invalid worker state {raw}"),
        }
    }
}

/// Shared handle to one worker: its slot in the scheduler's array.
///
/// The owning thread drives all state transitions and all queue pushes;
/// other threads read the state, steal from the queue, and unpark.
pub(crate) struct Worker {
    index: usize,
    state: AtomicU8,
    /// Local run queue; producer side owned by this worker's thread
    pub(crate) local_queue: WorkQueue,
    /// Park handle, self-registered before the worker can ever be observed
    /// in `Parking` state
    thread: OnceLock<Thread>,
}

impl Worker {
    /// Create a worker handle in the initial `Retiring` state
    pub(crate) fn new(index: usize) -> Self {
        Self {
            index,
            state: AtomicU8::new(WorkerState::Retiring as u8),
            local_queue: WorkQueue::new(),
            thread: OnceLock::new(),
        }
    }

    /// Slot index in the scheduler's worker array
    pub(crate) fn index(&self) -> usize {
        self.index
    }

    /// Current lifecycle state (racy snapshot for non-owner readers)
    pub(crate) fn state(&self) -> WorkerState {
        WorkerState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: WorkerState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Ensure this worker holds a CPU permit, transitioning to
    /// `CpuAcquired` on a fresh acquisition.
    pub(crate) fn try_acquire_cpu(&self, permits: &CpuPermits) -> bool {
        if self.state() == WorkerState::CpuAcquired {
            return true;
        }
        if permits.try_acquire() {
            self.set_state(WorkerState::CpuAcquired);
            return true;
        }
        false
    }

    /// Move to `target`, releasing the CPU permit if one was held.
    /// Returns whether a permit was released.
    pub(crate) fn try_release_cpu(&self, permits: &CpuPermits, target: WorkerState) -> bool {
        let previous = WorkerState::from_u8(self.state.swap(target as u8, Ordering::AcqRel));
        let had_cpu = previous == WorkerState::CpuAcquired;
        if had_cpu {
            permits.release();
        }
        had_cpu
    }

    /// Wake the worker if it is parked. A no-op before thread registration
    /// and for workers that are already awake.
    pub(crate) fn unpark(&self) {
        if let Some(thread) = self.thread.get() {
            thread.unpark();
        }
    }

    fn register_thread(&self) {
        let _ = self.thread.set(thread::current());
    }
}

thread_local! {
    static CURRENT_WORKER: RefCell<Option<CurrentWorker>> = const { RefCell::new(None) };
}

/// Identity of the worker running on the current thread, used by dispatch
/// to route submissions to the local queue.
pub(crate) struct CurrentWorker {
    pub(crate) shared: Weak<Shared>,
    pub(crate) worker: Arc<Worker>,
}

/// Run `f` with the current thread's worker identity, if any
pub(crate) fn with_current_worker<R>(f: impl FnOnce(Option<&CurrentWorker>) -> R) -> R {
    CURRENT_WORKER.with(|slot| f(slot.borrow().as_ref()))
}

/// Thread-side driver for one worker: owns the loop-local backoff counters
/// and the victim-selection RNG.
pub(crate) struct WorkerRun {
    shared: Arc<Shared>,
    worker: Arc<Worker>,
    rng: XorShift32,
    spins: u32,
    yields: u32,
    park_time_ns: u64,
    last_exhaustion_ns: u64,
}

impl WorkerRun {
    /// Prepare the driver; the RNG is seeded once from the process RNG
    pub(crate) fn new(shared: Arc<Shared>, worker: Arc<Worker>) -> Self {
        Self {
            shared,
            worker,
            rng: XorShift32::new(rand::thread_rng().gen()),
            spins: 0,
            yields: 0,
            park_time_ns: MIN_PARK_TIME_NS,
            last_exhaustion_ns: 0,
        }
    }

    /// Worker thread main loop
    pub(crate) fn run(mut self) {
        self.worker.register_thread();
        CURRENT_WORKER.with(|slot| {
            *slot.borrow_mut() = Some(CurrentWorker {
                shared: Arc::downgrade(&self.shared),
                worker: self.worker.clone(),
            });
        });

        while !self.shared.is_terminated() {
            match self.find_task() {
                Some(task) => {
                    let mode = task.mode();
                    self.idle_reset(mode);
                    self.before_task(&task);
                    self.run_safely(task);
                    self.after_task(mode);
                }
                None => self.idle(),
            }
        }

        self.shared.retired.remove(self.worker.index());
        self.worker
            .try_release_cpu(&self.shared.cpu_permits, WorkerState::Finished);
        CURRENT_WORKER.with(|slot| {
            slot.borrow_mut().take();
        });

        #[cfg(debug_assertions)]
        eprintln!("weft worker {} finished", self.worker.index());
    }

    /// Global queue first when a permit is held, then the local queue, then
    /// stealing. Workers without a permit only drain their local queue.
    fn find_task(&mut self) -> Option<Box<Task>> {
        let was_parking = self.worker.state() == WorkerState::Parking;
        let has_permit = self.worker.try_acquire_cpu(&self.shared.cpu_permits);
        if was_parking && has_permit {
            // Self-revival: the worker left `Parking` without being popped,
            // so its retired-stack membership must end here.
            self.shared.retired.remove(self.worker.index());
        }
        if has_permit {
            if let Some(task) = self.poll_global() {
                return Some(task);
            }
        }
        if let Some(task) = self.worker.local_queue.poll() {
            return Some(task);
        }
        if has_permit {
            return self.try_steal();
        }
        None
    }

    fn poll_global(&self) -> Option<Box<Task>> {
        loop {
            match self.shared.global_queue.steal() {
                crossbeam_deque::Steal::Success(task) => return Some(task),
                crossbeam_deque::Steal::Empty => return None,
                crossbeam_deque::Steal::Retry => continue,
            }
        }
    }

    /// Probe random victims; on a successful steal the task has already
    /// landed in our local queue, so poll it back out.
    fn try_steal(&mut self) -> Option<Box<Task>> {
        let created = self.shared.created_workers();
        if created < 2 {
            return None;
        }
        for _ in 0..STEAL_ATTEMPTS {
            let index = self.rng.next_int(created as u32) as usize;
            let Some(victim) = self.shared.worker_at(index) else {
                continue;
            };
            if victim.index() == self.worker.index() {
                continue;
            }
            if self
                .worker
                .local_queue
                .try_steal(&victim.local_queue, &self.shared.global_queue)
            {
                return self.worker.local_queue.poll();
            }
        }
        None
    }

    fn before_task(&mut self, task: &Task) {
        if task.mode() == TaskMode::ProbablyBlocking {
            // Increment before the starvation check below so that
            // request_cpu_worker counts this thread as blocking.
            self.shared.blocking_workers.fetch_add(1, Ordering::SeqCst);
            if self
                .worker
                .try_release_cpu(&self.shared.cpu_permits, WorkerState::Blocking)
            {
                self.shared.request_cpu_worker();
            }
            return;
        }
        // Wake more capacity when idle cores exist and this queue has been
        // sitting on stale work.
        if self.shared.cpu_permits.available() == 0 {
            return;
        }
        let now = monotonic_ns();
        if now.saturating_sub(task.submission_time_ns()) >= WORK_STEALING_TIME_RESOLUTION_NS
            && now.saturating_sub(self.last_exhaustion_ns) >= 5 * WORK_STEALING_TIME_RESOLUTION_NS
        {
            self.last_exhaustion_ns = now;
            self.shared.request_cpu_worker();
        }
    }

    fn run_safely(&self, task: Box<Task>) {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| task.run())) {
            self.shared.panic_handler.handle(payload);
        }
    }

    fn after_task(&mut self, mode: TaskMode) {
        if mode != TaskMode::ProbablyBlocking {
            return;
        }
        self.shared.blocking_workers.fetch_sub(1, Ordering::SeqCst);
        let state = self.worker.state();
        debug_assert_eq!(
            state,
            WorkerState::Blocking,
            "worker {} finished a blocking task in state {state:?}",
            self.worker.index()
        );
        self.worker.set_state(WorkerState::Retiring);
    }

    fn idle_reset(&mut self, mode: TaskMode) {
        if self.worker.state() == WorkerState::Parking {
            debug_assert_eq!(mode, TaskMode::ProbablyBlocking);
            self.shared.retired.remove(self.worker.index());
            self.worker.set_state(WorkerState::Blocking);
            self.park_time_ns = MIN_PARK_TIME_NS;
        }
        self.spins = 0;
        self.yields = 0;
    }

    fn idle(&mut self) {
        if self.worker.state() == WorkerState::CpuAcquired {
            self.cpu_worker_idle();
        } else {
            self.blocking_worker_idle();
        }
    }

    /// Adaptive backoff while holding a permit: spin, yield, then release
    /// the permit and park with a growing timeout.
    fn cpu_worker_idle(&mut self) {
        if self.spins < MAX_SPINS {
            self.spins += 1;
            std::hint::spin_loop();
            return;
        }
        if self.yields < MAX_YIELDS {
            self.yields += 1;
            thread::yield_now();
            return;
        }
        self.park_time_ns = (self.park_time_ns * 3 / 2).min(MAX_PARK_TIME_NS);
        self.worker
            .try_release_cpu(&self.shared.cpu_permits, WorkerState::Parking);
        thread::park_timeout(Duration::from_nanos(self.park_time_ns));
    }

    /// Permit-less idle: enroll into the retired stack and park until the
    /// scheduler revives this worker. The global queue is re-checked after
    /// enrollment so a dispatch racing with it cannot strand a task.
    fn blocking_worker_idle(&mut self) {
        self.worker.set_state(WorkerState::Parking);
        self.shared.retired.push(self.worker.index());
        if self.shared.is_terminated() {
            return;
        }
        // Global work this worker could take (a permit is free) must not be
        // left behind a racing enrollment; permit-less work is the current
        // permit holders' job, so parking is safe then.
        if self.shared.cpu_permits.available() > 0 && !self.shared.global_queue.is_empty() {
            return;
        }
        thread::park();
    }
}
