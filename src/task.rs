//! Task structure and submission metadata

use std::fmt;
use std::sync::OnceLock;
use std::time::Instant;

/// Scheduling hint for a dispatched unit of work.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TaskMode {
    /// Short CPU-bound work; counts toward the CPU permit budget.
    NonBlocking,
    /// Work that may block the carrier thread; runs without a CPU permit.
    ProbablyBlocking,
}

/// A submitted unit of work plus its submission timestamp and mode.
pub(crate) struct Task {
    /// User code to run
    runnable: Box<dyn FnOnce() + Send + 'static>,

    /// Monotonic nanosecond timestamp captured at dispatch
    submission_time_ns: u64,

    /// Scheduling hint
    mode: TaskMode,
}

impl Task {
    /// Create a new Task stamped with the current monotonic time
    pub(crate) fn new(runnable: impl FnOnce() + Send + 'static, mode: TaskMode) -> Self {
        Self {
            runnable: Box::new(runnable),
            submission_time_ns: monotonic_ns(),
            mode,
        }
    }

    /// Get the submission timestamp in nanoseconds
    pub(crate) fn submission_time_ns(&self) -> u64 {
        self.submission_time_ns
    }

    /// Get the scheduling mode
    pub(crate) fn mode(&self) -> TaskMode {
        self.mode
    }

    /// Run the task, consuming it
    pub(crate) fn run(self) {
        (self.runnable)()
    }

    /// Backdate the submission timestamp (steal-eligibility tests only)
    #[cfg(test)]
    pub(crate) fn backdate(&mut self, age_ns: u64) {
        self.submission_time_ns = self.submission_time_ns.saturating_sub(age_ns);
    }

    /// Push the submission timestamp into the future so the task stays
    /// steal-ineligible for the whole test, regardless of scheduling delays
    #[cfg(test)]
    pub(crate) fn postdate(&mut self, ns: u64) {
        self.submission_time_ns += ns;
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("submission_time_ns", &self.submission_time_ns)
            .field("mode", &self.mode)
            .finish()
    }
}

/// Monotonic nanoseconds since the first call in this process.
pub(crate) fn monotonic_ns() -> u64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    EPOCH.get_or_init(Instant::now).elapsed().as_nanos() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_task_runs_once() {
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        let task = Task::new(move || flag.store(true, Ordering::Release), TaskMode::NonBlocking);

        assert_eq!(task.mode(), TaskMode::NonBlocking);
        task.run();
        assert!(ran.load(Ordering::Acquire));
    }

    #[test]
    fn test_submission_time_monotonic() {
        let first = Task::new(|| {}, TaskMode::NonBlocking);
        let second = Task::new(|| {}, TaskMode::ProbablyBlocking);

        assert!(second.submission_time_ns() >= first.submission_time_ns());
    }

    #[test]
    fn test_monotonic_ns_advances() {
        let a = monotonic_ns();
        std::thread::sleep(std::time::Duration::from_millis(1));
        let b = monotonic_ns();

        assert!(b > a);
    }
}
