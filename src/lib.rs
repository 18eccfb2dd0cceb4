//! Elastic work-stealing task scheduler
//!
//! This crate provides a pool of worker threads for short CPU-bound units of
//! work that dynamically absorbs possibly-blocking units without routing
//! them to a separate pool:
//! - Bounded per-worker run queues with semi-FIFO placement and overflow to
//!   a global injector
//! - Work stealing with temporal affinity (only aged tasks are stolen)
//! - CPU-permit admission control and elastic growth while workers block
//! - Adaptive spin/yield/park idling with indefinite parking for retired
//!   workers
//!
//! ```
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use std::sync::Arc;
//! use weft::{Scheduler, TaskMode};
//!
//! let scheduler = Scheduler::new(2).expect("valid pool size");
//! let done = Arc::new(AtomicUsize::new(0));
//!
//! let counter = done.clone();
//! scheduler.dispatch(move || {
//!     counter.fetch_add(1, Ordering::Relaxed);
//! });
//! let counter = done.clone();
//! scheduler.dispatch_with(
//!     move || {
//!         counter.fetch_add(1, Ordering::Relaxed);
//!     },
//!     TaskMode::ProbablyBlocking,
//!     false,
//! );
//!
//! while done.load(Ordering::Relaxed) < 2 {
//!     std::thread::yield_now();
//! }
//! scheduler.close();
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

mod permits;
mod queue;
mod rng;
mod scheduler;
mod task;
mod worker;

pub use scheduler::{PanicHandler, Scheduler, StderrPanicHandler};
pub use task::TaskMode;

/// Scheduler construction errors
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    /// The core pool must hold at least one CPU permit
    #[error("core pool size must be at least 1, got {0}")]
    InvalidCorePoolSize(usize),

    /// The thread cap cannot be below the core pool size
    #[error("max pool size {max} is smaller than core pool size {core}")]
    InvalidMaxPoolSize {
        /// Requested core pool size
        core: usize,
        /// Requested max pool size
        max: usize,
    },

    /// The thread cap exceeds the supported limit
    #[error("max pool size {0} exceeds the supported limit")]
    UnsupportedPoolSize(usize),
}
