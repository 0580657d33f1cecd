//! priosched
//!
//! Priority task scheduling on an elastic thread pool, plus a cooperative
//! scheduler that only runs work when its owner ticks it.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use priosched::{PriorityScheduler, RecurrenceMode, Scheduler, SchedulerConfig, TaskPriority};
//!
//! let scheduler = PriorityScheduler::new(&SchedulerConfig::default());
//! scheduler
//!     .submit_recurring(
//!         || println!("heartbeat"),
//!         Duration::ZERO,
//!         Duration::from_secs(1),
//!         RecurrenceMode::FixedRate,
//!         Some(TaskPriority::Low),
//!     )
//!     .unwrap();
//! ```
//!
//! # Crate Features
//!
//! - `strict`: check queue invariants after every queue mutation

#![warn(rust_2018_idioms)]

pub mod runtime;
pub mod util;

pub use runtime::scheduler::{
    is_interrupted, PriorityScheduler, RecurrenceMode, Scheduler, SchedulerConfig, SchedulerError,
    SchedulerResult, ShutdownMode, TaskHandle, TaskPriority, TickScheduler,
};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Crate name
pub const NAME: &str = "priosched";
