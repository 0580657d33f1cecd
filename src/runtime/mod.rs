//! Runtime system
//!
//! This module contains the task schedulers and their worker threads.

pub mod scheduler;
