//! Utilities for managing program execution flow.

pub mod task_tracker;
