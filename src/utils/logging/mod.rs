//! Logging utilities for output and progress tracking
//!
//! This module provides standardized log lines and indicatif progress bars
//! shared by the loader and the matcher.

pub mod log;
pub mod progress;

// Re-export commonly used functions for convenience
pub use self::log::{log_phase_complete, log_read_complete, log_read_start, log_refinement_problems};
pub use self::progress::{create_main_progress_bar, finish_progress_bar, progress_for};
