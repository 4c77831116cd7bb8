//! Utility modules shared across the crate
//!
//! - `logging`: standardized log lines and progress bars
//! - `test`: in-memory panel fixtures for tests

pub mod logging;
pub mod test;
