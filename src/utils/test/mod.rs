//! Test utilities
//!
//! In-memory panel fixtures shared by unit tests and the integration suite.


// Re-export commonly used functions for convenience
pub use fixtures::{
    example_three_unit_batch, generated_panel_batch, long_panel_batch, panel_from_histories,
};
