//! A Rust library for building matched sets from treatment histories in
//! time-series cross-section (panel) data and refining them by covariates.
//!
//! Panels are read from Arrow record batches or Parquet files, balanced into
//! a dense unit x period grid, and handed to a [`PanelMatcher`].

pub mod algorithm;
pub mod config;
pub mod error;
pub mod panel;
pub mod utils;

// Re-export the most common types for easier use
// Core types
pub use config::{
    MissingDataPolicy, PanelMatchConfig, PanelMatchConfigBuilder, Qoi, RefinementMethod,
    ReversalPolicy, SingularCovariancePolicy,
};
pub use error::{PanelMatchError, Result};
pub use panel::{Panel, PanelColumns, UnitId, UnitIndex, UnitKey};

// Matching engine
pub use algorithm::matching::{
    ControlMatch, CovariateSpec, MatchSummary, MatchedSet, MatchedSetCollection, PanelMatchResult,
    PanelMatcher, RefinementDiagnostic, panel_match,
};

// Loading
pub use panel::loader::{read_panel_batches, read_panel_parquet};

// Arrow types
pub use arrow::record_batch::RecordBatch;
