//! Error handling for panel matching.
//!
//! Configuration and data problems abort a call before any matching work
//! starts. Numerical trouble inside a single matched set is not an error by
//! default; it is reported as a [`RefinementDiagnostic`](crate::algorithm::matching::RefinementDiagnostic)
//! on the returned collection instead.

use std::io;

use arrow::error::ArrowError;
use parquet::errors::ParquetError;

/// Errors raised while validating input or constructing matched sets
#[derive(Debug, thiserror::Error)]
pub enum PanelMatchError {
    /// Invalid or contradictory configuration
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Input data does not satisfy the panel contract
    #[error("Data validation error: {0}")]
    DataValidation(String),

    /// The same (unit, time) pair appears more than once
    #[error("Duplicate key: unit {unit} appears more than once at time {time}")]
    DuplicateKey {
        /// Original unit identifier, rendered for display
        unit: String,
        /// Time period of the duplicate row
        time: i64,
    },

    /// Unit identifier column has a type that cannot be encoded
    #[error("Invalid identifier type: {0}")]
    InvalidIdentifierType(String),

    /// Attempted to decode an internal id that was never issued
    #[error("Unknown internal unit id: {0}")]
    UnknownUnitId(u32),

    /// Refinement hit a numerically unusable matrix and the policy is to abort
    #[error("Numerical instability: {0}")]
    NumericalInstability(String),

    /// Propensity or covariate-balancing model failed to fit
    #[error("Model fit error: {0}")]
    ModelFit(String),

    /// Arrow error
    #[error("Arrow error: {0}")]
    Arrow(#[from] ArrowError),

    /// Error processing Parquet data
    #[error("Parquet error: {0}")]
    Parquet(#[from] ParquetError),

    /// Error opening or reading a file
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Error decoding a configuration file
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PanelMatchError {
    /// Shorthand for a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// Shorthand for a data validation error
    pub fn data(message: impl Into<String>) -> Self {
        Self::DataValidation(message.into())
    }

    /// Whether the error was caused by the caller's configuration rather than the data
    #[must_use]
    pub const fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration(_))
    }
}

/// Result type for panel matching operations
pub type Result<T> = std::result::Result<T, PanelMatchError>;
