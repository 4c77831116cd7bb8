//! Matched-set construction and refinement for panel data
//!
//! This module implements the matching engine. It includes:
//!
//! 1. Treatment history matching with configurable missing-data and
//!    reversal policies
//! 2. Exact-match and listwise-deletion constraints
//! 3. Refinement by Mahalanobis distance or propensity scores, with
//!    matching, weighting and marginal structural weighting variants
//! 4. Result assembly with original unit identifiers
//!
//! Treated observations are independent of each other, so the work is spread
//! over rayon's thread pool for large panels. Output order does not depend on
//! threading.

pub mod assemble;
pub mod constraints;
pub mod covariates;
pub mod history;
pub mod matcher;
pub mod model;
pub mod refinement;
pub mod types;

// Re-export key types
pub use covariates::{CovariateSpec, CovariateTerm, Transform};
pub use matcher::{PanelMatcher, panel_match};
pub use model::{CovariateBalancingModel, LogisticModel, ModelSet, PropensityModel};
pub use refinement::{Refiner, for_method};
pub use types::{
    ControlMatch, DiagnosticKind, MatchSummary, MatchedSet, MatchedSetCollection, MatchedSetMetadata,
    PanelMatchResult, RefinementDiagnostic, TreatedObservation,
};
