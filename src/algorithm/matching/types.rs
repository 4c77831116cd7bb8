//! Type definitions for matched sets
//!
//! This module contains the types produced by the matching engine. Sets are
//! generic over the unit identifier so the same structures carry internal
//! [`UnitId`]s during matching and original [`UnitKey`]s after decoding.

use std::fmt;

use serde::Serialize;
use smallvec::SmallVec;

use crate::config::{Qoi, RefinementMethod};
use crate::panel::{UnitId, UnitKey};

/// A unit that starts treatment at `time`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TreatedObservation {
    /// Treated unit
    pub unit: UnitId,
    /// Period of treatment onset
    pub time: i64,
}

impl TreatedObservation {
    /// Create a treated observation
    #[must_use]
    pub const fn new(unit: UnitId, time: i64) -> Self {
        Self { unit, time }
    }
}

/// Candidate controls of one treated observation before refinement
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateSet {
    /// The treated observation
    pub treated: TreatedObservation,
    /// Candidate control units in panel order
    pub controls: SmallVec<[UnitId; 16]>,
}

/// A control unit in a matched set
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ControlMatch<Id = UnitId> {
    /// Control unit
    pub unit: Id,
    /// Normalized weight within the matched set
    pub weight: f64,
    /// Raw distance to the treated unit, kept in verbose mode
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distance: Option<f64>,
    /// Raw propensity score, or the unnormalized path weight under MSM
    /// weighting, kept in verbose mode
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
}

impl<Id> ControlMatch<Id> {
    /// Control with a weight and no diagnostics
    pub const fn weighted(unit: Id, weight: f64) -> Self {
        Self {
            unit,
            weight,
            distance: None,
            score: None,
        }
    }

    fn try_map<T, E>(self, f: &mut impl FnMut(Id) -> Result<T, E>) -> Result<ControlMatch<T>, E> {
        Ok(ControlMatch {
            unit: f(self.unit)?,
            weight: self.weight,
            distance: self.distance,
            score: self.score,
        })
    }
}

/// Controls matched to one treated observation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchedSet<Id = UnitId> {
    /// Treated unit
    pub unit: Id,
    /// Period of treatment onset
    pub time: i64,
    /// Controls with their weights, in panel order for weighting methods and
    /// by increasing distance for matching methods
    pub controls: Vec<ControlMatch<Id>>,
}

impl<Id> MatchedSet<Id> {
    /// Whether no control qualified for this treated observation
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.controls.is_empty()
    }

    /// Number of controls
    #[must_use]
    pub fn len(&self) -> usize {
        self.controls.len()
    }

    /// Control units in stored order
    pub fn control_units(&self) -> impl Iterator<Item = &Id> {
        self.controls.iter().map(|c| &c.unit)
    }

    /// Sum of control weights
    #[must_use]
    pub fn total_weight(&self) -> f64 {
        self.controls.iter().map(|c| c.weight).sum()
    }

    /// Weight of `unit`, `None` if it is not a control of this set
    pub fn weight_of(&self, unit: &Id) -> Option<f64>
    where
        Id: PartialEq,
    {
        self.controls.iter().find(|c| &c.unit == unit).map(|c| c.weight)
    }

    /// Convert the unit identifiers, stopping at the first failure
    pub fn try_map_ids<T, E>(self, f: &mut impl FnMut(Id) -> Result<T, E>) -> Result<MatchedSet<T>, E> {
        Ok(MatchedSet {
            unit: f(self.unit)?,
            time: self.time,
            controls: self
                .controls
                .into_iter()
                .map(|c| c.try_map(f))
                .collect::<Result<_, _>>()?,
        })
    }
}

/// Kind of non-fatal problem met while refining a matched set
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum DiagnosticKind {
    /// Covariance matrix could not be inverted; the set was left unrefined
    SingularCovariance,
    /// Covariance matrix could not be inverted; the diagonal variances were used
    DiagonalFallback,
    /// The treated unit or every candidate lacked complete covariates
    InsufficientCovariates,
    /// The propensity model failed; the set was left unrefined
    ModelFit(String),
}

impl fmt::Display for DiagnosticKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SingularCovariance => f.write_str("singular covariance matrix, set left unrefined"),
            Self::DiagonalFallback => f.write_str("singular covariance matrix, diagonal variances used"),
            Self::InsufficientCovariates => f.write_str("insufficient covariate data, set left unrefined"),
            Self::ModelFit(message) => write!(f, "propensity model failed ({message}), set left unrefined"),
        }
    }
}

/// A non-fatal refinement problem attached to one treated observation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RefinementDiagnostic<Id = UnitId> {
    /// Treated unit
    pub unit: Id,
    /// Period of treatment onset
    pub time: i64,
    /// What happened
    #[serde(flatten)]
    pub kind: DiagnosticKind,
}

impl<Id> RefinementDiagnostic<Id> {
    fn try_map<T, E>(self, f: &mut impl FnMut(Id) -> Result<T, E>) -> Result<RefinementDiagnostic<T>, E> {
        Ok(RefinementDiagnostic {
            unit: f(self.unit)?,
            time: self.time,
            kind: self.kind,
        })
    }
}

impl<Id: fmt::Display> fmt::Display for RefinementDiagnostic<Id> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unit {} at time {}: {}", self.unit, self.time, self.kind)
    }
}

/// Settings a matched-set collection was produced with
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchedSetMetadata {
    /// Which side the sets describe: `att` for treated units, `atc` for controls
    pub qoi: Qoi,
    /// Lead window
    pub lead: Vec<i64>,
    /// Outcome column
    pub outcome_var: String,
    /// Whether treatment reversal was forbidden
    pub forbid_treatment_reversal: bool,
    /// History lag used for matching
    pub lag: usize,
    /// Refinement applied
    pub refinement_method: RefinementMethod,
    /// Exact-match variables applied before refinement
    pub exact_match_variables: Vec<String>,
}

/// Matched sets for one quantity of interest
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchedSetCollection<Id = UnitId> {
    /// Settings the sets were produced with
    pub metadata: MatchedSetMetadata,
    /// Matched sets ordered by (unit, time)
    pub sets: Vec<MatchedSet<Id>>,
    /// Non-fatal refinement problems
    pub diagnostics: Vec<RefinementDiagnostic<Id>>,
}

impl<Id> MatchedSetCollection<Id> {
    /// Number of matched sets
    #[must_use]
    pub fn len(&self) -> usize {
        self.sets.len()
    }

    /// Whether no treated observation qualified
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }

    /// Iterate over matched sets
    pub fn iter(&self) -> std::slice::Iter<'_, MatchedSet<Id>> {
        self.sets.iter()
    }

    /// Matched set of the treated observation (`unit`, `time`)
    pub fn get(&self, unit: &Id, time: i64) -> Option<&MatchedSet<Id>>
    where
        Id: PartialEq,
    {
        self.sets.iter().find(|s| &s.unit == unit && s.time == time)
    }

    /// Summary statistics over set sizes
    #[must_use]
    pub fn summary(&self) -> MatchSummary {
        let sizes = self.sets.iter().map(MatchedSet::len);
        let total_controls: usize = sizes.clone().sum();
        MatchSummary {
            qoi: self.metadata.qoi,
            sets: self.sets.len(),
            empty_sets: self.sets.iter().filter(|s| s.is_empty()).count(),
            total_controls,
            min_size: sizes.clone().min().unwrap_or(0),
            max_size: sizes.max().unwrap_or(0),
            mean_size: if self.sets.is_empty() {
                0.0
            } else {
                total_controls as f64 / self.sets.len() as f64
            },
            diagnostics: self.diagnostics.len(),
        }
    }

    /// Convert the unit identifiers of every set and diagnostic
    pub fn try_map_ids<T, E>(self, mut f: impl FnMut(Id) -> Result<T, E>) -> Result<MatchedSetCollection<T>, E> {
        Ok(MatchedSetCollection {
            metadata: self.metadata,
            sets: self
                .sets
                .into_iter()
                .map(|s| s.try_map_ids(&mut f))
                .collect::<Result<_, _>>()?,
            diagnostics: self
                .diagnostics
                .into_iter()
                .map(|d| d.try_map(&mut f))
                .collect::<Result<_, _>>()?,
        })
    }
}

impl<'a, Id> IntoIterator for &'a MatchedSetCollection<Id> {
    type Item = &'a MatchedSet<Id>;
    type IntoIter = std::slice::Iter<'a, MatchedSet<Id>>;

    fn into_iter(self) -> Self::IntoIter {
        self.sets.iter()
    }
}

/// Size statistics of a matched-set collection
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MatchSummary {
    /// Side the collection describes
    pub qoi: Qoi,
    /// Number of matched sets
    pub sets: usize,
    /// Sets without any control
    pub empty_sets: usize,
    /// Controls over all sets
    pub total_controls: usize,
    /// Smallest set size
    pub min_size: usize,
    /// Largest set size
    pub max_size: usize,
    /// Mean set size
    pub mean_size: f64,
    /// Number of refinement diagnostics
    pub diagnostics: usize,
}

impl fmt::Display for MatchSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} matched sets ({} empty), {} controls, size min/mean/max {}/{:.2}/{}, {} diagnostics",
            self.qoi,
            self.sets,
            self.empty_sets,
            self.total_controls,
            self.min_size,
            self.mean_size,
            self.max_size,
            self.diagnostics
        )
    }
}

/// Matched sets for every side the quantity of interest requires
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PanelMatchResult<Id = UnitKey> {
    /// Requested quantity of interest
    pub qoi: Qoi,
    /// Sets for treated units, present for `att` and `ate`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub att: Option<MatchedSetCollection<Id>>,
    /// Sets for control units, present for `atc` and `ate`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub atc: Option<MatchedSetCollection<Id>>,
}

impl<Id> PanelMatchResult<Id> {
    /// Collection for one side, `Qoi::Ate` is not a side and yields `None`
    #[must_use]
    pub const fn side(&self, side: Qoi) -> Option<&MatchedSetCollection<Id>> {
        match side {
            Qoi::Att => self.att.as_ref(),
            Qoi::Atc => self.atc.as_ref(),
            Qoi::Ate => None,
        }
    }

    /// Present collections, `att` first
    pub fn collections(&self) -> impl Iterator<Item = &MatchedSetCollection<Id>> {
        self.att.iter().chain(self.atc.iter())
    }
}
