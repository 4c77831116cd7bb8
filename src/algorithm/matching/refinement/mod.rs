//! Refinement of matched sets
//!
//! A [`Refiner`] narrows or weights the candidate controls of treated
//! observations using covariates. One implementation exists per refinement
//! method and is chosen once per run with [`for_method`].
//!
//! Refiners work on groups of candidate sets sharing a treatment period,
//! because propensity models are fitted on the pool of treated and control
//! units at that period. Distance-based refiners simply handle each set of the
//! group on its own.

pub mod mahalanobis;
pub mod propensity;

use std::fmt;
use std::ops::RangeInclusive;

use crate::algorithm::matching::covariates::CovariateFrame;
use crate::algorithm::matching::model::ModelSet;
use crate::algorithm::matching::types::{CandidateSet, ControlMatch, DiagnosticKind};
use crate::config::{PanelMatchConfig, RefinementMethod, SingularCovariancePolicy};
use crate::error::Result;
use crate::panel::{Panel, UnitId};

pub use mahalanobis::Mahalanobis;
pub use propensity::{MarginalStructuralWeight, PropensityMatch, PropensityWeight};

/// Everything a refiner reads besides the candidate sets
#[derive(Debug, Clone, Copy)]
pub struct RefinementContext<'a> {
    /// Panel in the orientation being matched
    pub panel: &'a Panel,
    /// Covariates resolved against the panel
    pub covariates: &'a CovariateFrame<'a>,
    /// History window length
    pub lag: usize,
    /// Last lead offset
    pub max_lead: i64,
    /// Controls kept by matching methods
    pub size_match: usize,
    /// Keep raw distances and scores
    pub verbose: bool,
    /// Use only variances in Mahalanobis refinement
    pub use_diagonal_variance: bool,
    /// Handling of singular covariance matrices and failed model fits
    pub singular_covariance: SingularCovariancePolicy,
}

impl<'a> RefinementContext<'a> {
    /// Context for `panel` under `config`
    #[must_use]
    pub fn new(panel: &'a Panel, covariates: &'a CovariateFrame<'a>, config: &PanelMatchConfig) -> Self {
        Self {
            panel,
            covariates,
            lag: config.effective_lag(),
            max_lead: config.max_lead(),
            size_match: config.size_match,
            verbose: config.verbose,
            use_diagonal_variance: config.use_diagonal_variance,
            singular_covariance: config.singular_covariance,
        }
    }

    /// History window of a treatment at `time`
    #[must_use]
    pub const fn history_window(&self, time: i64) -> RangeInclusive<i64> {
        time - self.lag as i64..=time - 1
    }

    /// Outcome window of a treatment at `time`
    #[must_use]
    pub const fn lead_window(&self, time: i64) -> RangeInclusive<i64> {
        time..=time + self.max_lead
    }
}

/// Result of refining one candidate set
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RefinedSet {
    /// Controls kept, with weights summing to 1 unless empty
    pub controls: Vec<ControlMatch>,
    /// Problem met while refining, if any
    pub diagnostic: Option<DiagnosticKind>,
}

impl RefinedSet {
    /// Every candidate with equal weight
    #[must_use]
    pub fn uniform(controls: &[UnitId]) -> Self {
        let weight = 1.0 / controls.len().max(1) as f64;
        Self {
            controls: controls
                .iter()
                .map(|&unit| ControlMatch::weighted(unit, weight))
                .collect(),
            diagnostic: None,
        }
    }

    /// Every candidate with equal weight, flagged with `diagnostic`
    ///
    /// An empty candidate set stays empty and carries no diagnostic.
    #[must_use]
    pub fn unrefined(controls: &[UnitId], diagnostic: DiagnosticKind) -> Self {
        let mut set = Self::uniform(controls);
        if !controls.is_empty() {
            set.diagnostic = Some(diagnostic);
        }
        set
    }

    /// The first `limit` candidates in panel order with equal weight, flagged
    /// with `diagnostic`
    ///
    /// Matching refiners use this when candidates cannot be ranked, so the
    /// set still holds at most `size_match` controls.
    #[must_use]
    pub fn truncated(controls: &[UnitId], limit: usize, diagnostic: DiagnosticKind) -> Self {
        Self::unrefined(&controls[..controls.len().min(limit)], diagnostic)
    }
}

/// A candidate with the quantity it is ranked or weighted by
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Scored {
    /// Candidate control
    pub unit: UnitId,
    /// Distance to the treated unit (matching) or raw weight (weighting)
    pub value: f64,
    /// Propensity score, if one was estimated
    pub score: Option<f64>,
}

/// Keep the `size_match` candidates with the smallest distance
///
/// Ties keep panel order. Each kept control gets weight `1/k`.
#[must_use]
pub fn select_nearest(mut ranked: Vec<Scored>, size_match: usize, verbose: bool) -> Vec<ControlMatch> {
    ranked.sort_by(|a, b| a.value.total_cmp(&b.value));
    ranked.truncate(size_match);
    let weight = 1.0 / ranked.len().max(1) as f64;
    ranked
        .into_iter()
        .map(|s| ControlMatch {
            unit: s.unit,
            weight,
            distance: verbose.then_some(s.value),
            score: if verbose { s.score } else { None },
        })
        .collect()
}

/// Normalize raw weights to sum to 1, keeping panel order
#[must_use]
pub fn normalize_weights(raw: Vec<Scored>, verbose: bool) -> Vec<ControlMatch> {
    let total: f64 = raw.iter().map(|s| s.value).sum();
    if !(total.is_finite() && total > 0.0) {
        let units: Vec<UnitId> = raw.iter().map(|s| s.unit).collect();
        return RefinedSet::uniform(&units).controls;
    }
    raw.into_iter()
        .map(|s| ControlMatch {
            unit: s.unit,
            weight: s.value / total,
            distance: None,
            score: if verbose { s.score } else { None },
        })
        .collect()
}

/// Refinement of candidate sets by covariates
pub trait Refiner: Send + Sync + fmt::Debug {
    /// Method this refiner implements
    fn method(&self) -> RefinementMethod;

    /// Periods whose covariates the refiner reads for a treatment at `time`
    ///
    /// Listwise deletion drops candidates missing a covariate anywhere in this
    /// window. `None` means covariates are not read.
    fn covariate_window(&self, ctx: &RefinementContext<'_>, time: i64) -> Option<RangeInclusive<i64>>;

    /// Refine candidate sets that share one treatment period
    ///
    /// Returns one [`RefinedSet`] per input set, in order.
    ///
    /// # Errors
    /// Fails only when a numerical problem occurs under
    /// [`SingularCovariancePolicy::Abort`].
    fn refine_group(&self, ctx: &RefinementContext<'_>, group: &[CandidateSet]) -> Result<Vec<RefinedSet>>;
}

/// Equal weights over the full candidate set
#[derive(Debug, Clone, Copy, Default)]
pub struct Uniform;

impl Refiner for Uniform {
    fn method(&self) -> RefinementMethod {
        RefinementMethod::None
    }

    fn covariate_window(&self, _ctx: &RefinementContext<'_>, _time: i64) -> Option<RangeInclusive<i64>> {
        None
    }

    fn refine_group(&self, _ctx: &RefinementContext<'_>, group: &[CandidateSet]) -> Result<Vec<RefinedSet>> {
        Ok(group.iter().map(|set| RefinedSet::uniform(&set.controls)).collect())
    }
}

/// Refiner implementing `method`, drawing propensity models from `models`
#[must_use]
pub fn for_method(method: RefinementMethod, models: &ModelSet) -> Box<dyn Refiner> {
    let model = models.for_balancing(method.uses_cbps());
    match method {
        RefinementMethod::None => Box::new(Uniform),
        RefinementMethod::Mahalanobis => Box::new(Mahalanobis),
        RefinementMethod::PsMatch | RefinementMethod::CbpsMatch => {
            Box::new(PropensityMatch::new(method, model))
        }
        RefinementMethod::PsWeight | RefinementMethod::CbpsWeight => {
            Box::new(PropensityWeight::new(method, model))
        }
        RefinementMethod::PsMsmWeight | RefinementMethod::CbpsMsmWeight => {
            Box::new(MarginalStructuralWeight::new(method, model))
        }
    }
}
