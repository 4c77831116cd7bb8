//! Propensity score refinement
//!
//! Scores come from a [`PropensityModel`] fitted once per treatment period on
//! the pool of treated units of that period and the union of their candidate
//! controls. Matching keeps the candidates whose score is closest to the
//! treated unit's, weighting assigns each candidate its propensity odds and
//! the marginal structural variant multiplies the odds over the lead window.

use std::ops::RangeInclusive;
use std::sync::Arc;

use itertools::Itertools;
use log::{debug, trace};
use rustc_hash::FxHashMap;

use crate::algorithm::matching::model::{PropensityModel, design_matrix};
use crate::algorithm::matching::refinement::{
    RefinedSet, RefinementContext, Refiner, Scored, normalize_weights, select_nearest,
};
use crate::algorithm::matching::types::{CandidateSet, DiagnosticKind};
use crate::config::{RefinementMethod, SingularCovariancePolicy};
use crate::error::{PanelMatchError, Result};
use crate::panel::UnitId;

/// Scores of every pool member with complete covariates
type PoolScores = FxHashMap<UnitId, f64>;

/// Why a pool could not be scored
enum PoolFailure {
    /// No treated or no control row had complete covariates
    Insufficient,
    /// The model failed on the pool
    Model(String),
}

impl PoolFailure {
    fn into_diagnostic(self) -> DiagnosticKind {
        match self {
            Self::Insufficient => DiagnosticKind::InsufficientCovariates,
            Self::Model(message) => DiagnosticKind::ModelFit(message),
        }
    }
}

/// Fit `model` on the group's pool with covariates read at `period`
fn score_pool(
    ctx: &RefinementContext<'_>,
    model: &dyn PropensityModel,
    group: &[CandidateSet],
    period: i64,
) -> Result<std::result::Result<PoolScores, PoolFailure>> {
    let treated_units = group.iter().map(|s| s.treated.unit).unique();
    let control_units = group
        .iter()
        .flat_map(|s| s.controls.iter().copied())
        .sorted_unstable()
        .dedup();

    let mut units = Vec::new();
    let mut rows = Vec::new();
    let mut labels = Vec::new();
    for (unit, label) in treated_units
        .map(|u| (u, true))
        .chain(control_units.map(|u| (u, false)))
    {
        if let Some(vector) = ctx.covariates.vector(unit, period) {
            units.push(unit);
            rows.push(vector);
            labels.push(label);
        }
    }

    let n_treated = labels.iter().filter(|&&l| l).count();
    if n_treated == 0 || n_treated == labels.len() {
        return Ok(Err(PoolFailure::Insufficient));
    }

    let design = design_matrix(&rows);
    match model.fit_scores(&design, &labels) {
        Ok(scores) => {
            trace!(
                "Fitted {} model on {} rows at period {period}",
                model.name(),
                rows.len()
            );
            Ok(Ok(units.into_iter().zip(scores).collect()))
        }
        Err(PanelMatchError::ModelFit(message)) => {
            if ctx.singular_covariance == SingularCovariancePolicy::Abort {
                return Err(PanelMatchError::NumericalInstability(format!(
                    "{} model failed at period {period}: {message}",
                    model.name()
                )));
            }
            debug!("{} model failed at period {period}: {message}", model.name());
            Ok(Err(PoolFailure::Model(message)))
        }
        Err(other) => Err(other),
    }
}

/// Every set of a group that could not be scored, flagged with the failure
///
/// Matching refiners pass `limit = Some(size_match)` and keep only the first
/// candidates in panel order; weighting refiners keep them all.
fn unrefined_group(group: &[CandidateSet], failure: PoolFailure, limit: Option<usize>) -> Vec<RefinedSet> {
    let diagnostic = failure.into_diagnostic();
    group
        .iter()
        .map(|set| match limit {
            Some(limit) => RefinedSet::truncated(&set.controls, limit, diagnostic.clone()),
            None => RefinedSet::unrefined(&set.controls, diagnostic.clone()),
        })
        .collect()
}

fn group_time(group: &[CandidateSet]) -> Option<i64> {
    group.first().map(|s| s.treated.time)
}

/// Propensity odds `p / (1 - p)`
fn odds(score: f64) -> f64 {
    score / (1.0 - score)
}

/// Nearest-neighbour matching on the propensity score
#[derive(Debug, Clone)]
pub struct PropensityMatch {
    method: RefinementMethod,
    model: Arc<dyn PropensityModel>,
}

impl PropensityMatch {
    /// Matching refiner for `method` using `model`
    #[must_use]
    pub fn new(method: RefinementMethod, model: Arc<dyn PropensityModel>) -> Self {
        Self { method, model }
    }
}

impl Refiner for PropensityMatch {
    fn method(&self) -> RefinementMethod {
        self.method
    }

    fn covariate_window(&self, _ctx: &RefinementContext<'_>, time: i64) -> Option<RangeInclusive<i64>> {
        Some(time..=time)
    }

    fn refine_group(&self, ctx: &RefinementContext<'_>, group: &[CandidateSet]) -> Result<Vec<RefinedSet>> {
        let Some(time) = group_time(group) else {
            return Ok(Vec::new());
        };
        let scores = match score_pool(ctx, self.model.as_ref(), group, time)? {
            Ok(scores) => scores,
            Err(failure) => return Ok(unrefined_group(group, failure, Some(ctx.size_match))),
        };
        let unranked = |set: &CandidateSet| {
            RefinedSet::truncated(&set.controls, ctx.size_match, DiagnosticKind::InsufficientCovariates)
        };

        Ok(group
            .iter()
            .map(|set| {
                if set.controls.is_empty() {
                    return RefinedSet::default();
                }
                let Some(&treated_score) = scores.get(&set.treated.unit) else {
                    return unranked(set);
                };
                let ranked: Vec<Scored> = set
                    .controls
                    .iter()
                    .filter_map(|&unit| {
                        scores.get(&unit).map(|&score| Scored {
                            unit,
                            value: (score - treated_score).abs(),
                            score: Some(score),
                        })
                    })
                    .collect();
                if ranked.is_empty() {
                    return unranked(set);
                }
                RefinedSet {
                    controls: select_nearest(ranked, ctx.size_match, ctx.verbose),
                    diagnostic: None,
                }
            })
            .collect())
    }
}

/// Propensity odds weighting over the full candidate set
#[derive(Debug, Clone)]
pub struct PropensityWeight {
    method: RefinementMethod,
    model: Arc<dyn PropensityModel>,
}

impl PropensityWeight {
    /// Weighting refiner for `method` using `model`
    #[must_use]
    pub fn new(method: RefinementMethod, model: Arc<dyn PropensityModel>) -> Self {
        Self { method, model }
    }
}

impl Refiner for PropensityWeight {
    fn method(&self) -> RefinementMethod {
        self.method
    }

    fn covariate_window(&self, _ctx: &RefinementContext<'_>, time: i64) -> Option<RangeInclusive<i64>> {
        Some(time..=time)
    }

    fn refine_group(&self, ctx: &RefinementContext<'_>, group: &[CandidateSet]) -> Result<Vec<RefinedSet>> {
        let Some(time) = group_time(group) else {
            return Ok(Vec::new());
        };
        let scores = match score_pool(ctx, self.model.as_ref(), group, time)? {
            Ok(scores) => scores,
            Err(failure) => return Ok(unrefined_group(group, failure, None)),
        };

        Ok(group
            .iter()
            .map(|set| {
                let raw: Vec<Scored> = set
                    .controls
                    .iter()
                    .filter_map(|&unit| {
                        scores.get(&unit).map(|&score| Scored {
                            unit,
                            value: odds(score),
                            score: Some(score),
                        })
                    })
                    .collect();
                if raw.is_empty() {
                    return RefinedSet::unrefined(&set.controls, DiagnosticKind::InsufficientCovariates);
                }
                RefinedSet {
                    controls: normalize_weights(raw, ctx.verbose),
                    diagnostic: None,
                }
            })
            .collect())
    }
}

/// Marginal structural model weights over the lead window
///
/// A separate model is fitted for every period `t + f`, `f = 0..=max(lead)`.
/// Each candidate's weight is the product of its propensity odds over those
/// periods, normalized within the set. Requires forbidden treatment reversal,
/// so candidates stay untreated and treated units stay treated throughout.
#[derive(Debug, Clone)]
pub struct MarginalStructuralWeight {
    method: RefinementMethod,
    model: Arc<dyn PropensityModel>,
}

impl MarginalStructuralWeight {
    /// MSM weighting refiner for `method` using `model`
    #[must_use]
    pub fn new(method: RefinementMethod, model: Arc<dyn PropensityModel>) -> Self {
        Self { method, model }
    }
}

impl Refiner for MarginalStructuralWeight {
    fn method(&self) -> RefinementMethod {
        self.method
    }

    fn covariate_window(&self, ctx: &RefinementContext<'_>, time: i64) -> Option<RangeInclusive<i64>> {
        Some(ctx.lead_window(time))
    }

    fn refine_group(&self, ctx: &RefinementContext<'_>, group: &[CandidateSet]) -> Result<Vec<RefinedSet>> {
        let Some(time) = group_time(group) else {
            return Ok(Vec::new());
        };

        let mut per_lead = Vec::new();
        for period in ctx.lead_window(time) {
            match score_pool(ctx, self.model.as_ref(), group, period)? {
                Ok(scores) => per_lead.push(scores),
                Err(failure) => return Ok(unrefined_group(group, failure, None)),
            }
        }

        Ok(group
            .iter()
            .map(|set| {
                let raw: Vec<Scored> = set
                    .controls
                    .iter()
                    .filter_map(|&unit| {
                        let path: Option<Vec<f64>> =
                            per_lead.iter().map(|scores| scores.get(&unit).copied()).collect();
                        path.map(|scores| {
                            let weight = scores.iter().map(|&s| odds(s)).product();
                            Scored {
                                unit,
                                value: weight,
                                score: Some(weight),
                            }
                        })
                    })
                    .collect();
                if raw.is_empty() {
                    return RefinedSet::unrefined(&set.controls, DiagnosticKind::InsufficientCovariates);
                }
                RefinedSet {
                    controls: normalize_weights(raw, ctx.verbose),
                    diagnostic: None,
                }
            })
            .collect())
    }
}
