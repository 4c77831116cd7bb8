//! Mahalanobis distance refinement
//!
//! For every period of the history window the covariance of the candidates'
//! covariate vectors is estimated, each candidate's Mahalanobis distance to
//! the treated unit is computed, and the per-period distances are averaged.
//! The `size_match` nearest candidates are kept.

use std::ops::RangeInclusive;

use log::trace;
use nalgebra::{DMatrix, DVector};

use crate::algorithm::matching::refinement::{
    RefinedSet, RefinementContext, Refiner, Scored, select_nearest,
};
use crate::algorithm::matching::types::{CandidateSet, DiagnosticKind};
use crate::config::{RefinementMethod, SingularCovariancePolicy};
use crate::error::{PanelMatchError, Result};
use crate::panel::UnitId;

/// Variances at or below this are treated as zero
const VARIANCE_EPSILON: f64 = 1e-12;

/// Cholesky pivots this small relative to the largest standard deviation mark
/// the covariance matrix as singular
const CONDITION_EPSILON: f64 = 1e-8;

/// Mahalanobis nearest-neighbour refinement
#[derive(Debug, Clone, Copy, Default)]
pub struct Mahalanobis;

/// The covariance matrix of some period could not be inverted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Singular {
    period: i64,
}

/// Sample covariance of the rows of `data`
fn covariance(data: &DMatrix<f64>) -> DMatrix<f64> {
    let n = data.nrows() as f64;
    let means = data.row_mean();
    let centred = DMatrix::from_fn(data.nrows(), data.ncols(), |i, j| data[(i, j)] - means[j]);
    centred.tr_mul(&centred) / (n - 1.0)
}

/// Inverse-covariance metric of one period
enum Metric {
    /// Full covariance, through its Cholesky factor
    Full(nalgebra::Cholesky<f64, nalgebra::Dyn>),
    /// Variances of the dimensions that vary
    Diagonal(Vec<Option<f64>>),
}

impl Metric {
    fn estimate(data: &DMatrix<f64>, diagonal: bool) -> Option<Self> {
        let cov = covariance(data);
        if diagonal {
            let variances = cov
                .diagonal()
                .iter()
                .map(|&v| (v > VARIANCE_EPSILON).then_some(v))
                .collect();
            return Some(Self::Diagonal(variances));
        }

        let scale = cov.diagonal().amax().sqrt();
        if scale <= VARIANCE_EPSILON {
            return None;
        }
        let chol = cov.cholesky()?;
        let pivot = chol.l_dirty().diagonal().amin();
        (pivot > CONDITION_EPSILON * scale).then_some(Self::Full(chol))
    }

    fn distance(&self, diff: &DVector<f64>) -> f64 {
        match self {
            Self::Full(chol) => diff.dot(&chol.solve(diff)).max(0.0).sqrt(),
            Self::Diagonal(variances) => diff
                .iter()
                .zip(variances)
                .filter_map(|(d, v)| v.map(|v| d * d / v))
                .sum::<f64>()
                .sqrt(),
        }
    }
}

impl Mahalanobis {
    /// Mean distance of every candidate, `None` for candidates never comparable
    fn distances(
        ctx: &RefinementContext<'_>,
        set: &CandidateSet,
        candidates: &[UnitId],
        diagonal: bool,
    ) -> std::result::Result<Vec<Option<f64>>, Singular> {
        let mut sums = vec![0.0; candidates.len()];
        let mut counts = vec![0usize; candidates.len()];

        for period in ctx.history_window(set.treated.time) {
            let Some(treated) = ctx.covariates.vector(set.treated.unit, period) else {
                continue;
            };
            let rows: Vec<(usize, Vec<f64>)> = candidates
                .iter()
                .enumerate()
                .filter_map(|(i, &c)| ctx.covariates.vector(c, period).map(|v| (i, v)))
                .collect();
            if rows.len() < 2 {
                continue;
            }

            let data = DMatrix::from_fn(rows.len(), treated.len(), |i, j| rows[i].1[j]);
            let metric = Metric::estimate(&data, diagonal).ok_or(Singular { period })?;

            let treated = DVector::from_vec(treated);
            for (i, vector) in rows {
                let diff = DVector::from_vec(vector) - &treated;
                sums[i] += metric.distance(&diff);
                counts[i] += 1;
            }
        }

        Ok(sums
            .into_iter()
            .zip(counts)
            .map(|(sum, count)| (count > 0).then(|| sum / count as f64))
            .collect())
    }

    fn refine_set(ctx: &RefinementContext<'_>, set: &CandidateSet) -> Result<RefinedSet> {
        let candidates = set.controls.as_slice();
        if candidates.is_empty() {
            return Ok(RefinedSet::default());
        }

        let history = ctx.history_window(set.treated.time);
        let comparable: Vec<UnitId> = candidates
            .iter()
            .copied()
            .filter(|&c| {
                history.clone().any(|p| {
                    ctx.covariates.is_complete(set.treated.unit, p) && ctx.covariates.is_complete(c, p)
                })
            })
            .collect();
        if comparable.is_empty() {
            return Ok(RefinedSet::truncated(
                candidates,
                ctx.size_match,
                DiagnosticKind::InsufficientCovariates,
            ));
        }
        if comparable.len() <= ctx.size_match && !ctx.verbose {
            return Ok(RefinedSet::uniform(&comparable));
        }

        let (distances, diagnostic) =
            match Self::distances(ctx, set, &comparable, ctx.use_diagonal_variance) {
                Ok(distances) => (distances, None),
                Err(Singular { period }) => {
                    trace!(
                        "Singular covariance for unit {} at time {} (period {period})",
                        set.treated.unit, set.treated.time
                    );
                    match ctx.singular_covariance {
                        SingularCovariancePolicy::KeepFullSet => {
                            return Ok(RefinedSet::unrefined(
                                candidates,
                                DiagnosticKind::SingularCovariance,
                            ));
                        }
                        SingularCovariancePolicy::Abort => {
                            return Err(PanelMatchError::NumericalInstability(format!(
                                "singular covariance matrix refining unit {} at time {} (period {period})",
                                set.treated.unit, set.treated.time
                            )));
                        }
                        SingularCovariancePolicy::DiagonalFallback => {
                            let distances = Self::distances(ctx, set, &comparable, true)
                                .unwrap_or_else(|_| vec![None; comparable.len()]);
                            (distances, Some(DiagnosticKind::DiagonalFallback))
                        }
                    }
                }
            };

        let ranked: Vec<Scored> = comparable
            .iter()
            .zip(distances)
            .filter_map(|(&unit, d)| {
                d.map(|value| Scored {
                    unit,
                    value,
                    score: None,
                })
            })
            .collect();

        if ranked.is_empty() {
            // fewer than two comparable candidates in every period
            let kept = &comparable[..comparable.len().min(ctx.size_match)];
            return Ok(RefinedSet {
                diagnostic,
                ..RefinedSet::uniform(kept)
            });
        }

        Ok(RefinedSet {
            controls: select_nearest(ranked, ctx.size_match, ctx.verbose),
            diagnostic,
        })
    }
}

impl Refiner for Mahalanobis {
    fn method(&self) -> RefinementMethod {
        RefinementMethod::Mahalanobis
    }

    fn covariate_window(&self, ctx: &RefinementContext<'_>, time: i64) -> Option<RangeInclusive<i64>> {
        Some(ctx.history_window(time))
    }

    fn refine_group(&self, ctx: &RefinementContext<'_>, group: &[CandidateSet]) -> Result<Vec<RefinedSet>> {
        group.iter().map(|set| Self::refine_set(ctx, set)).collect()
    }
}
