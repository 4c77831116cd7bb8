//! Propensity score models
//!
//! Refinement only needs a per-row probability of treatment. [`PropensityModel`]
//! is the seam where callers can plug in their own estimator; two built-in
//! models are provided:
//!
//! - [`LogisticModel`]: maximum-likelihood logistic regression fitted with
//!   Newton-Raphson (IRLS).
//! - [`CovariateBalancingModel`]: the just-identified covariate balancing
//!   propensity score for the effect on the treated. Its coefficients solve
//!   the balance conditions, so the odds-weighted control means of every
//!   design column equal the treated means.
//!
//! Design matrices passed to a model already hold an intercept column.

use std::fmt;
use std::sync::Arc;

use log::debug;
use nalgebra::{DMatrix, DVector};

use crate::error::{PanelMatchError, Result};

/// Bounds on the linear predictor, keeping probabilities away from 0 and 1
const ETA_LIMIT: f64 = 30.0;

/// A model producing treatment probabilities
pub trait PropensityModel: Send + Sync + fmt::Debug {
    /// Short name used in logs
    fn name(&self) -> &'static str;

    /// Fit the model and return the fitted probability of every row
    ///
    /// # Arguments
    /// * `design` - Row-per-observation design matrix, intercept included
    /// * `treated` - Treatment label of every row
    ///
    /// # Errors
    /// Returns [`PanelMatchError::ModelFit`] when the model cannot be fitted.
    fn fit_scores(&self, design: &DMatrix<f64>, treated: &[bool]) -> Result<Vec<f64>>;
}

fn sigmoid(eta: f64) -> f64 {
    1.0 / (1.0 + (-eta.clamp(-ETA_LIMIT, ETA_LIMIT)).exp())
}

fn check_inputs(design: &DMatrix<f64>, treated: &[bool]) -> Result<()> {
    if design.nrows() != treated.len() {
        return Err(PanelMatchError::ModelFit(format!(
            "design has {} rows but {} labels were given",
            design.nrows(),
            treated.len()
        )));
    }
    let n_treated = treated.iter().filter(|&&t| t).count();
    if n_treated == 0 || n_treated == treated.len() {
        return Err(PanelMatchError::ModelFit(
            "both treated and control rows are required".to_string(),
        ));
    }
    if design.iter().any(|v| !v.is_finite()) {
        return Err(PanelMatchError::ModelFit(
            "design matrix holds non-finite values".to_string(),
        ));
    }
    Ok(())
}

/// Solve `a x = b` for a symmetric positive (semi-)definite `a`
fn solve_symmetric(a: DMatrix<f64>, b: &DVector<f64>) -> Result<DVector<f64>> {
    if let Some(chol) = a.clone().cholesky() {
        return Ok(chol.solve(b));
    }
    a.lu()
        .solve(b)
        .ok_or_else(|| PanelMatchError::ModelFit("singular information matrix".to_string()))
}

/// `Xᵀ diag(w) X`
fn weighted_gram(x: &DMatrix<f64>, w: &[f64]) -> DMatrix<f64> {
    let scaled = DMatrix::from_fn(x.nrows(), x.ncols(), |i, j| x[(i, j)] * w[i]);
    x.tr_mul(&scaled)
}

/// Logistic regression fitted by Newton-Raphson
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LogisticModel {
    /// Maximum number of Newton steps
    pub max_iterations: usize,
    /// Convergence threshold on the largest coefficient update
    pub tolerance: f64,
    /// Ridge penalty keeping the information matrix invertible under separation
    pub ridge: f64,
}

impl Default for LogisticModel {
    fn default() -> Self {
        Self {
            max_iterations: 50,
            tolerance: 1e-8,
            ridge: 1e-6,
        }
    }
}

impl LogisticModel {
    /// Create a model with default settings
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fit and return the coefficients
    pub fn fit_coefficients(&self, design: &DMatrix<f64>, treated: &[bool]) -> Result<DVector<f64>> {
        check_inputs(design, treated)?;
        let y: Vec<f64> = treated.iter().map(|&t| f64::from(u8::from(t))).collect();
        let k = design.ncols();
        let mut beta = DVector::<f64>::zeros(k);

        for iteration in 0..self.max_iterations {
            let eta = design * &beta;
            let p: Vec<f64> = eta.iter().map(|&e| sigmoid(e)).collect();
            let w: Vec<f64> = p.iter().map(|&p| (p * (1.0 - p)).max(1e-12)).collect();

            let residual = DVector::from_iterator(y.len(), y.iter().zip(&p).map(|(y, p)| y - p));
            let gradient = design.tr_mul(&residual) - &beta * self.ridge;
            let information = weighted_gram(design, &w) + DMatrix::identity(k, k) * self.ridge;

            let step = solve_symmetric(information, &gradient)?;
            beta += &step;

            if beta.iter().any(|b| !b.is_finite()) {
                return Err(PanelMatchError::ModelFit(
                    "logistic coefficients diverged".to_string(),
                ));
            }
            if step.amax() < self.tolerance {
                debug!("Logistic model converged after {} iterations", iteration + 1);
                return Ok(beta);
            }
        }

        debug!(
            "Logistic model stopped after {} iterations without converging",
            self.max_iterations
        );
        Ok(beta)
    }

    /// Probabilities implied by `beta`
    #[must_use]
    pub fn predict(design: &DMatrix<f64>, beta: &DVector<f64>) -> Vec<f64> {
        (design * beta).iter().map(|&e| sigmoid(e)).collect()
    }
}

impl PropensityModel for LogisticModel {
    fn name(&self) -> &'static str {
        "logistic"
    }

    fn fit_scores(&self, design: &DMatrix<f64>, treated: &[bool]) -> Result<Vec<f64>> {
        let beta = self.fit_coefficients(design, treated)?;
        Ok(Self::predict(design, &beta))
    }
}

/// Just-identified covariate balancing propensity score for the treated
///
/// Solves `Σ (Tᵢ - πᵢ) / (1 - πᵢ) · xᵢ = 0` by damped Newton steps starting
/// from the logistic fit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CovariateBalancingModel {
    /// Model providing the starting coefficients
    pub start: LogisticModel,
    /// Maximum number of Newton steps
    pub max_iterations: usize,
    /// Convergence threshold on the mean absolute balance condition
    pub tolerance: f64,
}

impl Default for CovariateBalancingModel {
    fn default() -> Self {
        Self {
            start: LogisticModel::default(),
            max_iterations: 100,
            tolerance: 1e-8,
        }
    }
}

impl CovariateBalancingModel {
    /// Create a model with default settings
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Balance conditions at `beta`, scaled by the number of rows
    fn moments(design: &DMatrix<f64>, treated: &[bool], beta: &DVector<f64>) -> DVector<f64> {
        let n = design.nrows() as f64;
        let eta = design * beta;
        let mut g = DVector::<f64>::zeros(design.ncols());
        for (i, &t) in treated.iter().enumerate() {
            let factor = if t {
                1.0
            } else {
                -eta[i].clamp(-ETA_LIMIT, ETA_LIMIT).exp()
            };
            g += design.row(i).transpose() * factor;
        }
        g / n
    }

    /// Fit and return the coefficients
    pub fn fit_coefficients(&self, design: &DMatrix<f64>, treated: &[bool]) -> Result<DVector<f64>> {
        let mut beta = self.start.fit_coefficients(design, treated)?;
        let n = design.nrows() as f64;
        let mut g = Self::moments(design, treated, &beta);
        let mut loss = g.norm();

        for iteration in 0..self.max_iterations {
            if g.amax() < self.tolerance {
                debug!("Balancing model converged after {iteration} iterations");
                return Ok(beta);
            }

            let eta = design * &beta;
            let odds: Vec<f64> = treated
                .iter()
                .zip(eta.iter())
                .map(|(&t, &e)| if t { 0.0 } else { e.clamp(-ETA_LIMIT, ETA_LIMIT).exp() })
                .collect();
            // the Jacobian of g is -(1/n) Σ_controls oddsᵢ xᵢ xᵢᵀ
            let jacobian = weighted_gram(design, &odds) / n
                + DMatrix::identity(design.ncols(), design.ncols()) * self.start.ridge;
            let step = solve_symmetric(jacobian, &g)?;

            let mut scale = 1.0;
            let mut improved = false;
            while scale > 1e-6 {
                let candidate = &beta + &step * scale;
                let candidate_g = Self::moments(design, treated, &candidate);
                let candidate_loss = candidate_g.norm();
                if candidate_loss.is_finite() && candidate_loss < loss {
                    beta = candidate;
                    g = candidate_g;
                    loss = candidate_loss;
                    improved = true;
                    break;
                }
                scale /= 2.0;
            }
            if !improved {
                debug!("Balancing model stalled at balance loss {loss:.3e}");
                break;
            }
        }

        if beta.iter().any(|b| !b.is_finite()) {
            return Err(PanelMatchError::ModelFit(
                "balancing coefficients diverged".to_string(),
            ));
        }
        Ok(beta)
    }
}

impl PropensityModel for CovariateBalancingModel {
    fn name(&self) -> &'static str {
        "cbps"
    }

    fn fit_scores(&self, design: &DMatrix<f64>, treated: &[bool]) -> Result<Vec<f64>> {
        let beta = self.fit_coefficients(design, treated)?;
        Ok(LogisticModel::predict(design, &beta))
    }
}

/// The two propensity models refinement methods draw from
#[derive(Debug, Clone)]
pub struct ModelSet {
    /// Used by the `ps.*` methods
    pub standard: Arc<dyn PropensityModel>,
    /// Used by the `CBPS.*` methods
    pub balancing: Arc<dyn PropensityModel>,
}

impl Default for ModelSet {
    fn default() -> Self {
        Self {
            standard: Arc::new(LogisticModel::default()),
            balancing: Arc::new(CovariateBalancingModel::default()),
        }
    }
}

impl ModelSet {
    /// Model used by a method, `balancing` for CBPS methods
    #[must_use]
    pub fn for_balancing(&self, balancing: bool) -> Arc<dyn PropensityModel> {
        if balancing {
            Arc::clone(&self.balancing)
        } else {
            Arc::clone(&self.standard)
        }
    }
}

/// Build a standardized design matrix with a leading intercept column
///
/// Columns without variation are dropped; the others are centred and scaled
/// to unit variance. Fitted probabilities do not depend on this choice, but
/// the Newton iterations are better conditioned.
#[must_use]
pub fn design_matrix(rows: &[Vec<f64>]) -> DMatrix<f64> {
    let n = rows.len();
    let k = rows.first().map_or(0, Vec::len);
    let mut columns: Vec<Vec<f64>> = Vec::with_capacity(k + 1);
    columns.push(vec![1.0; n]);

    for j in 0..k {
        let values: Vec<f64> = rows.iter().map(|r| r[j]).collect();
        let mean = values.iter().sum::<f64>() / n as f64;
        let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n as f64;
        if variance > 1e-12 {
            let sd = variance.sqrt();
            columns.push(values.iter().map(|v| (v - mean) / sd).collect());
        }
    }

    DMatrix::from_fn(n, columns.len(), |i, j| columns[j][i])
}
