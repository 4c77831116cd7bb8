//! Configuration for panel matching.
//!
//! A [`PanelMatchConfig`] describes one matching run. It is validated eagerly
//! by [`PanelMatchConfig::validate`] before any data is touched; running several
//! configurations is left to the caller.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::algorithm::matching::covariates::CovariateSpec;
use crate::error::{PanelMatchError, Result};
use crate::panel::PanelColumns;

/// Quantity of interest
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Qoi {
    /// Average treatment effect on the treated
    Att,
    /// Average treatment effect on the controls
    Atc,
    /// Average treatment effect, computed as both of the above
    Ate,
}

impl Qoi {
    /// Conventional lowercase name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Att => "att",
            Self::Atc => "atc",
            Self::Ate => "ate",
        }
    }
}

impl fmt::Display for Qoi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Qoi {
    type Err = PanelMatchError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "att" => Ok(Self::Att),
            "atc" => Ok(Self::Atc),
            "ate" => Ok(Self::Ate),
            other => Err(PanelMatchError::config(format!(
                "Unknown qoi '{other}'; expected one of att, atc, ate"
            ))),
        }
    }
}

/// Refinement applied to each matched set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RefinementMethod {
    /// Uniform weights over the full matched set
    #[serde(rename = "none")]
    None,
    /// Nearest `size_match` controls by Mahalanobis distance
    #[serde(rename = "mahalanobis")]
    Mahalanobis,
    /// Nearest `size_match` controls by logistic propensity score
    #[serde(rename = "ps.match")]
    PsMatch,
    /// Nearest `size_match` controls by covariate-balancing propensity score
    #[serde(rename = "CBPS.match")]
    CbpsMatch,
    /// Propensity weights from a logistic model
    #[serde(rename = "ps.weight")]
    PsWeight,
    /// Propensity weights from a covariate-balancing model
    #[serde(rename = "CBPS.weight")]
    CbpsWeight,
    /// Marginal structural model weights over the lead window, logistic model
    #[serde(rename = "ps.msm.weight")]
    PsMsmWeight,
    /// Marginal structural model weights over the lead window, covariate-balancing model
    #[serde(rename = "CBPS.msm.weight")]
    CbpsMsmWeight,
}

impl RefinementMethod {
    /// All methods, in declaration order
    pub const ALL: [Self; 8] = [
        Self::None,
        Self::Mahalanobis,
        Self::PsMatch,
        Self::CbpsMatch,
        Self::PsWeight,
        Self::CbpsWeight,
        Self::PsMsmWeight,
        Self::CbpsMsmWeight,
    ];

    /// Conventional method name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Mahalanobis => "mahalanobis",
            Self::PsMatch => "ps.match",
            Self::CbpsMatch => "CBPS.match",
            Self::PsWeight => "ps.weight",
            Self::CbpsWeight => "CBPS.weight",
            Self::PsMsmWeight => "ps.msm.weight",
            Self::CbpsMsmWeight => "CBPS.msm.weight",
        }
    }

    /// Whether the method selects a subset rather than weighting every control
    #[must_use]
    pub const fn is_matching(self) -> bool {
        matches!(self, Self::Mahalanobis | Self::PsMatch | Self::CbpsMatch)
    }

    /// Whether the method weights the lead-window treatment path
    #[must_use]
    pub const fn is_msm(self) -> bool {
        matches!(self, Self::PsMsmWeight | Self::CbpsMsmWeight)
    }

    /// Whether the method uses the covariate-balancing propensity model
    #[must_use]
    pub const fn uses_cbps(self) -> bool {
        matches!(self, Self::CbpsMatch | Self::CbpsWeight | Self::CbpsMsmWeight)
    }

    /// Whether the method needs a covariate specification
    #[must_use]
    pub const fn needs_covariates(self) -> bool {
        !matches!(self, Self::None)
    }
}

impl fmt::Display for RefinementMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RefinementMethod {
    type Err = PanelMatchError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| {
                PanelMatchError::config(format!("Unknown refinement method '{s}'"))
            })
    }
}

/// How missing treatment cells in the history window are handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissingDataPolicy {
    /// A missing cell matches any value
    MatchMissing,
    /// Any missing cell disqualifies the pair
    NoMissing,
}

/// Whether treatment may switch back inside the lead window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReversalPolicy {
    /// Only the treatment period itself is constrained
    AllowReversal,
    /// Treated units stay treated and controls stay untreated through the lead window
    ForbidReversal,
}

/// What Mahalanobis refinement does with a singular covariance matrix
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SingularCovariancePolicy {
    /// Leave the matched set unrefined and record a diagnostic
    #[default]
    KeepFullSet,
    /// Retry with the diagonal variance matrix
    DiagonalFallback,
    /// Fail the whole call
    Abort,
}

fn default_lead() -> Vec<i64> {
    vec![0]
}

const fn default_true() -> bool {
    true
}

const fn default_size_match() -> usize {
    10
}

/// Configuration for one matching run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PanelMatchConfig {
    /// Number of pre-treatment periods whose treatment history must match
    pub lag: usize,
    /// Time period column
    pub time_id: String,
    /// Unit identifier column
    pub unit_id: String,
    /// Binary treatment column
    pub treatment: String,
    /// Outcome column, attached to the result as metadata
    pub outcome_var: String,
    /// Refinement applied to each matched set
    pub refinement_method: RefinementMethod,
    /// Number of controls kept by matching methods
    #[serde(default = "default_size_match")]
    pub size_match: usize,
    /// Treat missing history cells as wildcards
    #[serde(default)]
    pub match_missing: bool,
    /// Covariates used by refinement
    #[serde(default)]
    pub covariates: CovariateSpec,
    /// Keep raw distances and scores on refined controls
    #[serde(default)]
    pub verbose: bool,
    /// Quantity of interest
    pub qoi: Qoi,
    /// Forward offsets of the outcome window
    #[serde(default = "default_lead")]
    pub lead: Vec<i64>,
    /// Variables that must match exactly over the history window
    #[serde(default)]
    pub exact_match_variables: Vec<String>,
    /// Require treatment continuity through the lead window
    #[serde(default)]
    pub forbid_treatment_reversal: bool,
    /// Match on treatment history; `false` keeps every untreated unit
    #[serde(default = "default_true")]
    pub matching: bool,
    /// Drop candidates with any missing covariate in the refinement window
    #[serde(default)]
    pub listwise_delete: bool,
    /// Use only the variances in Mahalanobis refinement
    #[serde(default)]
    pub use_diagonal_variance: bool,
    /// Handling of singular covariance matrices
    #[serde(default)]
    pub singular_covariance: SingularCovariancePolicy,
    /// Whether to use parallel processing across treated observations
    #[serde(default = "default_true")]
    pub use_parallel: bool,
    /// Show a progress bar while refining
    #[serde(default)]
    pub show_progress: bool,
}

impl Default for PanelMatchConfig {
    fn default() -> Self {
        Self {
            lag: 4,
            time_id: "time".to_string(),
            unit_id: "unit".to_string(),
            treatment: "treatment".to_string(),
            outcome_var: "outcome".to_string(),
            refinement_method: RefinementMethod::None,
            size_match: default_size_match(),
            match_missing: false,
            covariates: CovariateSpec::default(),
            verbose: false,
            qoi: Qoi::Att,
            lead: default_lead(),
            exact_match_variables: Vec::new(),
            forbid_treatment_reversal: false,
            matching: true,
            listwise_delete: false,
            use_diagonal_variance: false,
            singular_covariance: SingularCovariancePolicy::KeepFullSet,
            use_parallel: true,
            show_progress: false,
        }
    }
}

impl PanelMatchConfig {
    /// Create a new configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new builder for constructing a configuration
    #[must_use]
    pub fn builder() -> PanelMatchConfigBuilder {
        PanelMatchConfigBuilder::new()
    }

    /// Load a configuration from a JSON file and validate it
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Missing-data policy for treatment history
    #[must_use]
    pub const fn missing_policy(&self) -> MissingDataPolicy {
        if self.match_missing {
            MissingDataPolicy::MatchMissing
        } else {
            MissingDataPolicy::NoMissing
        }
    }

    /// Treatment reversal policy
    #[must_use]
    pub const fn reversal_policy(&self) -> ReversalPolicy {
        if self.forbid_treatment_reversal {
            ReversalPolicy::ForbidReversal
        } else {
            ReversalPolicy::AllowReversal
        }
    }

    /// Lag actually used for history matching
    #[must_use]
    pub const fn effective_lag(&self) -> usize {
        if self.matching { self.lag } else { 1 }
    }

    /// Largest lead offset
    #[must_use]
    pub fn max_lead(&self) -> i64 {
        self.lead.iter().copied().max().unwrap_or(0)
    }

    /// Lead offsets sorted and de-duplicated
    #[must_use]
    pub fn normalized_lead(&self) -> Vec<i64> {
        let mut lead = self.lead.clone();
        lead.sort_unstable();
        lead.dedup();
        if lead.is_empty() {
            lead.push(0);
        }
        lead
    }

    /// Columns the panel must provide for this configuration
    #[must_use]
    pub fn panel_columns(&self) -> PanelColumns {
        PanelColumns::new(&self.unit_id, &self.time_id, &self.treatment)
            .with_outcome(&self.outcome_var)
            .with_values(self.covariates.variables())
            .with_values(self.exact_match_variables.iter().cloned())
    }

    /// Check the configuration for invalid or contradictory settings
    ///
    /// # Errors
    ///
    /// Returns [`PanelMatchError::Configuration`] describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.lag < 1 {
            return Err(PanelMatchError::config("lag must be a positive integer"));
        }

        for (name, value) in [
            ("time_id", &self.time_id),
            ("unit_id", &self.unit_id),
            ("treatment", &self.treatment),
            ("outcome_var", &self.outcome_var),
        ] {
            if value.trim().is_empty() {
                return Err(PanelMatchError::config(format!("{name} must name a column")));
            }
        }

        if let Some(negative) = self.lead.iter().find(|&&l| l < 0) {
            return Err(PanelMatchError::config(format!(
                "lead values must be non-negative, found {negative}"
            )));
        }

        if self.refinement_method.is_matching() && self.size_match < 1 {
            return Err(PanelMatchError::config("size_match must be at least 1"));
        }

        if self.match_missing && self.listwise_delete {
            return Err(PanelMatchError::config(
                "match_missing and listwise_delete cannot both be enabled",
            ));
        }

        if self.refinement_method.is_msm() && !self.forbid_treatment_reversal {
            return Err(PanelMatchError::config(format!(
                "{} requires forbid_treatment_reversal",
                self.refinement_method
            )));
        }

        if self.refinement_method.needs_covariates() && self.covariates.is_empty() {
            return Err(PanelMatchError::config(format!(
                "{} requires a covariate specification",
                self.refinement_method
            )));
        }

        Ok(())
    }
}

/// Builder for constructing a [`PanelMatchConfig`]
#[derive(Debug, Clone, Default)]
pub struct PanelMatchConfigBuilder {
    config: PanelMatchConfig,
}

impl PanelMatchConfigBuilder {
    /// Create a new builder with default configuration
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the history lag
    #[must_use]
    pub const fn lag(mut self, lag: usize) -> Self {
        self.config.lag = lag;
        self
    }

    /// Set the unit, time and treatment column names
    #[must_use]
    pub fn columns(
        mut self,
        unit_id: impl Into<String>,
        time_id: impl Into<String>,
        treatment: impl Into<String>,
    ) -> Self {
        self.config.unit_id = unit_id.into();
        self.config.time_id = time_id.into();
        self.config.treatment = treatment.into();
        self
    }

    /// Set the outcome column
    #[must_use]
    pub fn outcome_var(mut self, outcome: impl Into<String>) -> Self {
        self.config.outcome_var = outcome.into();
        self
    }

    /// Set the refinement method
    #[must_use]
    pub const fn refinement_method(mut self, method: RefinementMethod) -> Self {
        self.config.refinement_method = method;
        self
    }

    /// Set the number of controls kept by matching methods
    #[must_use]
    pub const fn size_match(mut self, size: usize) -> Self {
        self.config.size_match = size;
        self
    }

    /// Set whether missing history cells match anything
    #[must_use]
    pub const fn match_missing(mut self, match_missing: bool) -> Self {
        self.config.match_missing = match_missing;
        self
    }

    /// Set the covariate specification
    #[must_use]
    pub fn covariates(mut self, covariates: CovariateSpec) -> Self {
        self.config.covariates = covariates;
        self
    }

    /// Set whether raw distances and scores are kept
    #[must_use]
    pub const fn verbose(mut self, verbose: bool) -> Self {
        self.config.verbose = verbose;
        self
    }

    /// Set the quantity of interest
    #[must_use]
    pub const fn qoi(mut self, qoi: Qoi) -> Self {
        self.config.qoi = qoi;
        self
    }

    /// Set the lead window
    #[must_use]
    pub fn lead(mut self, lead: impl IntoIterator<Item = i64>) -> Self {
        self.config.lead = lead.into_iter().collect();
        self
    }

    /// Set the exact-match variables
    #[must_use]
    pub fn exact_match_variables<I, S>(mut self, variables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.exact_match_variables = variables.into_iter().map(Into::into).collect();
        self
    }

    /// Set whether treatment reversal is forbidden
    #[must_use]
    pub const fn forbid_treatment_reversal(mut self, forbid: bool) -> Self {
        self.config.forbid_treatment_reversal = forbid;
        self
    }

    /// Set whether treatment history is matched
    #[must_use]
    pub const fn matching(mut self, matching: bool) -> Self {
        self.config.matching = matching;
        self
    }

    /// Set listwise deletion of candidates with missing covariates
    #[must_use]
    pub const fn listwise_delete(mut self, listwise: bool) -> Self {
        self.config.listwise_delete = listwise;
        self
    }

    /// Set whether Mahalanobis refinement uses only variances
    #[must_use]
    pub const fn use_diagonal_variance(mut self, diagonal: bool) -> Self {
        self.config.use_diagonal_variance = diagonal;
        self
    }

    /// Set the singular covariance policy
    #[must_use]
    pub const fn singular_covariance(mut self, policy: SingularCovariancePolicy) -> Self {
        self.config.singular_covariance = policy;
        self
    }

    /// Set whether to use parallel processing
    #[must_use]
    pub const fn use_parallel(mut self, parallel: bool) -> Self {
        self.config.use_parallel = parallel;
        self
    }

    /// Set whether to show a progress bar
    #[must_use]
    pub const fn show_progress(mut self, show: bool) -> Self {
        self.config.show_progress = show;
        self
    }

    /// Build the configuration without validating it
    #[must_use]
    pub fn build(self) -> PanelMatchConfig {
        self.config
    }
}
