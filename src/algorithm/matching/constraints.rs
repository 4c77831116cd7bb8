//! Constraints applied around refinement
//!
//! Exact-match and listwise-deletion filters narrow a candidate set before it
//! is refined. The quantity of interest decides which treatment orientation
//! of the panel the engine runs on.

use std::borrow::Cow;
use std::ops::RangeInclusive;

use smallvec::{SmallVec, smallvec};

use crate::algorithm::matching::covariates::CovariateFrame;
use crate::algorithm::matching::types::CandidateSet;
use crate::config::{MissingDataPolicy, Qoi};
use crate::error::{PanelMatchError, Result};
use crate::panel::{Panel, PanelColumn};

/// Exact-match columns resolved against a panel
#[derive(Debug, Clone)]
pub struct ExactMatch<'a> {
    columns: Vec<&'a PanelColumn>,
    lag: usize,
    missing: MissingDataPolicy,
}

impl<'a> ExactMatch<'a> {
    /// Resolve `variables` against the panel
    ///
    /// # Errors
    ///
    /// Returns [`PanelMatchError::DataValidation`] if a variable is not a panel column.
    pub fn resolve(
        panel: &'a Panel,
        variables: &[String],
        lag: usize,
        missing: MissingDataPolicy,
    ) -> Result<Self> {
        let columns = variables
            .iter()
            .map(|name| {
                panel.column(name).ok_or_else(|| {
                    PanelMatchError::data(format!(
                        "Exact-match column '{name}' is not part of the panel"
                    ))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            columns,
            lag,
            missing,
        })
    }

    /// Whether no exact-match variable was requested
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

/// Remove candidates whose exact-match values differ from the treated unit's
///
/// Values are compared at every period of the history window. Missing values
/// follow the same policy as treatment history: wildcards under match-missing,
/// disqualifying otherwise.
pub fn apply_exact_match(panel: &Panel, set: &mut CandidateSet, exact: &ExactMatch<'_>) {
    if exact.is_empty() {
        return;
    }
    let treated = set.treated;
    let window = treated.time - exact.lag as i64..=treated.time - 1;
    set.controls.retain(|&mut candidate| {
        exact.columns.iter().all(|column| {
            window.clone().all(|period| {
                match (
                    panel.value(column, treated.unit, period),
                    panel.value(column, candidate, period),
                ) {
                    (Some(a), Some(b)) => a == b,
                    _ => exact.missing == MissingDataPolicy::MatchMissing,
                }
            })
        })
    });
}

/// Remove candidates with a missing covariate anywhere in `window`
pub fn apply_listwise_deletion(
    set: &mut CandidateSet,
    covariates: &CovariateFrame<'_>,
    window: RangeInclusive<i64>,
) {
    set.controls
        .retain(|&mut candidate| window.clone().all(|period| covariates.is_complete(candidate, period)));
}

/// Sides the engine runs for a quantity of interest
///
/// `att` runs on the treated side, `atc` on the control side and `ate` on
/// both, independently.
#[must_use]
pub fn qoi_runs(qoi: Qoi) -> SmallVec<[Qoi; 2]> {
    match qoi {
        Qoi::Att => smallvec![Qoi::Att],
        Qoi::Atc => smallvec![Qoi::Atc],
        Qoi::Ate => smallvec![Qoi::Att, Qoi::Atc],
    }
}

/// Panel in the treatment orientation a side runs on
///
/// The control side runs on a copy with the treatment indicator inverted; the
/// source panel is never modified.
#[must_use]
pub fn panel_for(side: Qoi, panel: &Panel) -> Cow<'_, Panel> {
    match side {
        Qoi::Atc => Cow::Owned(panel.with_flipped_treatment()),
        Qoi::Att | Qoi::Ate => Cow::Borrowed(panel),
    }
}
