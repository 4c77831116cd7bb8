//! Treatment history matching
//!
//! Finds the treated observations of a panel and, for each of them, the
//! control units whose treatment history over the lag window matches.

use rayon::prelude::*;
use smallvec::SmallVec;

use crate::algorithm::matching::types::{CandidateSet, TreatedObservation};
use crate::config::{MissingDataPolicy, PanelMatchConfig, ReversalPolicy};
use crate::panel::{Panel, UnitId};

/// Rules that decide which observations are treated and which units qualify as controls
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryRules {
    /// Length of the history window
    pub lag: usize,
    /// Last lead offset; the outcome window is `[t, t + max_lead]`
    pub max_lead: i64,
    /// Whether missing history cells are wildcards
    pub missing: MissingDataPolicy,
    /// Whether treatment must stay constant through the outcome window
    pub reversal: ReversalPolicy,
    /// Whether history is compared at all
    pub match_history: bool,
}

impl HistoryRules {
    /// Rules implied by a configuration
    #[must_use]
    pub fn from_config(config: &PanelMatchConfig) -> Self {
        Self {
            lag: config.effective_lag(),
            max_lead: config.max_lead(),
            missing: config.missing_policy(),
            reversal: config.reversal_policy(),
            match_history: config.matching,
        }
    }

    /// Periods of the outcome window checked for reversal
    fn outcome_window(&self, time: i64) -> std::ops::RangeInclusive<i64> {
        match self.reversal {
            ReversalPolicy::ForbidReversal => time..=time + self.max_lead,
            ReversalPolicy::AllowReversal => time..=time,
        }
    }
}

/// Whether (`unit`, `time`) is a treated observation under `rules`
///
/// The unit must switch from untreated at `time - 1` to treated at `time`, a
/// full history window must lie inside the panel, and under forbidden
/// reversal the unit must stay treated through the outcome window.
#[must_use]
pub fn is_treated_observation(panel: &Panel, unit: UnitId, time: i64, rules: &HistoryRules) -> bool {
    if time - (rules.lag as i64) < panel.first_period() {
        return false;
    }
    if panel.treatment(unit, time - 1) != Some(0) {
        return false;
    }
    rules
        .outcome_window(time)
        .all(|period| panel.treatment(unit, period) == Some(1))
}

/// Every treated observation of the panel, ordered by (unit, time)
#[must_use]
pub fn find_treated_observations(panel: &Panel, rules: &HistoryRules) -> Vec<TreatedObservation> {
    let first_eligible = panel.first_period() + rules.lag as i64;
    panel
        .units()
        .flat_map(|unit| {
            (first_eligible..=panel.last_period())
                .filter(move |&time| is_treated_observation(panel, unit, time, rules))
                .map(move |time| TreatedObservation::new(unit, time))
        })
        .collect()
}

fn cells_match(treated: Option<u8>, candidate: Option<u8>, missing: MissingDataPolicy) -> bool {
    match (treated, candidate, missing) {
        (Some(a), Some(b), _) => a == b,
        (_, _, MissingDataPolicy::MatchMissing) => true,
        (_, _, MissingDataPolicy::NoMissing) => false,
    }
}

/// Whether `candidate` qualifies as a control for `treated`
///
/// The candidate must be untreated at the treatment period (through the whole
/// outcome window under forbidden reversal) and, when history matching is on,
/// share the treated unit's treatment history over `[t - lag, t - 1]`.
#[must_use]
pub fn is_eligible_control(
    panel: &Panel,
    treated: &TreatedObservation,
    candidate: UnitId,
    rules: &HistoryRules,
) -> bool {
    if candidate == treated.unit {
        return false;
    }
    if !rules
        .outcome_window(treated.time)
        .all(|period| panel.treatment(candidate, period) == Some(0))
    {
        return false;
    }
    if !rules.match_history {
        return true;
    }
    (1..=rules.lag as i64).all(|k| {
        let period = treated.time - k;
        cells_match(
            panel.treatment(treated.unit, period),
            panel.treatment(candidate, period),
            rules.missing,
        )
    })
}

/// Candidate controls of one treated observation, in panel order
#[must_use]
pub fn candidates_for(
    panel: &Panel,
    treated: &TreatedObservation,
    rules: &HistoryRules,
) -> SmallVec<[UnitId; 16]> {
    panel
        .units()
        .filter(|&c| is_eligible_control(panel, treated, c, rules))
        .collect()
}

/// Build the unrefined matched set of every treated observation
///
/// Treated observations without any qualifying control are kept with an empty
/// candidate list. With `parallel` set the observations are processed with
/// rayon; the output order is the input order either way.
#[must_use]
pub fn build_matched_sets(
    panel: &Panel,
    treated: &[TreatedObservation],
    rules: &HistoryRules,
    parallel: bool,
) -> Vec<CandidateSet> {
    let build = |t: &TreatedObservation| CandidateSet {
        treated: *t,
        controls: candidates_for(panel, t, rules),
    };
    if parallel {
        treated.par_iter().map(build).collect()
    } else {
        treated.iter().map(build).collect()
    }
}
