//! Core matching engine
//!
//! This module implements the [`PanelMatcher`] which orchestrates history
//! matching, constraints, refinement and result assembly for every side the
//! quantity of interest requires.

use std::time::Instant;

use arrow::record_batch::RecordBatch;
use log::{debug, info};
use rayon::prelude::*;

use crate::algorithm::matching::assemble::{assemble_result, decode_collection, metadata_for};
use crate::algorithm::matching::constraints::{
    ExactMatch, apply_exact_match, apply_listwise_deletion, panel_for, qoi_runs,
};
use crate::algorithm::matching::history::{HistoryRules, build_matched_sets, find_treated_observations};
use crate::algorithm::matching::model::ModelSet;
use crate::algorithm::matching::refinement::{RefinedSet, RefinementContext, for_method};
use crate::algorithm::matching::types::{
    CandidateSet, MatchedSet, MatchedSetCollection, PanelMatchResult, RefinementDiagnostic,
};
use crate::config::{PanelMatchConfig, Qoi};
use crate::error::{PanelMatchError, Result};
use crate::panel::{Panel, UnitId};
use crate::utils::logging::{
    finish_progress_bar, log_phase_complete, log_refinement_problems, progress_for,
};

/// Builds and refines matched sets for a panel
#[derive(Debug, Clone)]
pub struct PanelMatcher {
    /// Matching configuration
    config: PanelMatchConfig,
    /// Propensity models used by the `ps.*` and `CBPS.*` methods
    models: ModelSet,
}

impl PanelMatcher {
    // Below this many treated observations the rayon overhead outweighs the gain
    const PARALLEL_THRESHOLD: usize = 64;

    /// Create a new matcher with the given configuration and the built-in models
    #[must_use]
    pub fn new(config: PanelMatchConfig) -> Self {
        Self {
            config,
            models: ModelSet::default(),
        }
    }

    /// Replace the propensity models
    #[must_use]
    pub fn with_models(mut self, models: ModelSet) -> Self {
        self.models = models;
        self
    }

    /// The configuration this matcher runs with
    #[must_use]
    pub const fn config(&self) -> &PanelMatchConfig {
        &self.config
    }

    /// Check that the panel provides every column the configuration reads
    fn validate_panel(&self, panel: &Panel) -> Result<()> {
        let required = std::iter::once(&self.config.outcome_var)
            .chain(self.config.exact_match_variables.iter())
            .cloned()
            .chain(self.config.covariates.variables());
        for column in required {
            if !panel.has_column(&column) {
                return Err(PanelMatchError::data(format!(
                    "Column '{column}' is not part of the panel"
                )));
            }
        }
        if panel.n_units() == 0 {
            return Err(PanelMatchError::data("Panel has no units"));
        }
        self.config.covariates.resolve(panel)?;
        Ok(())
    }

    /// Run matching for every side the quantity of interest requires
    ///
    /// # Arguments
    ///
    /// * `panel` - Balanced panel built from the configured columns
    ///
    /// # Returns
    ///
    /// Matched sets with original unit identifiers
    ///
    /// # Errors
    ///
    /// Configuration and data problems are reported before any matching work
    /// starts. Numerical problems abort only under
    /// [`crate::config::SingularCovariancePolicy::Abort`].
    pub fn run(&self, panel: &Panel) -> Result<PanelMatchResult> {
        let start_time = Instant::now();

        self.config.validate()?;
        self.validate_panel(panel)?;

        info!(
            "Matching panel of {} units x {} periods (qoi {}, lag {}, refinement {})",
            panel.n_units(),
            panel.n_periods(),
            self.config.qoi,
            self.config.effective_lag(),
            self.config.refinement_method
        );

        let mut sides = Vec::with_capacity(2);
        for side in qoi_runs(self.config.qoi) {
            let oriented = panel_for(side, panel);
            let collection = self.match_side(&oriented, side)?;
            sides.push(decode_collection(collection, panel.index())?);
        }

        let elapsed = start_time.elapsed();
        let total_sets: usize = sides.iter().map(MatchedSetCollection::len).sum();
        info!(
            "Matching complete: {} matched sets in {:.2?} ({:.2} sets/sec)",
            total_sets,
            elapsed,
            total_sets as f64 / elapsed.as_secs_f64().max(f64::EPSILON)
        );

        Ok(assemble_result(self.config.qoi, sides))
    }

    /// Build and refine the matched sets of one side on an already oriented panel
    ///
    /// `panel` must already have its treatment flipped for the control side;
    /// `side` only labels the resulting collection.
    pub fn match_side(&self, panel: &Panel, side: Qoi) -> Result<MatchedSetCollection<UnitId>> {
        let phase_start = Instant::now();
        let rules = HistoryRules::from_config(&self.config);

        let treated = find_treated_observations(panel, &rules);
        log_phase_complete("Found treated observations", treated.len(), phase_start.elapsed());

        // Use parallel or sequential processing based on configuration and workload size
        let use_parallel = self.config.use_parallel && treated.len() >= Self::PARALLEL_THRESHOLD;

        let phase_start = Instant::now();
        let mut candidates = build_matched_sets(panel, &treated, &rules, use_parallel);
        log_phase_complete("Built history matches", candidates.len(), phase_start.elapsed());

        let exact = ExactMatch::resolve(
            panel,
            &self.config.exact_match_variables,
            rules.lag,
            rules.missing,
        )?;
        let covariates = self.config.covariates.resolve(panel)?;
        let ctx = RefinementContext::new(panel, &covariates, &self.config);
        let refiner = for_method(self.config.refinement_method, &self.models);

        let constrain = |set: &mut CandidateSet| {
            apply_exact_match(panel, set, &exact);
            if self.config.listwise_delete {
                if let Some(window) = refiner.covariate_window(&ctx, set.treated.time) {
                    apply_listwise_deletion(set, &covariates, window);
                }
            }
        };
        if use_parallel {
            candidates.par_iter_mut().for_each(constrain);
        } else {
            candidates.iter_mut().for_each(constrain);
        }

        // refiners fit propensity models per treatment period
        candidates.sort_by_key(|s| (s.treated.time, s.treated.unit));
        let groups: Vec<&[CandidateSet]> = candidates
            .chunk_by(|a, b| a.treated.time == b.treated.time)
            .collect();
        debug!(
            "Refining {} candidate sets in {} period groups with {}",
            candidates.len(),
            groups.len(),
            refiner.method()
        );

        let phase_start = Instant::now();
        let pb = progress_for(self.config.show_progress, candidates.len(), "Refining matched sets");
        let refine = |group: &&[CandidateSet]| -> Result<Vec<RefinedSet>> {
            let refined = refiner.refine_group(&ctx, group)?;
            pb.inc(group.len() as u64);
            Ok(refined)
        };
        let refined: Vec<Vec<RefinedSet>> = if use_parallel {
            groups.par_iter().map(refine).collect::<Result<_>>()?
        } else {
            groups.iter().map(refine).collect::<Result<_>>()?
        };
        finish_progress_bar(&pb, Some("Refinement complete"));
        log_phase_complete("Refined matched sets", candidates.len(), phase_start.elapsed());

        let mut sets = Vec::with_capacity(candidates.len());
        let mut diagnostics = Vec::new();
        for (candidate, refined) in groups.iter().copied().flatten().zip(refined.into_iter().flatten()) {
            let treated = candidate.treated;
            if let Some(kind) = refined.diagnostic {
                diagnostics.push(RefinementDiagnostic {
                    unit: treated.unit,
                    time: treated.time,
                    kind,
                });
            }
            sets.push(MatchedSet {
                unit: treated.unit,
                time: treated.time,
                controls: refined.controls,
            });
        }
        sets.sort_by_key(|s| (s.unit, s.time));
        diagnostics.sort_by_key(|d| (d.unit, d.time));

        log_refinement_problems(side, diagnostics.len(), sets.len());
        for diagnostic in &diagnostics {
            debug!("{diagnostic}");
        }

        let collection = MatchedSetCollection {
            metadata: metadata_for(&self.config, side),
            sets,
            diagnostics,
        };
        info!("{}", collection.summary());
        Ok(collection)
    }
}

/// Build a panel from `batch` and run matching under `config`
///
/// # Errors
///
/// Fails on invalid configuration, on data that violates the panel contract,
/// and on numerical problems under
/// [`crate::config::SingularCovariancePolicy::Abort`].
pub fn panel_match(batch: &RecordBatch, config: &PanelMatchConfig) -> Result<PanelMatchResult> {
    config.validate()?;
    let panel = Panel::from_record_batch(batch, &config.panel_columns())?;
    PanelMatcher::new(config.clone()).run(&panel)
}
