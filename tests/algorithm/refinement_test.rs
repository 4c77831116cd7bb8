use std::sync::Arc;

use approx::assert_relative_eq;
use arrow::array::{ArrayRef, StringArray};
use arrow::datatypes::{DataType, Field, Schema};
use nalgebra::DMatrix;
use panel_match::algorithm::matching::model::design_matrix;
use panel_match::algorithm::matching::{DiagnosticKind, ModelSet, PropensityModel};
use panel_match::utils::test::fixtures::panel_from_histories;
use panel_match::{
    CovariateSpec, PanelMatchConfig, PanelMatchConfigBuilder, PanelMatchError, PanelMatcher,
    RecordBatch, RefinementMethod, SingularCovariancePolicy, UnitKey, panel_match,
};

use crate::utils::{base_config, generated_panel};

fn refined(method: RefinementMethod, formula: &str) -> PanelMatchConfigBuilder {
    base_config()
        .refinement_method(method)
        .covariates(CovariateSpec::parse(formula).unwrap())
        .use_parallel(false)
}

/// Unit 1 starts treatment at t=3, units 2-5 stay untreated; `y = 2x`
fn collinear_config(policy: SingularCovariancePolicy) -> (RecordBatch, PanelMatchConfig) {
    let histories = vec![
        vec![Some(0), Some(0), Some(1)],
        vec![Some(0), Some(0), Some(0)],
        vec![Some(0), Some(0), Some(0)],
        vec![Some(0), Some(0), Some(0)],
        vec![Some(0), Some(0), Some(0)],
    ];
    let x: Vec<Vec<Option<f64>>> = (1..=5_i32)
        .map(|u| (1..=3_i32).map(|t| Some(f64::from(u + t))).collect())
        .collect();
    let y: Vec<Vec<Option<f64>>> = x
        .iter()
        .map(|row| row.iter().map(|v| v.map(|v| 2.0 * v)).collect())
        .collect();
    let batch = panel_from_histories(&histories, &[("x", x), ("y", y)]);
    let config = refined(RefinementMethod::Mahalanobis, "x + y")
        .outcome_var("x")
        .size_match(1)
        .singular_covariance(policy)
        .build();
    (batch, config)
}

#[test]
fn test_weighting_methods_normalize_weights() {
    for method in [
        RefinementMethod::PsWeight,
        RefinementMethod::CbpsWeight,
        RefinementMethod::PsMsmWeight,
        RefinementMethod::CbpsMsmWeight,
    ] {
        let config = refined(method, "x1 + x2")
            .lead([0, 1])
            .forbid_treatment_reversal(true)
            .build();
        let panel = generated_panel(&config, 90, 10);

        let att = PanelMatcher::new(config).run(&panel).unwrap().att.unwrap();
        assert!(!att.is_empty(), "{method} produced no matched sets");
        for set in att.iter().filter(|s| !s.is_empty()) {
            assert_relative_eq!(set.total_weight(), 1.0, epsilon = 1e-9);
            assert!(set.controls.iter().all(|c| c.weight >= 0.0));
        }
    }
}

#[test]
fn test_matching_methods_keep_at_most_size_match() {
    let unrefined_config = base_config().use_parallel(false).build();
    let panel = generated_panel(&unrefined_config, 90, 10);
    let unrefined = PanelMatcher::new(unrefined_config).run(&panel).unwrap().att.unwrap();

    for method in [
        RefinementMethod::Mahalanobis,
        RefinementMethod::PsMatch,
        RefinementMethod::CbpsMatch,
    ] {
        let config = refined(method, "x1")
            .size_match(3)
            .use_diagonal_variance(true)
            .build();
        let att = PanelMatcher::new(config).run(&panel).unwrap().att.unwrap();

        assert_eq!(att.len(), unrefined.len());
        for (set, full) in att.iter().zip(unrefined.iter()) {
            assert_eq!(set.len(), full.len().min(3), "{method} at {} {}", set.unit, set.time);
            for control in set.control_units() {
                assert!(full.weight_of(control).is_some());
            }
            if !set.is_empty() {
                assert_relative_eq!(set.total_weight(), 1.0, epsilon = 1e-12);
            }
        }
    }
}

#[test]
fn test_verbose_matching_orders_by_distance() {
    let config = refined(RefinementMethod::Mahalanobis, "x1 + x2")
        .size_match(4)
        .verbose(true)
        .build();
    let panel = generated_panel(&config, 90, 10);

    let att = PanelMatcher::new(config).run(&panel).unwrap().att.unwrap();
    let mut checked = 0;
    for set in att.iter().filter(|s| s.len() >= 2) {
        let distances: Option<Vec<f64>> = set.controls.iter().map(|c| c.distance).collect();
        let Some(distances) = distances else {
            continue;
        };
        assert!(distances.windows(2).all(|w| w[0] <= w[1]));
        checked += 1;
    }
    assert!(checked > 0);
}

#[test]
fn test_singular_covariance_keeps_full_set() {
    let (batch, config) = collinear_config(SingularCovariancePolicy::KeepFullSet);

    let att = panel_match(&batch, &config).unwrap().att.unwrap();
    let set = att.get(&UnitKey::Int(1), 3).unwrap();
    assert_eq!(set.len(), 4);
    assert_relative_eq!(set.controls[0].weight, 0.25);
    assert_eq!(att.diagnostics.len(), 1);
    assert_eq!(att.diagnostics[0].kind, DiagnosticKind::SingularCovariance);
}

#[test]
fn test_singular_covariance_falls_back_to_diagonal() {
    let (batch, config) = collinear_config(SingularCovariancePolicy::DiagonalFallback);

    let att = panel_match(&batch, &config).unwrap().att.unwrap();
    let set = att.get(&UnitKey::Int(1), 3).unwrap();
    assert_eq!(set.control_units().collect::<Vec<_>>(), vec![&UnitKey::Int(2)]);
    assert_eq!(att.diagnostics[0].kind, DiagnosticKind::DiagonalFallback);
}

#[test]
fn test_singular_covariance_can_abort() {
    let (batch, config) = collinear_config(SingularCovariancePolicy::Abort);

    let err = panel_match(&batch, &config).unwrap_err();
    assert!(matches!(err, PanelMatchError::NumericalInstability(_)));
}

#[test]
fn test_listwise_deletion_drops_incomplete_candidates() {
    let histories = vec![
        vec![Some(0), Some(0), Some(1)],
        vec![Some(0), Some(0), Some(0)],
        vec![Some(0), Some(0), Some(0)],
        vec![Some(0), Some(0), Some(0)],
    ];
    let x = vec![
        vec![Some(1.0), Some(2.0), Some(3.0)],
        vec![Some(1.5), Some(2.5), Some(3.5)],
        vec![None, Some(2.2), Some(3.2)],
        vec![Some(0.5), Some(1.5), Some(2.5)],
    ];
    let batch = panel_from_histories(&histories, &[("x", x)]);
    let builder = || {
        refined(RefinementMethod::Mahalanobis, "x")
            .outcome_var("x")
            .size_match(5)
    };

    let kept = panel_match(&batch, &builder().build()).unwrap().att.unwrap();
    let deleted = panel_match(&batch, &builder().listwise_delete(true).build())
        .unwrap()
        .att
        .unwrap();

    let key = UnitKey::Int(1);
    assert_eq!(kept.get(&key, 3).unwrap().len(), 3);
    let set = deleted.get(&key, 3).unwrap();
    assert_eq!(
        set.control_units().collect::<Vec<_>>(),
        vec![&UnitKey::Int(2), &UnitKey::Int(4)]
    );
    assert_relative_eq!(set.total_weight(), 1.0);
}

#[derive(Debug)]
struct ConstantModel;

impl PropensityModel for ConstantModel {
    fn name(&self) -> &'static str {
        "constant"
    }

    fn fit_scores(&self, design: &DMatrix<f64>, _treated: &[bool]) -> panel_match::Result<Vec<f64>> {
        Ok(vec![0.5; design.nrows()])
    }
}

#[test]
fn test_custom_model_is_used_for_weighting() {
    let models = ModelSet {
        standard: Arc::new(ConstantModel),
        ..ModelSet::default()
    };
    let unrefined_config = base_config().use_parallel(false).build();
    let config = refined(RefinementMethod::PsWeight, "x1").build();
    let panel = generated_panel(&config, 60, 8);

    let unrefined = PanelMatcher::new(unrefined_config).run(&panel).unwrap().att.unwrap();
    let att = PanelMatcher::new(config)
        .with_models(models)
        .run(&panel)
        .unwrap()
        .att
        .unwrap();

    for (set, full) in att.iter().zip(unrefined.iter()) {
        assert_eq!(set.len(), full.len());
        for control in &set.controls {
            assert_relative_eq!(control.weight, 1.0 / set.len() as f64, epsilon = 1e-12);
        }
    }
    assert!(att.diagnostics.is_empty());
}

/// Unit 1 starts treatment at t=3 and stays treated; units 2-4 stay untreated
fn four_unit_batch(x: Vec<Vec<Option<f64>>>) -> RecordBatch {
    let histories = vec![
        vec![Some(0), Some(0), Some(1), Some(1)],
        vec![Some(0), Some(0), Some(0), Some(0)],
        vec![Some(0), Some(0), Some(0), Some(0)],
        vec![Some(0), Some(0), Some(0), Some(0)],
    ];
    panel_from_histories(&histories, &[("x", x)])
}

#[test]
fn test_unranked_candidates_respect_size_match() {
    // unit 1 has no covariates in its history window
    let history_gap = four_unit_batch(vec![
        vec![None, None, Some(1.0), Some(1.2)],
        vec![Some(0.4), Some(0.6), Some(0.8), Some(1.0)],
        vec![Some(1.4), Some(1.6), Some(1.8), Some(2.0)],
        vec![Some(2.4), Some(2.6), Some(2.8), Some(3.0)],
    ]);
    // unit 1 has no covariates at its treatment period
    let onset_gap = four_unit_batch(vec![
        vec![Some(1.0), Some(1.1), None, Some(1.2)],
        vec![Some(0.4), Some(0.6), Some(0.8), Some(1.0)],
        vec![Some(1.4), Some(1.6), Some(1.8), Some(2.0)],
        vec![Some(2.4), Some(2.6), Some(2.8), Some(3.0)],
    ]);

    let cases = [
        (RefinementMethod::Mahalanobis, &history_gap),
        (RefinementMethod::PsMatch, &onset_gap),
        (RefinementMethod::CbpsMatch, &onset_gap),
    ];
    for (method, batch) in cases {
        let config = refined(method, "x").outcome_var("x").size_match(1).build();
        let att = panel_match(batch, &config).unwrap().att.unwrap();

        let set = att.get(&UnitKey::Int(1), 3).unwrap();
        assert_eq!(
            set.control_units().collect::<Vec<_>>(),
            vec![&UnitKey::Int(2)],
            "{method} kept more than size_match controls"
        );
        assert_relative_eq!(set.total_weight(), 1.0);
        assert_eq!(att.diagnostics.len(), 1);
        assert_eq!(att.diagnostics[0].kind, DiagnosticKind::InsufficientCovariates);
    }
}

#[test]
fn test_single_period_msm_equals_propensity_weighting() {
    for (weight, msm) in [
        (RefinementMethod::PsWeight, RefinementMethod::PsMsmWeight),
        (RefinementMethod::CbpsWeight, RefinementMethod::CbpsMsmWeight),
    ] {
        let builder = |method| {
            refined(method, "x1 + x2")
                .lead([0])
                .forbid_treatment_reversal(true)
                .build()
        };
        let panel = generated_panel(&builder(weight), 90, 10);

        let weighted = PanelMatcher::new(builder(weight)).run(&panel).unwrap().att.unwrap();
        let structural = PanelMatcher::new(builder(msm)).run(&panel).unwrap().att.unwrap();
        assert_eq!(weighted.sets, structural.sets, "{msm} differs from {weight}");
        assert_eq!(weighted.diagnostics, structural.diagnostics);
    }
}

/// Scores `sigmoid(z)` for the first standardized covariate, so the odds are `exp(z)`
#[derive(Debug)]
struct StandardizedScoreModel;

fn logistic(z: f64) -> f64 {
    1.0 / (1.0 + (-z).exp())
}

impl PropensityModel for StandardizedScoreModel {
    fn name(&self) -> &'static str {
        "standardized"
    }

    fn fit_scores(&self, design: &DMatrix<f64>, _treated: &[bool]) -> panel_match::Result<Vec<f64>> {
        Ok((0..design.nrows()).map(|i| logistic(design[(i, 1)])).collect())
    }
}

#[test]
fn test_msm_weights_multiply_odds_over_lead_window() {
    let at_onset = [1.0, 0.0, 2.0, 3.0];
    let one_later = [1.0, 3.0, 0.5, 0.0];
    let x = (0..4)
        .map(|u| vec![Some(1.0), Some(1.0), Some(at_onset[u]), Some(one_later[u])])
        .collect();
    let batch = four_unit_batch(x);
    let models = || ModelSet {
        standard: Arc::new(StandardizedScoreModel),
        ..ModelSet::default()
    };
    let run = |method| {
        let config = refined(method, "x")
            .outcome_var("x")
            .lead([0, 1])
            .forbid_treatment_reversal(true)
            .build();
        let panel = panel_match::Panel::from_record_batch(&batch, &config.panel_columns()).unwrap();
        PanelMatcher::new(config)
            .with_models(models())
            .run(&panel)
            .unwrap()
            .att
            .unwrap()
    };

    // the pool is unit 1 followed by its three controls in both periods
    let odds_at = |values: &[f64; 4]| -> Vec<f64> {
        let rows: Vec<Vec<f64>> = values.iter().map(|&v| vec![v]).collect();
        let design = design_matrix(&rows);
        (1..4)
            .map(|i| {
                let p = logistic(design[(i, 1)]);
                p / (1.0 - p)
            })
            .collect()
    };
    let onset_odds = odds_at(&at_onset);
    let later_odds = odds_at(&one_later);
    let path: Vec<f64> = onset_odds.iter().zip(&later_odds).map(|(a, b)| a * b).collect();
    let path_total: f64 = path.iter().sum();
    let onset_total: f64 = onset_odds.iter().sum();

    let msm = run(RefinementMethod::PsMsmWeight);
    let weighted = run(RefinementMethod::PsWeight);
    let msm_set = msm.get(&UnitKey::Int(1), 3).unwrap();
    let weighted_set = weighted.get(&UnitKey::Int(1), 3).unwrap();

    let mut largest_gap: f64 = 0.0;
    for (i, unit) in (2..=4).enumerate() {
        let key = UnitKey::Int(unit);
        let msm_weight = msm_set.weight_of(&key).unwrap();
        let single_weight = weighted_set.weight_of(&key).unwrap();
        assert_relative_eq!(msm_weight, path[i] / path_total, epsilon = 1e-9);
        assert_relative_eq!(single_weight, onset_odds[i] / onset_total, epsilon = 1e-9);
        largest_gap = largest_gap.max((msm_weight - single_weight).abs());
    }
    assert!(largest_gap > 1e-3);
}

#[test]
fn test_categorical_columns_only_serve_exact_matching() {
    let x = (0..4)
        .map(|u| (0..4).map(|t| Some(f64::from(u * 4 + t))).collect())
        .collect();
    let batch = four_unit_batch(x);
    let regions: Vec<&str> = ["north", "north", "south", "south"]
        .iter()
        .flat_map(|&r| std::iter::repeat_n(r, 4))
        .collect();
    let mut fields: Vec<Field> = batch.schema().fields().iter().map(|f| f.as_ref().clone()).collect();
    fields.push(Field::new("region", DataType::Utf8, false));
    let mut columns: Vec<ArrayRef> = batch.columns().to_vec();
    columns.push(Arc::new(StringArray::from(regions)));
    let batch = RecordBatch::try_new(Arc::new(Schema::new(fields)), columns).unwrap();

    let as_covariate = refined(RefinementMethod::Mahalanobis, "x + region")
        .outcome_var("x")
        .build();
    let err = panel_match(&batch, &as_covariate).unwrap_err();
    assert!(matches!(err, PanelMatchError::DataValidation(_)), "{err}");

    let as_exact = base_config()
        .outcome_var("x")
        .exact_match_variables(["region"])
        .use_parallel(false)
        .build();
    let att = panel_match(&batch, &as_exact).unwrap().att.unwrap();
    let set = att.get(&UnitKey::Int(1), 3).unwrap();
    assert_eq!(set.control_units().collect::<Vec<_>>(), vec![&UnitKey::Int(2)]);
}
