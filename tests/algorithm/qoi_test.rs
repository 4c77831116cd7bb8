use std::sync::Arc;

use arrow::array::{ArrayRef, Float64Array, Int64Array, StringArray};
use arrow::datatypes::{DataType, Field, Schema};
use panel_match::utils::test::fixtures::generated_panel_batch;
use panel_match::{
    CovariateSpec, PanelMatchError, PanelMatcher, Qoi, RecordBatch, RefinementMethod, UnitKey,
    panel_match,
};

use crate::utils::{base_config, generated_panel, internal_id};

/// The three-unit histories keyed by country codes, with float periods
fn country_batch(ids: ArrayRef) -> RecordBatch {
    let schema = Schema::new(vec![
        Field::new("id", ids.data_type().clone(), false),
        Field::new("time", DataType::Float64, false),
        Field::new("treat", DataType::Int64, true),
        Field::new("x1", DataType::Float64, true),
    ]);
    let times: Vec<f64> = (0..3).flat_map(|_| [1.0, 2.0, 3.0, 4.0]).collect();
    let treat = [0, 0, 1, 1, 0, 0, 0, 0, 0, 0, 0, 1];
    let x1: Vec<f64> = (0..12_u32).map(|i| f64::from(i) * 0.5).collect();
    RecordBatch::try_new(
        Arc::new(schema),
        vec![
            ids,
            Arc::new(Float64Array::from(times)),
            Arc::new(Int64Array::from(treat.to_vec())),
            Arc::new(Float64Array::from(x1)),
        ],
    )
    .unwrap()
}

fn repeat<T: Clone>(keys: &[T]) -> Vec<T> {
    keys.iter().flat_map(|k| std::iter::repeat_n(k.clone(), 4)).collect()
}

#[test]
fn test_ate_equals_separate_att_and_atc() {
    for (method, formula) in [
        (RefinementMethod::None, ""),
        (RefinementMethod::Mahalanobis, "x1"),
        (RefinementMethod::PsMatch, "x1 + x2"),
        (RefinementMethod::CbpsWeight, "x1 + x2"),
    ] {
        let builder = || {
            base_config()
                .lag(2)
                .refinement_method(method)
                .covariates(CovariateSpec::parse(formula).unwrap())
                .size_match(4)
                .use_parallel(false)
        };
        let panel = generated_panel(&builder().build(), 80, 10);

        let ate = PanelMatcher::new(builder().qoi(Qoi::Ate).build()).run(&panel).unwrap();
        let att = PanelMatcher::new(builder().qoi(Qoi::Att).build()).run(&panel).unwrap();
        let atc = PanelMatcher::new(builder().qoi(Qoi::Atc).build()).run(&panel).unwrap();

        assert_eq!(ate.qoi, Qoi::Ate);
        assert!(att.atc.is_none());
        assert!(atc.att.is_none());
        assert_eq!(ate.att, att.att, "att side differs under {method}");
        assert_eq!(ate.atc, atc.atc, "atc side differs under {method}");
        assert_eq!(ate.collections().count(), 2);
    }
}

#[test]
fn test_atc_sets_follow_switches_out_of_treatment() {
    let config = base_config().lag(2).qoi(Qoi::Atc).use_parallel(false).build();
    let panel = generated_panel(&config, 60, 10);

    let atc = PanelMatcher::new(config).run(&panel).unwrap().atc.unwrap();
    assert_eq!(atc.metadata.qoi, Qoi::Atc);
    assert!(!atc.is_empty());

    for set in &atc {
        let unit = internal_id(&panel, &set.unit);
        assert_eq!(panel.treatment(unit, set.time), Some(0));
        assert_eq!(panel.treatment(unit, set.time - 1), Some(1));
        for control in set.control_units() {
            let control = internal_id(&panel, control);
            assert_eq!(panel.treatment(control, set.time), Some(1));
        }
    }
}

#[test]
fn test_string_identifiers_round_trip() {
    let ids: ArrayRef = Arc::new(StringArray::from(repeat(&["DNK", "SWE", "NOR"])));
    let config = base_config().lag(2).build();

    let result = panel_match(&country_batch(ids), &config).unwrap();
    let att = result.att.unwrap();

    let dnk = UnitKey::from("DNK");
    let nor = UnitKey::from("NOR");
    let swe = UnitKey::from("SWE");
    let set = att.get(&dnk, 3).expect("DNK starts treatment at time 3");
    assert_eq!(set.control_units().cloned().collect::<Vec<_>>(), vec![swe.clone(), nor.clone()]);
    // NOR switches on at its last period; DNK is treated by then
    let set = att.get(&nor, 4).unwrap();
    assert_eq!(set.control_units().collect::<Vec<_>>(), vec![&swe]);
    assert!(att.iter().all(|s| matches!(s.unit, UnitKey::Str(_))));
}

#[test]
fn test_integral_float_identifiers_decode_to_integers() {
    let ids: ArrayRef = Arc::new(Float64Array::from(repeat(&[10.0, 20.0, 30.0])));
    let config = base_config().lag(2).build();

    let att = panel_match(&country_batch(ids), &config).unwrap().att.unwrap();
    let set = att.get(&UnitKey::Int(10), 3).unwrap();
    assert_eq!(set.weight_of(&UnitKey::Int(20)), Some(0.5));
    assert_eq!(set.weight_of(&UnitKey::Int(30)), Some(0.5));
}

#[test]
fn test_fractional_identifiers_are_rejected() {
    let ids: ArrayRef = Arc::new(Float64Array::from(repeat(&[1.5, 2.0, 3.0])));
    let config = base_config().lag(2).build();

    let err = panel_match(&country_batch(ids), &config).unwrap_err();
    assert!(matches!(err, PanelMatchError::InvalidIdentifierType(_)));
}

#[test]
fn test_results_serialize_with_original_identifiers() {
    let config = base_config().lag(2).qoi(Qoi::Ate).build();
    let result = panel_match(&generated_panel_batch(20, 8), &config).unwrap();

    let json = serde_json::to_value(&result).unwrap();
    assert_eq!(json["qoi"], "ate");
    assert_eq!(json["att"]["metadata"]["refinement_method"], "none");
    assert!(json["att"]["sets"].as_array().is_some_and(|sets| !sets.is_empty()));
    assert!(json["att"]["sets"][0]["unit"].is_i64());
}
