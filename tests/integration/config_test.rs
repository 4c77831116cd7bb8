use std::io::Write;

use panel_match::utils::test::fixtures::{example_three_unit_batch, long_panel_batch};
use panel_match::{PanelMatchConfig, PanelMatchError, Qoi, RefinementMethod, panel_match};
use tempfile::NamedTempFile;

fn write_json(content: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file
}

#[test]
fn test_config_loads_from_json_file() {
    let file = write_json(
        r#"{
            "lag": 2,
            "time_id": "time",
            "unit_id": "id",
            "treatment": "treat",
            "outcome_var": "x",
            "refinement_method": "CBPS.msm.weight",
            "covariates": "~ x + lag(x, 1:2)",
            "qoi": "ate",
            "lead": [2, 0, 1],
            "forbid_treatment_reversal": true
        }"#,
    );

    let config = PanelMatchConfig::from_json_file(file.path()).unwrap();
    assert_eq!(config.refinement_method, RefinementMethod::CbpsMsmWeight);
    assert_eq!(config.qoi, Qoi::Ate);
    assert_eq!(config.normalized_lead(), vec![0, 1, 2]);
    assert_eq!(config.size_match, 10);
    assert_eq!(config.covariates.dimension(), 3);
    assert!(config.use_parallel);
}

#[test]
fn test_invalid_json_config_is_rejected_on_load() {
    let file = write_json(
        r#"{
            "lag": 2,
            "time_id": "time",
            "unit_id": "id",
            "treatment": "treat",
            "outcome_var": "x",
            "refinement_method": "ps.msm.weight",
            "covariates": "x",
            "qoi": "att"
        }"#,
    );

    let err = PanelMatchConfig::from_json_file(file.path()).unwrap_err();
    assert!(err.is_configuration());
}

#[test]
fn test_unknown_method_name_is_a_json_error() {
    let file = write_json(
        r#"{"lag": 1, "time_id": "t", "unit_id": "u", "treatment": "d",
            "outcome_var": "y", "refinement_method": "ps.magic", "qoi": "att"}"#,
    );

    let err = PanelMatchConfig::from_json_file(file.path()).unwrap_err();
    assert!(matches!(err, PanelMatchError::Json(_)));
}

#[test]
fn test_configuration_errors_come_before_data_errors() {
    // the batch lacks the outcome column, but the configuration is checked first
    let config = PanelMatchConfig::builder()
        .lag(0)
        .columns("id", "time", "treat")
        .outcome_var("missing")
        .build();

    let err = panel_match(&example_three_unit_batch(false), &config).unwrap_err();
    assert!(err.is_configuration());
}

#[test]
fn test_missing_outcome_column_is_a_data_error() {
    let config = PanelMatchConfig::builder()
        .lag(2)
        .columns("id", "time", "treat")
        .outcome_var("y")
        .build();

    let err = panel_match(&example_three_unit_batch(false), &config).unwrap_err();
    assert!(matches!(err, PanelMatchError::DataValidation(_)));
}

#[test]
fn test_duplicate_rows_are_rejected() {
    let batch = long_panel_batch(
        &[1, 1, 2, 2, 2],
        &[1, 2, 1, 2, 2],
        &[Some(0), Some(1), Some(0), Some(0), Some(0)],
        &[("x", vec![Some(1.0); 5])],
    );
    let config = PanelMatchConfig::builder()
        .lag(1)
        .columns("id", "time", "treat")
        .outcome_var("x")
        .build();

    let err = panel_match(&batch, &config).unwrap_err();
    assert!(matches!(err, PanelMatchError::DuplicateKey { time: 2, .. }));
}
