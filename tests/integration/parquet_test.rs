use std::fs::File;

use panel_match::utils::test::fixtures::generated_panel_batch;
use panel_match::{
    CovariateSpec, PanelMatchError, PanelMatcher, Qoi, RefinementMethod, panel_match,
    read_panel_batches, read_panel_parquet,
};
use parquet::arrow::ArrowWriter;
use tempfile::TempDir;

use crate::utils::base_config;

fn write_parquet(dir: &TempDir, batch: &panel_match::RecordBatch) -> std::path::PathBuf {
    let path = dir.path().join("panel.parquet");
    let file = File::create(&path).unwrap();
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None).unwrap();
    writer.write(batch).unwrap();
    writer.close().unwrap();
    path
}

#[test]
fn test_parquet_panel_matches_in_memory_panel() {
    let dir = TempDir::new().unwrap();
    let batch = generated_panel_batch(50, 8);
    let path = write_parquet(&dir, &batch);

    let config = base_config()
        .refinement_method(RefinementMethod::PsMatch)
        .covariates(CovariateSpec::parse("x1 + x2").unwrap())
        .size_match(3)
        .qoi(Qoi::Ate)
        .build();

    let from_file = read_panel_parquet(&path, &config.panel_columns()).unwrap();
    assert_eq!(from_file.n_units(), 50);
    assert_eq!(from_file.n_periods(), 8);

    let expected = panel_match(&batch, &config).unwrap();
    let actual = PanelMatcher::new(config).run(&from_file).unwrap();
    assert_eq!(actual, expected);
}

#[test]
fn test_parquet_reads_only_requested_columns() {
    let dir = TempDir::new().unwrap();
    let path = write_parquet(&dir, &generated_panel_batch(10, 5));

    let config = base_config().build();
    let batches = read_panel_batches(&path, &config.panel_columns()).unwrap();
    let schema = batches[0].schema();
    let names: Vec<&str> = schema.fields().iter().map(|f| f.name().as_str()).collect();
    assert_eq!(names, vec!["id", "time", "treat", "x1"]);
}

#[test]
fn test_parquet_missing_column_is_a_data_error() {
    let dir = TempDir::new().unwrap();
    let path = write_parquet(&dir, &generated_panel_batch(10, 5));

    let config = base_config().outcome_var("gdp").build();
    let err = read_panel_parquet(&path, &config.panel_columns()).unwrap_err();
    assert!(matches!(err, PanelMatchError::DataValidation(_)));
}

#[test]
fn test_missing_parquet_file_is_an_io_error() {
    let dir = TempDir::new().unwrap();
    let config = base_config().build();

    let err = read_panel_parquet(&dir.path().join("absent.parquet"), &config.panel_columns()).unwrap_err();
    assert!(matches!(err, PanelMatchError::Io(_)));
}
