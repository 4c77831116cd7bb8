use panel_match::utils::test::fixtures::generated_panel_batch;
use panel_match::{Panel, PanelMatchConfig, PanelMatchConfigBuilder, UnitId, UnitKey};

/// Builder preset for the columns produced by the fixtures
#[must_use]
pub fn base_config() -> PanelMatchConfigBuilder {
    PanelMatchConfig::builder()
        .lag(2)
        .columns("id", "time", "treat")
        .outcome_var("x1")
}

/// Synthetic panel with the columns `config` reads
#[must_use]
pub fn generated_panel(config: &PanelMatchConfig, n_units: usize, n_periods: usize) -> Panel {
    let batch = generated_panel_batch(n_units, n_periods);
    Panel::from_record_batch(&batch, &config.panel_columns()).expect("fixture panel is valid")
}

/// Internal id of an original identifier
#[must_use]
pub fn internal_id(panel: &Panel, key: &UnitKey) -> UnitId {
    panel.index().id_of(key).expect("key was encoded")
}
