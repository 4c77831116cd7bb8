use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, bail};
use log::info;
use panel_match::{PanelMatchConfig, PanelMatcher, read_panel_parquet};

fn main() -> anyhow::Result<()> {
    // Setup logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let mut args = std::env::args().skip(1);
    let (Some(config_path), Some(panel_path)) = (args.next(), args.next()) else {
        bail!("usage: panel-match <config.json> <panel.parquet>");
    };
    let config_path = PathBuf::from(config_path);
    let panel_path = PathBuf::from(panel_path);

    let start = Instant::now();
    let config = PanelMatchConfig::from_json_file(&config_path)
        .with_context(|| format!("Failed to load configuration {}", config_path.display()))?;

    let panel = read_panel_parquet(&panel_path, &config.panel_columns())
        .with_context(|| format!("Failed to load panel {}", panel_path.display()))?;

    let result = PanelMatcher::new(config).run(&panel)?;
    for collection in result.collections() {
        info!("{}", collection.summary());
    }

    println!("{}", serde_json::to_string_pretty(&result)?);
    info!("Finished in {:.2?}", start.elapsed());
    Ok(())
}
