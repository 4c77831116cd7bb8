//! Log lines shared by the parquet loader and the matcher
//!
//! Reading a panel is logged at info level. Matching phases log at debug
//! level so that large runs stay quiet unless asked.

use std::fmt::Display;
use std::path::Path;
use std::time::Duration;

/// Log the start of reading a panel file
pub fn log_read_start(path: &Path) {
    log::info!("Reading panel from {}", path.display());
}

/// Log a finished panel read
///
/// # Arguments
/// * `path` - Parquet file that was read
/// * `batches` - Number of record batches produced
/// * `rows` - Number of (unit, period) rows across all batches
/// * `elapsed` - Time spent reading
pub fn log_read_complete(path: &Path, batches: usize, rows: usize, elapsed: Duration) {
    log::info!(
        "Read {rows} panel rows in {batches} batches from {} in {elapsed:.2?}",
        path.display()
    );
}

/// Log the end of an in-memory matching phase at debug level
///
/// # Arguments
/// * `phase` - Name of the phase
/// * `items` - Number of items the phase produced
/// * `elapsed` - Time spent in the phase
pub fn log_phase_complete(phase: &str, items: usize, elapsed: Duration) {
    log::debug!("{phase}: {items} items in {elapsed:.2?}");
}

/// Warn that `problems` of the `sets` matched sets on `side` kept their
/// candidates unrefined or fell back to a simpler metric
pub fn log_refinement_problems(side: impl Display, problems: usize, sets: usize) {
    if problems > 0 {
        log::warn!("{problems} of {sets} matched sets ({side}) met a refinement problem");
    }
}
