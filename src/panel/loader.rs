//! Parquet loading for panel data
//!
//! Reads only the columns a [`PanelColumns`] names and balances the result.

use std::fs::File;
use std::path::Path;
use std::time::Instant;

use arrow::record_batch::RecordBatch;
use itertools::Itertools;
use parquet::arrow::{ProjectionMask, arrow_reader::ParquetRecordBatchReaderBuilder};

use crate::error::{PanelMatchError, Result};
use crate::panel::{Panel, PanelColumns};
use crate::utils::logging::{log_read_complete, log_read_start};

/// Default batch size for Parquet reading
pub const DEFAULT_BATCH_SIZE: usize = 16384;

/// Read the record batches of a parquet file, projected onto the panel columns
///
/// # Errors
/// Returns an error if the file cannot be opened, is not valid parquet, or
/// lacks one of the requested columns
pub fn read_panel_batches(path: &Path, columns: &PanelColumns) -> Result<Vec<RecordBatch>> {
    let start = Instant::now();
    log_read_start(path);

    let file = File::open(path)?;
    let builder = ParquetRecordBatchReaderBuilder::try_new(file)?;

    let wanted = [&columns.unit, &columns.time, &columns.treatment]
        .into_iter()
        .chain(columns.outcome.iter())
        .chain(columns.values.iter())
        .unique()
        .collect_vec();

    let file_schema = builder.schema().clone();
    let projection = wanted
        .iter()
        .map(|name| {
            file_schema.index_of(name).map_err(|_| {
                PanelMatchError::data(format!(
                    "Column '{name}' not found in {}",
                    path.display()
                ))
            })
        })
        .collect::<Result<Vec<usize>>>()?;

    let mask = ProjectionMask::roots(builder.parquet_schema(), projection);
    let reader = builder
        .with_projection(mask)
        .with_batch_size(DEFAULT_BATCH_SIZE)
        .build()?;

    let batches = reader.collect::<std::result::Result<Vec<_>, _>>()?;
    let rows = batches.iter().map(RecordBatch::num_rows).sum();
    log_read_complete(path, batches.len(), rows, start.elapsed());
    Ok(batches)
}

/// Load and balance a panel stored in a parquet file
pub fn read_panel_parquet(path: &Path, columns: &PanelColumns) -> Result<Panel> {
    let batches = read_panel_batches(path, columns)?;
    Panel::from_record_batches(&batches, columns)
}
