//! Balanced panel representation
//!
//! A [`Panel`] holds every (unit, period) combination between the first and
//! last period found anywhere in the input. Rows missing from the input are
//! present as `None` cells. Storage is unit-major: all periods of unit 1, then
//! all periods of unit 2, and so on, with units in first-appearance order.

pub mod extraction;
pub mod index;
pub mod loader;

use std::ops::RangeInclusive;
use std::time::Instant;

use arrow::compute::concat_batches;
use arrow::record_batch::RecordBatch;
use log::{debug, info};
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};

use crate::error::{PanelMatchError, Result};
use extraction::{extract_column, extract_periods, extract_treatment, extract_unit_keys, get_column};
pub use index::{UnitId, UnitIndex, UnitKey};

/// Largest number of balanced cells a panel may hold
const MAX_PANEL_CELLS: usize = 1 << 26;

/// Names of the columns a panel is built from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PanelColumns {
    /// Unit identifier column
    pub unit: String,
    /// Time period column
    pub time: String,
    /// Binary treatment column
    pub treatment: String,
    /// Outcome column, carried as a regular value column
    pub outcome: Option<String>,
    /// Covariate and exact-match columns
    pub values: Vec<String>,
}

impl PanelColumns {
    /// Create a column set with only the key columns
    pub fn new(unit: impl Into<String>, time: impl Into<String>, treatment: impl Into<String>) -> Self {
        Self {
            unit: unit.into(),
            time: time.into(),
            treatment: treatment.into(),
            outcome: None,
            values: Vec::new(),
        }
    }

    /// Set the outcome column
    #[must_use]
    pub fn with_outcome(mut self, outcome: impl Into<String>) -> Self {
        self.outcome = Some(outcome.into());
        self
    }

    /// Add value columns, ignoring names that are already present
    #[must_use]
    pub fn with_values<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for column in columns {
            let column = column.into();
            if !self.values.contains(&column) && Some(&column) != self.outcome.as_ref() {
                self.values.push(column);
            }
        }
        self
    }

    fn value_columns(&self) -> impl Iterator<Item = &String> {
        self.outcome.iter().chain(self.values.iter())
    }
}

/// A value column of the balanced panel
#[derive(Debug, Clone)]
pub struct PanelColumn {
    values: Vec<Option<f64>>,
    categorical: bool,
}

impl PanelColumn {
    /// Whether the column holds category codes rather than measurements
    #[must_use]
    pub const fn is_categorical(&self) -> bool {
        self.categorical
    }
}

/// Rectangular unit × period panel
#[derive(Debug, Clone)]
pub struct Panel {
    columns_spec: PanelColumns,
    index: UnitIndex,
    first_period: i64,
    n_periods: usize,
    treatment: Vec<Option<u8>>,
    columns: FxHashMap<String, PanelColumn>,
    observed_rows: usize,
}

impl Panel {
    /// Build a balanced panel from a single record batch
    ///
    /// # Errors
    ///
    /// Fails when a named column is missing or has an unusable type, when the
    /// unit id column cannot be encoded, when a (unit, time) pair repeats, or
    /// when the units times the period span exceed the cell limit.
    pub fn from_record_batch(batch: &RecordBatch, columns: &PanelColumns) -> Result<Self> {
        let start = Instant::now();

        let unit_keys = extract_unit_keys(&get_column(batch, &columns.unit)?, &columns.unit)?;
        let periods = extract_periods(&get_column(batch, &columns.time)?, &columns.time)?;
        let treatment = extract_treatment(&get_column(batch, &columns.treatment)?, &columns.treatment)?;

        let mut extracted = FxHashMap::default();
        for name in columns.value_columns() {
            let column = extract_column(&get_column(batch, name)?, name)?;
            extracted.insert(name.clone(), column);
        }

        let mut index = UnitIndex::new();
        let mut rows = Vec::with_capacity(unit_keys.len());
        let mut seen: FxHashSet<(UnitId, i64)> = FxHashSet::default();
        for (key, &period) in unit_keys.into_iter().zip(periods.iter()) {
            let display = key.to_string();
            let unit = index.encode(key);
            if !seen.insert((unit, period)) {
                return Err(PanelMatchError::DuplicateKey {
                    unit: display,
                    time: period,
                });
            }
            rows.push((unit, period));
        }

        let (first_period, n_periods) = match (periods.iter().min(), periods.iter().max()) {
            (Some(&lo), Some(&hi)) => {
                let span = hi
                    .checked_sub(lo)
                    .and_then(|d| d.checked_add(1))
                    .and_then(|n| usize::try_from(n).ok())
                    .ok_or_else(|| {
                        PanelMatchError::data(format!(
                            "Periods in column '{}' span {lo}..={hi}, which does not fit a balanced panel",
                            columns.time
                        ))
                    })?;
                (lo, span)
            }
            _ => (0, 0),
        };

        let cells = index
            .len()
            .checked_mul(n_periods)
            .filter(|&cells| cells <= MAX_PANEL_CELLS)
            .ok_or_else(|| {
                PanelMatchError::data(format!(
                    "{} units over {n_periods} periods exceed the limit of {MAX_PANEL_CELLS} panel cells; \
                     time codes in column '{}' must be consecutive integers",
                    index.len(),
                    columns.time
                ))
            })?;
        let offset = |unit: UnitId, period: i64| {
            (unit as usize - 1) * n_periods + (period - first_period) as usize
        };

        let mut balanced_treatment = vec![None; cells];
        for (row, &(unit, period)) in rows.iter().enumerate() {
            balanced_treatment[offset(unit, period)] = treatment[row];
        }

        let mut balanced_columns = FxHashMap::default();
        for (name, column) in extracted {
            let mut values = vec![None; cells];
            for (row, &(unit, period)) in rows.iter().enumerate() {
                values[offset(unit, period)] = column.values[row];
            }
            balanced_columns.insert(
                name,
                PanelColumn {
                    values,
                    categorical: column.categorical,
                },
            );
        }

        debug!(
            "Balanced {} rows into {} units x {} periods ({} filled cells)",
            rows.len(),
            index.len(),
            n_periods,
            cells.saturating_sub(rows.len())
        );
        info!(
            "Indexed panel with {} units over periods {}..={} in {:.2?}",
            index.len(),
            first_period,
            first_period + n_periods as i64 - 1,
            start.elapsed()
        );

        Ok(Self {
            columns_spec: columns.clone(),
            index,
            first_period,
            n_periods,
            treatment: balanced_treatment,
            columns: balanced_columns,
            observed_rows: rows.len(),
        })
    }

    /// Build a balanced panel from several record batches sharing one schema
    pub fn from_record_batches(batches: &[RecordBatch], columns: &PanelColumns) -> Result<Self> {
        let Some(first) = batches.first() else {
            return Err(PanelMatchError::data("No record batches supplied"));
        };
        let combined = concat_batches(&first.schema(), batches)?;
        Self::from_record_batch(&combined, columns)
    }

    /// Column names this panel was built from
    #[must_use]
    pub const fn columns(&self) -> &PanelColumns {
        &self.columns_spec
    }

    /// Unit identifier map
    #[must_use]
    pub const fn index(&self) -> &UnitIndex {
        &self.index
    }

    /// Internal unit ids in first-appearance order
    pub fn units(&self) -> impl Iterator<Item = UnitId> + use<> {
        self.index.ids()
    }

    /// Number of units
    #[must_use]
    pub fn n_units(&self) -> usize {
        self.index.len()
    }

    /// Number of periods per unit
    #[must_use]
    pub const fn n_periods(&self) -> usize {
        self.n_periods
    }

    /// Number of rows present in the input before balancing
    #[must_use]
    pub const fn observed_rows(&self) -> usize {
        self.observed_rows
    }

    /// First period of the panel
    #[must_use]
    pub const fn first_period(&self) -> i64 {
        self.first_period
    }

    /// Last period of the panel
    #[must_use]
    pub const fn last_period(&self) -> i64 {
        self.first_period + self.n_periods as i64 - 1
    }

    /// All periods of the panel
    #[must_use]
    pub const fn periods(&self) -> RangeInclusive<i64> {
        self.first_period..=self.last_period()
    }

    /// Cell offset of (unit, period), `None` outside the panel
    #[must_use]
    pub fn offset(&self, unit: UnitId, period: i64) -> Option<usize> {
        if unit == 0 || unit as usize > self.index.len() {
            return None;
        }
        let t = period.checked_sub(self.first_period)?;
        if t < 0 || t as usize >= self.n_periods {
            return None;
        }
        Some((unit as usize - 1) * self.n_periods + t as usize)
    }

    /// Treatment at (unit, period); `None` when missing or outside the panel
    #[must_use]
    pub fn treatment(&self, unit: UnitId, period: i64) -> Option<u8> {
        self.offset(unit, period).and_then(|o| self.treatment[o])
    }

    /// Look up a value column
    #[must_use]
    pub fn column(&self, name: &str) -> Option<&PanelColumn> {
        self.columns.get(name)
    }

    /// Whether a value column is present
    #[must_use]
    pub fn has_column(&self, name: &str) -> bool {
        self.columns.contains_key(name)
    }

    /// Value of `column` at (unit, period); `None` when missing or outside the panel
    #[must_use]
    pub fn value(&self, column: &PanelColumn, unit: UnitId, period: i64) -> Option<f64> {
        self.offset(unit, period).and_then(|o| column.values[o])
    }

    /// Value of the named column at (unit, period)
    #[must_use]
    pub fn value_by_name(&self, name: &str, unit: UnitId, period: i64) -> Option<f64> {
        self.column(name).and_then(|c| self.value(c, unit, period))
    }

    /// Copy of this panel with the treatment indicator inverted
    ///
    /// Missing cells stay missing. The original panel is left untouched so
    /// both runs of an ATE computation can share it.
    #[must_use]
    pub fn with_flipped_treatment(&self) -> Self {
        let mut flipped = self.clone();
        for cell in &mut flipped.treatment {
            *cell = cell.map(|d| 1 - d);
        }
        flipped
    }
}
