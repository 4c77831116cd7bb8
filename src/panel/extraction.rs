//! Column extraction from Arrow record batches
//!
//! Each reader accepts the families of Arrow types a panel column may arrive
//! as, casts them to a single working representation and reports type or
//! null problems against the column name.

use arrow::array::{Array, ArrayRef, Float64Array, Int64Array, LargeStringArray, StringArray};
use arrow::compute::cast;
use arrow::datatypes::DataType;
use arrow::record_batch::RecordBatch;
use rustc_hash::FxHashMap;

use crate::error::{PanelMatchError, Result};
use crate::panel::index::UnitKey;

/// Values of a non-key column after extraction
#[derive(Debug, Clone)]
pub struct ExtractedColumn {
    /// Numeric values, or category codes for string columns
    pub values: Vec<Option<f64>>,
    /// Whether the values are category codes
    pub categorical: bool,
}

/// Get a column by name or fail with a validation error
pub fn get_column(batch: &RecordBatch, column_name: &str) -> Result<ArrayRef> {
    batch
        .column_by_name(column_name)
        .cloned()
        .ok_or_else(|| PanelMatchError::data(format!("Column '{column_name}' not found")))
}

const fn is_integer(data_type: &DataType) -> bool {
    matches!(
        data_type,
        DataType::Int8
            | DataType::Int16
            | DataType::Int32
            | DataType::Int64
            | DataType::UInt8
            | DataType::UInt16
            | DataType::UInt32
            | DataType::UInt64
    )
}

const fn is_float(data_type: &DataType) -> bool {
    matches!(
        data_type,
        DataType::Float16 | DataType::Float32 | DataType::Float64
    )
}

fn is_string(data_type: &DataType) -> bool {
    match data_type {
        DataType::Utf8 | DataType::LargeUtf8 | DataType::Utf8View => true,
        DataType::Dictionary(_, value) => is_string(value),
        _ => false,
    }
}

fn as_float64(array: &ArrayRef, column_name: &str) -> Result<Float64Array> {
    let converted = cast(array, &DataType::Float64)?;
    converted
        .as_any()
        .downcast_ref::<Float64Array>()
        .cloned()
        .ok_or_else(|| {
            PanelMatchError::data(format!("Column '{column_name}' could not be read as Float64"))
        })
}

fn as_int64(array: &ArrayRef, column_name: &str) -> Result<Int64Array> {
    let converted = cast(array, &DataType::Int64)?;
    converted
        .as_any()
        .downcast_ref::<Int64Array>()
        .cloned()
        .ok_or_else(|| {
            PanelMatchError::data(format!("Column '{column_name}' could not be read as Int64"))
        })
}

fn string_values(array: &ArrayRef, column_name: &str) -> Result<Vec<Option<String>>> {
    let array = match array.data_type() {
        DataType::Utf8 | DataType::LargeUtf8 => array.clone(),
        _ => cast(array, &DataType::Utf8)?,
    };

    if let Some(strings) = array.as_any().downcast_ref::<StringArray>() {
        return Ok(strings.iter().map(|v| v.map(str::to_string)).collect());
    }
    if let Some(strings) = array.as_any().downcast_ref::<LargeStringArray>() {
        return Ok(strings.iter().map(|v| v.map(str::to_string)).collect());
    }

    Err(PanelMatchError::data(format!(
        "Column '{column_name}' is not a string array"
    )))
}

fn integral(value: f64) -> Option<i64> {
    (value.is_finite() && value.fract() == 0.0 && value.abs() < 9.0e15).then_some(value as i64)
}

/// Extract unit identifiers
///
/// Integer columns of any width, floating columns holding integral values and
/// string columns are accepted. Any other type fails with
/// [`PanelMatchError::InvalidIdentifierType`]; null ids fail validation.
pub fn extract_unit_keys(array: &ArrayRef, column_name: &str) -> Result<Vec<UnitKey>> {
    let data_type = array.data_type();

    if is_integer(data_type) {
        let ints = as_int64(array, column_name)?;
        return (0..ints.len())
            .map(|i| {
                if ints.is_null(i) {
                    Err(null_id(column_name, i))
                } else {
                    Ok(UnitKey::Int(ints.value(i)))
                }
            })
            .collect();
    }

    if is_float(data_type) {
        let floats = as_float64(array, column_name)?;
        return (0..floats.len())
            .map(|i| {
                if floats.is_null(i) || floats.value(i).is_nan() {
                    return Err(null_id(column_name, i));
                }
                integral(floats.value(i)).map(UnitKey::Int).ok_or_else(|| {
                    PanelMatchError::InvalidIdentifierType(format!(
                        "Column '{column_name}' holds non-integral numeric id {} at row {i}",
                        floats.value(i)
                    ))
                })
            })
            .collect();
    }

    if is_string(data_type) {
        return string_values(array, column_name)?
            .into_iter()
            .enumerate()
            .map(|(i, v)| v.map(UnitKey::Str).ok_or_else(|| null_id(column_name, i)))
            .collect();
    }

    Err(PanelMatchError::InvalidIdentifierType(format!(
        "Column '{column_name}' has type {data_type}; expected integer, integral numeric or string"
    )))
}

fn null_id(column_name: &str, row: usize) -> PanelMatchError {
    PanelMatchError::data(format!("Column '{column_name}' has a missing id at row {row}"))
}

/// Extract time periods as integers
pub fn extract_periods(array: &ArrayRef, column_name: &str) -> Result<Vec<i64>> {
    let data_type = array.data_type();

    if is_integer(data_type) {
        let ints = as_int64(array, column_name)?;
        return (0..ints.len())
            .map(|i| {
                if ints.is_null(i) {
                    Err(null_id(column_name, i))
                } else {
                    Ok(ints.value(i))
                }
            })
            .collect();
    }

    if is_float(data_type) {
        let floats = as_float64(array, column_name)?;
        return (0..floats.len())
            .map(|i| {
                if floats.is_null(i) || floats.value(i).is_nan() {
                    return Err(null_id(column_name, i));
                }
                integral(floats.value(i)).ok_or_else(|| {
                    PanelMatchError::data(format!(
                        "Column '{column_name}' holds non-integral time {} at row {i}",
                        floats.value(i)
                    ))
                })
            })
            .collect();
    }

    Err(PanelMatchError::data(format!(
        "Time column '{column_name}' has type {data_type}; expected consecutive integers"
    )))
}

/// Extract a binary treatment indicator; nulls are kept as missing
pub fn extract_treatment(array: &ArrayRef, column_name: &str) -> Result<Vec<Option<u8>>> {
    let data_type = array.data_type();
    if !(is_integer(data_type) || is_float(data_type) || *data_type == DataType::Boolean) {
        return Err(PanelMatchError::data(format!(
            "Treatment column '{column_name}' has type {data_type}; expected a 0/1 indicator"
        )));
    }

    let floats = as_float64(array, column_name)?;
    floats
        .iter()
        .enumerate()
        .map(|(i, value)| match value {
            None => Ok(None),
            Some(v) if v.is_nan() => Ok(None),
            Some(v) if v == 0.0 => Ok(Some(0)),
            Some(v) if v == 1.0 => Ok(Some(1)),
            Some(v) => Err(PanelMatchError::data(format!(
                "Treatment column '{column_name}' holds non-binary value {v} at row {i}"
            ))),
        })
        .collect()
}

/// Extract a covariate or exact-match column
///
/// Numeric and boolean columns are read as `f64`. String columns are encoded
/// as category codes in order of first appearance.
pub fn extract_column(array: &ArrayRef, column_name: &str) -> Result<ExtractedColumn> {
    let data_type = array.data_type();

    if is_integer(data_type) || is_float(data_type) || *data_type == DataType::Boolean {
        let floats = as_float64(array, column_name)?;
        let values = floats
            .iter()
            .map(|v| v.filter(|x| !x.is_nan()))
            .collect();
        return Ok(ExtractedColumn {
            values,
            categorical: false,
        });
    }

    if is_string(data_type) {
        let mut codes: FxHashMap<String, usize> = FxHashMap::default();
        let values = string_values(array, column_name)?
            .into_iter()
            .map(|v| {
                v.map(|s| {
                    let next = codes.len();
                    *codes.entry(s).or_insert(next) as f64
                })
            })
            .collect();
        return Ok(ExtractedColumn {
            values,
            categorical: true,
        });
    }

    Err(PanelMatchError::data(format!(
        "Column '{column_name}' has unsupported type {data_type}"
    )))
}
