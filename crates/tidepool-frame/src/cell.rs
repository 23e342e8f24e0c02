//! Output cells.
//!
//! A rendered column is a `Vec<Option<Cell>>`: `None` serializes as JSON
//! `null` (and MessagePack nil). Numeric columns never carry `NaN` on the
//! wire.

use serde::{Deserialize, Serialize};
use tidepool_core::EpochMillis;
use tidepool_core::time::format_timestamp;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Cell {
    Number(f64),
    Text(String),
}

impl Cell {
    /// `NaN` becomes a null cell; every other value is kept as is.
    pub fn number(value: f64) -> Option<Cell> {
        (!value.is_nan()).then_some(Cell::Number(value))
    }

    pub fn time(millis: EpochMillis) -> Option<Cell> {
        Some(Cell::Text(format_timestamp(millis)))
    }
}

/// Numeric column with `NaN`s replaced by nulls.
pub fn sanitize(values: &[f64]) -> Vec<Option<Cell>> {
    values.iter().map(|v| Cell::number(*v)).collect()
}
