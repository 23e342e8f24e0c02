//! Time-indexed dataset model.
//!
//! A `Dataset` holds one time coordinate and any number of numeric
//! variables sampled along it. Missing samples are `f64::NAN`; on the wire
//! they travel as `null`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::DatasetError;
use crate::request::{TIME_VARIABLE, TimeWindow};
use crate::time::EpochMillis;

/// Free-form metadata attached to datasets and variables.
pub type Attrs = BTreeMap<String, serde_json::Value>;

const BYTES_PER_SAMPLE: u64 = 8;

/// One variable sampled along the dataset's time coordinate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variable {
    #[serde(with = "nan_as_null")]
    pub values: Vec<f64>,
    #[serde(default)]
    pub attrs: Attrs,
}

impl Variable {
    pub fn new(values: Vec<f64>) -> Self {
        Self {
            values,
            attrs: Attrs::new(),
        }
    }
}

/// A time-indexed, variable-projected dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    pub name: String,
    pub time: Vec<EpochMillis>,
    #[serde(default)]
    pub variables: BTreeMap<String, Variable>,
    #[serde(default)]
    pub attrs: Attrs,
    /// Partition lengths along the time axis. Empty means one partition.
    #[serde(default)]
    pub chunks: Vec<usize>,
}

impl Dataset {
    pub fn new(name: impl Into<String>, time: Vec<EpochMillis>) -> Self {
        Self {
            name: name.into(),
            time,
            variables: BTreeMap::new(),
            attrs: Attrs::new(),
            chunks: Vec::new(),
        }
    }

    /// Add a variable; its length must match the time coordinate.
    pub fn with_variable(
        mut self,
        name: impl Into<String>,
        values: Vec<f64>,
    ) -> Result<Self, DatasetError> {
        self.insert_variable(name, Variable::new(values))?;
        Ok(self)
    }

    pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.attrs.insert(key.into(), value.into());
        self
    }

    pub fn insert_variable(
        &mut self,
        name: impl Into<String>,
        variable: Variable,
    ) -> Result<(), DatasetError> {
        let name = name.into();
        if name == TIME_VARIABLE {
            return Err(DatasetError::ReservedName(name));
        }
        if variable.values.len() != self.time.len() {
            return Err(DatasetError::LengthMismatch {
                dataset: self.name.clone(),
                variable: name,
                expected: self.time.len(),
                actual: variable.values.len(),
            });
        }
        self.variables.insert(name, variable);
        Ok(())
    }

    /// Check every variable against the time coordinate.
    pub fn validate(&self) -> Result<(), DatasetError> {
        for (name, var) in &self.variables {
            if var.values.len() != self.time.len() {
                return Err(DatasetError::LengthMismatch {
                    dataset: self.name.clone(),
                    variable: name.clone(),
                    expected: self.time.len(),
                    actual: var.values.len(),
                });
            }
        }
        Ok(())
    }

    /// Number of time samples.
    pub fn len(&self) -> usize {
        self.time.len()
    }

    pub fn is_empty(&self) -> bool {
        self.time.is_empty()
    }

    pub fn variable(&self, name: &str) -> Option<&Variable> {
        self.variables.get(name)
    }

    /// Estimated in-memory size of the time coordinate plus all variables.
    pub fn nbytes(&self) -> u64 {
        let samples: usize = self.variables.values().map(|v| v.values.len()).sum();
        (self.time.len() + samples) as u64 * BYTES_PER_SAMPLE
    }

    /// Whether the time coordinate is strictly increasing.
    pub fn is_time_sorted(&self) -> bool {
        self.time.windows(2).all(|w| w[0] < w[1])
    }

    /// Sort by time and drop repeated timestamps (first occurrence wins).
    pub fn normalized(mut self) -> Self {
        if self.is_time_sorted() {
            return self;
        }
        let mut order: Vec<usize> = (0..self.time.len()).collect();
        order.sort_by_key(|&i| self.time[i]);
        order.dedup_by_key(|i| self.time[*i]);

        self.time = order.iter().map(|&i| self.time[i]).collect();
        for var in self.variables.values_mut() {
            var.values = order.iter().map(|&i| var.values[i]).collect();
        }
        self.chunks.clear();
        self
    }

    /// Keep only the projected variables. Unknown names are ignored.
    pub fn project(&self, projection: &[String]) -> Self {
        let variables = self
            .variables
            .iter()
            .filter(|(name, _)| projection.iter().any(|p| p == *name))
            .map(|(name, var)| (name.clone(), var.clone()))
            .collect();
        Self {
            name: self.name.clone(),
            time: self.time.clone(),
            variables,
            attrs: self.attrs.clone(),
            chunks: self.chunks.clone(),
        }
    }

    /// Samples whose timestamp falls inside the (inclusive) window.
    pub fn slice(&self, window: &TimeWindow) -> Self {
        let keep: Vec<usize> = (0..self.time.len())
            .filter(|&i| window.contains(self.time[i]))
            .collect();
        let variables = self
            .variables
            .iter()
            .map(|(name, var)| {
                let values = keep.iter().map(|&i| var.values[i]).collect();
                (
                    name.clone(),
                    Variable {
                        values,
                        attrs: var.attrs.clone(),
                    },
                )
            })
            .collect();
        Self {
            name: self.name.clone(),
            time: keep.iter().map(|&i| self.time[i]).collect(),
            variables,
            attrs: self.attrs.clone(),
            chunks: Vec::new(),
        }
    }

    /// Partition lengths, defaulting to a single partition.
    pub fn chunk_layout(&self) -> Vec<usize> {
        if self.chunks.is_empty() && !self.time.is_empty() {
            vec![self.time.len()]
        } else {
            self.chunks.clone()
        }
    }
}

/// `NaN` ⇄ `null` for numeric columns.
mod nan_as_null {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(values: &[f64], serializer: S) -> Result<S::Ok, S::Error> {
        let wire: Vec<Option<f64>> = values
            .iter()
            .map(|v| if v.is_nan() { None } else { Some(*v) })
            .collect();
        wire.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<f64>, D::Error> {
        let wire = Vec::<Option<f64>>::deserialize(deserializer)?;
        Ok(wire.into_iter().map(|v| v.unwrap_or(f64::NAN)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Dataset {
        Dataset::new("ctd", vec![3_000, 1_000, 2_000, 1_000])
            .with_variable("temperature", vec![3.0, 1.0, 2.0, 9.0])
            .unwrap()
            .with_variable("salinity", vec![33.0, 31.0, 32.0, 99.0])
            .unwrap()
    }

    #[test]
    fn length_mismatch_rejected() {
        let err = Dataset::new("ctd", vec![0, 1])
            .with_variable("t", vec![1.0])
            .unwrap_err();
        assert!(matches!(err, DatasetError::LengthMismatch { expected: 2, actual: 1, .. }));
    }

    #[test]
    fn time_name_is_reserved() {
        let err = Dataset::new("ctd", vec![0]).with_variable("time", vec![1.0]).unwrap_err();
        assert_eq!(err, DatasetError::ReservedName("time".to_string()));
    }

    #[test]
    fn normalized_sorts_and_drops_duplicate_timestamps() {
        let ds = sample().normalized();
        assert_eq!(ds.time, vec![1_000, 2_000, 3_000]);
        assert_eq!(ds.variable("temperature").unwrap().values, vec![1.0, 2.0, 3.0]);
        assert_eq!(ds.variable("salinity").unwrap().values, vec![31.0, 32.0, 33.0]);
        assert!(ds.is_time_sorted());
    }

    #[test]
    fn project_keeps_requested_variables() {
        let ds = sample().project(&["temperature".to_string(), "time".to_string()]);
        assert_eq!(ds.variables.len(), 1);
        assert!(ds.variable("temperature").is_some());
    }

    #[test]
    fn slice_is_inclusive() {
        let ds = sample().normalized();
        let window = TimeWindow::new(2_000, 3_000).unwrap();
        let sliced = ds.slice(&window);
        assert_eq!(sliced.time, vec![2_000, 3_000]);
        assert_eq!(sliced.variable("temperature").unwrap().values, vec![2.0, 3.0]);
    }

    #[test]
    fn nbytes_counts_time_and_variables() {
        let ds = sample();
        assert_eq!(ds.nbytes(), (4 + 8) * 8);
    }

    #[test]
    fn nan_round_trips_through_json_as_null() {
        let ds = Dataset::new("d", vec![0, 1])
            .with_variable("v", vec![f64::NAN, 2.5])
            .unwrap();
        let json = serde_json::to_string(&ds).unwrap();
        assert!(json.contains("[null,2.5]"));
        let back: Dataset = serde_json::from_str(&json).unwrap();
        let values = &back.variable("v").unwrap().values;
        assert!(values[0].is_nan());
        assert_eq!(values[1], 2.5);
    }

    #[test]
    fn chunk_layout_defaults_to_single_partition() {
        assert_eq!(sample().chunk_layout(), vec![4]);
        assert!(Dataset::new("e", vec![]).chunk_layout().is_empty());
    }
}
