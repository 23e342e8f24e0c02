//! Fetch requests, axis mappings and request fingerprints.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{RequestError, RequestResult};
use crate::time::{self, EpochMillis};

/// Name of the shared time coordinate. Always part of a projection.
pub const TIME_VARIABLE: &str = "time";

/// Which variable goes on which plot axis. Empty strings mean "unused".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AxisMapping {
    pub x: String,
    pub y: String,
    #[serde(default)]
    pub z: String,
    #[serde(default)]
    pub color: String,
}

impl AxisMapping {
    pub fn new(x: impl Into<String>, y: impl Into<String>) -> Self {
        Self {
            x: x.into(),
            y: y.into(),
            ..Default::default()
        }
    }

    pub fn with_z(mut self, z: impl Into<String>) -> Self {
        self.z = z.into();
        self
    }

    pub fn with_color(mut self, color: impl Into<String>) -> Self {
        self.color = color.into();
        self
    }

    /// The variable rendered as the third (color) dimension, if any.
    /// `color` takes precedence over `z`.
    pub fn third_axis(&self) -> Option<&str> {
        [&self.color, &self.z]
            .into_iter()
            .find(|v| !v.is_empty())
            .map(String::as_str)
    }

    /// Required axes (`x`, `y`) that were left empty.
    pub fn missing_axes(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.x.is_empty() {
            missing.push("x");
        }
        if self.y.is_empty() {
            missing.push("y");
        }
        missing
    }

    /// The minimal variable projection: every non-empty axis plus `time`,
    /// sorted and without duplicates.
    pub fn projection(&self) -> Vec<String> {
        let mut vars: BTreeSet<&str> = [&self.x, &self.y, &self.z, &self.color]
            .into_iter()
            .filter(|v| !v.is_empty())
            .map(String::as_str)
            .collect();
        vars.insert(TIME_VARIABLE);
        vars.into_iter().map(str::to_string).collect()
    }
}

/// Inclusive `[start, end]` request window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: EpochMillis,
    pub end: EpochMillis,
}

impl TimeWindow {
    pub fn new(start: EpochMillis, end: EpochMillis) -> RequestResult<Self> {
        if start > end {
            return Err(RequestError::InvalidWindow {
                start: time::format_timestamp(start),
                end: time::format_timestamp(end),
            });
        }
        Ok(Self { start, end })
    }

    /// Parse both bounds from request strings.
    pub fn parse(start: &str, end: &str) -> RequestResult<Self> {
        Self::new(time::parse_timestamp(start)?, time::parse_timestamp(end)?)
    }

    pub fn contains(&self, t: EpochMillis) -> bool {
        self.start <= t && t <= self.end
    }
}

/// A validated request for one merged, rendered result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchRequest {
    /// Dataset ids in request order, without duplicates.
    pub dataset_refs: Vec<String>,
    pub axis: AxisMapping,
    pub window: TimeWindow,
}

/// Canonical, order-independent form hashed into a fingerprint.
#[derive(Serialize)]
struct CanonicalRequest<'a> {
    datasets: Vec<&'a str>,
    x: &'a str,
    y: &'a str,
    z: &'a str,
    color: &'a str,
    start: EpochMillis,
    end: EpochMillis,
}

impl FetchRequest {
    pub fn new<I, S>(dataset_refs: I, axis: AxisMapping, window: TimeWindow) -> RequestResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut seen = BTreeSet::new();
        let mut refs = Vec::new();
        for id in dataset_refs {
            let id = id.as_ref().trim();
            if !id.is_empty() && seen.insert(id.to_string()) {
                refs.push(id.to_string());
            }
        }
        if refs.is_empty() {
            return Err(RequestError::NoDatasets);
        }
        Ok(Self {
            dataset_refs: refs,
            axis,
            window,
        })
    }

    /// Dataset ids in canonical (sorted) order.
    pub fn canonical_datasets(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.dataset_refs.iter().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    /// Hex SHA-256 digest of the canonical request.
    pub fn fingerprint(&self) -> String {
        let canonical = CanonicalRequest {
            datasets: self.canonical_datasets(),
            x: &self.axis.x,
            y: &self.axis.y,
            z: &self.axis.z,
            color: &self.axis.color,
            start: self.window.start,
            end: self.window.end,
        };
        // Serializing a struct of strings and integers cannot fail.
        let bytes = serde_json::to_vec(&canonical).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(b"tidepool/fetch/v1\n");
        hasher.update(&bytes);
        hex::encode(hasher.finalize())
    }
}

/// Submission body as sent by clients.
///
/// `ref` is a comma-separated list of dataset ids.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataRequest {
    #[serde(rename = "ref")]
    pub dataset_ref: String,
    pub x: String,
    pub y: String,
    #[serde(default)]
    pub z: String,
    #[serde(default)]
    pub color: String,
    pub start_dt: String,
    pub end_dt: String,
}

impl DataRequest {
    pub fn to_fetch_request(&self) -> RequestResult<FetchRequest> {
        let axis = AxisMapping {
            x: self.x.trim().to_string(),
            y: self.y.trim().to_string(),
            z: self.z.trim().to_string(),
            color: self.color.trim().to_string(),
        };
        let window = TimeWindow::parse(&self.start_dt, &self.end_dt)?;
        FetchRequest::new(self.dataset_ref.split(','), axis, window)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn window() -> TimeWindow {
        TimeWindow::parse("2019-01-01", "2019-01-02").unwrap()
    }

    fn request(ids: &[&str]) -> FetchRequest {
        FetchRequest::new(ids.iter().copied(), AxisMapping::new("time", "temperature"), window())
            .unwrap()
    }

    #[test]
    fn projection_always_includes_time() {
        let axis = AxisMapping::new("salinity", "temperature");
        assert_eq!(axis.projection(), vec!["salinity", "temperature", "time"]);
    }

    #[test]
    fn projection_skips_empty_and_duplicate_axes() {
        let axis = AxisMapping::new("time", "pressure").with_color("pressure");
        assert_eq!(axis.projection(), vec!["pressure", "time"]);
    }

    #[test]
    fn third_axis_prefers_color_over_z() {
        let axis = AxisMapping::new("time", "t").with_z("depth").with_color("o2");
        assert_eq!(axis.third_axis(), Some("o2"));
        let axis = AxisMapping::new("time", "t").with_z("depth");
        assert_eq!(axis.third_axis(), Some("depth"));
        assert_eq!(AxisMapping::new("time", "t").third_axis(), None);
    }

    #[test]
    fn missing_axes_reported() {
        assert_eq!(AxisMapping::new("", "").missing_axes(), vec!["x", "y"]);
        assert!(AxisMapping::new("time", "t").missing_axes().is_empty());
    }

    #[test]
    fn window_rejects_inverted_bounds() {
        let err = TimeWindow::parse("2019-01-02", "2019-01-01").unwrap_err();
        assert!(matches!(err, RequestError::InvalidWindow { .. }));
    }

    #[test]
    fn duplicate_and_blank_ids_are_dropped() {
        let req = request(&["a", " b ", "", "a"]);
        assert_eq!(req.dataset_refs, vec!["a", "b"]);
    }

    #[test]
    fn empty_dataset_list_rejected() {
        let err = FetchRequest::new(["", " "], AxisMapping::new("time", "t"), window()).unwrap_err();
        assert_eq!(err, RequestError::NoDatasets);
    }

    #[test]
    fn fingerprint_differs_on_axis_change() {
        let a = request(&["a", "b"]);
        let mut b = a.clone();
        b.axis.y = "salinity".to_string();
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn fingerprint_ignores_time_spelling() {
        let a = DataRequest {
            dataset_ref: "a,b".to_string(),
            x: "time".to_string(),
            y: "t".to_string(),
            z: String::new(),
            color: String::new(),
            start_dt: "2019-01-01".to_string(),
            end_dt: "2019-01-02T00:00:00Z".to_string(),
        };
        let mut b = a.clone();
        b.start_dt = "2019-01-01T00:00:00".to_string();
        b.dataset_ref = "b, a".to_string();
        assert_eq!(
            a.to_fetch_request().unwrap().fingerprint(),
            b.to_fetch_request().unwrap().fingerprint()
        );
    }

    #[test]
    fn data_request_deserializes_ref_field() {
        let body = r#"{"ref":"CE02SHSM,CE04OSPS","x":"time","y":"sea_water_temperature",
            "color":"","start_dt":"2019-01-01","end_dt":"2019-01-02"}"#;
        let req: DataRequest = serde_json::from_str(body).unwrap();
        let fetch = req.to_fetch_request().unwrap();
        assert_eq!(fetch.dataset_refs, vec!["CE02SHSM", "CE04OSPS"]);
        assert_eq!(fetch.axis.z, "");
    }

    proptest! {
        #[test]
        fn fingerprint_is_order_independent(
            ids in prop::collection::btree_set("[a-z][a-z0-9_-]{0,12}", 1..6),
            seed in any::<u64>(),
        ) {
            let ordered: Vec<String> = ids.into_iter().collect();
            let mut shuffled = ordered.clone();
            // Deterministic rotation + reversal driven by the seed.
            let len = shuffled.len();
            shuffled.rotate_left((seed as usize) % len);
            if seed % 2 == 0 {
                shuffled.reverse();
            }
            let a = FetchRequest::new(&ordered, AxisMapping::new("time", "t"), window()).unwrap();
            let b = FetchRequest::new(&shuffled, AxisMapping::new("time", "t"), window()).unwrap();
            prop_assert_eq!(a.fingerprint(), b.fingerprint());
        }
    }
}
