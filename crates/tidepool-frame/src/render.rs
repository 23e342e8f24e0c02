//! Rendering strategy selection and column extraction.
//!
//! Small results are returned point-wise. Results above the shading
//! threshold are reduced to a `width × height` grid of bins holding the
//! mean of `y`, which bounds the payload regardless of the input volume.
//! A third axis (color, else z) always renders point-wise.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tidepool_core::{AxisMapping, Dataset, RenderConfig, TIME_VARIABLE};
use tracing::debug;

use crate::cell::{Cell, sanitize};
use crate::error::{FrameError, FrameResult};

/// Rendering knobs, usually taken from `[render]` in the config.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderOptions {
    pub shade_threshold: usize,
    pub width: u32,
    pub height: u32,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self::from(&RenderConfig::default())
    }
}

impl From<&RenderConfig> for RenderOptions {
    fn from(config: &RenderConfig) -> Self {
        Self {
            shade_threshold: config.shade_threshold,
            width: config.plot_width,
            height: config.plot_height,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenderStrategy {
    /// Every sample as an `(x, y)` point.
    Scatter,
    /// Every sample as an `(x, y, third)` point.
    ColoredScatter { third: String },
    /// Mean of `y` over a `width × height` grid of `(x, y)` bins.
    Shaded { width: u32, height: u32 },
}

/// Pick how to render `samples` rows for `axis`.
pub fn select_strategy(axis: &AxisMapping, samples: usize, options: &RenderOptions) -> RenderStrategy {
    if let Some(third) = axis.third_axis() {
        RenderStrategy::ColoredScatter {
            third: third.to_string(),
        }
    } else if samples > options.shade_threshold {
        RenderStrategy::Shaded {
            width: options.width.max(1),
            height: options.height.max(1),
        }
    } else {
        RenderStrategy::Scatter
    }
}

/// Extracted columns for one result.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedFrame {
    pub strategy: RenderStrategy,
    /// Column name → values, restricted to the plotted columns.
    pub columns: BTreeMap<String, Vec<Option<Cell>>>,
    pub shaded: bool,
    /// Name of the synthetic color column, `"{x}_{y} {third or y}"`.
    pub color_column: Option<String>,
    /// Samples in the merged dataset.
    pub count: usize,
}

/// Result payload stored on a succeeded job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlotPayload {
    pub x: Vec<Option<Cell>>,
    pub y: Vec<Option<Cell>>,
    pub z: Vec<Option<Cell>>,
    pub count: usize,
    pub shaded: bool,
}

impl RenderedFrame {
    /// `z` carries the third axis, or the aggregate when shaded, or nothing.
    pub fn into_payload(self, axis: &AxisMapping) -> PlotPayload {
        let take = |name: &str| self.columns.get(name).cloned().unwrap_or_default();
        let z = match (axis.third_axis(), &self.color_column) {
            (Some(third), _) => take(third),
            (None, Some(color)) if self.shaded => take(color),
            _ => Vec::new(),
        };
        PlotPayload {
            x: take(&axis.x),
            y: take(&axis.y),
            z,
            count: self.count,
            shaded: self.shaded,
        }
    }
}

/// One column of the dataset, viewed through a row order.
#[derive(Clone, Copy)]
enum Series<'a> {
    Time(&'a [i64]),
    Values(&'a [f64]),
}

impl<'a> Series<'a> {
    fn lookup(dataset: &'a Dataset, name: &str) -> FrameResult<Self> {
        if name == TIME_VARIABLE {
            return Ok(Self::Time(&dataset.time));
        }
        dataset
            .variable(name)
            .map(|v| Self::Values(&v.values))
            .ok_or_else(|| FrameError::MissingVariable(name.to_string()))
    }

    fn is_time(&self) -> bool {
        matches!(self, Self::Time(_))
    }

    fn value(&self, row: usize) -> f64 {
        match self {
            Self::Time(t) => t[row] as f64,
            Self::Values(v) => v[row],
        }
    }

    fn cells(&self, rows: &[usize]) -> Vec<Option<Cell>> {
        match self {
            Self::Time(t) => rows.iter().map(|&r| Cell::time(t[r])).collect(),
            Self::Values(v) => {
                let ordered: Vec<f64> = rows.iter().map(|&r| v[r]).collect();
                sanitize(&ordered)
            }
        }
    }

    /// Render a computed value (a bin center or mean) in this column's type.
    fn coordinate(&self, value: f64) -> Option<Cell> {
        match self {
            _ if value.is_nan() => None,
            Self::Time(_) => Cell::time(value.round() as i64),
            Self::Values(_) => Cell::number(value),
        }
    }
}

/// Render the merged dataset for `axis`.
pub fn render(dataset: &Dataset, axis: &AxisMapping, options: &RenderOptions) -> FrameResult<RenderedFrame> {
    if axis.x.is_empty() {
        return Err(FrameError::EmptyAxis("x"));
    }
    if axis.y.is_empty() {
        return Err(FrameError::EmptyAxis("y"));
    }
    let x = Series::lookup(dataset, &axis.x)?;
    let y = Series::lookup(dataset, &axis.y)?;

    let count = dataset.len();
    let strategy = select_strategy(axis, count, options);
    let rows = primary_order(x, count);
    debug!(x = %axis.x, y = %axis.y, count, ?strategy, "rendering merged dataset");

    let mut columns = BTreeMap::new();
    let (shaded, color_column) = match &strategy {
        RenderStrategy::Scatter => {
            columns.insert(axis.x.clone(), x.cells(&rows));
            columns.insert(axis.y.clone(), y.cells(&rows));
            (false, None)
        }
        RenderStrategy::ColoredScatter { third } => {
            let z = Series::lookup(dataset, third)?;
            columns.insert(axis.x.clone(), x.cells(&rows));
            columns.insert(axis.y.clone(), y.cells(&rows));
            columns.insert(third.clone(), z.cells(&rows));
            (false, Some(format!("{}_{} {}", axis.x, axis.y, third)))
        }
        RenderStrategy::Shaded { width, height } => {
            let synthetic = format!("{}_{} {}", axis.x, axis.y, axis.y);
            let bins = BinnedMean::compute(x, y, &rows, *width as usize, *height as usize);
            columns.insert(axis.x.clone(), bins.x_centers.iter().map(|c| x.coordinate(*c)).collect());
            columns.insert(axis.y.clone(), bins.y_centers.iter().map(|c| y.coordinate(*c)).collect());
            columns.insert(synthetic.clone(), bins.means.iter().map(|m| y.coordinate(*m)).collect());
            (true, Some(synthetic))
        }
    };

    Ok(RenderedFrame {
        strategy,
        columns,
        shaded,
        color_column,
        count,
    })
}

/// Row order once `x` is the primary dimension.
///
/// Time is already the dataset's order. Any other `x` becomes the index:
/// rows are ordered by `x` (stable, `NaN` last).
fn primary_order(x: Series<'_>, count: usize) -> Vec<usize> {
    let mut rows: Vec<usize> = (0..count).collect();
    if !x.is_time() {
        rows.sort_by(|&a, &b| x.value(a).total_cmp(&x.value(b)));
        // total_cmp sorts negative NaN first; move every NaN to the end.
        let (finite, nan): (Vec<usize>, Vec<usize>) = rows.into_iter().partition(|&r| !x.value(r).is_nan());
        rows = finite.into_iter().chain(nan).collect();
    }
    rows
}

/// 2-D histogram of `(x, y)` holding the mean of `y` per bin.
///
/// Rows are emitted y-major: all x bins of the lowest y band first.
struct BinnedMean {
    x_centers: Vec<f64>,
    y_centers: Vec<f64>,
    means: Vec<f64>,
}

impl BinnedMean {
    fn compute(x: Series<'_>, y: Series<'_>, rows: &[usize], width: usize, height: usize) -> Self {
        let points: Vec<(f64, f64)> = rows
            .iter()
            .map(|&r| (x.value(r), y.value(r)))
            .filter(|(a, b)| a.is_finite() && b.is_finite())
            .collect();
        if points.is_empty() {
            return Self {
                x_centers: Vec::new(),
                y_centers: Vec::new(),
                means: Vec::new(),
            };
        }

        let x_axis = BinAxis::new(points.iter().map(|p| p.0), width);
        let y_axis = BinAxis::new(points.iter().map(|p| p.1), height);

        let mut sums = vec![0.0; width * height];
        let mut counts = vec![0usize; width * height];
        for (px, py) in &points {
            let cell = y_axis.bin(*py) * width + x_axis.bin(*px);
            sums[cell] += py;
            counts[cell] += 1;
        }

        let mut x_centers = Vec::with_capacity(width * height);
        let mut y_centers = Vec::with_capacity(width * height);
        let mut means = Vec::with_capacity(width * height);
        for iy in 0..height {
            for ix in 0..width {
                let cell = iy * width + ix;
                x_centers.push(x_axis.center(ix));
                y_centers.push(y_axis.center(iy));
                means.push(if counts[cell] == 0 {
                    f64::NAN
                } else {
                    sums[cell] / counts[cell] as f64
                });
            }
        }
        Self {
            x_centers,
            y_centers,
            means,
        }
    }
}

/// Equal-width bins over the finite range of one axis.
struct BinAxis {
    lo: f64,
    step: f64,
    bins: usize,
}

impl BinAxis {
    fn new(values: impl Iterator<Item = f64>, bins: usize) -> Self {
        let (lo, hi) = values.fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
            (lo.min(v), hi.max(v))
        });
        // A single distinct value still gets a range to spread bins over.
        let (lo, hi) = if hi > lo { (lo, hi) } else { (lo - 0.5, hi + 0.5) };
        Self {
            lo,
            step: (hi - lo) / bins as f64,
            bins,
        }
    }

    fn bin(&self, v: f64) -> usize {
        let i = ((v - self.lo) / self.step).floor();
        (i.max(0.0) as usize).min(self.bins - 1)
    }

    fn center(&self, i: usize) -> f64 {
        self.lo + (i as f64 + 0.5) * self.step
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T0: i64 = 1_546_300_800_000;

    fn dataset(n: usize) -> Dataset {
        let time = (0..n as i64).map(|i| T0 + i * 1000).collect();
        let temperature = (0..n).map(|i| 10.0 + (i % 7) as f64).collect();
        let salinity = (0..n).map(|i| 30.0 + (i % 3) as f64).collect();
        Dataset::new("ctd", time)
            .with_variable("temperature", temperature)
            .unwrap()
            .with_variable("salinity", salinity)
            .unwrap()
    }

    fn small_options() -> RenderOptions {
        RenderOptions {
            shade_threshold: 100,
            width: 4,
            height: 3,
        }
    }

    #[test]
    fn strategy_selection() {
        let opts = small_options();
        let plain = AxisMapping::new("time", "temperature");
        assert_eq!(select_strategy(&plain, 100, &opts), RenderStrategy::Scatter);
        assert_eq!(
            select_strategy(&plain, 101, &opts),
            RenderStrategy::Shaded { width: 4, height: 3 }
        );
        let colored = plain.clone().with_z("salinity");
        assert_eq!(
            select_strategy(&colored, 1_000_000, &opts),
            RenderStrategy::ColoredScatter {
                third: "salinity".to_string()
            }
        );
    }

    #[test]
    fn scatter_renders_time_as_strings() {
        let ds = dataset(3);
        let axis = AxisMapping::new("time", "temperature");
        let frame = render(&ds, &axis, &small_options()).unwrap();
        assert!(!frame.shaded);
        assert_eq!(frame.color_column, None);
        assert_eq!(frame.columns.len(), 2);
        assert_eq!(
            frame.columns["time"][1],
            Some(Cell::Text("2019-01-01 00:00:01".to_string()))
        );
        assert_eq!(frame.columns["temperature"][2], Some(Cell::Number(12.0)));

        let payload = frame.into_payload(&axis);
        assert_eq!(payload.count, 3);
        assert!(payload.z.is_empty());
    }

    #[test]
    fn nan_values_become_nulls() {
        let ds = Dataset::new("d", vec![T0, T0 + 1000])
            .with_variable("t", vec![f64::NAN, 1.0])
            .unwrap();
        let frame = render(&ds, &AxisMapping::new("time", "t"), &small_options()).unwrap();
        assert_eq!(frame.columns["t"], vec![None, Some(Cell::Number(1.0))]);
    }

    #[test]
    fn non_time_x_becomes_primary_dimension() {
        let ds = Dataset::new("d", vec![T0, T0 + 1000, T0 + 2000])
            .with_variable("pressure", vec![30.0, f64::NAN, 10.0])
            .unwrap()
            .with_variable("t", vec![3.0, 2.0, 1.0])
            .unwrap();
        let frame = render(&ds, &AxisMapping::new("pressure", "t"), &small_options()).unwrap();
        assert_eq!(
            frame.columns["pressure"],
            vec![Some(Cell::Number(10.0)), Some(Cell::Number(30.0)), None]
        );
        assert_eq!(
            frame.columns["t"],
            vec![Some(Cell::Number(1.0)), Some(Cell::Number(3.0)), Some(Cell::Number(2.0))]
        );
    }

    #[test]
    fn colored_scatter_keeps_third_column() {
        let ds = dataset(500);
        let axis = AxisMapping::new("time", "temperature").with_color("salinity");
        let frame = render(&ds, &axis, &small_options()).unwrap();
        assert!(!frame.shaded);
        assert_eq!(frame.columns.len(), 3);
        assert_eq!(frame.color_column.as_deref(), Some("time_temperature salinity"));

        let payload = frame.into_payload(&axis);
        assert_eq!(payload.z.len(), 500);
        assert_eq!(payload.z[1], Some(Cell::Number(31.0)));
    }

    #[test]
    fn shading_above_threshold_bins_mean_of_y() {
        let ds = dataset(1_000);
        let axis = AxisMapping::new("time", "temperature");
        let frame = render(&ds, &axis, &small_options()).unwrap();

        assert!(frame.shaded);
        assert_eq!(frame.count, 1_000);
        let synthetic = "time_temperature temperature";
        assert_eq!(frame.color_column.as_deref(), Some(synthetic));
        let keys: Vec<&str> = frame.columns.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["temperature", "time", synthetic]);
        for column in frame.columns.values() {
            assert_eq!(column.len(), 12);
        }

        // Every finite mean lies inside its y band's range.
        let means = &frame.columns[synthetic];
        assert!(means.iter().any(Option::is_some));
        for value in means.iter().flatten() {
            let Cell::Number(m) = value else { panic!("mean must be numeric") };
            assert!((10.0..=16.0).contains(m));
        }
        assert!(matches!(frame.columns["time"][0], Some(Cell::Text(_))));

        let payload = frame.into_payload(&axis);
        assert_eq!(payload.z.len(), 12);
        assert!(payload.shaded);
    }

    #[test]
    fn empty_bins_are_null() {
        // Two clusters leave the middle bins empty.
        let ds = Dataset::new("d", vec![T0, T0 + 1, T0 + 2, T0 + 3])
            .with_variable("a", vec![0.0, 0.0, 10.0, 10.0])
            .unwrap()
            .with_variable("b", vec![0.0, 0.0, 10.0, 10.0])
            .unwrap();
        let opts = RenderOptions {
            shade_threshold: 1,
            width: 3,
            height: 3,
        };
        let frame = render(&ds, &AxisMapping::new("a", "b"), &opts).unwrap();
        let means = &frame.columns["a_b b"];
        assert_eq!(means.len(), 9);
        assert_eq!(means[0], Some(Cell::Number(0.0)));
        assert_eq!(means[8], Some(Cell::Number(10.0)));
        assert_eq!(means.iter().filter(|m| m.is_none()).count(), 7);
    }

    #[test]
    fn shaded_time_means_render_as_timestamps() {
        let ds = dataset(1_000);
        let axis = AxisMapping::new("temperature", "time");
        let frame = render(&ds, &axis, &small_options()).unwrap();
        assert!(frame.shaded);

        let means = &frame.columns["temperature_time time"];
        assert_eq!(means.len(), 12);
        assert!(means.iter().any(Option::is_some));
        for value in means.iter().flatten() {
            assert!(matches!(value, Cell::Text(t) if t.starts_with("2019-01-01 00:")), "{value:?}");
        }
        for value in frame.columns["time"].iter().flatten() {
            assert!(matches!(value, Cell::Text(_)));
        }
    }

    #[test]
    fn missing_axis_variable_is_an_error() {
        let err = render(&dataset(3), &AxisMapping::new("time", "oxygen"), &small_options()).unwrap_err();
        assert_eq!(err, FrameError::MissingVariable("oxygen".to_string()));
        let err = render(&dataset(3), &AxisMapping::new("", "t"), &small_options()).unwrap_err();
        assert_eq!(err, FrameError::EmptyAxis("x"));
    }
}
