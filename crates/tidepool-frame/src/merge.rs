//! Temporal alignment and merge.
//!
//! Every dataset is resampled onto one grid covering the request window at
//! one-second steps from the window start, then the resampled datasets are merged into a single
//! dataset that shares the grid as its time coordinate.
//!
//! Resampling takes, for each grid point inside a dataset's native span,
//! the nearest native sample (ties go to the earlier one). Grid points
//! that are still empty afterwards, whether outside the native span or
//! because the native sample was `NaN`, take the nearest filled grid value
//! (again preferring the earlier one on ties). A variable with no finite
//! sample at all stays entirely `NaN`. Datasets whose samples all sit
//! between two grid points take their nearest sample everywhere.

use std::collections::BTreeMap;

use tidepool_core::time::MILLIS_PER_SECOND;
use tidepool_core::{Attrs, Dataset, EpochMillis, TimeWindow, Variable};
use tracing::debug;

use crate::error::{FrameError, FrameResult};

/// Number of one-second steps after the window start that stay inside the
/// window, provided the grid holds at most `max_points` points.
pub fn grid_steps(window: &TimeWindow, max_points: u64) -> FrameResult<i64> {
    let steps = window
        .end
        .checked_sub(window.start)
        .map(|span| span / MILLIS_PER_SECOND);
    match steps {
        Some(steps) if u64::try_from(steps).is_ok_and(|s| s < max_points) => Ok(steps),
        _ => Err(FrameError::GridTooLarge { limit: max_points }),
    }
}

/// One-second grid starting at the window start; every point lies inside
/// the window.
pub fn time_grid(window: &TimeWindow, max_points: u64) -> FrameResult<Vec<EpochMillis>> {
    let steps = grid_steps(window, max_points)?;
    Ok((0..=steps).map(|k| window.start + k * MILLIS_PER_SECOND).collect())
}

/// Resample one dataset onto `grid`.
pub fn resample(dataset: &Dataset, grid: &[EpochMillis]) -> Dataset {
    let dataset = if dataset.is_time_sorted() {
        dataset.clone()
    } else {
        dataset.clone().normalized()
    };
    let index = nearest_native(&dataset.time, grid);

    let variables = dataset
        .variables
        .iter()
        .map(|(name, var)| {
            let mut values: Vec<f64> = index
                .iter()
                .map(|i| i.map_or(f64::NAN, |i| var.values[i]))
                .collect();
            gap_fill(&mut values);
            (
                name.clone(),
                Variable {
                    values,
                    attrs: var.attrs.clone(),
                },
            )
        })
        .collect();

    Dataset {
        name: dataset.name,
        time: grid.to_vec(),
        variables,
        attrs: dataset.attrs,
        chunks: Vec::new(),
    }
}

/// For each grid point inside `[native[0], native[last]]`, the index of the
/// nearest native sample. When no grid point falls inside that span, every
/// grid point maps to its nearest sample. `native` must be strictly
/// increasing.
fn nearest_native(native: &[EpochMillis], grid: &[EpochMillis]) -> Vec<Option<usize>> {
    let (Some(&first), Some(&last)) = (native.first(), native.last()) else {
        return vec![None; grid.len()];
    };
    let within = |t: EpochMillis| first <= t && t <= last;
    let clamp = !grid.iter().any(|&t| within(t));
    grid.iter()
        .map(|&t| (clamp || within(t)).then(|| nearest_index(native, t)))
        .collect()
}

fn nearest_index(native: &[EpochMillis], t: EpochMillis) -> usize {
    let after = native.partition_point(|&n| n < t);
    if after == native.len() {
        return after - 1;
    }
    if after == 0 || native[after] == t {
        return after;
    }
    let before = after - 1;
    if t - native[before] <= native[after] - t {
        before
    } else {
        after
    }
}

/// Fill `NaN`s from the nearest finite neighbour, extrapolating at both ends.
fn gap_fill(values: &mut [f64]) {
    let n = values.len();
    let mut previous = vec![None; n];
    let mut last = None;
    for i in 0..n {
        if !values[i].is_nan() {
            last = Some(i);
        }
        previous[i] = last;
    }
    let mut next = None;
    for i in (0..n).rev() {
        if !values[i].is_nan() {
            next = Some(i);
            continue;
        }
        let source = match (previous[i], next) {
            (Some(p), Some(q)) => Some(if i - p <= q - i { p } else { q }),
            (p, q) => p.or(q),
        };
        if let Some(s) = source {
            values[i] = values[s];
        }
    }
}

/// Merge already-aligned datasets given in canonical order.
///
/// The first dataset to provide a variable wins. Attributes follow the
/// "no conflicts" rule: a key is kept when every dataset that sets it
/// agrees, and dropped otherwise.
pub fn combine(aligned: Vec<Dataset>, chunk_len: usize) -> FrameResult<Dataset> {
    let mut aligned = aligned.into_iter();
    let Some(first) = aligned.next() else {
        return Err(FrameError::EmptyInput);
    };

    let mut merged = first;
    let mut attrs = AttrMerge::new(&merged.attrs);
    let mut var_attrs: BTreeMap<String, AttrMerge> = merged
        .variables
        .iter()
        .map(|(name, var)| (name.clone(), AttrMerge::new(&var.attrs)))
        .collect();
    let mut names = vec![merged.name.clone()];

    for dataset in aligned {
        attrs.absorb(&dataset.attrs);
        names.push(dataset.name.clone());
        for (name, var) in dataset.variables {
            match var_attrs.get_mut(&name) {
                Some(existing) => existing.absorb(&var.attrs),
                None => {
                    var_attrs.insert(name.clone(), AttrMerge::new(&var.attrs));
                    merged.insert_variable(name, var)?;
                }
            }
        }
    }

    merged.attrs = attrs.finish();
    for (name, merge) in var_attrs {
        if let Some(var) = merged.variables.get_mut(&name) {
            var.attrs = merge.finish();
        }
    }
    merged.name = names.join(",");
    merged.chunks = unify_chunks(merged.len(), chunk_len);
    Ok(merged)
}

/// Resample every dataset onto the window's grid and merge them.
///
/// `datasets` is keyed by dataset id; iteration order is the canonical
/// order. A single dataset passes through unchanged apart from its chunk
/// layout. Several datasets fail with [`FrameError::GridTooLarge`] when
/// the grid would exceed `max_grid_points`.
pub fn merge(
    datasets: BTreeMap<String, Dataset>,
    window: &TimeWindow,
    chunk_len: usize,
    max_grid_points: u64,
) -> FrameResult<Dataset> {
    match datasets.len() {
        0 => Err(FrameError::EmptyInput),
        1 => {
            let Some((_, dataset)) = datasets.into_iter().next() else {
                return Err(FrameError::EmptyInput);
            };
            let mut dataset = dataset.normalized();
            dataset.chunks = unify_chunks(dataset.len(), chunk_len);
            Ok(dataset)
        }
        count => {
            let grid = time_grid(window, max_grid_points)?;
            debug!(datasets = count, grid_len = grid.len(), "resampling onto common grid");
            let aligned = datasets.values().map(|ds| resample(ds, &grid)).collect();
            combine(aligned, chunk_len)
        }
    }
}

/// Balanced partition lengths: as few chunks of at most `chunk_len` as
/// possible, sizes differing by at most one.
pub fn unify_chunks(len: usize, chunk_len: usize) -> Vec<usize> {
    if len == 0 {
        return Vec::new();
    }
    let chunk_len = chunk_len.max(1);
    let count = len.div_ceil(chunk_len);
    let base = len / count;
    let extra = len % count;
    (0..count).map(|i| base + usize::from(i < extra)).collect()
}

/// Running "no conflicts" merge of one attribute map.
struct AttrMerge {
    kept: Attrs,
    conflicted: Vec<String>,
}

impl AttrMerge {
    fn new(attrs: &Attrs) -> Self {
        Self {
            kept: attrs.clone(),
            conflicted: Vec::new(),
        }
    }

    fn absorb(&mut self, attrs: &Attrs) {
        for (key, value) in attrs {
            if self.conflicted.contains(key) {
                continue;
            }
            match self.kept.get(key) {
                Some(existing) if existing != value => {
                    self.kept.remove(key);
                    self.conflicted.push(key.clone());
                }
                Some(_) => {}
                None => {
                    self.kept.insert(key.clone(), value.clone());
                }
            }
        }
    }

    fn finish(self) -> Attrs {
        self.kept
    }
}
