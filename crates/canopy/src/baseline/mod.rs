//! Per-pixel, per-month, per-index running statistics.
//!
//! Statistics are folded in with Welford's online update so the raw history
//! never has to be kept. The store is an explicit, versioned aggregate: every
//! update is applied copy-on-write, so a reader holding an earlier
//! [`BaselineSnapshot`] (or a [`BaselineQuery`] into it) never observes a
//! partially applied batch.

pub mod builder;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{Datelike, NaiveDate};
use ndarray::Array2;
use rayon::prelude::*;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{CanopyError, Result};
use crate::raster::{GridSpec, Raster};
use crate::types::{Month, PixelCoord, SpectralIndex};

pub use builder::{BaselineBuilder, HistoricalScene};

/// Online mean/variance accumulator for one pixel/month/index.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunningStats {
    count: u32,
    mean: f64,
    /// Sum of squared deviations from the running mean
    m2: f64,
    years: BTreeSet<i32>,
}

impl RunningStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one observation in.
    pub fn push(&mut self, year: i32, value: f64) {
        self.count += 1;
        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        let delta2 = value - self.mean;
        self.m2 += delta * delta2;
        self.years.insert(year);
    }

    /// Combine with statistics accumulated independently (Chan et al.).
    pub fn merge(&mut self, other: &RunningStats) {
        if other.count == 0 {
            return;
        }
        if self.count == 0 {
            *self = other.clone();
            return;
        }

        let na = self.count as f64;
        let nb = other.count as f64;
        let n = na + nb;
        let delta = other.mean - self.mean;

        self.mean += delta * nb / n;
        self.m2 += other.m2 + delta * delta * na * nb / n;
        self.count += other.count;
        self.years.extend(other.years.iter().copied());
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }

    /// Population variance (ddof = 0)
    pub fn variance(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            (self.m2 / self.count as f64).max(0.0)
        }
    }

    pub fn std_dev(&self) -> f64 {
        self.variance().sqrt()
    }

    pub fn years(&self) -> &BTreeSet<i32> {
        &self.years
    }

    /// Reason the accumulator could not have come from `push`/`merge`, if any.
    pub fn inconsistency(&self) -> Option<String> {
        if !self.mean.is_finite() {
            Some(format!("non-finite mean {}", self.mean))
        } else if !self.m2.is_finite() || self.m2 < 0.0 {
            Some(format!("invalid sum of squares {}", self.m2))
        } else if (self.count as usize) < self.years.len() {
            Some(format!("{} samples over {} years", self.count, self.years.len()))
        } else if self.count == 0 && (self.mean != 0.0 || self.m2 != 0.0) {
            Some("empty accumulator carries statistics".to_string())
        } else {
            None
        }
    }
}

/// Minimum history a record needs before it may be used for scoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct HistoryPolicy {
    /// Minimum valid samples per pixel/month/index
    pub min_samples: u32,
    /// Minimum distinct contributing years
    pub min_years: usize,
}

impl Default for HistoryPolicy {
    fn default() -> Self {
        Self {
            min_samples: 3,
            min_years: 3,
        }
    }
}

impl HistoryPolicy {
    pub fn is_usable(&self, stats: &RunningStats) -> bool {
        stats.count >= self.min_samples && stats.years.len() >= self.min_years
    }
}

/// Statistics for every pixel of one month/index layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaselineGrid {
    width: usize,
    height: usize,
    cells: Vec<RunningStats>,
}

impl BaselineGrid {
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            cells: vec![RunningStats::default(); width * height],
        }
    }

    pub fn from_cells(width: usize, height: usize, cells: Vec<RunningStats>) -> Result<Self> {
        if cells.len() != width * height {
            return Err(CanopyError::MalformedRaster(format!(
                "baseline layer has {} cells, expected {}",
                cells.len(),
                width * height
            )));
        }
        if let Some((offset, reason)) = cells
            .iter()
            .enumerate()
            .find_map(|(offset, cell)| cell.inconsistency().map(|reason| (offset, reason)))
        {
            return Err(CanopyError::CorruptBaseline { offset, reason });
        }
        Ok(Self { width, height, cells })
    }

    pub fn cells(&self) -> &[RunningStats] {
        &self.cells
    }

    pub fn stats(&self, pixel: PixelCoord) -> Option<&RunningStats> {
        if pixel.row < self.height && pixel.col < self.width {
            self.cells.get(pixel.row * self.width + pixel.col)
        } else {
            None
        }
    }
}

/// Identity of one baseline layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LayerKey {
    pub month: Month,
    pub index: SpectralIndex,
}

impl LayerKey {
    pub fn new(month: Month, index: SpectralIndex) -> Self {
        Self { month, index }
    }
}

/// A usable baseline for one pixel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaselineRecord {
    pub mean: f64,
    pub std: f64,
    pub sample_count: u32,
    pub years: Vec<i32>,
}

/// Outcome of looking a pixel up in a baseline layer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BaselineLookup {
    Ready { mean: f64, std: f64, sample_count: u32 },
    InsufficientHistory { sample_count: u32, year_count: usize },
}

/// Read-only view of one month/index layer.
#[derive(Debug, Clone)]
pub struct BaselineQuery {
    key: LayerKey,
    layer: Arc<BaselineGrid>,
    policy: HistoryPolicy,
}

impl BaselineQuery {
    pub fn key(&self) -> LayerKey {
        self.key
    }

    /// (height, width) of the layer
    pub fn shape(&self) -> (usize, usize) {
        (self.layer.height, self.layer.width)
    }

    pub fn get(&self, pixel: PixelCoord) -> BaselineLookup {
        match self.layer.stats(pixel) {
            Some(stats) => self.lookup(stats),
            None => BaselineLookup::InsufficientHistory {
                sample_count: 0,
                year_count: 0,
            },
        }
    }

    fn lookup(&self, stats: &RunningStats) -> BaselineLookup {
        if self.policy.is_usable(stats) {
            BaselineLookup::Ready {
                mean: stats.mean(),
                std: stats.std_dev(),
                sample_count: stats.count(),
            }
        } else {
            BaselineLookup::InsufficientHistory {
                sample_count: stats.count(),
                year_count: stats.years().len(),
            }
        }
    }

    /// The full layer as a grid of lookups.
    pub fn to_array(&self) -> Array2<BaselineLookup> {
        Array2::from_shape_fn((self.layer.height, self.layer.width), |(row, col)| {
            self.get(PixelCoord::new(row, col))
        })
    }

    pub fn ready_count(&self) -> usize {
        self.layer
            .cells
            .iter()
            .filter(|stats| self.policy.is_usable(stats))
            .count()
    }
}

/// One immutable version of the baseline aggregate.
#[derive(Debug, Clone, PartialEq)]
pub struct BaselineSnapshot {
    version: u64,
    grid: GridSpec,
    policy: HistoryPolicy,
    layers: BTreeMap<LayerKey, Arc<BaselineGrid>>,
}

impl BaselineSnapshot {
    pub fn from_parts(
        version: u64,
        grid: GridSpec,
        policy: HistoryPolicy,
        layers: BTreeMap<LayerKey, BaselineGrid>,
    ) -> Result<Self> {
        for (key, layer) in &layers {
            if layer.width != grid.width || layer.height != grid.height {
                return Err(CanopyError::MisalignedRaster {
                    layer: format!("baseline {} month {}", key.index, key.month),
                    reason: format!(
                        "layer is {}x{}, grid is {}x{}",
                        layer.width, layer.height, grid.width, grid.height
                    ),
                });
            }
        }
        Ok(Self {
            version,
            grid,
            policy,
            layers: layers.into_iter().map(|(k, v)| (k, Arc::new(v))).collect(),
        })
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn grid(&self) -> &GridSpec {
        &self.grid
    }

    pub fn policy(&self) -> HistoryPolicy {
        self.policy
    }

    pub fn layers(&self) -> impl Iterator<Item = (&LayerKey, &BaselineGrid)> {
        self.layers.iter().map(|(k, v)| (k, v.as_ref()))
    }

    pub fn has_layer(&self, month: Month, index: SpectralIndex) -> bool {
        self.layers.contains_key(&LayerKey::new(month, index))
    }

    pub fn query(&self, month: Month, index: SpectralIndex) -> Result<BaselineQuery> {
        let key = LayerKey::new(month, index);
        let layer = self
            .layers
            .get(&key)
            .cloned()
            .ok_or(CanopyError::MissingBaseline { month, index })?;
        Ok(BaselineQuery {
            key,
            layer,
            policy: self.policy,
        })
    }

    /// Usable record for one pixel, or `InsufficientHistory`.
    pub fn record(&self, pixel: PixelCoord, month: Month, index: SpectralIndex) -> Result<BaselineRecord> {
        if !self.grid.contains(pixel) {
            return Err(CanopyError::PixelOutOfBounds(pixel));
        }
        let layer = self
            .layers
            .get(&LayerKey::new(month, index))
            .ok_or(CanopyError::MissingBaseline { month, index })?;
        let stats = layer
            .stats(pixel)
            .ok_or(CanopyError::PixelOutOfBounds(pixel))?;

        if !self.policy.is_usable(stats) {
            return Err(CanopyError::InsufficientHistory {
                month,
                index,
                pixel: Some(pixel),
                sample_count: stats.count(),
                year_count: stats.years().len(),
            });
        }

        Ok(BaselineRecord {
            mean: stats.mean(),
            std: stats.std_dev(),
            sample_count: stats.count(),
            years: stats.years().iter().copied().collect(),
        })
    }
}

/// Owner of the baseline lifecycle. Updates replace the current snapshot.
#[derive(Debug, Clone)]
pub struct BaselineStore {
    current: Arc<BaselineSnapshot>,
}

impl BaselineStore {
    pub fn new(grid: GridSpec, policy: HistoryPolicy) -> Self {
        Self {
            current: Arc::new(BaselineSnapshot {
                version: 0,
                grid,
                policy,
                layers: BTreeMap::new(),
            }),
        }
    }

    pub fn from_snapshot(snapshot: BaselineSnapshot) -> Self {
        Self {
            current: Arc::new(snapshot),
        }
    }

    /// Current version; cheap to clone and safe to read while the store is updated.
    pub fn snapshot(&self) -> Arc<BaselineSnapshot> {
        Arc::clone(&self.current)
    }

    pub fn version(&self) -> u64 {
        self.current.version
    }

    pub fn query(&self, month: Month, index: SpectralIndex) -> Result<BaselineQuery> {
        self.current.query(month, index)
    }

    pub fn record(&self, pixel: PixelCoord, month: Month, index: SpectralIndex) -> Result<BaselineRecord> {
        self.current.record(pixel, month, index)
    }

    /// Fold a single observation in. Non-finite values are treated as masked
    /// and skipped; returns whether the observation was used.
    pub fn ingest(&mut self, pixel: PixelCoord, date: NaiveDate, index: SpectralIndex, value: f64) -> Result<bool> {
        if !self.current.grid.contains(pixel) {
            return Err(CanopyError::PixelOutOfBounds(pixel));
        }
        if !value.is_finite() {
            return Ok(false);
        }

        let snapshot = Arc::make_mut(&mut self.current);
        let offset = snapshot.grid.offset(pixel);
        let layer = snapshot.layer_mut(LayerKey::new(Month::of(date), index));
        layer.cells[offset].push(date.year(), value);
        snapshot.version += 1;
        Ok(true)
    }

    /// Fold every valid cell of a scene in; returns the number of cells used.
    pub fn ingest_raster(&mut self, date: NaiveDate, index: SpectralIndex, raster: &Raster) -> Result<usize> {
        self.current
            .grid
            .ensure_aligned(raster.grid(), &format!("{index} {date}"))?;

        let year = date.year();
        let key = LayerKey::new(Month::of(date), index);
        let snapshot = Arc::make_mut(&mut self.current);
        let width = snapshot.grid.width.max(1);
        let layer = snapshot.layer_mut(key);

        // Rows are disjoint, so each worker owns its slice of cells outright.
        let folded: usize = layer
            .cells
            .par_chunks_mut(width)
            .enumerate()
            .map(|(row, cells)| {
                let mut used = 0;
                for (col, stats) in cells.iter_mut().enumerate() {
                    if let Some(value) = raster.get(row, col) {
                        stats.push(year, value);
                        used += 1;
                    }
                }
                used
            })
            .sum();

        snapshot.version += 1;
        debug!(
            index = %index,
            month = %key.month,
            %date,
            folded,
            version = snapshot.version,
            "Ingested scene into baseline"
        );
        Ok(folded)
    }

    /// Merge statistics accumulated in a separate store over the same grid.
    pub fn absorb(&mut self, other: &BaselineSnapshot) -> Result<()> {
        self.current.grid.ensure_aligned(&other.grid, "absorbed baseline")?;

        let snapshot = Arc::make_mut(&mut self.current);
        for (key, incoming) in &other.layers {
            let layer = snapshot.layer_mut(*key);
            layer
                .cells
                .par_iter_mut()
                .zip(incoming.cells.par_iter())
                .for_each(|(mine, theirs)| mine.merge(theirs));
        }
        snapshot.version += 1;
        Ok(())
    }
}

impl BaselineSnapshot {
    fn layer_mut(&mut self, key: LayerKey) -> &mut BaselineGrid {
        let (width, height) = (self.grid.width, self.grid.height);
        let layer = self
            .layers
            .entry(key)
            .or_insert_with(|| Arc::new(BaselineGrid::new(width, height)));
        Arc::make_mut(layer)
    }
}
