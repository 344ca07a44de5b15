//! Per-pixel standardized deviation from the seasonal baseline.

use ndarray::Array2;
use rayon::prelude::*;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::baseline::{BaselineLookup, BaselineQuery};
use crate::error::{CanopyError, Result};
use crate::raster::{GridSpec, Raster};
use crate::types::{AnomalyScore, PixelCoord, PixelScore, SpectralIndex};

pub const DEFAULT_STD_FLOOR: f64 = 1e-6;

/// z-score of one observation, or `None` when the baseline spread is too
/// small (or not finite) to standardize against.
pub fn score(observed: f64, mean: f64, std: f64, std_floor: f64) -> Option<AnomalyScore> {
    if !std.is_finite() || std < std_floor || !observed.is_finite() || !mean.is_finite() {
        return None;
    }
    let delta = observed - mean;
    Some(AnomalyScore {
        observed,
        z: delta / std,
        delta,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct ScoringConfig {
    /// Baseline standard deviations below this are treated as unstable
    pub std_floor: f64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            std_floor: DEFAULT_STD_FLOOR,
        }
    }
}

/// Scores a whole layer against one baseline month/index.
#[derive(Debug, Clone, Copy)]
pub struct AnomalyScorer {
    std_floor: f64,
}

impl Default for AnomalyScorer {
    fn default() -> Self {
        Self::new(DEFAULT_STD_FLOOR)
    }
}

impl AnomalyScorer {
    pub fn new(std_floor: f64) -> Self {
        Self { std_floor }
    }

    pub fn from_config(config: &ScoringConfig) -> Self {
        Self::new(config.std_floor)
    }

    pub fn std_floor(&self) -> f64 {
        self.std_floor
    }

    /// Masked observations win over baseline problems, which win over scoring.
    pub fn score_pixel(&self, observed: Option<f64>, baseline: BaselineLookup) -> PixelScore {
        let Some(observed) = observed else {
            return PixelScore::Masked;
        };
        match baseline {
            BaselineLookup::InsufficientHistory { .. } => PixelScore::InsufficientHistory,
            BaselineLookup::Ready { mean, std, .. } => match score(observed, mean, std, self.std_floor) {
                Some(score) => PixelScore::Scored(score),
                None => PixelScore::UnstableBaseline,
            },
        }
    }

    pub fn score_layer(&self, raster: &Raster, baseline: &BaselineQuery) -> Result<AnomalyLayer> {
        let grid = raster.grid().clone();
        let index = baseline.key().index;

        if baseline.shape() != grid.shape() {
            return Err(CanopyError::MisalignedRaster {
                layer: index.to_string(),
                reason: format!(
                    "raster is {:?} but baseline month {} is {:?}",
                    grid.shape(),
                    baseline.key().month,
                    baseline.shape()
                ),
            });
        }

        let width = grid.width;
        let mut scores = vec![PixelScore::Masked; grid.len()];
        if width > 0 {
            scores
                .par_chunks_mut(width)
                .enumerate()
                .for_each(|(row, cells)| {
                    for (col, cell) in cells.iter_mut().enumerate() {
                        let lookup = baseline.get(PixelCoord::new(row, col));
                        *cell = self.score_pixel(raster.get(row, col), lookup);
                    }
                });
        }

        let scores = Array2::from_shape_vec(grid.shape(), scores)
            .map_err(|e| CanopyError::MalformedRaster(e.to_string()))?;
        let layer = AnomalyLayer { index, grid, scores };

        let stats = layer.stats();
        debug!(
            index = %index,
            scored = stats.scored,
            masked = stats.masked,
            insufficient = stats.insufficient_history,
            unstable = stats.unstable,
            "Scored layer"
        );
        Ok(layer)
    }
}

/// Counts of each per-pixel outcome in a layer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoreStats {
    pub scored: usize,
    pub masked: usize,
    pub insufficient_history: usize,
    pub unstable: usize,
}

/// Per-pixel outcomes for one index.
#[derive(Debug, Clone, PartialEq)]
pub struct AnomalyLayer {
    pub index: SpectralIndex,
    pub grid: GridSpec,
    pub scores: Array2<PixelScore>,
}

impl AnomalyLayer {
    pub fn get(&self, row: usize, col: usize) -> Option<&PixelScore> {
        self.scores.get((row, col))
    }

    pub fn z(&self, row: usize, col: usize) -> Option<f64> {
        self.get(row, col).and_then(PixelScore::z)
    }

    pub fn stats(&self) -> ScoreStats {
        self.scores.iter().fold(ScoreStats::default(), |mut acc, score| {
            match score {
                PixelScore::Scored(_) => acc.scored += 1,
                PixelScore::Masked => acc.masked += 1,
                PixelScore::InsufficientHistory => acc.insufficient_history += 1,
                PixelScore::UnstableBaseline => acc.unstable += 1,
            }
            acc
        })
    }
}
