//! Confidence tiers from paired NDMI/NBR z-scores.

use std::collections::BTreeMap;

use image::{GrayImage, Luma};
use ndarray::{Array2, Zip};
use schemars::{r#gen::SchemaGenerator, schema::Schema, JsonSchema};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{CanopyError, Result};
use crate::raster::GridSpec;
use crate::scoring::AnomalyLayer;
use crate::types::{ConfidenceTier, SpectralIndex};

/// Ordered tier → z threshold table, most severe tier first.
///
/// Thresholds must satisfy `high < medium < low < 0`, which makes
/// classification monotonic: a more negative z can never lower the tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "ThresholdConfig", into = "ThresholdConfig")]
pub struct TierThresholds {
    table: Vec<(ConfidenceTier, f64)>,
}

/// Serialized form of [`TierThresholds`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct ThresholdConfig {
    pub high: f64,
    pub medium: f64,
    pub low: f64,
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            high: -3.0,
            medium: -2.5,
            low: -2.0,
        }
    }
}

impl TierThresholds {
    pub fn new(high: f64, medium: f64, low: f64) -> Result<Self> {
        let values = [high, medium, low];
        if values.iter().any(|v| !v.is_finite()) {
            return Err(CanopyError::InvalidThresholds(format!(
                "thresholds must be finite, got high={high} medium={medium} low={low}"
            )));
        }
        if !(high < medium && medium < low && low < 0.0) {
            return Err(CanopyError::InvalidThresholds(format!(
                "expected high < medium < low < 0, got high={high} medium={medium} low={low}"
            )));
        }
        Ok(Self {
            table: vec![
                (ConfidenceTier::High, high),
                (ConfidenceTier::Medium, medium),
                (ConfidenceTier::Low, low),
            ],
        })
    }

    pub fn get(&self, tier: ConfidenceTier) -> f64 {
        self.table
            .iter()
            .find(|(t, _)| *t == tier)
            .map(|(_, threshold)| *threshold)
            .unwrap_or(f64::NEG_INFINITY)
    }

    /// (tier, threshold) pairs, most severe first.
    pub fn iter(&self) -> impl Iterator<Item = (ConfidenceTier, f64)> + '_ {
        self.table.iter().copied()
    }

    /// Every threshold moved `amount` further from zero. Ordering is preserved
    /// for any non-negative amount.
    pub fn widened(&self, amount: f64) -> Self {
        Self {
            table: self.table.iter().map(|&(tier, t)| (tier, t - amount.max(0.0))).collect(),
        }
    }

    pub fn as_map(&self) -> BTreeMap<ConfidenceTier, f64> {
        self.table.iter().copied().collect()
    }
}

impl Default for TierThresholds {
    fn default() -> Self {
        let config = ThresholdConfig::default();
        Self {
            table: vec![
                (ConfidenceTier::High, config.high),
                (ConfidenceTier::Medium, config.medium),
                (ConfidenceTier::Low, config.low),
            ],
        }
    }
}

impl JsonSchema for TierThresholds {
    fn schema_name() -> String {
        ThresholdConfig::schema_name()
    }

    fn json_schema(generator: &mut SchemaGenerator) -> Schema {
        ThresholdConfig::json_schema(generator)
    }
}

impl TryFrom<ThresholdConfig> for TierThresholds {
    type Error = CanopyError;

    fn try_from(config: ThresholdConfig) -> Result<Self> {
        Self::new(config.high, config.medium, config.low)
    }
}

impl From<TierThresholds> for ThresholdConfig {
    fn from(thresholds: TierThresholds) -> Self {
        Self {
            high: thresholds.get(ConfidenceTier::High),
            medium: thresholds.get(ConfidenceTier::Medium),
            low: thresholds.get(ConfidenceTier::Low),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Classifier {
    thresholds: TierThresholds,
}

impl Classifier {
    pub fn new(thresholds: TierThresholds) -> Self {
        Self { thresholds }
    }

    pub fn thresholds(&self) -> &TierThresholds {
        &self.thresholds
    }

    /// Highest tier both indices agree on; `None` when either is null.
    pub fn classify_pixel(&self, ndmi_z: Option<f64>, nbr_z: Option<f64>) -> Option<ConfidenceTier> {
        let (ndmi, nbr) = (ndmi_z?, nbr_z?);
        self.thresholds
            .iter()
            .find(|&(_, threshold)| ndmi <= threshold && nbr <= threshold)
            .map(|(tier, _)| tier)
    }

    pub fn classify(&self, ndmi: &AnomalyLayer, nbr: &AnomalyLayer) -> Result<TierRaster> {
        for (layer, expected) in [(ndmi, SpectralIndex::Ndmi), (nbr, SpectralIndex::Nbr)] {
            if layer.index != expected {
                return Err(CanopyError::MissingLayer(expected));
            }
        }
        ndmi.grid.ensure_aligned(&nbr.grid, "nbr")?;

        let mut codes = Array2::<u8>::zeros(ndmi.grid.shape());
        Zip::from(&mut codes)
            .and(&ndmi.scores)
            .and(&nbr.scores)
            .par_for_each(|code, a, b| {
                *code = self.classify_pixel(a.z(), b.z()).map_or(0, ConfidenceTier::code);
            });

        let raster = TierRaster {
            grid: ndmi.grid.clone(),
            codes,
        };
        debug!(counts = ?raster.counts(), "Classified pixels");
        Ok(raster)
    }
}

/// Per-pixel tier codes (0 = not anomalous).
#[derive(Debug, Clone, PartialEq)]
pub struct TierRaster {
    pub grid: GridSpec,
    pub codes: Array2<u8>,
}

impl TierRaster {
    pub fn from_tiers(grid: GridSpec, tiers: &[Option<ConfidenceTier>]) -> Result<Self> {
        let codes: Vec<u8> = tiers.iter().map(|t| t.map_or(0, ConfidenceTier::code)).collect();
        let codes = Array2::from_shape_vec(grid.shape(), codes)
            .map_err(|e| CanopyError::MalformedRaster(e.to_string()))?;
        Ok(Self { grid, codes })
    }

    pub fn get(&self, row: usize, col: usize) -> Option<ConfidenceTier> {
        self.codes.get((row, col)).copied().and_then(ConfidenceTier::from_code)
    }

    pub fn is_anomalous(&self, row: usize, col: usize) -> bool {
        self.get(row, col).is_some()
    }

    pub fn anomalous_count(&self) -> usize {
        self.codes.iter().filter(|c| **c > 0).count()
    }

    pub fn counts(&self) -> BTreeMap<ConfidenceTier, usize> {
        let mut counts = BTreeMap::new();
        for tier in self.codes.iter().filter_map(|c| ConfidenceTier::from_code(*c)) {
            *counts.entry(tier).or_insert(0) += 1;
        }
        counts
    }

    /// Binary image with anomalous pixels at 255.
    pub fn to_mask_image(&self) -> GrayImage {
        GrayImage::from_fn(self.grid.width as u32, self.grid.height as u32, |x, y| {
            if self.is_anomalous(y as usize, x as usize) {
                Luma([255u8])
            } else {
                Luma([0u8])
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raster::tests::test_grid;
    use crate::types::{AnomalyScore, PixelScore};

    fn layer(index: SpectralIndex, z: &[Option<f64>]) -> AnomalyLayer {
        let grid = test_grid(z.len(), 1);
        let scores = z
            .iter()
            .map(|z| match z {
                Some(z) => PixelScore::Scored(AnomalyScore {
                    observed: 0.0,
                    z: *z,
                    delta: 0.0,
                }),
                None => PixelScore::Masked,
            })
            .collect();
        AnomalyLayer {
            index,
            scores: Array2::from_shape_vec(grid.shape(), scores).unwrap(),
            grid,
        }
    }

    #[test]
    fn test_threshold_validation() {
        assert!(TierThresholds::new(-3.0, -2.5, -2.0).is_ok());
        assert!(TierThresholds::new(-2.0, -2.5, -3.0).is_err());
        assert!(TierThresholds::new(-3.0, -2.5, 0.5).is_err());
        assert!(TierThresholds::new(-3.0, -3.0, -2.0).is_err());
        assert!(TierThresholds::new(f64::NAN, -2.5, -2.0).is_err());
    }

    #[test]
    fn test_both_indices_must_agree() {
        let classifier = Classifier::default();
        assert_eq!(classifier.classify_pixel(Some(-4.35), Some(-3.1)), Some(ConfidenceTier::High));
        assert_eq!(classifier.classify_pixel(Some(-4.35), Some(-2.6)), Some(ConfidenceTier::Medium));
        assert_eq!(classifier.classify_pixel(Some(-2.0), Some(-2.0)), Some(ConfidenceTier::Low));
        assert_eq!(classifier.classify_pixel(Some(-4.35), Some(-1.9)), None);
        assert_eq!(classifier.classify_pixel(None, Some(-5.0)), None);
    }

    #[test]
    fn test_severe_drought_demotes_tier() {
        let widened = Classifier::new(TierThresholds::default().widened(0.5));
        assert_eq!(widened.classify_pixel(Some(-3.2), Some(-3.2)), Some(ConfidenceTier::Medium));
        assert_eq!(widened.classify_pixel(Some(-3.6), Some(-3.6)), Some(ConfidenceTier::High));
    }

    #[test]
    fn test_classification_is_monotonic() {
        let classifier = Classifier::default();
        let steps: Vec<f64> = (0..=60).map(|i| -0.1 * i as f64).collect();
        for &nbr in &steps {
            let mut previous = None;
            for &ndmi in &steps {
                let tier = classifier.classify_pixel(Some(ndmi), Some(nbr));
                assert!(tier >= previous, "tier dropped at ndmi={ndmi}, nbr={nbr}");
                previous = tier;
            }
        }
    }

    #[test]
    fn test_classify_layers() {
        let ndmi = layer(SpectralIndex::Ndmi, &[Some(-3.5), Some(-2.7), None, Some(-2.1)]);
        let nbr = layer(SpectralIndex::Nbr, &[Some(-3.1), Some(-3.0), Some(-4.0), Some(-1.0)]);
        let tiers = Classifier::default().classify(&ndmi, &nbr).unwrap();

        assert_eq!(tiers.get(0, 0), Some(ConfidenceTier::High));
        assert_eq!(tiers.get(0, 1), Some(ConfidenceTier::Medium));
        assert_eq!(tiers.get(0, 2), None);
        assert_eq!(tiers.get(0, 3), None);
        assert_eq!(tiers.anomalous_count(), 2);

        let mask = tiers.to_mask_image();
        assert_eq!(mask.get_pixel(0, 0).0, [255]);
        assert_eq!(mask.get_pixel(2, 0).0, [0]);
    }

    #[test]
    fn test_classify_rejects_swapped_layers() {
        let ndmi = layer(SpectralIndex::Ndmi, &[Some(-3.5)]);
        let nbr = layer(SpectralIndex::Nbr, &[Some(-3.5)]);
        assert!(matches!(
            Classifier::default().classify(&nbr, &ndmi),
            Err(CanopyError::MissingLayer(SpectralIndex::Ndmi))
        ));
    }
}
