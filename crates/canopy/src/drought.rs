//! Drought-aware widening of anomaly thresholds.
//!
//! Dry spells depress moisture indices across the whole landscape. During a
//! drought the z-score needed to raise an alert moves further from zero, by an
//! amount looked up in an ordered severity table.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use schemars::{r#gen::SchemaGenerator, schema::Schema, JsonSchema};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString, IntoStaticStr, VariantNames};
use tracing::warn;
use ts_rs::TS;

use crate::classify::TierThresholds;
use crate::error::{CanopyError, Result};

/// SPI cut-offs, most severe first: (upper bound, severity). A value strictly
/// below the bound falls into that category.
const SPI_BANDS: [(f64, DroughtSeverity); 3] = [
    (-2.0, DroughtSeverity::Extreme),
    (-1.5, DroughtSeverity::Severe),
    (-1.0, DroughtSeverity::Moderate),
];

#[derive(
    Debug, Clone, Copy,
    PartialEq, Eq, Hash, PartialOrd, Ord,
    Serialize, Deserialize, JsonSchema, TS,
    Display, EnumString, EnumIter, VariantNames, IntoStaticStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
#[ts(export)]
pub enum DroughtSeverity {
    Normal,
    Moderate,
    Severe,
    Extreme,
}

impl DroughtSeverity {
    /// Category for a Standardized Precipitation Index value. Non-finite
    /// values carry no information and map to `Normal`.
    pub fn from_spi(spi: f64) -> Self {
        if !spi.is_finite() {
            warn!("Non-finite drought index ({spi}); assuming normal conditions");
            return Self::Normal;
        }
        SPI_BANDS
            .iter()
            .find(|(bound, _)| spi < *bound)
            .map(|(_, severity)| *severity)
            .unwrap_or(Self::Normal)
    }
}

/// Drought conditions for the whole study area during one detection run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct DroughtState {
    /// Raw index value (SPI-3 or equivalent)
    pub index_value: f64,
    pub severity: DroughtSeverity,
}

impl DroughtState {
    pub fn from_spi(spi: f64) -> Self {
        Self {
            index_value: spi,
            severity: DroughtSeverity::from_spi(spi),
        }
    }

    pub fn normal() -> Self {
        Self {
            index_value: 0.0,
            severity: DroughtSeverity::Normal,
        }
    }
}

impl Default for DroughtState {
    fn default() -> Self {
        Self::normal()
    }
}

/// Ordered severity → widening table (in standard deviations).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "DroughtAdjustmentConfig", into = "DroughtAdjustmentConfig")]
pub struct DroughtAdjustmentTable {
    widening: BTreeMap<DroughtSeverity, f64>,
}

/// Serialized form of [`DroughtAdjustmentTable`]; Normal is always 0.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct DroughtAdjustmentConfig {
    pub moderate: f64,
    pub severe: f64,
    pub extreme: f64,
}

impl Default for DroughtAdjustmentConfig {
    fn default() -> Self {
        Self {
            moderate: 0.25,
            severe: 0.5,
            extreme: 0.75,
        }
    }
}

impl DroughtAdjustmentTable {
    /// Build from per-severity widenings; must be non-negative and
    /// non-decreasing with severity.
    pub fn new(moderate: f64, severe: f64, extreme: f64) -> Result<Self> {
        let widening = BTreeMap::from([
            (DroughtSeverity::Normal, 0.0),
            (DroughtSeverity::Moderate, moderate),
            (DroughtSeverity::Severe, severe),
            (DroughtSeverity::Extreme, extreme),
        ]);

        let mut previous = 0.0;
        for (severity, &value) in &widening {
            if !value.is_finite() || value < previous {
                return Err(CanopyError::InvalidDroughtTable(format!(
                    "widening for {severity} ({value}) must be finite and at least {previous}"
                )));
            }
            previous = value;
        }

        Ok(Self { widening })
    }

    pub fn widening(&self, severity: DroughtSeverity) -> f64 {
        self.widening.get(&severity).copied().unwrap_or(0.0)
    }
}

impl Default for DroughtAdjustmentTable {
    fn default() -> Self {
        let config = DroughtAdjustmentConfig::default();
        Self {
            widening: BTreeMap::from([
                (DroughtSeverity::Normal, 0.0),
                (DroughtSeverity::Moderate, config.moderate),
                (DroughtSeverity::Severe, config.severe),
                (DroughtSeverity::Extreme, config.extreme),
            ]),
        }
    }
}

impl JsonSchema for DroughtAdjustmentTable {
    fn schema_name() -> String {
        DroughtAdjustmentConfig::schema_name()
    }

    fn json_schema(generator: &mut SchemaGenerator) -> Schema {
        DroughtAdjustmentConfig::json_schema(generator)
    }
}

impl TryFrom<DroughtAdjustmentConfig> for DroughtAdjustmentTable {
    type Error = CanopyError;

    fn try_from(config: DroughtAdjustmentConfig) -> Result<Self> {
        Self::new(config.moderate, config.severe, config.extreme)
    }
}

impl From<DroughtAdjustmentTable> for DroughtAdjustmentConfig {
    fn from(table: DroughtAdjustmentTable) -> Self {
        Self {
            moderate: table.widening(DroughtSeverity::Moderate),
            severe: table.widening(DroughtSeverity::Severe),
            extreme: table.widening(DroughtSeverity::Extreme),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DroughtAdjuster {
    table: DroughtAdjustmentTable,
}

impl DroughtAdjuster {
    pub fn new(table: DroughtAdjustmentTable) -> Self {
        Self { table }
    }

    pub fn table(&self) -> &DroughtAdjustmentTable {
        &self.table
    }

    /// Move a (negative) z threshold further from zero.
    pub fn adjust(&self, base_threshold: f64, state: &DroughtState) -> f64 {
        base_threshold - self.table.widening(state.severity)
    }

    /// Widen every tier by the same amount for the whole run.
    pub fn adjust_thresholds(&self, thresholds: &TierThresholds, state: &DroughtState) -> TierThresholds {
        let widening = self.table.widening(state.severity);
        if widening > 0.0 {
            warn!(
                "Drought detected ({}, index {:.2}); widening z-thresholds by {:.2}σ",
                state.severity, state.index_value, widening
            );
        }
        thresholds.widened(widening)
    }
}

/// Drought index values keyed by the first day of each period.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DroughtSeries {
    values: BTreeMap<NaiveDate, f64>,
}

impl DroughtSeries {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, period_start: NaiveDate, value: f64) {
        self.values.insert(period_start, value);
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// State of the latest period starting on or before `date`.
    pub fn state_at(&self, date: NaiveDate) -> Option<DroughtState> {
        self.values
            .range(..=date)
            .next_back()
            .map(|(_, &value)| DroughtState::from_spi(value))
    }

    /// Like [`state_at`](Self::state_at) but falls back to normal conditions
    /// when the series does not cover the date.
    pub fn state_or_normal(&self, date: NaiveDate) -> DroughtState {
        self.state_at(date).unwrap_or_else(|| {
            warn!("No drought index covers {date}; proceeding without drought adjustment");
            DroughtState::normal()
        })
    }
}

impl FromIterator<(NaiveDate, f64)> for DroughtSeries {
    fn from_iter<I: IntoIterator<Item = (NaiveDate, f64)>>(iter: I) -> Self {
        Self {
            values: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::Classifier;
    use crate::types::ConfidenceTier;
    use strum::IntoEnumIterator;

    #[test]
    fn test_spi_categories() {
        assert_eq!(DroughtSeverity::from_spi(0.3), DroughtSeverity::Normal);
        assert_eq!(DroughtSeverity::from_spi(-1.0), DroughtSeverity::Normal);
        assert_eq!(DroughtSeverity::from_spi(-1.2), DroughtSeverity::Moderate);
        assert_eq!(DroughtSeverity::from_spi(-1.7), DroughtSeverity::Severe);
        assert_eq!(DroughtSeverity::from_spi(-2.4), DroughtSeverity::Extreme);
        assert_eq!(DroughtSeverity::from_spi(f64::NAN), DroughtSeverity::Normal);
    }

    #[test]
    fn test_severe_drought_widens_high_threshold() {
        let adjuster = DroughtAdjuster::default();
        let severe = DroughtState::from_spi(-1.7);
        assert!((adjuster.adjust(-3.0, &severe) + 3.5).abs() < 1e-12);
        assert_eq!(adjuster.adjust(-3.0, &DroughtState::normal()), -3.0);
    }

    #[test]
    fn test_widening_is_monotonic_in_severity() {
        let adjuster = DroughtAdjuster::default();
        let mut previous = f64::INFINITY;
        for severity in DroughtSeverity::iter() {
            let state = DroughtState { index_value: 0.0, severity };
            let threshold = adjuster.adjust(-2.0, &state);
            assert!(threshold <= previous);
            previous = threshold;
        }
    }

    #[test]
    fn test_tier_never_gains_as_drought_worsens() {
        let adjuster = DroughtAdjuster::default();
        let base = TierThresholds::default();
        let z_values = [-1.9, -2.0, -2.2, -2.5, -2.7, -3.0, -3.2, -3.6, -4.5];

        for &ndmi in &z_values {
            for &nbr in &z_values {
                let mut previous: Option<Option<ConfidenceTier>> = None;
                for severity in DroughtSeverity::iter() {
                    let state = DroughtState { index_value: 0.0, severity };
                    let classifier = Classifier::new(adjuster.adjust_thresholds(&base, &state));
                    let tier = classifier.classify_pixel(Some(ndmi), Some(nbr));
                    if let Some(prev) = previous {
                        assert!(tier <= prev, "tier gained for z=({ndmi}, {nbr}) at {severity}");
                    }
                    previous = Some(tier);
                }
            }
        }
    }

    #[test]
    fn test_table_rejects_decreasing_widening() {
        assert!(DroughtAdjustmentTable::new(0.5, 0.25, 1.0).is_err());
        assert!(DroughtAdjustmentTable::new(-0.1, 0.25, 1.0).is_err());
        assert!(DroughtAdjustmentTable::new(0.5, 0.5, 0.5).is_ok());
    }

    #[test]
    fn test_table_serde_round_trip_validates() {
        let json = r#"{"moderate": 0.3, "severe": 0.6, "extreme": 0.9}"#;
        let table: DroughtAdjustmentTable = serde_json::from_str(json).unwrap();
        assert_eq!(table.widening(DroughtSeverity::Severe), 0.6);

        let bad = r#"{"moderate": 0.9, "severe": 0.6, "extreme": 0.9}"#;
        assert!(serde_json::from_str::<DroughtAdjustmentTable>(bad).is_err());
    }

    #[test]
    fn test_series_lookup() {
        let day = |m, d| NaiveDate::from_ymd_opt(2024, m, d).unwrap();
        let series: DroughtSeries = [(day(1, 1), 0.2), (day(2, 1), -1.6), (day(3, 1), -2.3)]
            .into_iter()
            .collect();

        assert_eq!(series.state_at(day(2, 20)).unwrap().severity, DroughtSeverity::Severe);
        assert_eq!(series.state_at(day(3, 1)).unwrap().severity, DroughtSeverity::Extreme);
        assert!(series.state_at(NaiveDate::from_ymd_opt(2023, 12, 31).unwrap()).is_none());
        assert_eq!(
            series.state_or_normal(NaiveDate::from_ymd_opt(2023, 12, 31).unwrap()).severity,
            DroughtSeverity::Normal
        );
    }
}
