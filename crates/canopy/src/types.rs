use std::fmt;

use chrono::{Datelike, NaiveDate};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString, IntoStaticStr, VariantNames};
use ts_rs::TS;

use crate::error::{CanopyError, Result};

/// Spectral indices produced upstream from cloud-masked scenes.
#[derive(
    Debug, Clone, Copy,
    PartialEq, Eq, Hash, PartialOrd, Ord,
    Serialize, Deserialize, JsonSchema, TS,
    Display, EnumString, EnumIter, VariantNames, IntoStaticStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
#[ts(export)]
pub enum SpectralIndex {
    /// Normalized Difference Moisture Index
    Ndmi,
    /// Normalized Burn Ratio
    Nbr,
    /// Two-band Enhanced Vegetation Index (advisory only)
    Evi2,
}

impl SpectralIndex {
    /// Indices that must agree before a pixel is classified.
    pub const MANDATORY: [SpectralIndex; 2] = [SpectralIndex::Ndmi, SpectralIndex::Nbr];

    pub fn is_mandatory(self) -> bool {
        Self::MANDATORY.contains(&self)
    }
}

/// Calendar month, 1 = January.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(try_from = "u32", into = "u32")]
pub struct Month(u8);

impl Month {
    pub fn new(month: u32) -> Result<Self> {
        if (1..=12).contains(&month) {
            Ok(Self(month as u8))
        } else {
            Err(CanopyError::InvalidMonth(month))
        }
    }

    pub fn of(date: NaiveDate) -> Self {
        Self(date.month() as u8)
    }

    pub fn number(self) -> u32 {
        self.0 as u32
    }

    pub fn all() -> impl Iterator<Item = Month> {
        (1..=12).map(Month)
    }
}

impl TryFrom<u32> for Month {
    type Error = CanopyError;

    fn try_from(value: u32) -> Result<Self> {
        Self::new(value)
    }
}

impl From<Month> for u32 {
    fn from(month: Month) -> Self {
        month.number()
    }
}

impl fmt::Display for Month {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}", self.0)
    }
}

/// Row/column position in a raster grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PixelCoord {
    pub row: usize,
    pub col: usize,
}

impl PixelCoord {
    pub fn new(row: usize, col: usize) -> Self {
        Self { row, col }
    }
}

impl fmt::Display for PixelCoord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(row {}, col {})", self.row, self.col)
    }
}

/// Discrete confidence classification; ordering follows severity.
#[derive(
    Debug, Clone, Copy,
    PartialEq, Eq, Hash, PartialOrd, Ord,
    Serialize, Deserialize, JsonSchema, TS,
    Display, EnumString, EnumIter, VariantNames, IntoStaticStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
#[ts(export)]
pub enum ConfidenceTier {
    Low,
    Medium,
    High,
}

impl ConfidenceTier {
    /// Raster code: 0 is reserved for "not anomalous".
    pub fn code(self) -> u8 {
        match self {
            Self::Low => 1,
            Self::Medium => 2,
            Self::High => 3,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Self::Low),
            2 => Some(Self::Medium),
            3 => Some(Self::High),
            _ => None,
        }
    }
}

/// Standardized deviation of one observation from its baseline.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AnomalyScore {
    pub observed: f64,
    pub z: f64,
    pub delta: f64,
}

/// Per-pixel scoring outcome. Every variant except `Scored` is a null result
/// that is excluded from classification.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PixelScore {
    Scored(AnomalyScore),
    Masked,
    InsufficientHistory,
    UnstableBaseline,
}

impl PixelScore {
    pub fn score(&self) -> Option<&AnomalyScore> {
        match self {
            Self::Scored(score) => Some(score),
            _ => None,
        }
    }

    pub fn z(&self) -> Option<f64> {
        self.score().map(|s| s.z)
    }

    pub fn is_null(&self) -> bool {
        self.score().is_none()
    }
}

/// Min/max/mean of z-scores over the pixels of a region.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, JsonSchema, TS)]
#[ts(export)]
pub struct ZScoreSummary {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    /// Member pixels that carried a score for this index
    pub pixel_count: u32,
}

impl ZScoreSummary {
    pub fn from_values<I>(values: I) -> Option<Self>
    where
        I: IntoIterator<Item = f64>,
    {
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        let mut sum = 0.0;
        let mut count = 0u32;

        for z in values {
            min = min.min(z);
            max = max.max(z);
            sum += z;
            count += 1;
        }

        (count > 0).then(|| Self {
            min,
            max,
            mean: sum / count as f64,
            pixel_count: count,
        })
    }
}

/// Inclusive date range a detection run covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(try_from = "PeriodBounds")]
pub struct DetectionPeriod {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

/// Unchecked wire form of [`DetectionPeriod`].
#[derive(Deserialize)]
struct PeriodBounds {
    start: NaiveDate,
    end: NaiveDate,
}

impl TryFrom<PeriodBounds> for DetectionPeriod {
    type Error = CanopyError;

    fn try_from(bounds: PeriodBounds) -> Result<Self> {
        Self::new(bounds.start, bounds.end)
    }
}

impl DetectionPeriod {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self> {
        if start > end {
            return Err(CanopyError::InvalidPeriod { start, end });
        }
        Ok(Self { start, end })
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }
}

impl fmt::Display for DetectionPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.start, self.end)
    }
}
