use chrono::NaiveDate;
use thiserror::Error;

use crate::types::{Month, PixelCoord, SpectralIndex};

#[derive(Error, Debug)]
pub enum CanopyError {
    #[error(
        "Insufficient history for {index} in month {month}{}: {sample_count} samples over {year_count} years",
        pixel_suffix(.pixel)
    )]
    InsufficientHistory {
        month: Month,
        index: SpectralIndex,
        pixel: Option<PixelCoord>,
        sample_count: u32,
        year_count: usize,
    },

    #[error("Missing required index layer: {0}")]
    MissingLayer(SpectralIndex),

    #[error("No baseline for {index} in month {month}")]
    MissingBaseline { month: Month, index: SpectralIndex },

    #[error("Raster layer '{layer}' is not aligned with the reference grid: {reason}")]
    MisalignedRaster { layer: String, reason: String },

    #[error("Malformed raster: {0}")]
    MalformedRaster(String),

    #[error("Corrupt baseline cell {offset}: {reason}")]
    CorruptBaseline { offset: usize, reason: String },

    #[error("Scene is {} clear, below the required {}", percent(.fraction), percent(.required))]
    InsufficientClearSky { fraction: f64, required: f64 },

    #[error("Invalid tier thresholds: {0}")]
    InvalidThresholds(String),

    #[error("Invalid drought adjustment table: {0}")]
    InvalidDroughtTable(String),

    #[error("Invalid calendar month: {0}")]
    InvalidMonth(u32),

    #[error("Invalid detection period: {start} is after {end}")]
    InvalidPeriod { start: NaiveDate, end: NaiveDate },

    #[error("Pixel {0} is outside the grid")]
    PixelOutOfBounds(PixelCoord),

    #[error("Geometric computation error: {0}")]
    GeometricComputation(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("TOML serialization error: {0}")]
    TomlSer(#[from] toml::ser::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("GeoJSON error: {0}")]
    GeoJson(#[from] geojson::Error),

    #[error("Unsupported file format: {0}")]
    UnsupportedFileFormat(String),
}

fn pixel_suffix(pixel: &Option<PixelCoord>) -> String {
    pixel.map(|p| format!(" at {p}")).unwrap_or_default()
}

fn percent(fraction: &f64) -> String {
    format!("{:.1}%", fraction * 100.0)
}

pub type Result<T> = std::result::Result<T, CanopyError>;
