use std::fmt::Debug;

use geo_types::MultiPolygon;

use crate::{algorithms::RegionLabels, classify::TierRaster, error::Result};

/// Trait for connected-component labeling of anomalous pixels
pub trait RegionLabeler: Send + Sync + Debug {
    /// Label 8-connected anomalous pixels; labels must be canonical
    /// (numbered by each region's first pixel in row-major order)
    fn label(&self, tiers: &TierRaster) -> Result<RegionLabels>;
}

/// Trait for geometry post-processing algorithms
pub trait GeometryPostProcessor: Send + Sync + Debug {
    /// Post-process one alert geometry in CRS coordinates
    fn process(&self, geometry: &mut MultiPolygon<f64>) -> Result<()>;
}
