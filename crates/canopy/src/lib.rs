//! # Canopy Vegetation-Loss Detection Library
//!
//! Detects vegetation-loss anomalies in cloud-masked spectral index rasters by
//! comparing each observation with a season-aware historical baseline, widening
//! sensitivity during drought, and turning significant anomalies into polygon
//! alerts with stable identities.
//!
//! ## Core Features
//!
//! - **Baselines**: per-pixel, per-month, per-index statistics built from history
//!   and versioned as immutable snapshots
//! - **Drought Awareness**: thresholds widen with drought severity so dry-season
//!   browning is not reported as loss
//! - **Dual-Index Classification**: NDMI and NBR must agree before a pixel is
//!   flagged
//! - **Vectorization**: 8-connected regions traced to polygons with holes, filtered
//!   by a minimum area
//! - **GeoJSON Support**: typed alert features that round-trip through files
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use canopy::{BaselineStore, DetectionPipeline, DetectionRequest, DroughtState, SceneObservation};
//! use canopy::io::raster::load_raster;
//! use canopy::types::{DetectionPeriod, SpectralIndex};
//! use chrono::NaiveDate;
//!
//! let store = BaselineStore::load("baseline.json")?;
//! let date = NaiveDate::from_ymd_opt(2024, 3, 5).unwrap();
//! let scene = SceneObservation::new(date)
//!     .with_layer(SpectralIndex::Ndmi, load_raster("ndmi.json")?)
//!     .with_layer(SpectralIndex::Nbr, load_raster("nbr.json")?);
//!
//! let request = DetectionRequest {
//!     scene,
//!     period: DetectionPeriod::new(date, date)?,
//!     drought: DroughtState::from_spi(-1.7),
//! };
//! let outcome = DetectionPipeline::default().run(&store.snapshot(), &request)?;
//! canopy::io::geojson::save_alerts("alerts.geojson", &outcome.alerts, Some("EPSG:32724"))?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ## Custom Pipeline
//!
//! ```rust,no_run
//! use canopy::{DetectionConfig, DetectionPipeline, TierThresholds};
//!
//! let pipeline = DetectionPipeline::builder()
//!     .thresholds(TierThresholds::new(-3.5, -3.0, -2.5)?)
//!     .min_area_ha(0.5)
//!     .tiled(512)
//!     .with_simplification(5.0)
//!     .with_validation()
//!     .build();
//!
//! let config = DetectionConfig::from_file("detect.toml")?;
//! let configured = canopy::PipelineBuilder::from_config(&config).build();
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

// Core modules
pub mod error;
pub mod types;
pub mod raster;
pub mod baseline;
pub mod drought;
pub mod scoring;
pub mod classify;
pub mod traits;
pub mod algorithms;
pub mod vectorize;
pub mod alerts;
pub mod pipeline;
pub mod config;
pub mod io;
pub mod typed_geojson;

// Re-exports for convenience
pub use error::{CanopyError, Result};
pub use types::{ConfidenceTier, DetectionPeriod, Month, PixelCoord, PixelScore, SpectralIndex};
pub use raster::{GeoTransform, GridSpec, Raster};
pub use baseline::{BaselineBuilder, BaselineSnapshot, BaselineStore, HistoricalScene, HistoryPolicy};
pub use drought::{DroughtAdjuster, DroughtAdjustmentTable, DroughtSeries, DroughtSeverity, DroughtState};
pub use scoring::{AnomalyLayer, AnomalyScorer};
pub use classify::{Classifier, TierRaster, TierThresholds};
pub use traits::*;
pub use vectorize::{CandidateRegion, Vectorizer};
pub use alerts::{Alert, AlertEmitter, AlertId, AlertLedger, AlertSummary};
pub use pipeline::{
    builder::PipelineBuilder, DetectionOutcome, DetectionPipeline, DetectionRequest, SceneGateConfig, SceneObservation,
};
pub use config::DetectionConfig;

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use raster::tests::test_grid;

    #[test]
    fn test_pipeline_end_to_end_with_store() {
        // 12x12 px of 10 m cells = 1.44 ha
        let grid = test_grid(12, 12);
        let mut store = BaselineStore::new(grid.clone(), HistoryPolicy::default());
        for (year, value) in [(2020, 0.42), (2021, 0.40), (2022, 0.45), (2023, 0.38)] {
            let date = NaiveDate::from_ymd_opt(year, 1, 10).unwrap();
            for index in SpectralIndex::MANDATORY {
                store.ingest_raster(date, index, &Raster::filled(grid.clone(), value)).unwrap();
            }
        }

        let date = NaiveDate::from_ymd_opt(2024, 1, 8).unwrap();
        let request = DetectionRequest {
            scene: SceneObservation::new(date)
                .with_layer(SpectralIndex::Ndmi, Raster::filled(grid.clone(), 0.30))
                .with_layer(SpectralIndex::Nbr, Raster::filled(grid.clone(), 0.30)),
            period: DetectionPeriod::new(date, date).unwrap(),
            drought: DroughtState::normal(),
        };

        let outcome = DetectionPipeline::default().run(&store.snapshot(), &request).unwrap();
        assert_eq!(outcome.alerts.len(), 1);
        assert_eq!(outcome.alerts[0].tier, ConfidenceTier::High);
        assert!((outcome.alerts[0].area_ha - 1.44).abs() < 1e-9);
        assert_eq!(outcome.summary.total_alerts, 1);
        assert_eq!(outcome.baseline_version, store.version());
    }

    #[test]
    fn test_info() {
        let pipeline = PipelineBuilder::new().with_validation().build();
        assert!(pipeline.info().starts_with("DetectionPipeline"));
    }
}
