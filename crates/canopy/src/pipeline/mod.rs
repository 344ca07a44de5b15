pub mod builder;

use std::collections::BTreeMap;

use chrono::NaiveDate;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{
    alerts::{Alert, AlertEmitter, AlertSummary, EmissionContext},
    baseline::{BaselineQuery, BaselineSnapshot},
    classify::{Classifier, TierThresholds},
    drought::{DroughtAdjuster, DroughtState},
    error::{CanopyError, Result},
    raster::Raster,
    scoring::{AnomalyLayer, AnomalyScorer},
    types::{ConfidenceTier, DetectionPeriod, Month, SpectralIndex},
    vectorize::Vectorizer,
};

/// Default share of valid pixels a scene needs before it is scored.
pub const DEFAULT_MIN_CLEAR_FRACTION: f64 = 0.5;

/// Scene acceptance settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct SceneGateConfig {
    /// Minimum fraction (0 to 1) of unmasked pixels in every mandatory layer
    pub min_clear_fraction: f64,
}

impl Default for SceneGateConfig {
    fn default() -> Self {
        Self {
            min_clear_fraction: DEFAULT_MIN_CLEAR_FRACTION,
        }
    }
}

/// Cloud-masked index rasters of one acquisition.
#[derive(Debug, Clone, PartialEq)]
pub struct SceneObservation {
    pub date: NaiveDate,
    pub layers: BTreeMap<SpectralIndex, Raster>,
}

impl SceneObservation {
    pub fn new(date: NaiveDate) -> Self {
        Self {
            date,
            layers: BTreeMap::new(),
        }
    }

    pub fn with_layer(mut self, index: SpectralIndex, raster: Raster) -> Self {
        self.layers.insert(index, raster);
        self
    }

    pub fn layer(&self, index: SpectralIndex) -> Option<&Raster> {
        self.layers.get(&index)
    }

    /// Smallest clear fraction over the mandatory layers present.
    pub fn clear_fraction(&self) -> f64 {
        SpectralIndex::MANDATORY
            .iter()
            .filter_map(|index| self.layer(*index))
            .map(|raster| match raster.grid().len() {
                0 => 0.0,
                cells => raster.valid_count() as f64 / cells as f64,
            })
            .fold(1.0, f64::min)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DetectionRequest {
    pub scene: SceneObservation,
    pub period: DetectionPeriod,
    /// Drought state for the whole run; use [`DroughtState::normal`] when unknown
    pub drought: DroughtState,
}

/// Everything one run produced, alerts first.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectionOutcome {
    pub alerts: Vec<Alert>,
    pub summary: AlertSummary,
    /// Classified pixels per tier before the area filter
    pub tier_counts: BTreeMap<ConfidenceTier, usize>,
    /// Thresholds after drought widening
    pub thresholds: TierThresholds,
    pub baseline_version: u64,
    pub baseline_month: Month,
    pub drought: DroughtState,
}

/// Scores, classifies, vectorizes and emits alerts for one scene against a
/// baseline snapshot.
#[derive(Debug)]
pub struct DetectionPipeline {
    thresholds: TierThresholds,
    min_clear_fraction: f64,
    adjuster: DroughtAdjuster,
    scorer: AnomalyScorer,
    vectorizer: Vectorizer,
    emitter: AlertEmitter,
}

impl Default for DetectionPipeline {
    fn default() -> Self {
        builder::PipelineBuilder::new().build()
    }
}

struct ValidatedLayers<'a> {
    mandatory: Vec<(&'a Raster, BaselineQuery)>,
    advisory: Vec<(&'a Raster, BaselineQuery)>,
}

impl DetectionPipeline {
    /// Create a new pipeline builder
    pub fn builder() -> builder::PipelineBuilder {
        builder::PipelineBuilder::new()
    }

    pub fn new(
        thresholds: TierThresholds,
        adjuster: DroughtAdjuster,
        scorer: AnomalyScorer,
        vectorizer: Vectorizer,
    ) -> Self {
        Self {
            thresholds,
            min_clear_fraction: DEFAULT_MIN_CLEAR_FRACTION,
            adjuster,
            scorer,
            vectorizer,
            emitter: AlertEmitter::new(),
        }
    }

    /// Reject scenes whose mandatory layers are less clear than `fraction`.
    pub fn with_min_clear_fraction(mut self, fraction: f64) -> Self {
        self.min_clear_fraction = fraction.clamp(0.0, 1.0);
        self
    }

    pub fn thresholds(&self) -> &TierThresholds {
        &self.thresholds
    }

    pub fn min_clear_fraction(&self) -> f64 {
        self.min_clear_fraction
    }

    /// Run every stage. Structural problems (missing layers, misaligned grids,
    /// missing baselines, cloudy scenes) are reported before any scoring, so a
    /// failed run never yields partial alerts.
    pub fn run(&self, baseline: &BaselineSnapshot, request: &DetectionRequest) -> Result<DetectionOutcome> {
        let scene = &request.scene;
        let month = Month::of(scene.date);
        if !request.period.contains(scene.date) {
            warn!(
                "Scene date {} lies outside detection period {}",
                scene.date, request.period
            );
        }

        let validated = self.validate(baseline, scene, month)?;
        if baseline.grid().is_geographic() {
            warn!(
                "Grid CRS {} has degree-sized cells; alert areas in hectares assume metres",
                baseline.grid().crs
            );
        }
        info!(
            "Detecting {} (month {}, baseline v{}, {} advisory layers)",
            scene.date,
            month,
            baseline.version(),
            validated.advisory.len()
        );

        let thresholds = self.adjuster.adjust_thresholds(&self.thresholds, &request.drought);
        let classifier = Classifier::new(thresholds.clone());

        let mandatory = validated
            .mandatory
            .iter()
            .map(|(raster, query)| self.scorer.score_layer(raster, query))
            .collect::<Result<Vec<_>>>()?;
        let advisory = validated
            .advisory
            .iter()
            .map(|(raster, query)| self.scorer.score_layer(raster, query))
            .collect::<Result<Vec<_>>>()?;

        let (ndmi, nbr) = match mandatory.as_slice() {
            [ndmi, nbr] => (ndmi, nbr),
            _ => return Err(CanopyError::MissingLayer(SpectralIndex::Nbr)),
        };
        let tiers = classifier.classify(ndmi, nbr)?;
        let tier_counts = tiers.counts();
        info!("Classified {} anomalous pixels", tiers.anomalous_count());

        let regions = self.vectorizer.vectorize(&tiers)?;

        let context = EmissionContext {
            detection_date: scene.date,
            period: request.period,
            baseline_month: month,
            drought: request.drought,
        };
        let layers: Vec<&AnomalyLayer> = mandatory.iter().chain(advisory.iter()).collect();
        let alerts = self.emitter.emit(&regions, &layers, &context);
        let summary = AlertSummary::from_alerts(&alerts);
        info!(
            "Emitted {} alerts covering {:.2} ha",
            summary.total_alerts, summary.total_area_ha
        );

        Ok(DetectionOutcome {
            alerts,
            summary,
            tier_counts,
            thresholds,
            baseline_version: baseline.version(),
            baseline_month: month,
            drought: request.drought,
        })
    }

    fn validate<'a>(
        &self,
        baseline: &BaselineSnapshot,
        scene: &'a SceneObservation,
        month: Month,
    ) -> Result<ValidatedLayers<'a>> {
        let mut mandatory = Vec::with_capacity(SpectralIndex::MANDATORY.len());
        for index in SpectralIndex::MANDATORY {
            let raster = scene.layer(index).ok_or(CanopyError::MissingLayer(index))?;
            baseline.grid().ensure_aligned(raster.grid(), &index.to_string())?;
            mandatory.push((raster, baseline.query(month, index)?));
        }

        if !baseline.grid().is_empty() {
            let fraction = scene.clear_fraction();
            if fraction < self.min_clear_fraction {
                return Err(CanopyError::InsufficientClearSky {
                    fraction,
                    required: self.min_clear_fraction,
                });
            }
        }

        let mut advisory = Vec::new();
        for (&index, raster) in scene.layers.iter().filter(|(index, _)| !index.is_mandatory()) {
            baseline.grid().ensure_aligned(raster.grid(), &index.to_string())?;
            match baseline.query(month, index) {
                Ok(query) => advisory.push((raster, query)),
                Err(CanopyError::MissingBaseline { .. }) => {
                    warn!("No {} baseline for month {}; skipping advisory layer", index, month);
                }
                Err(e) => return Err(e),
            }
        }

        Ok(ValidatedLayers { mandatory, advisory })
    }

    /// Get information about the pipeline configuration
    pub fn info(&self) -> String {
        format!(
            "DetectionPipeline: thresholds {:?}, min clear {}, std floor {}, min area {} ha",
            self.thresholds.as_map(),
            self.min_clear_fraction,
            self.scorer.std_floor(),
            self.vectorizer.min_area_ha()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::baseline::{BaselineStore, HistoryPolicy};
    use crate::raster::tests::test_grid;

    fn snapshot() -> BaselineSnapshot {
        let grid = test_grid(4, 4);
        let mut store = BaselineStore::new(grid.clone(), HistoryPolicy::default());
        for (year, value) in [(2020, 0.42), (2021, 0.40), (2022, 0.45), (2023, 0.38)] {
            let date = NaiveDate::from_ymd_opt(year, 3, 10).unwrap();
            for index in SpectralIndex::MANDATORY {
                store.ingest_raster(date, index, &Raster::filled(grid.clone(), value)).unwrap();
            }
        }
        store.snapshot().as_ref().clone()
    }

    fn request(layers: &[(SpectralIndex, f64)]) -> DetectionRequest {
        let date = NaiveDate::from_ymd_opt(2024, 3, 5).unwrap();
        let scene = layers.iter().fold(SceneObservation::new(date), |scene, &(index, value)| {
            scene.with_layer(index, Raster::filled(test_grid(4, 4), value))
        });
        DetectionRequest {
            scene,
            period: DetectionPeriod::new(
                NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
                NaiveDate::from_ymd_opt(2024, 3, 16).unwrap(),
            )
            .unwrap(),
            drought: DroughtState::normal(),
        }
    }

    #[test]
    fn test_missing_mandatory_layer_aborts() {
        let pipeline = DetectionPipeline::default();
        let result = pipeline.run(&snapshot(), &request(&[(SpectralIndex::Ndmi, 0.30)]));
        assert!(matches!(result, Err(CanopyError::MissingLayer(SpectralIndex::Nbr))));
    }

    #[test]
    fn test_missing_baseline_month_aborts() {
        let pipeline = DetectionPipeline::default();
        let mut req = request(&[(SpectralIndex::Ndmi, 0.30), (SpectralIndex::Nbr, 0.30)]);
        req.scene.date = NaiveDate::from_ymd_opt(2024, 4, 2).unwrap();
        assert!(matches!(
            pipeline.run(&snapshot(), &req),
            Err(CanopyError::MissingBaseline { .. })
        ));
    }

    #[test]
    fn test_misaligned_layer_aborts() {
        let pipeline = DetectionPipeline::default();
        let mut req = request(&[(SpectralIndex::Ndmi, 0.30)]);
        req.scene.layers.insert(SpectralIndex::Nbr, Raster::filled(test_grid(5, 4), 0.30));
        assert!(matches!(
            pipeline.run(&snapshot(), &req),
            Err(CanopyError::MisalignedRaster { .. })
        ));
    }

    #[test]
    fn test_cloudy_scene_is_rejected() {
        // 12 of 16 NBR pixels masked
        let mut req = request(&[(SpectralIndex::Ndmi, 0.30)]);
        let values: Vec<Option<f64>> = (0..16).map(|i| (i < 4).then_some(0.30)).collect();
        req.scene
            .layers
            .insert(SpectralIndex::Nbr, Raster::from_options(test_grid(4, 4), &values).unwrap());
        assert_eq!(req.scene.clear_fraction(), 0.25);

        let result = DetectionPipeline::default().run(&snapshot(), &req);
        assert!(matches!(
            result,
            Err(CanopyError::InsufficientClearSky { fraction, required }) if fraction == 0.25 && required == 0.5
        ));

        let lenient = DetectionPipeline::builder().min_clear_fraction(0.2).build();
        let outcome = lenient.run(&snapshot(), &req).unwrap();
        assert_eq!(outcome.tier_counts.get(&ConfidenceTier::High), Some(&4));
    }

    #[test]
    fn test_advisory_layer_without_baseline_is_skipped() {
        // 16 px of 10 m is below one hectare: pixels classify but no alert
        let pipeline = DetectionPipeline::default();
        let req = request(&[
            (SpectralIndex::Ndmi, 0.30),
            (SpectralIndex::Nbr, 0.30),
            (SpectralIndex::Evi2, 0.10),
        ]);
        let outcome = pipeline.run(&snapshot(), &req).unwrap();
        assert!(outcome.alerts.is_empty());
        assert_eq!(outcome.tier_counts.get(&ConfidenceTier::High), Some(&16));
        assert_eq!(outcome.baseline_month.number(), 3);
    }
}
