use crate::{
    algorithms::{DouglasPeuckerSimplifier, FullExtentLabeler, GeometryValidator, TiledLabeler},
    classify::TierThresholds,
    config::DetectionConfig,
    drought::{DroughtAdjuster, DroughtAdjustmentTable},
    pipeline::{DetectionPipeline, DEFAULT_MIN_CLEAR_FRACTION},
    scoring::{AnomalyScorer, DEFAULT_STD_FLOOR},
    traits::{GeometryPostProcessor, RegionLabeler},
    vectorize::{Vectorizer, DEFAULT_MIN_AREA_HA},
};

/// Builder for creating detection pipelines with a fluent API
#[derive(Debug)]
pub struct PipelineBuilder {
    thresholds: TierThresholds,
    drought_table: DroughtAdjustmentTable,
    min_clear_fraction: f64,
    std_floor: f64,
    min_area_ha: f64,
    labeler: Option<Box<dyn RegionLabeler>>,
    postprocessors: Vec<Box<dyn GeometryPostProcessor>>,
}

impl PipelineBuilder {
    /// Create a new pipeline builder
    pub fn new() -> Self {
        Self {
            thresholds: TierThresholds::default(),
            drought_table: DroughtAdjustmentTable::default(),
            min_clear_fraction: DEFAULT_MIN_CLEAR_FRACTION,
            std_floor: DEFAULT_STD_FLOOR,
            min_area_ha: DEFAULT_MIN_AREA_HA,
            labeler: None,
            postprocessors: Vec::new(),
        }
    }

    /// Start from a loaded configuration
    pub fn from_config(config: &DetectionConfig) -> Self {
        let mut builder = Self::new()
            .thresholds(config.thresholds.clone())
            .drought_table(config.drought.clone())
            .min_clear_fraction(config.scene.min_clear_fraction)
            .std_floor(config.scoring.std_floor)
            .min_area_ha(config.vectorize.min_area_ha);
        builder.labeler = Some(config.vectorize.labeling.labeler());

        if let Some(tolerance) = config.vectorize.simplify_tolerance {
            builder = builder.with_simplification(tolerance);
        }
        if config.vectorize.validate_geometry {
            builder = builder.with_validation();
        }
        builder
    }

    pub fn thresholds(mut self, thresholds: TierThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    pub fn drought_table(mut self, table: DroughtAdjustmentTable) -> Self {
        self.drought_table = table;
        self
    }

    pub fn min_clear_fraction(mut self, fraction: f64) -> Self {
        self.min_clear_fraction = fraction;
        self
    }

    pub fn std_floor(mut self, std_floor: f64) -> Self {
        self.std_floor = std_floor;
        self
    }

    pub fn min_area_ha(mut self, min_area_ha: f64) -> Self {
        self.min_area_ha = min_area_ha;
        self
    }

    /// Set the region labeler (replaces any existing one)
    pub fn set_labeler<L>(mut self, labeler: L) -> Self
    where
        L: RegionLabeler + 'static,
    {
        self.labeler = Some(Box::new(labeler));
        self
    }

    /// Label in parallel stripes of `stripe_rows` rows
    pub fn tiled(self, stripe_rows: usize) -> Self {
        self.set_labeler(TiledLabeler::new(stripe_rows))
    }

    /// Add a geometry post-processor; they run in insertion order
    pub fn add_postprocessor<P>(mut self, postprocessor: P) -> Self
    where
        P: GeometryPostProcessor + 'static,
    {
        self.postprocessors.push(Box::new(postprocessor));
        self
    }

    /// Add Douglas-Peucker simplification as a post-processing step
    pub fn with_simplification(self, tolerance: f64) -> Self {
        self.add_postprocessor(DouglasPeuckerSimplifier { tolerance })
    }

    /// Add geometry validation as a post-processing step
    pub fn with_validation(self) -> Self {
        self.add_postprocessor(GeometryValidator)
    }

    /// Build the pipeline with default components if not specified
    pub fn build(self) -> DetectionPipeline {
        let labeler = self.labeler.unwrap_or_else(|| Box::new(FullExtentLabeler));
        let vectorizer = self
            .postprocessors
            .into_iter()
            .fold(Vectorizer::new(labeler, self.min_area_ha), Vectorizer::with_postprocessor);

        DetectionPipeline::new(
            self.thresholds,
            DroughtAdjuster::new(self.drought_table),
            AnomalyScorer::new(self.std_floor),
            vectorizer,
        )
        .with_min_clear_fraction(self.min_clear_fraction)
    }
}

impl Default for PipelineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ConfidenceTier;
    use crate::vectorize::LabelingStrategy;

    #[test]
    fn test_builder_defaults() {
        let pipeline = PipelineBuilder::new().build();
        assert_eq!(pipeline.thresholds(), &TierThresholds::default());
        assert!(pipeline.info().contains("min area 1 ha"));
    }

    #[test]
    fn test_builder_from_config() {
        let mut config = DetectionConfig::default();
        config.thresholds = TierThresholds::new(-3.5, -3.0, -2.5).unwrap();
        config.vectorize.min_area_ha = 2.0;
        config.vectorize.labeling = LabelingStrategy::Tiled { stripe_rows: 64 };
        config.vectorize.simplify_tolerance = Some(5.0);
        config.scene.min_clear_fraction = 0.8;

        let pipeline = PipelineBuilder::from_config(&config).build();
        assert_eq!(pipeline.thresholds().get(ConfidenceTier::Low), -2.5);
        assert_eq!(pipeline.min_clear_fraction(), 0.8);
        assert!(pipeline.info().contains("min area 2 ha"));
    }
}
