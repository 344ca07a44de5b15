//! Detection configuration loaded from TOML or JSON.

use std::path::Path;

use schemars::{schema::RootSchema, schema_for, JsonSchema};
use serde::{Deserialize, Serialize};

use crate::{
    baseline::HistoryPolicy,
    classify::TierThresholds,
    drought::DroughtAdjustmentTable,
    error::{CanopyError, Result},
    pipeline::SceneGateConfig,
    scoring::ScoringConfig,
    vectorize::VectorizeConfig,
};

/// Every tunable of a detection run. Missing sections fall back to defaults.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
#[schemars(description = "Configuration for vegetation-loss anomaly detection")]
pub struct DetectionConfig {
    #[schemars(description = "Z-score thresholds per confidence tier (high < medium < low < 0)")]
    pub thresholds: TierThresholds,
    #[schemars(description = "Threshold widening per drought severity")]
    pub drought: DroughtAdjustmentTable,
    #[schemars(description = "Minimum history before a baseline record is usable")]
    pub history: HistoryPolicy,
    #[schemars(description = "Scenes less clear than this are skipped")]
    pub scene: SceneGateConfig,
    pub scoring: ScoringConfig,
    pub vectorize: VectorizeConfig,
}

impl DetectionConfig {
    /// Load from a `.toml` or `.json` file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => Self::from_toml_file(path),
            Some("json") => Self::from_json_file(path),
            _ => Err(CanopyError::UnsupportedFileFormat(format!(
                "{} (expected .toml or .json)",
                path.display()
            ))),
        }
    }

    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Self> {
        Ok(serde_json::from_str(content)?)
    }

    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn schema() -> RootSchema {
        schema_for!(DetectionConfig)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drought::DroughtSeverity;
    use crate::types::ConfidenceTier;
    use crate::vectorize::LabelingStrategy;

    #[test]
    fn test_empty_toml_gives_defaults() {
        let config = DetectionConfig::from_toml("").unwrap();
        assert_eq!(config, DetectionConfig::default());
        assert_eq!(config.thresholds.get(ConfidenceTier::High), -3.0);
        assert_eq!(config.drought.widening(DroughtSeverity::Severe), 0.5);
        assert_eq!(config.vectorize.min_area_ha, 1.0);
    }

    #[test]
    fn test_partial_toml_overrides() {
        let config = DetectionConfig::from_toml(
            r#"
            [thresholds]
            high = -3.5
            medium = -2.8
            low = -2.2

            [scene]
            min_clear_fraction = 0.3

            [vectorize]
            min_area_ha = 0.5
            labeling = { strategy = "tiled", stripe_rows = 128 }
            "#,
        )
        .unwrap();

        assert_eq!(config.thresholds.get(ConfidenceTier::Medium), -2.8);
        assert_eq!(config.vectorize.min_area_ha, 0.5);
        assert_eq!(config.scene.min_clear_fraction, 0.3);
        assert_eq!(config.vectorize.labeling, LabelingStrategy::Tiled { stripe_rows: 128 });
        assert_eq!(config.history, HistoryPolicy::default());
    }

    #[test]
    fn test_invalid_thresholds_are_rejected() {
        let result = DetectionConfig::from_json(r#"{"thresholds": {"high": -1.0, "medium": -2.0, "low": -3.0}}"#);
        assert!(matches!(result, Err(CanopyError::Serialization(_))));
    }

    #[test]
    fn test_toml_round_trip_and_file_dispatch() {
        let dir = tempfile::tempdir().unwrap();
        let config = DetectionConfig {
            history: HistoryPolicy { min_samples: 5, min_years: 4 },
            ..DetectionConfig::default()
        };

        let toml_path = dir.path().join("detect.toml");
        std::fs::write(&toml_path, config.to_toml().unwrap()).unwrap();
        assert_eq!(DetectionConfig::from_file(&toml_path).unwrap(), config);

        let json_path = dir.path().join("detect.json");
        std::fs::write(&json_path, config.to_json().unwrap()).unwrap();
        assert_eq!(DetectionConfig::from_file(&json_path).unwrap(), config);

        assert!(matches!(
            DetectionConfig::from_file(dir.path().join("detect.yaml")),
            Err(CanopyError::UnsupportedFileFormat(_))
        ));
    }

    #[test]
    fn test_schema_lists_sections() {
        let schema = serde_json::to_value(DetectionConfig::schema()).unwrap();
        let properties = schema["properties"].as_object().unwrap();
        for section in ["thresholds", "drought", "history", "scene", "scoring", "vectorize"] {
            assert!(properties.contains_key(section), "missing {section}");
        }
    }
}
