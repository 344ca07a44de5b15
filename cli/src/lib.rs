use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use canopy::{
    io::raster::load_raster, CanopyError, DetectionConfig, DetectionPeriod, DroughtSeries, HistoricalScene,
    HistoryPolicy, Month, SceneObservation, SpectralIndex,
};
use chrono::NaiveDate;
use schemars::JsonSchema;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CliError {
    #[error(transparent)]
    SerdeError(#[from] serde_json::Error),
    #[error(transparent)]
    TomlDeError(#[from] toml::de::Error),
    #[error(transparent)]
    TomlSerError(#[from] toml::ser::Error),
    #[error(transparent)]
    IoError(#[from] std::io::Error),
    #[error(transparent)]
    Canopy(#[from] CanopyError),
    #[error("Unknown spectral index '{0}' (expected ndmi, nbr or evi2)")]
    UnknownIndex(String),
    #[error("Manifest lists no scenes")]
    EmptyCorpus,
    #[error("Unsupported file format. Please use .toml or .json files")]
    UnsupportedFileFormat,
}

/// TOML/JSON loading shared by every manifest.
pub trait Manifest: Serialize + DeserializeOwned {
    /// Load configuration from a TOML file
    fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<Self, CliError> {
        let content = fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Load configuration from TOML string
    fn from_toml(content: &str) -> Result<Self, CliError> {
        Ok(toml::from_str(content)?)
    }

    /// Load configuration from a JSON file
    fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self, CliError> {
        let content = fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    /// Load configuration from JSON string
    fn from_json(content: &str) -> Result<Self, CliError> {
        Ok(serde_json::from_str(content)?)
    }

    /// Auto-detect file format and load configuration
    fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, CliError> {
        let path_ref = path.as_ref();
        match path_ref.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => Self::from_toml_file(path),
            Some("json") => Self::from_json_file(path),
            _ => Err(CliError::UnsupportedFileFormat),
        }
    }

    fn to_toml(&self) -> Result<String, CliError> {
        Ok(toml::to_string_pretty(self)?)
    }

    fn to_json(&self) -> Result<String, CliError> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Detection settings from an optional file, defaults otherwise.
pub fn load_config(path: Option<&str>) -> Result<DetectionConfig, CliError> {
    match path {
        Some(path) => Ok(DetectionConfig::from_file(path)?),
        None => Ok(DetectionConfig::default()),
    }
}

/// Describes how a configured history policy differs from the one a baseline
/// was built with. Records are judged by the baseline's policy.
pub fn policy_mismatch(configured: HistoryPolicy, baseline: HistoryPolicy) -> Option<String> {
    (configured != baseline).then(|| {
        format!(
            "config asks for {} samples over {} years but the baseline was built with {} samples over {} years; rebuild the baseline to apply the config policy",
            configured.min_samples, configured.min_years, baseline.min_samples, baseline.min_years
        )
    })
}

fn parse_index(name: &str) -> Result<SpectralIndex, CliError> {
    SpectralIndex::from_str(&name.to_lowercase()).map_err(|_| CliError::UnknownIndex(name.to_string()))
}

/// One historical index raster on disk.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct HistoricalEntry {
    pub date: NaiveDate,
    pub index: String,
    pub path: String,
}

/// Inputs of a baseline build
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct BaselineManifest {
    /// Where the baseline snapshot is written
    pub output: String,
    /// Detection config supplying the history policy
    pub config: Option<String>,
    /// Existing snapshot to extend instead of starting from scratch
    pub extend: Option<String>,
    /// Calendar months that must be covered; all months present when empty
    #[serde(default)]
    pub months: Vec<u32>,
    pub scenes: Vec<HistoricalEntry>,
}

impl Manifest for BaselineManifest {}

impl BaselineManifest {
    pub fn months(&self) -> Result<Vec<Month>, CliError> {
        Ok(self
            .months
            .iter()
            .map(|&m| Month::new(m))
            .collect::<Result<Vec<_>, _>>()?)
    }

    pub fn load_corpus(&self) -> Result<Vec<HistoricalScene>, CliError> {
        if self.scenes.is_empty() {
            return Err(CliError::EmptyCorpus);
        }
        self.scenes
            .iter()
            .map(|entry| {
                let index = parse_index(&entry.index)?;
                let raster = load_raster(&entry.path)?;
                Ok::<_, CliError>(HistoricalScene::new(entry.date, index, raster))
            })
            .collect()
    }
}

/// Index rasters of one acquisition, keyed by index name.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct ObservationEntry {
    pub date: NaiveDate,
    pub layers: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct DroughtEntry {
    /// First day of the period the value covers
    pub period_start: NaiveDate,
    /// SPI or an equivalent standardized drought index
    pub value: f64,
}

/// Inputs of a detection run
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct DetectionManifest {
    /// Baseline snapshot produced by `build-baseline`
    pub baseline: String,
    pub config: Option<String>,
    /// Alert GeoJSON; existing alerts are kept and never re-published
    pub alerts: String,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
    pub scenes: Vec<ObservationEntry>,
    #[serde(default)]
    pub drought: Vec<DroughtEntry>,
}

impl Manifest for DetectionManifest {}

impl DetectionManifest {
    pub fn period(&self) -> Result<DetectionPeriod, CliError> {
        Ok(DetectionPeriod::new(self.period_start, self.period_end)?)
    }

    pub fn drought_series(&self) -> DroughtSeries {
        self.drought.iter().map(|d| (d.period_start, d.value)).collect()
    }

    /// Every scene is read before any detection runs, so a bad input aborts
    /// the whole run.
    pub fn load_scenes(&self) -> Result<Vec<SceneObservation>, CliError> {
        if self.scenes.is_empty() {
            return Err(CliError::EmptyCorpus);
        }
        self.scenes
            .iter()
            .map(|entry| {
                entry
                    .layers
                    .iter()
                    .try_fold(SceneObservation::new(entry.date), |scene, (name, path)| {
                        Ok::<_, CliError>(scene.with_layer(parse_index(name)?, load_raster(path)?))
                    })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use canopy::{io::raster::save_raster, GeoTransform, GridSpec, Raster};

    const DETECTION: &str = r#"
        baseline = "baseline.json"
        alerts = "alerts.geojson"
        period_start = "2024-01-01"
        period_end = "2024-01-16"

        [[scenes]]
        date = "2024-01-08"
        layers = { ndmi = "ndmi.json", NBR = "nbr.json" }

        [[drought]]
        period_start = "2024-01-01"
        value = -1.7
    "#;

    #[test]
    fn test_detection_manifest_from_toml() {
        let manifest = DetectionManifest::from_toml(DETECTION).unwrap();
        assert_eq!(manifest.scenes.len(), 1);
        assert_eq!(manifest.config, None);
        assert!(manifest.period().unwrap().contains(NaiveDate::from_ymd_opt(2024, 1, 8).unwrap()));

        let state = manifest
            .drought_series()
            .state_or_normal(NaiveDate::from_ymd_opt(2024, 1, 8).unwrap());
        assert_eq!(state.severity, canopy::DroughtSeverity::Severe);
    }

    #[test]
    fn test_manifest_round_trips_through_json() {
        let manifest = DetectionManifest::from_toml(DETECTION).unwrap();
        let json = manifest.to_json().unwrap();
        assert_eq!(DetectionManifest::from_json(&json).unwrap(), manifest);
    }

    #[test]
    fn test_policy_mismatch() {
        let baseline = HistoryPolicy::default();
        assert_eq!(policy_mismatch(baseline, baseline), None);

        let stricter = HistoryPolicy { min_samples: 3, min_years: 5 };
        let message = policy_mismatch(stricter, baseline).unwrap();
        assert!(message.contains("3 samples over 5 years"));
        assert!(message.contains("3 samples over 3 years"));
    }

    #[test]
    fn test_unsupported_extension() {
        assert!(matches!(
            BaselineManifest::from_file("manifest.yaml"),
            Err(CliError::UnsupportedFileFormat)
        ));
    }

    #[test]
    fn test_load_scenes_reads_rasters() {
        let dir = tempfile::tempdir().unwrap();
        let grid = GridSpec::new(3, 2, GeoTransform::new(0.0, 60.0, 10.0, -10.0), "EPSG:32724");
        let ndmi = dir.path().join("ndmi.json");
        let nbr = dir.path().join("nbr.json");
        save_raster(&ndmi, &Raster::filled(grid.clone(), 0.3)).unwrap();
        save_raster(&nbr, &Raster::filled(grid, 0.2)).unwrap();

        let manifest = DetectionManifest {
            baseline: "baseline.json".into(),
            config: None,
            alerts: "alerts.geojson".into(),
            period_start: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            period_end: NaiveDate::from_ymd_opt(2024, 1, 16).unwrap(),
            scenes: vec![ObservationEntry {
                date: NaiveDate::from_ymd_opt(2024, 1, 8).unwrap(),
                layers: BTreeMap::from([
                    ("ndmi".to_string(), ndmi.display().to_string()),
                    ("nbr".to_string(), nbr.display().to_string()),
                ]),
            }],
            drought: Vec::new(),
        };

        let scenes = manifest.load_scenes().unwrap();
        assert_eq!(scenes.len(), 1);
        assert_eq!(scenes[0].layer(SpectralIndex::Nbr).unwrap().get(1, 2), Some(0.2));
    }

    #[test]
    fn test_unknown_index_is_reported() {
        let manifest = BaselineManifest {
            output: "baseline.json".into(),
            config: None,
            extend: None,
            months: vec![1],
            scenes: vec![HistoricalEntry {
                date: NaiveDate::from_ymd_opt(2020, 1, 5).unwrap(),
                index: "ndvi".into(),
                path: "missing.json".into(),
            }],
        };
        assert!(matches!(manifest.load_corpus(), Err(CliError::UnknownIndex(_))));
        assert_eq!(manifest.months().unwrap(), vec![Month::new(1).unwrap()]);
    }
}
