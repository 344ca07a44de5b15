use std::collections::BTreeMap;
use std::marker::PhantomData;

use chrono::NaiveDate;
use geojson::{Geometry, JsonObject};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::{
    drought::DroughtSeverity,
    types::{ConfidenceTier, SpectralIndex, ZScoreSummary},
};

/// Properties for vegetation-loss alert features
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, TS, JsonSchema)]
#[ts(export)]
#[schemars(description = "Properties for vegetation-loss alert features")]
pub struct AlertProperties {
    #[schemars(description = "Stable identifier derived from geometry and detection period")]
    pub id: String,
    #[schemars(description = "Confidence tier (most severe tier among member pixels)")]
    pub tier: ConfidenceTier,
    #[schemars(description = "Numeric tier code: 1 low, 2 medium, 3 high")]
    pub confidence: u8,
    #[schemars(description = "Area of the region in hectares")]
    pub area_ha: f64,
    #[schemars(description = "Number of member pixels")]
    pub pixel_count: usize,
    #[schemars(description = "Acquisition date of the scene that raised the alert")]
    pub detection_date: NaiveDate,
    #[schemars(description = "First day of the detection period")]
    pub period_start: NaiveDate,
    #[schemars(description = "Last day of the detection period")]
    pub period_end: NaiveDate,
    #[schemars(description = "Calendar month (1-12) of the baseline used")]
    pub baseline_month: u32,
    #[schemars(description = "Drought category used to widen thresholds")]
    pub drought_severity: DroughtSeverity,
    #[schemars(description = "Drought index value (SPI or equivalent)")]
    pub drought_index: f64,
    #[schemars(description = "Z-score summaries per spectral index over member pixels")]
    pub zscores: BTreeMap<SpectralIndex, ZScoreSummary>,
}

/// Type alias for alert GeoJSON
pub type AlertGeoJson = TypedGeoJson<AlertProperties>;

/// A typed GeoJSON Feature that is generic over its properties.
#[derive(Serialize, Deserialize, Debug)]
pub struct TypedFeature<P> {
    #[serde(flatten)]
    pub feature: geojson::Feature,
    #[serde(skip)]
    _properties: PhantomData<P>,
}

impl<P> TypedFeature<P>
where
    for<'de> P: Serialize + Deserialize<'de>,
{
    /// Creates a new TypedFeature.
    pub fn new(geometry: Option<Geometry>, properties: P) -> Self {
        let feature = geojson::Feature {
            bbox: None,
            geometry,
            id: None,
            properties: serde_json::to_value(properties).ok().and_then(|v| v.as_object().cloned()),
            foreign_members: None,
        };
        Self::from_feature(feature)
    }

    /// Wraps an untyped feature; properties are checked lazily.
    pub fn from_feature(feature: geojson::Feature) -> Self {
        Self {
            feature,
            _properties: PhantomData,
        }
    }

    /// Tries to access the typed properties of the feature.
    pub fn properties(&self) -> Option<P> {
        self.feature.properties.as_ref().and_then(|p| {
            serde_json::from_value(serde_json::Value::Object(p.clone())).ok()
        })
    }
}

#[derive(Serialize, Deserialize, Debug)]
pub struct TypedFeatureCollection<P> {
    pub bbox: Option<Vec<f64>>,
    pub features: Vec<TypedFeature<P>>,
    pub foreign_members: Option<JsonObject>,
}

#[derive(Serialize, Deserialize, Debug)]
pub enum TypedGeoJson<P> {
    Geometry(Geometry),
    Feature(TypedFeature<P>),
    FeatureCollection(TypedFeatureCollection<P>),
}

impl<P> TypedGeoJson<P> {
    /// Get the underlying FeatureCollection if this is a FeatureCollection variant
    pub fn as_feature_collection(&self) -> Option<&TypedFeatureCollection<P>> {
        match self {
            TypedGeoJson::FeatureCollection(fc) => Some(fc),
            _ => None,
        }
    }

    /// Convert to FeatureCollection, consuming self
    pub fn into_feature_collection(self) -> Option<TypedFeatureCollection<P>> {
        match self {
            TypedGeoJson::FeatureCollection(fc) => Some(fc),
            _ => None,
        }
    }
}

impl<P> TypedFeatureCollection<P> {
    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    pub fn features(&self) -> &[TypedFeature<P>] {
        &self.features
    }
}

impl AlertGeoJson {
    fn typed_features(&self) -> impl Iterator<Item = AlertProperties> + '_ {
        self.as_feature_collection()
            .into_iter()
            .flat_map(|fc| fc.features.iter())
            .filter_map(TypedFeature::properties)
    }

    /// Properties of alerts in the given tier
    pub fn alerts_with_tier(&self, tier: ConfidenceTier) -> Vec<AlertProperties> {
        self.typed_features().filter(|props| props.tier == tier).collect()
    }

    /// Properties of alerts whose area lies in `[min_ha, max_ha]`
    pub fn alerts_by_area_range(&self, min_ha: f64, max_ha: f64) -> Vec<AlertProperties> {
        self.typed_features()
            .filter(|props| props.area_ha >= min_ha && props.area_ha <= max_ha)
            .collect()
    }

    pub fn total_area_ha(&self) -> f64 {
        self.typed_features().map(|props| props.area_ha).sum()
    }

    /// Get CRS from foreign members
    pub fn crs(&self) -> Option<String> {
        self.as_feature_collection()?
            .foreign_members
            .as_ref()?
            .get("crs")?
            .as_str()
            .map(str::to_string)
    }

    /// Get alert count from foreign members
    pub fn alert_count(&self) -> Option<usize> {
        self.as_feature_collection()?
            .foreign_members
            .as_ref()
            .and_then(|foreign| foreign.get("alert_count"))
            .and_then(|v| v.as_u64())
            .map(|v| v as usize)
    }
}
