use std::path::Path;

use geo_types::{MultiPolygon, Polygon};
use geojson::{Feature, FeatureCollection, GeoJson, Geometry, Value};

use crate::{
    alerts::{Alert, AlertId, AlertSummary},
    drought::DroughtState,
    error::{CanopyError, Result},
    io::write_atomic,
    typed_geojson::{AlertGeoJson, AlertProperties, TypedFeature, TypedFeatureCollection, TypedGeoJson},
    types::{DetectionPeriod, Month},
};

impl Alert {
    pub fn properties(&self) -> AlertProperties {
        AlertProperties {
            id: self.id.to_string(),
            tier: self.tier,
            confidence: self.tier.code(),
            area_ha: self.area_ha,
            pixel_count: self.pixel_count,
            detection_date: self.detection_date,
            period_start: self.period.start,
            period_end: self.period.end,
            baseline_month: self.baseline_month.number(),
            drought_severity: self.drought.severity,
            drought_index: self.drought.index_value,
            zscores: self.zscores.clone(),
        }
    }

    pub fn to_feature(&self) -> Result<Feature> {
        let properties = serde_json::to_value(self.properties())?
            .as_object()
            .cloned()
            .ok_or_else(|| CanopyError::GeometricComputation("alert properties are not an object".into()))?;

        Ok(Feature {
            bbox: None,
            geometry: Some(Geometry::new(Value::from(&self.geometry))),
            id: Some(geojson::feature::Id::String(self.id.to_string())),
            properties: Some(properties),
            foreign_members: None,
        })
    }

    pub fn from_feature(feature: &Feature) -> Result<Self> {
        let typed = TypedFeature::<AlertProperties>::from_feature(feature.clone());
        let props = typed
            .properties()
            .ok_or_else(|| CanopyError::GeometricComputation("feature is missing alert properties".into()))?;

        let geometry = feature
            .geometry
            .as_ref()
            .ok_or_else(|| CanopyError::GeometricComputation(format!("alert {} has no geometry", props.id)))?;
        let geometry = match &geometry.value {
            Value::MultiPolygon(_) => MultiPolygon::<f64>::try_from(geometry.value.clone())?,
            Value::Polygon(_) => MultiPolygon::new(vec![Polygon::<f64>::try_from(geometry.value.clone())?]),
            _ => {
                return Err(CanopyError::GeometricComputation(format!(
                    "alert {} geometry is not a (multi)polygon",
                    props.id
                )));
            }
        };

        Ok(Alert {
            id: AlertId::from(props.id),
            geometry,
            tier: props.tier,
            area_ha: props.area_ha,
            pixel_count: props.pixel_count,
            detection_date: props.detection_date,
            period: DetectionPeriod::new(props.period_start, props.period_end)?,
            baseline_month: Month::new(props.baseline_month)?,
            zscores: props.zscores,
            drought: DroughtState {
                index_value: props.drought_index,
                severity: props.drought_severity,
            },
        })
    }
}

fn collection_members(alerts: &[Alert], crs: Option<&str>) -> Result<geojson::JsonObject> {
    let mut foreign_members = serde_json::Map::new();
    if let Some(crs) = crs {
        foreign_members.insert("crs".to_string(), serde_json::Value::String(crs.to_string()));
    }
    foreign_members.insert("alert_count".to_string(), serde_json::Value::from(alerts.len()));
    foreign_members.insert(
        "summary".to_string(),
        serde_json::to_value(AlertSummary::from_alerts(alerts))?,
    );
    Ok(foreign_members)
}

/// Export alerts to typed GeoJSON
pub fn alerts_to_typed_geojson(alerts: &[Alert], crs: Option<&str>) -> Result<AlertGeoJson> {
    let features = alerts
        .iter()
        .map(|alert| alert.to_feature().map(TypedFeature::from_feature))
        .collect::<Result<Vec<_>>>()?;

    Ok(TypedGeoJson::FeatureCollection(TypedFeatureCollection {
        bbox: None,
        features,
        foreign_members: Some(collection_members(alerts, crs)?),
    }))
}

pub fn alerts_to_geojson(alerts: &[Alert], crs: Option<&str>) -> Result<FeatureCollection> {
    let features = alerts.iter().map(Alert::to_feature).collect::<Result<Vec<_>>>()?;
    Ok(FeatureCollection {
        bbox: None,
        features,
        foreign_members: Some(collection_members(alerts, crs)?),
    })
}

/// Export to GeoJSON and serialize to JSON string
pub fn alerts_to_geojson_string(alerts: &[Alert], crs: Option<&str>) -> Result<String> {
    let collection = alerts_to_geojson(alerts, crs)?;
    Ok(serde_json::to_string_pretty(&collection)?)
}

/// Load alerts from a GeoJSON string; returns the CRS foreign member if present
pub fn alerts_from_geojson_str(geojson_str: &str) -> Result<(Vec<Alert>, Option<String>)> {
    let collection = match geojson_str.parse::<GeoJson>()? {
        GeoJson::FeatureCollection(fc) => fc,
        GeoJson::Feature(feature) => FeatureCollection {
            bbox: None,
            features: vec![feature],
            foreign_members: None,
        },
        GeoJson::Geometry(_) => {
            return Err(CanopyError::UnsupportedFileFormat(
                "expected a FeatureCollection of alerts, found a bare geometry".into(),
            ));
        }
    };

    let crs = collection
        .foreign_members
        .as_ref()
        .and_then(|members| members.get("crs"))
        .and_then(|v| v.as_str())
        .map(str::to_string);
    let alerts = collection
        .features
        .iter()
        .map(Alert::from_feature)
        .collect::<Result<Vec<_>>>()?;
    Ok((alerts, crs))
}

/// Save alerts to a GeoJSON file, replacing it atomically
pub fn save_alerts<P: AsRef<Path>>(path: P, alerts: &[Alert], crs: Option<&str>) -> Result<()> {
    let contents = alerts_to_geojson_string(alerts, crs)?;
    write_atomic(path.as_ref(), contents.as_bytes())
}

/// Load alerts from a GeoJSON file
pub fn load_alerts<P: AsRef<Path>>(path: P) -> Result<(Vec<Alert>, Option<String>)> {
    let geojson_str = std::fs::read_to_string(path)?;
    alerts_from_geojson_str(&geojson_str)
}
