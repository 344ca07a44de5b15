//! Alert records built from candidate regions.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use chrono::NaiveDate;
use geo_types::MultiPolygon;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use strum::IntoEnumIterator;
use tracing::{debug, info};
use ts_rs::TS;

use crate::{
    drought::DroughtState,
    error::Result,
    io,
    scoring::AnomalyLayer,
    types::{ConfidenceTier, DetectionPeriod, Month, SpectralIndex, ZScoreSummary},
    vectorize::CandidateRegion,
};

const ALERT_ID_HEX_LEN: usize = 32;

/// Vertices are hashed at millimetre resolution (CRS in metres).
const ID_COORD_SCALE: f64 = 1000.0;

/// Stable alert identity derived from geometry and detection period.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema, TS)]
#[ts(export)]
pub struct AlertId(String);

impl AlertId {
    pub fn compute(period: &DetectionPeriod, geometry: &MultiPolygon<f64>) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(period.to_string().as_bytes());

        for polygon in &geometry.0 {
            let rings = std::iter::once(polygon.exterior()).chain(polygon.interiors());
            for ring in rings {
                hasher.update((ring.0.len() as u64).to_le_bytes());
                for coord in ring.coords() {
                    hasher.update(((coord.x * ID_COORD_SCALE).round() as i64).to_le_bytes());
                    hasher.update(((coord.y * ID_COORD_SCALE).round() as i64).to_le_bytes());
                }
            }
        }

        let mut hex = format!("{:x}", hasher.finalize());
        hex.truncate(ALERT_ID_HEX_LEN);
        Self(hex)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for AlertId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for AlertId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Alert {
    pub id: AlertId,
    /// MultiPolygon in the raster CRS
    pub geometry: MultiPolygon<f64>,
    pub tier: ConfidenceTier,
    pub area_ha: f64,
    pub pixel_count: usize,
    pub detection_date: NaiveDate,
    pub period: DetectionPeriod,
    pub baseline_month: Month,
    /// Per-index z summaries over member pixels; EVI2 is advisory only
    pub zscores: BTreeMap<SpectralIndex, ZScoreSummary>,
    pub drought: DroughtState,
}

/// Run-wide facts stamped onto every alert.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EmissionContext {
    pub detection_date: NaiveDate,
    pub period: DetectionPeriod,
    pub baseline_month: Month,
    pub drought: DroughtState,
}

/// Most severe first, then largest, then by id.
pub fn alert_order(a: &Alert, b: &Alert) -> Ordering {
    b.tier
        .cmp(&a.tier)
        .then_with(|| b.area_ha.total_cmp(&a.area_ha))
        .then_with(|| a.id.cmp(&b.id))
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AlertEmitter;

impl AlertEmitter {
    pub fn new() -> Self {
        Self
    }

    /// One alert per region, in deterministic order. Empty input is a valid,
    /// empty result.
    pub fn emit(&self, regions: &[CandidateRegion], layers: &[&AnomalyLayer], context: &EmissionContext) -> Vec<Alert> {
        let mut alerts: Vec<Alert> = regions
            .iter()
            .map(|region| self.alert_for(region, layers, context))
            .collect();
        alerts.sort_by(alert_order);

        debug!(count = alerts.len(), period = %context.period, "Emitted alerts");
        alerts
    }

    fn alert_for(&self, region: &CandidateRegion, layers: &[&AnomalyLayer], context: &EmissionContext) -> Alert {
        let zscores = layers
            .iter()
            .filter_map(|layer| {
                let width = layer.grid.width;
                let values = region
                    .members
                    .iter()
                    .filter_map(|&offset| layer.z(offset / width, offset % width));
                ZScoreSummary::from_values(values).map(|summary| (layer.index, summary))
            })
            .collect();

        Alert {
            id: AlertId::compute(&context.period, &region.geometry),
            geometry: region.geometry.clone(),
            tier: region.tier,
            area_ha: region.area_ha(),
            pixel_count: region.pixel_count,
            detection_date: context.detection_date,
            period: context.period,
            baseline_month: context.baseline_month,
            zscores,
            drought: context.drought,
        }
    }
}

/// Totals over a set of alerts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema, TS)]
#[ts(export)]
pub struct AlertSummary {
    pub total_alerts: usize,
    /// Rounded to two decimals
    pub total_area_ha: f64,
    /// Every tier is present, zero when absent
    pub by_tier: BTreeMap<ConfidenceTier, usize>,
}

impl AlertSummary {
    pub fn from_alerts(alerts: &[Alert]) -> Self {
        let mut by_tier: BTreeMap<ConfidenceTier, usize> = ConfidenceTier::iter().map(|t| (t, 0)).collect();
        for alert in alerts {
            *by_tier.entry(alert.tier).or_insert(0) += 1;
        }
        let total_area: f64 = alerts.iter().map(|a| a.area_ha).sum();

        Self {
            total_alerts: alerts.len(),
            total_area_ha: (total_area * 100.0).round() / 100.0,
            by_tier,
        }
    }
}

/// Alerts already published, keyed by id, so re-running a period never
/// publishes the same alert twice.
#[derive(Debug, Clone, Default)]
pub struct AlertLedger {
    alerts: BTreeMap<AlertId, Alert>,
    crs: Option<String>,
}

impl AlertLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a ledger from GeoJSON; a missing file is an empty ledger.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::new());
        }
        let (alerts, crs) = io::geojson::load_alerts(path)?;
        debug!(count = alerts.len(), path = %path.display(), "Loaded alert ledger");
        Ok(Self {
            alerts: alerts.into_iter().map(|alert| (alert.id.clone(), alert)).collect(),
            crs,
        })
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        io::geojson::save_alerts(path, &self.alerts(), self.crs.as_deref())
    }

    /// CRS of the stored geometries, written to the GeoJSON foreign members.
    pub fn set_crs(&mut self, crs: impl Into<String>) {
        self.crs = Some(crs.into());
    }

    pub fn crs(&self) -> Option<&str> {
        self.crs.as_deref()
    }

    /// Store alerts and return those not seen before, in the order given.
    pub fn record(&mut self, alerts: Vec<Alert>) -> Vec<Alert> {
        let mut fresh = Vec::new();
        for alert in alerts {
            if self.alerts.contains_key(&alert.id) {
                continue;
            }
            self.alerts.insert(alert.id.clone(), alert.clone());
            fresh.push(alert);
        }
        info!(new = fresh.len(), total = self.alerts.len(), "Recorded alerts in ledger");
        fresh
    }

    pub fn contains(&self, id: &AlertId) -> bool {
        self.alerts.contains_key(id)
    }

    pub fn get(&self, id: &AlertId) -> Option<&Alert> {
        self.alerts.get(id)
    }

    pub fn len(&self) -> usize {
        self.alerts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.alerts.is_empty()
    }

    /// All stored alerts in publication order.
    pub fn alerts(&self) -> Vec<Alert> {
        let mut alerts: Vec<Alert> = self.alerts.values().cloned().collect();
        alerts.sort_by(alert_order);
        alerts
    }

    pub fn summary(&self) -> AlertSummary {
        AlertSummary::from_alerts(&self.alerts())
    }
}
