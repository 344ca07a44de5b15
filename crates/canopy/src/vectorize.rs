//! Tier raster → candidate alert regions with polygon geometry.

use geo_types::MultiPolygon;
use rayon::prelude::*;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    algorithms::{
        trace_region, to_multipolygon, DouglasPeuckerSimplifier, FullExtentLabeler, GeometryValidator,
        RegionLabels, TiledLabeler,
    },
    classify::TierRaster,
    error::Result,
    traits::{GeometryPostProcessor, RegionLabeler},
    types::{ConfidenceTier, PixelCoord},
};

pub const SQUARE_METRES_PER_HECTARE: f64 = 10_000.0;
pub const DEFAULT_MIN_AREA_HA: f64 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum LabelingStrategy {
    /// One pass over the whole raster
    #[default]
    FullExtent,
    /// Parallel horizontal stripes stitched at the seams
    Tiled { stripe_rows: usize },
}

impl LabelingStrategy {
    pub fn labeler(&self) -> Box<dyn RegionLabeler> {
        match *self {
            Self::FullExtent => Box::new(FullExtentLabeler),
            Self::Tiled { stripe_rows } => Box::new(TiledLabeler::new(stripe_rows)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct VectorizeConfig {
    /// Regions smaller than this are discarded; exactly this size is kept
    pub min_area_ha: f64,
    pub labeling: LabelingStrategy,
    /// Douglas-Peucker tolerance in CRS units, off when absent
    pub simplify_tolerance: Option<f64>,
    pub validate_geometry: bool,
}

impl Default for VectorizeConfig {
    fn default() -> Self {
        Self {
            min_area_ha: DEFAULT_MIN_AREA_HA,
            labeling: LabelingStrategy::default(),
            simplify_tolerance: None,
            validate_geometry: true,
        }
    }
}

/// Inclusive pixel bounding box.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PixelBounds {
    pub min_row: usize,
    pub min_col: usize,
    pub max_row: usize,
    pub max_col: usize,
}

/// One connected anomalous region that passed the area filter.
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateRegion {
    /// Canonical label (1-based, row-major order of first pixel)
    pub label: u32,
    /// First member pixel in row-major order
    pub anchor: PixelCoord,
    pub pixel_count: usize,
    pub bounds: PixelBounds,
    /// Most severe tier among member pixels
    pub tier: ConfidenceTier,
    /// Row-major flat indices of member pixels
    pub members: Vec<usize>,
    pub geometry: MultiPolygon<f64>,
    pub area_m2: f64,
}

impl CandidateRegion {
    pub fn area_ha(&self) -> f64 {
        self.area_m2 / SQUARE_METRES_PER_HECTARE
    }
}

#[derive(Debug)]
pub struct Vectorizer {
    labeler: Box<dyn RegionLabeler>,
    postprocessors: Vec<Box<dyn GeometryPostProcessor>>,
    min_area_ha: f64,
}

impl Default for Vectorizer {
    fn default() -> Self {
        Self::new(Box::new(FullExtentLabeler), DEFAULT_MIN_AREA_HA)
    }
}

impl Vectorizer {
    pub fn new(labeler: Box<dyn RegionLabeler>, min_area_ha: f64) -> Self {
        Self {
            labeler,
            postprocessors: Vec::new(),
            min_area_ha,
        }
    }

    pub fn from_config(config: &VectorizeConfig) -> Self {
        let mut vectorizer = Self::new(config.labeling.labeler(), config.min_area_ha);
        if let Some(tolerance) = config.simplify_tolerance {
            vectorizer = vectorizer.with_postprocessor(Box::new(DouglasPeuckerSimplifier { tolerance }));
        }
        if config.validate_geometry {
            vectorizer = vectorizer.with_postprocessor(Box::new(GeometryValidator));
        }
        vectorizer
    }

    pub fn with_postprocessor(mut self, postprocessor: Box<dyn GeometryPostProcessor>) -> Self {
        self.postprocessors.push(postprocessor);
        self
    }

    pub fn min_area_ha(&self) -> f64 {
        self.min_area_ha
    }

    /// Regions in canonical label order. Identical input always produces
    /// identical regions and geometry.
    pub fn vectorize(&self, tiers: &TierRaster) -> Result<Vec<CandidateRegion>> {
        let labels = self.labeler.label(tiers)?;
        let cell_area = tiers.grid.transform.cell_area();
        let members = labels.members();
        let found = members.len();

        let regions = members
            .into_par_iter()
            .enumerate()
            .filter(|(_, members)| members.len() as f64 * cell_area / SQUARE_METRES_PER_HECTARE >= self.min_area_ha)
            .map(|(i, members)| self.build_region(tiers, &labels, i as u32 + 1, members, cell_area))
            .collect::<Result<Vec<_>>>()?;

        debug!(
            found,
            kept = regions.len(),
            min_area_ha = self.min_area_ha,
            "Vectorized anomalous regions"
        );
        Ok(regions)
    }

    fn build_region(
        &self,
        tiers: &TierRaster,
        labels: &RegionLabels,
        label: u32,
        members: Vec<usize>,
        cell_area: f64,
    ) -> Result<CandidateRegion> {
        let grid = &tiers.grid;
        let anchor = grid.pixel_at(members[0]);

        let mut bounds = PixelBounds {
            min_row: anchor.row,
            min_col: anchor.col,
            max_row: anchor.row,
            max_col: anchor.col,
        };
        let mut tier = ConfidenceTier::Low;
        for &offset in &members {
            let pixel = grid.pixel_at(offset);
            bounds.min_row = bounds.min_row.min(pixel.row);
            bounds.min_col = bounds.min_col.min(pixel.col);
            bounds.max_row = bounds.max_row.max(pixel.row);
            bounds.max_col = bounds.max_col.max(pixel.col);
            if let Some(t) = tiers.get(pixel.row, pixel.col) {
                tier = tier.max(t);
            }
        }

        let polygons = trace_region(labels, label, &members)?;
        let mut geometry = to_multipolygon(&polygons, &grid.transform);
        for postprocessor in &self.postprocessors {
            postprocessor.process(&mut geometry)?;
        }

        Ok(CandidateRegion {
            label,
            anchor,
            pixel_count: members.len(),
            bounds,
            tier,
            area_m2: members.len() as f64 * cell_area,
            members,
            geometry,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raster::tests::test_grid;
    use geo::Area;

    /// 10 m cells: 100 pixels make exactly one hectare.
    fn block(width: usize, height: usize, fill: &[(usize, usize, usize, usize, ConfidenceTier)]) -> TierRaster {
        let mut tiers = vec![None; width * height];
        for &(r0, c0, rows, cols, tier) in fill {
            for r in r0..r0 + rows {
                for c in c0..c0 + cols {
                    tiers[r * width + c] = Some(tier);
                }
            }
        }
        TierRaster::from_tiers(test_grid(width, height), &tiers).unwrap()
    }

    #[test]
    fn test_region_below_minimum_area_is_dropped() {
        // 0.5 ha
        let tiers = block(20, 20, &[(0, 0, 5, 10, ConfidenceTier::High)]);
        assert!(Vectorizer::default().vectorize(&tiers).unwrap().is_empty());
    }

    #[test]
    fn test_region_of_exactly_one_hectare_is_kept() {
        let tiers = block(20, 20, &[(3, 3, 10, 10, ConfidenceTier::Medium)]);
        let regions = Vectorizer::default().vectorize(&tiers).unwrap();
        assert_eq!(regions.len(), 1);
        assert_eq!(regions[0].area_ha(), 1.0);
        assert_eq!(regions[0].pixel_count, 100);
        assert!((regions[0].geometry.unsigned_area() - 10_000.0).abs() < 1e-6);
    }

    #[test]
    fn test_large_region_is_kept_with_strictest_tier() {
        // 1.5 ha of Medium with a High core
        let tiers = block(
            30,
            30,
            &[
                (0, 0, 10, 15, ConfidenceTier::Medium),
                (4, 4, 2, 2, ConfidenceTier::High),
            ],
        );
        let regions = Vectorizer::default().vectorize(&tiers).unwrap();
        assert_eq!(regions.len(), 1);
        assert!((regions[0].area_ha() - 1.5).abs() < 1e-12);
        assert_eq!(regions[0].tier, ConfidenceTier::High);
        assert_eq!(regions[0].anchor, PixelCoord::new(0, 0));
        assert_eq!(
            regions[0].bounds,
            PixelBounds { min_row: 0, min_col: 0, max_row: 9, max_col: 14 }
        );
    }

    #[test]
    fn test_vectorize_is_idempotent_and_strategy_independent() {
        let tiers = block(
            40,
            40,
            &[
                (0, 0, 12, 12, ConfidenceTier::High),
                (12, 12, 12, 12, ConfidenceTier::Low),
                (30, 2, 10, 30, ConfidenceTier::Medium),
            ],
        );
        let full = Vectorizer::default();
        let tiled = Vectorizer::new(Box::new(TiledLabeler::new(7)), DEFAULT_MIN_AREA_HA);

        let first = full.vectorize(&tiers).unwrap();
        assert_eq!(first, full.vectorize(&tiers).unwrap());
        assert_eq!(first, tiled.vectorize(&tiers).unwrap());
        // Diagonal contact joins the two blocks into one region of two polygons
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].geometry.0.len(), 2);
    }

    #[test]
    fn test_region_with_hole_keeps_it() {
        let mut tiers = block(20, 20, &[(0, 0, 12, 12, ConfidenceTier::Low)]);
        tiers.codes[(5, 5)] = 0;
        tiers.codes[(5, 6)] = 0;
        let regions = Vectorizer::default().vectorize(&tiers).unwrap();
        assert_eq!(regions.len(), 1);
        assert_eq!(regions[0].geometry.0[0].interiors().len(), 1);
        assert!((regions[0].geometry.unsigned_area() - 142.0 * 100.0).abs() < 1e-6);
    }

    #[test]
    fn test_config_builds_postprocessors() {
        let config = VectorizeConfig {
            simplify_tolerance: Some(1.0),
            labeling: LabelingStrategy::Tiled { stripe_rows: 4 },
            ..VectorizeConfig::default()
        };
        let tiers = block(20, 20, &[(2, 2, 12, 12, ConfidenceTier::High)]);
        let regions = Vectorizer::from_config(&config).vectorize(&tiers).unwrap();
        assert_eq!(regions.len(), 1);
        assert_eq!(regions[0].geometry.0[0].exterior().0.len(), 5);
    }
}
