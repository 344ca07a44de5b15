use geo::{Area, Simplify};
use geo_types::{MultiPolygon, Polygon};

use crate::{
    error::{CanopyError, Result},
    traits::GeometryPostProcessor,
};

/// Douglas-Peucker simplifier using geo crate's implementation.
///
/// Traced boundaries only have corner vertices, so this matters mostly for
/// long diagonal staircases. Tolerance is in CRS units.
#[derive(Debug, Clone)]
pub struct DouglasPeuckerSimplifier {
    pub tolerance: f64,
}

impl Default for DouglasPeuckerSimplifier {
    fn default() -> Self {
        Self { tolerance: 5.0 }
    }
}

impl GeometryPostProcessor for DouglasPeuckerSimplifier {
    fn process(&self, geometry: &mut MultiPolygon<f64>) -> Result<()> {
        let simplified = geometry.simplify(&self.tolerance);
        // Keep the original when simplification collapses a polygon
        if simplified.0.len() == geometry.0.len() && simplified.0.iter().all(|p| p.unsigned_area() > 0.0) {
            *geometry = simplified;
        }
        Ok(())
    }
}

/// Geometry validation using basic checks
#[derive(Debug, Clone, Default)]
pub struct GeometryValidator;

impl GeometryPostProcessor for GeometryValidator {
    fn process(&self, geometry: &mut MultiPolygon<f64>) -> Result<()> {
        if geometry.0.is_empty() {
            return Err(CanopyError::GeometricComputation("empty geometry".into()));
        }

        for polygon in &geometry.0 {
            // Closed ring needs at least four coordinates
            if polygon.exterior().0.len() < 4 {
                return Err(CanopyError::GeometricComputation(format!(
                    "exterior ring has {} coordinates",
                    polygon.exterior().0.len()
                )));
            }

            let has_invalid_coords = polygon
                .exterior()
                .coords()
                .chain(polygon.interiors().iter().flat_map(|ring| ring.coords()))
                .any(|c| !c.x.is_finite() || !c.y.is_finite());
            if has_invalid_coords {
                return Err(CanopyError::GeometricComputation("non-finite coordinate".into()));
            }
        }

        // Drop degenerate holes
        for polygon in &mut geometry.0 {
            if polygon.interiors().iter().any(|hole| hole.0.len() < 4) {
                let holes = polygon
                    .interiors()
                    .iter()
                    .filter(|hole| hole.0.len() >= 4)
                    .cloned()
                    .collect();
                *polygon = Polygon::new(polygon.exterior().clone(), holes);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo_types::{polygon, LineString};

    fn staircase() -> Polygon<f64> {
        polygon![
            (x: 0.0, y: 0.0),
            (x: 30.0, y: 0.0),
            (x: 30.0, y: 10.0),
            (x: 20.0, y: 10.0),
            (x: 20.0, y: 20.0),
            (x: 10.0, y: 20.0),
            (x: 10.0, y: 30.0),
            (x: 0.0, y: 30.0),
        ]
    }

    #[test]
    fn test_simplifier_reduces_staircase() {
        let mut geometry = MultiPolygon::new(vec![staircase()]);
        DouglasPeuckerSimplifier { tolerance: 8.0 }.process(&mut geometry).unwrap();
        assert!(geometry.0[0].exterior().0.len() < staircase().exterior().0.len());
    }

    #[test]
    fn test_zero_tolerance_keeps_geometry() {
        let mut geometry = MultiPolygon::new(vec![staircase()]);
        DouglasPeuckerSimplifier { tolerance: 0.0 }.process(&mut geometry).unwrap();
        assert_eq!(geometry, MultiPolygon::new(vec![staircase()]));
    }

    #[test]
    fn test_validator_rejects_bad_geometry() {
        let mut empty = MultiPolygon::<f64>::new(vec![]);
        assert!(GeometryValidator.process(&mut empty).is_err());

        let mut nan = MultiPolygon::new(vec![polygon![
            (x: 0.0, y: 0.0),
            (x: f64::NAN, y: 0.0),
            (x: 1.0, y: 1.0),
        ]]);
        assert!(GeometryValidator.process(&mut nan).is_err());

        let mut good = MultiPolygon::new(vec![staircase()]);
        assert!(GeometryValidator.process(&mut good).is_ok());
    }

    #[test]
    fn test_validator_drops_degenerate_hole() {
        let square = polygon![
            (x: 0.0, y: 0.0),
            (x: 40.0, y: 0.0),
            (x: 40.0, y: 40.0),
            (x: 0.0, y: 40.0),
        ];
        let real_hole = LineString::from(vec![(10.0, 10.0), (10.0, 20.0), (20.0, 20.0), (20.0, 10.0), (10.0, 10.0)]);
        let sliver = LineString::from(vec![(30.0, 30.0), (31.0, 31.0)]);
        let mut geometry = MultiPolygon::new(vec![Polygon::new(
            square.exterior().clone(),
            vec![real_hole.clone(), sliver],
        )]);

        GeometryValidator.process(&mut geometry).unwrap();
        assert_eq!(geometry.0[0].interiors(), &[real_hole]);
        assert_eq!(geometry.0[0].exterior(), square.exterior());
    }
}
