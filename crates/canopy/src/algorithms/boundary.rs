//! Pixel-edge boundary tracing for labeled regions.
//!
//! Every member pixel contributes the directed unit edges it shares with
//! non-members, oriented so the member lies on the right (clockwise on screen,
//! y growing downwards). Chaining those edges yields closed rings: exteriors
//! have positive signed area in lattice coordinates, holes negative. Where two
//! pixels touch only at a corner, the tightest right turn is taken so member
//! pixels are never joined through the pinch; a ring that still revisits a
//! vertex is then cut into simple loops at that vertex.

use std::collections::HashMap;

use geo::{Contains, Orient, orient::Direction};
use geo_types::{Coord, LineString, MultiPolygon, Point, Polygon};

use crate::{
    algorithms::RegionLabels,
    error::{CanopyError, Result},
    raster::GeoTransform,
};

/// Pixel corner as (col, row).
pub type LatticePoint = (i64, i64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Edge {
    from: LatticePoint,
    to: LatticePoint,
}

impl Edge {
    fn direction(&self) -> (i64, i64) {
        (self.to.0 - self.from.0, self.to.1 - self.from.1)
    }
}

/// A traced polygon in lattice coordinates (rings are implicitly closed).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LatticePolygon {
    pub exterior: Vec<LatticePoint>,
    pub holes: Vec<Vec<LatticePoint>>,
}

impl LatticePolygon {
    /// Area in pixels.
    pub fn pixel_area(&self) -> i64 {
        (twice_signed_area(&self.exterior) + self.holes.iter().map(|h| twice_signed_area(h)).sum::<i64>()) / 2
    }

    pub fn to_geo(&self, transform: &GeoTransform) -> Polygon<f64> {
        let ring = |points: &[LatticePoint]| {
            let mut coords: Vec<Coord<f64>> = points
                .iter()
                .map(|&(col, row)| {
                    let (x, y) = transform.lattice_to_geo(col as f64, row as f64);
                    Coord { x, y }
                })
                .collect();
            if let Some(&first) = coords.first() {
                coords.push(first);
            }
            LineString::new(coords)
        };
        Polygon::new(
            ring(&self.exterior),
            self.holes.iter().map(|hole| ring(hole)).collect(),
        )
    }
}

/// Convert traced polygons to CRS coordinates with exteriors counter-clockwise
/// and holes clockwise.
pub fn to_multipolygon(polygons: &[LatticePolygon], transform: &GeoTransform) -> MultiPolygon<f64> {
    MultiPolygon::new(polygons.iter().map(|p| p.to_geo(transform)).collect()).orient(Direction::Default)
}

/// Trace the boundary of region `label` whose member pixels (flat row-major
/// indices) are `members`.
pub fn trace_region(labels: &RegionLabels, label: u32, members: &[usize]) -> Result<Vec<LatticePolygon>> {
    let width = labels.width();
    if width == 0 || members.is_empty() {
        return Ok(Vec::new());
    }

    let is_member = |row: i64, col: i64| {
        row >= 0 && col >= 0 && labels.get(row as usize, col as usize) == label
    };

    let mut edges = Vec::new();
    for &offset in members {
        let (r, c) = ((offset / width) as i64, (offset % width) as i64);
        if !is_member(r - 1, c) {
            edges.push(Edge { from: (c, r), to: (c + 1, r) });
        }
        if !is_member(r, c + 1) {
            edges.push(Edge { from: (c + 1, r), to: (c + 1, r + 1) });
        }
        if !is_member(r + 1, c) {
            edges.push(Edge { from: (c + 1, r + 1), to: (c, r + 1) });
        }
        if !is_member(r, c - 1) {
            edges.push(Edge { from: (c, r + 1), to: (c, r) });
        }
    }

    let rings = chain_rings(&edges)?;
    assemble(rings)
}

fn chain_rings(edges: &[Edge]) -> Result<Vec<Vec<LatticePoint>>> {
    let mut outgoing: HashMap<LatticePoint, Vec<usize>> = HashMap::new();
    for (i, edge) in edges.iter().enumerate() {
        outgoing.entry(edge.from).or_default().push(i);
    }

    let mut used = vec![false; edges.len()];
    let mut rings = Vec::new();

    for start in 0..edges.len() {
        if used[start] {
            continue;
        }
        used[start] = true;
        let mut ring = vec![edges[start].from];
        let mut current = start;

        loop {
            let edge = edges[current];
            let candidates = outgoing.get(&edge.to).map(Vec::as_slice).unwrap_or(&[]);
            let next = match candidates {
                [only] => *only,
                [_, _] => {
                    let (dx, dy) = edge.direction();
                    let right_turn = (-dy, dx);
                    candidates
                        .iter()
                        .copied()
                        .find(|&i| edges[i].direction() == right_turn)
                        .ok_or_else(|| {
                            CanopyError::GeometricComputation(format!(
                                "no right turn available at vertex {:?}",
                                edge.to
                            ))
                        })?
                }
                _ => {
                    return Err(CanopyError::GeometricComputation(format!(
                        "vertex {:?} has {} outgoing edges",
                        edge.to,
                        candidates.len()
                    )));
                }
            };

            if next == start {
                break;
            }
            if used[next] {
                return Err(CanopyError::GeometricComputation(format!(
                    "boundary edge from {:?} visited twice",
                    edges[next].from
                )));
            }
            used[next] = true;
            ring.push(edges[next].from);
            current = next;
        }

        rings.extend(split_at_repeats(&ring).iter().map(|loop_| drop_collinear(loop_)));
    }

    Ok(rings)
}

/// Cut a closed vertex walk into simple loops wherever a vertex repeats.
fn split_at_repeats(ring: &[LatticePoint]) -> Vec<Vec<LatticePoint>> {
    let mut loops = Vec::new();
    let mut stack: Vec<LatticePoint> = Vec::with_capacity(ring.len());
    let mut position: HashMap<LatticePoint, usize> = HashMap::new();

    for &vertex in ring {
        if let Some(&p) = position.get(&vertex) {
            let closed: Vec<LatticePoint> = stack.drain(p..).collect();
            for v in &closed {
                position.remove(v);
            }
            loops.push(closed);
        }
        position.insert(vertex, stack.len());
        stack.push(vertex);
    }
    if !stack.is_empty() {
        loops.push(stack);
    }
    loops
}

/// Keep only vertices where the direction changes.
fn drop_collinear(ring: &[LatticePoint]) -> Vec<LatticePoint> {
    let n = ring.len();
    (0..n)
        .filter(|&i| {
            let prev = ring[(i + n - 1) % n];
            let here = ring[i];
            let next = ring[(i + 1) % n];
            let incoming = ((here.0 - prev.0).signum(), (here.1 - prev.1).signum());
            let outgoing = ((next.0 - here.0).signum(), (next.1 - here.1).signum());
            incoming != outgoing
        })
        .map(|i| ring[i])
        .collect()
}

/// Shoelace sum; positive for rings with members on the right (y-down).
fn twice_signed_area(ring: &[LatticePoint]) -> i64 {
    let n = ring.len();
    (0..n)
        .map(|i| {
            let (x0, y0) = ring[i];
            let (x1, y1) = ring[(i + 1) % n];
            x0 * y1 - x1 * y0
        })
        .sum()
}

/// Centre of the pixel just left of the ring's first edge, i.e. outside the region.
fn hole_sample_point(ring: &[LatticePoint]) -> Point<f64> {
    let (x0, y0) = ring[0];
    let (x1, y1) = ring[1 % ring.len()];
    let (dx, dy) = ((x1 - x0).signum() as f64, (y1 - y0).signum() as f64);
    Point::new(x0 as f64 + 0.5 * dx + 0.5 * dy, y0 as f64 + 0.5 * dy - 0.5 * dx)
}

fn lattice_polygon(ring: &[LatticePoint]) -> Polygon<f64> {
    let coords: Vec<Coord<f64>> = ring
        .iter()
        .map(|&(x, y)| Coord { x: x as f64, y: y as f64 })
        .collect();
    Polygon::new(LineString::new(coords), vec![])
}

/// Pair every hole with the smallest exterior that contains it.
fn assemble(rings: Vec<Vec<LatticePoint>>) -> Result<Vec<LatticePolygon>> {
    let (exteriors, holes): (Vec<_>, Vec<_>) = rings
        .into_iter()
        .map(|ring| (twice_signed_area(&ring), ring))
        .partition(|(area, _)| *area > 0);

    let shapes: Vec<Polygon<f64>> = exteriors.iter().map(|(_, ring)| lattice_polygon(ring)).collect();
    let mut polygons: Vec<LatticePolygon> = exteriors
        .iter()
        .map(|(_, ring)| LatticePolygon {
            exterior: ring.clone(),
            holes: Vec::new(),
        })
        .collect();

    for (_, hole) in holes {
        let sample = hole_sample_point(&hole);
        let owner = exteriors
            .iter()
            .enumerate()
            .filter(|(i, _)| shapes[*i].contains(&sample))
            .min_by_key(|(_, (area, _))| *area)
            .map(|(i, _)| i)
            .ok_or_else(|| {
                CanopyError::GeometricComputation(format!(
                    "hole starting at {:?} lies outside every exterior ring",
                    hole.first()
                ))
            })?;
        polygons[owner].holes.push(hole);
    }

    Ok(polygons)
}
