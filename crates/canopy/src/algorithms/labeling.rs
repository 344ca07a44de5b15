//! Connected-component labeling of anomalous pixels (8-connectivity).

use imageproc::region_labelling::{connected_components, Connectivity};
use image::Luma;
use rayon::prelude::*;
use tracing::debug;

use crate::{
    classify::TierRaster,
    error::{CanopyError, Result},
    traits::RegionLabeler,
};

/// Neighbours already visited in a row-major sweep.
const PRIOR_NEIGHBORS: [(isize, isize); 4] = [(0, -1), (-1, -1), (-1, 0), (-1, 1)];

/// Canonical region labels: 0 is background, regions are numbered from 1 in
/// order of their first pixel in row-major order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionLabels {
    width: usize,
    height: usize,
    labels: Vec<u32>,
    region_count: u32,
}

impl RegionLabels {
    /// Renumber arbitrary component ids (0 = background) canonically.
    pub fn canonicalize(width: usize, height: usize, raw: &[u32]) -> Result<Self> {
        if raw.len() != width * height {
            return Err(CanopyError::MalformedRaster(format!(
                "label grid has {} cells, expected {}",
                raw.len(),
                width * height
            )));
        }

        let mut remap = std::collections::HashMap::new();
        let mut next = 0u32;
        let labels = raw
            .iter()
            .map(|&id| {
                if id == 0 {
                    0
                } else {
                    *remap.entry(id).or_insert_with(|| {
                        next += 1;
                        next
                    })
                }
            })
            .collect();

        Ok(Self {
            width,
            height,
            labels,
            region_count: next,
        })
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn region_count(&self) -> u32 {
        self.region_count
    }

    pub fn get(&self, row: usize, col: usize) -> u32 {
        if row < self.height && col < self.width {
            self.labels[row * self.width + col]
        } else {
            0
        }
    }

    pub fn as_slice(&self) -> &[u32] {
        &self.labels
    }

    /// Flat member indices per region, index 0 holding region 1.
    pub fn members(&self) -> Vec<Vec<usize>> {
        let mut members = vec![Vec::new(); self.region_count as usize];
        for (offset, &label) in self.labels.iter().enumerate() {
            if label > 0 {
                members[(label - 1) as usize].push(offset);
            }
        }
        members
    }
}

/// Single pass over the full extent using imageproc.
#[derive(Debug, Clone, Default)]
pub struct FullExtentLabeler;

impl RegionLabeler for FullExtentLabeler {
    fn label(&self, tiers: &TierRaster) -> Result<RegionLabels> {
        // imageproc's union-find panics on single-pixel images
        if tiers.grid.len() <= 1 {
            let raw: Vec<u32> = tiers.codes.iter().map(|&code| u32::from(code > 0)).collect();
            return RegionLabels::canonicalize(tiers.grid.width, tiers.grid.height, &raw);
        }
        let mask = tiers.to_mask_image();
        let components = connected_components(&mask, Connectivity::Eight, Luma([0u8]));
        RegionLabels::canonicalize(tiers.grid.width, tiers.grid.height, components.as_raw())
    }
}

/// Union-find arena with path halving and union by rank.
#[derive(Debug)]
struct UnionFind {
    parent: Vec<usize>,
    rank: Vec<u8>,
}

impl UnionFind {
    fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
            rank: vec![0; n],
        }
    }

    fn find(&mut self, mut x: usize) -> usize {
        while self.parent[x] != x {
            self.parent[x] = self.parent[self.parent[x]]; // path halving
            x = self.parent[x];
        }
        x
    }

    fn union(&mut self, a: usize, b: usize) {
        let ra = self.find(a);
        let rb = self.find(b);
        if ra == rb {
            return;
        }
        let (root, child) = if self.rank[ra] >= self.rank[rb] { (ra, rb) } else { (rb, ra) };
        self.parent[child] = root;
        if self.rank[root] == self.rank[child] {
            self.rank[root] += 1;
        }
    }
}

/// Horizontal stripe labeled independently.
struct Stripe {
    first_row: usize,
    rows: usize,
    /// Stripe-local component per pixel, `None` for background
    components: Vec<Option<usize>>,
    component_count: usize,
}

/// Labels horizontal stripes in parallel, then stitches components that touch
/// across each seam. Results are identical to [`FullExtentLabeler`].
#[derive(Debug, Clone)]
pub struct TiledLabeler {
    pub stripe_rows: usize,
}

impl Default for TiledLabeler {
    fn default() -> Self {
        Self { stripe_rows: 256 }
    }
}

impl TiledLabeler {
    pub fn new(stripe_rows: usize) -> Self {
        Self {
            stripe_rows: stripe_rows.max(1),
        }
    }

    fn label_stripe(tiers: &TierRaster, first_row: usize, rows: usize) -> Stripe {
        let width = tiers.grid.width;
        let anomalous = |r: usize, c: usize| tiers.is_anomalous(first_row + r, c);

        let mut uf = UnionFind::new(rows * width);
        for r in 0..rows {
            for c in 0..width {
                if !anomalous(r, c) {
                    continue;
                }
                for (dr, dc) in PRIOR_NEIGHBORS {
                    let nr = r as isize + dr;
                    let nc = c as isize + dc;
                    if nr < 0 || nc < 0 || nc >= width as isize {
                        continue;
                    }
                    let (nr, nc) = (nr as usize, nc as usize);
                    if anomalous(nr, nc) {
                        uf.union(r * width + c, nr * width + nc);
                    }
                }
            }
        }

        let mut root_ids = std::collections::HashMap::new();
        let mut components = vec![None; rows * width];
        for r in 0..rows {
            for c in 0..width {
                if anomalous(r, c) {
                    let root = uf.find(r * width + c);
                    let next = root_ids.len();
                    components[r * width + c] = Some(*root_ids.entry(root).or_insert(next));
                }
            }
        }

        Stripe {
            first_row,
            rows,
            components,
            component_count: root_ids.len(),
        }
    }
}

impl RegionLabeler for TiledLabeler {
    fn label(&self, tiers: &TierRaster) -> Result<RegionLabels> {
        let (width, height) = (tiers.grid.width, tiers.grid.height);
        let stripe_rows = self.stripe_rows.max(1);

        let starts: Vec<usize> = (0..height).step_by(stripe_rows).collect();
        let stripes: Vec<Stripe> = starts
            .into_par_iter()
            .map(|first_row| {
                let rows = stripe_rows.min(height - first_row);
                Self::label_stripe(tiers, first_row, rows)
            })
            .collect();

        let mut offsets = Vec::with_capacity(stripes.len());
        let mut total = 0;
        for stripe in &stripes {
            offsets.push(total);
            total += stripe.component_count;
        }

        let mut uf = UnionFind::new(total);
        for (i, pair) in stripes.windows(2).enumerate() {
            let (upper, lower) = (&pair[0], &pair[1]);
            let upper_row = (upper.rows - 1) * width;
            for c in 0..width {
                let Some(below) = lower.components[c] else {
                    continue;
                };
                for nc in c.saturating_sub(1)..=(c + 1).min(width - 1) {
                    if let Some(above) = upper.components[upper_row + nc] {
                        uf.union(offsets[i] + above, offsets[i + 1] + below);
                    }
                }
            }
        }

        let mut raw = vec![0u32; width * height];
        for (stripe, &offset) in stripes.iter().zip(&offsets) {
            let base = stripe.first_row * width;
            for (i, component) in stripe.components.iter().enumerate() {
                if let Some(local) = component {
                    raw[base + i] = uf.find(offset + local) as u32 + 1;
                }
            }
        }

        debug!(
            stripes = stripes.len(),
            stripe_rows,
            "Merged stripe labels across seams"
        );
        RegionLabels::canonicalize(width, height, &raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raster::tests::test_grid;
    use crate::types::ConfidenceTier;

    fn tiers_from_ascii(rows: &[&str]) -> TierRaster {
        let width = rows[0].len();
        let tiers: Vec<Option<ConfidenceTier>> = rows
            .iter()
            .flat_map(|row| row.chars())
            .map(|ch| match ch {
                'H' => Some(ConfidenceTier::High),
                'M' => Some(ConfidenceTier::Medium),
                'L' => Some(ConfidenceTier::Low),
                _ => None,
            })
            .collect();
        TierRaster::from_tiers(test_grid(width, rows.len()), &tiers).unwrap()
    }

    #[test]
    fn test_diagonal_pixels_are_connected() {
        let tiers = tiers_from_ascii(&["H..", ".L.", "..M"]);
        let labels = FullExtentLabeler.label(&tiers).unwrap();
        assert_eq!(labels.region_count(), 1);
        assert_eq!(labels.get(2, 2), 1);
    }

    #[test]
    fn test_labels_are_canonical() {
        let tiers = tiers_from_ascii(&["..HH", "L...", "L..M"]);
        let labels = FullExtentLabeler.label(&tiers).unwrap();
        assert_eq!(labels.region_count(), 3);
        assert_eq!(labels.get(0, 2), 1);
        assert_eq!(labels.get(1, 0), 2);
        assert_eq!(labels.get(2, 3), 3);
        assert_eq!(labels.members()[1], vec![4, 8]);
    }

    #[test]
    fn test_tiled_matches_full_extent() {
        let patterns: [&[&str]; 3] = [
            &[
                "HH....L.",
                ".H...LL.",
                "..H..L..",
                "...H....",
                "....H..M",
                "MM...HMM",
                "M......M",
            ],
            &["H.H.H.H.", ".H.H.H.H", "H.H.H.H.", ".H.H.H.H"],
            &["L.......", "........", ".......L", "L.......", "LLLLLLLL"],
        ];

        for rows in patterns {
            let tiers = tiers_from_ascii(rows);
            let full = FullExtentLabeler.label(&tiers).unwrap();
            for stripe_rows in [1, 2, 3, 16] {
                let tiled = TiledLabeler::new(stripe_rows).label(&tiers).unwrap();
                assert_eq!(tiled, full, "stripe_rows = {stripe_rows}");
            }
        }
    }

    #[test]
    fn test_region_split_only_by_seam_is_rejoined() {
        // U shape whose arms meet below the seam
        let tiers = tiers_from_ascii(&["H..H", "H..H", "HHHH"]);
        let labels = TiledLabeler::new(2).label(&tiers).unwrap();
        assert_eq!(labels.region_count(), 1);
    }

    #[test]
    fn test_single_pixel_raster() {
        let flagged = FullExtentLabeler.label(&tiers_from_ascii(&["H"])).unwrap();
        assert_eq!(flagged.region_count(), 1);
        assert_eq!(flagged.get(0, 0), 1);
        assert_eq!(TiledLabeler::new(1).label(&tiers_from_ascii(&["H"])).unwrap(), flagged);

        let quiet = FullExtentLabeler.label(&tiers_from_ascii(&["."])).unwrap();
        assert_eq!(quiet.region_count(), 0);
    }

    #[test]
    fn test_empty_raster_has_no_regions() {
        let tiers = tiers_from_ascii(&["....", "...."]);
        assert_eq!(FullExtentLabeler.label(&tiers).unwrap().region_count(), 0);
        assert_eq!(TiledLabeler::new(1).label(&tiers).unwrap().region_count(), 0);
    }
}
