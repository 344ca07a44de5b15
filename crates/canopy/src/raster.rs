//! Georeferenced grids with a validity mask.

use ndarray::Array2;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::{CanopyError, Result};
use crate::types::PixelCoord;

const ALIGNMENT_TOLERANCE: f64 = 1e-9;

/// Longitude/latitude references whose units are degrees.
const GEOGRAPHIC_CRS: [&str; 5] = ["EPSG:4326", "EPSG:4269", "EPSG:4258", "OGC:CRS84", "CRS84"];

/// Cells smaller than this many CRS units are taken to be degrees.
const DEGREE_SIZED_PIXEL: f64 = 0.01;

/// North-up affine transform from lattice positions to CRS coordinates.
///
/// ```text
/// x = origin_x + col * pixel_width
/// y = origin_y + row * pixel_height
/// ```
///
/// `pixel_height` is negative for north-up rasters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct GeoTransform {
    /// X coordinate of the upper-left corner
    pub origin_x: f64,
    /// Y coordinate of the upper-left corner
    pub origin_y: f64,
    pub pixel_width: f64,
    pub pixel_height: f64,
}

impl GeoTransform {
    pub fn new(origin_x: f64, origin_y: f64, pixel_width: f64, pixel_height: f64) -> Self {
        Self {
            origin_x,
            origin_y,
            pixel_width,
            pixel_height,
        }
    }

    /// Lattice point (cell corner) to CRS coordinates. Fractional positions are allowed.
    pub fn lattice_to_geo(&self, col: f64, row: f64) -> (f64, f64) {
        (
            self.origin_x + col * self.pixel_width,
            self.origin_y + row * self.pixel_height,
        )
    }

    /// Pixel center in CRS coordinates
    pub fn pixel_center(&self, pixel: PixelCoord) -> (f64, f64) {
        self.lattice_to_geo(pixel.col as f64 + 0.5, pixel.row as f64 + 0.5)
    }

    /// Area of one cell in squared CRS units
    pub fn cell_area(&self) -> f64 {
        (self.pixel_width * self.pixel_height).abs()
    }

    fn approx_eq(&self, other: &Self) -> bool {
        let close = |a: f64, b: f64| (a - b).abs() <= ALIGNMENT_TOLERANCE * a.abs().max(b.abs()).max(1.0);
        close(self.origin_x, other.origin_x)
            && close(self.origin_y, other.origin_y)
            && close(self.pixel_width, other.pixel_width)
            && close(self.pixel_height, other.pixel_height)
    }
}

/// Shape, georeferencing and coordinate reference of a raster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct GridSpec {
    pub width: usize,
    pub height: usize,
    pub transform: GeoTransform,
    /// Coordinate reference, e.g. "EPSG:32724". Area computations assume metres.
    pub crs: String,
}

impl GridSpec {
    pub fn new(width: usize, height: usize, transform: GeoTransform, crs: impl Into<String>) -> Self {
        Self {
            width,
            height,
            transform,
            crs: crs.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.width * self.height
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.height, self.width)
    }

    /// True when cell sizes are in degrees, so areas in hectares are meaningless.
    pub fn is_geographic(&self) -> bool {
        let crs = self.crs.trim().to_ascii_uppercase();
        GEOGRAPHIC_CRS.contains(&crs.as_str())
            || self.transform.pixel_width.abs() < DEGREE_SIZED_PIXEL
            || self.transform.pixel_height.abs() < DEGREE_SIZED_PIXEL
    }

    pub fn contains(&self, pixel: PixelCoord) -> bool {
        pixel.row < self.height && pixel.col < self.width
    }

    /// Row-major flat index of a pixel
    pub fn offset(&self, pixel: PixelCoord) -> usize {
        pixel.row * self.width + pixel.col
    }

    pub fn pixel_at(&self, offset: usize) -> PixelCoord {
        PixelCoord::new(offset / self.width, offset % self.width)
    }

    /// Fails with `MisalignedRaster` unless both grids describe the same cells.
    pub fn ensure_aligned(&self, other: &GridSpec, layer: &str) -> Result<()> {
        let misaligned = |reason: String| CanopyError::MisalignedRaster {
            layer: layer.to_string(),
            reason,
        };

        if self.shape() != other.shape() {
            return Err(misaligned(format!(
                "shape {}x{} differs from {}x{}",
                other.width, other.height, self.width, self.height
            )));
        }
        if self.crs != other.crs {
            return Err(misaligned(format!("CRS {} differs from {}", other.crs, self.crs)));
        }
        if !self.transform.approx_eq(&other.transform) {
            return Err(misaligned(format!(
                "transform {:?} differs from {:?}",
                other.transform, self.transform
            )));
        }
        Ok(())
    }
}

/// A single-band raster of index values. A cell is valid only when its mask
/// entry is clear and its value is finite.
#[derive(Debug, Clone, PartialEq)]
pub struct Raster {
    grid: GridSpec,
    values: Array2<f64>,
    valid: Array2<bool>,
}

impl Raster {
    /// Wrap values; non-finite cells are treated as no-data.
    pub fn new(grid: GridSpec, values: Array2<f64>) -> Result<Self> {
        if values.dim() != grid.shape() {
            return Err(CanopyError::MalformedRaster(format!(
                "values have shape {:?}, grid expects {:?}",
                values.dim(),
                grid.shape()
            )));
        }
        let valid = values.mapv(f64::is_finite);
        Ok(Self { grid, values, valid })
    }

    /// Row-major values, `None` for cloud or no-data cells.
    pub fn from_options(grid: GridSpec, values: &[Option<f64>]) -> Result<Self> {
        if values.len() != grid.len() {
            return Err(CanopyError::MalformedRaster(format!(
                "expected {} values for a {}x{} grid, got {}",
                grid.len(),
                grid.width,
                grid.height,
                values.len()
            )));
        }
        let data = values.iter().map(|v| v.unwrap_or(f64::NAN)).collect();
        let array = Array2::from_shape_vec(grid.shape(), data)
            .map_err(|e| CanopyError::MalformedRaster(e.to_string()))?;
        Self::new(grid, array)
    }

    /// Filled with one value everywhere; handy for tests and synthetic scenes.
    pub fn filled(grid: GridSpec, value: f64) -> Self {
        let values = Array2::from_elem(grid.shape(), value);
        let valid = values.mapv(f64::is_finite);
        Self { grid, values, valid }
    }

    /// Apply a cloud/no-data mask where `true` marks a clear cell.
    pub fn with_mask(mut self, clear: Array2<bool>) -> Result<Self> {
        if clear.dim() != self.grid.shape() {
            return Err(CanopyError::MalformedRaster(format!(
                "mask has shape {:?}, grid expects {:?}",
                clear.dim(),
                self.grid.shape()
            )));
        }
        self.valid.zip_mut_with(&clear, |v, &c| *v = *v && c);
        Ok(self)
    }

    pub fn grid(&self) -> &GridSpec {
        &self.grid
    }

    /// Value of a valid cell; `None` when masked or out of bounds.
    pub fn get(&self, row: usize, col: usize) -> Option<f64> {
        match self.valid.get((row, col)) {
            Some(true) => self.values.get((row, col)).copied(),
            _ => None,
        }
    }

    pub fn set(&mut self, row: usize, col: usize, value: Option<f64>) -> Result<()> {
        let pixel = PixelCoord::new(row, col);
        if !self.grid.contains(pixel) {
            return Err(CanopyError::PixelOutOfBounds(pixel));
        }
        match value {
            Some(v) if v.is_finite() => {
                self.values[(row, col)] = v;
                self.valid[(row, col)] = true;
            }
            _ => {
                self.values[(row, col)] = f64::NAN;
                self.valid[(row, col)] = false;
            }
        }
        Ok(())
    }

    pub fn valid_count(&self) -> usize {
        self.valid.iter().filter(|v| **v).count()
    }

    /// Row-major values with masked cells as `None`.
    pub fn to_options(&self) -> Vec<Option<f64>> {
        self.values
            .iter()
            .zip(self.valid.iter())
            .map(|(&v, &ok)| ok.then_some(v))
            .collect()
    }
}
