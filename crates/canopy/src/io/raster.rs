use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{
    error::{CanopyError, Result},
    io::write_atomic,
    raster::{GridSpec, Raster},
};

/// JSON form of a raster: row-major values with `null` for cloud or no-data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RasterFile {
    pub grid: GridSpec,
    pub values: Vec<Option<f64>>,
}

impl RasterFile {
    pub fn into_raster(self) -> Result<Raster> {
        Raster::from_options(self.grid, &self.values)
    }
}

impl From<&Raster> for RasterFile {
    fn from(raster: &Raster) -> Self {
        Self {
            grid: raster.grid().clone(),
            values: raster.to_options(),
        }
    }
}

pub fn load_raster<P: AsRef<Path>>(path: P) -> Result<Raster> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)?;
    let file: RasterFile = serde_json::from_str(&text)
        .map_err(|e| CanopyError::MalformedRaster(format!("{}: {e}", path.display())))?;
    file.into_raster()
}

pub fn save_raster<P: AsRef<Path>>(path: P, raster: &Raster) -> Result<()> {
    let text = serde_json::to_string(&RasterFile::from(raster))?;
    write_atomic(path.as_ref(), text.as_bytes())
}
