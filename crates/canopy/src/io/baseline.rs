use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{
    baseline::{BaselineGrid, BaselineSnapshot, BaselineStore, HistoryPolicy, LayerKey, RunningStats},
    error::Result,
    io::write_atomic,
    raster::GridSpec,
    types::{Month, SpectralIndex},
};

/// One month/index layer on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerFile {
    pub month: Month,
    pub index: SpectralIndex,
    /// Row-major per-pixel accumulators
    pub cells: Vec<RunningStats>,
}

/// JSON form of a baseline snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotFile {
    pub version: u64,
    pub grid: GridSpec,
    pub policy: HistoryPolicy,
    pub layers: Vec<LayerFile>,
}

impl From<&BaselineSnapshot> for SnapshotFile {
    fn from(snapshot: &BaselineSnapshot) -> Self {
        Self {
            version: snapshot.version(),
            grid: snapshot.grid().clone(),
            policy: snapshot.policy(),
            layers: snapshot
                .layers()
                .map(|(key, layer)| LayerFile {
                    month: key.month,
                    index: key.index,
                    cells: layer.cells().to_vec(),
                })
                .collect(),
        }
    }
}

impl SnapshotFile {
    pub fn into_snapshot(self) -> Result<BaselineSnapshot> {
        let (width, height) = (self.grid.width, self.grid.height);
        let layers = self
            .layers
            .into_iter()
            .map(|layer| {
                let grid = BaselineGrid::from_cells(width, height, layer.cells)?;
                Ok((LayerKey::new(layer.month, layer.index), grid))
            })
            .collect::<Result<BTreeMap<_, _>>>()?;
        BaselineSnapshot::from_parts(self.version, self.grid, self.policy, layers)
    }
}

pub fn save_snapshot<P: AsRef<Path>>(path: P, snapshot: &BaselineSnapshot) -> Result<()> {
    let text = serde_json::to_string(&SnapshotFile::from(snapshot))?;
    write_atomic(path.as_ref(), text.as_bytes())
}

pub fn load_snapshot<P: AsRef<Path>>(path: P) -> Result<BaselineSnapshot> {
    let text = std::fs::read_to_string(path)?;
    let file: SnapshotFile = serde_json::from_str(&text)?;
    file.into_snapshot()
}

impl BaselineStore {
    /// Persist the current snapshot; an interrupted write leaves the previous file intact.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let snapshot = self.snapshot();
        save_snapshot(path.as_ref(), &snapshot)?;
        info!(
            version = snapshot.version(),
            path = %path.as_ref().display(),
            "Saved baseline snapshot"
        );
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(Self::from_snapshot(load_snapshot(path)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CanopyError;
    use crate::raster::{tests::test_grid, Raster};
    use crate::types::PixelCoord;
    use chrono::NaiveDate;

    fn store() -> BaselineStore {
        let grid = test_grid(3, 2);
        let mut store = BaselineStore::new(grid.clone(), HistoryPolicy::default());
        for (year, value) in [(2019, 0.41), (2020, 0.44), (2021, 0.39), (2022, 0.42)] {
            let date = NaiveDate::from_ymd_opt(year, 1, 12).unwrap();
            store
                .ingest_raster(date, SpectralIndex::Ndmi, &Raster::filled(grid.clone(), value))
                .unwrap();
        }
        store
    }

    #[test]
    fn test_snapshot_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("baseline.json");
        let original = store();

        original.save(&path).unwrap();
        let loaded = BaselineStore::load(&path).unwrap();

        assert_eq!(*loaded.snapshot(), *original.snapshot());
        let pixel = PixelCoord::new(1, 2);
        let month = Month::new(1).unwrap();
        assert_eq!(
            loaded.record(pixel, month, SpectralIndex::Ndmi).unwrap(),
            original.record(pixel, month, SpectralIndex::Ndmi).unwrap()
        );
    }

    #[test]
    fn test_layer_with_wrong_cell_count_is_rejected() {
        let mut file = SnapshotFile::from(&*store().snapshot());
        file.layers[0].cells.pop();
        assert!(matches!(file.into_snapshot(), Err(CanopyError::MalformedRaster(_))));
    }

    #[test]
    fn test_corrupt_accumulators_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("baseline.json");
        let clean = serde_json::to_value(SnapshotFile::from(&*store().snapshot())).unwrap();

        for (field, value) in [("m2", serde_json::json!(-0.5)), ("count", serde_json::json!(1))] {
            let mut edited = clean.clone();
            edited["layers"][0]["cells"][4][field] = value;
            std::fs::write(&path, edited.to_string()).unwrap();
            assert!(
                matches!(load_snapshot(&path), Err(CanopyError::CorruptBaseline { offset: 4, .. })),
                "{field}"
            );
        }
    }
}
