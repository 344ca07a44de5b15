use std::collections::{BTreeMap, BTreeSet};

use chrono::{Datelike, NaiveDate};
use tracing::{info, warn};

use crate::{
    baseline::{BaselineStore, HistoryPolicy, LayerKey},
    error::{CanopyError, Result},
    raster::{GridSpec, Raster},
    types::{Month, SpectralIndex},
};

/// One historical, cloud-masked index scene.
#[derive(Debug, Clone)]
pub struct HistoricalScene {
    pub date: NaiveDate,
    pub index: SpectralIndex,
    pub raster: Raster,
}

impl HistoricalScene {
    pub fn new(date: NaiveDate, index: SpectralIndex, raster: Raster) -> Self {
        Self { date, index, raster }
    }
}

/// Rebuilds a baseline from a fixed multi-year corpus.
///
/// Scenes are folded in (date, index) order regardless of how the corpus is
/// supplied, so identical input always yields identical statistics.
#[derive(Debug, Clone)]
pub struct BaselineBuilder {
    grid: GridSpec,
    policy: HistoryPolicy,
    months: Option<BTreeSet<Month>>,
    indices: Option<BTreeSet<SpectralIndex>>,
}

impl BaselineBuilder {
    pub fn new(grid: GridSpec) -> Self {
        Self {
            grid,
            policy: HistoryPolicy::default(),
            months: None,
            indices: None,
        }
    }

    pub fn policy(mut self, policy: HistoryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Restrict the build to these months; each one becomes mandatory.
    pub fn months<I: IntoIterator<Item = Month>>(mut self, months: I) -> Self {
        self.months = Some(months.into_iter().collect());
        self
    }

    /// Restrict the build to these indices; each one becomes mandatory.
    pub fn indices<I: IntoIterator<Item = SpectralIndex>>(mut self, indices: I) -> Self {
        self.indices = Some(indices.into_iter().collect());
        self
    }

    pub fn build(&self, corpus: &[HistoricalScene]) -> Result<BaselineStore> {
        for scene in corpus {
            self.grid
                .ensure_aligned(scene.raster.grid(), &format!("{} {}", scene.index, scene.date))?;
        }

        let mut scenes: Vec<&HistoricalScene> = corpus
            .iter()
            .filter(|scene| self.wants(Month::of(scene.date), scene.index))
            .collect();
        scenes.sort_by_key(|scene| (scene.date, scene.index));

        let coverage = Self::coverage(&scenes);
        self.check_coverage(&coverage)?;

        let mut store = BaselineStore::new(self.grid.clone(), self.policy);
        for scene in &scenes {
            store.ingest_raster(scene.date, scene.index, &scene.raster)?;
        }

        for (key, (scene_count, years)) in &coverage {
            info!(
                "Built baseline for {} month {}: {} scenes over {} years",
                key.index,
                key.month,
                scene_count,
                years.len()
            );
        }

        Ok(store)
    }

    fn wants(&self, month: Month, index: SpectralIndex) -> bool {
        self.months.as_ref().is_none_or(|m| m.contains(&month))
            && self.indices.as_ref().is_none_or(|i| i.contains(&index))
    }

    /// Scene count and contributing years per layer, counting only scenes with clear cells.
    fn coverage(scenes: &[&HistoricalScene]) -> BTreeMap<LayerKey, (u32, BTreeSet<i32>)> {
        let mut coverage: BTreeMap<LayerKey, (u32, BTreeSet<i32>)> = BTreeMap::new();
        for scene in scenes {
            if scene.raster.valid_count() == 0 {
                continue;
            }
            let entry = coverage
                .entry(LayerKey::new(Month::of(scene.date), scene.index))
                .or_default();
            entry.0 += 1;
            entry.1.insert(scene.date.year());
        }
        coverage
    }

    fn check_coverage(&self, coverage: &BTreeMap<LayerKey, (u32, BTreeSet<i32>)>) -> Result<()> {
        let explicit = self.months.is_some() || self.indices.is_some();

        if explicit {
            let months: Vec<Month> = match &self.months {
                Some(months) => months.iter().copied().collect(),
                None => coverage.keys().map(|k| k.month).collect::<BTreeSet<_>>().into_iter().collect(),
            };
            let indices: Vec<SpectralIndex> = match &self.indices {
                Some(indices) => indices.iter().copied().collect(),
                None => coverage.keys().map(|k| k.index).collect::<BTreeSet<_>>().into_iter().collect(),
            };

            for &month in &months {
                for &index in &indices {
                    let (scene_count, years) = coverage
                        .get(&LayerKey::new(month, index))
                        .map(|(n, y)| (*n, y.len()))
                        .unwrap_or((0, 0));
                    if years < self.policy.min_years {
                        return Err(CanopyError::InsufficientHistory {
                            month,
                            index,
                            pixel: None,
                            sample_count: scene_count,
                            year_count: years,
                        });
                    }
                }
            }
        } else {
            for (key, (_, years)) in coverage {
                if years.len() < self.policy.min_years {
                    warn!(
                        "Baseline for {} month {} has only {} years of history; its pixels will be excluded from scoring",
                        key.index,
                        key.month,
                        years.len()
                    );
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raster::tests::test_grid;
    use crate::types::PixelCoord;

    fn scene(year: i32, month: u32, index: SpectralIndex, value: f64) -> HistoricalScene {
        HistoricalScene::new(
            NaiveDate::from_ymd_opt(year, month, 10).unwrap(),
            index,
            Raster::filled(test_grid(3, 2), value),
        )
    }

    fn five_year_corpus() -> Vec<HistoricalScene> {
        let mut corpus = Vec::new();
        for (i, year) in (2019..2024).enumerate() {
            corpus.push(scene(year, 1, SpectralIndex::Ndmi, 0.40 + 0.01 * i as f64));
            corpus.push(scene(year, 1, SpectralIndex::Nbr, 0.55 - 0.02 * i as f64));
            corpus.push(scene(year, 6, SpectralIndex::Ndmi, 0.20 + 0.03 * i as f64));
        }
        corpus
    }

    #[test]
    fn test_rebuild_is_idempotent() {
        let builder = BaselineBuilder::new(test_grid(3, 2));
        let corpus = five_year_corpus();

        let first = builder.build(&corpus).unwrap().snapshot();
        let second = builder.build(&corpus).unwrap().snapshot();
        assert_eq!(*first, *second);

        let mut reversed = five_year_corpus();
        reversed.reverse();
        let third = builder.build(&reversed).unwrap().snapshot();
        assert_eq!(*first, *third);
    }

    #[test]
    fn test_build_produces_usable_layers() {
        let store = BaselineBuilder::new(test_grid(3, 2)).build(&five_year_corpus()).unwrap();
        let record = store
            .record(PixelCoord::new(1, 2), Month::new(1).unwrap(), SpectralIndex::Ndmi)
            .unwrap();
        assert!((record.mean - 0.42).abs() < 1e-12);
        assert_eq!(record.years.len(), 5);
        assert!(store.query(Month::new(6).unwrap(), SpectralIndex::Ndmi).is_ok());
        assert!(store.query(Month::new(6).unwrap(), SpectralIndex::Nbr).is_err());
    }

    #[test]
    fn test_requested_layer_without_history_fails() {
        let builder = BaselineBuilder::new(test_grid(3, 2))
            .months([Month::new(6).unwrap()])
            .indices([SpectralIndex::Ndmi, SpectralIndex::Nbr]);

        let err = builder.build(&five_year_corpus()).unwrap_err();
        assert!(matches!(
            err,
            CanopyError::InsufficientHistory { index: SpectralIndex::Nbr, year_count: 0, .. }
        ));
    }

    #[test]
    fn test_requested_layer_with_two_years_fails() {
        let corpus = vec![
            scene(2021, 3, SpectralIndex::Ndmi, 0.4),
            scene(2021, 3, SpectralIndex::Ndmi, 0.5),
            scene(2022, 3, SpectralIndex::Ndmi, 0.45),
        ];
        let err = BaselineBuilder::new(test_grid(3, 2))
            .months([Month::new(3).unwrap()])
            .build(&corpus)
            .unwrap_err();
        assert!(matches!(
            err,
            CanopyError::InsufficientHistory { sample_count: 3, year_count: 2, .. }
        ));
    }

    #[test]
    fn test_misaligned_corpus_aborts() {
        let mut corpus = five_year_corpus();
        corpus.push(HistoricalScene::new(
            NaiveDate::from_ymd_opt(2020, 1, 1).unwrap(),
            SpectralIndex::Ndmi,
            Raster::filled(test_grid(4, 4), 0.3),
        ));
        assert!(matches!(
            BaselineBuilder::new(test_grid(3, 2)).build(&corpus),
            Err(CanopyError::MisalignedRaster { .. })
        ));
    }
}
