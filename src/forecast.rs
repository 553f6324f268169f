//! Forecast Eligibility & Generation Engine

use crate::error::{Result, StocknubError};
use crate::labels::LabelType;
use crate::registry::ModelRegistry;
use crate::scheduler::{RunReport, Scheduler};
use crate::store::DatasetStore;
use crate::types::{Entity, DATE_FORMAT};
use chrono::NaiveDate;
use csv::WriterBuilder;
use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// Directory under the data root holding forecast files
pub const FORECAST_DIR: &str = "04_forecast";

/// One scored entity for one (label type, window)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastRecord {
    pub entity: Entity,
    pub label_type: LabelType,
    pub window: usize,
    pub forecast_date: NaiveDate,
    /// Probability of the positive class
    pub probability: f64,
}

/// Entities eligible for forecasting on every requested pair.
///
/// An allow-list is returned as given. Otherwise an entity must have a
/// performance record with a test score of at least `min_test_score` (any
/// record when no minimum is set) for each pair. A pair with no records at
/// all is a configuration error.
pub fn eligible_entities(
    registry: &ModelRegistry,
    pairs: &[(LabelType, usize)],
    min_test_score: Option<f64>,
    allow_list: Option<&[String]>,
) -> Result<Vec<Entity>> {
    let mut per_pair: Vec<BTreeSet<Entity>> = Vec::with_capacity(pairs.len());
    for &(label_type, window) in pairs {
        let records = registry.aggregate(label_type, window)?;
        if records.is_empty() {
            return Err(StocknubError::NoTrainedArtifacts {
                label_type: label_type.to_string(),
                window,
            });
        }
        let qualified: BTreeSet<Entity> = records
            .into_iter()
            .filter(|r| match min_test_score {
                Some(min) => r.test_score().map_or(false, |score| score >= min),
                None => true,
            })
            .map(|r| r.entity)
            .collect();
        log::debug!(
            "{} {}dd: {} entities qualify",
            label_type,
            window,
            qualified.len()
        );
        per_pair.push(qualified);
    }

    if let Some(list) = allow_list {
        let mut seen = BTreeSet::new();
        return Ok(list
            .iter()
            .filter(|e| seen.insert(e.to_string()))
            .cloned()
            .collect());
    }

    let mut iter = per_pair.into_iter();
    let first = iter.next().unwrap_or_default();
    let eligible = iter.fold(first, |acc, set| acc.intersection(&set).cloned().collect());
    Ok(eligible.into_iter().collect())
}

/// Scores entities and writes one forecast file per pair
pub struct ForecastEngine {
    registry: ModelRegistry,
    technical: DatasetStore,
    root: PathBuf,
}

impl ForecastEngine {
    pub fn new(data_dir: &Path, registry: ModelRegistry, technical: DatasetStore) -> Self {
        Self {
            registry,
            technical,
            root: data_dir.join(FORECAST_DIR),
        }
    }

    pub fn output_path(&self, label_type: LabelType, window: usize) -> PathBuf {
        self.root
            .join(label_type.as_str())
            .join(format!("{}dd.csv", window))
    }

    /// Score the entity's most recent technical row
    pub fn generate(&self, entity: &str, label_type: LabelType, window: usize) -> Result<ForecastRecord> {
        let dataset = self
            .technical
            .load(entity)?
            .ok_or_else(|| StocknubError::NoUpstreamData {
                entity: entity.to_string(),
                stage: "technical".to_string(),
            })?;
        let latest = dataset
            .records
            .last()
            .ok_or_else(|| StocknubError::EmptyDataset(format!("technical data for {}", entity)))?;

        let artifact = self.registry.lookup(entity, label_type, window)?;

        let mut row = Vec::with_capacity(artifact.features.len());
        let mut missing = Vec::new();
        for name in &artifact.features {
            match dataset.schema.index_of(name).map(|i| latest.values[i]) {
                Some(v) if v.is_finite() => row.push(v),
                _ => missing.push(name.clone()),
            }
        }
        if !missing.is_empty() {
            return Err(StocknubError::MissingFeatures(missing));
        }

        Ok(ForecastRecord {
            entity: entity.to_string(),
            label_type,
            window,
            forecast_date: latest.date,
            probability: artifact.predict(&row),
        })
    }

    /// Replace the pair's forecast file with `records`, sorted by entity.
    /// Previous rows for the pair never survive, even when `records` is empty.
    pub fn write_batch(&self, label_type: LabelType, window: usize, records: &[ForecastRecord]) -> Result<PathBuf> {
        let path = self.output_path(label_type, window);
        let dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());
        fs::create_dir_all(&dir)?;

        let mut sorted: Vec<&ForecastRecord> = records.iter().collect();
        sorted.sort_by(|a, b| a.entity.cmp(&b.entity));

        let mut staging = NamedTempFile::new_in(&dir)?;
        {
            let mut wtr = WriterBuilder::new().from_writer(staging.as_file_mut());
            wtr.write_record(["entity", "forecast_date", "probability"])?;
            for r in sorted {
                wtr.write_record([
                    r.entity.clone(),
                    r.forecast_date.format(DATE_FORMAT).to_string(),
                    format!("{:.6}", r.probability),
                ])?;
            }
            wtr.flush()?;
        }
        staging.as_file_mut().flush()?;
        staging.as_file().sync_all()?;
        staging
            .persist(&path)
            .map_err(|e| StocknubError::IoError(e.error))?;
        Ok(path)
    }

    /// Forecast every pair for `entities`, one scheduler run per pair
    pub fn run(
        &self,
        scheduler: &Scheduler,
        pairs: &[(LabelType, usize)],
        entities: &[Entity],
    ) -> Result<Vec<RunReport<ForecastRecord>>> {
        let mut reports = Vec::with_capacity(pairs.len());
        for &(label_type, window) in pairs {
            let stage = format!("forecast {} {}dd", label_type, window);
            let report = scheduler.run(&stage, entities.to_vec(), |entity| {
                self.generate(entity, label_type, window)
            })?;
            let records: Vec<ForecastRecord> = report.successes().map(|(_, r)| r.clone()).collect();
            let path = self.write_batch(label_type, window, &records)?;
            log::info!("Wrote {} forecasts to {}", records.len(), path.display());
            reports.push(report);
        }
        Ok(reports)
    }
}

/// Read a forecast file back; used by reporting and tests
pub fn read_forecasts(path: &Path) -> Result<Vec<(Entity, NaiveDate, f64)>> {
    let mut rdr = csv::Reader::from_path(path)?;
    let mut rows = Vec::new();
    for result in rdr.records() {
        let record = result?;
        let field = |i: usize| record.get(i).unwrap_or_default();
        let date = crate::types::parse_date(field(1))?;
        let probability = field(2)
            .parse::<f64>()
            .map_err(|_| StocknubError::DataError(format!("invalid probability '{}'", field(2))))?;
        rows.push((field(0).to_string(), date, probability));
    }
    Ok(rows)
}

/// Count how many pairs each entity qualifies on; used for the CLI summary
pub fn qualification_counts(
    registry: &ModelRegistry,
    pairs: &[(LabelType, usize)],
    min_test_score: Option<f64>,
) -> Result<HashMap<Entity, usize>> {
    let mut counts = HashMap::new();
    for &(label_type, window) in pairs {
        for record in registry.aggregate(label_type, window)? {
            let qualifies = match min_test_score {
                Some(min) => record.test_score().map_or(false, |s| s >= min),
                None => true,
            };
            if qualifies {
                *counts.entry(record.entity).or_insert(0) += 1;
            }
        }
    }
    Ok(counts)
}
