//! Model Artifact Registry
//!
//! One artifact and one performance record per (entity, label type, window):
//!
//! ```text
//! <data_dir>/03_model/<label_type>/<ENTITY>-<window>dd.json
//! <data_dir>/03_model/performance/<label_type>/<window>dd/<ENTITY>.json
//! <data_dir>/03_model/performance/<label_type>/<window>dd.csv
//! ```
//!
//! Per-entity files keep concurrent training tasks on disjoint paths; the
//! summary CSV is rebuilt from them after a training run.

use crate::config::TrainingConfig;
use crate::error::{Result, StocknubError};
use crate::labels::{label_column, LabelType};
use crate::model::{FittedModel, SplitMetrics, Trainer};
use crate::types::{Entity, EntityDataset};
use chrono::{DateTime, NaiveDate, Utc};
use csv::WriterBuilder;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use uuid::Uuid;

/// Directory under the data root holding artifacts and records
pub const MODEL_DIR: &str = "03_model";

/// Trained predictor with everything needed to score a new row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelArtifact {
    pub entity: Entity,
    pub label_type: LabelType,
    pub window: usize,
    /// Feature columns in the order the model expects them
    pub features: Vec<String>,
    /// Raw label value at or above which a row is the positive class
    pub threshold: f64,
    pub positive_class: String,
    pub trained_at: DateTime<Utc>,
    pub run_id: Uuid,
    pub model: FittedModel,
}

impl ModelArtifact {
    /// Probability of the positive class for a row ordered like `features`
    pub fn predict(&self, row: &[f64]) -> f64 {
        self.model.predict_proba(row).clamp(0.0, 1.0)
    }
}

/// Train and test quality of one artifact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceRecord {
    pub entity: Entity,
    pub label_type: LabelType,
    pub window: usize,
    pub threshold: f64,
    pub train_start: NaiveDate,
    pub train_end: NaiveDate,
    pub test_start: NaiveDate,
    pub test_end: NaiveDate,
    pub train: SplitMetrics,
    pub test: SplitMetrics,
    pub trained_at: DateTime<Utc>,
    pub run_id: Uuid,
}

impl PerformanceRecord {
    /// Score used for forecast eligibility: test Gini
    pub fn test_score(&self) -> Option<f64> {
        self.test.gini
    }
}

/// Artifact and record produced together
#[derive(Debug, Clone)]
pub struct TrainedModel {
    pub artifact: ModelArtifact,
    pub record: PerformanceRecord,
}

/// Fits one model per (entity, label type, window) from a labeled dataset
pub struct TrainingJob<'a> {
    trainer: &'a dyn Trainer,
    settings: &'a TrainingConfig,
    features: &'a [String],
    run_id: Uuid,
}

impl<'a> TrainingJob<'a> {
    pub fn new(
        trainer: &'a dyn Trainer,
        settings: &'a TrainingConfig,
        features: &'a [String],
        run_id: Uuid,
    ) -> Self {
        Self {
            trainer,
            settings,
            features,
            run_id,
        }
    }

    /// Fit on the earlier contiguous portion of the clean rows and evaluate
    /// on the later one. Data problems come back as skip-class errors.
    pub fn train(
        &self,
        dataset: &EntityDataset,
        label_type: LabelType,
        window: usize,
    ) -> Result<TrainedModel> {
        let column = label_column(label_type, window);
        let label_idx = dataset
            .schema
            .index_of(&column)
            .ok_or_else(|| StocknubError::MissingLabelColumn(column.clone()))?;

        let mut missing = Vec::new();
        let mut feature_idx = Vec::with_capacity(self.features.len());
        for name in self.features {
            match dataset.schema.index_of(name) {
                Some(idx) => feature_idx.push(idx),
                None => missing.push(name.clone()),
            }
        }
        if !missing.is_empty() {
            return Err(StocknubError::MissingFeatures(missing));
        }

        // Clean rows: every feature and the label present
        let clean: Vec<(NaiveDate, Vec<f64>, f64)> = dataset
            .records
            .iter()
            .filter_map(|r| {
                let label = r.values[label_idx];
                let row: Vec<f64> = feature_idx.iter().map(|&i| r.values[i]).collect();
                (label.is_finite() && row.iter().all(|v| v.is_finite())).then(|| (r.date, row, label))
            })
            .collect();

        if clean.len() < self.settings.min_clean_rows {
            return Err(StocknubError::InsufficientRows {
                available: clean.len(),
                required: self.settings.min_clean_rows,
            });
        }

        let test_len = ((clean.len() as f64 * self.settings.test_fraction).ceil() as usize)
            .clamp(1, clean.len() - 1);
        let (train, test) = clean.split_at(clean.len() - test_len);

        let train_labels: Vec<f64> = train.iter().map(|(_, _, l)| *l).collect();
        let threshold = label_type
            .class_threshold(&train_labels)
            .ok_or_else(|| StocknubError::EmptyDataset(format!("{} training labels", column)))?;
        let classify = |rows: &[(NaiveDate, Vec<f64>, f64)]| -> Vec<bool> {
            rows.iter().map(|(_, _, l)| *l >= threshold).collect()
        };
        let train_targets = classify(train);
        let test_targets = classify(test);

        let positives = train_targets.iter().filter(|&&t| t).count();
        let negatives = train_targets.len() - positives;
        let required = self.settings.min_class_samples.max(1);
        if positives < required {
            return Err(StocknubError::InsufficientPositiveSamples {
                found: positives,
                required,
            });
        }
        if negatives < required {
            return Err(StocknubError::InsufficientNegativeSamples {
                found: negatives,
                required,
            });
        }

        let train_x: Vec<Vec<f64>> = train.iter().map(|(_, row, _)| row.clone()).collect();
        let model = self.trainer.fit(&train_x, &train_targets)?;

        let evaluate = |rows: &[(NaiveDate, Vec<f64>, f64)], targets: &[bool]| {
            let probs: Vec<f64> = rows.iter().map(|(_, row, _)| model.predict_proba(row)).collect();
            let raw: Vec<f64> = rows.iter().map(|(_, _, l)| *l).collect();
            SplitMetrics::evaluate(&probs, targets, &raw)
        };
        let train_metrics = evaluate(train, &train_targets);
        let test_metrics = evaluate(test, &test_targets);

        let trained_at = Utc::now();
        let entity = dataset.entity.clone();
        // split_at leaves both halves non-empty
        let date_at = |rows: &[(NaiveDate, Vec<f64>, f64)], first: bool| {
            let row = if first { rows.first() } else { rows.last() };
            row.map(|(d, _, _)| *d).unwrap_or_default()
        };

        let record = PerformanceRecord {
            entity: entity.clone(),
            label_type,
            window,
            threshold,
            train_start: date_at(train, true),
            train_end: date_at(train, false),
            test_start: date_at(test, true),
            test_end: date_at(test, false),
            train: train_metrics,
            test: test_metrics,
            trained_at,
            run_id: self.run_id,
        };
        let artifact = ModelArtifact {
            entity,
            label_type,
            window,
            features: self.features.to_vec(),
            threshold,
            positive_class: label_type.positive_class().to_string(),
            trained_at,
            run_id: self.run_id,
            model,
        };

        log::debug!(
            "{}: trained {} (train gini {:?}, test gini {:?})",
            artifact.entity,
            column,
            record.train.gini,
            record.test.gini
        );
        Ok(TrainedModel { artifact, record })
    }
}

/// File-backed registry
#[derive(Debug, Clone)]
pub struct ModelRegistry {
    root: PathBuf,
}

impl ModelRegistry {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            root: data_dir.join(MODEL_DIR),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn artifact_path(&self, entity: &str, label_type: LabelType, window: usize) -> PathBuf {
        self.root
            .join(label_type.as_str())
            .join(format!("{}-{}dd.json", entity, window))
    }

    fn performance_dir(&self, label_type: LabelType, window: usize) -> PathBuf {
        self.root
            .join("performance")
            .join(label_type.as_str())
            .join(format!("{}dd", window))
    }

    pub fn record_path(&self, entity: &str, label_type: LabelType, window: usize) -> PathBuf {
        self.performance_dir(label_type, window)
            .join(format!("{}.json", entity))
    }

    pub fn summary_path(&self, label_type: LabelType, window: usize) -> PathBuf {
        self.root
            .join("performance")
            .join(label_type.as_str())
            .join(format!("{}dd.csv", window))
    }

    /// Persist an artifact and its record, replacing any previous pair
    pub fn save(&self, trained: &TrainedModel) -> Result<()> {
        let a = &trained.artifact;
        write_json_atomic(&self.artifact_path(&a.entity, a.label_type, a.window), a)?;
        write_json_atomic(&self.record_path(&a.entity, a.label_type, a.window), &trained.record)?;
        Ok(())
    }

    pub fn lookup(&self, entity: &str, label_type: LabelType, window: usize) -> Result<ModelArtifact> {
        let path = self.artifact_path(entity, label_type, window);
        if !path.is_file() {
            return Err(StocknubError::ModelNotFound(format!(
                "{} {} {}dd",
                entity, label_type, window
            )));
        }
        read_json(&path)
    }

    pub fn record(
        &self,
        entity: &str,
        label_type: LabelType,
        window: usize,
    ) -> Result<Option<PerformanceRecord>> {
        let path = self.record_path(entity, label_type, window);
        if !path.is_file() {
            return Ok(None);
        }
        read_json(&path).map(Some)
    }

    /// Every performance record for one pair, sorted by entity
    pub fn aggregate(&self, label_type: LabelType, window: usize) -> Result<Vec<PerformanceRecord>> {
        let dir = self.performance_dir(label_type, window);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut paths = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                paths.push(path);
            }
        }
        let mut records = paths
            .iter()
            .map(|p| read_json::<PerformanceRecord>(p))
            .collect::<Result<Vec<_>>>()?;
        records.sort_by(|a, b| a.entity.cmp(&b.entity));
        Ok(records)
    }

    /// Rebuild the summary CSV for one pair; returns the row count
    pub fn write_summary(&self, label_type: LabelType, window: usize) -> Result<usize> {
        let records = self.aggregate(label_type, window)?;
        let path = self.summary_path(label_type, window);
        let dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());
        fs::create_dir_all(&dir)?;

        let mut staging = NamedTempFile::new_in(&dir)?;
        {
            let mut wtr = WriterBuilder::new().from_writer(staging.as_file_mut());
            wtr.write_record([
                "entity",
                "threshold",
                "train_rows",
                "train_auc",
                "train_gini",
                "train_accuracy",
                "train_spearman",
                "test_rows",
                "test_auc",
                "test_gini",
                "test_accuracy",
                "test_spearman",
                "test_start",
                "test_end",
            ])?;
            let opt = |v: Option<f64>| v.map(|x| format!("{:.6}", x)).unwrap_or_default();
            for r in &records {
                wtr.write_record([
                    r.entity.clone(),
                    format!("{:.6}", r.threshold),
                    r.train.rows.to_string(),
                    opt(r.train.auc),
                    opt(r.train.gini),
                    format!("{:.6}", r.train.accuracy),
                    opt(r.train.spearman),
                    r.test.rows.to_string(),
                    opt(r.test.auc),
                    opt(r.test.gini),
                    format!("{:.6}", r.test.accuracy),
                    opt(r.test.spearman),
                    r.test_start.to_string(),
                    r.test_end.to_string(),
                ])?;
            }
            wtr.flush()?;
        }
        persist(staging, &path)?;
        log::info!(
            "Wrote {} performance rows to {}",
            records.len(),
            path.display()
        );
        Ok(records.len())
    }
}

fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| StocknubError::DataError(format!("no parent for {}", path.display())))?;
    fs::create_dir_all(dir)?;
    let mut staging = NamedTempFile::new_in(dir)?;
    serde_json::to_writer_pretty(staging.as_file_mut(), value)?;
    persist(staging, path)
}

fn persist(mut staging: NamedTempFile, path: &Path) -> Result<()> {
    staging.as_file_mut().flush()?;
    staging.as_file().sync_all()?;
    staging
        .persist(path)
        .map_err(|e| StocknubError::IoError(e.error))?;
    Ok(())
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let contents = fs::read_to_string(path)?;
    serde_json::from_str(&contents).map_err(|e| StocknubError::CorruptDataset {
        path: path.display().to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::LogisticTrainer;
    use crate::types::{Schema, StageRecord};
    use chrono::Duration;
    use tempfile::TempDir;

    fn labeled(n: usize) -> EntityDataset {
        let start = NaiveDate::from_ymd_opt(2022, 1, 3).unwrap();
        let records = (0..n)
            .map(|i| {
                let x = ((i * 37) % 101) as f64;
                // label rises with x so the model has something to learn
                StageRecord::new(start + Duration::days(i as i64), vec![x, x / 10.0 - 5.0])
            })
            .collect();
        EntityDataset::from_records("AAA", Schema::new(["feat", "max_loss_5d"]), records).unwrap()
    }

    fn settings() -> TrainingConfig {
        TrainingConfig::default()
    }

    #[test]
    fn test_train_and_roundtrip() {
        let dir = TempDir::new().unwrap();
        let registry = ModelRegistry::new(dir.path());
        let trainer = LogisticTrainer::default();
        let config = settings();
        let features = vec!["feat".to_string()];
        let job = TrainingJob::new(&trainer, &config, &features, Uuid::new_v4());

        let trained = job.train(&labeled(150), LabelType::MaxLoss, 5).unwrap();
        assert_eq!(trained.record.test.rows, 15);
        assert_eq!(trained.record.train.rows, 135);
        assert!(trained.record.train_end < trained.record.test_start);
        registry.save(&trained).unwrap();

        let artifact = registry.lookup("AAA", LabelType::MaxLoss, 5).unwrap();
        assert_eq!(artifact, trained.artifact);
        assert!(artifact.predict(&[100.0]) > artifact.predict(&[0.0]));

        assert_eq!(registry.aggregate(LabelType::MaxLoss, 5).unwrap().len(), 1);
        assert_eq!(registry.write_summary(LabelType::MaxLoss, 5).unwrap(), 1);
        assert!(registry.summary_path(LabelType::MaxLoss, 5).is_file());
    }

    #[test]
    fn test_too_few_rows_is_skip() {
        let trainer = LogisticTrainer::default();
        let config = settings();
        let features = vec!["feat".to_string()];
        let job = TrainingJob::new(&trainer, &config, &features, Uuid::new_v4());
        let err = job.train(&labeled(40), LabelType::MaxLoss, 5).unwrap_err();
        assert!(matches!(
            err,
            StocknubError::InsufficientRows {
                available: 40,
                required: 100
            }
        ));
        assert!(err.is_skip());
    }

    #[test]
    fn test_missing_label_column_is_skip() {
        let trainer = LogisticTrainer::default();
        let config = settings();
        let features = vec!["feat".to_string()];
        let job = TrainingJob::new(&trainer, &config, &features, Uuid::new_v4());
        let err = job.train(&labeled(150), LabelType::MedianGain, 5).unwrap_err();
        assert!(matches!(err, StocknubError::MissingLabelColumn(_)));
        assert!(err.is_skip());
    }

    #[test]
    fn test_single_class_is_skip() {
        let start = NaiveDate::from_ymd_opt(2022, 1, 3).unwrap();
        // every slope negative: no "Up Trend" rows
        let records = (0..150)
            .map(|i| StageRecord::new(start + Duration::days(i), vec![i as f64, -1.0]))
            .collect();
        let ds = EntityDataset::from_records("AAA", Schema::new(["feat", "linear_trend_5d"]), records)
            .unwrap();
        let trainer = LogisticTrainer::default();
        let config = settings();
        let features = vec!["feat".to_string()];
        let job = TrainingJob::new(&trainer, &config, &features, Uuid::new_v4());
        let err = job.train(&ds, LabelType::LinearTrend, 5).unwrap_err();
        assert!(matches!(err, StocknubError::InsufficientPositiveSamples { found: 0, .. }));
    }

    #[test]
    fn test_lookup_missing_artifact() {
        let dir = TempDir::new().unwrap();
        let registry = ModelRegistry::new(dir.path());
        assert!(matches!(
            registry.lookup("BBB", LabelType::MedianGain, 5),
            Err(StocknubError::ModelNotFound(_))
        ));
        assert!(registry.record("BBB", LabelType::MedianGain, 5).unwrap().is_none());
        assert!(registry.aggregate(LabelType::MedianGain, 5).unwrap().is_empty());
    }
}
