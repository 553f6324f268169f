//! Entity Dataset Store
//!
//! One directory per stage, one CSV file per entity: a `date` column followed
//! by the stage schema's fields. Missing values are written as empty cells.

use crate::error::{Result, StocknubError};
use crate::types::{parse_date, Entity, EntityDataset, Schema, StageKind, StageRecord, DATE_FORMAT};
use csv::{ReaderBuilder, WriterBuilder};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// CSV-backed store for one stage
#[derive(Debug, Clone)]
pub struct DatasetStore {
    root: PathBuf,
    stage: StageKind,
}

impl DatasetStore {
    /// Store for `stage` under the data root
    pub fn new(data_dir: &Path, stage: StageKind) -> Self {
        Self {
            root: data_dir.join(stage.dir_name()),
            stage,
        }
    }

    pub fn stage(&self) -> StageKind {
        self.stage
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path(&self, entity: &str) -> PathBuf {
        self.root.join(format!("{}.csv", entity))
    }

    pub fn exists(&self, entity: &str) -> bool {
        self.path(entity).is_file()
    }

    /// Sorted entity names present in this stage
    pub fn list_entities(&self) -> Result<Vec<Entity>> {
        if !self.root.is_dir() {
            return Ok(Vec::new());
        }
        let mut entities = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) == Some("csv") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    entities.push(stem.to_string());
                }
            }
        }
        entities.sort();
        Ok(entities)
    }

    /// Load an entity's dataset, or `None` when it has never been written.
    ///
    /// Unterminated or partially written rows, unparsable cells and
    /// out-of-order dates are reported as `CorruptDataset`.
    pub fn load(&self, entity: &str) -> Result<Option<EntityDataset>> {
        let path = self.path(entity);
        if !path.is_file() {
            return Ok(None);
        }
        let corrupt = |reason: String| StocknubError::CorruptDataset {
            path: path.display().to_string(),
            reason,
        };

        let bytes = fs::read(&path).map_err(|e| corrupt(format!("failed to open: {}", e)))?;
        // Every completed write ends on a record terminator
        if bytes.last().map_or(false, |&b| b != b'\n') {
            return Err(corrupt("last row is not terminated".to_string()));
        }
        let mut rdr = ReaderBuilder::new()
            .has_headers(true)
            .from_reader(bytes.as_slice());

        let headers = rdr
            .headers()
            .map_err(|e| corrupt(format!("failed to read headers: {}", e)))?
            .clone();
        let mut columns = headers.iter();
        if columns.next() != Some("date") {
            return Err(corrupt("first column must be 'date'".to_string()));
        }
        let schema = Schema::new(columns);

        let mut records = Vec::new();
        for (line, result) in rdr.records().enumerate() {
            let row = result.map_err(|e| corrupt(format!("row {}: {}", line + 1, e)))?;
            let date = row
                .get(0)
                .ok_or_else(|| corrupt(format!("row {}: missing date", line + 1)))
                .and_then(|s| parse_date(s).map_err(|e| corrupt(format!("row {}: {}", line + 1, e))))?;
            let values = row
                .iter()
                .skip(1)
                .map(|cell| parse_value(cell))
                .collect::<std::result::Result<Vec<f64>, String>>()
                .map_err(|e| corrupt(format!("row {}: {}", line + 1, e)))?;
            records.push(StageRecord::new(date, values));
        }

        let dataset = EntityDataset {
            entity: entity.to_string(),
            schema,
            records,
        };
        dataset.validate().map_err(|e| match e {
            StocknubError::CorruptDataset { reason, .. } => corrupt(reason),
            other => other,
        })?;
        Ok(Some(dataset))
    }

    /// Load and require the given schema
    pub fn load_with_schema(&self, entity: &str, expected: &Schema) -> Result<Option<EntityDataset>> {
        match self.load(entity)? {
            Some(ds) if &ds.schema != expected => Err(StocknubError::SchemaMismatch {
                entity: entity.to_string(),
                expected: expected.fields().join(","),
                found: ds.schema.fields().join(","),
            }),
            other => Ok(other),
        }
    }

    /// Append rows without a header. Ordering checks belong to the writer.
    pub(crate) fn append_rows(&self, entity: &str, records: &[StageRecord]) -> Result<()> {
        let file = OpenOptions::new().append(true).open(self.path(entity))?;
        let mut wtr = WriterBuilder::new().has_headers(false).from_writer(file);
        for record in records {
            wtr.write_record(encode_record(record))?;
        }
        wtr.flush()?;
        wtr.get_ref().sync_all()?;
        Ok(())
    }

    /// Replace the whole file: write a staging file in the same directory,
    /// fsync it, then rename it over the target.
    pub(crate) fn replace(&self, dataset: &EntityDataset) -> Result<()> {
        fs::create_dir_all(&self.root)?;
        let mut staging = NamedTempFile::new_in(&self.root)?;
        {
            let mut wtr = WriterBuilder::new().from_writer(staging.as_file_mut());
            let mut header = vec!["date".to_string()];
            header.extend(dataset.schema.fields().iter().cloned());
            wtr.write_record(&header)?;
            for record in &dataset.records {
                wtr.write_record(encode_record(record))?;
            }
            wtr.flush()?;
        }
        staging.as_file_mut().flush()?;
        staging.as_file().sync_all()?;
        staging
            .persist(self.path(&dataset.entity))
            .map_err(|e| StocknubError::IoError(e.error))?;
        Ok(())
    }
}

fn encode_record(record: &StageRecord) -> Vec<String> {
    let mut row = Vec::with_capacity(record.values.len() + 1);
    row.push(record.date.format(DATE_FORMAT).to_string());
    row.extend(record.values.iter().map(|v| {
        if v.is_nan() {
            String::new()
        } else {
            v.to_string()
        }
    }));
    row
}

fn parse_value(cell: &str) -> std::result::Result<f64, String> {
    let cell = cell.trim();
    if cell.is_empty() {
        return Ok(f64::NAN);
    }
    cell.parse::<f64>()
        .map_err(|_| format!("invalid number '{}'", cell))
}
