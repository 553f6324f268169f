//! Append-Merge Writer
//!
//! Incremental runs append; forced or full runs replace the whole file
//! atomically. Appends never reorder or deduplicate: an out-of-order slice is
//! an integrity error.

use crate::error::{Result, StocknubError};
use crate::store::DatasetStore;
use crate::types::{EntityDataset, StageRecord};

/// Append `rows` after `existing`, returning the number of rows written.
///
/// `existing` is the dataset as currently persisted. When it is empty the
/// rows are written as a fresh file with a header.
pub fn append(store: &DatasetStore, existing: &EntityDataset, rows: &[StageRecord]) -> Result<usize> {
    let first = match rows.first() {
        Some(first) => first,
        None => return Ok(0),
    };

    if let Some(existing_last) = existing.last_date() {
        if first.date <= existing_last {
            return Err(StocknubError::NonMonotonicAppend {
                entity: existing.entity.clone(),
                first_new: first.date,
                existing_last,
            });
        }
    }
    for pair in rows.windows(2) {
        if pair[1].date <= pair[0].date {
            return Err(StocknubError::NonMonotonicAppend {
                entity: existing.entity.clone(),
                first_new: pair[1].date,
                existing_last: pair[0].date,
            });
        }
    }
    if let Some(bad) = rows.iter().find(|r| r.values.len() != existing.schema.len()) {
        return Err(StocknubError::DataError(format!(
            "{}: row {} has {} values, schema has {}",
            existing.entity,
            bad.date,
            bad.values.len(),
            existing.schema.len()
        )));
    }

    if existing.is_empty() || !store.exists(&existing.entity) {
        let fresh = EntityDataset::from_records(
            existing.entity.clone(),
            existing.schema.clone(),
            rows.to_vec(),
        )?;
        store.replace(&fresh)?;
    } else {
        store.append_rows(&existing.entity, rows)?;
    }

    log::debug!(
        "{}: appended {} rows to {} stage",
        existing.entity,
        rows.len(),
        store.stage()
    );
    Ok(rows.len())
}

/// Atomically replace the entity's dataset
pub fn replace(store: &DatasetStore, dataset: &EntityDataset) -> Result<usize> {
    dataset.validate()?;
    store.replace(dataset)?;
    log::debug!(
        "{}: replaced {} stage with {} rows",
        dataset.entity,
        store.stage(),
        dataset.len()
    );
    Ok(dataset.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Schema, StageKind};
    use chrono::NaiveDate;
    use tempfile::TempDir;

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 2, day).unwrap()
    }

    fn rows(days: &[u32]) -> Vec<StageRecord> {
        days.iter().map(|&day| StageRecord::new(d(day), vec![day as f64])).collect()
    }

    fn seeded(dir: &TempDir) -> (DatasetStore, EntityDataset) {
        let store = DatasetStore::new(dir.path(), StageKind::Technical);
        let ds = EntityDataset::from_records("AAA", Schema::new(["x"]), rows(&[1, 2, 3])).unwrap();
        replace(&store, &ds).unwrap();
        (store, ds)
    }

    #[test]
    fn test_append_after_last_date() {
        let dir = TempDir::new().unwrap();
        let (store, existing) = seeded(&dir);
        assert_eq!(append(&store, &existing, &rows(&[4, 5])).unwrap(), 2);
        let loaded = store.load("AAA").unwrap().unwrap();
        assert_eq!(loaded.len(), 5);
        assert_eq!(loaded.last_date(), Some(d(5)));
    }

    #[test]
    fn test_overlapping_append_is_rejected() {
        let dir = TempDir::new().unwrap();
        let (store, existing) = seeded(&dir);
        let err = append(&store, &existing, &rows(&[3, 4])).unwrap_err();
        match err {
            StocknubError::NonMonotonicAppend {
                first_new,
                existing_last,
                ..
            } => {
                assert_eq!(first_new, d(3));
                assert_eq!(existing_last, d(3));
            }
            other => panic!("unexpected error: {}", other),
        }
        // Nothing was written
        assert_eq!(store.load("AAA").unwrap().unwrap().len(), 3);
    }

    #[test]
    fn test_unordered_slice_is_rejected() {
        let dir = TempDir::new().unwrap();
        let (store, existing) = seeded(&dir);
        let result = append(&store, &existing, &rows(&[6, 5]));
        assert!(matches!(result, Err(StocknubError::NonMonotonicAppend { .. })));
    }

    #[test]
    fn test_append_to_missing_file_writes_header() {
        let dir = TempDir::new().unwrap();
        let store = DatasetStore::new(dir.path(), StageKind::Raw);
        let empty = EntityDataset::new("BBB", Schema::new(["x"]));
        append(&store, &empty, &rows(&[1, 2])).unwrap();
        let loaded = store.load("BBB").unwrap().unwrap();
        assert_eq!(loaded.schema, Schema::new(["x"]));
        assert_eq!(loaded.len(), 2);
    }

    #[test]
    fn test_empty_slice_is_noop() {
        let dir = TempDir::new().unwrap();
        let (store, existing) = seeded(&dir);
        assert_eq!(append(&store, &existing, &[]).unwrap(), 0);
    }
}
