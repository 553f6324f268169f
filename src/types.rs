//! Core types shared by every stage

use crate::error::{Result, StocknubError};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Ticker symbol naming one independent unit of work
pub type Entity = String;

/// Date format used by every on-disk dataset
pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// Field names of the raw price stage, in column order
pub const PRICE_FIELDS: [&str; 5] = ["open", "high", "low", "close", "volume"];

/// Daily OHLCV bar
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceBar {
    pub date: NaiveDate,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl PriceBar {
    /// Create a new bar
    pub fn new(date: NaiveDate, open: f64, high: f64, low: f64, close: f64, volume: f64) -> Self {
        Self {
            date,
            open,
            high,
            low,
            close,
            volume,
        }
    }

    /// Structural OHLC sanity check
    pub fn is_valid(&self) -> bool {
        let finite = [self.open, self.high, self.low, self.close, self.volume]
            .iter()
            .all(|v| v.is_finite());
        finite
            && self.high >= self.low
            && self.open <= self.high
            && self.open >= self.low
            && self.close <= self.high
            && self.close >= self.low
            && self.volume >= 0.0
    }

    /// Convert into a raw-stage record
    pub fn to_record(&self) -> StageRecord {
        StageRecord::new(
            self.date,
            vec![self.open, self.high, self.low, self.close, self.volume],
        )
    }
}

/// Pipeline stage owning one dataset per entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Raw,
    Technical,
    Labeled,
}

impl StageKind {
    /// Directory name of this stage under the data root
    pub fn dir_name(&self) -> &'static str {
        match self {
            StageKind::Raw => "00_historical",
            StageKind::Technical => "01_technical",
            StageKind::Labeled => "02_label",
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StageKind::Raw => "raw",
            StageKind::Technical => "technical",
            StageKind::Labeled => "labeled",
        };
        f.write_str(name)
    }
}

/// Explicit, ordered field set of a stage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    fields: Vec<String>,
}

impl Schema {
    /// Create a schema from field names
    pub fn new<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fields: fields.into_iter().map(Into::into).collect(),
        }
    }

    /// Schema of the raw price stage
    pub fn price() -> Self {
        Self::new(PRICE_FIELDS)
    }

    /// New schema with `extra` appended after the existing fields
    pub fn extend<I, S>(&self, extra: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut fields = self.fields.clone();
        fields.extend(extra.into_iter().map(Into::into));
        Self { fields }
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Column index of a field
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f == name)
    }

    /// Column index of a field, or a typed error naming the owner
    pub fn require(&self, name: &str, entity: &str) -> Result<usize> {
        self.index_of(name).ok_or_else(|| StocknubError::SchemaMismatch {
            entity: entity.to_string(),
            expected: name.to_string(),
            found: self.fields.join(","),
        })
    }
}

/// One dated row of named numeric fields; missing values are NaN
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    pub date: NaiveDate,
    pub values: Vec<f64>,
}

impl StageRecord {
    pub fn new(date: NaiveDate, values: Vec<f64>) -> Self {
        Self { date, values }
    }

    /// True when every value is finite
    pub fn is_complete(&self) -> bool {
        self.values.iter().all(|v| v.is_finite())
    }
}

/// Ordered records of one entity at one stage
#[derive(Debug, Clone, PartialEq)]
pub struct EntityDataset {
    pub entity: Entity,
    pub schema: Schema,
    pub records: Vec<StageRecord>,
}

impl EntityDataset {
    /// Create an empty dataset
    pub fn new(entity: impl Into<Entity>, schema: Schema) -> Self {
        Self {
            entity: entity.into(),
            schema,
            records: Vec::new(),
        }
    }

    /// Create a dataset from records, validating width and date order
    pub fn from_records(
        entity: impl Into<Entity>,
        schema: Schema,
        records: Vec<StageRecord>,
    ) -> Result<Self> {
        let dataset = Self {
            entity: entity.into(),
            schema,
            records,
        };
        dataset.validate()?;
        Ok(dataset)
    }

    /// Build a raw-stage dataset from bars
    pub fn from_bars(entity: impl Into<Entity>, bars: &[PriceBar]) -> Result<Self> {
        Self::from_records(
            entity,
            Schema::price(),
            bars.iter().map(PriceBar::to_record).collect(),
        )
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn first_date(&self) -> Option<NaiveDate> {
        self.records.first().map(|r| r.date)
    }

    pub fn last_date(&self) -> Option<NaiveDate> {
        self.records.last().map(|r| r.date)
    }

    /// Number of records strictly after `date`
    pub fn count_after(&self, date: NaiveDate) -> usize {
        self.records.len() - self.position_after(date)
    }

    /// Index of the first record strictly after `date`
    pub fn position_after(&self, date: NaiveDate) -> usize {
        self.records.partition_point(|r| r.date <= date)
    }

    /// Values of one column
    pub fn column(&self, name: &str) -> Option<Vec<f64>> {
        let idx = self.schema.index_of(name)?;
        Some(self.records.iter().map(|r| r.values[idx]).collect())
    }

    /// Interpret the records as OHLCV bars
    pub fn to_bars(&self) -> Result<Vec<PriceBar>> {
        let idx: Vec<usize> = PRICE_FIELDS
            .iter()
            .map(|f| self.schema.require(f, &self.entity))
            .collect::<Result<_>>()?;
        Ok(self
            .records
            .iter()
            .map(|r| {
                PriceBar::new(
                    r.date,
                    r.values[idx[0]],
                    r.values[idx[1]],
                    r.values[idx[2]],
                    r.values[idx[3]],
                    r.values[idx[4]],
                )
            })
            .collect())
    }

    /// Check record width and strictly increasing unique dates
    pub fn validate(&self) -> Result<()> {
        for (i, record) in self.records.iter().enumerate() {
            if record.values.len() != self.schema.len() {
                return Err(StocknubError::CorruptDataset {
                    path: self.entity.clone(),
                    reason: format!(
                        "row {} has {} values, schema has {}",
                        i,
                        record.values.len(),
                        self.schema.len()
                    ),
                });
            }
            if i > 0 && self.records[i - 1].date >= record.date {
                return Err(StocknubError::CorruptDataset {
                    path: self.entity.clone(),
                    reason: format!(
                        "dates not strictly increasing at row {} ({} then {})",
                        i,
                        self.records[i - 1].date,
                        record.date
                    ),
                });
            }
        }
        Ok(())
    }
}

/// Parse a `YYYY-MM-DD` date
pub fn parse_date(s: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(s.trim(), DATE_FORMAT)
        .map_err(|_| StocknubError::DataError(format!("Invalid date format: {}", s)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, day).unwrap()
    }

    #[test]
    fn test_bar_validation() {
        assert!(PriceBar::new(d(2), 100.0, 101.0, 99.0, 100.5, 1000.0).is_valid());
        // high < low
        assert!(!PriceBar::new(d(2), 100.0, 98.0, 99.0, 100.5, 1000.0).is_valid());
        assert!(!PriceBar::new(d(2), f64::NAN, 101.0, 99.0, 100.5, 1000.0).is_valid());
    }

    #[test]
    fn test_dataset_rejects_unordered_dates() {
        let records = vec![
            StageRecord::new(d(3), vec![1.0]),
            StageRecord::new(d(2), vec![1.0]),
        ];
        let result = EntityDataset::from_records("AAA", Schema::new(["x"]), records);
        assert!(matches!(result, Err(StocknubError::CorruptDataset { .. })));
    }

    #[test]
    fn test_dataset_rejects_duplicate_dates() {
        let records = vec![
            StageRecord::new(d(2), vec![1.0]),
            StageRecord::new(d(2), vec![2.0]),
        ];
        assert!(EntityDataset::from_records("AAA", Schema::new(["x"]), records).is_err());
    }

    #[test]
    fn test_position_after() {
        let records = (2..7).map(|day| StageRecord::new(d(day), vec![day as f64])).collect();
        let ds = EntityDataset::from_records("AAA", Schema::new(["x"]), records).unwrap();
        assert_eq!(ds.position_after(d(4)), 3);
        assert_eq!(ds.count_after(d(4)), 2);
        assert_eq!(ds.count_after(d(1)), 5);
        assert_eq!(ds.count_after(d(9)), 0);
        assert_eq!(ds.column("x").unwrap(), vec![2.0, 3.0, 4.0, 5.0, 6.0]);
    }

    #[test]
    fn test_schema_extend() {
        let schema = Schema::price().extend(["rsi_14"]);
        assert_eq!(schema.len(), 6);
        assert_eq!(schema.index_of("close"), Some(3));
        assert_eq!(schema.index_of("rsi_14"), Some(5));
        assert!(schema.require("missing", "AAA").is_err());
    }
}
