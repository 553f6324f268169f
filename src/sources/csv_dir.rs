//! Local CSV market data
//!
//! Reads `<dir>/<ENTITY>.csv` files with configurable column names. Useful
//! for offline runs and as a drop-in replacement for a network provider.

use super::MarketDataClient;
use crate::error::{Result, StocknubError};
use crate::types::PriceBar;
use chrono::NaiveDate;
use csv::{ReaderBuilder, StringRecord};
use std::path::PathBuf;

/// Column layout of the source files
#[derive(Debug, Clone)]
pub struct CsvFormat {
    pub date_column: String,
    pub open_column: String,
    pub high_column: String,
    pub low_column: String,
    pub close_column: String,
    pub volume_column: String,
    /// Date format string (e.g., "%Y-%m-%d")
    pub date_format: String,
}

impl Default for CsvFormat {
    fn default() -> Self {
        Self {
            date_column: "date".to_string(),
            open_column: "open".to_string(),
            high_column: "high".to_string(),
            low_column: "low".to_string(),
            close_column: "close".to_string(),
            volume_column: "volume".to_string(),
            date_format: "%Y-%m-%d".to_string(),
        }
    }
}

/// Market data read from a directory of per-ticker CSV files
#[derive(Debug, Clone)]
pub struct CsvDirectoryClient {
    dir: PathBuf,
    format: CsvFormat,
}

impl CsvDirectoryClient {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            format: CsvFormat::default(),
        }
    }

    pub fn with_format(dir: impl Into<PathBuf>, format: CsvFormat) -> Self {
        Self {
            dir: dir.into(),
            format,
        }
    }

    fn find_column(headers: &StringRecord, name: &str) -> Result<usize> {
        headers
            .iter()
            .position(|h| h.trim().eq_ignore_ascii_case(name))
            .ok_or_else(|| StocknubError::DataError(format!("Column '{}' not found", name)))
    }
}

impl MarketDataClient for CsvDirectoryClient {
    fn fetch(&self, entity: &str, start: NaiveDate, end: NaiveDate) -> Result<Vec<PriceBar>> {
        let path = self.dir.join(format!("{}.csv", entity));
        if !path.is_file() {
            return Err(StocknubError::UnknownTicker(entity.to_string()));
        }
        let failed = |reason: String| StocknubError::FetchFailed {
            entity: entity.to_string(),
            reason,
        };

        let mut rdr = ReaderBuilder::new()
            .has_headers(true)
            .from_path(&path)
            .map_err(|e| failed(format!("failed to open {}: {}", path.display(), e)))?;
        let headers = rdr
            .headers()
            .map_err(|e| failed(format!("failed to read headers: {}", e)))?
            .clone();

        let date_idx = Self::find_column(&headers, &self.format.date_column)?;
        let columns = [
            Self::find_column(&headers, &self.format.open_column)?,
            Self::find_column(&headers, &self.format.high_column)?,
            Self::find_column(&headers, &self.format.low_column)?,
            Self::find_column(&headers, &self.format.close_column)?,
            Self::find_column(&headers, &self.format.volume_column)?,
        ];

        let mut bars = Vec::new();
        for result in rdr.records() {
            let record = result.map_err(|e| failed(format!("failed to read record: {}", e)))?;

            let date_str = record
                .get(date_idx)
                .ok_or_else(|| failed("missing date".to_string()))?;
            let date = NaiveDate::parse_from_str(date_str.trim(), &self.format.date_format)
                .map_err(|_| failed(format!("invalid date format: {}", date_str)))?;
            if date < start || date > end {
                continue;
            }

            // Unparsable prices become NaN so the fetch stage drops the bar
            let mut values = [f64::NAN; 5];
            for (slot, &idx) in values.iter_mut().zip(columns.iter()) {
                *slot = record
                    .get(idx)
                    .and_then(|s| s.trim().parse::<f64>().ok())
                    .unwrap_or(f64::NAN);
            }
            bars.push(PriceBar::new(
                date, values[0], values[1], values[2], values[3], values[4],
            ));
        }

        bars.sort_by_key(|b| b.date);
        Ok(bars)
    }

    fn name(&self) -> &str {
        "csv"
    }
}
