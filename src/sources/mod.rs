//! Market-data clients
//!
//! The fetch stage only sees the [`MarketDataClient`] trait:
//! - `CsvDirectoryClient`: one CSV file per ticker in a local directory
//! - `YahooClient`: Yahoo Finance daily chart endpoint (`async` feature)

pub mod csv_dir;
#[cfg(feature = "async")]
pub mod yahoo;

pub use csv_dir::{CsvDirectoryClient, CsvFormat};
#[cfg(feature = "async")]
pub use yahoo::YahooClient;

use crate::error::Result;
use crate::types::PriceBar;
use chrono::NaiveDate;

/// Source of daily OHLCV bars
///
/// Implementations enforce their own timeouts and report unreachable
/// providers as `FetchFailed` and unknown symbols as `UnknownTicker`.
pub trait MarketDataClient: Send + Sync {
    /// Bars for `entity` dated within `[start, end]`, in date order
    fn fetch(&self, entity: &str, start: NaiveDate, end: NaiveDate) -> Result<Vec<PriceBar>>;

    /// Name used in log messages
    fn name(&self) -> &str;
}
