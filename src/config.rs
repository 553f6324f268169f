//! Pipeline configuration
//!
//! Loaded from TOML; every field has a default so a partial file (or none at
//! all) is valid. `validate` is the single place configuration errors are
//! raised, before any per-entity work starts.

use crate::calendar::{ExchangeClock, UpdateMode};
use crate::error::{Result, StocknubError};
use crate::indicators::{default_indicators, max_lookback, IndicatorSpec};
use crate::labels::{LabelSpec, LabelType};
use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Root directory holding every stage's datasets
    pub data_dir: PathBuf,
    /// Maximum concurrent tasks
    pub workers: usize,
    pub fetch: FetchConfig,
    pub indicators: Vec<IndicatorSpec>,
    pub labels: LabelConfig,
    pub training: TrainingConfig,
    pub forecast: ForecastConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    /// First date requested when an entity has no raw data yet
    pub start_date: NaiveDate,
    pub update_mode: UpdateMode,
    /// IANA name of the exchange timezone
    pub exchange_timezone: String,
    /// Exchange-local close time
    pub market_close: NaiveTime,
    /// Newline-separated ticker list
    pub universe_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LabelConfig {
    pub types: Vec<LabelType>,
    pub windows: Vec<usize>,
    pub target_field: String,
    /// Trailing rows replayed before new rows in the label stage
    pub context_rows: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    pub min_clean_rows: usize,
    /// Share of the most recent clean rows held out for testing
    pub test_fraction: f64,
    /// Minimum rows of each class in the training portion
    pub min_class_samples: usize,
    pub learning_rate: f64,
    pub epochs: usize,
    pub l2: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ForecastConfig {
    /// Minimum test Gini an entity needs on every requested pair
    pub min_test_score: Option<f64>,
    /// Explicit entity list; bypasses score filtering
    pub allow_list: Option<Vec<String>>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data/stock"),
            workers: default_workers(),
            fetch: FetchConfig::default(),
            indicators: default_indicators(),
            labels: LabelConfig::default(),
            training: TrainingConfig::default(),
            forecast: ForecastConfig::default(),
        }
    }
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            start_date: NaiveDate::from_ymd_opt(2021, 1, 1).unwrap_or_default(),
            update_mode: UpdateMode::Yesterday,
            exchange_timezone: "Asia/Jakarta".to_string(),
            market_close: NaiveTime::from_hms_opt(16, 0, 0).unwrap_or_default(),
            universe_file: None,
        }
    }
}

impl Default for LabelConfig {
    fn default() -> Self {
        Self {
            types: vec![LabelType::MedianGain, LabelType::MaxLoss],
            windows: vec![5, 10],
            target_field: "close".to_string(),
            context_rows: 0,
        }
    }
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            min_clean_rows: 100,
            test_fraction: 0.1,
            min_class_samples: 10,
            learning_rate: 0.1,
            epochs: 300,
            l2: 0.01,
        }
    }
}

impl PipelineConfig {
    /// Load from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    /// Reject invalid settings before any work starts
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(StocknubError::ConfigError("workers must be at least 1".into()));
        }
        if self.indicators.is_empty() {
            return Err(StocknubError::ConfigError(
                "at least one indicator is required".into(),
            ));
        }
        let mut names = HashSet::new();
        for spec in &self.indicators {
            spec.validate()?;
            if !names.insert(spec.name()) {
                return Err(StocknubError::ConfigError(format!(
                    "duplicate indicator {}",
                    spec.name()
                )));
            }
        }
        if self.labels.types.is_empty() || self.labels.windows.is_empty() {
            return Err(StocknubError::ConfigError(
                "at least one label type and one window are required".into(),
            ));
        }
        let mut types = HashSet::new();
        for &t in &self.labels.types {
            if !types.insert(t) {
                return Err(StocknubError::ConfigError(format!("duplicate label type {}", t)));
            }
        }
        let mut windows = HashSet::new();
        for &w in &self.labels.windows {
            if w == 0 {
                return Err(StocknubError::ConfigError("label windows must be positive".into()));
            }
            if !windows.insert(w) {
                return Err(StocknubError::ConfigError(format!("duplicate window {}", w)));
            }
        }
        if !(self.training.test_fraction > 0.0 && self.training.test_fraction < 1.0) {
            return Err(StocknubError::ConfigError(
                "test_fraction must be between 0 and 1".into(),
            ));
        }
        if self.training.min_clean_rows < 2 {
            return Err(StocknubError::ConfigError(
                "min_clean_rows must be at least 2".into(),
            ));
        }
        self.exchange_clock()?;
        Ok(())
    }

    pub fn exchange_clock(&self) -> Result<ExchangeClock> {
        ExchangeClock::from_name(&self.fetch.exchange_timezone, self.fetch.market_close)
    }

    /// Lookback the technical stage replays
    pub fn indicator_lookback(&self) -> usize {
        max_lookback(&self.indicators)
    }

    /// Every (label type, window) column, in configuration order
    pub fn label_specs(&self) -> Vec<LabelSpec> {
        self.labels
            .types
            .iter()
            .flat_map(|&t| {
                self.labels
                    .windows
                    .iter()
                    .map(move |&w| LabelSpec::new(t, w, self.labels.target_field.clone()))
            })
            .collect()
    }

    /// Feature column names, in configuration order
    pub fn feature_names(&self) -> Vec<String> {
        self.indicators.iter().map(IndicatorSpec::name).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = PipelineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.training.min_clean_rows, 100);
        assert_eq!(config.label_specs().len(), 4);
    }

    #[test]
    fn test_partial_toml() {
        let config = PipelineConfig::from_toml(
            r#"
            data_dir = "/tmp/stocks"
            workers = 3

            [fetch]
            update_mode = "today"
            exchange_timezone = "America/New_York"
            market_close = "16:00:00"

            [[indicators]]
            kind = "rsi"
            period = 14

            [[indicators]]
            kind = "bollinger_percent_b"
            period = 20
            num_std_dev = 2.0

            [labels]
            types = ["linear_trend"]
            windows = [5]

            [forecast]
            min_test_score = 0.3
            "#,
        )
        .unwrap();
        config.validate().unwrap();
        assert_eq!(config.workers, 3);
        assert_eq!(config.fetch.update_mode, UpdateMode::Today);
        assert_eq!(config.indicators.len(), 2);
        assert_eq!(config.indicator_lookback(), 19);
        assert_eq!(config.labels.types, vec![LabelType::LinearTrend]);
        assert_eq!(config.labels.target_field, "close");
        assert_eq!(config.forecast.min_test_score, Some(0.3));
    }

    #[test]
    fn test_unknown_label_type_in_toml() {
        let result = PipelineConfig::from_toml("[labels]\ntypes = [\"bogus\"]\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = PipelineConfig::default();
        config.workers = 0;
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.labels.windows = vec![5, 5];
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.labels.types = vec![LabelType::MaxLoss, LabelType::MaxLoss];
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate label type max_loss"));

        let mut config = PipelineConfig::default();
        config.fetch.exchange_timezone = "Nowhere/Land".to_string();
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.training.test_fraction = 1.0;
        assert!(config.validate().is_err());
    }
}
