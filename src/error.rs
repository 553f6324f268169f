//! Error types for the stocknub pipeline

use chrono::NaiveDate;
use thiserror::Error;

/// Coarse classification used by the scheduler and the run summary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Network or upstream provider trouble; retried on the next scheduled run
    Transient,
    /// Not enough usable data; reported as a skip, not a failure
    DataInsufficiency,
    /// The durable store is inconsistent; never repaired automatically
    Integrity,
    /// Invalid invocation; raised before any work starts
    Configuration,
    /// Anything else
    Unexpected,
}

/// Main error type for the pipeline
#[derive(Error, Debug)]
pub enum StocknubError {
    // ========== Transient ==========
    #[error("Fetch failed for {entity}: {reason}")]
    FetchFailed { entity: String, reason: String },

    #[error("Unknown ticker: {0}")]
    UnknownTicker(String),

    // ========== Data insufficiency ==========
    #[error("Insufficient clean rows: {available} available, {required} required")]
    InsufficientRows { available: usize, required: usize },

    #[error("Label column '{0}' not present in dataset")]
    MissingLabelColumn(String),

    #[error("Insufficient positive samples: {found} found, {required} required")]
    InsufficientPositiveSamples { found: usize, required: usize },

    #[error("Insufficient negative samples: {found} found, {required} required")]
    InsufficientNegativeSamples { found: usize, required: usize },

    #[error("No price variation (likely suspended/delisted, variance={variance:.2e})")]
    NoPriceVariation { variance: f64 },

    #[error("Dataset is empty: {0}")]
    EmptyDataset(String),

    #[error("No upstream data for {entity} in stage '{stage}'")]
    NoUpstreamData { entity: String, stage: String },

    // ========== Integrity ==========
    #[error(
        "Non-monotonic append for {entity}: first new date {first_new} is not after existing last date {existing_last}"
    )]
    NonMonotonicAppend {
        entity: String,
        first_new: NaiveDate,
        existing_last: NaiveDate,
    },

    #[error("Corrupt dataset {path}: {reason}")]
    CorruptDataset { path: String, reason: String },

    #[error("Schema mismatch for {entity}: expected [{expected}], found [{found}] (rerun with --force)")]
    SchemaMismatch {
        entity: String,
        expected: String,
        found: String,
    },

    #[error("Downstream dataset for {entity} ends at {downstream_last}, after upstream end {upstream_last}")]
    DownstreamAhead {
        entity: String,
        downstream_last: NaiveDate,
        upstream_last: NaiveDate,
    },

    // ========== Configuration ==========
    #[error("Unknown label type: {0}")]
    UnknownLabelType(String),

    #[error("No trained artifacts for {label_type} {window}dd")]
    NoTrainedArtifacts { label_type: String, window: usize },

    #[error("Configuration error: {0}")]
    ConfigError(String),

    // ========== Unexpected ==========
    #[error("Model not found: {0}")]
    ModelNotFound(String),

    #[error("Missing features: {0:?}")]
    MissingFeatures(Vec<String>),

    #[error("Task panicked: {0}")]
    TaskPanicked(String),

    #[error("Data error: {0}")]
    DataError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    CsvError(#[from] csv::Error),

    #[error("Serialization error: {0}")]
    SerdeError(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    TomlError(#[from] toml::de::Error),
}

impl StocknubError {
    /// Classify this error
    pub fn category(&self) -> ErrorCategory {
        use StocknubError::*;
        match self {
            FetchFailed { .. } | UnknownTicker(_) => ErrorCategory::Transient,
            InsufficientRows { .. }
            | MissingLabelColumn(_)
            | InsufficientPositiveSamples { .. }
            | InsufficientNegativeSamples { .. }
            | NoPriceVariation { .. }
            | EmptyDataset(_)
            | NoUpstreamData { .. } => ErrorCategory::DataInsufficiency,
            NonMonotonicAppend { .. }
            | CorruptDataset { .. }
            | SchemaMismatch { .. }
            | DownstreamAhead { .. } => ErrorCategory::Integrity,
            UnknownLabelType(_) | NoTrainedArtifacts { .. } | ConfigError(_) => {
                ErrorCategory::Configuration
            }
            _ => ErrorCategory::Unexpected,
        }
    }

    /// Whether the scheduler should record this as a skip
    pub fn is_skip(&self) -> bool {
        self.category() == ErrorCategory::DataInsufficiency
    }
}

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, StocknubError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_non_monotonic_message() {
        let err = StocknubError::NonMonotonicAppend {
            entity: "AAA".to_string(),
            first_new: NaiveDate::from_ymd_opt(2024, 1, 2).unwrap(),
            existing_last: NaiveDate::from_ymd_opt(2024, 1, 3).unwrap(),
        };
        let msg = err.to_string();
        assert!(msg.contains("AAA"));
        assert!(msg.contains("2024-01-02"));
        assert!(msg.contains("2024-01-03"));
        assert_eq!(err.category(), ErrorCategory::Integrity);
    }

    #[test]
    fn test_skip_classification() {
        let err = StocknubError::InsufficientRows {
            available: 40,
            required: 100,
        };
        assert!(err.is_skip());
        assert!(!StocknubError::ModelNotFound("x".to_string()).is_skip());
        assert_eq!(
            StocknubError::UnknownTicker("ZZZ".to_string()).category(),
            ErrorCategory::Transient
        );
        assert_eq!(
            StocknubError::UnknownLabelType("foo".to_string()).category(),
            ErrorCategory::Configuration
        );
    }
}
