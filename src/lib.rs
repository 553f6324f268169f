//! # rusty_stocknub
//!
//! Incremental materialization engine for a daily stock pipeline:
//! raw prices -> technical indicators -> forward labels -> per-ticker models
//! -> forecasts.
//!
//! Every stage keeps one CSV dataset per ticker and only recomputes what is
//! new. A stage compares its dataset with the upstream one, replays just
//! enough trailing context for windowed indicators, holds back rows whose
//! forward label window is incomplete, and appends the result. Re-running a
//! stage on up-to-date data is a no-op.
//!
//! ## Example
//!
//! ```rust,no_run
//! use rusty_stocknub::prelude::*;
//! use std::sync::Arc;
//!
//! fn main() -> Result<()> {
//!     let config = PipelineConfig::from_file("stocknub.toml".as_ref())?;
//!     let pipeline = Pipeline::new(config)?;
//!     let client: Arc<dyn MarketDataClient> = Arc::new(CsvDirectoryClient::new("prices"));
//!     let report = pipeline.run_all(Some(client), None, chrono::Utc::now())?;
//!     println!("{}", report.technical.summary());
//!     Ok(())
//! }
//! ```

pub mod calendar;
pub mod config;
pub mod error;
pub mod forecast;
pub mod indicators;
pub mod labels;
pub mod model;
pub mod orchestrator;
pub mod planner;
pub mod registry;
pub mod scheduler;
pub mod sources;
pub mod stages;
pub mod store;
pub mod types;
pub mod watermark;
pub mod writer;

pub mod prelude {
    //! Commonly used types and traits
    pub use crate::calendar::{ExchangeClock, UpdateMode};
    pub use crate::config::PipelineConfig;
    pub use crate::error::{ErrorCategory, Result, StocknubError};
    pub use crate::forecast::{eligible_entities, ForecastEngine, ForecastRecord};
    pub use crate::indicators::{IndicatorLibrary, IndicatorSpec};
    pub use crate::labels::{LabelSpec, LabelType};
    pub use crate::model::{FittedModel, Trainer};
    pub use crate::orchestrator::{Pipeline, PipelineReport};
    pub use crate::planner::{PlanMode, RecomputePlan, RecomputePlanner};
    pub use crate::registry::{ModelArtifact, ModelRegistry, PerformanceRecord};
    pub use crate::scheduler::{Outcome, RunReport, RunSummary, Scheduler};
    pub use crate::sources::{CsvDirectoryClient, MarketDataClient};
    pub use crate::stages::StageUpdate;
    pub use crate::store::DatasetStore;
    pub use crate::types::*;
    pub use crate::watermark::Watermark;
}
