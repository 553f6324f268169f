//! Stage orchestration
//!
//! `Pipeline` owns the configuration and the scheduler and runs each stage
//! as one scheduler invocation over the entity universe:
//! fetch -> technical -> labels -> train -> forecast.

use crate::config::PipelineConfig;
use crate::error::{Result, StocknubError};
use crate::forecast::{eligible_entities, ForecastEngine, ForecastRecord};
use crate::indicators::{BuiltinIndicators, IndicatorLibrary};
use crate::labels::LabelType;
use crate::model::{LogisticTrainer, Trainer};
use crate::registry::{ModelRegistry, TrainingJob};
use crate::scheduler::{RunReport, Scheduler};
use crate::sources::MarketDataClient;
use crate::stages::{technical_schema, FetchStage, LabelStage, StageUpdate, TechnicalStage};
use crate::store::DatasetStore;
use crate::types::{Entity, StageKind};
use chrono::{DateTime, Utc};
use hashbrown::HashMap;
use serde::Serialize;
use std::collections::HashSet;
use std::fs;
use std::sync::Arc;
use uuid::Uuid;

/// Success payload of one training task
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TrainingSummary {
    pub label_type: LabelType,
    pub window: usize,
    pub threshold: f64,
    pub train_gini: Option<f64>,
    pub test_gini: Option<f64>,
}

/// Reports of a full pipeline run, one per stage invocation
#[derive(Debug, Clone)]
pub struct PipelineReport {
    pub run_id: Uuid,
    pub fetch: Option<RunReport<StageUpdate>>,
    pub technical: RunReport<StageUpdate>,
    pub labels: RunReport<StageUpdate>,
    pub train: RunReport<TrainingSummary>,
    pub forecast: Vec<RunReport<ForecastRecord>>,
}

impl PipelineReport {
    pub fn total_failures(&self) -> usize {
        self.fetch.as_ref().map_or(0, |r| r.summary().failed)
            + self.technical.summary().failed
            + self.labels.summary().failed
            + self.train.summary().failed
            + self.forecast.iter().map(|r| r.summary().failed).sum::<usize>()
    }
}

/// Configured pipeline
pub struct Pipeline {
    config: PipelineConfig,
    scheduler: Scheduler,
    library: Arc<dyn IndicatorLibrary>,
    trainer: Arc<dyn Trainer>,
    force: bool,
}

impl Pipeline {
    /// Validate the configuration and build the default backends
    pub fn new(config: PipelineConfig) -> Result<Self> {
        config.validate()?;
        let trainer = LogisticTrainer {
            learning_rate: config.training.learning_rate,
            epochs: config.training.epochs,
            l2: config.training.l2,
        };
        Ok(Self {
            scheduler: Scheduler::new(config.workers),
            config,
            library: Arc::new(BuiltinIndicators),
            trainer: Arc::new(trainer),
            force: false,
        })
    }

    /// Treat every entity as having no downstream data
    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    pub fn with_scheduler(mut self, scheduler: Scheduler) -> Self {
        self.scheduler = scheduler;
        self
    }

    pub fn with_indicator_library(mut self, library: Arc<dyn IndicatorLibrary>) -> Self {
        self.library = library;
        self
    }

    pub fn with_trainer(mut self, trainer: Arc<dyn Trainer>) -> Self {
        self.trainer = trainer;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn store(&self, stage: StageKind) -> DatasetStore {
        DatasetStore::new(&self.config.data_dir, stage)
    }

    pub fn registry(&self) -> ModelRegistry {
        ModelRegistry::new(&self.config.data_dir)
    }

    /// Every configured (label type, window) pair
    pub fn pairs(&self) -> Vec<(LabelType, usize)> {
        self.config
            .labels
            .types
            .iter()
            .flat_map(|&t| self.config.labels.windows.iter().map(move |&w| (t, w)))
            .collect()
    }

    /// Explicit tickers, else the universe file; `None` when neither is set
    fn requested_tickers(&self, tickers: Option<&[String]>) -> Result<Option<Vec<Entity>>> {
        let requested: Vec<String> = match tickers {
            Some(list) if !list.is_empty() => list.to_vec(),
            _ => match &self.config.fetch.universe_file {
                Some(path) => fs::read_to_string(path)?.lines().map(str::to_string).collect(),
                None => return Ok(None),
            },
        };
        let mut seen = HashSet::new();
        Ok(Some(
            requested
                .into_iter()
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty() && !t.starts_with('#'))
                .filter(|t| seen.insert(t.clone()))
                .collect(),
        ))
    }

    /// Entities for the fetch stage. New tickers are expected here, so
    /// nothing is checked against the raw store.
    pub fn resolve_fetch_universe(&self, tickers: Option<&[String]>) -> Result<Vec<Entity>> {
        match self.requested_tickers(tickers)? {
            Some(entities) => Ok(entities),
            None => self.store(StageKind::Raw).list_entities(),
        }
    }

    /// Entities for a stage reading `upstream`: explicit tickers, then the
    /// universe file, then whatever the upstream store already holds.
    /// Requested tickers without upstream data are reported and kept; their
    /// tasks end up as skips.
    pub fn resolve_universe(&self, tickers: Option<&[String]>, upstream: StageKind) -> Result<Vec<Entity>> {
        let store = self.store(upstream);
        let entities = match self.requested_tickers(tickers)? {
            Some(entities) => entities,
            None => return store.list_entities(),
        };
        let missing: Vec<&str> = entities
            .iter()
            .filter(|e| !store.exists(e))
            .map(String::as_str)
            .collect();
        if !missing.is_empty() {
            log::warn!(
                "{} requested tickers have no {} data: {}",
                missing.len(),
                upstream,
                missing.join(", ")
            );
        }
        Ok(entities)
    }

    /// Bring raw prices up to the session boundary at `now`
    pub fn fetch(
        &self,
        client: Arc<dyn MarketDataClient>,
        entities: &[Entity],
        now: DateTime<Utc>,
    ) -> Result<RunReport<StageUpdate>> {
        let end_date = self
            .config
            .exchange_clock()?
            .end_date(self.config.fetch.update_mode, now);
        log::info!(
            "Fetching {} tickers from {} up to {} ({} mode)",
            entities.len(),
            client.name(),
            end_date,
            self.config.fetch.update_mode
        );
        let stage = FetchStage::new(
            self.store(StageKind::Raw),
            client,
            self.config.fetch.start_date,
            end_date,
            self.force,
        );
        self.scheduler.run("fetch", entities.to_vec(), |e| stage.run(e))
    }

    pub fn technical(&self, entities: &[Entity]) -> Result<RunReport<StageUpdate>> {
        let stage = self.technical_stage();
        self.scheduler.run("technical", entities.to_vec(), |e| stage.run(e))
    }

    pub fn labels(&self, entities: &[Entity]) -> Result<RunReport<StageUpdate>> {
        let stage = LabelStage::new(
            self.store(StageKind::Technical),
            self.store(StageKind::Labeled),
            technical_schema(&self.config.indicators),
            self.config.label_specs(),
            self.config.labels.context_rows,
            self.force,
        );
        self.scheduler.run("labels", entities.to_vec(), |e| stage.run(e))
    }

    fn technical_stage(&self) -> TechnicalStage {
        TechnicalStage::new(
            self.store(StageKind::Raw),
            self.store(StageKind::Technical),
            self.config.indicators.clone(),
            self.library.clone(),
            self.force,
        )
    }

    /// One task per (entity, label type, window); rebuilds the performance
    /// summaries afterwards.
    pub fn train(&self, entities: &[Entity], run_id: Uuid) -> Result<RunReport<TrainingSummary>> {
        let registry = self.registry();
        let labeled = self.store(StageKind::Labeled);
        let features = self.config.feature_names();
        let job = TrainingJob::new(
            self.trainer.as_ref(),
            &self.config.training,
            &features,
            run_id,
        );

        let pairs = self.pairs();
        let mut tasks: HashMap<String, (Entity, LabelType, usize)> = HashMap::new();
        let mut keys = Vec::with_capacity(entities.len() * pairs.len());
        for entity in entities {
            for &(label_type, window) in &pairs {
                let key = format!("{} {}_{}d", entity, label_type, window);
                tasks.insert(key.clone(), (entity.clone(), label_type, window));
                keys.push(key);
            }
        }

        let report = self.scheduler.run("train", keys, |key| {
            let (entity, label_type, window) = tasks
                .get(key)
                .ok_or_else(|| StocknubError::DataError(format!("unknown training task {}", key)))?;
            let dataset = labeled
                .load(entity)?
                .ok_or_else(|| StocknubError::NoUpstreamData {
                    entity: entity.clone(),
                    stage: StageKind::Labeled.to_string(),
                })?;
            let trained = job.train(&dataset, *label_type, *window)?;
            registry.save(&trained)?;
            Ok(TrainingSummary {
                label_type: *label_type,
                window: *window,
                threshold: trained.record.threshold,
                train_gini: trained.record.train.gini,
                test_gini: trained.record.test.gini,
            })
        })?;

        for (label_type, window) in pairs {
            registry.write_summary(label_type, window)?;
        }
        Ok(report)
    }

    /// Score eligible entities for every pair and replace the forecast files
    pub fn forecast(&self) -> Result<Vec<RunReport<ForecastRecord>>> {
        let registry = self.registry();
        let pairs = self.pairs();
        let eligible = eligible_entities(
            &registry,
            &pairs,
            self.config.forecast.min_test_score,
            self.config.forecast.allow_list.as_deref(),
        )?;
        log::info!("{} entities eligible for forecasting", eligible.len());

        let engine = ForecastEngine::new(&self.config.data_dir, registry, self.store(StageKind::Technical));
        engine.run(&self.scheduler, &pairs, &eligible)
    }

    /// Run every stage in order. Without a client the fetch stage is skipped
    /// and the existing raw store is used as is.
    pub fn run_all(
        &self,
        client: Option<Arc<dyn MarketDataClient>>,
        tickers: Option<&[String]>,
        now: DateTime<Utc>,
    ) -> Result<PipelineReport> {
        let run_id = Uuid::new_v4();
        log::info!("Starting pipeline run {}", run_id);

        let (entities, fetch) = match client {
            Some(client) => {
                let entities = self.resolve_fetch_universe(tickers)?;
                let report = self.fetch(client, &entities, now)?;
                (entities, Some(report))
            }
            None => (self.resolve_universe(tickers, StageKind::Raw)?, None),
        };
        let technical = self.technical(&entities)?;
        let labels = self.labels(&entities)?;
        let train = self.train(&entities, run_id)?;
        let forecast = self.forecast()?;

        let report = PipelineReport {
            run_id,
            fetch,
            technical,
            labels,
            train,
            forecast,
        };
        log::info!(
            "Pipeline run {} finished with {} failures",
            run_id,
            report.total_failures()
        );
        Ok(report)
    }
}
