//! Stage drivers
//!
//! Each driver materializes one downstream dataset for one entity:
//! raw prices from a market-data client, technical indicators from raw
//! prices, and forward labels from the technical dataset. All three follow
//! the same sequence: resolve the watermark, plan the recompute, compute,
//! then append or replace through the writer.

use crate::error::{Result, StocknubError};
use crate::indicators::{max_lookback, IndicatorLibrary, IndicatorSpec};
use crate::labels::{max_window, LabelSpec};
use crate::planner::{PlanMode, RecomputePlanner};
use crate::sources::MarketDataClient;
use crate::store::DatasetStore;
use crate::types::{EntityDataset, PriceBar, Schema, StageKind, StageRecord};
use crate::watermark;
use crate::writer;
use chrono::{Duration, NaiveDate};
use serde::Serialize;
use statrs::statistics::Statistics;
use std::fmt;
use std::sync::Arc;

/// Below this close-price variance an entity is treated as suspended
pub const MIN_PRICE_VARIANCE: f64 = 1e-10;

/// What one stage run did for one entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StageUpdate {
    pub mode: UpdateKind,
    /// Upstream rows replayed as context only
    pub context_rows: usize,
    pub rows_written: usize,
    /// New rows held back until their forward window is complete
    pub pending_rows: usize,
    /// Rows computed but dropped as invalid or incomplete
    pub dropped_rows: usize,
}

/// Serializable mirror of [`PlanMode`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateKind {
    Noop,
    Incremental,
    Full,
}

impl From<PlanMode> for UpdateKind {
    fn from(mode: PlanMode) -> Self {
        match mode {
            PlanMode::Noop => UpdateKind::Noop,
            PlanMode::Incremental => UpdateKind::Incremental,
            PlanMode::Full => UpdateKind::Full,
        }
    }
}

impl StageUpdate {
    pub fn noop() -> Self {
        Self {
            mode: UpdateKind::Noop,
            context_rows: 0,
            rows_written: 0,
            pending_rows: 0,
            dropped_rows: 0,
        }
    }
}

impl fmt::Display for StageUpdate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.mode {
            UpdateKind::Noop => f.write_str("up to date"),
            UpdateKind::Incremental => write!(
                f,
                "appended {} rows ({} context, {} pending)",
                self.rows_written, self.context_rows, self.pending_rows
            ),
            UpdateKind::Full => write!(
                f,
                "rebuilt {} rows ({} pending)",
                self.rows_written, self.pending_rows
            ),
        }
    }
}

fn no_upstream(entity: &str, stage: StageKind) -> StocknubError {
    StocknubError::NoUpstreamData {
        entity: entity.to_string(),
        stage: stage.to_string(),
    }
}

// ========== Fetch ==========

/// Raw price stage fed by a market-data client
pub struct FetchStage {
    raw: DatasetStore,
    client: Arc<dyn MarketDataClient>,
    start_date: NaiveDate,
    end_date: NaiveDate,
    force: bool,
}

impl FetchStage {
    /// `end_date` is the resolved session boundary for this run
    pub fn new(
        raw: DatasetStore,
        client: Arc<dyn MarketDataClient>,
        start_date: NaiveDate,
        end_date: NaiveDate,
        force: bool,
    ) -> Self {
        Self {
            raw,
            client,
            start_date,
            end_date,
            force,
        }
    }

    pub fn run(&self, entity: &str) -> Result<StageUpdate> {
        let schema = Schema::price();
        let existing = if self.force {
            None
        } else {
            self.raw.load_with_schema(entity, &schema)?
        };
        let existing_last = existing.as_ref().and_then(EntityDataset::last_date);

        let start = match existing_last {
            Some(last) => last + Duration::days(1),
            None => self.start_date,
        };
        if start > self.end_date {
            log::debug!("{}: raw data already reaches {}", entity, self.end_date);
            return Ok(StageUpdate::noop());
        }

        let fetched = self.client.fetch(entity, start, self.end_date)?;
        let fetched_len = fetched.len();
        let bars: Vec<PriceBar> = fetched
            .into_iter()
            .filter(|b| b.date >= start && b.date <= self.end_date)
            .filter(|b| {
                let valid = b.is_valid();
                if !valid {
                    log::warn!(
                        "{}: dropping invalid bar on {} (O={} H={} L={} C={} V={})",
                        entity,
                        b.date,
                        b.open,
                        b.high,
                        b.low,
                        b.close,
                        b.volume
                    );
                }
                valid
            })
            .collect();
        let dropped_rows = fetched_len - bars.len();
        let records: Vec<StageRecord> = bars.iter().map(PriceBar::to_record).collect();

        match existing {
            Some(existing) => {
                if records.is_empty() {
                    log::debug!("{}: {} returned no new bars", entity, self.client.name());
                    return Ok(StageUpdate {
                        dropped_rows,
                        ..StageUpdate::noop()
                    });
                }
                let rows_written = writer::append(&self.raw, &existing, &records)?;
                Ok(StageUpdate {
                    mode: UpdateKind::Incremental,
                    context_rows: 0,
                    rows_written,
                    pending_rows: 0,
                    dropped_rows,
                })
            }
            None => {
                if records.is_empty() {
                    return Err(StocknubError::EmptyDataset(format!(
                        "{} returned no bars for {} between {} and {}",
                        self.client.name(),
                        entity,
                        start,
                        self.end_date
                    )));
                }
                let dataset = EntityDataset::from_records(entity, schema, records)?;
                let rows_written = writer::replace(&self.raw, &dataset)?;
                Ok(StageUpdate {
                    mode: UpdateKind::Full,
                    context_rows: 0,
                    rows_written,
                    pending_rows: 0,
                    dropped_rows,
                })
            }
        }
    }
}

// ========== Technical ==========

/// Indicator stage: raw prices in, raw fields plus indicators out
pub struct TechnicalStage {
    raw: DatasetStore,
    technical: DatasetStore,
    indicators: Vec<IndicatorSpec>,
    library: Arc<dyn IndicatorLibrary>,
    schema: Schema,
    force: bool,
}

impl TechnicalStage {
    pub fn new(
        raw: DatasetStore,
        technical: DatasetStore,
        indicators: Vec<IndicatorSpec>,
        library: Arc<dyn IndicatorLibrary>,
        force: bool,
    ) -> Self {
        let schema = technical_schema(&indicators);
        Self {
            raw,
            technical,
            indicators,
            library,
            schema,
            force,
        }
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn lookback(&self) -> usize {
        max_lookback(&self.indicators)
    }

    pub fn run(&self, entity: &str) -> Result<StageUpdate> {
        let upstream = self
            .raw
            .load_with_schema(entity, &Schema::price())?
            .ok_or_else(|| no_upstream(entity, StageKind::Raw))?;
        if upstream.is_empty() {
            return Err(StocknubError::EmptyDataset(format!("raw data for {}", entity)));
        }
        let downstream = if self.force {
            None
        } else {
            self.technical.load_with_schema(entity, &self.schema)?
        };

        let mark = watermark::resolve(&upstream, downstream.as_ref(), self.force)?;
        let lookback = self.lookback();
        let plan = RecomputePlanner::new(lookback, 0).plan(
            mark,
            &upstream,
            downstream.as_ref().and_then(EntityDataset::last_date),
        );
        log::debug!("{}: technical {} -> {:?}", entity, mark, plan);
        if plan.is_noop() {
            return Ok(StageUpdate::noop());
        }

        let closes = upstream.column("close").unwrap_or_default();
        let variance = closes.iter().copied().variance();
        if !(variance >= MIN_PRICE_VARIANCE) {
            return Err(StocknubError::NoPriceVariation { variance });
        }

        let bars = upstream.to_bars()?;
        let input = &bars[plan.input.clone()];
        let series: Vec<Vec<f64>> = self
            .indicators
            .iter()
            .map(|spec| self.library.compute(spec, input))
            .collect();

        let mut rows = Vec::with_capacity(plan.persist_len());
        for offset in plan.persist_in_input() {
            let source = &upstream.records[plan.input.start + offset];
            let mut values = source.values.clone();
            values.extend(series.iter().map(|s| s.get(offset).copied().unwrap_or(f64::NAN)));
            let record = StageRecord::new(source.date, values);
            if record.is_complete() {
                rows.push(record);
            }
        }
        let dropped_rows = plan.persist_len() - rows.len();

        let rows_written = match (plan.mode, downstream) {
            (PlanMode::Incremental, Some(existing)) => writer::append(&self.technical, &existing, &rows)?,
            _ => {
                if rows.is_empty() {
                    return Err(StocknubError::InsufficientRows {
                        available: upstream.len(),
                        required: lookback + 1,
                    });
                }
                let dataset = EntityDataset::from_records(entity, self.schema.clone(), rows)?;
                writer::replace(&self.technical, &dataset)?
            }
        };

        Ok(StageUpdate {
            mode: plan.mode.into(),
            context_rows: plan.context_len(),
            rows_written,
            pending_rows: 0,
            dropped_rows,
        })
    }
}

/// Raw fields followed by one column per indicator
pub fn technical_schema(indicators: &[IndicatorSpec]) -> Schema {
    Schema::price().extend(indicators.iter().map(IndicatorSpec::name))
}

// ========== Labels ==========

/// Label stage: technical rows in, technical rows plus label columns out
pub struct LabelStage {
    technical: DatasetStore,
    labeled: DatasetStore,
    specs: Vec<LabelSpec>,
    upstream_schema: Schema,
    schema: Schema,
    context_rows: usize,
    force: bool,
}

impl LabelStage {
    pub fn new(
        technical: DatasetStore,
        labeled: DatasetStore,
        upstream_schema: Schema,
        specs: Vec<LabelSpec>,
        context_rows: usize,
        force: bool,
    ) -> Self {
        let schema = upstream_schema.extend(specs.iter().map(LabelSpec::column_name));
        Self {
            technical,
            labeled,
            specs,
            upstream_schema,
            schema,
            context_rows,
            force,
        }
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Future rows the longest label needs
    pub fn lookahead(&self) -> usize {
        max_window(&self.specs)
    }

    pub fn run(&self, entity: &str) -> Result<StageUpdate> {
        let upstream = self
            .technical
            .load_with_schema(entity, &self.upstream_schema)?
            .ok_or_else(|| no_upstream(entity, StageKind::Technical))?;
        if upstream.is_empty() {
            return Err(StocknubError::EmptyDataset(format!("technical data for {}", entity)));
        }
        let downstream = if self.force {
            None
        } else {
            self.labeled.load_with_schema(entity, &self.schema)?
        };

        let mark = watermark::resolve(&upstream, downstream.as_ref(), self.force)?;
        let plan = RecomputePlanner::new(self.context_rows, self.lookahead())
            .keeping_warm_up()
            .plan(
                mark,
                &upstream,
                downstream.as_ref().and_then(EntityDataset::last_date),
            );
        log::debug!("{}: labels {} -> {:?}", entity, mark, plan);
        if plan.is_noop() {
            return Ok(StageUpdate::noop());
        }

        let target_fields: Vec<usize> = self
            .specs
            .iter()
            .map(|spec| self.upstream_schema.require(&spec.target_field, entity))
            .collect::<Result<_>>()?;

        let rows: Vec<StageRecord> = plan
            .persist
            .clone()
            .map(|i| {
                let record = &upstream.records[i];
                let mut values = record.values.clone();
                for (spec, &field) in self.specs.iter().zip(&target_fields) {
                    let end = (i + 1 + spec.window).min(upstream.len());
                    let forward: Vec<f64> = upstream.records[i + 1..end]
                        .iter()
                        .map(|r| r.values[field])
                        .collect();
                    values.push(spec.compute(record.values[field], &forward).unwrap_or(f64::NAN));
                }
                StageRecord::new(record.date, values)
            })
            .collect();

        let rows_written = match (plan.mode, downstream) {
            (PlanMode::Incremental, Some(existing)) => writer::append(&self.labeled, &existing, &rows)?,
            _ => {
                if rows.is_empty() {
                    return Err(StocknubError::InsufficientRows {
                        available: upstream.len(),
                        required: self.lookahead() + 1,
                    });
                }
                let dataset = EntityDataset::from_records(entity, self.schema.clone(), rows)?;
                writer::replace(&self.labeled, &dataset)?
            }
        };

        Ok(StageUpdate {
            mode: plan.mode.into(),
            context_rows: plan.context_len(),
            rows_written,
            pending_rows: plan.pending_len(),
            dropped_rows: 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indicators::BuiltinIndicators;
    use crate::labels::LabelType;
    use tempfile::TempDir;

    fn bars(n: usize) -> Vec<PriceBar> {
        let start = NaiveDate::from_ymd_opt(2023, 1, 2).unwrap();
        (0..n)
            .map(|i| {
                let close = 100.0 + (i as f64 * 0.7).sin() * 5.0 + i as f64 * 0.1;
                PriceBar::new(
                    start + Duration::days(i as i64),
                    close - 0.5,
                    close + 1.0,
                    close - 1.0,
                    close,
                    1_000.0 + (i % 7) as f64 * 100.0,
                )
            })
            .collect()
    }

    fn seed_raw(dir: &TempDir, entity: &str, bars: &[PriceBar]) -> DatasetStore {
        let raw = DatasetStore::new(dir.path(), StageKind::Raw);
        writer::replace(&raw, &EntityDataset::from_bars(entity, bars).unwrap()).unwrap();
        raw
    }

    fn technical_stage(dir: &TempDir, force: bool) -> TechnicalStage {
        TechnicalStage::new(
            DatasetStore::new(dir.path(), StageKind::Raw),
            DatasetStore::new(dir.path(), StageKind::Technical),
            vec![
                IndicatorSpec::Rsi { period: 14 },
                IndicatorSpec::SmaRatio { period: 5 },
            ],
            Arc::new(BuiltinIndicators),
            force,
        )
    }

    #[test]
    fn test_technical_full_then_noop() {
        let dir = TempDir::new().unwrap();
        seed_raw(&dir, "AAA", &bars(60));
        let stage = technical_stage(&dir, false);

        let first = stage.run("AAA").unwrap();
        assert_eq!(first.mode, UpdateKind::Full);
        assert_eq!(first.rows_written, 60 - 14);

        let second = stage.run("AAA").unwrap();
        assert_eq!(second, StageUpdate::noop());
    }

    #[test]
    fn test_technical_incremental_context() {
        let dir = TempDir::new().unwrap();
        let all = bars(70);
        let raw = seed_raw(&dir, "AAA", &all[..64]);
        let stage = technical_stage(&dir, false);
        stage.run("AAA").unwrap();

        let existing = raw.load("AAA").unwrap().unwrap();
        let new: Vec<StageRecord> = all[64..].iter().map(PriceBar::to_record).collect();
        writer::append(&raw, &existing, &new).unwrap();

        let update = stage.run("AAA").unwrap();
        assert_eq!(update.mode, UpdateKind::Incremental);
        assert_eq!(update.context_rows, 14);
        assert_eq!(update.rows_written, 6);
    }

    #[test]
    fn test_flat_prices_are_skipped() {
        let dir = TempDir::new().unwrap();
        let start = NaiveDate::from_ymd_opt(2023, 1, 2).unwrap();
        let flat: Vec<PriceBar> = (0..40)
            .map(|i| PriceBar::new(start + Duration::days(i), 50.0, 50.0, 50.0, 50.0, 0.0))
            .collect();
        seed_raw(&dir, "SUSP", &flat);
        let err = technical_stage(&dir, false).run("SUSP").unwrap_err();
        assert!(matches!(err, StocknubError::NoPriceVariation { .. }));
        assert!(err.is_skip());
    }

    #[test]
    fn test_missing_upstream_is_skip() {
        let dir = TempDir::new().unwrap();
        let err = technical_stage(&dir, false).run("NONE").unwrap_err();
        assert!(err.is_skip());
    }

    #[test]
    fn test_labels_hold_back_last_window() {
        let dir = TempDir::new().unwrap();
        seed_raw(&dir, "AAA", &bars(60));
        let technical = technical_stage(&dir, false);
        technical.run("AAA").unwrap();

        let labels = LabelStage::new(
            DatasetStore::new(dir.path(), StageKind::Technical),
            DatasetStore::new(dir.path(), StageKind::Labeled),
            technical.schema().clone(),
            vec![
                LabelSpec::new(LabelType::MaxLoss, 3, "close"),
                LabelSpec::new(LabelType::LinearTrend, 5, "close"),
            ],
            0,
            false,
        );
        let update = labels.run("AAA").unwrap();
        assert_eq!(update.mode, UpdateKind::Full);
        assert_eq!(update.rows_written, 46 - 5);
        assert_eq!(update.pending_rows, 5);

        let labeled = DatasetStore::new(dir.path(), StageKind::Labeled)
            .load("AAA")
            .unwrap()
            .unwrap();
        assert!(labeled.records.iter().all(StageRecord::is_complete));

        // No new upstream rows: nothing to finalize
        let again = labels.run("AAA").unwrap();
        assert_eq!(again.rows_written, 0);
        assert_eq!(again.pending_rows, 5);
    }
}
