//! Shared fixtures for the integration tests

#![allow(dead_code)]

use chrono::{Duration, NaiveDate};
use rusty_stocknub::config::PipelineConfig;
use rusty_stocknub::indicators::IndicatorSpec;
use rusty_stocknub::labels::LabelType;
use rusty_stocknub::store::DatasetStore;
use rusty_stocknub::types::{EntityDataset, PriceBar, StageKind};
use rusty_stocknub::writer;
use std::fs;
use std::path::Path;

/// Deterministic, non-flat daily bars starting 2023-01-02
pub fn price_bars(n: usize, seed: u64) -> Vec<PriceBar> {
    let start = NaiveDate::from_ymd_opt(2023, 1, 2).unwrap();
    let mut state = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
    let mut close = 100.0 + seed as f64;
    (0..n)
        .map(|i| {
            state = state
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            let noise = ((state >> 33) % 1_000) as f64 / 1_000.0 - 0.5;
            close = (close + (i as f64 * 0.21).sin() * 0.8 + noise).max(5.0);
            let open = close - noise * 0.6;
            PriceBar::new(
                start + Duration::days(i as i64),
                open,
                open.max(close) + 0.8,
                open.min(close) - 0.8,
                close,
                10_000.0 + ((state >> 40) % 5_000) as f64,
            )
        })
        .collect()
}

/// Write `bars` as the raw dataset of `entity`
pub fn seed_raw(data_dir: &Path, entity: &str, bars: &[PriceBar]) -> DatasetStore {
    let raw = DatasetStore::new(data_dir, StageKind::Raw);
    writer::replace(&raw, &EntityDataset::from_bars(entity, bars).unwrap()).unwrap();
    raw
}

/// Write `bars` as `<dir>/<entity>.csv` in the layout the CSV client reads
pub fn write_price_csv(dir: &Path, entity: &str, bars: &[PriceBar]) {
    fs::create_dir_all(dir).unwrap();
    let mut wtr = csv::Writer::from_path(dir.join(format!("{}.csv", entity))).unwrap();
    wtr.write_record(["date", "open", "high", "low", "close", "volume"])
        .unwrap();
    for b in bars {
        wtr.write_record([
            b.date.format("%Y-%m-%d").to_string(),
            b.open.to_string(),
            b.high.to_string(),
            b.low.to_string(),
            b.close.to_string(),
            b.volume.to_string(),
        ])
        .unwrap();
    }
    wtr.flush().unwrap();
}

/// Small, fast configuration rooted at `data_dir`
pub fn small_config(data_dir: &Path) -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.data_dir = data_dir.to_path_buf();
    config.workers = 2;
    config.indicators = vec![
        IndicatorSpec::Rsi { period: 14 },
        IndicatorSpec::SmaRatio { period: 5 },
        IndicatorSpec::AroonOscillator { period: 10 },
    ];
    config.labels.types = vec![LabelType::MaxLoss, LabelType::LinearTrend];
    config.labels.windows = vec![3, 5];
    config.training.min_class_samples = 2;
    config
}

/// Raw bytes of an entity's dataset file
pub fn dataset_bytes(data_dir: &Path, stage: StageKind, entity: &str) -> Vec<u8> {
    fs::read(DatasetStore::new(data_dir, stage).path(entity)).unwrap()
}
