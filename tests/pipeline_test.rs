//! End-to-end runs driven by the CSV directory client

mod common;

use chrono::{TimeZone, Utc};
use common::{price_bars, small_config, write_price_csv};
use rusty_stocknub::forecast::read_forecasts;
use rusty_stocknub::orchestrator::Pipeline;
use rusty_stocknub::scheduler::{Outcome, Scheduler};
use rusty_stocknub::sources::{CsvDirectoryClient, MarketDataClient};
use rusty_stocknub::stages::{StageUpdate, UpdateKind};
use rusty_stocknub::store::DatasetStore;
use rusty_stocknub::types::StageKind;
use std::fs;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

fn tickers() -> Vec<String> {
    ["AAA", "BBB", "GONE"].iter().map(|s| s.to_string()).collect()
}

#[test]
fn test_run_all_end_to_end() {
    let prices = TempDir::new().unwrap();
    let data = TempDir::new().unwrap();
    write_price_csv(prices.path(), "AAA", &price_bars(260, 21));
    write_price_csv(prices.path(), "BBB", &price_bars(260, 22));

    let completed = Arc::new(AtomicUsize::new(0));
    let counter = completed.clone();
    let scheduler = Scheduler::new(2).with_progress(Arc::new(move |_key: &str| {
        counter.fetch_add(1, Ordering::SeqCst);
    }));
    let pipeline = Pipeline::new(small_config(data.path()))
        .unwrap()
        .with_scheduler(scheduler);
    let client: Arc<dyn MarketDataClient> = Arc::new(CsvDirectoryClient::new(prices.path()));
    let now = Utc.with_ymd_and_hms(2024, 1, 10, 12, 0, 0).unwrap();

    let report = pipeline
        .run_all(Some(client.clone()), Some(tickers().as_slice()), now)
        .unwrap();

    // GONE has no source file: one fetch failure, skips everywhere after
    let fetch = report.fetch.as_ref().unwrap();
    assert_eq!(fetch.summary().failed, 1);
    assert!(matches!(fetch.outcome("GONE"), Some(Outcome::Failed(_))));
    assert!(matches!(report.technical.outcome("GONE"), Some(Outcome::Skipped(_))));
    assert!(matches!(report.labels.outcome("GONE"), Some(Outcome::Skipped(_))));
    assert_eq!(report.total_failures(), 1);

    match report.technical.outcome("AAA") {
        Some(Outcome::Success(update)) => {
            assert_eq!(update.mode, UpdateKind::Full);
            assert_eq!(update.rows_written, 260 - 14);
        }
        other => panic!("unexpected technical outcome {:?}", other),
    }

    // 2 label types x 2 windows for each of the three tickers
    assert_eq!(report.train.summary().total, 12);
    assert_eq!(report.train.summary().failed, 0);
    assert_eq!(report.forecast.len(), 4);

    let technical = DatasetStore::new(data.path(), StageKind::Technical);
    let latest = technical.load("AAA").unwrap().unwrap().last_date().unwrap();
    for forecast in &report.forecast {
        for (entity, record) in forecast.successes() {
            assert!(entity == "AAA" || entity == "BBB");
            assert_eq!(record.forecast_date, latest);
            assert!((0.0..=1.0).contains(&record.probability));
        }
    }
    let forecast_dir = data.path().join("04_forecast");
    let written: usize = pipeline
        .pairs()
        .into_iter()
        .map(|(label_type, window)| {
            let path = forecast_dir
                .join(label_type.as_str())
                .join(format!("{}dd.csv", window));
            read_forecasts(&path).unwrap().len()
        })
        .sum();
    let succeeded: usize = report.forecast.iter().map(|r| r.summary().succeeded).sum();
    assert_eq!(written, succeeded);

    // Every task of every stage ticked the progress hook once
    let tasks = fetch.summary().total
        + report.technical.summary().total
        + report.labels.summary().total
        + report.train.summary().total
        + report.forecast.iter().map(|r| r.summary().total).sum::<usize>();
    assert_eq!(completed.load(Ordering::SeqCst), tasks);

    // Second run on unchanged sources materializes nothing new
    let raw_before = fs::read(DatasetStore::new(data.path(), StageKind::Raw).path("AAA")).unwrap();
    let again = pipeline.run_all(Some(client), Some(tickers().as_slice()), now).unwrap();
    for stage in [again.fetch.as_ref().unwrap(), &again.technical] {
        match stage.outcome("AAA") {
            Some(Outcome::Success(update)) => assert_eq!(*update, StageUpdate::noop()),
            other => panic!("unexpected outcome {:?}", other),
        }
    }
    match again.labels.outcome("AAA") {
        Some(Outcome::Success(update)) => assert_eq!(update.rows_written, 0),
        other => panic!("unexpected outcome {:?}", other),
    }
    assert_eq!(
        raw_before,
        fs::read(DatasetStore::new(data.path(), StageKind::Raw).path("AAA")).unwrap()
    );
}

#[test]
fn test_fetch_appends_only_new_sessions() {
    let prices = TempDir::new().unwrap();
    let data = TempDir::new().unwrap();
    let bars = price_bars(40, 30);
    write_price_csv(prices.path(), "AAA", &bars[..30]);

    let pipeline = Pipeline::new(small_config(data.path())).unwrap();
    let client: Arc<dyn MarketDataClient> = Arc::new(CsvDirectoryClient::new(prices.path()));
    let now = Utc.with_ymd_and_hms(2024, 1, 10, 12, 0, 0).unwrap();
    let entities = vec!["AAA".to_string()];

    let first = pipeline.fetch(client.clone(), &entities, now).unwrap();
    match first.outcome("AAA") {
        Some(Outcome::Success(update)) => {
            assert_eq!(update.mode, UpdateKind::Full);
            assert_eq!(update.rows_written, 30);
        }
        other => panic!("unexpected outcome {:?}", other),
    }

    // The source gains ten sessions
    write_price_csv(prices.path(), "AAA", &bars);
    let second = pipeline.fetch(client, &entities, now).unwrap();
    match second.outcome("AAA") {
        Some(Outcome::Success(update)) => {
            assert_eq!(update.mode, UpdateKind::Incremental);
            assert_eq!(update.rows_written, 10);
        }
        other => panic!("unexpected outcome {:?}", other),
    }

    let raw = DatasetStore::new(data.path(), StageKind::Raw)
        .load("AAA")
        .unwrap()
        .unwrap();
    assert_eq!(raw.len(), 40);
    assert_eq!(raw.last_date(), Some(bars[39].date));
}

#[test]
fn test_universe_falls_back_to_upstream_store() {
    let prices = TempDir::new().unwrap();
    let data = TempDir::new().unwrap();
    write_price_csv(prices.path(), "BBB", &price_bars(50, 40));
    write_price_csv(prices.path(), "AAA", &price_bars(50, 41));

    let pipeline = Pipeline::new(small_config(data.path())).unwrap();
    let client: Arc<dyn MarketDataClient> = Arc::new(CsvDirectoryClient::new(prices.path()));
    let now = Utc.with_ymd_and_hms(2024, 1, 10, 12, 0, 0).unwrap();
    pipeline
        .fetch(client, &["BBB".to_string(), "AAA".to_string()], now)
        .unwrap();

    let universe = pipeline.resolve_universe(None, StageKind::Raw).unwrap();
    assert_eq!(universe, vec!["AAA", "BBB"]);

    let universe_file = data.path().join("universe.txt");
    fs::write(&universe_file, "# watchlist\nBBB\n\nCCC\nBBB\n").unwrap();
    let mut config = small_config(data.path());
    config.fetch.universe_file = Some(universe_file);
    let pipeline = Pipeline::new(config).unwrap();
    assert_eq!(
        pipeline.resolve_universe(None, StageKind::Raw).unwrap(),
        vec!["BBB", "CCC"]
    );
    let explicit = vec!["AAA".to_string()];
    assert_eq!(
        pipeline.resolve_fetch_universe(Some(explicit.as_slice())).unwrap(),
        vec!["AAA"]
    );
}
