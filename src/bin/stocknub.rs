//! stocknub CLI - incremental stock feature, label, model and forecast pipeline
//!
//! ## Example Usage
//!
//! ```bash
//! # Pull new daily bars for the tickers in the universe file
//! stocknub fetch --source yahoo --update yesterday
//!
//! # Recompute indicators for two tickers from scratch
//! stocknub technical --tickers BBCA,BBRI --force
//!
//! # Train and forecast only the 5-day median-gain models
//! stocknub train --label-types median_gain --windows 5
//! stocknub forecast --label-types median_gain --windows 5 --min-test-score 0.2
//!
//! # Everything, in order
//! stocknub run --source csv --csv-dir ./prices
//! ```

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use rusty_stocknub::calendar::UpdateMode;
use rusty_stocknub::config::PipelineConfig;
use rusty_stocknub::labels::LabelType;
use rusty_stocknub::orchestrator::Pipeline;
use rusty_stocknub::scheduler::{RunReport, Scheduler};
use rusty_stocknub::sources::{CsvDirectoryClient, MarketDataClient};
use rusty_stocknub::types::StageKind;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use std::time::Instant;

/// stocknub: incremental per-ticker stock pipeline
#[derive(Parser)]
#[command(name = "stocknub")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(author = "Robert Fall")]
#[command(about = "Incremental per-ticker stock feature, label, model and forecast pipeline", long_about = None)]
struct Cli {
    /// Enable verbose output (debug logging)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file path (default: ~/.stocknub/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Data root directory
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Maximum concurrent tasks
    #[arg(short, long, global = true)]
    workers: Option<usize>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch daily bars into the raw store
    Fetch {
        #[command(flatten)]
        stage: StageArgs,
        #[command(flatten)]
        source: SourceArgs,
    },

    /// Compute technical indicators from raw prices
    Technical {
        #[command(flatten)]
        stage: StageArgs,
    },

    /// Compute forward labels from technical data
    Labels {
        #[command(flatten)]
        stage: StageArgs,
        #[command(flatten)]
        labels: LabelArgs,
    },

    /// Train one model per ticker, label type and window
    Train {
        #[command(flatten)]
        stage: StageArgs,
        #[command(flatten)]
        labels: LabelArgs,
    },

    /// Score eligible tickers and rewrite the forecast files
    Forecast {
        /// Explicit ticker list; bypasses score filtering
        #[arg(short, long, value_delimiter = ',')]
        tickers: Vec<String>,
        #[command(flatten)]
        labels: LabelArgs,
        /// Minimum test Gini required on every label type and window
        #[arg(long)]
        min_test_score: Option<f64>,
    },

    /// Run every stage in order
    Run {
        #[command(flatten)]
        stage: StageArgs,
        #[command(flatten)]
        source: SourceArgs,
        #[command(flatten)]
        labels: LabelArgs,
        /// Minimum test Gini required on every label type and window
        #[arg(long)]
        min_test_score: Option<f64>,
        /// Use the existing raw store instead of fetching
        #[arg(long)]
        skip_fetch: bool,
    },
}

#[derive(Args)]
struct StageArgs {
    /// Comma-separated tickers (default: universe file, then existing data)
    #[arg(short, long, value_delimiter = ',')]
    tickers: Vec<String>,

    /// Ignore existing downstream data and rebuild from scratch
    #[arg(short, long)]
    force: bool,
}

#[derive(Args)]
struct SourceArgs {
    /// Market data source (csv, yahoo)
    #[arg(short, long, default_value = "csv")]
    source: String,

    /// Directory of <TICKER>.csv files for the csv source
    #[arg(long)]
    csv_dir: Option<PathBuf>,

    /// Suffix appended to tickers by the yahoo source
    #[arg(long, default_value = ".JK")]
    symbol_suffix: String,

    /// Fetch up to today (after market close) or yesterday
    #[arg(short, long)]
    update: Option<String>,
}

#[derive(Args)]
struct LabelArgs {
    /// Comma-separated label types (median_gain, max_loss, linear_trend)
    #[arg(long, value_delimiter = ',')]
    label_types: Vec<String>,

    /// Comma-separated forward windows in days
    #[arg(long, value_delimiter = ',')]
    windows: Vec<usize>,
}

fn main() {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    if let Err(e) = run(cli) {
        eprintln!("{} {:#}", "Error:".red().bold(), e);
        process::exit(1);
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = load_config(cli.config.as_deref())?;
    if let Some(dir) = cli.data_dir {
        config.data_dir = dir;
    }
    if let Some(workers) = cli.workers {
        config.workers = workers;
    }

    if cli.verbose {
        println!("{} v{}", "stocknub".cyan().bold(), env!("CARGO_PKG_VERSION"));
        println!("Data dir: {}", config.data_dir.display().to_string().dimmed());
        println!("Workers:  {}", config.workers.to_string().dimmed());
    }

    let started = Instant::now();
    match cli.command {
        Commands::Fetch { stage, source } => {
            apply_source(&mut config, &source)?;
            let (pipeline, pb) = build(config, stage.force)?;
            let client = make_client(&pipeline, &source)?;
            let entities = pipeline.resolve_fetch_universe(tickers(&stage.tickers))?;
            let report = pipeline.fetch(client, &entities, chrono::Utc::now())?;
            pb.finish_and_clear();
            print_report(&report);
        }
        Commands::Technical { stage } => {
            let (pipeline, pb) = build(config, stage.force)?;
            let entities = pipeline.resolve_universe(tickers(&stage.tickers), StageKind::Raw)?;
            let report = pipeline.technical(&entities)?;
            pb.finish_and_clear();
            print_report(&report);
        }
        Commands::Labels { stage, labels } => {
            apply_labels(&mut config, &labels)?;
            let (pipeline, pb) = build(config, stage.force)?;
            let entities = pipeline.resolve_universe(tickers(&stage.tickers), StageKind::Technical)?;
            let report = pipeline.labels(&entities)?;
            pb.finish_and_clear();
            print_report(&report);
        }
        Commands::Train { stage, labels } => {
            apply_labels(&mut config, &labels)?;
            let (pipeline, pb) = build(config, stage.force)?;
            let entities = pipeline.resolve_universe(tickers(&stage.tickers), StageKind::Labeled)?;
            let report = pipeline.train(&entities, uuid::Uuid::new_v4())?;
            pb.finish_and_clear();
            print_report(&report);
        }
        Commands::Forecast {
            tickers: allow,
            labels,
            min_test_score,
        } => {
            apply_labels(&mut config, &labels)?;
            apply_forecast(&mut config, &allow, min_test_score);
            let (pipeline, pb) = build(config, false)?;
            let reports = pipeline.forecast()?;
            pb.finish_and_clear();
            for report in &reports {
                print_report(report);
            }
        }
        Commands::Run {
            stage,
            source,
            labels,
            min_test_score,
            skip_fetch,
        } => {
            apply_source(&mut config, &source)?;
            apply_labels(&mut config, &labels)?;
            apply_forecast(&mut config, &[], min_test_score);
            let (pipeline, pb) = build(config, stage.force)?;
            let client = if skip_fetch {
                None
            } else {
                Some(make_client(&pipeline, &source)?)
            };
            let report = pipeline.run_all(client, tickers(&stage.tickers), chrono::Utc::now())?;
            pb.finish_and_clear();

            if let Some(fetch) = &report.fetch {
                print_report(fetch);
            }
            print_report(&report.technical);
            print_report(&report.labels);
            print_report(&report.train);
            for forecast in &report.forecast {
                print_report(forecast);
            }
            println!("  {} {}", "Run id:".bold(), report.run_id.to_string().dimmed());
        }
    }

    println!(
        "{} Done in {:.1}s",
        "✓".green().bold(),
        started.elapsed().as_secs_f64()
    );
    Ok(())
}

/// Explicit file, then ~/.stocknub/config.toml, then defaults
fn load_config(path: Option<&Path>) -> anyhow::Result<PipelineConfig> {
    if let Some(path) = path {
        return PipelineConfig::from_file(path)
            .with_context(|| format!("failed to load config {}", path.display()));
    }
    if let Some(home) = dirs::home_dir() {
        let default_config = home.join(".stocknub").join("config.toml");
        if default_config.exists() {
            return PipelineConfig::from_file(&default_config)
                .with_context(|| format!("failed to load config {}", default_config.display()));
        }
    }
    Ok(PipelineConfig::default())
}

fn tickers(list: &[String]) -> Option<&[String]> {
    (!list.is_empty()).then_some(list)
}

fn apply_source(config: &mut PipelineConfig, source: &SourceArgs) -> anyhow::Result<()> {
    if let Some(mode) = &source.update {
        config.fetch.update_mode = mode.parse::<UpdateMode>()?;
    }
    Ok(())
}

fn apply_labels(config: &mut PipelineConfig, labels: &LabelArgs) -> anyhow::Result<()> {
    if !labels.label_types.is_empty() {
        config.labels.types = labels
            .label_types
            .iter()
            .map(|s| s.parse::<LabelType>())
            .collect::<Result<_, _>>()?;
    }
    if !labels.windows.is_empty() {
        config.labels.windows = labels.windows.clone();
    }
    Ok(())
}

fn apply_forecast(config: &mut PipelineConfig, allow: &[String], min_test_score: Option<f64>) {
    if !allow.is_empty() {
        config.forecast.allow_list = Some(allow.to_vec());
    }
    if min_test_score.is_some() {
        config.forecast.min_test_score = min_test_score;
    }
}

/// Validated pipeline with a progress spinner ticking once per finished task
fn build(config: PipelineConfig, force: bool) -> anyhow::Result<(Pipeline, ProgressBar)> {
    let workers = config.workers;
    let pipeline = Pipeline::new(config)?.with_force(force);

    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} [{elapsed_precise}] {pos} tasks done {msg}")?,
    );
    let ticker = pb.clone();
    let scheduler = Scheduler::new(workers).with_progress(Arc::new(move |key: &str| {
        ticker.set_message(key.to_string());
        ticker.inc(1);
    }));
    Ok((pipeline.with_scheduler(scheduler), pb))
}

fn make_client(pipeline: &Pipeline, source: &SourceArgs) -> anyhow::Result<Arc<dyn MarketDataClient>> {
    match source.source.as_str() {
        "csv" => {
            let dir = source
                .csv_dir
                .clone()
                .context("the csv source needs --csv-dir")?;
            Ok(Arc::new(CsvDirectoryClient::new(dir)))
        }
        #[cfg(feature = "async")]
        "yahoo" => {
            let clock = pipeline.config().exchange_clock()?;
            let client = rusty_stocknub::sources::YahooClient::new(
                source.symbol_suffix.clone(),
                clock.timezone(),
            )?;
            Ok(Arc::new(client))
        }
        #[cfg(not(feature = "async"))]
        "yahoo" => {
            let _ = pipeline;
            bail!("the yahoo source needs the `async` feature")
        }
        other => bail!("unknown source '{}' (expected csv or yahoo)", other),
    }
}

fn print_report<T>(report: &RunReport<T>) {
    let summary = report.summary();
    println!();
    println!("{}", format!("{} summary", report.stage).green().bold());
    println!("{}", "=".repeat(report.stage.len() + 8).green());
    println!("  {} {}", "Total:    ".bold(), summary.total);
    println!("  {} {}", "Succeeded:".bold(), summary.succeeded.to_string().bright_green());
    println!("  {} {}", "Skipped:  ".bold(), summary.skipped.to_string().yellow());
    println!("  {} {}", "Failed:   ".bold(), summary.failed.to_string().red().bold());

    for (key, reason) in report.failures() {
        println!("    {} {}: {}", "✗".red().bold(), key, reason);
    }
    if log::log_enabled!(log::Level::Debug) {
        for (key, reason) in report.skips() {
            println!("    {} {}: {}", "-".yellow(), key, reason.dimmed());
        }
    }
}
