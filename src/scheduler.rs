//! Parallel Task Scheduler
//!
//! Fans per-entity work out over a bounded rayon pool. Each task returns its
//! own result value; errors and panics are caught at the task boundary and
//! recorded against the task key, never propagated to siblings. Results are
//! collected in input order, so the report is deterministic for a fixed key
//! list regardless of completion order.

use crate::error::{Result, StocknubError};
use rayon::prelude::*;
use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

/// Callback invoked with a task key each time a task finishes
pub type ProgressHook = Arc<dyn Fn(&str) + Send + Sync>;

/// Result of one task
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome<T> {
    Success(T),
    /// Not enough usable data; not counted as a failure
    Skipped(String),
    Failed(String),
}

impl<T> Outcome<T> {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success(_))
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, Outcome::Skipped(_))
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Outcome::Failed(_))
    }

    /// Classify a task's result
    pub fn from_result(result: Result<T>) -> Self {
        match result {
            Ok(value) => Outcome::Success(value),
            Err(e) if e.is_skip() => Outcome::Skipped(e.to_string()),
            Err(e) => Outcome::Failed(e.to_string()),
        }
    }
}

/// Outcome of one task, keyed by entity (or entity/label/window)
#[derive(Debug, Clone)]
pub struct TaskResult<T> {
    pub key: String,
    pub outcome: Outcome<T>,
}

/// Counts over a run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub total: usize,
    pub succeeded: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} total, {} succeeded, {} skipped, {} failed",
            self.total, self.succeeded, self.skipped, self.failed
        )
    }
}

/// Every task's outcome for one stage invocation, in input order
#[derive(Debug, Clone)]
pub struct RunReport<T> {
    pub stage: String,
    pub results: Vec<TaskResult<T>>,
}

impl<T> RunReport<T> {
    pub fn new(stage: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            results: Vec::new(),
        }
    }

    pub fn summary(&self) -> RunSummary {
        let mut summary = RunSummary {
            total: self.results.len(),
            ..RunSummary::default()
        };
        for result in &self.results {
            match result.outcome {
                Outcome::Success(_) => summary.succeeded += 1,
                Outcome::Skipped(_) => summary.skipped += 1,
                Outcome::Failed(_) => summary.failed += 1,
            }
        }
        summary
    }

    pub fn outcome(&self, key: &str) -> Option<&Outcome<T>> {
        self.results.iter().find(|r| r.key == key).map(|r| &r.outcome)
    }

    pub fn successes(&self) -> impl Iterator<Item = (&str, &T)> {
        self.results.iter().filter_map(|r| match &r.outcome {
            Outcome::Success(value) => Some((r.key.as_str(), value)),
            _ => None,
        })
    }

    pub fn skips(&self) -> impl Iterator<Item = (&str, &str)> {
        self.results.iter().filter_map(|r| match &r.outcome {
            Outcome::Skipped(reason) => Some((r.key.as_str(), reason.as_str())),
            _ => None,
        })
    }

    pub fn failures(&self) -> impl Iterator<Item = (&str, &str)> {
        self.results.iter().filter_map(|r| match &r.outcome {
            Outcome::Failed(reason) => Some((r.key.as_str(), reason.as_str())),
            _ => None,
        })
    }

    pub fn has_failures(&self) -> bool {
        self.results.iter().any(|r| r.outcome.is_failed())
    }

    /// Log the count summary and one line per failed task
    pub fn log_summary(&self) {
        log::info!("{} finished: {}", self.stage, self.summary());
        for (key, reason) in self.skips() {
            log::debug!("{} skipped {}: {}", self.stage, key, reason);
        }
        for (key, reason) in self.failures() {
            log::warn!("{} failed {}: {}", self.stage, key, reason);
        }
    }
}

/// Bounded worker pool
#[derive(Clone)]
pub struct Scheduler {
    workers: usize,
    progress: Option<ProgressHook>,
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("workers", &self.workers)
            .field("progress", &self.progress.is_some())
            .finish()
    }
}

impl Scheduler {
    pub fn new(workers: usize) -> Self {
        Self {
            workers: workers.max(1),
            progress: None,
        }
    }

    pub fn with_progress(mut self, hook: ProgressHook) -> Self {
        self.progress = Some(hook);
        self
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Run `task` once per key on at most `workers` threads.
    ///
    /// Only building the pool can fail; task errors end up in the report.
    pub fn run<T, F>(&self, stage: &str, keys: Vec<String>, task: F) -> Result<RunReport<T>>
    where
        T: Send,
        F: Fn(&str) -> Result<T> + Sync,
    {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.workers)
            .thread_name(|i| format!("stocknub-worker-{}", i))
            .build()
            .map_err(|e| StocknubError::ConfigError(format!("failed to build worker pool: {}", e)))?;

        log::info!(
            "{}: running {} tasks on {} workers",
            stage,
            keys.len(),
            self.workers
        );

        let progress = self.progress.as_ref();
        let results = pool.install(|| {
            keys.into_par_iter()
                .map(|key| {
                    let outcome = run_isolated(&key, &task);
                    if let Outcome::Failed(reason) = &outcome {
                        log::debug!("{}: {} failed: {}", stage, key, reason);
                    }
                    if let Some(hook) = progress {
                        hook(&key);
                    }
                    TaskResult { key, outcome }
                })
                .collect::<Vec<_>>()
        });

        let report = RunReport {
            stage: stage.to_string(),
            results,
        };
        report.log_summary();
        Ok(report)
    }
}

fn run_isolated<T, F>(key: &str, task: &F) -> Outcome<T>
where
    F: Fn(&str) -> Result<T>,
{
    match panic::catch_unwind(AssertUnwindSafe(|| task(key))) {
        Ok(result) => Outcome::from_result(result),
        Err(payload) => {
            Outcome::Failed(StocknubError::TaskPanicked(panic_message(payload.as_ref())).to_string())
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn keys(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_failures_are_isolated() {
        let scheduler = Scheduler::new(4);
        let report = scheduler
            .run("test", keys(&["AAA", "BBB", "CCC", "DDD"]), |key| match key {
                "BBB" => Err(StocknubError::ModelNotFound(key.to_string())),
                "CCC" => Err(StocknubError::InsufficientRows {
                    available: 40,
                    required: 100,
                }),
                _ => Ok(key.len()),
            })
            .unwrap();

        assert_eq!(
            report.summary(),
            RunSummary {
                total: 4,
                succeeded: 2,
                skipped: 1,
                failed: 1
            }
        );
        assert!(report.outcome("BBB").unwrap().is_failed());
        assert!(report.outcome("CCC").unwrap().is_skipped());
        assert_eq!(report.failures().count(), 1);
    }

    #[test]
    fn test_panic_is_recorded() {
        let report = Scheduler::new(2)
            .run("test", keys(&["AAA", "BOOM"]), |key| {
                if key == "BOOM" {
                    panic!("exploded on {}", key);
                }
                Ok(())
            })
            .unwrap();
        let (key, reason) = report.failures().next().unwrap();
        assert_eq!(key, "BOOM");
        assert!(reason.contains("exploded on BOOM"));
        assert!(report.outcome("AAA").unwrap().is_success());
    }

    #[test]
    fn test_results_keep_input_order() {
        let names: Vec<String> = (0..50).map(|i| format!("E{:02}", i)).collect();
        let report = Scheduler::new(8)
            .run("test", names.clone(), |key| Ok(key.to_string()))
            .unwrap();
        let order: Vec<&str> = report.results.iter().map(|r| r.key.as_str()).collect();
        assert_eq!(order, names.iter().map(String::as_str).collect::<Vec<_>>());
        for (key, value) in report.successes() {
            assert_eq!(key, value);
        }
    }

    #[test]
    fn test_progress_hook_called_per_task() {
        let counter = Arc::new(AtomicUsize::new(0));
        let seen = counter.clone();
        let scheduler = Scheduler::new(3).with_progress(Arc::new(move |_key: &str| {
            seen.fetch_add(1, Ordering::SeqCst);
        }));
        scheduler
            .run("test", keys(&["A", "B", "C", "D", "E"]), |_| Ok(()))
            .unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 5);
    }

    /// Keeps every warning whose message mentions the watched key
    struct WarnCapture {
        lines: Mutex<Vec<String>>,
    }

    const WATCHED: &str = "WARN-ONCE-KEY";

    impl log::Log for WarnCapture {
        fn enabled(&self, metadata: &log::Metadata) -> bool {
            metadata.level() <= log::Level::Warn
        }

        fn log(&self, record: &log::Record) {
            let line = record.args().to_string();
            if self.enabled(record.metadata()) && line.contains(WATCHED) {
                if let Ok(mut lines) = self.lines.lock() {
                    lines.push(line);
                }
            }
        }

        fn flush(&self) {}
    }

    static CAPTURE: WarnCapture = WarnCapture {
        lines: Mutex::new(Vec::new()),
    };

    #[test]
    fn test_failure_warned_once() {
        let _ = log::set_logger(&CAPTURE);
        log::set_max_level(log::LevelFilter::Debug);

        Scheduler::new(2)
            .run("test", keys(&[WATCHED, "AAA"]), |key| {
                if key == WATCHED {
                    Err(StocknubError::ModelNotFound(key.to_string()))
                } else {
                    Ok(())
                }
            })
            .unwrap();

        let lines = CAPTURE.lines.lock().unwrap();
        assert_eq!(lines.len(), 1, "warnings: {:?}", *lines);
        assert!(lines[0].contains("failed"));
    }

    #[test]
    fn test_zero_workers_clamped() {
        assert_eq!(Scheduler::new(0).workers(), 1);
    }
}
