//! Batch orchestration: many bundles, bounded parallelism, isolated failures.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use relay_state::HistoryEntry;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::bundle::scan_bundles;
use crate::error::{Result, TransferError};
use crate::ingest::{run_job, IngestContext, JobReport, JobState};
use crate::obs;

/// Which bundles a batch processes.
#[derive(Debug, Clone)]
pub enum BundleSource {
    Single(PathBuf),
    /// Every `*.tar.gz` in the directory, sorted by name
    Directory(PathBuf),
    List(Vec<PathBuf>),
}

impl BundleSource {
    pub fn bundles(&self) -> Result<Vec<PathBuf>> {
        match self {
            BundleSource::Single(path) => {
                if !path.is_file() {
                    return Err(TransferError::InvalidConfig(format!(
                        "bundle {} does not exist",
                        path.display()
                    )));
                }
                Ok(vec![path.clone()])
            }
            BundleSource::Directory(dir) => {
                if !dir.is_dir() {
                    return Err(TransferError::InvalidConfig(format!(
                        "batch directory {} does not exist",
                        dir.display()
                    )));
                }
                scan_bundles(dir)
            }
            BundleSource::List(paths) => Ok(paths.clone()),
        }
    }
}

/// Outcome of a batch.
#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    /// One report per bundle, in bundle order
    pub jobs: Vec<JobReport>,
    pub succeeded: usize,
    pub failed: usize,
    pub abandoned: usize,
    /// Most jobs observed running at the same time
    pub peak_in_flight: usize,
    pub duration: Duration,
}

impl BatchReport {
    fn from_jobs(jobs: Vec<JobReport>, peak_in_flight: usize, duration: Duration) -> Self {
        let count = |state: JobState| jobs.iter().filter(|j| j.state == state).count();
        Self {
            succeeded: count(JobState::Done),
            failed: count(JobState::Failed),
            abandoned: count(JobState::Abandoned),
            jobs,
            peak_in_flight,
            duration,
        }
    }

    pub fn all_succeeded(&self) -> bool {
        self.succeeded == self.jobs.len()
    }
}

/// Runs ingest jobs under a concurrency ceiling.
#[derive(Clone)]
pub struct Orchestrator {
    ctx: Arc<IngestContext>,
}

impl Orchestrator {
    pub fn new(ctx: IngestContext) -> Self {
        Self { ctx: Arc::new(ctx) }
    }

    pub fn context(&self) -> &IngestContext {
        &self.ctx
    }

    /// Ingest every bundle of `source`.
    ///
    /// Returns `Err` only when the batch cannot start (bad configuration,
    /// unreadable batch directory). Job failures are reported per job.
    pub async fn run(&self, source: &BundleSource, cancel: CancellationToken) -> Result<BatchReport> {
        let started = Instant::now();
        let bundles = source.bundles()?;
        self.ctx.config.validate(bundles.len())?;

        let parallelism = self.ctx.config.parallelism;
        info!(
            bundles = bundles.len(),
            parallelism,
            dry_run = self.ctx.config.dry_run,
            "starting batch"
        );

        let sem = Arc::new(Semaphore::new(parallelism));
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::with_capacity(bundles.len());
        for bundle in &bundles {
            let ctx = Arc::clone(&self.ctx);
            let sem = Arc::clone(&sem);
            let in_flight = Arc::clone(&in_flight);
            let peak = Arc::clone(&peak);
            let cancel = cancel.clone();
            let bundle = bundle.clone();

            tasks.push(tokio::spawn(async move {
                let permit = tokio::select! {
                    permit = sem.acquire_owned() => permit.ok(),
                    _ = cancel.cancelled() => None,
                };
                // Stop dequeuing once cancelled.
                if permit.is_none() || cancel.is_cancelled() {
                    return JobReport::abandoned(&bundle);
                }

                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                let report = run_job(&ctx, &bundle, &cancel).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                report
            }));
        }

        let mut jobs = Vec::with_capacity(tasks.len());
        for (task, bundle) in futures::future::join_all(tasks).await.into_iter().zip(&bundles) {
            match task {
                Ok(report) => jobs.push(report),
                Err(e) => jobs.push(self.record_panic(bundle, &e.to_string()).await),
            }
        }

        let report = BatchReport::from_jobs(jobs, peak.load(Ordering::SeqCst), started.elapsed());
        obs::emit_batch_finished(
            report.jobs.len(),
            report.succeeded,
            report.failed,
            report.abandoned,
            report.duration.as_millis() as u64,
        );
        Ok(report)
    }

    /// A job task died without producing a report; record it as failed.
    async fn record_panic(&self, bundle: &Path, detail: &str) -> JobReport {
        warn!(bundle = %bundle.display(), error = %detail, "ingest job panicked");
        let mut report = JobReport::new(bundle);
        report.state = JobState::Failed;
        report.error = Some(format!("job aborted: {detail}"));
        if !self.ctx.config.dry_run {
            let entry = HistoryEntry::failure(
                &report.bundle_name,
                "",
                "",
                &self.ctx.config.profile,
                format!("job aborted: {detail}"),
                Duration::ZERO,
            );
            report.recorded = self.ctx.ledger.append(entry).await.is_ok();
        }
        report
    }
}
