//! Structured lifecycle events for ingest jobs and batches.
//!
//! Every job runs inside a [`JobSpan`]; the `emit_*` functions log one
//! `info!` line per lifecycle event with an `event` field, so JSON output
//! can be filtered by event name.

use tracing::{info, warn};

use crate::ingest::JobState;

/// RAII guard that enters a job-scoped span.
///
/// ```ignore
/// let _span = JobSpan::enter("3f2a9c", "alpha-20240101T000000Z.tar.gz");
/// // every event logged here carries job_id and bundle
/// ```
pub struct JobSpan {
    _span: tracing::span::EnteredSpan,
}

impl JobSpan {
    pub fn enter(job_id: &str, bundle: &str) -> Self {
        let span = tracing::info_span!("relay.job", job_id = %job_id, bundle = %bundle);
        Self {
            _span: span.entered(),
        }
    }
}

/// Create (without entering) the span a job future is instrumented with.
pub fn job_span(job_id: &str, bundle: &str) -> tracing::Span {
    tracing::info_span!("relay.job", job_id = %job_id, bundle = %bundle)
}

pub fn emit_job_started(job_id: &str, bundle: &str, dry_run: bool) {
    info!(event = "job.started", job_id = %job_id, bundle = %bundle, dry_run);
}

/// Emit event: job moved to a new state.
pub fn emit_job_transition(job_id: &str, from: JobState, to: JobState) {
    info!(
        event = "job.transition",
        job_id = %job_id,
        from = %from,
        to = %to,
    );
}

/// Emit event: job reached a terminal state.
pub fn emit_job_finished(
    job_id: &str,
    state: JobState,
    target: &str,
    duration_ms: u64,
    warnings: usize,
) {
    if state == JobState::Done {
        info!(
            event = "job.finished",
            job_id = %job_id,
            state = %state,
            target = %target,
            duration_ms,
            warnings,
        );
    } else {
        warn!(
            event = "job.finished",
            job_id = %job_id,
            state = %state,
            target = %target,
            duration_ms,
            warnings,
        );
    }
}

/// Emit event: a job warning that did not fail the job.
pub fn emit_job_warning(job_id: &str, warning: &str) {
    warn!(event = "job.warning", job_id = %job_id, warning = %warning);
}

/// Emit event: batch completed.
pub fn emit_batch_finished(
    jobs: usize,
    succeeded: usize,
    failed: usize,
    abandoned: usize,
    duration_ms: u64,
) {
    info!(
        event = "batch.finished",
        jobs,
        succeeded,
        failed,
        abandoned,
        duration_ms,
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[test]
    fn test_job_span_create() {
        let _span = JobSpan::enter("job", "bundle.tar.gz");
    }

    #[traced_test]
    #[test]
    fn test_transition_is_logged() {
        emit_job_transition("abc123", JobState::Resolving, JobState::Provisioning);
        assert!(logs_contain("job.transition"));
        assert!(logs_contain("provisioning"));
    }
}
