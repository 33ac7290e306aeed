//! Structured tracing emitted by ingest jobs and batches.

use std::sync::Arc;

use forge_client::fakes::MemoryForge;
use relay_core::mirror::memory::{MemoryMirrorTransport, RepoGraph};
use relay_core::obs::{emit_batch_finished, emit_job_warning};
use relay_core::{
    run_job, CancellationToken, DestinationConfig, IngestConfig, IngestContext, JobState,
    NameResolver, PackRequest, Packer, RetryPolicy,
};
use relay_state::fakes::MemoryHistoryLedger;
use relay_state::MappingTable;
use tracing_test::traced_test;

async fn single_job(mappings: &str) -> relay_core::JobReport {
    let transport = MemoryMirrorTransport::new();
    let mut graph = RepoGraph::new();
    graph.commit("main", "init");
    transport.seed("https://source.example/ext/svc.git", graph);

    let out = tempfile::tempdir().unwrap();
    let request = PackRequest::from_url("https://source.example/ext/svc.git", out.path())
        .with_retry(RetryPolicy::none());
    let bundle = Packer::new(Arc::new(transport.clone()))
        .pack(&request)
        .await
        .unwrap()
        .bundle_path;

    let forge = Arc::new(MemoryForge::new());
    forge.add_namespace("sec");
    let ctx = IngestContext::new(
        IngestConfig::new(DestinationConfig::new("memory://forge").with_token("t"))
            .with_retry(RetryPolicy::none()),
        NameResolver::new(MappingTable::from_json_slice("default", mappings.as_bytes()).unwrap()),
        forge,
        Arc::new(transport),
        Arc::new(MemoryHistoryLedger::new()),
    );
    run_job(&ctx, &bundle, &CancellationToken::new()).await
}

#[traced_test]
#[tokio::test]
async fn test_successful_job_logs_every_phase() {
    let report = single_job(r#"{"svc":"sec/svc"}"#).await;
    assert_eq!(report.state, JobState::Done);

    assert!(logs_contain("job.started"));
    assert!(logs_contain("job.transition"));
    for phase in ["resolving", "provisioning", "mirroring", "recording", "done"] {
        assert!(logs_contain(phase), "missing phase {phase}");
    }
    assert!(logs_contain("job.finished"));
    assert!(logs_contain(&report.job_id));
}

#[traced_test]
#[tokio::test]
async fn test_failed_job_logs_terminal_state() {
    let report = single_job("{}").await;
    assert_eq!(report.state, JobState::Failed);

    assert!(logs_contain("job.finished"));
    assert!(logs_contain("state=failed"));
    assert!(!logs_contain("to=provisioning"));
}

#[traced_test]
#[test]
fn test_batch_and_warning_events() {
    emit_job_warning("a1b2c3d4", "submodule 'docs' skipped");
    emit_batch_finished(5, 4, 1, 0, 1200);

    assert!(logs_contain("job.warning"));
    assert!(logs_contain("submodule 'docs' skipped"));
    assert!(logs_contain("batch.finished"));
    assert!(logs_contain("succeeded=4"));
}
