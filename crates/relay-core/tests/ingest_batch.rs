//! Batch ingest tests against the in-memory forge, transport and ledger.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use forge_client::fakes::MemoryForge;
use forge_client::{ForgeConfig, Job, Pipeline};
use relay_core::mirror::memory::{MemoryMirrorTransport, RepoGraph};
use relay_core::{
    BundleSource, CancellationToken, DestinationConfig, ForcePolicy, IngestConfig, IngestContext,
    JobState, NameResolver, Orchestrator, PackRequest, PackSource, Packer, PushResult, RetryPolicy,
    SubmoduleMap,
};
use relay_state::fakes::MemoryHistoryLedger;
use relay_state::{HistoryLedger, HistoryStatus, MappingTable};

const SOURCE: &str = "https://source.example";

struct Harness {
    forge: Arc<MemoryForge>,
    transport: MemoryMirrorTransport,
    ledger: Arc<MemoryHistoryLedger>,
    bundles: tempfile::TempDir,
}

impl Harness {
    fn new() -> Self {
        let forge = Arc::new(MemoryForge::new());
        forge.add_namespace("sec");
        Self {
            forge,
            transport: MemoryMirrorTransport::new(),
            ledger: Arc::new(MemoryHistoryLedger::new()),
            bundles: tempfile::tempdir().unwrap(),
        }
    }

    fn source_url(name: &str) -> String {
        format!("{SOURCE}/ext/{name}.git")
    }

    fn dest_url(path: &str) -> String {
        format!("memory://forge/{path}.git")
    }

    /// Seed a source repository and pack it into the bundle directory.
    async fn bundle(&self, name: &str, graph: RepoGraph) -> PathBuf {
        let url = Self::source_url(name);
        self.transport.seed(&url, graph);
        let request = PackRequest::from_url(&url, self.bundles.path()).with_retry(RetryPolicy::none());
        Packer::new(Arc::new(self.transport.clone()))
            .pack(&request)
            .await
            .unwrap()
            .bundle_path
    }

    async fn simple_bundle(&self, name: &str) -> PathBuf {
        let mut g = RepoGraph::new();
        g.commit("main", &format!("{name}-init"));
        g.commit("main", &format!("{name}-second"));
        self.bundle(name, g).await
    }

    fn config(&self) -> IngestConfig {
        IngestConfig::new(DestinationConfig::new("memory://forge").with_token("glpat-test"))
            .with_retry(RetryPolicy::none())
    }

    fn orchestrator(&self, config: IngestConfig, mappings: &str) -> Orchestrator {
        let table = MappingTable::from_json_slice("default", mappings.as_bytes()).unwrap();
        let resolver = NameResolver::new(table).with_namespace(Some("sec".to_string()));
        Orchestrator::new(IngestContext::new(
            config,
            resolver,
            self.forge.clone(),
            Arc::new(self.transport.clone()),
            self.ledger.clone(),
        ))
    }
}

fn mappings_for(names: &[&str]) -> String {
    let body: Vec<String> = names
        .iter()
        .map(|n| format!("\"{n}\":{{\"internal_name\":\"sec/{n}\"}}"))
        .collect();
    format!("{{{}}}", body.join(","))
}

#[tokio::test]
async fn test_one_corrupt_bundle_does_not_stop_the_batch() {
    let h = Harness::new();
    for name in ["r1", "r2", "r4", "r5"] {
        h.simple_bundle(name).await;
    }
    std::fs::write(h.bundles.path().join("r3-corrupt.tar.gz"), b"definitely not gzip").unwrap();

    let orch = h.orchestrator(
        h.config().with_parallelism(2),
        &mappings_for(&["r1", "r2", "r4", "r5"]),
    );
    let report = orch
        .run(
            &BundleSource::Directory(h.bundles.path().to_path_buf()),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(report.jobs.len(), 5);
    assert_eq!(report.succeeded, 4);
    assert_eq!(report.failed, 1);
    let corrupt = report
        .jobs
        .iter()
        .find(|j| j.bundle_name == "r3-corrupt.tar.gz")
        .unwrap();
    assert_eq!(corrupt.state, JobState::Failed);
    assert!(corrupt.error.as_deref().unwrap().contains("corrupt bundle"));

    let entries = h.ledger.entries();
    assert_eq!(entries.len(), 5);
    assert_eq!(
        entries.iter().filter(|e| e.status == HistoryStatus::Failed).count(),
        1
    );
    for name in ["r1", "r2", "r4", "r5"] {
        assert!(h.transport.repo(&Harness::dest_url(&format!("sec/{name}"))).is_some());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_jobs_in_flight_never_exceed_parallelism() {
    let h = Harness::new();
    let names = ["a", "b", "c", "d", "e", "f"];
    for name in names {
        h.simple_bundle(name).await;
    }
    h.transport.set_apply_delay(Duration::from_millis(100));

    let report = h
        .orchestrator(h.config().with_parallelism(2), &mappings_for(&names))
        .run(
            &BundleSource::Directory(h.bundles.path().to_path_buf()),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(report.succeeded, 6);
    assert_eq!(report.peak_in_flight, 2);
    assert!(h.transport.peak_in_flight() <= 2);
    assert_eq!(h.transport.apply_count(), 6);
}

#[tokio::test]
async fn test_existing_project_is_not_recreated() {
    let h = Harness::new();
    let bundle = h.simple_bundle("alpha").await;
    h.forge.add_project("sec/alpha");

    let report = h
        .orchestrator(h.config(), &mappings_for(&["alpha"]))
        .run(&BundleSource::Single(bundle), CancellationToken::new())
        .await
        .unwrap();

    let job = &report.jobs[0];
    assert_eq!(job.state, JobState::Done);
    assert!(!job.created);
    assert_eq!(h.forge.create_calls(), 0);
}

#[tokio::test]
async fn test_reapplying_a_bundle_pushes_nothing() {
    let h = Harness::new();
    let bundle = h.simple_bundle("alpha").await;
    let orch = h.orchestrator(h.config(), &mappings_for(&["alpha"]));
    let source = BundleSource::Single(bundle);

    let first = orch.run(&source, CancellationToken::new()).await.unwrap();
    assert!(first.jobs[0].created);
    assert_eq!(
        first.jobs[0].push,
        Some(PushResult {
            refs_pushed: 1,
            commits_pushed: 2
        })
    );

    let second = orch.run(&source, CancellationToken::new()).await.unwrap();
    assert_eq!(second.jobs[0].state, JobState::Done);
    assert!(!second.jobs[0].created);
    assert_eq!(second.jobs[0].push, Some(PushResult::default()));
    assert_eq!(h.forge.create_calls(), 1);
    assert_eq!(h.ledger.len(), 2);
}

#[tokio::test]
async fn test_force_policy_on_diverged_destination() {
    let h = Harness::new();

    let mut src = RepoGraph::new();
    let base = src.commit("main", "base");
    let incoming = src.commit("main", "incoming");
    let bundle = h.bundle("alpha", src).await;

    h.forge.add_project("sec/alpha");
    let mut dest = RepoGraph::new();
    dest.commit("main", "base");
    dest.rewrite("main", Some(base.as_str()), "hotfix made on the inside");
    let dest_url = Harness::dest_url("sec/alpha");
    h.transport.seed(&dest_url, dest.clone());

    let strict = h.orchestrator(
        h.config().with_force_policy(ForcePolicy::FailOnDiverge),
        &mappings_for(&["alpha"]),
    );
    let report = strict
        .run(&BundleSource::Single(bundle.clone()), CancellationToken::new())
        .await
        .unwrap();
    let job = &report.jobs[0];
    assert_eq!(job.state, JobState::Failed);
    assert!(job.error.as_deref().unwrap().contains("refs/heads/main"));
    assert_eq!(h.transport.repo(&dest_url).unwrap(), dest);
    assert_eq!(h.ledger.entries()[0].status, HistoryStatus::Failed);

    let forcing = h.orchestrator(h.config(), &mappings_for(&["alpha"]));
    let report = forcing
        .run(&BundleSource::Single(bundle), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.jobs[0].state, JobState::Done);
    assert_eq!(h.transport.repo(&dest_url).unwrap().branch("main"), Some(&incoming));
}

#[tokio::test]
async fn test_unmapped_repository_fails_and_is_recorded() {
    let h = Harness::new();
    let alpha = h.simple_bundle("alpha").await;
    let beta = h.simple_bundle("beta").await;

    let report = h
        .orchestrator(h.config(), r#"{"alpha":{"internal_name":"sec/alpha"}}"#)
        .run(&BundleSource::List(vec![alpha, beta]), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.succeeded, 1);
    let beta = &report.jobs[1];
    assert_eq!(beta.state, JobState::Failed);
    assert_eq!(beta.source_repo, "beta");
    assert_eq!(
        beta.error.as_deref(),
        Some("no mapping for repository 'beta'")
    );

    let recorded = h.ledger.query(10).await.unwrap();
    assert_eq!(recorded.len(), 2);
    assert!(recorded.iter().any(|e| e.source_repo == "beta" && !e.is_success()));
    assert!(h.forge.project("sec/beta").is_none());
}

#[tokio::test]
async fn test_target_override_bypasses_resolver() {
    let h = Harness::new();
    h.forge.add_namespace("other/team");
    let bundle = h.simple_bundle("unlisted").await;

    let report = h
        .orchestrator(h.config().with_target_path("other/team/renamed"), "{}")
        .run(&BundleSource::Single(bundle), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.jobs[0].state, JobState::Done);
    assert_eq!(report.jobs[0].target_repo, "other/team/renamed");
    assert!(h.forge.project("other/team/renamed").is_some());
}

#[tokio::test]
async fn test_dry_run_mutates_nothing() {
    let h = Harness::new();
    let bundle = h.simple_bundle("alpha").await;

    let report = h
        .orchestrator(h.config().with_dry_run(true), &mappings_for(&["alpha"]))
        .run(&BundleSource::Single(bundle), CancellationToken::new())
        .await
        .unwrap();

    let job = &report.jobs[0];
    assert_eq!(job.state, JobState::Done);
    assert!(job.created);
    assert!(job.push.is_none());
    assert!(job.planned.iter().any(|p| p.starts_with("create project sec/alpha")));
    assert!(job.planned.iter().any(|p| p.starts_with("mirror 1 ref(s)")));
    assert_eq!(h.forge.create_calls(), 0);
    assert_eq!(h.transport.apply_count(), 0);
    assert!(h.ledger.is_empty());
}

#[tokio::test]
async fn test_cancelled_batch_abandons_jobs_without_recording() {
    let h = Harness::new();
    h.simple_bundle("a").await;
    h.simple_bundle("b").await;
    let cancel = CancellationToken::new();
    cancel.cancel();

    let report = h
        .orchestrator(h.config(), &mappings_for(&["a", "b"]))
        .run(&BundleSource::Directory(h.bundles.path().to_path_buf()), cancel)
        .await
        .unwrap();

    assert_eq!(report.abandoned, 2);
    assert!(report.jobs.iter().all(|j| !j.recorded));
    assert!(h.ledger.is_empty());
}

#[tokio::test]
async fn test_rejected_push_fails_only_that_job() {
    let h = Harness::new();
    let a = h.simple_bundle("a").await;
    let b = h.simple_bundle("b").await;
    h.transport
        .reject_pushes_to(&Harness::dest_url("sec/b"), "pre-receive hook declined");

    let report = h
        .orchestrator(h.config().with_parallelism(2), &mappings_for(&["a", "b"]))
        .run(&BundleSource::List(vec![a, b]), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.jobs[0].state, JobState::Done);
    assert_eq!(report.jobs[1].state, JobState::Failed);
    assert!(report.jobs[1]
        .error
        .as_deref()
        .unwrap()
        .contains("pre-receive hook declined"));
    assert_eq!(h.ledger.len(), 2);
}

// ---------------------------------------------------------------------------
// Submodules
// ---------------------------------------------------------------------------

async fn bundle_with_submodule(h: &Harness) -> PathBuf {
    let mut lib = RepoGraph::new();
    lib.commit("main", "lib");
    h.transport.seed(&Harness::source_url("lib"), lib);

    let mut app = RepoGraph::new()
        .with_gitmodules("[submodule \"vendor/lib\"]\n\tpath = vendor/lib\n\turl = ../lib.git\n");
    app.commit("main", "app");
    let url = Harness::source_url("app");
    h.transport.seed(&url, app);

    let request = PackRequest::from_url(&url, h.bundles.path())
        .with_submodules(true)
        .with_retry(RetryPolicy::none());
    Packer::new(Arc::new(h.transport.clone()))
        .pack(&request)
        .await
        .unwrap()
        .bundle_path
}

#[tokio::test]
async fn test_submodule_goes_to_sibling_project() {
    let h = Harness::new();
    let bundle = bundle_with_submodule(&h).await;

    let report = h
        .orchestrator(h.config(), &mappings_for(&["app"]))
        .run(&BundleSource::Single(bundle), CancellationToken::new())
        .await
        .unwrap();

    let job = &report.jobs[0];
    assert_eq!(job.state, JobState::Done, "{:?}", job.error);
    assert_eq!(job.submodules.len(), 1);
    assert_eq!(job.submodules[0].target_path, "sec/lib");
    assert!(job.submodules[0].created);
    assert_eq!(
        job.url_map.get(&Harness::source_url("lib")).map(String::as_str),
        Some("sec/lib")
    );
    assert!(h.transport.repo(&Harness::dest_url("sec/lib")).is_some());
}

#[tokio::test]
async fn test_submodule_mapping_and_failures_are_warnings() {
    let h = Harness::new();
    let bundle = bundle_with_submodule(&h).await;
    h.transport
        .reject_pushes_to(&Harness::dest_url("vendored/lib"), "protected branch");
    h.forge.add_namespace("vendored");

    let table = MappingTable::from_json_slice("subs", br#"{"vendor/lib":"vendored/lib"}"#).unwrap();
    let table_app = MappingTable::from_json_slice("default", mappings_for(&["app"]).as_bytes()).unwrap();
    let ctx = IngestContext::new(
        h.config(),
        NameResolver::new(table_app),
        h.forge.clone(),
        Arc::new(h.transport.clone()),
        h.ledger.clone(),
    )
    .with_submodule_map(SubmoduleMap::from_table(table));

    let report = Orchestrator::new(ctx)
        .run(&BundleSource::Single(bundle), CancellationToken::new())
        .await
        .unwrap();

    let job = &report.jobs[0];
    assert_eq!(job.state, JobState::Done);
    assert_eq!(job.submodules[0].target_path, "vendored/lib");
    assert!(job.submodules[0].error.is_some());
    assert_eq!(job.warnings.len(), 1);
    assert!(h.ledger.entries()[0].is_success());
}

// ---------------------------------------------------------------------------
// Artifacts
// ---------------------------------------------------------------------------

async fn bundle_with_artifacts(h: &Harness, archive: &[u8]) -> PathBuf {
    artifacts_bundle(h, "app", archive).await
}

/// Pack `ext/<name>` with one `build` job archive from pipeline 77.
async fn artifacts_bundle(h: &Harness, name: &str, archive: &[u8]) -> PathBuf {
    let mut graph = RepoGraph::new();
    graph.commit("main", name);
    h.transport.seed(&Harness::source_url(name), graph);

    let source_forge = Arc::new(MemoryForge::with_base_url(SOURCE));
    source_forge.add_pipeline(
        &format!("ext/{name}"),
        Pipeline {
            id: 77,
            git_ref: "main".to_string(),
            sha: "deadbeef".to_string(),
        },
    );
    source_forge.add_job(
        77,
        Job {
            id: 9001,
            name: "build".to_string(),
            stage: "build".to_string(),
            artifacts_size: archive.len() as u64,
        },
        archive.to_vec(),
    );

    let request = PackRequest::new(
        PackSource::Forge {
            forge: ForgeConfig::new(SOURCE).with_token("source-token"),
            repo_path: format!("ext/{name}"),
        },
        h.bundles.path(),
    )
    .with_artifacts(true, None)
    .with_retry(RetryPolicy::none());

    let outcome = Packer::new(Arc::new(h.transport.clone()))
        .with_source_api(source_forge)
        .pack(&request)
        .await
        .unwrap();
    assert!(outcome.manifest.with_artifacts);
    assert_eq!(outcome.manifest.artifacts[0].job_name, "build");
    assert_eq!(outcome.manifest.artifacts[0].pipeline_id, 77);
    outcome.bundle_path
}

#[tokio::test]
async fn test_artifacts_publish_as_generic_packages() {
    let h = Harness::new();
    let bundle = bundle_with_artifacts(&h, b"PK\x03\x04 fake zip").await;

    let report = h
        .orchestrator(h.config(), &mappings_for(&["app"]))
        .run(&BundleSource::Single(bundle), CancellationToken::new())
        .await
        .unwrap();

    let job = &report.jobs[0];
    assert_eq!(job.state, JobState::Done);
    assert_eq!(job.packages.len(), 1);
    assert_eq!(job.packages[0].package_name, "build");
    assert_eq!(job.packages[0].version, "77");

    let stored = h.forge.packages();
    assert_eq!(stored[0].content, b"PK\x03\x04 fake zip");
    assert_eq!(h.ledger.entries()[0].artifacts_count, 1);
}

#[tokio::test]
async fn test_failed_upload_is_a_warning() {
    let h = Harness::new();
    let bundle = bundle_with_artifacts(&h, b"zip").await;
    h.forge.fail_uploads_of("build");

    let report = h
        .orchestrator(h.config(), &mappings_for(&["app"]))
        .run(&BundleSource::Single(bundle), CancellationToken::new())
        .await
        .unwrap();

    let job = &report.jobs[0];
    assert_eq!(job.state, JobState::Done);
    assert!(job.packages.is_empty());
    assert_eq!(job.warnings.len(), 1);
    assert!(job.warnings[0].contains("build/77"));
}

fn bundle_stem(bundle: &std::path::Path) -> String {
    let name = bundle.file_name().unwrap().to_string_lossy().into_owned();
    name.strip_suffix(".tar.gz").unwrap().to_string()
}

#[tokio::test]
async fn test_artifacts_extract_to_output_dir() {
    let h = Harness::new();
    let archive = vec![42u8; 4096];
    let bundle = bundle_with_artifacts(&h, &archive).await;
    let out = tempfile::tempdir().unwrap();

    let report = h
        .orchestrator(
            h.config().with_artifacts_output_dir(out.path()),
            &mappings_for(&["app"]),
        )
        .run(&BundleSource::Single(bundle.clone()), CancellationToken::new())
        .await
        .unwrap();

    let job = &report.jobs[0];
    let extracted = job.extracted.unwrap();
    assert_eq!((extracted.files, extracted.bytes), (1, 4096));
    assert_eq!(
        std::fs::read(out.path().join(bundle_stem(&bundle)).join("build").join("artifacts.zip")).unwrap(),
        archive
    );
    assert_eq!(h.forge.upload_calls(), 0);
}

#[tokio::test]
async fn test_artifacts_extract_and_publish() {
    let h = Harness::new();
    let bundle = bundle_with_artifacts(&h, b"both ways").await;
    let out = tempfile::tempdir().unwrap();

    let report = h
        .orchestrator(
            h.config()
                .with_artifacts_output_dir(out.path())
                .with_publish_artifacts(true),
            &mappings_for(&["app"]),
        )
        .run(&BundleSource::Single(bundle.clone()), CancellationToken::new())
        .await
        .unwrap();

    let job = &report.jobs[0];
    assert_eq!(job.state, JobState::Done);
    assert_eq!(job.extracted.unwrap().files, 1);
    assert_eq!(job.packages.len(), 1);
    assert_eq!(h.forge.packages()[0].content, b"both ways");
    assert!(out
        .path()
        .join(bundle_stem(&bundle))
        .join("build/artifacts.zip")
        .is_file());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_parallel_extractions_do_not_share_files() {
    let h = Harness::new();
    let a = artifacts_bundle(&h, "alpha", &[1u8; 100]).await;
    let b = artifacts_bundle(&h, "beta", &[2u8; 200]).await;
    let out = tempfile::tempdir().unwrap();

    let report = h
        .orchestrator(
            h.config()
                .with_artifacts_output_dir(out.path())
                .with_parallelism(2),
            &mappings_for(&["alpha", "beta"]),
        )
        .run(&BundleSource::Directory(h.bundles.path().to_path_buf()), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.succeeded, 2);
    for (bundle, byte, len) in [(&a, 1u8, 100usize), (&b, 2u8, 200usize)] {
        let file = out.path().join(bundle_stem(bundle)).join("build/artifacts.zip");
        assert_eq!(std::fs::read(file).unwrap(), vec![byte; len]);
    }
    let total: u64 = h.ledger.entries().iter().map(|e| e.artifacts_count).sum();
    assert_eq!(total, 2);
}

#[tokio::test]
async fn test_cancel_during_last_step_still_records() {
    let h = Harness::new();
    let bundle = bundle_with_artifacts(&h, b"late").await;
    h.forge.set_upload_delay(Duration::from_millis(300));

    let orchestrator = h.orchestrator(h.config(), &mappings_for(&["app"]));
    let cancel = CancellationToken::new();
    let batch = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            orchestrator
                .run(&BundleSource::Single(bundle), cancel)
                .await
                .unwrap()
        }
    });

    while h.forge.upload_calls() == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    cancel.cancel();
    let report = batch.await.unwrap();

    let job = &report.jobs[0];
    assert_eq!(job.state, JobState::Done);
    assert!(job.recorded);
    assert_eq!(job.packages.len(), 1);
    assert_eq!(h.ledger.entries().len(), 1);
    assert_eq!(h.ledger.entries()[0].status, HistoryStatus::Success);
}

#[tokio::test]
async fn test_skip_artifacts() {
    let h = Harness::new();
    let bundle = bundle_with_artifacts(&h, b"zip").await;

    let report = h
        .orchestrator(h.config().with_skip_artifacts(true), &mappings_for(&["app"]))
        .run(&BundleSource::Single(bundle), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.jobs[0].state, JobState::Done);
    assert_eq!(h.forge.upload_calls(), 0);
    assert_eq!(h.ledger.entries()[0].artifacts_count, 0);
}
