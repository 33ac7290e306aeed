//! airgap-relay - move git repositories and CI artifacts across an air gap
//!
//! ## Commands
//!
//! - `pack`: mirror a repository (plus submodules and CI artifacts) into a bundle
//! - `ingest`: apply one bundle, or a directory of bundles, to the destination forge
//! - `mapping`: manage the external -> internal name tables
//! - `history`: inspect or clear the ingest history

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::json;
use std::path::{Path, PathBuf};
use tracing::{info, warn, Level};

use forge_client::ForgeConfig;
use relay_core::ingest::HISTORY_FILE;
use relay_core::{
    pack_repository, BatchReport, BundleSource, CancellationToken, DestinationConfig,
    ForcePolicy, GitCredentials, IngestConfig, IngestContext, JobReport, JobState, Orchestrator,
    PackRequest, PackSource, Visibility,
};
use relay_state::{HistoryEntry, HistoryLedger, JsonHistoryLedger, MappingStore, ProfileExport};

#[derive(Parser)]
#[command(name = "airgap-relay")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Move git repositories and CI artifacts across an air gap", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON reports and JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Directory holding mappings, backups and history (default: ~/.airgap-relay)
    #[arg(long, global = true, env = "RELAY_CONFIG_DIR")]
    config_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Pack a repository into a transfer bundle
    Pack(PackArgs),

    /// Ingest bundles into the destination forge
    Ingest(IngestArgs),

    /// Manage repository name mappings
    Mapping {
        #[command(subcommand)]
        action: MappingAction,
    },

    /// Show or clear the ingest history
    History {
        #[command(subcommand)]
        action: HistoryAction,
    },
}

#[derive(Args)]
struct PackArgs {
    /// Clone URL, or a project path (group/name) when --forge-url is set
    source: String,

    /// Base URL of the source forge; enables artifact download
    #[arg(long, env = "RELAY_SOURCE_URL")]
    forge_url: Option<String>,

    /// Access token for the source
    #[arg(long, env = "RELAY_SOURCE_TOKEN", hide_env_values = true)]
    source_token: Option<String>,

    /// Directory the bundle is written to
    #[arg(short, long, default_value = ".")]
    output_dir: PathBuf,

    /// Repository name inside the bundle (default: derived from the URL)
    #[arg(long)]
    name: Option<String>,

    /// Also mirror submodules
    #[arg(long)]
    submodules: bool,

    /// Also download CI artifacts of the latest successful pipeline
    #[arg(long)]
    artifacts: bool,

    /// Branch or tag whose pipeline provides the artifacts
    #[arg(long = "ref")]
    git_ref: Option<String>,

    /// Skip TLS certificate verification
    #[arg(long)]
    insecure: bool,

    /// Scratch directory for staging (default: system temp)
    #[arg(long)]
    work_dir: Option<PathBuf>,
}

#[derive(Args)]
struct IngestArgs {
    /// Bundle to ingest
    #[arg(conflicts_with = "batch_dir")]
    bundle: Option<PathBuf>,

    /// Ingest every *.tar.gz in this directory
    #[arg(long)]
    batch_dir: Option<PathBuf>,

    /// Destination forge URL
    #[arg(long, env = "RELAY_TARGET_URL")]
    target_url: Option<String>,

    /// Destination access token
    #[arg(long, env = "RELAY_TARGET_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Default namespace for names without one
    #[arg(long, env = "RELAY_NAMESPACE")]
    namespace: Option<String>,

    /// Explicit destination project path, bypassing the mapping table
    #[arg(long)]
    target_path: Option<String>,

    /// Visibility of created projects
    #[arg(long, default_value = "private")]
    visibility: Visibility,

    /// Mapping profile (default: the active profile)
    #[arg(long)]
    profile: Option<String>,

    /// JSON file mapping submodule paths to destination project paths
    #[arg(long)]
    submodule_map: Option<PathBuf>,

    /// Fail instead of force-pushing over diverged destination refs
    #[arg(long)]
    no_force: bool,

    /// Show what would happen without changing the destination
    #[arg(long)]
    dry_run: bool,

    /// Do not deliver CI artifacts
    #[arg(long)]
    skip_artifacts: bool,

    /// Extract artifacts under <DIR>/<bundle>/ instead of publishing them as packages
    #[arg(long)]
    artifacts_output_dir: Option<PathBuf>,

    /// With --artifacts-output-dir, also publish artifacts as packages
    #[arg(long, requires = "artifacts_output_dir")]
    publish_artifacts: bool,

    /// Bundles processed at the same time
    #[arg(short = 'j', long, default_value = "1")]
    parallel: usize,

    /// Skip TLS certificate verification
    #[arg(long)]
    insecure: bool,

    /// Scratch directory for unpacking bundles (default: system temp)
    #[arg(long)]
    work_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum MappingAction {
    /// Add or replace a mapping
    Add {
        external: String,
        internal: String,
        #[arg(long)]
        notes: Option<String>,
        /// Profile to edit (default: the active profile)
        #[arg(long)]
        profile: Option<String>,
    },
    /// Remove a mapping
    Remove {
        external: String,
        #[arg(long)]
        profile: Option<String>,
    },
    /// List the mappings of a profile
    List {
        #[arg(long)]
        profile: Option<String>,
    },
    /// List profiles
    Profiles,
    /// Create, delete, export or import profiles
    Profile {
        #[command(subcommand)]
        action: ProfileAction,
    },
    /// Check a profile's mapping file for problems
    Validate {
        #[arg(long)]
        profile: Option<String>,
    },
}

#[derive(Subcommand)]
enum ProfileAction {
    /// Register a new, empty profile
    Create {
        name: String,
        #[arg(long, default_value = "")]
        description: String,
    },
    /// Change a profile's description
    Update {
        name: String,
        #[arg(long)]
        description: String,
    },
    /// Delete a profile and its mappings
    Delete { name: String },
    /// Make a profile the default for commands that name none
    Use { name: String },
    /// Write a profile and its mappings as JSON
    Export {
        name: String,
        /// Output file (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Register a profile from an exported JSON file
    Import { file: PathBuf },
}

#[derive(Subcommand)]
enum HistoryAction {
    /// Show the most recent ingest attempts
    List {
        #[arg(short = 'n', long, default_value = "20")]
        limit: usize,
    },
    /// Show one history entry
    Show { id: String },
    /// Delete all history entries
    Clear {
        /// Confirm deletion
        #[arg(long)]
        yes: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    relay_core::telemetry::init_tracing(cli.json, level);

    let config_dir = cli.config_dir.clone().unwrap_or_else(default_config_dir);

    match cli.command {
        Commands::Pack(args) => cmd_pack(&args, cli.json).await,
        Commands::Ingest(args) => cmd_ingest(&config_dir, &args, cli.json).await,
        Commands::Mapping { action } => match action {
            MappingAction::Add {
                external,
                internal,
                notes,
                profile,
            } => {
                let profile = profile_or_active(&config_dir, profile)?;
                cmd_mapping_add(&config_dir, &profile, &external, &internal, notes)
            }
            MappingAction::Remove { external, profile } => {
                let profile = profile_or_active(&config_dir, profile)?;
                cmd_mapping_remove(&config_dir, &profile, &external)
            }
            MappingAction::List { profile } => {
                let profile = profile_or_active(&config_dir, profile)?;
                cmd_mapping_list(&config_dir, &profile, cli.json)
            }
            MappingAction::Profiles => cmd_mapping_profiles(&config_dir),
            MappingAction::Profile { action } => cmd_profile(&config_dir, action),
            MappingAction::Validate { profile } => {
                let profile = profile_or_active(&config_dir, profile)?;
                cmd_mapping_validate(&config_dir, &profile)
            }
        },
        Commands::History { action } => match action {
            HistoryAction::List { limit } => cmd_history_list(&config_dir, limit, cli.json).await,
            HistoryAction::Show { id } => cmd_history_show(&config_dir, &id).await,
            HistoryAction::Clear { yes } => cmd_history_clear(&config_dir, yes).await,
        },
    }
}

fn default_config_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".airgap-relay")
}

// ---------------------------------------------------------------------------
// pack
// ---------------------------------------------------------------------------

fn build_pack_request(args: &PackArgs) -> Result<PackRequest> {
    let source = match &args.forge_url {
        Some(base) => {
            let mut forge = ForgeConfig::new(base);
            if let Some(token) = &args.source_token {
                forge = forge.with_token(token);
            }
            PackSource::Forge {
                forge,
                repo_path: args.source.trim_matches('/').to_string(),
            }
        }
        None => PackSource::Url {
            url: args.source.clone(),
            credentials: args
                .source_token
                .as_deref()
                .map(|t| GitCredentials::new("oauth2", t)),
        },
    };

    let mut request = PackRequest::new(source, &args.output_dir)
        .with_submodules(args.submodules)
        .with_artifacts(args.artifacts, args.git_ref.as_deref())
        .with_verify_tls(!args.insecure);
    if let Some(name) = &args.name {
        request = request.with_repo_name(name);
    }
    if let Some(dir) = &args.work_dir {
        request = request.with_work_dir(dir);
    }
    request.validate()?;
    Ok(request)
}

/// Pack a repository into a bundle
async fn cmd_pack(args: &PackArgs, json_output: bool) -> Result<()> {
    let request = build_pack_request(args)?;
    let outcome = pack_repository(&request)
        .await
        .context(format!("Failed to pack {}", args.source))?;

    if json_output {
        let doc = json!({
            "bundle": outcome.bundle_path,
            "manifest": outcome.manifest,
            "warnings": outcome.warnings,
        });
        println!("{}", serde_json::to_string_pretty(&doc)?);
        return Ok(());
    }

    println!("Bundle: {}", outcome.bundle_path.display());
    println!("  Repository:  {}", outcome.manifest.repo_name);
    println!("  Submodules:  {}", outcome.manifest.submodules.len());
    println!("  Artifacts:   {}", outcome.manifest.artifacts.len());
    for warning in &outcome.warnings {
        println!("  warning: {warning}");
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// ingest
// ---------------------------------------------------------------------------

fn build_ingest_config(args: &IngestArgs) -> Result<IngestConfig> {
    let mut destination = DestinationConfig::new(args.target_url.as_deref().unwrap_or_default())
        .with_verify_tls(!args.insecure);
    if let Some(token) = &args.token {
        destination = destination.with_token(token);
    }
    if let Some(ns) = &args.namespace {
        destination = destination.with_namespace(ns);
    }

    let force_policy = if args.no_force {
        ForcePolicy::FailOnDiverge
    } else {
        ForcePolicy::AllowForce
    };
    let mut config = IngestConfig::new(destination)
        .with_visibility(args.visibility)
        .with_force_policy(force_policy)
        .with_dry_run(args.dry_run)
        .with_skip_artifacts(args.skip_artifacts)
        .with_publish_artifacts(args.publish_artifacts)
        .with_parallelism(args.parallel);
    if let Some(profile) = &args.profile {
        config = config.with_profile(profile);
    }
    if let Some(path) = &args.target_path {
        config = config.with_target_path(path);
    }
    if let Some(path) = &args.submodule_map {
        config = config.with_submodule_mapping_file(path);
    }
    if let Some(dir) = &args.artifacts_output_dir {
        config = config.with_artifacts_output_dir(dir);
    }
    if let Some(dir) = &args.work_dir {
        config = config.with_work_dir(dir);
    }
    Ok(config)
}

fn bundle_source(args: &IngestArgs) -> Result<BundleSource> {
    match (&args.bundle, &args.batch_dir) {
        (Some(bundle), None) => Ok(BundleSource::Single(bundle.clone())),
        (None, Some(dir)) => Ok(BundleSource::Directory(dir.clone())),
        _ => bail!("Pass either a bundle path or --batch-dir"),
    }
}

/// Ingest one bundle or a batch directory
async fn cmd_ingest(config_dir: &Path, args: &IngestArgs, json_output: bool) -> Result<()> {
    let mut config = build_ingest_config(args)?;
    if args.profile.is_none() {
        config = config.with_profile(&profile_or_active(config_dir, None)?);
    }
    let source = bundle_source(args)?;

    let ctx = IngestContext::connect(config, config_dir)
        .await
        .context("Failed to prepare ingest")?;

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, abandoning remaining jobs");
            on_interrupt.cancel();
        }
    });

    let report = Orchestrator::new(ctx).run(&source, cancel).await?;
    print_batch(&report, json_output)?;

    if report.failed > 0 {
        bail!("{} of {} job(s) failed", report.failed, report.jobs.len());
    }
    if report.abandoned > 0 {
        bail!("Interrupted: {} job(s) abandoned", report.abandoned);
    }
    Ok(())
}

fn print_batch(report: &BatchReport, json_output: bool) -> Result<()> {
    if json_output {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }
    for job in &report.jobs {
        print_job(job);
    }
    if report.jobs.len() > 1 {
        println!();
        println!(
            "{} succeeded, {} failed, {} abandoned in {:.1}s",
            report.succeeded,
            report.failed,
            report.abandoned,
            report.duration.as_secs_f64()
        );
    }
    Ok(())
}

fn print_job(job: &JobReport) {
    let marker = match job.state {
        JobState::Done => "ok",
        JobState::Failed => "FAILED",
        other => other.as_str(),
    };
    let target = if job.target_repo.is_empty() {
        "-"
    } else {
        job.target_repo.as_str()
    };
    println!(
        "[{marker}] {} -> {target} ({:.1}s)",
        job.bundle_name,
        job.duration.as_secs_f64()
    );
    if job.created && job.planned.is_empty() {
        println!("    created project {target}");
    }
    if let Some(push) = job.push {
        println!(
            "    pushed {} ref(s), {} commit(s)",
            push.refs_pushed, push.commits_pushed
        );
    }
    for sub in &job.submodules {
        match &sub.error {
            Some(e) => println!("    submodule {} -> {}: {e}", sub.path, sub.target_path),
            None => println!("    submodule {} -> {}", sub.path, sub.target_path),
        }
    }
    for package in &job.packages {
        println!(
            "    package {}/{} ({} bytes)",
            package.package_name, package.version, package.size
        );
    }
    if let Some(extracted) = job.extracted {
        println!(
            "    extracted {} file(s), {} bytes",
            extracted.files, extracted.bytes
        );
    }
    for plan in &job.planned {
        println!("    would {plan}");
    }
    for warning in &job.warnings {
        println!("    warning: {warning}");
    }
    if let Some(error) = &job.error {
        println!("    error: {error}");
    }
}

// ---------------------------------------------------------------------------
// mapping
// ---------------------------------------------------------------------------

fn cmd_mapping_add(
    config_dir: &Path,
    profile: &str,
    external: &str,
    internal: &str,
    notes: Option<String>,
) -> Result<()> {
    let store = MappingStore::open(config_dir).context("Failed to open mapping store")?;
    let entry = store.add_mapping(profile, external, internal, notes)?;
    println!(
        "Mapped {} -> {} (profile '{profile}')",
        entry.external_name, entry.internal_name
    );
    Ok(())
}

fn cmd_mapping_remove(config_dir: &Path, profile: &str, external: &str) -> Result<()> {
    let store = MappingStore::open(config_dir).context("Failed to open mapping store")?;
    if !store.remove_mapping(profile, external)? {
        bail!("No mapping for '{external}' in profile '{profile}'");
    }
    println!("Removed mapping for {external} (profile '{profile}')");
    Ok(())
}

fn cmd_mapping_list(config_dir: &Path, profile: &str, json_output: bool) -> Result<()> {
    let store = MappingStore::open(config_dir).context("Failed to open mapping store")?;
    let table = store.load(profile)?;

    if json_output {
        println!("{}", serde_json::to_string_pretty(&table.to_json()?)?);
        return Ok(());
    }
    if table.is_empty() {
        println!("No mappings in profile '{profile}'");
        return Ok(());
    }
    for entry in table.iter() {
        match &entry.notes {
            Some(notes) => println!("{} -> {}  # {notes}", entry.external_name, entry.internal_name),
            None => println!("{} -> {}", entry.external_name, entry.internal_name),
        }
    }
    Ok(())
}

/// The named profile, else the store's active profile.
fn profile_or_active(config_dir: &Path, profile: Option<String>) -> Result<String> {
    match profile {
        Some(profile) => Ok(profile),
        None => {
            let store = MappingStore::open(config_dir).context("Failed to open mapping store")?;
            Ok(store.active_profile()?)
        }
    }
}

fn cmd_mapping_profiles(config_dir: &Path) -> Result<()> {
    let store = MappingStore::open(config_dir).context("Failed to open mapping store")?;
    let active = store.active_profile()?;
    for name in store.list_profiles()? {
        let marker = if name == active { "*" } else { " " };
        match store.profile(&name)? {
            Some(profile) if !profile.description.is_empty() => {
                println!("{marker} {name}  # {}", profile.description)
            }
            _ => println!("{marker} {name}"),
        }
    }
    Ok(())
}

fn cmd_profile(config_dir: &Path, action: ProfileAction) -> Result<()> {
    let store = MappingStore::open(config_dir).context("Failed to open mapping store")?;
    match action {
        ProfileAction::Create { name, description } => {
            store.create_profile(&name, &description)?;
            println!("Created profile '{name}'");
        }
        ProfileAction::Update { name, description } => {
            store.update_profile(&name, &description)?;
            println!("Updated profile '{name}'");
        }
        ProfileAction::Delete { name } => {
            if !store.delete_profile(&name)? {
                bail!("Profile '{name}' not found");
            }
            println!("Deleted profile '{name}' (mappings backed up)");
        }
        ProfileAction::Use { name } => {
            store.set_active_profile(&name)?;
            println!("Active profile is now '{name}'");
        }
        ProfileAction::Export { name, output } => {
            let export = store.export_profile(&name)?;
            let text = serde_json::to_string_pretty(&export)?;
            match output {
                Some(path) => {
                    std::fs::write(&path, format!("{text}\n"))
                        .with_context(|| format!("Failed to write {}", path.display()))?;
                    info!(profile = %name, path = %path.display(), "profile exported");
                }
                None => println!("{text}"),
            }
        }
        ProfileAction::Import { file } => {
            let bytes = std::fs::read(&file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let export: ProfileExport =
                serde_json::from_slice(&bytes).context("Not a profile export")?;
            let profile = store.import_profile(export)?;
            println!("Imported profile '{}'", profile.name);
        }
    }
    Ok(())
}

fn cmd_mapping_validate(config_dir: &Path, profile: &str) -> Result<()> {
    let store = MappingStore::open(config_dir).context("Failed to open mapping store")?;
    let problems = store.validate(profile)?;
    if problems.is_empty() {
        println!("Profile '{profile}' is valid");
        return Ok(());
    }
    for problem in &problems {
        println!("  {problem}");
    }
    bail!("Profile '{profile}' has {} problem(s)", problems.len())
}

// ---------------------------------------------------------------------------
// history
// ---------------------------------------------------------------------------

async fn open_history(config_dir: &Path) -> Result<JsonHistoryLedger> {
    JsonHistoryLedger::open(config_dir.join(HISTORY_FILE))
        .await
        .context("Failed to open history")
}

fn history_line(entry: &HistoryEntry) -> String {
    format!(
        "{}  {}  {:<7}  {} -> {}  {}",
        entry.id,
        entry.timestamp.format("%Y-%m-%d %H:%M:%S"),
        entry.status.to_string(),
        entry.source_repo,
        entry.target_repo,
        entry.bundle_name
    )
}

async fn cmd_history_list(config_dir: &Path, limit: usize, json_output: bool) -> Result<()> {
    let ledger = open_history(config_dir).await?;
    let entries = ledger.query(limit).await?;

    if json_output {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }
    if entries.is_empty() {
        println!("No ingest history");
        return Ok(());
    }
    for entry in &entries {
        println!("{}", history_line(entry));
    }
    Ok(())
}

async fn cmd_history_show(config_dir: &Path, id: &str) -> Result<()> {
    let ledger = open_history(config_dir).await?;
    let Some(entry) = ledger.get(id).await? else {
        bail!("No history entry with id '{id}'");
    };
    println!("{}", serde_json::to_string_pretty(&entry)?);
    Ok(())
}

async fn cmd_history_clear(config_dir: &Path, yes: bool) -> Result<()> {
    if !yes {
        bail!("Refusing to clear history without --yes");
    }
    let ledger = open_history(config_dir).await?;
    ledger.clear().await?;
    info!(path = %ledger.path().display(), "history cleared");
    println!("History cleared");
    Ok(())
}
