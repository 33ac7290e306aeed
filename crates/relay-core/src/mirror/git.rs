//! `git`-process mirror transport.
//!
//! Every invocation runs under `tokio::process` with a timeout, with
//! terminal prompts disabled. Credentials are only ever placed in the URL
//! handed to git for the duration of one call; everything that reaches an
//! error message or a log line goes through [`redact_url`].

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::{
    is_mirrored_ref, parse_gitmodules, ForcePolicy, GitCredentials, GitModule, MirrorBlob,
    MirrorTransport, PushResult, PushTarget, RefUpdate,
};
use crate::error::{Result, TransferError};
use crate::naming::{redact_url, with_credentials};

/// Default bound on a single git invocation.
pub const DEFAULT_GIT_TIMEOUT: Duration = Duration::from_secs(30 * 60);

struct GitOutput {
    success: bool,
    code: Option<i32>,
    stdout: String,
    stderr: String,
}

/// Mirror transport backed by the `git` binary.
#[derive(Debug, Clone)]
pub struct GitProcessTransport {
    git: PathBuf,
    timeout: Duration,
    verify_tls: bool,
}

impl Default for GitProcessTransport {
    fn default() -> Self {
        Self {
            git: PathBuf::from("git"),
            timeout: DEFAULT_GIT_TIMEOUT,
            verify_tls: true,
        }
    }
}

impl GitProcessTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Disable TLS certificate verification for remote operations.
    pub fn with_verify_tls(mut self, verify: bool) -> Self {
        self.verify_tls = verify;
        self
    }

    fn command(&self, git_dir: Option<&Path>) -> Command {
        let mut cmd = Command::new(&self.git);
        cmd.env("GIT_TERMINAL_PROMPT", "0")
            .env("GIT_ASKPASS", "")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if !self.verify_tls {
            cmd.args(["-c", "http.sslVerify=false"]);
        }
        if let Some(dir) = git_dir {
            cmd.arg("--git-dir").arg(dir);
        }
        cmd
    }

    /// Spawn `cmd`, feed it `stdin`, and collect its output.
    ///
    /// Input is written from its own task while stdout and stderr are
    /// drained, and the whole exchange runs under the timeout, so a child
    /// that fills its output pipe before reading all input cannot stall us.
    async fn run(&self, mut cmd: Command, op: &str, stdin: Option<String>) -> Result<GitOutput> {
        if stdin.is_some() {
            cmd.stdin(Stdio::piped());
        }
        let mut child = cmd
            .spawn()
            .map_err(|e| TransferError::Git(format!("failed to run git: {e}")))?;
        let feeder = match (stdin, child.stdin.take()) {
            (Some(input), Some(mut pipe)) => Some(tokio::spawn(async move {
                pipe.write_all(input.as_bytes()).await?;
                pipe.shutdown().await
            })),
            _ => None,
        };

        let exchange = async {
            let output = child.wait_with_output().await?;
            if let Some(feeder) = feeder {
                if let Err(e) = feeder.await? {
                    // A child that exits early closes its end; its status says why.
                    if output.status.success() {
                        return Err(TransferError::Io(e));
                    }
                }
            }
            Ok::<_, TransferError>(output)
        };
        let output = tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| TransferError::Timeout {
                operation: format!("git {op}"),
                secs: self.timeout.as_secs(),
            })??;

        Ok(GitOutput {
            success: output.status.success(),
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: redact_url(String::from_utf8_lossy(&output.stderr).trim()),
        })
    }

    /// Run and require success, classifying failures.
    async fn run_ok(&self, cmd: Command, op: &str, remote: &str) -> Result<GitOutput> {
        self.run_ok_with_input(cmd, op, remote, None).await
    }

    async fn run_ok_with_input(
        &self,
        cmd: Command,
        op: &str,
        remote: &str,
        stdin: Option<String>,
    ) -> Result<GitOutput> {
        let out = self.run(cmd, op, stdin).await?;
        if out.success {
            Ok(out)
        } else {
            Err(classify_failure(op, remote, &out.stderr))
        }
    }

    async fn local_refs(&self, blob: &MirrorBlob) -> Result<BTreeMap<String, String>> {
        let mut cmd = self.command(Some(&blob.path));
        cmd.args([
            "for-each-ref",
            "--format=%(objectname) %(refname)",
            "refs/heads",
            "refs/tags",
        ]);
        let out = self.run_ok(cmd, "for-each-ref", "").await?;
        Ok(parse_ref_lines(&out.stdout))
    }

    async fn remote_refs(&self, blob: &MirrorBlob, url: &str) -> Result<BTreeMap<String, String>> {
        let mut cmd = self.command(Some(&blob.path));
        cmd.args(["ls-remote", "--refs", url]);
        let out = self.run_ok(cmd, "ls-remote", url).await?;
        Ok(parse_ref_lines(&out.stdout)
            .into_iter()
            .filter(|(name, _)| is_mirrored_ref(name))
            .collect())
    }

    /// Which of `oids` exist as objects in the mirror.
    async fn present_objects(
        &self,
        blob: &MirrorBlob,
        oids: &BTreeSet<&String>,
    ) -> Result<HashSet<String>> {
        if oids.is_empty() {
            return Ok(HashSet::new());
        }
        let mut cmd = self.command(Some(&blob.path));
        cmd.args(["cat-file", "--batch-check"]);
        let input: String = oids.iter().map(|o| format!("{o}\n")).collect();
        let out = self.run(cmd, "cat-file", Some(input)).await?;
        Ok(out
            .stdout
            .lines()
            .filter(|l| !l.ends_with(" missing"))
            .filter_map(|l| l.split_whitespace().next().map(str::to_string))
            .collect())
    }

    async fn is_ancestor(&self, blob: &MirrorBlob, ancestor: &str, tip: &str) -> Result<bool> {
        let mut cmd = self.command(Some(&blob.path));
        cmd.args(["merge-base", "--is-ancestor", ancestor, tip]);
        let out = self.run(cmd, "merge-base", None).await?;
        Ok(out.success && out.code == Some(0))
    }

    async fn classify_refs(
        &self,
        blob: &MirrorBlob,
        local: &BTreeMap<String, String>,
        remote: &BTreeMap<String, String>,
        present: &HashSet<String>,
    ) -> Result<Vec<(String, RefUpdate)>> {
        let mut updates = Vec::with_capacity(local.len());
        for (name, oid) in local {
            let update = match remote.get(name) {
                None => RefUpdate::Create,
                Some(theirs) if theirs == oid => RefUpdate::UpToDate,
                Some(theirs) => {
                    if name.starts_with("refs/heads/")
                        && present.contains(theirs)
                        && self.is_ancestor(blob, theirs, oid).await?
                    {
                        RefUpdate::FastForward
                    } else {
                        RefUpdate::Diverged
                    }
                }
            };
            updates.push((name.clone(), update));
        }
        Ok(updates)
    }

    /// Commits reachable from `tips` but from none of `exclude`.
    ///
    /// Revisions go over stdin; a destination with thousands of refs would
    /// not fit on a command line.
    async fn count_new_commits(
        &self,
        blob: &MirrorBlob,
        tips: &[&String],
        exclude: &HashSet<String>,
    ) -> Result<u64> {
        if tips.is_empty() {
            return Ok(0);
        }
        let mut cmd = self.command(Some(&blob.path));
        cmd.args(["rev-list", "--count", "--stdin"]);
        let mut input = String::new();
        for tip in tips {
            input.push_str(tip);
            input.push('\n');
        }
        for oid in exclude {
            input.push('^');
            input.push_str(oid);
            input.push('\n');
        }
        let out = self
            .run_ok_with_input(cmd, "rev-list", "", Some(input))
            .await?;
        Ok(out.stdout.trim().parse().unwrap_or(0))
    }
}

fn parse_ref_lines(text: &str) -> BTreeMap<String, String> {
    text.lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let oid = parts.next()?;
            let name = parts.next()?;
            Some((name.to_string(), oid.to_string()))
        })
        .collect()
}

/// Map git's stderr onto the engine's error taxonomy.
fn classify_failure(op: &str, remote: &str, stderr: &str) -> TransferError {
    let lower = stderr.to_ascii_lowercase();
    let remote = redact_url(remote);
    let detail = format!("git {op} {remote}: {stderr}");

    const AUTH: &[&str] = &[
        "authentication failed",
        "could not read username",
        "could not read password",
        "http basic: access denied",
        "invalid username or password",
        "the requested url returned error: 401",
        "the requested url returned error: 403",
        "permission denied (publickey)",
    ];
    const UNREACHABLE: &[&str] = &[
        "could not resolve host",
        "connection refused",
        "connection timed out",
        "operation timed out",
        "failed to connect",
        "network is unreachable",
        "the remote end hung up unexpectedly",
        "early eof",
        "the requested url returned error: 502",
        "the requested url returned error: 503",
    ];
    const REJECTED: &[&str] = &[
        "protected branch",
        "pre-receive hook declined",
        "[remote rejected]",
    ];
    const CORRUPT: &[&str] = &[
        "bad object",
        "did not send all necessary objects",
        "index-pack failed",
        "fsck error",
        "object file",
        "is corrupt",
    ];

    let has = |needles: &[&str]| needles.iter().any(|n| lower.contains(n));
    if has(AUTH) {
        TransferError::AuthenticationFailed(detail)
    } else if has(UNREACHABLE) {
        TransferError::SourceUnreachable(detail)
    } else if has(REJECTED) {
        let hint = if lower.contains("protected branch") {
            ". Allow force-push on the protected branch (or unprotect it) and retry"
        } else {
            ""
        };
        TransferError::PushRejected {
            target: remote,
            detail: format!("{stderr}{hint}"),
        }
    } else if has(CORRUPT) {
        TransferError::CorruptSource(detail)
    } else {
        TransferError::Git(detail)
    }
}

fn authed_url(url: &str, credentials: Option<&GitCredentials>) -> String {
    match credentials {
        Some(c) => with_credentials(url, &c.username, &c.secret),
        None => url.to_string(),
    }
}

#[async_trait]
impl MirrorTransport for GitProcessTransport {
    async fn create_mirror(
        &self,
        source_url: &str,
        credentials: Option<&GitCredentials>,
        dest: &Path,
    ) -> Result<MirrorBlob> {
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let url = authed_url(source_url, credentials);
        info!(source = %redact_url(source_url), dest = %dest.display(), "cloning mirror");

        let mut cmd = self.command(None);
        cmd.args(["clone", "--mirror", "--quiet"]).arg(&url).arg(dest);
        self.run_ok(cmd, "clone --mirror", source_url).await?;

        // The mirror travels in the bundle; do not carry credentials along.
        if credentials.is_some() {
            let mut cmd = self.command(Some(dest));
            let clean = redact_url(source_url);
            cmd.args(["remote", "set-url", "origin", clean.as_str()]);
            self.run_ok(cmd, "remote set-url", "").await?;
        }
        Ok(MirrorBlob::new(dest))
    }

    async fn apply_mirror(
        &self,
        blob: &MirrorBlob,
        target: &PushTarget,
        policy: ForcePolicy,
    ) -> Result<PushResult> {
        let url = authed_url(&target.url, target.credentials.as_ref());
        let clean = redact_url(&target.url);

        let local = self.local_refs(blob).await?;
        let remote = self.remote_refs(blob, &url).await?;
        // Tags often share a commit; ask about each object once.
        let remote_oids: BTreeSet<&String> = remote.values().collect();
        let present = self.present_objects(blob, &remote_oids).await?;
        let updates = self.classify_refs(blob, &local, &remote, &present).await?;

        let diverged: Vec<&String> = updates
            .iter()
            .filter(|(_, u)| *u == RefUpdate::Diverged)
            .map(|(n, _)| n)
            .collect();
        if policy == ForcePolicy::FailOnDiverge {
            if let Some(first) = diverged.first() {
                warn!(target = %clean, refs = diverged.len(), "destination has diverged refs");
                return Err(TransferError::DivergedRef {
                    refname: (*first).clone(),
                });
            }
        }

        let to_push: Vec<&String> = updates
            .iter()
            .filter(|(_, u)| u.needs_push())
            .map(|(n, _)| n)
            .collect();
        if to_push.is_empty() {
            debug!(target = %clean, "destination already up to date");
            return Ok(PushResult::default());
        }

        let tips: Vec<&String> = to_push.iter().filter_map(|n| local.get(*n)).collect();
        let commits_pushed = self.count_new_commits(blob, &tips, &present).await?;

        let force = if policy == ForcePolicy::AllowForce { "+" } else { "" };
        let mut cmd = self.command(Some(&blob.path));
        cmd.args(["push", "--porcelain", url.as_str()])
            .arg(format!("{force}refs/heads/*:refs/heads/*"))
            .arg(format!("{force}refs/tags/*:refs/tags/*"));
        self.run_ok(cmd, "push", &target.url).await?;

        info!(
            target = %clean,
            refs_pushed = to_push.len(),
            forced = diverged.len(),
            commits_pushed,
            "mirror applied"
        );
        Ok(PushResult {
            refs_pushed: to_push.len(),
            commits_pushed,
        })
    }

    async fn read_gitmodules(&self, blob: &MirrorBlob) -> Result<Vec<GitModule>> {
        let mut cmd = self.command(Some(&blob.path));
        cmd.args(["show", "HEAD:.gitmodules"]);
        let out = self.run(cmd, "show", None).await?;
        if !out.success {
            debug!(mirror = %blob.path.display(), "no .gitmodules at HEAD");
            return Ok(Vec::new());
        }
        Ok(parse_gitmodules(&out.stdout))
    }

    async fn list_refs(&self, blob: &MirrorBlob) -> Result<Vec<(String, String)>> {
        Ok(self.local_refs(blob).await?.into_iter().collect())
    }

    async fn version(&self) -> Result<String> {
        let mut cmd = self.command(None);
        cmd.arg("--version");
        let out = self.run_ok(cmd, "--version", "").await?;
        Ok(out.stdout.trim().to_string())
    }
}

/// Group refs by update kind, for logging and dry-run plans.
pub fn summarize_updates(updates: &[(String, RefUpdate)]) -> HashMap<&'static str, usize> {
    let mut summary = HashMap::new();
    for (_, u) in updates {
        let key = match u {
            RefUpdate::Create => "create",
            RefUpdate::UpToDate => "up_to_date",
            RefUpdate::FastForward => "fast_forward",
            RefUpdate::Diverged => "diverged",
        };
        *summary.entry(key).or_insert(0) += 1;
    }
    summary
}
