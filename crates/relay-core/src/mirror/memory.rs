//! In-memory mirror transport for tests.
//!
//! Repositories are commit graphs keyed by URL. A "mirror" is a directory
//! holding the source graph as `graph.json`, so it survives a round trip
//! through a real bundle tarball.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::{
    is_mirrored_ref, parse_gitmodules, ForcePolicy, GitCredentials, GitModule, MirrorBlob,
    MirrorTransport, PushResult, PushTarget, RefUpdate,
};
use crate::error::{Result, TransferError};

const GRAPH_FILE: &str = "graph.json";

/// A repository as a commit DAG plus refs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoGraph {
    /// commit id -> parent ids
    pub commits: BTreeMap<String, Vec<String>>,
    /// refname -> commit id
    pub refs: BTreeMap<String, String>,
    /// `.gitmodules` contents at HEAD
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gitmodules: Option<String>,
}

impl RepoGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a commit on top of `branch` (creating the branch) and return its id.
    pub fn commit(&mut self, branch: &str, label: &str) -> String {
        let refname = format!("refs/heads/{branch}");
        let parents: Vec<String> = self.refs.get(&refname).cloned().into_iter().collect();
        let id = commit_id(label, &parents);
        self.commits.insert(id.clone(), parents);
        self.refs.insert(refname, id.clone());
        id
    }

    /// Point `branch` at a fresh commit whose parent is `base`, discarding
    /// whatever the branch pointed at before.
    pub fn rewrite(&mut self, branch: &str, base: Option<&str>, label: &str) -> String {
        let parents: Vec<String> = base.map(str::to_string).into_iter().collect();
        let id = commit_id(label, &parents);
        self.commits.insert(id.clone(), parents);
        self.refs.insert(format!("refs/heads/{branch}"), id.clone());
        id
    }

    pub fn tag(&mut self, name: &str, commit: &str) {
        self.refs.insert(format!("refs/tags/{name}"), commit.to_string());
    }

    pub fn with_gitmodules(mut self, text: &str) -> Self {
        self.gitmodules = Some(text.to_string());
        self
    }

    pub fn branch(&self, name: &str) -> Option<&String> {
        self.refs.get(&format!("refs/heads/{name}"))
    }

    /// Commits reachable from `tips`.
    pub fn reachable<'a>(&'a self, tips: impl IntoIterator<Item = &'a String>) -> HashSet<&'a str> {
        let mut seen = HashSet::new();
        let mut stack: Vec<&str> = tips.into_iter().map(String::as_str).collect();
        while let Some(id) = stack.pop() {
            if !seen.insert(id) {
                continue;
            }
            if let Some(parents) = self.commits.get(id) {
                stack.extend(parents.iter().map(String::as_str));
            }
        }
        seen
    }

    fn is_ancestor(&self, ancestor: &str, tip: &String) -> bool {
        self.reachable([tip]).contains(ancestor)
    }
}

fn commit_id(label: &str, parents: &[String]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(label.as_bytes());
    for p in parents {
        hasher.update(b"\0");
        hasher.update(p.as_bytes());
    }
    let mut id = hex::encode(hasher.finalize());
    id.truncate(40);
    id
}

#[derive(Default)]
struct Inner {
    repos: Mutex<HashMap<String, RepoGraph>>,
    rejects: Mutex<HashMap<String, String>>,
    apply_delay: Mutex<Option<Duration>>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    applies: AtomicUsize,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

struct InFlight<'a>(&'a Inner);

impl<'a> InFlight<'a> {
    fn enter(inner: &'a Inner) -> Self {
        let now = inner.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        inner.peak.fetch_max(now, Ordering::SeqCst);
        Self(inner)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Mirror transport over in-memory commit graphs.
#[derive(Clone, Default)]
pub struct MemoryMirrorTransport {
    inner: Arc<Inner>,
}

impl MemoryMirrorTransport {
    pub fn new() -> Self {
        Self::default()
    }

    // ------------------------------------------------------------------
    // Seeding and inspection
    // ------------------------------------------------------------------

    /// Register (or replace) the repository served at `url`.
    pub fn seed(&self, url: &str, graph: RepoGraph) {
        lock(&self.inner.repos).insert(url.to_string(), graph);
    }

    /// Current state of the repository at `url`.
    pub fn repo(&self, url: &str) -> Option<RepoGraph> {
        lock(&self.inner.repos).get(url).cloned()
    }

    /// Make every push to `url` fail as a rejected push.
    pub fn reject_pushes_to(&self, url: &str, message: &str) {
        lock(&self.inner.rejects).insert(url.to_string(), message.to_string());
    }

    /// Hold each `apply_mirror` call for `delay` before it takes effect.
    pub fn set_apply_delay(&self, delay: Duration) {
        *lock(&self.inner.apply_delay) = Some(delay);
    }

    /// Highest number of `apply_mirror` calls observed running at once.
    pub fn peak_in_flight(&self) -> usize {
        self.inner.peak.load(Ordering::SeqCst)
    }

    /// Number of `apply_mirror` calls that reached the destination.
    pub fn apply_count(&self) -> usize {
        self.inner.applies.load(Ordering::SeqCst)
    }

    async fn read_graph(&self, blob: &MirrorBlob) -> Result<RepoGraph> {
        let path = blob.path.join(GRAPH_FILE);
        let bytes = tokio::fs::read(&path).await.map_err(|e| {
            TransferError::CorruptSource(format!("{} is not a mirror: {e}", blob.path.display()))
        })?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

#[async_trait]
impl MirrorTransport for MemoryMirrorTransport {
    async fn create_mirror(
        &self,
        source_url: &str,
        _credentials: Option<&GitCredentials>,
        dest: &Path,
    ) -> Result<MirrorBlob> {
        let graph = self.repo(source_url).ok_or_else(|| {
            TransferError::SourceUnreachable(format!("no repository at {source_url}"))
        })?;
        tokio::fs::create_dir_all(dest).await?;
        tokio::fs::write(dest.join(GRAPH_FILE), serde_json::to_vec_pretty(&graph)?).await?;
        Ok(MirrorBlob::new(dest))
    }

    async fn apply_mirror(
        &self,
        blob: &MirrorBlob,
        target: &PushTarget,
        policy: ForcePolicy,
    ) -> Result<PushResult> {
        let source = self.read_graph(blob).await?;

        let _guard = InFlight::enter(&self.inner);
        let delay = *lock(&self.inner.apply_delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if let Some(message) = lock(&self.inner.rejects).get(&target.url).cloned() {
            return Err(TransferError::PushRejected {
                target: target.url.clone(),
                detail: message,
            });
        }

        let mut repos = lock(&self.inner.repos);
        let dest = repos.entry(target.url.clone()).or_default();

        let mut updates = Vec::new();
        for (name, id) in source.refs.iter().filter(|(n, _)| is_mirrored_ref(n)) {
            let update = match dest.refs.get(name) {
                None => RefUpdate::Create,
                Some(theirs) if theirs == id => RefUpdate::UpToDate,
                Some(theirs) if name.starts_with("refs/heads/") && source.is_ancestor(theirs, id) => {
                    RefUpdate::FastForward
                }
                Some(_) => RefUpdate::Diverged,
            };
            updates.push((name, id, update));
        }

        if policy == ForcePolicy::FailOnDiverge {
            if let Some((name, _, _)) = updates.iter().find(|(_, _, u)| *u == RefUpdate::Diverged) {
                return Err(TransferError::DivergedRef {
                    refname: (*name).clone(),
                });
            }
        }

        let pushed: Vec<(&String, &String)> = updates
            .iter()
            .filter(|(_, _, u)| u.needs_push())
            .map(|(n, id, _)| (*n, *id))
            .collect();

        let existing: BTreeSet<String> = dest.commits.keys().cloned().collect();
        let new_commits: Vec<&str> = source
            .reachable(pushed.iter().map(|(_, id)| *id))
            .into_iter()
            .filter(|c| !existing.contains(*c))
            .collect();

        for id in &new_commits {
            if let Some(parents) = source.commits.get(*id) {
                dest.commits.insert((*id).to_string(), parents.clone());
            }
        }
        for (name, id) in &pushed {
            dest.refs.insert((*name).clone(), (*id).clone());
        }
        if dest.gitmodules.is_none() {
            dest.gitmodules = source.gitmodules.clone();
        }
        self.inner.applies.fetch_add(1, Ordering::SeqCst);

        Ok(PushResult {
            refs_pushed: pushed.len(),
            commits_pushed: new_commits.len() as u64,
        })
    }

    async fn read_gitmodules(&self, blob: &MirrorBlob) -> Result<Vec<GitModule>> {
        let graph = self.read_graph(blob).await?;
        Ok(graph.gitmodules.as_deref().map(parse_gitmodules).unwrap_or_default())
    }

    async fn list_refs(&self, blob: &MirrorBlob) -> Result<Vec<(String, String)>> {
        let graph = self.read_graph(blob).await?;
        Ok(graph
            .refs
            .into_iter()
            .filter(|(n, _)| is_mirrored_ref(n))
            .collect())
    }

    async fn version(&self) -> Result<String> {
        Ok("memory-transport 1".to_string())
    }
}
