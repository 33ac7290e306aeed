//! GitLab v4 REST client
//!
//! Implements both [`DestinationApi`] and [`SourceApi`] over `reqwest`.
//! Responses are decoded into private wire structs and translated into the
//! crate's typed records before being returned.

use std::path::Path;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Client, RequestBuilder, Response, StatusCode, Url};
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tracing::{debug, info};

use crate::api::{DestinationApi, SourceApi};
use crate::config::{ForgeAuth, ForgeConfig};
use crate::error::ForgeError;
use crate::types::{CreateProject, Job, NamespaceInfo, PackageInfo, Pipeline, ProjectInfo};
use crate::ForgeResult;

const USER_AGENT: &str = concat!("airgap-relay/", env!("CARGO_PKG_VERSION"));

#[derive(Deserialize)]
struct WireProject {
    id: u64,
    path_with_namespace: String,
    #[serde(default)]
    http_url_to_repo: String,
    #[serde(default)]
    web_url: String,
}

impl From<WireProject> for ProjectInfo {
    fn from(p: WireProject) -> Self {
        ProjectInfo {
            id: p.id,
            path_with_namespace: p.path_with_namespace,
            clone_url: p.http_url_to_repo,
            web_url: p.web_url,
        }
    }
}

#[derive(Deserialize)]
struct WireNamespace {
    id: u64,
    full_path: String,
}

#[derive(Deserialize)]
struct WireJobArtifact {
    #[serde(default)]
    size: Option<u64>,
}

#[derive(Deserialize)]
struct WireJob {
    id: u64,
    name: String,
    #[serde(default)]
    stage: String,
    #[serde(default)]
    artifacts: Vec<WireJobArtifact>,
}

/// GitLab API client.
pub struct GitLabClient {
    config: ForgeConfig,
    base: Url,
    http: Client,
}

impl GitLabClient {
    /// Create a new client.
    pub fn new(config: ForgeConfig) -> ForgeResult<Self> {
        let base = Url::parse(&config.base_url)
            .map_err(|e| ForgeError::InvalidUrl(format!("{}: {e}", config.base_url)))?;
        if base.cannot_be_a_base() {
            return Err(ForgeError::InvalidUrl(config.base_url.clone()));
        }
        let http = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(config.timeout)
            .danger_accept_invalid_certs(!config.verify_tls)
            .build()?;
        Ok(GitLabClient { config, base, http })
    }

    pub fn config(&self) -> &ForgeConfig {
        &self.config
    }

    /// Build `<base>/api/v4/<segments...>`; each segment is percent-encoded,
    /// so a full project path becomes a single `group%2Fproject` segment.
    fn endpoint<I>(&self, segments: I) -> ForgeResult<Url>
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        let mut url = self.base.clone();
        {
            let mut path = url
                .path_segments_mut()
                .map_err(|_| ForgeError::InvalidUrl(self.config.base_url.clone()))?;
            path.pop_if_empty().extend(["api", "v4"]).extend(segments);
        }
        Ok(url)
    }

    fn authed(&self, req: RequestBuilder) -> RequestBuilder {
        match &self.config.auth {
            ForgeAuth::Anonymous => req,
            ForgeAuth::Token { token } => req.bearer_auth(token),
            ForgeAuth::Basic { username, password } => req.basic_auth(username, Some(password)),
        }
    }

    async fn send(&self, req: RequestBuilder, capability: &str) -> ForgeResult<Response> {
        let resp = self.authed(req).send().await?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(ForgeError::from_status(status.as_u16(), capability, &body))
    }

    /// Like [`send`](Self::send) but maps 404 to `Ok(None)`.
    async fn send_optional(
        &self,
        req: RequestBuilder,
        capability: &str,
    ) -> ForgeResult<Option<Response>> {
        let resp = self.authed(req).send().await?;
        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if status.is_success() {
            return Ok(Some(resp));
        }
        let body = resp.text().await.unwrap_or_default();
        Err(ForgeError::from_status(status.as_u16(), capability, &body))
    }

    async fn fetch_project(&self, path: &str) -> ForgeResult<Option<ProjectInfo>> {
        let url = self.endpoint(["projects", path])?;
        debug!(%url, "GET project");
        match self.send_optional(self.http.get(url), "read namespace").await? {
            Some(resp) => {
                let wire: WireProject = resp.json().await?;
                Ok(Some(wire.into()))
            }
            None => Ok(None),
        }
    }
}

#[async_trait]
impl DestinationApi for GitLabClient {
    async fn find_project(&self, path: &str) -> ForgeResult<Option<ProjectInfo>> {
        self.fetch_project(path).await
    }

    async fn find_namespace(&self, path: &str) -> ForgeResult<Option<NamespaceInfo>> {
        let url = self.endpoint(["namespaces", path])?;
        debug!(%url, "GET namespace");
        match self.send_optional(self.http.get(url), "read namespace").await? {
            Some(resp) => {
                let wire: WireNamespace = resp.json().await?;
                Ok(Some(NamespaceInfo {
                    id: wire.id,
                    full_path: wire.full_path,
                }))
            }
            None => Ok(None),
        }
    }

    async fn create_project(&self, request: &CreateProject) -> ForgeResult<ProjectInfo> {
        let url = self.endpoint(["projects"])?;
        info!(path = %request.path, namespace_id = request.namespace_id, "creating project");
        let resp = self
            .send(self.http.post(url).json(request), "project create")
            .await?;
        let wire: WireProject = resp.json().await?;
        Ok(wire.into())
    }

    async fn upload_generic_package(
        &self,
        project_id: u64,
        package_name: &str,
        version: &str,
        file: &Path,
    ) -> ForgeResult<PackageInfo> {
        let file_name = file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| {
                ForgeError::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("not a file path: {}", file.display()),
                ))
            })?;
        let pid = project_id.to_string();
        let url = self.endpoint([
            "projects",
            pid.as_str(),
            "packages",
            "generic",
            package_name,
            version,
            file_name.as_str(),
        ])?;

        let handle = tokio::fs::File::open(file).await?;
        let size = handle.metadata().await?.len();
        let body = reqwest::Body::wrap_stream(ReaderStream::new(handle));

        debug!(%url, size, "PUT generic package");
        self.send(
            self.http
                .put(url)
                .header(reqwest::header::CONTENT_LENGTH, size)
                .body(body),
            "write namespace",
        )
        .await?;

        Ok(PackageInfo {
            project_id,
            package_name: package_name.to_string(),
            version: version.to_string(),
            file_name,
            size,
        })
    }
}

#[async_trait]
impl SourceApi for GitLabClient {
    async fn project_id(&self, path: &str) -> ForgeResult<u64> {
        self.fetch_project(path)
            .await?
            .map(|p| p.id)
            .ok_or_else(|| ForgeError::NotFound(format!("project '{path}'")))
    }

    async fn latest_successful_pipeline(
        &self,
        project_id: u64,
        git_ref: Option<&str>,
    ) -> ForgeResult<Option<Pipeline>> {
        let pid = project_id.to_string();
        let mut url = self.endpoint(["projects", pid.as_str(), "pipelines"])?;
        {
            let mut q = url.query_pairs_mut();
            q.append_pair("status", "success")
                .append_pair("per_page", "1")
                .append_pair("order_by", "id")
                .append_pair("sort", "desc");
            if let Some(r) = git_ref {
                q.append_pair("ref", r);
            }
        }
        let resp = self.send(self.http.get(url), "read pipelines").await?;
        let mut pipelines: Vec<Pipeline> = resp.json().await?;
        Ok(if pipelines.is_empty() {
            None
        } else {
            Some(pipelines.swap_remove(0))
        })
    }

    async fn pipeline_jobs_with_artifacts(
        &self,
        project_id: u64,
        pipeline_id: u64,
    ) -> ForgeResult<Vec<Job>> {
        let pid = project_id.to_string();
        let pipe = pipeline_id.to_string();
        let mut url = self.endpoint(["projects", pid.as_str(), "pipelines", pipe.as_str(), "jobs"])?;
        url.query_pairs_mut().append_pair("per_page", "100");

        let resp = self.send(self.http.get(url), "read jobs").await?;
        let jobs: Vec<WireJob> = resp.json().await?;
        Ok(jobs
            .into_iter()
            .filter(|j| !j.artifacts.is_empty())
            .map(|j| Job {
                artifacts_size: j.artifacts.iter().filter_map(|a| a.size).sum(),
                id: j.id,
                name: j.name,
                stage: j.stage,
            })
            .collect())
    }

    async fn download_job_artifacts(
        &self,
        project_id: u64,
        job_id: u64,
        dest: &Path,
    ) -> ForgeResult<u64> {
        let pid = project_id.to_string();
        let jid = job_id.to_string();
        let url = self.endpoint(["projects", pid.as_str(), "jobs", jid.as_str(), "artifacts"])?;
        let resp = self.send(self.http.get(url), "read artifacts").await?;

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut out = tokio::fs::File::create(dest).await?;
        let mut written = 0u64;
        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            out.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        out.flush().await?;
        debug!(job_id, bytes = written, dest = %dest.display(), "artifact archive downloaded");
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(base: &str) -> GitLabClient {
        GitLabClient::new(ForgeConfig::new(base)).unwrap()
    }

    #[test]
    fn test_project_path_is_one_encoded_segment() {
        let url = client("https://gitlab.example.com")
            .endpoint(["projects", "sec/team/alpha"])
            .unwrap();
        assert_eq!(
            url.as_str(),
            "https://gitlab.example.com/api/v4/projects/sec%2Fteam%2Falpha"
        );
    }

    #[test]
    fn test_endpoint_keeps_base_path_prefix() {
        let url = client("https://example.com/gitlab/")
            .endpoint(["namespaces", "sec"])
            .unwrap();
        assert_eq!(url.as_str(), "https://example.com/gitlab/api/v4/namespaces/sec");
    }

    #[test]
    fn test_invalid_base_url_rejected() {
        assert!(matches!(
            GitLabClient::new(ForgeConfig::new("not a url")),
            Err(ForgeError::InvalidUrl(_))
        ));
    }

    #[test]
    fn test_wire_project_translation() {
        let wire: WireProject = serde_json::from_str(
            r#"{"id": 7, "path_with_namespace": "sec/alpha",
                "http_url_to_repo": "https://g/sec/alpha.git",
                "web_url": "https://g/sec/alpha", "visibility": "private"}"#,
        )
        .unwrap();
        let info: ProjectInfo = wire.into();
        assert_eq!(info.id, 7);
        assert_eq!(info.clone_url, "https://g/sec/alpha.git");
    }

    #[tokio::test]
    async fn test_unreachable_forge_is_transient() {
        // Port 9 (discard) on localhost is not expected to accept HTTP.
        let c = GitLabClient::new(
            ForgeConfig::new("http://127.0.0.1:9")
                .with_timeout(std::time::Duration::from_secs(2)),
        )
        .unwrap();
        let err = c.find_project("a/b").await.unwrap_err();
        assert!(err.is_transient(), "{err:?}");
    }
}
