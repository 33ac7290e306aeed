//! Forge connection settings.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default per-request timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

/// How to authenticate against a forge.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum ForgeAuth {
    Anonymous,
    /// Personal/project access token sent as `Authorization: Bearer`
    Token { token: String },
    /// HTTP basic auth
    Basic { username: String, password: String },
}

impl std::fmt::Debug for ForgeAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ForgeAuth::Anonymous => f.write_str("Anonymous"),
            ForgeAuth::Token { .. } => f.write_str("Token(***)"),
            ForgeAuth::Basic { username, .. } => write!(f, "Basic({username}, ***)"),
        }
    }
}

/// Connection settings for one forge instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForgeConfig {
    /// Base URL, e.g. `https://gitlab.internal.example`
    pub base_url: String,
    pub auth: ForgeAuth,
    /// Verify TLS certificates
    pub verify_tls: bool,
    /// Per-request timeout
    pub timeout: Duration,
}

impl ForgeConfig {
    /// Create config for a specific server with no credentials.
    pub fn new(base_url: &str) -> Self {
        ForgeConfig {
            base_url: base_url.trim_end_matches('/').to_string(),
            auth: ForgeAuth::Anonymous,
            verify_tls: true,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Set an access token.
    pub fn with_token(mut self, token: &str) -> Self {
        self.auth = ForgeAuth::Token {
            token: token.to_string(),
        };
        self
    }

    /// Set basic-auth credentials.
    pub fn with_basic_auth(mut self, username: &str, password: &str) -> Self {
        self.auth = ForgeAuth::Basic {
            username: username.to_string(),
            password: password.to_string(),
        };
        self
    }

    pub fn with_verify_tls(mut self, verify: bool) -> Self {
        self.verify_tls = verify;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// HTTPS clone URL for `repo_path`, without credentials.
    pub fn clone_url(&self, repo_path: &str) -> String {
        format!("{}/{}.git", self.base_url, repo_path.trim_matches('/'))
    }

    /// `(username, secret)` pair git should use over HTTPS, if any.
    pub fn git_credentials(&self) -> Option<(String, String)> {
        match &self.auth {
            ForgeAuth::Anonymous => None,
            ForgeAuth::Token { token } => Some(("oauth2".to_string(), token.clone())),
            ForgeAuth::Basic { username, password } => {
                Some((username.clone(), password.clone()))
            }
        }
    }
}
