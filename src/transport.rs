//! Byte-oriented artifact storage used to carry history between CI runs.
//!
//! Transports move opaque bytes and never retry; callers decide what a
//! failure means. [`DirectoryTransport`] targets a directory the CI platform
//! restores and uploads (cache or artifact step); [`HttpTransport`] talks to
//! a plain GET/PUT object endpoint.

use std::fs;
use std::io::{ErrorKind, Read, Write};
use std::path::PathBuf;

use tempfile::NamedTempFile;

use crate::error::{CovtrendError, Result};
use crate::store::namespace_name;

/// Name of the artifact holding a branch's merged history.
pub const HISTORY_ARTIFACT: &str = "coverage-history.json";

/// Upper bound on artifact bodies read over HTTP.
const MAX_ARTIFACT_BYTES: u64 = 64 * 1024 * 1024;

/// Location of an artifact: a branch plus a name within it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactKey {
    pub branch: String,
    pub name: String,
}

impl ArtifactKey {
    pub fn history(branch: impl Into<String>) -> Self {
        Self {
            branch: branch.into(),
            name: HISTORY_ARTIFACT.to_string(),
        }
    }

    /// Relative object path; the branch is namespaced the same way as in
    /// the local store.
    #[must_use]
    pub fn object_path(&self) -> String {
        format!("{}/{}", namespace_name(&self.branch), self.name)
    }
}

/// Get/put access to externally held artifacts.
pub trait ArtifactTransport {
    /// Fetch an artifact. `Ok(None)` means it does not exist.
    fn get(&self, key: &ArtifactKey) -> Result<Option<Vec<u8>>>;

    /// Store an artifact, replacing any previous version.
    fn put(&self, key: &ArtifactKey, bytes: &[u8]) -> Result<()>;
}

/// Artifacts as files under a local directory.
#[derive(Debug, Clone)]
pub struct DirectoryTransport {
    root: PathBuf,
}

impl DirectoryTransport {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, key: &ArtifactKey) -> PathBuf {
        self.root.join(key.object_path())
    }
}

impl ArtifactTransport for DirectoryTransport {
    fn get(&self, key: &ArtifactKey) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(key);
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(CovtrendError::storage(path, e)),
        }
    }

    fn put(&self, key: &ArtifactKey, bytes: &[u8]) -> Result<()> {
        let path = self.path_for(key);
        let dir = path
            .parent()
            .map_or_else(|| self.root.clone(), std::path::Path::to_path_buf);
        fs::create_dir_all(&dir).map_err(|e| CovtrendError::storage(&dir, e))?;

        let mut tmp = NamedTempFile::new_in(&dir).map_err(|e| CovtrendError::storage(&dir, e))?;
        tmp.write_all(bytes)
            .map_err(|e| CovtrendError::storage(tmp.path(), e))?;
        tmp.persist(&path)
            .map_err(|e| CovtrendError::storage(&path, e.error))?;
        Ok(())
    }
}

/// Artifacts as objects behind `<base_url>/<object_path>`.
pub struct HttpTransport {
    base_url: String,
    token: Option<String>,
}

impl std::fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTransport")
            .field("base_url", &self.base_url)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl HttpTransport {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
        }
    }

    /// Build from `COVTREND_ARTIFACT_URL` and the optional
    /// `COVTREND_ARTIFACT_TOKEN`.
    pub fn from_env() -> Result<Self> {
        let base_url = std::env::var("COVTREND_ARTIFACT_URL").map_err(|_| {
            CovtrendError::Config("COVTREND_ARTIFACT_URL environment variable is required".into())
        })?;
        let token = std::env::var("COVTREND_ARTIFACT_TOKEN").ok();
        Ok(Self::new(base_url, token))
    }

    fn url_for(&self, key: &ArtifactKey) -> String {
        format!("{}/{}", self.base_url, key.object_path())
    }

    fn request(&self, method: &str, url: &str) -> ureq::Request {
        let req = ureq::request(method, url).set("User-Agent", "covtrend");
        match self.token {
            Some(ref token) => req.set("Authorization", &format!("Bearer {token}")),
            None => req,
        }
    }
}

impl ArtifactTransport for HttpTransport {
    fn get(&self, key: &ArtifactKey) -> Result<Option<Vec<u8>>> {
        let url = self.url_for(key);
        match self.request("GET", &url).call() {
            Ok(resp) => {
                let mut bytes = Vec::new();
                resp.into_reader()
                    .take(MAX_ARTIFACT_BYTES)
                    .read_to_end(&mut bytes)
                    .map_err(|e| {
                        CovtrendError::Transport(format!("failed to read {url}: {e}"))
                    })?;
                Ok(Some(bytes))
            }
            Err(ureq::Error::Status(404, _)) => Ok(None),
            Err(ureq::Error::Status(code, resp)) => {
                let body = resp.into_string().unwrap_or_default();
                Err(CovtrendError::Transport(format!(
                    "GET {url} failed (HTTP {code}): {body}"
                )))
            }
            Err(e) => Err(CovtrendError::Transport(format!("GET {url} failed: {e}"))),
        }
    }

    fn put(&self, key: &ArtifactKey, bytes: &[u8]) -> Result<()> {
        let url = self.url_for(key);
        let resp = self
            .request("PUT", &url)
            .set("Content-Type", "application/json")
            .send_bytes(bytes);
        match resp {
            Ok(_) => Ok(()),
            Err(ureq::Error::Status(code, resp)) => {
                let body = resp.into_string().unwrap_or_default();
                Err(CovtrendError::Transport(format!(
                    "PUT {url} failed (HTTP {code}): {body}"
                )))
            }
            Err(e) => Err(CovtrendError::Transport(format!("PUT {url} failed: {e}"))),
        }
    }
}
