// src/remote/client.rs

//! HTTP transport for the remote build service
//!
//! Endpoints, relative to the configured base URL:
//!
//! | Operation     | Request                          |
//! |---------------|----------------------------------|
//! | upload bundle | `POST bundles` (gzip body)       |
//! | build         | `POST builds`                    |
//! | status        | `GET builds/<job>/status`        |
//! | artifact      | `GET builds/<job>/artifact`      |
//! | list agents   | `GET agents`                     |
//! | agent info    | `GET agents/<name>`              |

use super::RemoteTransport;
use super::protocol::{
    AgentInfo, ArtifactResponse, BuildRequest, BuildResponse, StatusResponse, UploadResponse,
};
use crate::error::{Error, Result};
use reqwest::blocking::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use std::fs::File;
use std::io;
use std::path::Path;
use std::time::Duration;
use tracing::debug;
use url::Url;

/// Timeout for control requests (30 seconds)
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout for bundle uploads and artifact downloads (5 minutes)
pub const UPLOAD_TIMEOUT: Duration = Duration::from_secs(300);

pub struct HttpTransport {
    client: Client,
    base: Url,
}

impl HttpTransport {
    pub fn new(base: &str) -> Result<Self> {
        let mut base = Url::parse(base)
            .map_err(|e| Error::Usage(format!("invalid remote URL '{}': {}", base, e)))?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::RemoteError(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self { client, base })
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    fn url(&self, path: &str) -> Result<Url> {
        self.base
            .join(path)
            .map_err(|e| Error::RemoteError(format!("invalid endpoint {}: {}", path, e)))
    }

    fn send(&self, request: RequestBuilder, what: &str) -> Result<Response> {
        let response = request
            .send()
            .map_err(|e| Error::RemoteError(format!("{}: {}", what, e)))?;
        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(Error::NotFound(what.to_string()));
        }
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(Error::RemoteError(format!(
                "{}: HTTP {} {}",
                what,
                status,
                body.trim()
            )));
        }
        Ok(response)
    }

    fn json<T: DeserializeOwned>(&self, request: RequestBuilder, what: &str) -> Result<T> {
        self.send(request, what)?
            .json()
            .map_err(|e| Error::RemoteError(format!("{}: malformed reply: {}", what, e)))
    }
}

impl RemoteTransport for HttpTransport {
    fn upload_bundle(&self, bundle: &Path) -> Result<UploadResponse> {
        let file = File::open(bundle)?;
        debug!("Uploading {}", bundle.display());
        let request = self
            .client
            .post(self.url("bundles")?)
            .header(reqwest::header::CONTENT_TYPE, "application/gzip")
            .timeout(UPLOAD_TIMEOUT)
            .body(file);
        self.json(request, "upload bundle")
    }

    fn build(&self, request: &BuildRequest) -> Result<BuildResponse> {
        let what = format!("build for {}", request.arch);
        self.json(self.client.post(self.url("builds")?).json(request), &what)
    }

    fn status(&self, job_id: &str) -> Result<StatusResponse> {
        let url = self.url(&format!("builds/{}/status", job_id))?;
        self.json(self.client.get(url), &format!("job {}", job_id))
    }

    fn artifact(&self, job_id: &str) -> Result<ArtifactResponse> {
        let url = self.url(&format!("builds/{}/artifact", job_id))?;
        self.json(self.client.get(url), &format!("artifacts of job {}", job_id))
    }

    fn list_agents(&self) -> Result<Vec<AgentInfo>> {
        self.json(self.client.get(self.url("agents")?), "agents")
    }

    fn agent_info(&self, name: &str) -> Result<AgentInfo> {
        let url = self.url(&format!("agents/{}", name))?;
        self.json(self.client.get(url), &format!("agent {}", name))
    }

    fn download(&self, url: &str, dest: &Path) -> Result<u64> {
        let request = self.client.get(url).timeout(UPLOAD_TIMEOUT);
        let mut response = self.send(request, url)?;
        let mut tmp = tempfile::NamedTempFile::new_in(
            dest.parent().unwrap_or_else(|| Path::new(".")),
        )?;
        let written = io::copy(&mut response, &mut tmp)
            .map_err(|e| Error::RemoteError(format!("download {}: {}", url, e)))?;
        tmp.persist(dest).map_err(|e| e.error)?;
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoints_are_relative_to_base() {
        let transport = HttpTransport::new("https://builds.example.org/api").unwrap();
        assert_eq!(transport.base().as_str(), "https://builds.example.org/api/");
        assert_eq!(
            transport.url("builds/42/status").unwrap().as_str(),
            "https://builds.example.org/api/builds/42/status"
        );
    }

    #[test]
    fn test_invalid_url_is_usage_error() {
        assert!(matches!(HttpTransport::new("not a url"), Err(Error::Usage(_))));
    }
}
