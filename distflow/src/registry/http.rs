//! PyPI-compatible JSON index client.

use super::PackageIndex;
use crate::core::Version;
use crate::errors::PipelineError;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;

/// Reads versions from a PyPI-style JSON API (`{base}/{name}/json`).
#[derive(Debug, Clone)]
pub struct HttpPackageIndex {
    base_url: String,
    client: Client,
}

#[derive(Debug, Deserialize)]
struct ProjectDocument {
    #[serde(default)]
    releases: BTreeMap<String, Vec<ReleaseFile>>,
}

#[derive(Debug, Deserialize)]
struct ReleaseFile {
    #[serde(default)]
    yanked: bool,
}

impl HttpPackageIndex {
    /// Creates a client for the index at `base_url`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, PipelineError> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("distflow/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| PipelineError::Internal(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }

    /// The URL queried for a package.
    #[must_use]
    pub fn project_url(&self, name: &str) -> String {
        format!("{}/{}/json", self.base_url, name)
    }
}

fn transport_error(url: &str, err: &reqwest::Error) -> PipelineError {
    if err.is_connect() || err.is_timeout() || err.is_request() {
        PipelineError::network(format!("{url}: {err}"))
    } else {
        PipelineError::Internal(format!("{url}: {err}"))
    }
}

#[async_trait]
impl PackageIndex for HttpPackageIndex {
    async fn available_versions(&self, name: &str) -> Result<Vec<Version>, PipelineError> {
        let url = self.project_url(name);
        tracing::debug!(url = %url, "Querying package index");

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| transport_error(&url, &e))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            return Err(PipelineError::network(format!("{url}: HTTP {status}")));
        }
        if !status.is_success() {
            return Err(PipelineError::Internal(format!("{url}: HTTP {status}")));
        }

        let document: ProjectDocument = response
            .json()
            .await
            .map_err(|e| transport_error(&url, &e))?;

        let versions = document
            .releases
            .into_iter()
            .filter(|(_, files)| files.is_empty() || files.iter().any(|f| !f.yanked))
            .filter_map(|(raw, _)| match Version::parse(&raw) {
                Ok(version) => Some(version),
                Err(err) => {
                    tracing::trace!(package = name, version = %raw, error = %err, "Skipping unparseable version");
                    None
                }
            })
            .collect();
        Ok(versions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;

    #[test]
    fn test_project_url() {
        let index = HttpPackageIndex::new("https://pypi.org/pypi/", Duration::from_secs(5)).unwrap();
        assert_eq!(index.project_url("openai"), "https://pypi.org/pypi/openai/json");
    }

    #[test]
    fn test_document_parsing_skips_fully_yanked() {
        let doc: ProjectDocument = serde_json::from_str(
            r#"{"releases": {"1.0": [{"yanked": true}], "1.1": [{"yanked": false}], "2.0": []}}"#,
        )
        .unwrap();
        let kept: Vec<_> = doc
            .releases
            .into_iter()
            .filter(|(_, files)| files.is_empty() || files.iter().any(|f| !f.yanked))
            .map(|(v, _)| v)
            .collect();
        assert_eq!(kept, vec!["1.1", "2.0"]);
    }

    #[tokio::test]
    async fn test_unreachable_index_is_network_error() {
        let index = HttpPackageIndex::new("http://127.0.0.1:9", Duration::from_secs(2)).unwrap();
        let err = index.available_versions("openai").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NetworkUnavailable);
    }
}
