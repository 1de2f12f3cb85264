//! Durable artifact storage.
//!
//! The publisher uploads a [`BuiltArtifacts`] set under a label through an
//! [`ArtifactStore`]. Labels are immutable: once a label holds artifacts, a
//! second upload under it is refused.

use crate::core::{Artifact, BuiltArtifacts};
use crate::errors::PipelineError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use uuid::Uuid;

static LABEL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]*$").expect("label regex is valid"));

/// Name of the manifest written next to uploaded files.
pub const MANIFEST_NAME: &str = "manifest.json";

/// A file stored under a label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredFile {
    /// File name.
    pub name: String,
    /// Hex encoded SHA-256.
    pub sha256: String,
    /// Size in bytes.
    pub size: u64,
}

impl From<&Artifact> for StoredFile {
    fn from(artifact: &Artifact) -> Self {
        Self {
            name: artifact.file_name.clone(),
            sha256: artifact.sha256.clone(),
            size: artifact.size,
        }
    }
}

/// Confirmation of a completed upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadReceipt {
    /// The label the artifacts were stored under.
    pub label: String,
    /// Where the store put them.
    pub location: String,
    /// Runtime version the artifacts were built under.
    pub runtime_version: String,
    /// The uploaded files.
    pub files: Vec<StoredFile>,
    /// Upload completion time.
    pub uploaded_at: DateTime<Utc>,
}

impl UploadReceipt {
    fn new(label: &str, location: String, artifacts: &BuiltArtifacts) -> Self {
        Self {
            label: label.to_string(),
            location,
            runtime_version: artifacts.runtime_version().to_string(),
            files: artifacts.artifacts().iter().map(StoredFile::from).collect(),
            uploaded_at: Utc::now(),
        }
    }
}

/// A durable destination for built artifacts.
#[async_trait]
pub trait ArtifactStore: Send + Sync + fmt::Debug {
    /// Uploads every artifact under `label`, all or nothing.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::PublishFailure`] if the label is invalid or
    /// taken, or if the store cannot be written.
    async fn upload(
        &self,
        label: &str,
        artifacts: &BuiltArtifacts,
    ) -> Result<UploadReceipt, PipelineError>;

    /// Short description for logs.
    fn describe(&self) -> String;
}

fn check_label(label: &str) -> Result<(), PipelineError> {
    if LABEL_RE.is_match(label) {
        Ok(())
    } else {
        Err(PipelineError::publish(label, "label contains unsupported characters"))
    }
}

/// Stores artifacts in `<root>/<label>/`.
///
/// Files are written into a hidden staging directory that is renamed into
/// place once complete, so a label directory is either whole or absent.
#[derive(Debug, Clone)]
pub struct FilesystemArtifactStore {
    root: PathBuf,
}

impl FilesystemArtifactStore {
    /// Creates a store rooted at `root`. The directory is created on first upload.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The store root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding a label's files.
    #[must_use]
    pub fn label_dir(&self, label: &str) -> PathBuf {
        self.root.join(label)
    }

    /// Reads the receipt of a published label, if any.
    pub async fn receipt(&self, label: &str) -> Result<Option<UploadReceipt>, PipelineError> {
        check_label(label)?;
        let path = self.label_dir(label).join(MANIFEST_NAME);
        match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| PipelineError::Internal(format!("corrupt manifest for '{label}': {e}"))),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn write_staged(
        staging: &Path,
        receipt: &UploadReceipt,
        artifacts: &BuiltArtifacts,
    ) -> std::io::Result<()> {
        tokio::fs::create_dir_all(staging).await?;
        for artifact in artifacts.artifacts() {
            tokio::fs::write(staging.join(&artifact.file_name), &artifact.bytes).await?;
        }
        let manifest = serde_json::to_vec_pretty(receipt)?;
        tokio::fs::write(staging.join(MANIFEST_NAME), manifest).await
    }
}

#[async_trait]
impl ArtifactStore for FilesystemArtifactStore {
    async fn upload(
        &self,
        label: &str,
        artifacts: &BuiltArtifacts,
    ) -> Result<UploadReceipt, PipelineError> {
        check_label(label)?;
        let target = self.label_dir(label);
        let fail = |message: String| PipelineError::publish(label, message);

        if tokio::fs::try_exists(&target)
            .await
            .map_err(|e| fail(format!("cannot inspect {}: {e}", target.display())))?
        {
            return Err(fail(format!("label already exists at {}", target.display())));
        }

        let receipt = UploadReceipt::new(label, target.display().to_string(), artifacts);
        let staging = self.root.join(format!(".staging-{}", Uuid::new_v4()));

        if let Err(err) = Self::write_staged(&staging, &receipt, artifacts).await {
            let _ = tokio::fs::remove_dir_all(&staging).await;
            return Err(fail(format!("writing {}: {err}", staging.display())));
        }
        if let Err(err) = tokio::fs::rename(&staging, &target).await {
            let _ = tokio::fs::remove_dir_all(&staging).await;
            return Err(fail(format!("moving into {}: {err}", target.display())));
        }

        tracing::info!(label, location = %target.display(), files = receipt.files.len(), "Artifacts stored");
        Ok(receipt)
    }

    fn describe(&self) -> String {
        format!("filesystem:{}", self.root.display())
    }
}

/// Keeps uploads in memory. Useful for tests and embedding.
#[derive(Debug, Default)]
pub struct InMemoryArtifactStore {
    uploads: RwLock<BTreeMap<String, (UploadReceipt, Vec<Artifact>)>>,
    order: RwLock<Vec<String>>,
    failure: Option<String>,
}

impl InMemoryArtifactStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A store whose uploads always fail with `message`.
    #[must_use]
    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            failure: Some(message.into()),
            ..Self::default()
        }
    }

    /// Receipts in upload order.
    #[must_use]
    pub fn uploads(&self) -> Vec<UploadReceipt> {
        let uploads = self.uploads.read();
        self.order
            .read()
            .iter()
            .filter_map(|label| uploads.get(label).map(|(receipt, _)| receipt.clone()))
            .collect()
    }

    /// Number of completed uploads.
    #[must_use]
    pub fn upload_count(&self) -> usize {
        self.order.read().len()
    }

    /// Artifacts stored under a label.
    #[must_use]
    pub fn artifacts(&self, label: &str) -> Option<Vec<Artifact>> {
        self.uploads.read().get(label).map(|(_, a)| a.clone())
    }
}

#[async_trait]
impl ArtifactStore for InMemoryArtifactStore {
    async fn upload(
        &self,
        label: &str,
        artifacts: &BuiltArtifacts,
    ) -> Result<UploadReceipt, PipelineError> {
        check_label(label)?;
        if let Some(message) = &self.failure {
            return Err(PipelineError::publish(label, message.clone()));
        }

        let mut uploads = self.uploads.write();
        if uploads.contains_key(label) {
            return Err(PipelineError::publish(label, "label already exists"));
        }
        let receipt = UploadReceipt::new(label, format!("memory:{label}"), artifacts);
        uploads.insert(
            label.to_string(),
            (receipt.clone(), artifacts.artifacts().to_vec()),
        );
        self.order.write().push(label.to_string());
        Ok(receipt)
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::RuntimeVersion;
    use crate::errors::ErrorKind;
    use pretty_assertions::assert_eq;

    fn built(names: &[&str]) -> BuiltArtifacts {
        let rv = RuntimeVersion::parse("3.11").unwrap();
        let artifacts = names
            .iter()
            .map(|n| Artifact::new(*n, n.as_bytes().to_vec(), rv.clone()))
            .collect();
        BuiltArtifacts::new(Uuid::new_v4(), rv, artifacts)
    }

    #[tokio::test]
    async fn test_filesystem_upload() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemArtifactStore::new(dir.path().join("store"));
        let set = built(&["pkg-0.1.0.tar.gz", "pkg-0.1.0-py3-none-any.whl"]);

        let receipt = store.upload("wheel_3.11", &set).await.unwrap();

        assert_eq!(receipt.label, "wheel_3.11");
        assert_eq!(receipt.runtime_version, "3.11");
        assert_eq!(receipt.files.len(), 2);
        let label_dir = store.label_dir("wheel_3.11");
        assert_eq!(
            std::fs::read(label_dir.join("pkg-0.1.0.tar.gz")).unwrap(),
            b"pkg-0.1.0.tar.gz"
        );
        assert_eq!(store.receipt("wheel_3.11").await.unwrap(), Some(receipt));

        let leftovers: Vec<_> = std::fs::read_dir(store.root())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().starts_with(".staging"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_filesystem_refuses_existing_label() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemArtifactStore::new(dir.path());
        store.upload("wheel_3.11", &built(&["a.whl"])).await.unwrap();

        let err = store.upload("wheel_3.11", &built(&["b.whl"])).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::PublishFailure);
        assert!(!store.label_dir("wheel_3.11").join("b.whl").exists());
    }

    #[tokio::test]
    async fn test_invalid_label() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemArtifactStore::new(dir.path());
        let err = store.upload("../escape", &built(&["a.whl"])).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PublishFailure);
        assert_eq!(store.receipt("missing").await.unwrap(), None);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unwritable_root_is_publish_failure() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, "not a directory").unwrap();
        let store = FilesystemArtifactStore::new(blocker.join("store"));

        let err = store.upload("wheel_3.11", &built(&["a.whl"])).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PublishFailure);
    }

    #[tokio::test]
    async fn test_in_memory_store() {
        let store = InMemoryArtifactStore::new();
        store.upload("wheel_3.10", &built(&["a.whl"])).await.unwrap();
        store.upload("wheel_3.11", &built(&["b.whl"])).await.unwrap();

        assert_eq!(store.upload_count(), 2);
        let labels: Vec<_> = store.uploads().into_iter().map(|r| r.label).collect();
        assert_eq!(labels, vec!["wheel_3.10", "wheel_3.11"]);
        assert_eq!(store.artifacts("wheel_3.11").unwrap()[0].file_name, "b.whl");
        assert!(store.upload("wheel_3.11", &built(&["c.whl"])).await.is_err());
    }

    #[tokio::test]
    async fn test_failing_store() {
        let store = InMemoryArtifactStore::failing("bucket offline");
        let err = store.upload("wheel_3.11", &built(&["a.whl"])).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::PublishFailure);
        assert!(err.to_string().contains("bucket offline"));
        assert_eq!(store.upload_count(), 0);
    }
}
