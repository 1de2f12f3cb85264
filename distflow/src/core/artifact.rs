//! Built artifacts.

use super::RuntimeVersion;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// A built, versioned package file.
///
/// The content bytes stay in memory and are not serialized; reports carry the
/// digest and size instead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    /// File name, without directories.
    pub file_name: String,

    /// File content.
    #[serde(skip)]
    pub bytes: Vec<u8>,

    /// Runtime version the artifact was built under.
    pub runtime_version: RuntimeVersion,

    /// Hex encoded SHA-256 of the content.
    pub sha256: String,

    /// Content length in bytes.
    pub size: u64,
}

impl Artifact {
    /// Creates an artifact, computing its digest.
    #[must_use]
    pub fn new(
        file_name: impl Into<String>,
        bytes: Vec<u8>,
        runtime_version: RuntimeVersion,
    ) -> Self {
        let sha256 = hex::encode(Sha256::digest(&bytes));
        Self {
            file_name: file_name.into(),
            size: bytes.len() as u64,
            bytes,
            runtime_version,
            sha256,
        }
    }
}

/// The artifact set produced by one successful build stage.
///
/// Only the build stage can construct a set, and the set remembers the run
/// that produced it, so the publisher can only ever receive artifacts built
/// earlier in the same run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuiltArtifacts {
    run_id: Uuid,
    runtime_version: RuntimeVersion,
    artifacts: Vec<Artifact>,
}

impl BuiltArtifacts {
    pub(crate) fn new(
        run_id: Uuid,
        runtime_version: RuntimeVersion,
        mut artifacts: Vec<Artifact>,
    ) -> Self {
        artifacts.sort_by(|a, b| a.file_name.cmp(&b.file_name));
        Self {
            run_id,
            runtime_version,
            artifacts,
        }
    }

    /// The run that produced the set.
    #[must_use]
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Runtime version the set was built under.
    #[must_use]
    pub fn runtime_version(&self) -> &RuntimeVersion {
        &self.runtime_version
    }

    /// The artifacts, sorted by file name.
    #[must_use]
    pub fn artifacts(&self) -> &[Artifact] {
        &self.artifacts
    }

    /// Number of artifacts.
    #[must_use]
    pub fn len(&self) -> usize {
        self.artifacts.len()
    }

    /// Returns true if the build produced nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.artifacts.is_empty()
    }

    /// File names in order.
    #[must_use]
    pub fn file_names(&self) -> Vec<String> {
        self.artifacts.iter().map(|a| a.file_name.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runtime() -> RuntimeVersion {
        RuntimeVersion::parse("3.11").unwrap()
    }

    #[test]
    fn test_artifact_digest() {
        let artifact = Artifact::new("pkg-0.1.0.tar.gz", b"hello".to_vec(), runtime());

        assert_eq!(artifact.size, 5);
        assert_eq!(
            artifact.sha256,
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn test_set_is_sorted() {
        let set = BuiltArtifacts::new(
            Uuid::new_v4(),
            runtime(),
            vec![
                Artifact::new("b.whl", vec![1], runtime()),
                Artifact::new("a.tar.gz", vec![2], runtime()),
            ],
        );

        assert_eq!(set.file_names(), vec!["a.tar.gz", "b.whl"]);
        assert_eq!(set.len(), 2);
        assert!(!set.is_empty());
    }

    #[test]
    fn test_serialization_omits_bytes() {
        let artifact = Artifact::new("pkg.whl", vec![0; 16], runtime());
        let json = serde_json::to_value(&artifact).unwrap();

        assert!(json.get("bytes").is_none());
        assert_eq!(json["runtime_version"], "3.11");
        assert_eq!(json["size"], 16);
    }
}
