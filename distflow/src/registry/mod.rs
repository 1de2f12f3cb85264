//! Package index access and dependency pre-resolution.
//!
//! Before the install command runs, the installer can check every declared
//! requirement against a [`PackageIndex`]. This turns unsatisfiable
//! constraints into a [`PipelineError::ResolutionConflict`] with per-package
//! detail, and an unreachable index into [`PipelineError::NetworkUnavailable`].

#[cfg(feature = "registry")]
mod http;

#[cfg(feature = "registry")]
pub use http::HttpPackageIndex;

use crate::core::{Constraint, Version};
use crate::errors::{ConflictDetail, PipelineError};
use crate::project::{normalize_name, DependencySpec};
use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A source of published package versions.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PackageIndex: Send + Sync + fmt::Debug {
    /// Every published version of a package. An unknown package yields an
    /// empty list.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::NetworkUnavailable`] if the index cannot be reached.
    async fn available_versions(&self, name: &str) -> Result<Vec<Version>, PipelineError>;
}

/// An index with a fixed package list.
#[derive(Debug, Clone, Default)]
pub struct StaticPackageIndex {
    packages: BTreeMap<String, Vec<Version>>,
    offline: bool,
}

impl StaticPackageIndex {
    /// Creates an empty index.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a package with the given versions.
    ///
    /// # Errors
    ///
    /// Returns an error if a version does not parse.
    pub fn with_package(mut self, name: &str, versions: &[&str]) -> Result<Self, PipelineError> {
        let parsed = versions
            .iter()
            .map(|v| Version::parse(v))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| PipelineError::Internal(e.to_string()))?;
        self.packages.insert(normalize_name(name), parsed);
        Ok(self)
    }

    /// An index that is always unreachable.
    #[must_use]
    pub fn offline() -> Self {
        Self {
            offline: true,
            ..Self::default()
        }
    }
}

#[async_trait]
impl PackageIndex for StaticPackageIndex {
    async fn available_versions(&self, name: &str) -> Result<Vec<Version>, PipelineError> {
        if self.offline {
            return Err(PipelineError::network("package index is offline"));
        }
        Ok(self
            .packages
            .get(&normalize_name(name))
            .cloned()
            .unwrap_or_default())
    }
}

/// A package pinned by pre-resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedPackage {
    /// Normalized package name.
    pub name: String,
    /// Selected version.
    pub version: Version,
}

/// Picks the best version satisfying every constraint.
///
/// The highest stable version wins; pre-releases are chosen only when no
/// stable version matches.
#[must_use]
pub fn select_version(available: &[Version], constraints: &[Constraint]) -> Option<Version> {
    let matching: Vec<&Version> = available
        .iter()
        .filter(|v| constraints.iter().all(|c| c.matches(v)))
        .collect();
    matching
        .iter()
        .filter(|v| !v.is_prerelease())
        .max()
        .or_else(|| matching.iter().max())
        .map(|v| (*v).clone())
}

/// Resolves every declared requirement against the index.
///
/// Constraints declared for the same package in both sets are combined.
/// All packages are checked before failing, so the conflict lists every
/// unsatisfiable package.
///
/// # Errors
///
/// Returns [`PipelineError::NetworkUnavailable`] if any lookup cannot reach
/// the index, or [`PipelineError::ResolutionConflict`] if any package has no
/// acceptable version.
pub async fn resolve(
    spec: &DependencySpec,
    index: &dyn PackageIndex,
) -> Result<Vec<ResolvedPackage>, PipelineError> {
    let mut wanted: BTreeMap<&str, Vec<Constraint>> = BTreeMap::new();
    for requirement in spec.all() {
        wanted
            .entry(requirement.name.as_str())
            .or_default()
            .push(requirement.constraint.clone());
    }

    let lookups = join_all(wanted.keys().map(|name| index.available_versions(name))).await;

    let mut resolved = Vec::with_capacity(wanted.len());
    let mut conflicts = Vec::new();
    for ((name, constraints), available) in wanted.into_iter().zip(lookups) {
        let available = available?;
        let described: Vec<String> = constraints.iter().map(ToString::to_string).collect();
        if available.is_empty() {
            conflicts.push(ConflictDetail::new(name, described, "package not found on the index"));
            continue;
        }
        match select_version(&available, &constraints) {
            Some(version) => {
                tracing::debug!(package = name, version = %version, "Resolved");
                resolved.push(ResolvedPackage {
                    name: name.to_string(),
                    version,
                });
            }
            None => {
                let newest = available.iter().max().map(ToString::to_string).unwrap_or_default();
                conflicts.push(ConflictDetail::new(
                    name,
                    described,
                    format!("no published version satisfies all constraints (newest is {newest})"),
                ));
            }
        }
    }

    if conflicts.is_empty() {
        Ok(resolved)
    } else {
        Err(PipelineError::ResolutionConflict { conflicts })
    }
}
