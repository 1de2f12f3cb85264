//! The Python project being built.
//!
//! A [`Project`] is read from `pyproject.toml`. The Poetry layout
//! (`[tool.poetry]`) is preferred; the standard `[project]` table is used
//! when no Poetry section exists.

use crate::core::{Constraint, RuntimeVersion};
use crate::errors::ManifestError;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

/// Manifest file name.
pub const MANIFEST_FILE_NAME: &str = "pyproject.toml";

static PEP508_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<name>[A-Za-z0-9][A-Za-z0-9._-]*)\s*(?:\[[^\]]*\])?\s*\(?(?P<spec>[^;()]*)\)?\s*(?:;.*)?$")
        .expect("requirement regex is valid")
});

static NORMALIZE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[-_.]+").expect("normalize regex is valid"));

/// Normalizes a package name (lowercase, runs of `-_.` become `-`).
#[must_use]
pub fn normalize_name(name: &str) -> String {
    NORMALIZE_RE.replace_all(&name.to_lowercase(), "-").into_owned()
}

/// A declared dependency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requirement {
    /// Normalized package name.
    pub name: String,
    /// Accepted versions.
    pub constraint: Constraint,
}

impl Requirement {
    /// Creates a requirement, normalizing the name.
    #[must_use]
    pub fn new(name: &str, constraint: Constraint) -> Self {
        Self {
            name: normalize_name(name),
            constraint,
        }
    }

    /// Parses a PEP 508 requirement string such as `requests[socks]>=2.31; python_version>"3.8"`.
    ///
    /// Environment markers are accepted and ignored.
    pub fn parse_pep508(input: &str) -> Result<Self, ManifestError> {
        let invalid = |reason: &str| ManifestError::InvalidRequirement {
            requirement: input.to_string(),
            reason: reason.to_string(),
        };
        let caps = PEP508_RE
            .captures(input.trim())
            .ok_or_else(|| invalid("not a PEP 508 requirement"))?;
        let constraint =
            Constraint::parse(&caps["spec"]).map_err(|e| invalid(&e.to_string()))?;
        Ok(Self::new(&caps["name"], constraint))
    }
}

/// The project's declared dependencies.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencySpec {
    /// Accepted interpreter versions, if declared.
    pub python: Option<Constraint>,
    /// Runtime dependencies.
    pub runtime: Vec<Requirement>,
    /// Development dependencies (tests, linters, type checker).
    pub dev: Vec<Requirement>,
}

impl DependencySpec {
    /// Every requirement, runtime first.
    pub fn all(&self) -> impl Iterator<Item = &Requirement> {
        self.runtime.iter().chain(self.dev.iter())
    }

    /// Returns true if the declared python constraint accepts the runtime.
    #[must_use]
    pub fn accepts_runtime(&self, runtime: &RuntimeVersion) -> bool {
        self.python
            .as_ref()
            .map_or(true, |constraint| constraint.matches(&runtime.to_version()))
    }

    /// Number of declared requirements.
    #[must_use]
    pub fn len(&self) -> usize {
        self.runtime.len() + self.dev.len()
    }

    /// Returns true if nothing is declared.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.runtime.is_empty() && self.dev.is_empty()
    }
}

/// A Python project rooted at a directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    /// Distribution name as declared.
    pub name: String,
    /// Version string as declared; validated by the build stage.
    pub version: String,
    /// Project root directory.
    pub root: PathBuf,
    /// Declared dependencies.
    pub dependencies: DependencySpec,
}

impl Project {
    /// Loads `pyproject.toml` from a project directory.
    pub fn load(root: &Path) -> Result<Self, ManifestError> {
        let path = root.join(MANIFEST_FILE_NAME);
        let text = std::fs::read_to_string(&path).map_err(|source| ManifestError::Read {
            path: path.clone(),
            source,
        })?;
        Self::from_manifest_str(root, &text).map_err(|err| match err {
            ParseFailure::Toml(source) => ManifestError::Parse { path, source },
            ParseFailure::Manifest(err) => err,
        })
    }

    /// Parses manifest text for a project rooted at `root`.
    pub fn parse(root: &Path, text: &str) -> Result<Self, ManifestError> {
        Self::from_manifest_str(root, text).map_err(|err| match err {
            ParseFailure::Toml(source) => ManifestError::Parse {
                path: root.join(MANIFEST_FILE_NAME),
                source,
            },
            ParseFailure::Manifest(err) => err,
        })
    }

    fn from_manifest_str(root: &Path, text: &str) -> Result<Self, ParseFailure> {
        let manifest: Manifest = toml::from_str(text).map_err(ParseFailure::Toml)?;
        let project = match (manifest.tool.and_then(|t| t.poetry), manifest.project) {
            (Some(poetry), _) => from_poetry(root, poetry)?,
            (None, Some(table)) => from_pep621(root, table)?,
            (None, None) => {
                return Err(ManifestError::Missing("[tool.poetry] or [project]".into()).into())
            }
        };
        Ok(project)
    }

    /// The distribution name with separators folded to `_`, as used in
    /// archive file names.
    #[must_use]
    pub fn distribution_name(&self) -> String {
        normalize_name(&self.name).replace('-', "_")
    }
}

enum ParseFailure {
    Toml(toml::de::Error),
    Manifest(ManifestError),
}

impl From<ManifestError> for ParseFailure {
    fn from(err: ManifestError) -> Self {
        Self::Manifest(err)
    }
}

#[derive(Debug, Deserialize)]
struct Manifest {
    tool: Option<ToolTable>,
    project: Option<Pep621Table>,
}

#[derive(Debug, Deserialize)]
struct ToolTable {
    poetry: Option<PoetryTable>,
}

#[derive(Debug, Deserialize)]
struct PoetryTable {
    name: Option<String>,
    version: Option<String>,
    #[serde(default)]
    dependencies: toml::Table,
    #[serde(default, rename = "dev-dependencies")]
    dev_dependencies: toml::Table,
    #[serde(default)]
    group: toml::Table,
}

#[derive(Debug, Deserialize)]
struct Pep621Table {
    name: Option<String>,
    version: Option<String>,
    #[serde(default)]
    dependencies: Vec<String>,
    #[serde(default, rename = "requires-python")]
    requires_python: Option<String>,
    #[serde(default, rename = "optional-dependencies")]
    optional_dependencies: toml::Table,
}

fn from_poetry(root: &Path, poetry: PoetryTable) -> Result<Project, ManifestError> {
    let name = poetry
        .name
        .ok_or_else(|| ManifestError::Missing("tool.poetry.name".into()))?;
    let version = poetry
        .version
        .ok_or_else(|| ManifestError::Missing("tool.poetry.version".into()))?;

    let mut python = None;
    let mut runtime = Vec::new();
    for (package, value) in &poetry.dependencies {
        let constraint = poetry_constraint(package, value)?;
        if package.eq_ignore_ascii_case("python") {
            python = Some(constraint);
        } else {
            runtime.push(Requirement::new(package, constraint));
        }
    }

    let mut dev = Vec::new();
    for (package, value) in &poetry.dev_dependencies {
        dev.push(Requirement::new(package, poetry_constraint(package, value)?));
    }
    for (group_name, group) in &poetry.group {
        let Some(deps) = group.get("dependencies").and_then(toml::Value::as_table) else {
            tracing::debug!(group = %group_name, "Dependency group has no dependencies table");
            continue;
        };
        for (package, value) in deps {
            dev.push(Requirement::new(package, poetry_constraint(package, value)?));
        }
    }

    Ok(Project {
        name,
        version,
        root: root.to_path_buf(),
        dependencies: DependencySpec { python, runtime, dev },
    })
}

fn poetry_constraint(package: &str, value: &toml::Value) -> Result<Constraint, ManifestError> {
    let invalid = |reason: String| ManifestError::InvalidRequirement {
        requirement: format!("{package} = {value}"),
        reason,
    };
    match value {
        toml::Value::String(spec) => Constraint::parse(spec).map_err(|e| invalid(e.to_string())),
        toml::Value::Table(table) => match table.get("version") {
            Some(toml::Value::String(spec)) => {
                Constraint::parse(spec).map_err(|e| invalid(e.to_string()))
            }
            Some(_) => Err(invalid("version must be a string".into())),
            // path, git and url dependencies carry no version bound
            None => Ok(Constraint::any()),
        },
        _ => Err(invalid("expected a version string or table".into())),
    }
}

fn from_pep621(root: &Path, table: Pep621Table) -> Result<Project, ManifestError> {
    let name = table
        .name
        .ok_or_else(|| ManifestError::Missing("project.name".into()))?;
    let version = table
        .version
        .ok_or_else(|| ManifestError::Missing("project.version".into()))?;

    let python = table
        .requires_python
        .as_deref()
        .map(|spec| {
            Constraint::parse(spec).map_err(|e| ManifestError::InvalidRequirement {
                requirement: format!("requires-python = {spec}"),
                reason: e.to_string(),
            })
        })
        .transpose()?;

    let runtime = table
        .dependencies
        .iter()
        .map(|r| Requirement::parse_pep508(r))
        .collect::<Result<Vec<_>, _>>()?;

    let mut dev = Vec::new();
    for (extra, entries) in &table.optional_dependencies {
        let entries = entries.as_array().ok_or_else(|| ManifestError::InvalidRequirement {
            requirement: format!("optional-dependencies.{extra}"),
            reason: "expected an array of requirements".into(),
        })?;
        for entry in entries {
            let text = entry.as_str().ok_or_else(|| ManifestError::InvalidRequirement {
                requirement: entry.to_string(),
                reason: "expected a string".into(),
            })?;
            dev.push(Requirement::parse_pep508(text)?);
        }
    }

    Ok(Project {
        name,
        version,
        root: root.to_path_buf(),
        dependencies: DependencySpec { python, runtime, dev },
    })
}
