//! Pipeline configuration.
//!
//! Configuration is read from `distflow.toml` (or an explicit path), then
//! environment overrides are applied, then the result is validated. Every
//! field has a default, so an empty file is a valid configuration.

use crate::core::{RuntimeVersion, StageName};
use crate::errors::ConfigError;
use crate::pipeline::RetryConfig;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

/// Default configuration file name, looked up in the project directory.
pub const CONFIG_FILE_NAME: &str = "distflow.toml";

/// Overrides the work directory.
pub const ENV_WORK_DIR: &str = "DISTFLOW_WORK_DIR";
/// Overrides the artifact store directory.
pub const ENV_STORE_DIR: &str = "DISTFLOW_STORE_DIR";
/// Overrides the package index URL.
pub const ENV_REGISTRY_URL: &str = "DISTFLOW_REGISTRY_URL";

static LABEL_PREFIX_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9._-]+$").expect("valid regex"));

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| (*s).to_string()).collect()
}

/// The dependency manager installed into every environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolConfig {
    /// Tool name, as installed with pip.
    pub name: String,
    /// Pinned tool version.
    pub version: String,
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            name: "poetry".to_string(),
            version: "1.8.3".to_string(),
        }
    }
}

/// Commands that create the isolated environment.
///
/// Placeholders: `{runtime_version}`, `{env_dir}`, `{tool}`,
/// `{tool_version}`, `{project_dir}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisionConfig {
    /// Commands run in order; each is a program followed by its arguments.
    pub commands: Vec<Vec<String>>,
}

impl Default for ProvisionConfig {
    fn default() -> Self {
        Self {
            commands: vec![
                strings(&["python{runtime_version}", "-m", "venv", "{env_dir}"]),
                strings(&[
                    "{env_dir}/bin/python",
                    "-m",
                    "pip",
                    "install",
                    "{tool}=={tool_version}",
                ]),
            ],
        }
    }
}

/// Dependency installation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstallConfig {
    /// Install command.
    pub command: Vec<String>,
}

impl Default for InstallConfig {
    fn default() -> Self {
        Self {
            command: strings(&["poetry", "install", "--no-interaction", "--with", "dev"]),
        }
    }
}

/// One static check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckConfig {
    /// Check name used in violation reports.
    pub name: String,
    /// Check command.
    pub command: Vec<String>,
}

impl CheckConfig {
    /// Creates a check.
    #[must_use]
    pub fn new(name: impl Into<String>, command: &[&str]) -> Self {
        Self {
            name: name.into(),
            command: strings(command),
        }
    }
}

fn default_checks() -> Vec<CheckConfig> {
    vec![
        CheckConfig::new("typecheck", &["poetry", "run", "mypy", "."]),
        CheckConfig::new("lint", &["poetry", "run", "ruff", "check", "."]),
        CheckConfig::new("format-check", &["poetry", "run", "black", "--check", "."]),
    ]
}

/// Test suite invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TestConfig {
    /// Test command.
    pub command: Vec<String>,
}

impl Default for TestConfig {
    fn default() -> Self {
        Self {
            command: strings(&["poetry", "run", "pytest", "-rA"]),
        }
    }
}

/// How distributions are produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BuildBackend {
    /// Run the build command and collect files from the dist directory.
    #[default]
    Command,
    /// Write a reproducible source archive directly.
    SourceArchive,
}

/// Package building.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    /// Build backend.
    pub backend: BuildBackend,
    /// Build command for the `command` backend.
    pub command: Vec<String>,
    /// Output directory, relative to the project root.
    pub dist_dir: PathBuf,
    /// Regex selecting artifact file names in the dist directory.
    pub artifact_pattern: String,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            backend: BuildBackend::Command,
            command: strings(&["poetry", "build"]),
            dist_dir: PathBuf::from("dist"),
            artifact_pattern: r"\.(whl|tar\.gz)$".to_string(),
        }
    }
}

/// Artifact publishing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PublishConfig {
    /// Root of the filesystem artifact store.
    pub store_dir: PathBuf,
    /// Label prefix; the label is `<prefix>_<runtime_version>`.
    pub label_prefix: String,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            store_dir: PathBuf::from(".distflow/artifacts"),
            label_prefix: "wheel".to_string(),
        }
    }
}

/// Retry policies. Only installation retries.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Policy for registry outages during installation.
    pub install: RetryConfig,
}

/// Optional per-stage time limits in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Provisioning limit.
    pub provision: Option<u64>,
    /// Installation limit.
    pub install: Option<u64>,
    /// Static verification limit.
    pub verify: Option<u64>,
    /// Test suite limit.
    pub test: Option<u64>,
    /// Build limit.
    pub build: Option<u64>,
    /// Publish limit.
    pub publish: Option<u64>,
}

impl TimeoutConfig {
    /// The limit in seconds for a stage, if any.
    #[must_use]
    pub fn seconds_for(&self, stage: StageName) -> Option<u64> {
        match stage {
            StageName::Provision => self.provision,
            StageName::Install => self.install,
            StageName::Verify => self.verify,
            StageName::Test => self.test,
            StageName::Build => self.build,
            StageName::Publish => self.publish,
        }
    }

    /// The limit for a stage, if any.
    #[must_use]
    pub fn for_stage(&self, stage: StageName) -> Option<Duration> {
        self.seconds_for(stage).map(Duration::from_secs)
    }
}

/// Package index used for dependency pre-resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Index base URL (e.g. `https://pypi.org/pypi`). Unset disables
    /// pre-resolution.
    pub url: Option<String>,
    /// Request timeout in seconds.
    pub timeout_seconds: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            url: None,
            timeout_seconds: 30,
        }
    }
}

/// Full pipeline configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Runtime versions the provisioner accepts.
    pub supported_versions: Vec<String>,
    /// Where per-run environments are created, relative to the project root.
    pub work_dir: PathBuf,
    /// Keep environments after the run instead of removing them.
    pub keep_environments: bool,
    /// Bytes of command output kept per stage (the tail is kept).
    pub max_captured_output: usize,
    /// Pinned dependency manager.
    pub tool: ToolConfig,
    /// Environment provisioning.
    pub provision: ProvisionConfig,
    /// Dependency installation.
    pub install: InstallConfig,
    /// Static checks, all of which run.
    pub checks: Vec<CheckConfig>,
    /// Test suite.
    pub test: TestConfig,
    /// Package building.
    pub build: BuildConfig,
    /// Artifact publishing.
    pub publish: PublishConfig,
    /// Retry policies.
    pub retry: RetrySettings,
    /// Per-stage time limits.
    pub timeouts: TimeoutConfig,
    /// Package index.
    pub registry: RegistryConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            supported_versions: strings(&["3.9", "3.10", "3.11", "3.12"]),
            work_dir: PathBuf::from(".distflow/work"),
            keep_environments: false,
            max_captured_output: 64 * 1024,
            tool: ToolConfig::default(),
            provision: ProvisionConfig::default(),
            install: InstallConfig::default(),
            checks: default_checks(),
            test: TestConfig::default(),
            build: BuildConfig::default(),
            publish: PublishConfig::default(),
            retry: RetrySettings::default(),
            timeouts: TimeoutConfig::default(),
            registry: RegistryConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Parses a configuration from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Renders the configuration as TOML.
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Loads a configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Loads `explicit` if given, else `distflow.toml` in the project
    /// directory if present, else the defaults.
    pub fn discover(project_dir: &Path, explicit: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        let candidate = project_dir.join(CONFIG_FILE_NAME);
        if candidate.is_file() {
            tracing::debug!(path = %candidate.display(), "Loading configuration");
            Self::load(&candidate)
        } else {
            Ok(Self::default())
        }
    }

    /// Applies `(variable, value)` overrides. Unknown variables are ignored
    /// and empty values are skipped.
    #[must_use]
    pub fn apply_overrides<I, K, V>(mut self, overrides: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        for (key, value) in overrides {
            let value = value.into();
            if value.trim().is_empty() {
                continue;
            }
            match key.as_ref() {
                ENV_WORK_DIR => self.work_dir = PathBuf::from(value),
                ENV_STORE_DIR => self.publish.store_dir = PathBuf::from(value),
                ENV_REGISTRY_URL => self.registry.url = Some(value),
                _ => {}
            }
        }
        self
    }

    /// Applies overrides from the process environment.
    #[must_use]
    pub fn with_env_overrides(self) -> Self {
        let vars: Vec<(&str, String)> = [ENV_WORK_DIR, ENV_STORE_DIR, ENV_REGISTRY_URL]
            .into_iter()
            .filter_map(|key| std::env::var(key).ok().map(|value| (key, value)))
            .collect();
        self.apply_overrides(vars)
    }

    /// Checks that the configuration is usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.supported_versions.is_empty() {
            return Err(ConfigError::Invalid("supported_versions is empty".into()));
        }
        for version in &self.supported_versions {
            RuntimeVersion::parse(version).map_err(|e| {
                ConfigError::Invalid(format!("supported_versions: {e}"))
            })?;
        }
        for (index, command) in self.provision.commands.iter().enumerate() {
            require_command(&format!("provision.commands[{index}]"), command)?;
        }
        require_command("install.command", &self.install.command)?;
        require_command("test.command", &self.test.command)?;
        if self.build.backend == BuildBackend::Command {
            require_command("build.command", &self.build.command)?;
        }

        let mut names = HashSet::new();
        for check in &self.checks {
            if check.name.trim().is_empty() {
                return Err(ConfigError::Invalid("check name is empty".into()));
            }
            if !names.insert(check.name.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate check '{}'", check.name)));
            }
            require_command(&format!("checks.{}", check.name), &check.command)?;
        }

        self.artifact_regex()?;
        if !LABEL_PREFIX_PATTERN.is_match(&self.publish.label_prefix) {
            return Err(ConfigError::Invalid(format!(
                "publish.label_prefix '{}' may only contain letters, digits, '.', '_' and '-'",
                self.publish.label_prefix
            )));
        }
        if self.retry.install.max_attempts == 0 {
            return Err(ConfigError::Invalid("retry.install.max_attempts must be at least 1".into()));
        }
        for stage in StageName::ALL {
            if self.timeouts.seconds_for(stage) == Some(0) {
                return Err(ConfigError::Invalid(format!("timeouts.{stage} must be positive")));
            }
        }
        if self.registry.timeout_seconds == 0 {
            return Err(ConfigError::Invalid("registry.timeout_seconds must be positive".into()));
        }
        Ok(())
    }

    /// Checks the configured directories against the project rooted at
    /// `root`.
    ///
    /// The build stage empties `build.dist_dir` before every build, so it
    /// must not be the project itself, one of its ancestors, or a directory
    /// holding the work or store directories.
    pub fn validate_paths(&self, root: &Path) -> Result<(), ConfigError> {
        let dist = &self.build.dist_dir;
        if dist.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("build.dist_dir is empty".into()));
        }
        let root = normalize(root)?;
        let dist_dir = normalize(&Self::resolve_path(&root, dist))?;
        if root.starts_with(&dist_dir) {
            return Err(ConfigError::Invalid(format!(
                "build.dist_dir '{}' resolves to the project directory or one of its parents",
                dist.display()
            )));
        }
        for (field, path) in [("work_dir", &self.work_dir), ("publish.store_dir", &self.publish.store_dir)] {
            if normalize(&Self::resolve_path(&root, path))?.starts_with(&dist_dir) {
                return Err(ConfigError::Invalid(format!(
                    "build.dist_dir '{}' contains {field}",
                    dist.display()
                )));
            }
        }
        Ok(())
    }

    /// Returns true if the runtime version is in the supported set.
    #[must_use]
    pub fn is_supported(&self, version: &RuntimeVersion) -> bool {
        self.supported_versions
            .iter()
            .any(|supported| supported == version.as_str())
    }

    /// Compiled artifact file name pattern.
    pub fn artifact_regex(&self) -> Result<Regex, ConfigError> {
        Regex::new(&self.build.artifact_pattern).map_err(|e| {
            ConfigError::Invalid(format!("build.artifact_pattern: {e}"))
        })
    }

    /// The upload label for a runtime version.
    #[must_use]
    pub fn label_for(&self, version: &RuntimeVersion) -> String {
        format!("{}_{}", self.publish.label_prefix, version)
    }

    /// Resolves a configured path against the project root.
    #[must_use]
    pub fn resolve_path(root: &Path, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            root.join(path)
        }
    }
}

/// Makes a path absolute and folds `.` and `..` without touching the
/// filesystem.
fn normalize(path: &Path) -> Result<PathBuf, ConfigError> {
    let absolute = std::path::absolute(path).map_err(|e| {
        ConfigError::Invalid(format!("cannot resolve {}: {e}", path.display()))
    })?;
    let mut normalized = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other),
        }
    }
    Ok(normalized)
}

fn require_command(field: &str, command: &[String]) -> Result<(), ConfigError> {
    match command.first() {
        Some(program) if !program.trim().is_empty() => Ok(()),
        _ => Err(ConfigError::Invalid(format!("{field} is empty"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults_are_valid() {
        let config = PipelineConfig::default();
        config.validate().unwrap();

        assert_eq!(config.supported_versions, vec!["3.9", "3.10", "3.11", "3.12"]);
        assert_eq!(config.retry.install.max_attempts, 2);
        assert_eq!(config.checks.len(), 3);
        assert_eq!(config.build.backend, BuildBackend::Command);
    }

    #[test]
    fn test_empty_file_gives_defaults() {
        let config = PipelineConfig::from_toml_str("").unwrap();
        assert_eq!(config, PipelineConfig::default());
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let config = PipelineConfig::from_toml_str(
            r#"
            supported_versions = ["3.11"]

            [build]
            backend = "source-archive"

            [publish]
            label_prefix = "sdist"

            [timeouts]
            test = 600
            "#,
        )
        .unwrap();

        assert_eq!(config.supported_versions, vec!["3.11"]);
        assert_eq!(config.build.backend, BuildBackend::SourceArchive);
        assert_eq!(config.build.dist_dir, PathBuf::from("dist"));
        assert_eq!(config.publish.label_prefix, "sdist");
        assert_eq!(config.timeouts.for_stage(StageName::Test), Some(Duration::from_secs(600)));
        assert_eq!(config.timeouts.for_stage(StageName::Build), None);
    }

    #[test]
    fn test_custom_checks_replace_defaults() {
        let config = PipelineConfig::from_toml_str(
            r#"
            [[checks]]
            name = "lint"
            command = ["ruff", "check", "src"]
            "#,
        )
        .unwrap();

        assert_eq!(config.checks, vec![CheckConfig::new("lint", &["ruff", "check", "src"])]);
    }

    #[test]
    fn test_unknown_backend_is_rejected() {
        let err = PipelineConfig::from_toml_str("[build]\nbackend = \"maturin\"").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_toml_render_roundtrips() {
        let config = PipelineConfig::default();
        let text = config.to_toml_string().unwrap();
        assert_eq!(PipelineConfig::from_toml_str(&text).unwrap(), config);
    }

    #[test]
    fn test_overrides() {
        let config = PipelineConfig::default().apply_overrides([
            (ENV_WORK_DIR, "/tmp/work"),
            (ENV_STORE_DIR, "/srv/artifacts"),
            (ENV_REGISTRY_URL, "https://pypi.org/pypi"),
            ("UNRELATED", "x"),
        ]);

        assert_eq!(config.work_dir, PathBuf::from("/tmp/work"));
        assert_eq!(config.publish.store_dir, PathBuf::from("/srv/artifacts"));
        assert_eq!(config.registry.url.as_deref(), Some("https://pypi.org/pypi"));
    }

    #[test]
    fn test_empty_override_is_skipped() {
        let config = PipelineConfig::default().apply_overrides([(ENV_WORK_DIR, "  ")]);
        assert_eq!(config.work_dir, PathBuf::from(".distflow/work"));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = PipelineConfig::default();
        config.supported_versions = vec!["three".into()];
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.checks.push(CheckConfig::new("lint", &["flake8"]));
        assert!(config.validate().unwrap_err().to_string().contains("duplicate check"));

        let mut config = PipelineConfig::default();
        config.publish.label_prefix = "wheel/../".into();
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.build.artifact_pattern = "(".into();
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.retry.install.max_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.timeouts.install = Some(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_source_archive_backend_needs_no_build_command() {
        let mut config = PipelineConfig::default();
        config.build.backend = BuildBackend::SourceArchive;
        config.build.command.clear();
        config.validate().unwrap();
    }

    #[test]
    fn test_label_and_support() {
        let config = PipelineConfig::default();
        let v311 = RuntimeVersion::parse("3.11").unwrap();
        let v27 = RuntimeVersion::parse("2.7").unwrap();

        assert_eq!(config.label_for(&v311), "wheel_3.11");
        assert!(config.is_supported(&v311));
        assert!(!config.is_supported(&v27));
    }

    #[test]
    fn test_discover() {
        let dir = tempfile::tempdir().unwrap();
        let config = PipelineConfig::discover(dir.path(), None).unwrap();
        assert_eq!(config, PipelineConfig::default());

        std::fs::write(dir.path().join(CONFIG_FILE_NAME), "keep_environments = true").unwrap();
        let config = PipelineConfig::discover(dir.path(), None).unwrap();
        assert!(config.keep_environments);

        let missing = dir.path().join("missing.toml");
        let err = PipelineConfig::discover(dir.path(), Some(&missing)).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_resolve_path() {
        let root = Path::new("/project");
        assert_eq!(
            PipelineConfig::resolve_path(root, Path::new("dist")),
            PathBuf::from("/project/dist")
        );
        assert_eq!(
            PipelineConfig::resolve_path(root, Path::new("/abs")),
            PathBuf::from("/abs")
        );
    }

    fn path_error(config: &PipelineConfig, root: &Path) -> String {
        config.validate_paths(root).unwrap_err().to_string()
    }

    #[test]
    fn test_default_paths_are_valid() {
        PipelineConfig::default().validate_paths(Path::new("/project")).unwrap();
        PipelineConfig::default().validate_paths(Path::new("relative/project")).unwrap();
    }

    #[test]
    fn test_dist_dir_must_not_remove_project() {
        let root = Path::new("/srv/project");
        for dist in [".", "./", "/srv/project", "/srv", "..", "sub/../..", "/"] {
            let mut config = PipelineConfig::default();
            config.build.dist_dir = PathBuf::from(dist);
            assert!(
                path_error(&config, root).contains("project directory"),
                "dist_dir {dist:?} was accepted"
            );
        }

        let mut config = PipelineConfig::default();
        config.build.dist_dir = PathBuf::new();
        assert!(path_error(&config, root).contains("is empty"));
    }

    #[test]
    fn test_dist_dir_must_not_contain_work_or_store() {
        let root = Path::new("/srv/project");

        let mut config = PipelineConfig::default();
        config.build.dist_dir = PathBuf::from(".distflow");
        assert!(path_error(&config, root).contains("work_dir"));

        let mut config = PipelineConfig::default();
        config.publish.store_dir = PathBuf::from("out/store");
        config.build.dist_dir = PathBuf::from("out");
        assert!(path_error(&config, root).contains("publish.store_dir"));

        let mut config = PipelineConfig::default();
        config.work_dir = PathBuf::from("/tmp/distflow-work");
        config.build.dist_dir = PathBuf::from("/tmp");
        assert!(path_error(&config, root).contains("work_dir"));
    }

    #[test]
    fn test_dist_dir_outside_project_is_allowed() {
        let mut config = PipelineConfig::default();
        config.build.dist_dir = PathBuf::from("../artifacts/dist");
        config.validate_paths(Path::new("/srv/project")).unwrap();
    }
}
