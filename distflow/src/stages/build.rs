//! Package building.
//!
//! Two backends are available. The `command` backend runs the configured
//! build tool and collects whatever it leaves in the dist directory. The
//! `source-archive` backend writes a reproducible `.tar.gz` of the source
//! tree itself: entries are sorted, timestamps and owners are zeroed and the
//! gzip header carries no mtime, so identical inputs give identical bytes.

use super::{last_line, StageContext, TestReport};
use crate::config::{BuildBackend, PipelineConfig};
use crate::context::{ProvisionedEnvironment, StageLog};
use crate::core::{Artifact, BuiltArtifacts, RuntimeVersion, Version};
use crate::errors::PipelineError;
use crate::project::Project;
use flate2::{Compression, GzBuilder};
use ignore::WalkBuilder;
use regex::Regex;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use tar::{EntryType, Header};
use tracing::{debug, info};

/// Builds versioned distribution archives from the tested tree.
///
/// Requires the test report, so only a passing tree is ever built. The
/// returned set may be empty; an empty set is rejected by the publisher.
///
/// # Errors
///
/// - [`PipelineError::InvalidVersion`] if the project version is malformed.
/// - [`PipelineError::CommandFailed`] if the build command fails.
/// - [`PipelineError::Config`] if the dist directory would cover the project
///   or the pipeline's own directories.
pub async fn build(
    ctx: &StageContext<'_>,
    env: &ProvisionedEnvironment,
    tested: &TestReport,
    log: &mut StageLog,
) -> Result<BuiltArtifacts, PipelineError> {
    if !tested.all_passed() {
        return Err(PipelineError::Internal(
            "build requested for a tree with failing tests".into(),
        ));
    }

    let project = ctx.project;
    let version = Version::parse(&project.version).map_err(|e| PipelineError::InvalidVersion {
        version: project.version.clone(),
        reason: e.to_string(),
    })?;

    ctx.config.validate_paths(&project.root)?;
    let dist_dir = PipelineConfig::resolve_path(&project.root, &ctx.config.build.dist_dir);
    reset_dir(&dist_dir).await?;

    let runtime = env.runtime_version().clone();
    let artifacts = match ctx.config.build.backend {
        BuildBackend::Command => {
            let spec = env.command("build", &ctx.config.build.command)?;
            let output = ctx.run_command(log, &spec).await?;
            if !output.success() {
                debug!(last_line = %last_line(&output), "Build command failed");
                return Err(PipelineError::CommandFailed {
                    command: spec.display(),
                    exit_code: output.exit_code,
                });
            }
            let pattern = ctx.config.artifact_regex()?;
            collect_artifacts(&dist_dir, &pattern, &runtime).await?
        }
        BuildBackend::SourceArchive => {
            let excluded = vec![
                dist_dir.clone(),
                PipelineConfig::resolve_path(&project.root, &ctx.config.work_dir),
                PipelineConfig::resolve_path(&project.root, &ctx.config.publish.store_dir),
            ];
            let owned = project.clone();
            let archive_version = version.clone();
            let bytes = tokio::task::spawn_blocking(move || {
                source_archive(&owned, &archive_version, &excluded)
            })
            .await
            .map_err(|e| PipelineError::Internal(format!("archive task failed: {e}")))??;

            let file_name = archive_name(project, &version);
            tokio::fs::write(dist_dir.join(&file_name), &bytes).await?;
            log.note(&format!("wrote {file_name} ({} bytes)", bytes.len()));
            vec![Artifact::new(file_name, bytes, runtime.clone())]
        }
    };

    let built = BuiltArtifacts::new(ctx.run_id, runtime, artifacts);
    info!(count = built.len(), files = ?built.file_names(), "Build finished");
    log.set_details(serde_json::json!({
        "artifacts": built.artifacts(),
    }));
    Ok(built)
}

/// File name of the source archive for a project version.
#[must_use]
pub fn archive_name(project: &Project, version: &Version) -> String {
    format!("{}-{}.tar.gz", project.distribution_name(), version)
}

async fn reset_dir(dir: &Path) -> Result<(), PipelineError> {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(err.into()),
    }
    tokio::fs::create_dir_all(dir).await?;
    Ok(())
}

async fn collect_artifacts(
    dist_dir: &Path,
    pattern: &Regex,
    runtime: &RuntimeVersion,
) -> Result<Vec<Artifact>, PipelineError> {
    let mut names = Vec::new();
    let mut entries = tokio::fs::read_dir(dist_dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_type().await?.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if pattern.is_match(&name) {
            names.push(name);
        } else {
            debug!(file = %name, "Ignoring non-artifact file");
        }
    }
    names.sort();

    let mut artifacts = Vec::with_capacity(names.len());
    for name in names {
        let bytes = tokio::fs::read(dist_dir.join(&name)).await?;
        artifacts.push(Artifact::new(name, bytes, runtime.clone()));
    }
    Ok(artifacts)
}

fn pkg_info(project: &Project, version: &Version) -> String {
    let mut text = format!(
        "Metadata-Version: 2.1\nName: {}\nVersion: {}\n",
        project.name, version
    );
    if let Some(python) = &project.dependencies.python {
        let _ = writeln!(text, "Requires-Python: {python}");
    }
    for requirement in &project.dependencies.runtime {
        if requirement.constraint.is_any() {
            let _ = writeln!(text, "Requires-Dist: {}", requirement.name);
        } else {
            let _ = writeln!(text, "Requires-Dist: {} ({})", requirement.name, requirement.constraint);
        }
    }
    text
}

fn archive_path(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    Some(parts.join("/"))
}

fn append(
    builder: &mut tar::Builder<flate2::write::GzEncoder<Vec<u8>>>,
    path: &str,
    data: &[u8],
) -> std::io::Result<()> {
    let mut header = Header::new_gnu();
    header.set_entry_type(EntryType::Regular);
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(0);
    header.set_uid(0);
    header.set_gid(0);
    builder.append_data(&mut header, path, data)
}

/// Writes a reproducible source archive of the project tree.
///
/// The walk honours `.gitignore`, skips hidden entries, `__pycache__`,
/// compiled files and every path under `excluded`.
///
/// # Errors
///
/// Returns an error if the tree cannot be read.
pub fn source_archive(
    project: &Project,
    version: &Version,
    excluded: &[PathBuf],
) -> Result<Vec<u8>, PipelineError> {
    let root = project.root.clone();
    let prefix = format!("{}-{}", project.distribution_name(), version);
    let skip: Vec<PathBuf> = excluded.to_vec();

    let walker = WalkBuilder::new(&root)
        .hidden(true)
        .git_ignore(true)
        .git_exclude(true)
        .require_git(false)
        .sort_by_file_name(|a, b| a.cmp(b))
        .filter_entry(move |entry| {
            let path = entry.path();
            entry.file_name() != "__pycache__" && !skip.iter().any(|s| path.starts_with(s))
        })
        .build();

    let encoder = GzBuilder::new().mtime(0).write(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    append(&mut builder, &format!("{prefix}/PKG-INFO"), pkg_info(project, version).as_bytes())?;

    for entry in walker {
        let entry = entry.map_err(|e| PipelineError::Internal(format!("walking source tree: {e}")))?;
        if !entry.file_type().is_some_and(|t| t.is_file()) {
            continue;
        }
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext == "pyc") {
            continue;
        }
        let Some(relative) = archive_path(&root, path) else {
            continue;
        };
        let data = std::fs::read(path)?;
        append(&mut builder, &format!("{prefix}/{relative}"), &data)?;
    }

    let encoder = builder.into_inner()?;
    Ok(encoder.finish()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;
    use crate::stages::{provision, run_tests, verify};
    use crate::testing::{assert_error_kind, ScriptedResponse, ScriptedRunner, StageHarness, TestProject};
    use flate2::read::GzDecoder;
    use pretty_assertions::assert_eq;

    async fn build_with(
        harness: &StageHarness,
    ) -> Result<BuiltArtifacts, PipelineError> {
        let ctx = harness.ctx();
        let env = provision(&ctx, "3.11", &mut StageLog::new(1024)).await?;
        let verified = verify(&ctx, &env, &mut StageLog::new(1024)).await?;
        let tested = run_tests(&ctx, &env, &verified, &mut StageLog::new(1024)).await?;
        build(&ctx, &env, &tested, &mut StageLog::new(4096)).await
    }

    fn source_archive_harness(dir: &Path, project: &TestProject) -> StageHarness {
        let project = project.write(dir).unwrap();
        let mut harness = StageHarness::new(project, ScriptedRunner::new());
        harness.config.build.backend = BuildBackend::SourceArchive;
        harness
    }

    fn entry_names(bytes: &[u8]) -> Vec<String> {
        let mut archive = tar::Archive::new(GzDecoder::new(bytes));
        archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().display().to_string())
            .collect()
    }

    #[tokio::test]
    async fn test_command_backend_collects_matching_files() {
        let fixture = TestProject::default();
        let dir = tempfile::tempdir().unwrap();
        let project = fixture.write(dir.path()).unwrap();
        let runner = ScriptedRunner::new().always(
            "build",
            ScriptedResponse::ok("Building traceguard-demo (0.3.1)")
                .writes_file(format!("dist/{}", fixture.wheel_name()), b"wheel".to_vec())
                .writes_file("dist/traceguard_demo-0.3.1.tar.gz", b"sdist".to_vec())
                .writes_file("dist/build.log", b"noise".to_vec()),
        );
        let harness = StageHarness::new(project, runner);

        let built = build_with(&harness).await.unwrap();

        assert_eq!(
            built.file_names(),
            vec!["traceguard_demo-0.3.1-py3-none-any.whl", "traceguard_demo-0.3.1.tar.gz"]
        );
        assert_eq!(built.run_id(), harness.run_id);
        assert_eq!(built.runtime_version().as_str(), "3.11");
    }

    #[tokio::test]
    async fn test_dist_dir_covering_project_is_left_alone() {
        for dist in [".", "..", ".distflow"] {
            let dir = tempfile::tempdir().unwrap();
            let project = TestProject::default().write(dir.path()).unwrap();
            let mut harness = StageHarness::new(project, ScriptedRunner::new());
            harness.config.build.dist_dir = PathBuf::from(dist);

            let result = build_with(&harness).await;

            assert_error_kind(&result, ErrorKind::Config);
            assert!(dir.path().join("pyproject.toml").exists());
            assert!(dir.path().join("src/traceguard_demo/__init__.py").exists());
            assert_eq!(harness.runner.call_count("build"), 0);
        }
    }

    #[tokio::test]
    async fn test_stale_dist_files_are_cleared() {
        let dir = tempfile::tempdir().unwrap();
        let project = TestProject::default().write(dir.path()).unwrap();
        std::fs::create_dir_all(dir.path().join("dist")).unwrap();
        std::fs::write(dir.path().join("dist/old-0.0.1.tar.gz"), b"old").unwrap();
        let harness = StageHarness::new(project, ScriptedRunner::new());

        let built = build_with(&harness).await.unwrap();
        assert!(built.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_version() {
        let dir = tempfile::tempdir().unwrap();
        let project = TestProject::new("demo", "1.0-final!").write(dir.path()).unwrap();
        let harness = StageHarness::new(project, ScriptedRunner::new());

        let result = build_with(&harness).await;

        assert_error_kind(&result, ErrorKind::InvalidVersion);
        assert_eq!(harness.runner.call_count("build"), 0);
    }

    #[tokio::test]
    async fn test_failed_build_command() {
        let dir = tempfile::tempdir().unwrap();
        let project = TestProject::default().write(dir.path()).unwrap();
        let runner = ScriptedRunner::new().always("build", ScriptedResponse::fail(1, "Invalid pyproject"));
        let harness = StageHarness::new(project, runner);

        assert_error_kind(&build_with(&harness).await, ErrorKind::CommandFailed);
    }

    #[tokio::test]
    async fn test_source_archive_is_deterministic() {
        let fixture = TestProject::default();
        let dir = tempfile::tempdir().unwrap();
        let harness = source_archive_harness(dir.path(), &fixture);

        let first = build_with(&harness).await.unwrap();
        let second = build_with(&harness).await.unwrap();

        assert_eq!(first.len(), 1);
        assert_eq!(first.file_names(), vec!["traceguard_demo-0.3.1.tar.gz"]);
        assert_eq!(first.artifacts()[0].sha256, second.artifacts()[0].sha256);
        assert_eq!(first.artifacts()[0].bytes, second.artifacts()[0].bytes);
    }

    #[tokio::test]
    async fn test_source_archive_contents() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(".gitignore"), "*.log\n").unwrap();
        std::fs::write(dir.path().join("debug.log"), "ignored").unwrap();
        std::fs::create_dir_all(dir.path().join("src/traceguard_demo/__pycache__")).unwrap();
        std::fs::write(dir.path().join("src/traceguard_demo/__pycache__/x.pyc"), "c").unwrap();
        let harness = source_archive_harness(dir.path(), &TestProject::default());

        let built = build_with(&harness).await.unwrap();
        let names = entry_names(&built.artifacts()[0].bytes);

        assert_eq!(
            names,
            vec![
                "traceguard_demo-0.3.1/PKG-INFO",
                "traceguard_demo-0.3.1/pyproject.toml",
                "traceguard_demo-0.3.1/src/traceguard_demo/__init__.py",
                "traceguard_demo-0.3.1/tests/test_basic.py",
            ]
        );
    }

    #[test]
    fn test_pkg_info() {
        let dir = tempfile::tempdir().unwrap();
        let project = TestProject::default().write(dir.path()).unwrap();
        let info = pkg_info(&project, &Version::parse("0.3.1").unwrap());

        assert!(info.contains("Name: traceguard-demo\n"));
        assert!(info.contains("Requires-Python: >=3.9,<4.0\n"));
        assert!(info.contains("Requires-Dist: openai (^1.3)\n"));
    }
}
