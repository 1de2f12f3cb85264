//! Dependency installation.

use super::{last_line, StageContext};
use crate::context::{ProvisionedEnvironment, StageLog};
use crate::core::{PipelineEvent, StageName};
use crate::errors::{ConflictDetail, PipelineError};
use crate::events::emit_event;
use crate::exec::{CommandOutput, CommandSpec};
use crate::pipeline::{should_retry, RetryDecision, RetryState};
use crate::registry::{resolve, ResolvedPackage};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::LazyLock;
use tracing::{info, warn};

static NETWORK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(connection (refused|reset|aborted|timed out|error)|could not connect|failed to establish a new connection|temporary failure in name resolution|name or service not known|nodename nor servname|network is unreachable|max retries exceeded|read timed out|HTTPSConnectionPool|service unavailable|SSLError)",
    )
    .expect("network regex is valid")
});

static SOLVER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(SolverProblemError|version solving failed|ResolutionImpossible|conflicting dependencies|no versions of|could not find a version that satisfies)",
    )
    .expect("solver regex is valid")
});

static CONFLICT_PACKAGE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(?:no versions of|depends on|requires|satisfies the requirement)\s+(?:both\s+)?(?P<pkg>[A-Za-z0-9][A-Za-z0-9._-]*)\s*(?:\((?P<c1>[^)]*)\)|(?P<c2>[<>=!~^][^\s,;)]*))?",
    )
    .expect("conflict regex is valid")
});

/// What the installer did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallReport {
    /// Versions chosen by index pre-resolution; empty when no index is used.
    pub resolved: Vec<ResolvedPackage>,
    /// Attempts made, including the first.
    pub attempts: u32,
}

/// Resolves and installs runtime and development dependencies into the
/// provisioned environment.
///
/// Only [`PipelineError::NetworkUnavailable`] is retried, bounded by the
/// install retry policy. Every retry emits a `stage.retrying` event.
///
/// # Errors
///
/// - [`PipelineError::ResolutionConflict`] if the constraints cannot be
///   satisfied together or do not admit the environment's runtime.
/// - [`PipelineError::NetworkUnavailable`] if the registry stays unreachable.
/// - [`PipelineError::CommandFailed`] for any other install failure.
pub async fn install(
    ctx: &StageContext<'_>,
    env: &ProvisionedEnvironment,
    log: &mut StageLog,
) -> Result<InstallReport, PipelineError> {
    let deps = &ctx.project.dependencies;
    if !deps.accepts_runtime(env.runtime_version()) {
        let declared = deps.python.iter().map(ToString::to_string).collect();
        return Err(PipelineError::ResolutionConflict {
            conflicts: vec![ConflictDetail::new(
                "python",
                declared,
                format!("the project does not support runtime {}", env.runtime_version()),
            )],
        });
    }

    let policy = &ctx.config.retry.install;
    let mut state = RetryState::new();
    loop {
        let attempt = log.begin_attempt();
        match attempt_install(ctx, env, log).await {
            Ok(resolved) => {
                info!(packages = deps.len(), attempts = attempt, "Dependencies installed");
                let report = InstallReport {
                    resolved,
                    attempts: attempt,
                };
                log.set_details(serde_json::to_value(&report).unwrap_or_default());
                return Ok(report);
            }
            Err(err) if err.is_retryable() => match should_retry(&mut state, policy) {
                RetryDecision::Retry(delay) => {
                    let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
                    warn!(attempt, delay_ms, error = %err, "Registry unavailable, retrying install");
                    log.note(&format!("{err}; retrying in {delay_ms}ms"));
                    let event =
                        PipelineEvent::stage_retrying(ctx.run_id, StageName::Install, attempt + 1, delay_ms);
                    emit_event(ctx.sink, &event).await;
                    tokio::time::sleep(delay).await;
                }
                RetryDecision::GiveUp => return Err(err),
            },
            Err(err) => return Err(err),
        }
    }
}

async fn attempt_install(
    ctx: &StageContext<'_>,
    env: &ProvisionedEnvironment,
    log: &mut StageLog,
) -> Result<Vec<ResolvedPackage>, PipelineError> {
    let resolved = match ctx.index {
        Some(index) => resolve(&ctx.project.dependencies, index).await?,
        None => Vec::new(),
    };

    let spec = env.command("install", &ctx.config.install.command)?;
    let output = ctx.run_command(log, &spec).await?;
    if output.success() {
        Ok(resolved)
    } else {
        Err(classify_install_failure(&spec, &output))
    }
}

/// Maps a failed install command to an error from its output.
#[must_use]
pub fn classify_install_failure(spec: &CommandSpec, output: &CommandOutput) -> PipelineError {
    let text = output.combined();

    if let Some(line) = text.lines().find(|l| NETWORK_RE.is_match(l)) {
        return PipelineError::network(line.trim());
    }

    if SOLVER_RE.is_match(&text) {
        let mut seen = BTreeSet::new();
        let mut conflicts = Vec::new();
        for line in text.lines() {
            for caps in CONFLICT_PACKAGE_RE.captures_iter(line) {
                let package = caps["pkg"].to_lowercase();
                if !seen.insert(package.clone()) {
                    continue;
                }
                let constraints = caps
                    .name("c1")
                    .or_else(|| caps.name("c2"))
                    .map(|m| vec![m.as_str().trim().to_string()])
                    .unwrap_or_default();
                conflicts.push(ConflictDetail::new(package, constraints, line.trim()));
            }
        }
        if conflicts.is_empty() {
            conflicts.push(ConflictDetail::new("dependencies", Vec::new(), last_line(output)));
        }
        return PipelineError::ResolutionConflict { conflicts };
    }

    PipelineError::CommandFailed {
        command: spec.display(),
        exit_code: output.exit_code,
    }
}
