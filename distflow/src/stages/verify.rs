//! Static verification: type checking, linting and formatting checks.

use super::StageContext;
use crate::context::{ProvisionedEnvironment, StageLog};
use crate::errors::{PipelineError, Violation};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::LazyLock;
use tracing::{info, warn};

static LOCATION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<file>[^\s:][^:]*?):(?P<line>\d+)(?::\d+)?:\s*(?P<message>.+)$")
        .expect("location regex is valid")
});

static REFORMAT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^would reformat\s+(?P<file>.+)$").expect("reformat regex is valid")
});

/// Result of one check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckOutcome {
    /// Check name.
    pub name: String,
    /// Exit code of the check command.
    pub exit_code: Option<i32>,
    /// Violations it reported.
    pub violations: usize,
}

impl CheckOutcome {
    /// Returns true if the check passed.
    #[must_use]
    pub fn passed(&self) -> bool {
        self.exit_code == Some(0) && self.violations == 0
    }
}

/// Evidence that the source tree passed every static check.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyReport {
    /// One entry per configured check, in order.
    pub checks: Vec<CheckOutcome>,
}

impl VerifyReport {
    /// Returns true if every check passed.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.checks.iter().all(CheckOutcome::passed)
    }
}

/// Runs every configured static check inside the environment.
///
/// All checks run even after one fails, so the error lists every violation.
///
/// # Errors
///
/// Returns [`PipelineError::StaticCheckViolation`] if any check reports a
/// violation or exits unsuccessfully.
pub async fn verify(
    ctx: &StageContext<'_>,
    env: &ProvisionedEnvironment,
    log: &mut StageLog,
) -> Result<VerifyReport, PipelineError> {
    let mut report = VerifyReport::default();
    let mut violations = Vec::new();

    for check in &ctx.config.checks {
        let spec = env.command(format!("check:{}", check.name), &check.command)?;
        let output = ctx.run_command(log, &spec).await?;

        let mut found = if output.success() {
            Vec::new()
        } else {
            parse_violations(&check.name, &output.combined(), env.project_dir())
        };
        if !output.success() && found.is_empty() {
            found.push(Violation::new(
                &check.name,
                ".",
                None,
                format!("`{}` exited with {:?}", spec.display(), output.exit_code),
            ));
        }

        if found.is_empty() {
            info!(check = %check.name, "Check passed");
        } else {
            warn!(check = %check.name, violations = found.len(), "Check reported violations");
        }
        report.checks.push(CheckOutcome {
            name: check.name.clone(),
            exit_code: output.exit_code,
            violations: found.len(),
        });
        violations.extend(found);
    }

    log.set_details(serde_json::json!({ "checks": report.checks, "violations": violations }));
    if violations.is_empty() {
        Ok(report)
    } else {
        Err(PipelineError::StaticCheckViolation { violations })
    }
}

/// Extracts violations from checker output.
///
/// Understands `path:line[:col]: message` lines (mypy, ruff, flake8) and
/// `would reformat path` lines (black). Paths under `root` are made relative.
#[must_use]
pub fn parse_violations(check: &str, output: &str, root: &Path) -> Vec<Violation> {
    let relative = |file: &str| -> String {
        Path::new(file)
            .strip_prefix(root)
            .map_or_else(|_| file.to_string(), |p| p.display().to_string())
    };

    output
        .lines()
        .map(str::trim_end)
        .filter_map(|line| {
            if let Some(caps) = REFORMAT_RE.captures(line) {
                return Some(Violation::new(check, relative(caps["file"].trim()), None, "would reformat"));
            }
            let caps = LOCATION_RE.captures(line)?;
            let message = caps["message"].trim();
            if message.starts_with("note:") {
                return None;
            }
            Some(Violation::new(
                check,
                relative(&caps["file"]),
                caps["line"].parse().ok(),
                message,
            ))
        })
        .collect()
}
