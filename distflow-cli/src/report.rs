use anyhow::{Context, Result};
use distflow::context::PipelineRun;
use distflow::core::StageStatus;
use std::fmt::Write as _;
use std::path::Path;

/// Renders runs for a terminal.
pub fn render_human(runs: &[PipelineRun]) -> String {
    let mut out = String::new();
    for run in runs {
        let _ = writeln!(
            out,
            "runtime {} ({}): {} in {:.1}s",
            run.runtime_version(),
            run.run_id(),
            if run.succeeded() { "succeeded" } else { "FAILED" },
            run.duration_ms() / 1000.0
        );
        for stage in run.stages() {
            let mark = match stage.status {
                StageStatus::Ok => "ok",
                StageStatus::Fail => "FAIL",
                StageStatus::Running | StageStatus::Pending => "..",
            };
            let retries = if stage.attempts > 1 {
                format!(" ({} attempts)", stage.attempts)
            } else {
                String::new()
            };
            let _ = writeln!(
                out,
                "  [{mark:>4}] {:<10} {:>8.0} ms{retries}",
                stage.name.to_string(),
                stage.duration_ms
            );
        }
        if let Some(error) = run.error() {
            let _ = writeln!(out, "  error: {}: {}", error.kind, error.message);
            if let Some(hint) = error.kind.hint() {
                let _ = writeln!(out, "  hint: {hint}");
            }
        }
        if let Some(receipt) = run.receipt() {
            let _ = writeln!(out, "  published {} -> {}", receipt.label, receipt.location);
            for file in &receipt.files {
                let _ = writeln!(out, "    {} {} ({} bytes)", file.sha256, file.name, file.size);
            }
        }
    }
    out
}

/// The JSON report for a set of runs.
pub fn render_json(runs: &[PipelineRun]) -> Result<serde_json::Value> {
    let runs = runs
        .iter()
        .map(|run| run.to_json().context("serializing run report"))
        .collect::<Result<Vec<_>>>()?;
    let succeeded = runs.iter().all(|r| r["outcome"] == "succeeded");
    Ok(serde_json::json!({
        "succeeded": succeeded,
        "runs": runs,
    }))
}

/// Writes the JSON report to `path`.
pub fn write_report(path: &Path, runs: &[PipelineRun]) -> Result<()> {
    let report = render_json(runs)?;
    let text = serde_json::to_string_pretty(&report)?;
    std::fs::write(path, text).with_context(|| format!("writing report to {}", path.display()))
}
