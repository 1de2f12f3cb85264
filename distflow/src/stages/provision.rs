//! Environment provisioning.

use super::{last_line, StageContext};
use crate::config::PipelineConfig;
use crate::context::{ProvisionedEnvironment, StageLog};
use crate::core::RuntimeVersion;
use crate::errors::PipelineError;
use std::path::PathBuf;
use tracing::{info, warn};

/// Creates an isolated environment at the requested runtime version and
/// installs the pinned dependency manager into it.
///
/// The version is checked before anything touches the filesystem, so an
/// unsupported request leaves no environment behind. Each run gets its own
/// directory, named after the run id.
///
/// # Errors
///
/// - [`PipelineError::UnsupportedVersion`] if the version is malformed or
///   not in the supported set.
/// - [`PipelineError::ProvisioningFailed`] if a provisioning command fails.
pub async fn provision(
    ctx: &StageContext<'_>,
    requested: &str,
    log: &mut StageLog,
) -> Result<ProvisionedEnvironment, PipelineError> {
    let unsupported = || PipelineError::UnsupportedVersion {
        requested: requested.to_string(),
        supported: ctx.config.supported_versions.clone(),
    };
    let version = RuntimeVersion::parse(requested).map_err(|_| unsupported())?;
    if !ctx.config.is_supported(&version) {
        return Err(unsupported());
    }

    let env_dir = envs_dir(ctx).join(format!("{}-{}", ctx.run_id, version));
    let env = ProvisionedEnvironment::new(
        ctx.run_id,
        version,
        env_dir,
        ctx.project.root.clone(),
        ctx.config.tool.clone(),
    );

    tokio::fs::create_dir_all(env.env_dir()).await.map_err(|e| {
        PipelineError::provisioning(format!("cannot create {}: {e}", env.env_dir().display()))
    })?;

    if let Err(err) = run_provision_commands(ctx, &env, log).await {
        if let Err(cleanup) = env.discard().await {
            warn!(env_dir = %env.env_dir().display(), error = %cleanup, "Failed to remove environment");
        }
        return Err(err);
    }

    info!(
        runtime_version = %env.runtime_version(),
        env_dir = %env.env_dir().display(),
        tool = %format!("{}=={}", env.tool().name, env.tool().version),
        "Environment provisioned"
    );
    Ok(env)
}

/// Removes every environment directory of the current run.
///
/// Used when provisioning did not hand back an environment, for example
/// after its time limit dropped it halfway through.
pub async fn discard_partial(ctx: &StageContext<'_>) {
    let prefix = format!("{}-", ctx.run_id);
    let Ok(mut entries) = tokio::fs::read_dir(envs_dir(ctx)).await else {
        return;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        if !entry.file_name().to_string_lossy().starts_with(&prefix) {
            continue;
        }
        let path = entry.path();
        match tokio::fs::remove_dir_all(&path).await {
            Ok(()) => info!(env_dir = %path.display(), "Removed partial environment"),
            Err(err) => warn!(env_dir = %path.display(), error = %err, "Failed to remove environment"),
        }
    }
}

fn envs_dir(ctx: &StageContext<'_>) -> PathBuf {
    PipelineConfig::resolve_path(&ctx.project.root, &ctx.config.work_dir).join("envs")
}

async fn run_provision_commands(
    ctx: &StageContext<'_>,
    env: &ProvisionedEnvironment,
    log: &mut StageLog,
) -> Result<(), PipelineError> {
    for template in &ctx.config.provision.commands {
        let spec = env.command("provision", template)?;
        let output = ctx
            .run_command(log, &spec)
            .await
            .map_err(|e| PipelineError::provisioning(e.to_string()))?;
        if !output.success() {
            return Err(PipelineError::provisioning(format!(
                "`{}` exited with {:?}: {}",
                spec.display(),
                output.exit_code,
                last_line(&output)
            )));
        }
    }
    Ok(())
}
