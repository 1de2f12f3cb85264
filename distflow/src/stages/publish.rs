//! Publishing built artifacts.

use super::StageContext;
use crate::context::StageLog;
use crate::core::BuiltArtifacts;
use crate::errors::PipelineError;
use crate::store::UploadReceipt;
use tracing::{info, warn};

/// Uploads the artifact set under the label for its runtime version.
///
/// Takes the set by value, so a set can be published at most once. Uploads
/// are never retried.
///
/// # Errors
///
/// - [`PipelineError::NoArtifactsProduced`] if the set is empty; the store is
///   not contacted.
/// - [`PipelineError::PublishFailure`] if the store rejects the upload.
pub async fn publish(
    ctx: &StageContext<'_>,
    artifacts: BuiltArtifacts,
    log: &mut StageLog,
) -> Result<UploadReceipt, PipelineError> {
    if artifacts.is_empty() {
        return Err(PipelineError::NoArtifactsProduced);
    }
    if artifacts.run_id() != ctx.run_id {
        return Err(PipelineError::Internal(format!(
            "artifacts from run {} handed to run {}",
            artifacts.run_id(),
            ctx.run_id
        )));
    }

    let label = ctx.config.label_for(artifacts.runtime_version());
    log.note(&format!(
        "uploading {} file(s) to {} as {label}",
        artifacts.len(),
        ctx.store.describe()
    ));

    let receipt = match ctx.store.upload(&label, &artifacts).await {
        Ok(receipt) => receipt,
        Err(err @ PipelineError::PublishFailure { .. }) => {
            warn!(%label, error = %err, "Upload rejected");
            return Err(err);
        }
        Err(err) => {
            warn!(%label, error = %err, "Upload failed");
            return Err(PipelineError::publish(&label, err.to_string()));
        }
    };

    info!(label = %receipt.label, location = %receipt.location, "Artifacts published");
    log.set_details(serde_json::to_value(&receipt).unwrap_or_default());
    Ok(receipt)
}
