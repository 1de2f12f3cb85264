//! Sequential stage execution for one runtime version.

use crate::config::PipelineConfig;
use crate::context::{PipelineRun, ProvisionedEnvironment, StageLog};
use crate::core::{PipelineEvent, StageName};
use crate::errors::PipelineError;
use crate::events::{emit_event, EventSink};
use crate::exec::CommandRunner;
use crate::observability::SpanTimer;
use crate::project::Project;
use crate::registry::PackageIndex;
use crate::stages::{self, StageContext};
use crate::store::{ArtifactStore, UploadReceipt};
use futures::future::join_all;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

/// A configured build-and-release pipeline for one project.
///
/// Create one with [`PipelineBuilder`](super::PipelineBuilder). A pipeline
/// can be run any number of times; every run gets a fresh id, its own
/// environment and its own [`PipelineRun`] record.
#[derive(Debug)]
pub struct Pipeline {
    pub(super) config: PipelineConfig,
    pub(super) project: Project,
    pub(super) runner: Arc<dyn CommandRunner>,
    pub(super) store: Arc<dyn ArtifactStore>,
    pub(super) index: Option<Arc<dyn PackageIndex>>,
    pub(super) sink: Arc<dyn EventSink>,
    /// The build stage rewrites the project's dist directory, so concurrent
    /// runs take turns building.
    pub(super) build_lock: tokio::sync::Mutex<()>,
}

impl Pipeline {
    /// The pipeline configuration.
    #[must_use]
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// The project being built.
    #[must_use]
    pub fn project(&self) -> &Project {
        &self.project
    }

    /// Returns true if dependency pre-resolution is enabled.
    #[must_use]
    pub fn has_index(&self) -> bool {
        self.index.is_some()
    }

    /// Runs every stage in order for one runtime version.
    ///
    /// Never returns an error: failures are recorded in the returned run,
    /// which is always in a terminal state.
    pub async fn run(&self, runtime_version: &str) -> PipelineRun {
        let run_id = Uuid::new_v4();
        let span = info_span!("pipeline_run", %run_id, runtime_version);
        self.execute(run_id, runtime_version).instrument(span).await
    }

    /// Runs the pipeline for several runtime versions concurrently.
    ///
    /// Runs are independent; results are returned in request order.
    pub async fn run_many(&self, runtime_versions: &[String]) -> Vec<PipelineRun> {
        join_all(runtime_versions.iter().map(|v| self.run(v))).await
    }

    fn context(&self, run_id: Uuid) -> StageContext<'_> {
        StageContext {
            config: &self.config,
            project: &self.project,
            runner: self.runner.as_ref(),
            sink: self.sink.as_ref(),
            index: self.index.as_deref(),
            store: self.store.as_ref(),
            run_id,
        }
    }

    async fn execute(&self, run_id: Uuid, runtime_version: &str) -> PipelineRun {
        let timer = SpanTimer::start("pipeline");
        let ctx = self.context(run_id);
        let mut run = PipelineRun::new(run_id, runtime_version);
        info!(project = %self.project.name, version = %self.project.version, "Pipeline started");
        emit_event(ctx.sink, &PipelineEvent::pipeline_started(run_id, runtime_version)).await;

        let env = self.provision(&mut run, &ctx, runtime_version).await;

        if let Some(env) = env {
            if let Some(receipt) = self.release(&mut run, &ctx, &env).await {
                run.set_receipt(receipt);
            }
            if self.config.keep_environments {
                info!(env_dir = %env.env_dir().display(), "Keeping environment");
            } else if let Err(err) = env.discard().await {
                warn!(env_dir = %env.env_dir().display(), error = %err, "Failed to remove environment");
            }
        }

        let duration_ms = timer.finish();
        run.finish(duration_ms);
        match run.failed_stage() {
            None if run.succeeded() => info!(duration_ms, "Pipeline succeeded"),
            failed => warn!(
                stage = ?failed,
                kind = ?run.error().map(|e| e.kind),
                duration_ms,
                "Pipeline failed"
            ),
        }
        emit_event(
            ctx.sink,
            &PipelineEvent::pipeline_finished(run_id, run.succeeded(), duration_ms),
        )
        .await;
        run
    }

    /// Provisions the run's environment. A failed or interrupted attempt
    /// leaves no environment directory behind.
    async fn provision(
        &self,
        run: &mut PipelineRun,
        ctx: &StageContext<'_>,
        runtime_version: &str,
    ) -> Option<ProvisionedEnvironment> {
        let mut log = self.open(run, ctx, StageName::Provision).await?;
        let outcome = self
            .timed(StageName::Provision, stages::provision(ctx, runtime_version, &mut log))
            .await;
        if outcome.0.is_err() {
            stages::provision::discard_partial(ctx).await;
        }
        self.close(run, ctx, StageName::Provision, log, outcome).await
    }

    /// Stages after provisioning. Each stage's result feeds the next, and the
    /// first failure ends the chain.
    async fn release(
        &self,
        run: &mut PipelineRun,
        ctx: &StageContext<'_>,
        env: &ProvisionedEnvironment,
    ) -> Option<UploadReceipt> {
        let mut log = self.open(run, ctx, StageName::Install).await?;
        let outcome = self.timed(StageName::Install, stages::install(ctx, env, &mut log)).await;
        self.close(run, ctx, StageName::Install, log, outcome).await?;

        let mut log = self.open(run, ctx, StageName::Verify).await?;
        let outcome = self.timed(StageName::Verify, stages::verify(ctx, env, &mut log)).await;
        let verified = self.close(run, ctx, StageName::Verify, log, outcome).await?;

        let mut log = self.open(run, ctx, StageName::Test).await?;
        let outcome = self
            .timed(StageName::Test, stages::run_tests(ctx, env, &verified, &mut log))
            .await;
        let tested = self.close(run, ctx, StageName::Test, log, outcome).await?;

        let built = {
            let _guard = self.build_lock.lock().await;
            let mut log = self.open(run, ctx, StageName::Build).await?;
            let outcome = self
                .timed(StageName::Build, stages::build(ctx, env, &tested, &mut log))
                .await;
            self.close(run, ctx, StageName::Build, log, outcome).await?
        };

        let mut log = self.open(run, ctx, StageName::Publish).await?;
        let outcome = self.timed(StageName::Publish, stages::publish(ctx, built, &mut log)).await;
        self.close(run, ctx, StageName::Publish, log, outcome).await
    }

    /// Enters a stage and returns the log it writes into, or `None` if the
    /// run cannot enter it.
    async fn open(&self, run: &mut PipelineRun, ctx: &StageContext<'_>, name: StageName) -> Option<StageLog> {
        if let Err(err) = run.begin_stage(name) {
            run.abort(&err);
            return None;
        }
        emit_event(ctx.sink, &PipelineEvent::stage_started(ctx.run_id, name)).await;
        Some(StageLog::new(self.config.max_captured_output))
    }

    /// Runs a stage body under its span and time limit. The body is dropped
    /// when the limit expires; whatever it logged so far stays in the log it
    /// borrowed.
    async fn timed<T, Fut>(&self, name: StageName, work: Fut) -> (Result<T, PipelineError>, f64)
    where
        Fut: Future<Output = Result<T, PipelineError>>,
    {
        let timer = SpanTimer::start(name.to_string());
        let work = work.instrument(info_span!("stage", stage = %name));
        let result = match self.config.timeouts.seconds_for(name) {
            Some(seconds) => tokio::time::timeout(Duration::from_secs(seconds), work)
                .await
                .unwrap_or(Err(PipelineError::Timeout { stage: name, seconds })),
            None => work.await,
        };
        (result, timer.finish())
    }

    /// Records how a stage ended and emits its event. Returns the stage's
    /// value on success and `None` once the run failed.
    async fn close<T>(
        &self,
        run: &mut PipelineRun,
        ctx: &StageContext<'_>,
        name: StageName,
        mut log: StageLog,
        (result, duration_ms): (Result<T, PipelineError>, f64),
    ) -> Option<T> {
        match result {
            Ok(value) => {
                if let Err(err) = run.complete_stage(name, log, duration_ms) {
                    run.abort(&err);
                    return None;
                }
                info!(stage = %name, duration_ms, "Stage completed");
                emit_event(ctx.sink, &PipelineEvent::stage_completed(ctx.run_id, name, duration_ms)).await;
                Some(value)
            }
            Err(err) => {
                if let PipelineError::Timeout { seconds, .. } = &err {
                    log.note(&format!("stage timed out after {seconds}s"));
                }
                warn!(stage = %name, kind = %err.kind(), error = %err, "Stage failed");
                let report = serde_json::to_value(err.to_report(Some(name))).unwrap_or_default();
                if let Err(bookkeeping) = run.fail_stage(name, log, duration_ms, &err) {
                    run.abort(&bookkeeping);
                }
                emit_event(ctx.sink, &PipelineEvent::stage_failed(ctx.run_id, name, report)).await;
                None
            }
        }
    }
}
