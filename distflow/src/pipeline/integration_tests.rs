//! End-to-end runs of the pipeline against scripted commands.

#[cfg(test)]
mod tests {
    use crate::config::{BuildBackend, PipelineConfig};
    use crate::core::{PipelineState, StageName};
    use crate::errors::ErrorKind;
    use crate::events::CollectingEventSink;
    use crate::pipeline::{Pipeline, PipelineBuilder};
    use crate::registry::StaticPackageIndex;
    use crate::store::InMemoryArtifactStore;
    use crate::testing::{
        assert_run_failed_at, assert_run_succeeded, assert_stages_attempted, test_config,
        ScriptedResponse, ScriptedRunner, TestProject,
    };
    use pretty_assertions::assert_eq;
    use std::sync::Arc;
    use std::time::Duration;
    use StageName::{Build, Install, Provision, Publish, Test, Verify};

    const ONE_FAILING_TEST: &str = "\
tests/test_basic.py::test_version PASSED
tests/test_basic.py::test_guardrail FAILED
FAILED tests/test_basic.py::test_guardrail - AssertionError
1 failed, 1 passed in 0.05s";

    struct Fixture {
        dir: tempfile::TempDir,
        runner: Arc<ScriptedRunner>,
        store: Arc<InMemoryArtifactStore>,
        sink: Arc<CollectingEventSink>,
        pipeline: Pipeline,
    }

    fn builds_wheel() -> ScriptedResponse {
        ScriptedResponse::ok("Building traceguard-demo (0.3.1)")
            .writes_file(format!("dist/{}", TestProject::default().wheel_name()), b"wheel-bytes".to_vec())
    }

    fn fixture_with(runner: ScriptedRunner, config: PipelineConfig) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let project = TestProject::default().write(dir.path()).unwrap();
        let runner = Arc::new(runner);
        let store = Arc::new(InMemoryArtifactStore::new());
        let sink = Arc::new(CollectingEventSink::new());
        let pipeline = PipelineBuilder::new(config, project)
            .with_runner(runner.clone())
            .with_store(store.clone())
            .with_event_sink(sink.clone())
            .build()
            .unwrap();
        Fixture {
            dir,
            runner,
            store,
            sink,
            pipeline,
        }
    }

    fn fixture(runner: ScriptedRunner) -> Fixture {
        fixture_with(runner, test_config())
    }

    fn leftover_environments(fixture: &Fixture) -> usize {
        std::fs::read_dir(fixture.dir.path().join(".distflow/work/envs"))
            .map(|entries| entries.count())
            .unwrap_or(0)
    }

    #[tokio::test]
    async fn test_supported_version_publishes_one_labelled_upload() {
        let f = fixture(ScriptedRunner::new().always("build", builds_wheel()));

        let run = f.pipeline.run("3.11").await;

        assert_run_succeeded(&run);
        assert_stages_attempted(&run, &StageName::ALL);
        let uploads = f.store.uploads();
        assert_eq!(uploads.len(), 1);
        assert!(uploads[0].label.contains("3.11"));
        assert_eq!(uploads[0].label, "wheel_3.11");
        assert_eq!(uploads[0].files[0].name, "traceguard_demo-0.3.1-py3-none-any.whl");
        assert_eq!(run.exit_code(), 0);
        assert_eq!(leftover_environments(&f), 0);
    }

    #[tokio::test]
    async fn test_unsupported_version_fails_at_provisioning() {
        let f = fixture(ScriptedRunner::new().always("build", builds_wheel()));

        let run = f.pipeline.run("2.7").await;

        assert_run_failed_at(&run, Provision, ErrorKind::UnsupportedVersion);
        assert_stages_attempted(&run, &[Provision]);
        assert_eq!(run.history(), &[PipelineState::Provisioning, PipelineState::Failed]);
        assert!(f.runner.calls().is_empty());
        assert!(!f.dir.path().join(".distflow/work/envs").exists());
        assert_eq!(run.exit_code(), 1);
    }

    #[tokio::test]
    async fn test_failing_test_stops_before_build() {
        let runner = ScriptedRunner::new()
            .always("test", ScriptedResponse::fail_with_stdout(1, ONE_FAILING_TEST))
            .always("build", builds_wheel());
        let f = fixture(runner);

        let run = f.pipeline.run("3.11").await;

        assert_run_failed_at(&run, Test, ErrorKind::TestFailure);
        assert_stages_attempted(&run, &[Provision, Install, Verify, Test]);
        assert_eq!(f.runner.call_count("build"), 0);
        assert_eq!(f.store.upload_count(), 0);
        let error = run.error().unwrap();
        assert_eq!(error.payload["failing"], serde_json::json!(["tests/test_basic.py::test_guardrail"]));
        assert_eq!(leftover_environments(&f), 0);
    }

    #[tokio::test]
    async fn test_empty_build_fails_at_publishing() {
        let f = fixture(ScriptedRunner::new());

        let run = f.pipeline.run("3.11").await;

        assert_run_failed_at(&run, Publish, ErrorKind::NoArtifactsProduced);
        assert_eq!(run.stage(Build).unwrap().status, crate::core::StageStatus::Ok);
        assert_eq!(f.store.upload_count(), 0);
    }

    #[tokio::test]
    async fn test_violation_skips_tests() {
        let runner = ScriptedRunner::new()
            .always("check:lint", ScriptedResponse::fail_with_stdout(1, "src/traceguard_demo/__init__.py:1:1: F401 unused import"));
        let f = fixture(runner);

        let run = f.pipeline.run("3.11").await;

        assert_run_failed_at(&run, Verify, ErrorKind::StaticCheckViolation);
        assert_eq!(f.runner.call_count("test"), 0);
        assert_eq!(f.runner.call_count("check"), 3);
    }

    #[tokio::test]
    async fn test_network_outage_is_retried_once() {
        let runner = ScriptedRunner::new()
            .script("install", ScriptedResponse::fail(1, "Connection refused"))
            .always("build", builds_wheel());
        let f = fixture(runner);

        let run = f.pipeline.run("3.11").await;

        assert_run_succeeded(&run);
        assert_eq!(f.runner.call_count("install"), 2);
        assert_eq!(run.stage(Install).unwrap().attempts, 2);
        assert_eq!(f.sink.events_of_type("stage.retrying").len(), 1);
    }

    #[tokio::test]
    async fn test_persistent_outage_fails_install() {
        let runner = ScriptedRunner::new()
            .always("install", ScriptedResponse::fail(1, "Max retries exceeded with url: /simple/openai/"));
        let f = fixture(runner);

        let run = f.pipeline.run("3.11").await;

        assert_run_failed_at(&run, Install, ErrorKind::NetworkUnavailable);
        assert_eq!(f.runner.call_count("install"), 2);
    }

    #[tokio::test]
    async fn test_publish_failure_is_not_retried() {
        let dir = tempfile::tempdir().unwrap();
        let project = TestProject::default().write(dir.path()).unwrap();
        let store = Arc::new(InMemoryArtifactStore::failing("503 Service Unavailable"));
        let pipeline = PipelineBuilder::new(test_config(), project)
            .with_runner(Arc::new(ScriptedRunner::new().always("build", builds_wheel())))
            .with_store(store.clone())
            .build()
            .unwrap();

        let run = pipeline.run("3.11").await;

        assert_run_failed_at(&run, Publish, ErrorKind::PublishFailure);
        assert_eq!(run.stage(Publish).unwrap().attempts, 1);
    }

    #[tokio::test]
    async fn test_unresolvable_dependencies_fail_install() {
        let dir = tempfile::tempdir().unwrap();
        let project = TestProject::default().write(dir.path()).unwrap();
        let index = StaticPackageIndex::new()
            .with_package("openai", &["0.28.0", "2.0.0"])
            .unwrap()
            .with_package("pytest", &["7.4.4"])
            .unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        let pipeline = PipelineBuilder::new(test_config(), project)
            .with_runner(runner.clone())
            .with_store(Arc::new(InMemoryArtifactStore::new()))
            .with_index(Arc::new(index))
            .build()
            .unwrap();

        let run = pipeline.run("3.11").await;

        assert_run_failed_at(&run, Install, ErrorKind::ResolutionConflict);
        assert_eq!(runner.call_count("install"), 0);
    }

    #[tokio::test]
    async fn test_stage_timeout() {
        let mut config = test_config();
        config.timeouts.test = Some(1);
        let runner = ScriptedRunner::new()
            .always("test", ScriptedResponse::ok("").with_delay(Duration::from_secs(5)));
        let f = fixture_with(runner, config);

        let run = f.pipeline.run("3.11").await;

        assert_run_failed_at(&run, Test, ErrorKind::Timeout);
        assert_eq!(f.runner.call_count("build"), 0);

        let record = run.stage(Test).unwrap();
        assert_eq!(record.commands.len(), 1);
        assert!(record.output.starts_with(&format!("$ {}", record.commands[0])));
        assert!(record.output.ends_with("# stage timed out after 1s\n"));
    }

    #[tokio::test]
    async fn test_provision_timeout_removes_environment() {
        let mut config = test_config();
        config.timeouts.provision = Some(1);
        let runner = ScriptedRunner::new()
            .always("provision", ScriptedResponse::ok("").with_delay(Duration::from_secs(3)));
        let f = fixture_with(runner, config);

        let run = f.pipeline.run("3.11").await;

        assert_run_failed_at(&run, Provision, ErrorKind::Timeout);
        assert_eq!(leftover_environments(&f), 0);
        let record = run.stage(Provision).unwrap();
        assert_eq!(record.commands.len(), 1);
        assert!(record.output.contains("timed out after 1s"));
    }

    #[tokio::test]
    async fn test_events_follow_stage_order() {
        let f = fixture(ScriptedRunner::new().always("build", builds_wheel()));

        f.pipeline.run("3.12").await;

        let mut expected = vec!["pipeline.started".to_string()];
        for _ in StageName::ALL {
            expected.push("stage.started".into());
            expected.push("stage.completed".into());
        }
        expected.push("pipeline.succeeded".into());
        assert_eq!(f.sink.event_types(), expected);
    }

    #[tokio::test]
    async fn test_failure_events() {
        let f = fixture(ScriptedRunner::new());

        f.pipeline.run("2.7").await;

        assert_eq!(
            f.sink.event_types(),
            vec!["pipeline.started", "stage.started", "stage.failed", "pipeline.failed"]
        );
        let failed = f.sink.events_of_type("stage.failed");
        let payload = failed[0].1.as_ref().unwrap();
        assert_eq!(payload["stage"], "provision");
        assert_eq!(payload["error"]["kind"], "UnsupportedVersion");
    }

    #[tokio::test]
    async fn test_source_archives_are_identical_across_runs() {
        let mut config = test_config();
        config.build.backend = BuildBackend::SourceArchive;
        let f = fixture_with(ScriptedRunner::new(), config);

        let runs = f
            .pipeline
            .run_many(&["3.11".to_string(), "3.12".to_string()])
            .await;

        for run in &runs {
            assert_run_succeeded(run);
        }
        let first = f.store.artifacts("wheel_3.11").unwrap();
        let second = f.store.artifacts("wheel_3.12").unwrap();
        assert_eq!(first[0].file_name, "traceguard_demo-0.3.1.tar.gz");
        assert_eq!(first[0].sha256, second[0].sha256);
    }

    #[tokio::test]
    async fn test_run_many_keeps_runs_independent() {
        let f = fixture(ScriptedRunner::new().always("build", builds_wheel()));
        let versions: Vec<String> = ["3.10", "2.7", "3.12"].iter().map(ToString::to_string).collect();

        let runs = f.pipeline.run_many(&versions).await;

        assert_eq!(runs.len(), 3);
        assert_run_succeeded(&runs[0]);
        assert_run_failed_at(&runs[1], Provision, ErrorKind::UnsupportedVersion);
        assert_run_succeeded(&runs[2]);
        assert_eq!(runs[0].runtime_version(), "3.10");
        assert_ne!(runs[0].run_id(), runs[2].run_id());
        let mut labels: Vec<String> = f.store.uploads().into_iter().map(|r| r.label).collect();
        labels.sort();
        assert_eq!(labels, vec!["wheel_3.10", "wheel_3.12"]);
        assert_eq!(leftover_environments(&f), 0);
    }

    #[tokio::test]
    async fn test_keep_environments() {
        let mut config = test_config();
        config.keep_environments = true;
        let f = fixture_with(ScriptedRunner::new().always("build", builds_wheel()), config);

        let run = f.pipeline.run("3.11").await;

        assert_run_succeeded(&run);
        assert_eq!(leftover_environments(&f), 1);
    }

    #[tokio::test]
    async fn test_run_report_serializes() {
        let f = fixture(ScriptedRunner::new().always("build", builds_wheel()));

        let run = f.pipeline.run("3.11").await;
        let json = run.to_json().unwrap();

        assert_eq!(json["runtime_version"], "3.11");
        assert_eq!(json["stages"].as_array().unwrap().len(), 6);
        assert_eq!(json["receipt"]["label"], "wheel_3.11");
    }
}
