// tests/conductor.rs

mod common;
use crate::common::builders::{execution_settings, replica};
use crate::common::fakes::{FakeConnector, FakeProvisioner, ProvisionCall};
use crate::common::{guard_for, init_tracing};

use std::path::Path;
use std::sync::Arc;

use tempfile::TempDir;
use toml::Value;

use exprun::control::StopSignal;
use exprun::engine::{ConductOutcome, Conductor, RunPaths, TestConductor};
use exprun::expand::TestReplica;
use exprun::fs::mock::MockFileSystem;
use exprun::lifecycle::LifecycleState;
use exprun::logging::UnitLogger;
use exprun::retry::RetryCursor;

const TEMPLATE: &str = "SERVER_HOSTS=\"\"\nCLIENT_HOSTS=\"\"\nRATE=1\n";

struct Setup {
    fs: MockFileSystem,
    provisioner: FakeProvisioner,
    connector: FakeConnector,
    stop: StopSignal,
    root: TempDir,
}

impl Setup {
    fn new() -> Self {
        init_tracing();
        let fs = MockFileSystem::new();
        fs.add_file("repo/experiments/exp/conf/config.sh", TEMPLATE);
        Self {
            fs,
            provisioner: FakeProvisioner::new(),
            connector: FakeConnector::new(),
            stop: StopSignal::new(),
            root: tempfile::tempdir().unwrap(),
        }
    }

    fn paths(&self) -> RunPaths {
        RunPaths::under(self.root.path())
    }

    fn conductor(&self, default_profile: Option<&str>) -> TestConductor {
        TestConductor::new(
            Arc::new(self.fs.clone()),
            "repo/experiments",
            default_profile.map(str::to_string),
            guard_for(self.provisioner.clone(), &self.stop),
            Arc::new(self.connector.clone()),
            Arc::new(execution_settings()),
            self.paths(),
            self.stop.clone(),
        )
    }

    fn cursor(&self) -> RetryCursor {
        RetryCursor::new(5, "execute test t-00", self.stop.clone())
    }
}

async fn conduct(conductor: &TestConductor, replica: &TestReplica, cursor: &mut RetryCursor) -> ConductOutcome {
    conductor
        .conduct(replica, cursor, UnitLogger::for_unit(&replica.id))
        .await
        .expect("conduct should not error")
}

#[tokio::test(start_paused = true)]
async fn provisions_renders_and_starts_the_lifecycle() {
    let s = Setup::new();
    let conductor = s.conductor(None);
    let mut replica = replica("t-00", "exp");
    replica.options.insert("RATE".into(), Value::Integer(300));
    let mut cursor = s.cursor();
    cursor.next_attempt().await.unwrap();

    let outcome = conduct(&conductor, &replica, &mut cursor).await;

    let handle = match outcome {
        ConductOutcome::Started(handle) => handle,
        other => panic!("expected the lifecycle to start, got {other:?}"),
    };
    assert_eq!(handle.await.unwrap(), LifecycleState::Done);

    let config_path = s.paths().working.join("t-00").join("config.sh");
    let rendered = s.fs.contents(&config_path).expect("rendered config written");
    assert_eq!(
        rendered,
        "SERVER_HOSTS=\"node1.host\"\nCLIENT_HOSTS=\"node2.host\"\nRATE=300\n"
    );
    assert_eq!(
        s.provisioner.calls()[0],
        ProvisionCall::Provision {
            profile: "small-lan".to_string(),
            name: Some("t-00".to_string()),
        }
    );
    assert_eq!(s.provisioner.terminated().len(), 1);
}

#[tokio::test]
async fn template_path_is_under_the_experiment_conf_dir() {
    let s = Setup::new();
    let conductor = s.conductor(None);

    assert_eq!(
        conductor.template_path("exp"),
        Path::new("repo/experiments/exp/conf/config.sh")
    );
}

#[tokio::test]
async fn missing_experiment_directory_is_skipped() {
    let s = Setup::new();
    let conductor = s.conductor(None);
    let mut cursor = s.cursor();

    let outcome = conduct(&conductor, &replica("t-00", "absent"), &mut cursor).await;

    assert!(matches!(outcome, ConductOutcome::Skipped));
    assert!(s.provisioner.calls().is_empty());
}

#[tokio::test]
async fn missing_template_is_skipped() {
    let s = Setup::new();
    s.fs.add_dir("repo/experiments/bare");
    let conductor = s.conductor(None);
    let mut cursor = s.cursor();

    let outcome = conduct(&conductor, &replica("t-00", "bare"), &mut cursor).await;

    assert!(matches!(outcome, ConductOutcome::Skipped));
    assert!(s.provisioner.calls().is_empty());
}

#[tokio::test]
async fn template_without_host_fields_is_skipped_before_provisioning() {
    let s = Setup::new();
    s.fs.add_file("repo/experiments/flat/conf/config.sh", "RATE=1\n");
    let conductor = s.conductor(None);
    let mut cursor = s.cursor();

    let outcome = conduct(&conductor, &replica("t-00", "flat"), &mut cursor).await;

    assert!(matches!(outcome, ConductOutcome::Skipped));
    assert!(s.provisioner.calls().is_empty());
}

#[tokio::test]
async fn option_shadowing_a_host_field_is_skipped_before_provisioning() {
    let s = Setup::new();
    let conductor = s.conductor(None);
    let mut replica = replica("t-00", "exp");
    replica
        .options
        .insert("CLIENT_HOSTS".into(), Value::String("manual".into()));
    let mut cursor = s.cursor();

    let outcome = conduct(&conductor, &replica, &mut cursor).await;

    assert!(matches!(outcome, ConductOutcome::Skipped));
    assert!(s.provisioner.calls().is_empty());
}

#[tokio::test]
async fn replica_without_any_profile_is_skipped() {
    let s = Setup::new();
    let conductor = s.conductor(None);
    let mut replica = replica("t-00", "exp");
    replica.profile = None;
    let mut cursor = s.cursor();

    let outcome = conduct(&conductor, &replica, &mut cursor).await;

    assert!(matches!(outcome, ConductOutcome::Skipped));
    assert!(s.provisioner.calls().is_empty());
}

#[tokio::test]
async fn default_profile_is_used_when_the_replica_has_none() {
    let mut s = Setup::new();
    s.provisioner = FakeProvisioner::new().with_provision_failures(1);
    let conductor = s.conductor(Some("fallback"));
    let mut replica = replica("t-00", "exp");
    replica.profile = None;
    let mut cursor = s.cursor();
    cursor.next_attempt().await.unwrap();

    let outcome = conduct(&conductor, &replica, &mut cursor).await;

    assert!(matches!(outcome, ConductOutcome::Retry));
    assert_eq!(
        s.provisioner.calls(),
        vec![ProvisionCall::Provision {
            profile: "fallback".to_string(),
            name: Some("t-00".to_string()),
        }]
    );
}

#[tokio::test]
async fn provisioning_failure_asks_for_a_retry() {
    let mut s = Setup::new();
    s.provisioner = FakeProvisioner::new().with_provision_failures(1);
    let conductor = s.conductor(None);
    let mut cursor = s.cursor();
    cursor.next_attempt().await.unwrap();

    let outcome = conduct(&conductor, &replica("t-00", "exp"), &mut cursor).await;

    assert!(matches!(outcome, ConductOutcome::Retry));
    assert!(cursor.pending_failure().cause.is_some());
    assert!(s.fs.contents(s.paths().working.join("t-00").join("config.sh")).is_none());
}

#[tokio::test]
async fn stop_prevents_provisioning() {
    let s = Setup::new();
    let conductor = s.conductor(None);
    let mut cursor = s.cursor();
    s.stop.stop();

    let err = conductor
        .conduct(&replica("t-00", "exp"), &mut cursor, UnitLogger::global())
        .await
        .unwrap_err();

    assert!(err.is_early_exit());
    assert!(s.provisioner.calls().is_empty());
}
