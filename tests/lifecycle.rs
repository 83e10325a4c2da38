// tests/lifecycle.rs

mod common;
use crate::common::builders::{execution_settings, replica};
use crate::common::fakes::{FakeConnector, FakeProvisioner};
use crate::common::{guard_for, init_tracing};

use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tempfile::TempDir;
use tracing::Level;

use exprun::control::StopSignal;
use exprun::lifecycle::{clone_commands, Lifecycle, LifecycleState, ReplicaPaths};
use exprun::logging::UnitLogger;
use exprun::provision::Allocation;
use exprun::remote::{Transfer, TransferDirection};

struct Harness {
    provisioner: FakeProvisioner,
    connector: FakeConnector,
    stop: StopSignal,
    results_dir: TempDir,
}

impl Harness {
    fn new(connector: FakeConnector) -> Self {
        init_tracing();
        Self {
            provisioner: FakeProvisioner::new(),
            connector,
            stop: StopSignal::new(),
            results_dir: tempfile::tempdir().unwrap(),
        }
    }

    fn results_path(&self) -> PathBuf {
        self.results_dir.path().join("results").join("t-00.tar.gz")
    }

    fn lifecycle(&self, hosts: &[&str]) -> Lifecycle {
        let allocation = Allocation::new(
            "uuid-7",
            "t-00",
            hosts.iter().map(|h| h.to_string()).collect(),
        );
        Lifecycle::new(
            replica("t-00", "exp"),
            allocation,
            guard_for(self.provisioner.clone(), &self.stop),
            Arc::new(self.connector.clone()),
            Arc::new(execution_settings()),
            ReplicaPaths {
                config: PathBuf::from("working/t-00/config.sh"),
                results: self.results_path(),
            },
            self.stop.clone(),
            UnitLogger::for_unit("t-00"),
        )
    }
}

const HOSTS: &[&str] = &["exec.host", "node1.host"];

#[test]
fn clone_commands_pin_the_branch_when_given() {
    assert_eq!(
        clone_commands("git@example.com:lab/exp.git", None),
        vec![
            "sudo rm -rf repo".to_string(),
            "git clone \"git@example.com:lab/exp.git\" repo".to_string(),
        ]
    );
    assert_eq!(
        clone_commands("git@example.com:lab/exp.git", Some("dev"))[1],
        "git clone --single-branch --branch \"dev\" \"git@example.com:lab/exp.git\" repo"
    );
}

#[tokio::test(start_paused = true)]
async fn runs_every_stage_and_releases_the_allocation() {
    let h = Harness::new(FakeConnector::new());

    let state = h.lifecycle(HOSTS).run().await;

    assert_eq!(state, LifecycleState::Done);
    assert_eq!(
        h.connector.transfers(),
        vec![
            (
                "exec.host".to_string(),
                Transfer::upload("id_rsa", ".ssh/id_rsa")
            ),
            (
                "exec.host".to_string(),
                Transfer::upload("working/t-00/config.sh", "config.sh")
            ),
            (
                "exec.host".to_string(),
                Transfer::download("repo/experiments/exp/results.tar.gz", h.results_path())
            ),
        ]
    );
    assert_eq!(
        h.connector.commands(),
        vec![
            "sudo rm -rf repo",
            "git clone \"https://example.com/experiments.git\" repo",
            "cp config.sh repo/experiments/exp/conf/config.sh",
            "cd repo/experiments/exp",
            "./scripts/run.sh",
        ]
    );
    assert_eq!(h.connector.opened(), 1);
    assert_eq!(h.connector.closed(), 1);
    assert_eq!(h.provisioner.terminated(), vec!["uuid-7".to_string()]);
    assert_eq!(h.provisioner.call_units(), vec![Some("t-00".to_string())]);
    assert!(h.results_path().parent().unwrap().is_dir());
}

#[tokio::test(start_paused = true)]
async fn failed_setup_still_releases_the_allocation() {
    let h = Harness::new(FakeConnector::new().with_transfer_codes(&[1; 10]));

    let state = h.lifecycle(HOSTS).run().await;

    assert_eq!(state, LifecycleState::Failed);
    assert_eq!(h.connector.transfers().len(), 10);
    assert_eq!(h.connector.opened(), 0);
    assert_eq!(h.provisioner.terminated(), vec!["uuid-7".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn failing_clone_is_retried_on_the_same_session() {
    let h = Harness::new(FakeConnector::new().failing_command("git clone", 2));

    let state = h.lifecycle(HOSTS).run().await;

    assert_eq!(state, LifecycleState::Done);
    let clones = h
        .connector
        .commands()
        .iter()
        .filter(|c| c.starts_with("git clone"))
        .count();
    assert_eq!(clones, 3);
    assert_eq!(h.connector.opened(), 1);
}

#[tokio::test(start_paused = true)]
async fn dropped_session_reconnects_and_restarts_the_stage() {
    let h = Harness::new(FakeConnector::new().with_dropped_reads(1));

    let state = h.lifecycle(HOSTS).run().await;

    assert_eq!(state, LifecycleState::Done);
    assert_eq!(h.connector.opened(), 2);
    assert_eq!(h.connector.closed(), 2);
    let removals = h
        .connector
        .commands()
        .iter()
        .filter(|c| c.as_str() == "sudo rm -rf repo")
        .count();
    assert_eq!(removals, 2);
}

#[tokio::test(start_paused = true)]
async fn exhausted_session_budget_restarts_the_execute_stage() {
    let h = Harness::new(FakeConnector::new().with_open_failures(10));

    let state = h.lifecycle(HOSTS).run().await;

    assert_eq!(state, LifecycleState::Done);
    assert_eq!(h.connector.open_attempts(), 11);
    assert_eq!(h.connector.opened(), 1);
    assert_eq!(h.provisioner.terminated(), vec!["uuid-7".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn unreachable_host_fails_after_every_execute_attempt() {
    let h = Harness::new(FakeConnector::new().with_open_failures(50));

    let state = h.lifecycle(HOSTS).run().await;

    assert_eq!(state, LifecycleState::Failed);
    assert_eq!(h.connector.open_attempts(), 50);
    assert_eq!(h.connector.opened(), 0);
    assert_eq!(h.provisioner.terminated(), vec!["uuid-7".to_string()]);
}

#[derive(Clone, Default)]
struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

impl CapturedLogs {
    fn text(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl io::Write for CapturedLogs {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn failing_command_is_named_in_the_retry_warning() {
    let h = Harness::new(FakeConnector::new().failing_command("git clone", 1));
    let logs = CapturedLogs::default();
    let writer = logs.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(move || writer.clone())
        .with_ansi(false)
        .with_max_level(Level::WARN)
        .finish();
    let _guard = tracing::subscriber::set_default(subscriber);

    let state = h.lifecycle(HOSTS).run().await;

    assert_eq!(state, LifecycleState::Done);
    let text = logs.text();
    assert!(
        text.contains(
            "[command: git clone \"https://example.com/experiments.git\" repo] after the 1st attempt"
        ),
        "warning should name the failed command, got:\n{text}"
    );
    assert!(text.contains("on host exec.host"), "got:\n{text}");
    assert!(text.contains("on remote"), "got:\n{text}");
}

#[tokio::test(start_paused = true)]
async fn long_running_script_is_streamed_without_interrupts() {
    let h = Harness::new(FakeConnector::new().slow_command("./scripts/run.sh", 4));

    let state = h.lifecycle(HOSTS).run().await;

    assert_eq!(state, LifecycleState::Done);
    assert_eq!(h.connector.interrupts(), 0);
}

#[tokio::test(start_paused = true)]
async fn script_failure_only_warns() {
    let h = Harness::new(FakeConnector::new().failing_command("./scripts/run.sh", 1));

    let state = h.lifecycle(HOSTS).run().await;

    assert_eq!(state, LifecycleState::Done);
    let runs = h
        .connector
        .commands()
        .iter()
        .filter(|c| c.as_str() == "./scripts/run.sh")
        .count();
    assert_eq!(runs, 1);
}

#[tokio::test(start_paused = true)]
async fn missing_results_do_not_fail_the_replica() {
    let h = Harness::new(FakeConnector::new().with_transfer_codes(&[0, 0, 1, 1, 1, 1, 1]));

    let state = h.lifecycle(HOSTS).run().await;

    assert_eq!(state, LifecycleState::Done);
    let downloads = h
        .connector
        .transfers()
        .iter()
        .filter(|(_, t)| t.direction == TransferDirection::Download)
        .count();
    assert_eq!(downloads, 5);
    assert_eq!(h.provisioner.terminated(), vec!["uuid-7".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn allocation_without_hosts_is_released_and_fails() {
    let h = Harness::new(FakeConnector::new());

    let state = h.lifecycle(&[]).run().await;

    assert_eq!(state, LifecycleState::Failed);
    assert!(h.connector.transfers().is_empty());
    assert_eq!(h.provisioner.terminated(), vec!["uuid-7".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn stop_skips_termination_and_exits_early() {
    let h = Harness::new(FakeConnector::new());
    h.stop.stop();

    let state = h.lifecycle(HOSTS).run().await;

    assert_eq!(state, LifecycleState::EarlyExit);
    assert!(h.provisioner.terminated().is_empty());
}

#[tokio::test(start_paused = true)]
async fn termination_failure_is_swallowed() {
    let mut h = Harness::new(FakeConnector::new());
    h.provisioner = FakeProvisioner::new().failing_terminate();

    let state = h.lifecycle(HOSTS).run().await;

    assert_eq!(state, LifecycleState::Done);
    assert_eq!(h.provisioner.terminated(), vec!["uuid-7".to_string()]);
}
