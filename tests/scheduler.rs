// tests/scheduler.rs

mod common;
use crate::common::builders::replica;
use crate::common::fakes::{FakeConductor, Scripted};
use crate::common::init_tracing;

use std::time::Duration;

use exprun::control::StopSignal;
use exprun::engine::Scheduler;
use exprun::expand::TestReplica;
use exprun::lifecycle::LifecycleState;

fn replicas(n: usize) -> Vec<TestReplica> {
    (0..n).map(|i| replica(&format!("t-{i:02}"), "exp")).collect()
}

fn scheduler(conductor: &FakeConductor, max: usize, stop: &StopSignal) -> Scheduler<FakeConductor> {
    Scheduler::new(conductor.clone(), max, stop.clone()).with_retry_backoff(Duration::from_secs(1))
}

#[tokio::test(start_paused = true)]
async fn never_exceeds_the_concurrency_limit() {
    init_tracing();
    let stop = StopSignal::new();
    let conductor = FakeConductor::new(Duration::from_secs(10));

    let summary = scheduler(&conductor, 2, &stop).run(replicas(6)).await;

    assert_eq!(summary.started, 6);
    assert_eq!(summary.count(LifecycleState::Done), 6);
    assert_eq!(conductor.max_running(), 2);
    assert_eq!(conductor.running(), 0);
    assert!(!summary.stopped);
}

#[tokio::test(start_paused = true)]
async fn starts_replicas_in_expansion_order() {
    let stop = StopSignal::new();
    let conductor = FakeConductor::new(Duration::from_secs(1));

    scheduler(&conductor, 3, &stop).run(replicas(4)).await;

    assert_eq!(conductor.conducted(), vec!["t-00", "t-01", "t-02", "t-03"]);
}

#[tokio::test(start_paused = true)]
async fn a_limit_of_one_runs_sequentially() {
    let stop = StopSignal::new();
    let conductor = FakeConductor::new(Duration::from_secs(5));

    let summary = scheduler(&conductor, 1, &stop).run(replicas(3)).await;

    assert_eq!(conductor.max_running(), 1);
    assert_eq!(conductor.finished(), vec!["t-00", "t-01", "t-02"]);
    let joined: Vec<&str> = summary.finished.iter().map(|(id, _)| id.as_str()).collect();
    assert_eq!(joined, vec!["t-00", "t-01", "t-02"]);
}

#[tokio::test(start_paused = true)]
async fn zero_limit_is_treated_as_one() {
    let stop = StopSignal::new();
    let conductor = FakeConductor::new(Duration::from_secs(1));

    let summary = scheduler(&conductor, 0, &stop).run(replicas(2)).await;

    assert_eq!(summary.started, 2);
    assert_eq!(conductor.max_running(), 1);
}

#[tokio::test(start_paused = true)]
async fn transient_failures_are_retried() {
    init_tracing();
    let stop = StopSignal::new();
    let conductor = FakeConductor::new(Duration::from_secs(1))
        .script("t-00", &[Scripted::Retry, Scripted::Retry]);

    let summary = scheduler(&conductor, 1, &stop).run(replicas(2)).await;

    assert_eq!(summary.started, 2);
    assert_eq!(summary.failed, 0);
    assert_eq!(conductor.conducted(), vec!["t-00", "t-00", "t-00", "t-01"]);
}

#[tokio::test(start_paused = true)]
async fn replica_is_abandoned_after_five_attempts() {
    init_tracing();
    let stop = StopSignal::new();
    let conductor = FakeConductor::new(Duration::from_secs(1)).script("t-00", &[Scripted::Retry; 5]);

    let summary = scheduler(&conductor, 1, &stop).run(replicas(2)).await;

    assert_eq!(summary.failed, 1);
    assert_eq!(summary.started, 1);
    let attempts = conductor.conducted().iter().filter(|id| *id == "t-00").count();
    assert_eq!(attempts, 5);
    assert_eq!(conductor.finished(), vec!["t-01"]);
}

#[tokio::test(start_paused = true)]
async fn skipped_and_erroring_replicas_do_not_stop_the_run() {
    init_tracing();
    let stop = StopSignal::new();
    let conductor = FakeConductor::new(Duration::from_secs(1))
        .script("t-00", &[Scripted::Skip])
        .script("t-01", &[Scripted::Error]);

    let summary = scheduler(&conductor, 2, &stop).run(replicas(3)).await;

    assert_eq!(summary.skipped, 1);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.started, 1);
    assert_eq!(conductor.finished(), vec!["t-02"]);
}

#[tokio::test(start_paused = true)]
async fn nothing_starts_once_stopped() {
    let stop = StopSignal::new();
    stop.stop();
    let conductor = FakeConductor::new(Duration::from_secs(1));

    let summary = scheduler(&conductor, 2, &stop).run(replicas(3)).await;

    assert!(summary.stopped);
    assert_eq!(summary.started, 0);
    assert!(conductor.conducted().is_empty());
}

#[tokio::test(start_paused = true)]
async fn stop_mid_run_drains_running_replicas() {
    init_tracing();
    let stop = StopSignal::new();
    let conductor = FakeConductor::new(Duration::from_secs(10));

    let stopper = stop.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(15)).await;
        stopper.stop();
    });

    let summary = scheduler(&conductor, 2, &stop).run(replicas(8)).await;

    assert!(summary.stopped);
    assert!(summary.started < 8);
    assert_eq!(summary.finished.len(), summary.started);
    assert_eq!(conductor.running(), 0);
}

#[tokio::test(start_paused = true)]
async fn stop_during_retry_backoff_ends_the_run() {
    let stop = StopSignal::new();
    let conductor = FakeConductor::new(Duration::from_secs(1)).script("t-00", &[Scripted::Retry]);
    let scheduler = Scheduler::new(conductor.clone(), 1, stop.clone())
        .with_retry_backoff(Duration::from_secs(600));

    let stopper = stop.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        stopper.stop();
    });

    let summary = scheduler.run(replicas(2)).await;

    assert!(summary.stopped);
    assert_eq!(summary.started, 0);
    assert_eq!(conductor.conducted(), vec!["t-00"]);
}
