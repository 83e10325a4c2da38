// tests/retry_cursor.rs

mod common;
use crate::common::init_tracing;

use std::time::Duration;

use tokio::time::Instant;

use exprun::control::StopSignal;
use exprun::errors::ExprunError;
use exprun::retry::{attempt_ordinal, Advance, BackoffPolicy, RetryCursor, TaskDescription};

fn cursor(max_attempts: u32, base: Duration, stop: &StopSignal) -> RetryCursor {
    RetryCursor::new(max_attempts, "contact the portal", stop.clone())
        .with_backoff(base, BackoffPolicy::default())
}

#[test]
fn quadratic_backoff_grows_with_the_square_of_the_index() {
    let policy = BackoffPolicy::Quadratic { factor: 0.5 };
    let base = Duration::from_secs(2);

    assert_eq!(policy.delay(0, base), Duration::from_secs(2));
    assert_eq!(policy.delay(1, base), Duration::from_secs(3));
    assert_eq!(policy.delay(2, base), Duration::from_secs(6));
    assert_eq!(policy.delay(4, base), Duration::from_secs(18));
}

#[test]
fn linear_and_constant_backoff() {
    let base = Duration::from_secs(10);
    assert_eq!(
        BackoffPolicy::Linear { factor: 1.0 }.delay(3, base),
        Duration::from_secs(40)
    );
    assert_eq!(BackoffPolicy::Constant.delay(7, base), base);
}

#[test]
fn ordinals_follow_the_last_digit() {
    assert_eq!(attempt_ordinal(1), "1st attempt");
    assert_eq!(attempt_ordinal(2), "2nd attempt");
    assert_eq!(attempt_ordinal(3), "3rd attempt");
    assert_eq!(attempt_ordinal(4), "4th attempt");
    // Suffix is chosen by index % 10 only.
    assert_eq!(attempt_ordinal(11), "11st attempt");
}

#[test]
fn task_description_keeps_both_phrasings() {
    let task = TaskDescription::with_external("copy to host 10.0.0.1", "copy to remote");
    assert_eq!(task.internal(), "copy to host 10.0.0.1");
    assert_eq!(task.external(), Some("copy to remote"));

    let plain = TaskDescription::from("clone repo");
    assert_eq!(plain.external(), None);
}

#[tokio::test(start_paused = true)]
async fn yields_exactly_max_attempts_then_fails() {
    init_tracing();
    let stop = StopSignal::new();
    let mut cursor = cursor(3, Duration::from_secs(1), &stop);
    let started = Instant::now();

    let mut indices = Vec::new();
    let err = loop {
        match cursor.next_attempt().await {
            Ok(attempt) => {
                indices.push(attempt.index());
                cursor.failed("still unreachable");
            }
            Err(err) => break err,
        }
    };

    assert_eq!(indices, vec![0, 1, 2]);
    match err {
        ExprunError::OperationFailed { task, attempts } => {
            assert_eq!(task, "contact the portal");
            assert_eq!(attempts, "after 3 attempts");
        }
        other => panic!("expected OperationFailed, got {other:?}"),
    }
    // 1.5 s before the second attempt, 3 s before the third.
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(4500), "waited {elapsed:?}");
    assert!(elapsed < Duration::from_secs(5), "waited {elapsed:?}");
}

#[tokio::test(start_paused = true)]
async fn first_attempt_does_not_wait() {
    let stop = StopSignal::new();
    let mut cursor = cursor(5, Duration::from_secs(60), &stop);
    let started = Instant::now();

    let attempt = cursor.next_attempt().await.expect("first attempt");
    assert!(attempt.is_first());
    assert_eq!(started.elapsed(), Duration::ZERO);
    assert_eq!(cursor.index(), 0);
}

#[tokio::test(start_paused = true)]
async fn exhausted_cursor_stays_exhausted() {
    let stop = StopSignal::new();
    let mut cursor = cursor(1, Duration::from_secs(1), &stop);

    assert!(matches!(cursor.advance().await, Advance::Attempt(_)));
    assert!(matches!(cursor.advance().await, Advance::Exhausted));
    assert!(matches!(cursor.advance().await, Advance::Exhausted));
}

#[tokio::test(start_paused = true)]
async fn stop_during_a_long_backoff_returns_early_exit_promptly() {
    init_tracing();
    let stop = StopSignal::new();
    let mut cursor = cursor(5, Duration::from_secs(600), &stop);

    cursor.next_attempt().await.expect("first attempt");
    cursor.failed("portal unavailable");

    let stopper = stop.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        stopper.stop();
    });

    let started = Instant::now();
    let err = cursor.next_attempt().await.unwrap_err();
    assert!(err.is_early_exit());
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[tokio::test(start_paused = true)]
async fn stop_before_advancing_short_circuits_the_wait() {
    let stop = StopSignal::new();
    let mut cursor = cursor(5, Duration::from_secs(30), &stop);
    cursor.next_attempt().await.expect("first attempt");

    stop.stop();
    assert!(matches!(cursor.advance().await, Advance::Stopped));
}

#[tokio::test(start_paused = true)]
async fn recorded_failure_is_cleared_after_each_retry() {
    let stop = StopSignal::new();
    let mut cursor = cursor(3, Duration::from_millis(10), &stop);

    cursor.next_attempt().await.expect("first attempt");
    cursor.failed_with("exit code (1)", anyhow::anyhow!("scp failed"));
    assert_eq!(
        cursor.pending_failure().message.as_deref(),
        Some("exit code (1)")
    );
    assert_eq!(cursor.pending_failure().cause.as_deref(), Some("scp failed"));

    cursor.next_attempt().await.expect("second attempt");
    assert_eq!(cursor.pending_failure().message, None);
    assert_eq!(cursor.pending_failure().cause, None);
}
