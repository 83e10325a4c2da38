// tests/shutdown.rs

use std::time::Duration;

use exprun::control::StopSignal;
use exprun::shutdown::{InterruptAction, InterruptState};

#[test]
fn first_interrupt_asks_for_confirmation() {
    let mut state = InterruptState::new();

    assert_eq!(state.on_interrupt(), InterruptAction::Prompt);
    assert!(state.is_confirming());
    assert!(!state.is_stopping());
}

#[test]
fn yes_stops_and_anything_else_resumes() {
    let mut state = InterruptState::new();
    state.on_interrupt();
    assert_eq!(state.on_answer("Y\n"), InterruptAction::Stop);
    assert!(state.is_stopping());

    let mut state = InterruptState::new();
    state.on_interrupt();
    assert_eq!(state.on_answer("no"), InterruptAction::Resume);
    assert!(!state.is_confirming());
    assert!(!state.is_stopping());

    // A declined stop can be asked for again.
    assert_eq!(state.on_interrupt(), InterruptAction::Prompt);
}

#[test]
fn second_interrupt_while_confirming_forces_the_stop() {
    let mut state = InterruptState::new();
    state.on_interrupt();

    assert_eq!(state.on_interrupt(), InterruptAction::ForceStop);
    assert!(state.is_stopping());
    assert_eq!(state.on_interrupt(), InterruptAction::Ignore);
}

#[test]
fn every_stop_is_confirmed_or_forced() {
    let mut state = InterruptState::new();

    assert_eq!(state.on_interrupt(), InterruptAction::Prompt);
    assert!(!state.is_stopping());
    assert_eq!(state.on_answer("y"), InterruptAction::Stop);
    assert_eq!(state.on_answer("y"), InterruptAction::Ignore);
}

#[test]
fn stray_answers_are_ignored() {
    let mut state = InterruptState::new();
    assert_eq!(state.on_answer("y"), InterruptAction::Ignore);
    assert!(!state.is_stopping());
}

#[tokio::test(start_paused = true)]
async fn stop_signal_wakes_every_waiter() {
    let stop = StopSignal::new();

    let waiters: Vec<_> = (0..3)
        .map(|_| {
            let stop = stop.clone();
            tokio::spawn(async move { stop.wait(Duration::from_secs(3600)).await })
        })
        .collect();

    tokio::time::sleep(Duration::from_secs(1)).await;
    stop.stop();

    for waiter in waiters {
        assert!(waiter.await.unwrap());
    }
    assert!(stop.is_stopping());
}

#[tokio::test(start_paused = true)]
async fn wait_without_stop_runs_to_completion() {
    let stop = StopSignal::new();
    assert!(!stop.wait(Duration::from_secs(5)).await);
}
