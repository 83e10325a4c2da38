// tests/guard.rs

mod common;
use crate::common::fakes::{FakeProvisioner, ProvisionCall};
use crate::common::{guard_for, init_tracing, with_timeout};

use std::time::Duration;

use exprun::control::StopSignal;
use exprun::logging::UnitLogger;
use exprun::provision::Allocation;

#[tokio::test]
async fn lease_installs_and_restores_the_unit_logger() {
    init_tracing();
    let stop = StopSignal::new();
    let fake = FakeProvisioner::new();
    let guard = guard_for(fake.clone(), &stop);

    {
        let mut lease = guard.acquire(UnitLogger::for_unit("a-00")).await.unwrap();
        assert_eq!(guard.holders(), 1);
        assert_eq!(fake.installed_unit().as_deref(), Some("a-00"));
        lease.login().await.unwrap();
    }

    assert_eq!(guard.holders(), 0);
    assert_eq!(fake.installed_unit(), None);
    assert_eq!(fake.calls(), vec![ProvisionCall::Login]);
    assert_eq!(fake.call_units(), vec![Some("a-00".to_string())]);
}

#[tokio::test]
async fn calls_are_attributed_to_the_requesting_unit() {
    let stop = StopSignal::new();
    let fake = FakeProvisioner::new();
    let guard = guard_for(fake.clone(), &stop);

    let allocation = guard
        .provision(UnitLogger::for_unit("a-00"), "small-lan", Some("a-00"))
        .await
        .unwrap();
    guard
        .terminate(UnitLogger::for_unit("b-00"), &allocation)
        .await
        .unwrap();

    assert_eq!(
        fake.calls(),
        vec![
            ProvisionCall::Provision {
                profile: "small-lan".to_string(),
                name: Some("a-00".to_string()),
            },
            ProvisionCall::Terminate {
                uuid: allocation.uuid.clone(),
            },
        ]
    );
    assert_eq!(
        fake.call_units(),
        vec![Some("a-00".to_string()), Some("b-00".to_string())]
    );
}

#[tokio::test(start_paused = true)]
async fn concurrent_callers_are_serialized() {
    init_tracing();
    let stop = StopSignal::new();
    let fake = FakeProvisioner::new().with_delay(Duration::from_secs(3));
    let guard = guard_for(fake.clone(), &stop);

    let mut handles = Vec::new();
    for i in 0..4 {
        let guard = guard.clone();
        handles.push(tokio::spawn(async move {
            let id = format!("t-{i:02}");
            guard
                .provision(UnitLogger::for_unit(&id), "small-lan", Some(&id))
                .await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(fake.calls().len(), 4);
    assert_eq!(fake.max_active(), 1);
    assert_eq!(guard.holders(), 0);
}

#[tokio::test]
async fn stop_refuses_new_leases_without_waiting() {
    let stop = StopSignal::new();
    let fake = FakeProvisioner::new();
    let guard = guard_for(fake.clone(), &stop);

    // Hold the lease so a waiting acquire would block forever.
    let _held = guard.acquire(UnitLogger::global()).await.unwrap();
    stop.stop();

    let err = with_timeout(guard.acquire(UnitLogger::for_unit("late")))
        .await
        .err()
        .expect("acquire after stop must fail");
    assert!(err.is_early_exit());

    let allocation = Allocation::new("uuid-9", "late", vec!["h".into()]);
    let err = with_timeout(guard.terminate(UnitLogger::global(), &allocation))
        .await
        .unwrap_err();
    assert!(err.is_early_exit());
    assert!(fake.calls().is_empty());
}
