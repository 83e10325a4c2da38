//! Shared helpers for the `exprun` integration tests: config builders and
//! scripted fakes for every external collaborator.

pub mod builders;
pub mod fakes;

use std::future::Future;
use std::sync::Once;
use std::time::Duration;

use tracing_subscriber::{fmt, EnvFilter};

static INIT: Once = Once::new();

/// Install a test-captured subscriber once per test binary.
///
/// Output only shows for failing tests unless run with `--nocapture`.
/// The level comes from `EXPRUN_LOG` (e.g. `EXPRUN_LOG=debug cargo test`),
/// default `info`.
pub fn init_tracing() {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_env("EXPRUN_LOG").unwrap_or_else(|_| EnvFilter::new("info"));

        fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .with_target(true)
            .init();
    });
}

/// Fail the test if `f` has not resolved within five (real or paused) seconds.
pub async fn with_timeout<F, T>(f: F) -> T
where
    F: Future<Output = T>,
{
    tokio::time::timeout(Duration::from_secs(5), f)
        .await
        .expect("test timed out after 5 seconds")
}
