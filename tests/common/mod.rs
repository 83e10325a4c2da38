#![allow(dead_code)]

pub use exprun_test_utils::{builders, fakes, init_tracing, with_timeout};

use std::sync::Arc;

use exprun::control::StopSignal;
use exprun::provision::{Provisioner, ProvisionGuard};

/// Guard around `provisioner` sharing `stop`.
pub fn guard_for(provisioner: impl Provisioner + 'static, stop: &StopSignal) -> Arc<ProvisionGuard> {
    Arc::new(ProvisionGuard::new(Box::new(provisioner), stop.clone()))
}
