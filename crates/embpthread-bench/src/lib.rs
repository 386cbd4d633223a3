//! Shared setup for the embpthread benchmarks.

use std::sync::Arc;

use embpthread_core::{Runtime, RuntimeConfig, SpinPolicy};
use embpthread_osal::HostOsal;

/// A runtime on the host layer with the given spinlock strategy.
///
/// Benchmarks only run where the host layer can be set up, so a failure
/// here is reported with the runtime's error.
pub fn host_runtime(spin_policy: SpinPolicy) -> embpthread_core::Result<Runtime> {
    Runtime::init(
        Arc::new(HostOsal::new()),
        RuntimeConfig::default().with_spin_policy(spin_policy),
    )
}
