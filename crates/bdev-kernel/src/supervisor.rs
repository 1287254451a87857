//! Default fatal-error handling.

use bdev_core::error::BdevError;
use bdev_core::supervisor::Supervisor;

/// Logs the error and aborts the process.
///
/// A device whose I/O has hung cannot be trusted to make progress; crashing
/// hands recovery to whatever restarts the process.
#[derive(Debug, Default, Clone, Copy)]
pub struct AbortSupervisor;

impl Supervisor for AbortSupervisor {
    fn on_fatal(&self, device: &str, err: &BdevError) {
        tracing::error!(device, error = %err, kind = ?err.kind(), "fatal block device error, aborting");
        std::process::abort();
    }
}
