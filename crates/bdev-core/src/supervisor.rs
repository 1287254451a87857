//! Fatal-error escalation.
//!
//! Background threads never terminate the process themselves. When the
//! completion thread hits an unrecoverable condition (an op stuck past the
//! suicide timeout, or the kernel refusing to report completions) it stops
//! and hands the error to the device's `Supervisor`. The production
//! supervisor aborts so external recovery (restart, failover) can proceed;
//! tests install one that records the error instead.

use crate::error::BdevError;

pub trait Supervisor: Send + Sync {
    /// Called once, from the failing background thread, with an error of
    /// kind [`ErrorKind::Fatal`](crate::error::ErrorKind::Fatal).
    fn on_fatal(&self, device: &str, err: &BdevError);
}

impl<F> Supervisor for F
where
    F: Fn(&str, &BdevError) + Send + Sync,
{
    fn on_fatal(&self, device: &str, err: &BdevError) {
        self(device, err)
    }
}
