//! The completion thread (`bdev-aio`).
//!
//! One per device. Each iteration:
//!
//! 1. Reap up to `aio_reap_max` completions, waiting at most `aio_poll`
//!    so the stall check runs even when nothing completes.
//! 2. Feed the queue length / latency to the metrics aggregator.
//! 3. Hand every completed op back to its `IoContext`.
//! 4. Check the oldest in-flight op against the warn / suicide thresholds.
//! 5. Exit once stop was requested and nothing is in flight.
//!
//! A fatal stall or an unexpected reap error ends the loop; the thread
//! marks the device unhealthy and hands the error to the `Supervisor`.

use crate::kernel_device::DeviceInner;

use bdev_core::error::{BdevError, Result};
use bdev_core::io_context::IoContext;
use bdev_core::op::{AioOp, IoEvent};
use bdev_core::stall::StallLink;

use std::io;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

/// An op while the kernel owns it. Boxed; the box address is the token
/// carried through the engine.
pub(crate) struct InflightOp {
    pub op: AioOp,
    pub ctx: Arc<IoContext>,
}

impl InflightOp {
    /// Leak into a raw pointer whose address doubles as the engine token.
    pub fn into_raw(self) -> *mut InflightOp {
        Box::into_raw(Box::new(self))
    }

    /// Reclaim an op from its token.
    ///
    /// # Safety
    /// `token` must come from [`into_raw`](Self::into_raw) and be reclaimed
    /// exactly once.
    pub unsafe fn from_token(token: u64) -> Box<InflightOp> {
        Box::from_raw(token as *mut InflightOp)
    }
}

pub(crate) fn spawn(dev: Arc<DeviceInner>) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("bdev-aio".into())
        .spawn(move || {
            let span = tracing::info_span!("bdev-aio", device = %dev.name);
            let _enter = span.enter();
            tracing::debug!("completion thread start");
            match completion_loop(&dev) {
                Ok(()) => tracing::debug!("completion thread exit"),
                Err(err) => {
                    dev.healthy.store(false, Ordering::Release);
                    tracing::error!(error = %err, "completion thread failed");
                    dev.supervisor.on_fatal(&dev.name, &err);
                }
            }
        })
}

fn completion_loop(dev: &DeviceInner) -> Result<()> {
    let mut events = vec![IoEvent::EMPTY; dev.config.aio_reap_max];
    let mut warned: Option<StallLink> = None;

    loop {
        // ── Step 1: Reap ──
        let batch = dev
            .queue
            .get_next_completed(dev.config.aio_poll, &mut events)?;

        // ── Step 2: Metrics ──
        if batch.count > 0 {
            dev.metrics.observe(batch.queue_length, batch.latency);
        }

        // ── Step 3: Return ops to their contexts ──
        for ev in &events[..batch.count] {
            // Safety: every token in flight came from InflightOp::into_raw
            // in aio_submit and is reported exactly once.
            let inflight = unsafe { InflightOp::from_token(ev.token) };
            finish(dev, *inflight, ev.result);
        }

        // ── Step 4: Stall detection ──
        check_stall(dev, &mut warned, Instant::now())?;

        // ── Step 5: Shutdown ──
        if dev.stop.load(Ordering::Acquire) && dev.queue.ops_in_flight() == 0 {
            return Ok(());
        }
    }
}

fn finish(dev: &DeviceInner, inflight: InflightOp, res: i64) {
    let InflightOp { mut op, ctx } = inflight;

    if let Some(link) = op.link {
        dev.stall_lock().unlink(link);
    }
    if let Some(set) = &dev.debug_inflight {
        set.lock()
            .unwrap_or_else(|e| e.into_inner())
            .erase(op.offset, op.len() as u64);
    }

    let result = if res >= 0 && res as usize != op.len() {
        tracing::error!(
            offset = op.offset,
            expected = op.len(),
            actual = res,
            "short aio transfer"
        );
        -(libc::EIO as i64)
    } else {
        res
    };
    op.mark_completed(result);

    if result < 0 {
        tracing::error!(
            offset = op.offset,
            len = op.len(),
            opcode = ?op.opcode,
            errno = -result,
            "aio completed with error"
        );
        if dev.healthy.swap(false, Ordering::AcqRel) {
            tracing::error!("device marked unhealthy");
        }
    }
    ctx.complete(op);
}

/// Compare the oldest in-flight op against both thresholds. The warning
/// fires once per oldest op; a fatal stall ends the completion loop.
pub(crate) fn check_stall(
    dev: &DeviceInner,
    warned: &mut Option<StallLink>,
    now: Instant,
) -> Result<()> {
    let Some((link, submitted)) = dev.stall_lock().oldest() else {
        return Ok(());
    };
    let age = now.saturating_duration_since(submitted);

    let suicide = dev.config.aio_op_suicide_timeout;
    if !suicide.is_zero() && age >= suicide {
        tracing::error!(
            age_ms = age.as_millis() as u64,
            in_flight = dev.queue.ops_in_flight(),
            "aio stalled past suicide timeout"
        );
        return Err(BdevError::FatalStall {
            age,
            threshold: suicide,
        });
    }

    let warn_after = dev.config.aio_op_timeout;
    if !warn_after.is_zero() && age >= warn_after && *warned != Some(link) {
        tracing::warn!(
            age_ms = age.as_millis() as u64,
            in_flight = dev.queue.ops_in_flight(),
            "stalled aio"
        );
        *warned = Some(link);
    }
    Ok(())
}
