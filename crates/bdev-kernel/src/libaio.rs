//! `LibAioEngine` — default `AioEngine` implementation.
//!
//! Linux native AIO through the raw `io_setup` / `io_submit` /
//! `io_getevents` / `io_destroy` syscalls. No libaio.so dependency; the
//! iocb and io_event layouts are mirrored here from `<linux/aio_abi.h>`.
//!
//! Native AIO is only truly asynchronous on `O_DIRECT` descriptors. On a
//! buffered descriptor `io_submit` performs the I/O inline, which is still
//! correct, just slower.

use bdev_core::engine::AioEngine;
use bdev_core::error::{BdevError, Result};
use bdev_core::op::{AioOpcode, IoEvent, IoRequest};

use nix::errno::Errno;
use std::time::Duration;

/// Kernel AIO context handle (`aio_context_t`).
type AioContext = libc::c_ulong;

const IOCB_CMD_PREAD: u16 = 0;
const IOCB_CMD_PWRITE: u16 = 1;

/// `struct iocb`. 64 bytes; `aio_key` / `aio_rw_flags` swap on big-endian.
#[repr(C)]
#[derive(Default)]
#[allow(dead_code)]
struct Iocb {
    aio_data: u64,
    #[cfg(target_endian = "little")]
    aio_key: u32,
    #[cfg(target_endian = "little")]
    aio_rw_flags: i32,
    #[cfg(target_endian = "big")]
    aio_rw_flags: i32,
    #[cfg(target_endian = "big")]
    aio_key: u32,
    aio_lio_opcode: u16,
    aio_reqprio: i16,
    aio_fildes: u32,
    aio_buf: u64,
    aio_nbytes: u64,
    aio_offset: i64,
    aio_reserved2: u64,
    aio_flags: u32,
    aio_resfd: u32,
}

/// `struct io_event`.
#[repr(C)]
#[derive(Clone, Copy, Default)]
#[allow(dead_code)]
struct RawEvent {
    data: u64,
    obj: u64,
    res: i64,
    res2: i64,
}

pub struct LibAioEngine {
    ctx: AioContext,
    depth: usize,
}

impl LibAioEngine {
    /// Create a kernel AIO context able to hold `depth` requests.
    ///
    /// `EAGAIN` here means the system-wide `fs.aio-max-nr` limit is reached.
    pub fn new(depth: usize) -> Result<Self> {
        let mut ctx: AioContext = 0;
        let ret = unsafe {
            libc::syscall(
                libc::SYS_io_setup,
                depth as libc::c_long,
                &mut ctx as *mut AioContext,
            )
        };
        if ret < 0 {
            return Err(BdevError::Resource {
                what: "aio contexts",
                errno: Errno::last(),
            });
        }
        tracing::debug!(depth, "io_setup");
        Ok(Self { ctx, depth })
    }

    fn iocb(req: &IoRequest) -> Iocb {
        Iocb {
            aio_data: req.token,
            aio_lio_opcode: match req.opcode {
                AioOpcode::Read => IOCB_CMD_PREAD,
                AioOpcode::Write => IOCB_CMD_PWRITE,
            },
            aio_fildes: req.fd as u32,
            aio_buf: req.buf as u64,
            aio_nbytes: req.len as u64,
            aio_offset: req.offset as i64,
            ..Default::default()
        }
    }
}

impl AioEngine for LibAioEngine {
    fn name(&self) -> &'static str {
        "libaio"
    }

    fn submit(&self, reqs: &[IoRequest]) -> std::result::Result<usize, Errno> {
        if reqs.is_empty() {
            return Ok(0);
        }
        // The kernel copies each iocb during io_submit, so these only need
        // to outlive the call.
        let mut cbs: Vec<Iocb> = reqs.iter().map(Self::iocb).collect();
        let mut ptrs: Vec<*mut Iocb> = cbs.iter_mut().map(|cb| cb as *mut Iocb).collect();

        let ret = unsafe {
            libc::syscall(
                libc::SYS_io_submit,
                self.ctx,
                ptrs.len() as libc::c_long,
                ptrs.as_mut_ptr(),
            )
        };
        match ret {
            r if r < 0 => Err(Errno::last()),
            // Zero accepted with no error: the ring is full.
            0 => Err(Errno::EAGAIN),
            r => Ok(r as usize),
        }
    }

    fn get_events(
        &self,
        min: usize,
        events: &mut [IoEvent],
        timeout: Duration,
    ) -> std::result::Result<usize, Errno> {
        if events.is_empty() {
            return Ok(0);
        }
        let mut raw = vec![RawEvent::default(); events.len()];
        let mut ts = libc::timespec {
            tv_sec: timeout.as_secs() as libc::time_t,
            tv_nsec: timeout.subsec_nanos() as libc::c_long,
        };
        let ret = unsafe {
            libc::syscall(
                libc::SYS_io_getevents,
                self.ctx,
                min.min(events.len()) as libc::c_long,
                raw.len() as libc::c_long,
                raw.as_mut_ptr(),
                &mut ts as *mut libc::timespec,
            )
        };
        if ret < 0 {
            return Err(Errno::last());
        }
        let n = ret as usize;
        for (dst, ev) in events.iter_mut().zip(&raw[..n]) {
            *dst = IoEvent {
                token: ev.data,
                result: ev.res,
            };
        }
        Ok(n)
    }

    fn depth(&self) -> usize {
        self.depth
    }
}

impl Drop for LibAioEngine {
    fn drop(&mut self) {
        let ret = unsafe { libc::syscall(libc::SYS_io_destroy, self.ctx) };
        if ret < 0 {
            tracing::warn!(errno = %Errno::last(), "io_destroy failed");
        }
    }
}

// Compile-time layout checks against <linux/aio_abi.h>.
const _: () = assert!(std::mem::size_of::<Iocb>() == 64);
const _: () = assert!(std::mem::size_of::<RawEvent>() == 32);
