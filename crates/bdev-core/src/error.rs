//! Block-device error types.
//!
//! Every fallible call in the workspace returns [`BdevError`]. The variants
//! fall into the four classes of [`ErrorKind`]; transient kernel
//! backpressure has no variant because it never leaves the AIO queue.

use nix::errno::Errno;
use std::time::Duration;
use thiserror::Error;

/// Error class, used by callers that only care about how to react.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad path, unsupported device or invalid configuration at open time.
    Config,
    /// Descriptor / AIO context exhaustion, or submission retries exhausted.
    Resource,
    /// Synchronous I/O failure, misuse of the API, or a device in the wrong state.
    Io,
    /// Unrecoverable; handed to the supervisor, never returned from the data path.
    Fatal,
}

#[derive(Error, Debug)]
pub enum BdevError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("cannot open {path}: {errno}")]
    Open { path: String, errno: Errno },

    #[error("{what} exhausted: {errno}")]
    Resource { what: &'static str, errno: Errno },

    #[error("aio submission exhausted after {retries} retries ({accepted} of {requested} accepted)")]
    SubmitExhausted {
        accepted: usize,
        requested: usize,
        retries: u32,
    },

    #[error("aio submission rejected: {errno} ({accepted} accepted)")]
    Submit { errno: Errno, accepted: usize },

    #[error("{op} failed: {errno}")]
    Io { op: &'static str, errno: Errno },

    #[error("short {op}: expected {expected} bytes, got {actual}")]
    ShortIo {
        op: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("misaligned io: offset {offset} len {len} (block size {block_size})")]
    Misaligned {
        offset: u64,
        len: u64,
        block_size: u64,
    },

    #[error("io out of range: offset {offset} len {len} (device size {size})")]
    OutOfRange { offset: u64, len: u64, size: u64 },

    #[error("overlapping in-flight io: offset {offset} len {len}")]
    OverlappingIo { offset: u64, len: u64 },

    #[error("device is unhealthy")]
    Unhealthy,

    #[error("device is closed")]
    Closed,

    #[error("aio stalled for {age:?} (suicide timeout {threshold:?})")]
    FatalStall { age: Duration, threshold: Duration },

    #[error("kernel {op} failed: {errno}")]
    Kernel { op: &'static str, errno: Errno },
}

impl BdevError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Config(_) | Self::Open { .. } => ErrorKind::Config,
            Self::Resource { .. } | Self::SubmitExhausted { .. } | Self::Submit { .. } => {
                ErrorKind::Resource
            }
            Self::Io { .. }
            | Self::ShortIo { .. }
            | Self::Misaligned { .. }
            | Self::OutOfRange { .. }
            | Self::OverlappingIo { .. }
            | Self::Unhealthy
            | Self::Closed => ErrorKind::Io,
            Self::FatalStall { .. } | Self::Kernel { .. } => ErrorKind::Fatal,
        }
    }

    /// Number of operations the kernel accepted before a submission error.
    pub fn accepted(&self) -> usize {
        match self {
            Self::SubmitExhausted { accepted, .. } | Self::Submit { accepted, .. } => *accepted,
            _ => 0,
        }
    }

    /// Map an `open(2)` failure: missing or invalid paths are configuration
    /// errors, descriptor exhaustion is a resource error.
    pub fn from_open(path: &str, errno: Errno) -> Self {
        match errno {
            Errno::EMFILE | Errno::ENFILE | Errno::ENOMEM => Self::Resource {
                what: "file descriptors",
                errno,
            },
            _ => Self::Open {
                path: path.to_string(),
                errno,
            },
        }
    }
}

pub type Result<T> = std::result::Result<T, BdevError>;
