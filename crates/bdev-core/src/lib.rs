//! # bdev-core — Trait definitions for the block-device layer
//!
//! This crate defines the boundaries of the raw block-device I/O subsystem
//! and the platform-agnostic pieces every backend shares. Kernel-facing
//! implementations live in `bdev-kernel`.
//!
//! | Module         | Contents                                              |
//! |----------------|-------------------------------------------------------|
//! | `block_device` | `BlockDevice` — the contract exposed to the allocator |
//! | `engine`       | `AioEngine` — seam over one kernel AIO interface      |
//! | `op`           | `AioOp`, `IoRequest`, `IoEvent`                       |
//! | `io_context`   | `IoContext` — caller-owned batch of ops               |
//! | `stall`        | `StallTracker` — oldest in-flight op in O(1)          |
//! | `metrics`      | `MetricsAggregator`, `AioQueueStats`                  |
//! | `interval_set` | `IntervalSet` — coalescing byte ranges                |
//! | `buffer`       | `AlignedBuf` — direct-I/O capable buffers             |
//! | `config`       | `DeviceConfig`, `AioBackend`                          |
//! | `supervisor`   | `Supervisor` — where fatal errors go                  |
//! | `error`        | `BdevError`, `ErrorKind`                              |
//!
//! ## Design principle
//!
//! > "Program to the interface. Start safe. Optimize with a new impl,
//! >  not by modifying the existing one."

pub mod block_device;
pub mod buffer;
pub mod config;
pub mod engine;
pub mod error;
pub mod interval_set;
pub mod io_context;
pub mod metrics;
pub mod op;
pub mod stall;
pub mod supervisor;

pub use block_device::BlockDevice;
pub use buffer::AlignedBuf;
pub use config::{AioBackend, DeviceConfig};
pub use engine::AioEngine;
pub use error::{BdevError, ErrorKind, Result};
pub use interval_set::IntervalSet;
pub use io_context::IoContext;
pub use metrics::{AioQueueStats, MetricsAggregator};
pub use op::{AioOp, AioOpcode, AioState, IoEvent, IoRequest};
pub use stall::{StallLink, StallTracker};
pub use supervisor::Supervisor;
