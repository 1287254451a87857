//! # bdev-kernel — Linux block device implementation
//!
//! Everything that talks to the kernel. Each `AioEngine` impl is a thin
//! translation of one kernel interface; the rest is shared.
//!
//! ## Default stack
//!
//! | Seam           | Default Impl      | Alternatives                        |
//! |----------------|-------------------|-------------------------------------|
//! | BlockDevice    | KernelDevice      | —                                   |
//! | AioEngine      | LibAioEngine      | IoUringEngine (io-uring), Emulated  |
//! | Supervisor     | AbortSupervisor   | any `Fn(&str, &BdevError)`          |
//!
//! ## Threads per device
//!
//! | Name           | Module       | Job                                    |
//! |----------------|--------------|----------------------------------------|
//! | `bdev-aio`     | `completion` | reap completions, stall detection      |
//! | `bdev-discard` | `discard`    | coalesce and issue discards            |

pub mod aio_queue;
pub mod builder;
mod completion;
pub mod discard;
pub mod emulated;
pub mod kernel_device;
pub mod libaio;
pub mod supervisor;

cfg_if::cfg_if! {
    if #[cfg(feature = "io-uring")] {
        pub mod uring;
        pub use uring::IoUringEngine;
    }
}

pub use aio_queue::{AioQueue, BackoffPolicy, CompletionBatch, SubmitOutcome};
pub use builder::DeviceBuilder;
pub use discard::DiscardQueue;
pub use emulated::EmulatedEngine;
pub use kernel_device::{DeviceKind, KernelDevice};
pub use libaio::LibAioEngine;
pub use supervisor::AbortSupervisor;
