//! Device configuration.
//!
//! `DeviceConfig` carries every tunable the kernel device reads. Values come
//! from `Default`, the builder methods, or `from_env()`, which overlays
//! `BDEV_*` environment variables:
//!
//! | Variable                       | Field                    | Unit     |
//! |--------------------------------|--------------------------|----------|
//! | `BDEV_AIO_OP_TIMEOUT`          | `aio_op_timeout`         | seconds  |
//! | `BDEV_AIO_OP_SUICIDE_TIMEOUT`  | `aio_op_suicide_timeout` | seconds  |
//! | `BDEV_AIO_REAP_MAX`            | `aio_reap_max`           | count    |
//! | `BDEV_AIO_QUEUE_MAX_IODEPTH`   | `aio_queue_max_iodepth`  | count    |
//! | `BDEV_AIO_STATS_MIN_PERIOD_S`  | `aio_stats_min_period`   | seconds  |
//! | `BDEV_AIO_POLL_MS`             | `aio_poll`               | ms       |
//! | `BDEV_BLOCK_SIZE`              | `block_size`             | bytes    |
//! | `BDEV_BACKEND`                 | `backend`                | name     |
//! | `BDEV_DIRECT_IO`               | `direct_io`              | bool     |
//! | `BDEV_DEBUG_INFLIGHT_IOS`      | `debug_inflight_ios`     | bool     |
//!
//! Unparseable values are ignored with a warning.

use crate::error::{BdevError, Result};

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Kernel interface used for asynchronous I/O.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AioBackend {
    /// Linux native AIO (`io_submit` / `io_getevents`).
    Libaio,
    /// io_uring.
    IoUring,
    /// In-process emulation over `pread`/`pwrite`; for tests.
    Emulated,
}

impl AioBackend {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Libaio => "libaio",
            Self::IoUring => "io_uring",
            Self::Emulated => "emulated",
        }
    }
}

impl fmt::Display for AioBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for AioBackend {
    type Err = BdevError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "libaio" | "aio" => Ok(Self::Libaio),
            "io_uring" | "iouring" | "uring" => Ok(Self::IoUring),
            "emulated" | "emu" => Ok(Self::Emulated),
            other => Err(BdevError::Config(format!("unknown aio backend '{}'", other))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeviceConfig {
    /// Oldest in-flight op age that triggers a stall warning. Zero disables.
    pub aio_op_timeout: Duration,
    /// Oldest in-flight op age that is treated as a fatal stall. Zero disables.
    pub aio_op_suicide_timeout: Duration,
    /// Max completions drained per poll.
    pub aio_reap_max: usize,
    /// Kernel AIO context depth.
    pub aio_queue_max_iodepth: usize,
    /// Minimum interval between recomputed stats snapshots.
    pub aio_stats_min_period: Duration,
    /// Completion poll timeout; bounds how late a stall check can run.
    pub aio_poll: Duration,
    /// Logical block size for direct I/O.
    pub block_size: u64,
    pub backend: AioBackend,
    /// Open the primary descriptor with `O_DIRECT`.
    pub direct_io: bool,
    /// Reject overlapping in-flight aio ranges.
    pub debug_inflight_ios: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            aio_op_timeout: Duration::from_secs(5),
            aio_op_suicide_timeout: Duration::from_secs(600),
            aio_reap_max: 16,
            aio_queue_max_iodepth: 1024,
            aio_stats_min_period: Duration::from_secs(5),
            aio_poll: Duration::from_millis(250),
            block_size: 4096,
            backend: AioBackend::Libaio,
            direct_io: true,
            debug_inflight_ios: false,
        }
    }
}

impl DeviceConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overlaid with `BDEV_*` environment variables.
    pub fn from_env() -> Self {
        Self::default().with_env()
    }

    /// Overlay `BDEV_*` environment variables onto this config.
    pub fn with_env(mut self) -> Self {
        if let Some(v) = env_parse::<f64>("BDEV_AIO_OP_TIMEOUT") {
            self.aio_op_timeout = secs(v);
        }
        if let Some(v) = env_parse::<f64>("BDEV_AIO_OP_SUICIDE_TIMEOUT") {
            self.aio_op_suicide_timeout = secs(v);
        }
        if let Some(v) = env_parse("BDEV_AIO_REAP_MAX") {
            self.aio_reap_max = v;
        }
        if let Some(v) = env_parse("BDEV_AIO_QUEUE_MAX_IODEPTH") {
            self.aio_queue_max_iodepth = v;
        }
        if let Some(v) = env_parse::<f64>("BDEV_AIO_STATS_MIN_PERIOD_S") {
            self.aio_stats_min_period = secs(v);
        }
        if let Some(v) = env_parse("BDEV_AIO_POLL_MS") {
            self.aio_poll = Duration::from_millis(v);
        }
        if let Some(v) = env_parse("BDEV_BLOCK_SIZE") {
            self.block_size = v;
        }
        if let Some(v) = env_parse("BDEV_BACKEND") {
            self.backend = v;
        }
        if let Some(v) = env_bool("BDEV_DIRECT_IO") {
            self.direct_io = v;
        }
        if let Some(v) = env_bool("BDEV_DEBUG_INFLIGHT_IOS") {
            self.debug_inflight_ios = v;
        }
        self
    }

    pub fn aio_op_timeout(mut self, d: Duration) -> Self {
        self.aio_op_timeout = d;
        self
    }

    pub fn aio_op_suicide_timeout(mut self, d: Duration) -> Self {
        self.aio_op_suicide_timeout = d;
        self
    }

    pub fn aio_reap_max(mut self, n: usize) -> Self {
        self.aio_reap_max = n;
        self
    }

    pub fn aio_queue_max_iodepth(mut self, n: usize) -> Self {
        self.aio_queue_max_iodepth = n;
        self
    }

    pub fn aio_stats_min_period(mut self, d: Duration) -> Self {
        self.aio_stats_min_period = d;
        self
    }

    pub fn aio_poll(mut self, d: Duration) -> Self {
        self.aio_poll = d;
        self
    }

    pub fn block_size(mut self, n: u64) -> Self {
        self.block_size = n;
        self
    }

    pub fn backend(mut self, b: AioBackend) -> Self {
        self.backend = b;
        self
    }

    pub fn direct_io(mut self, enable: bool) -> Self {
        self.direct_io = enable;
        self
    }

    pub fn debug_inflight_ios(mut self, enable: bool) -> Self {
        self.debug_inflight_ios = enable;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.block_size < 512 || !self.block_size.is_power_of_two() {
            return Err(BdevError::Config(format!(
                "block_size {} must be a power of two >= 512",
                self.block_size
            )));
        }
        if self.aio_reap_max == 0 {
            return Err(BdevError::Config("aio_reap_max must be at least 1".into()));
        }
        if self.aio_queue_max_iodepth == 0 {
            return Err(BdevError::Config(
                "aio_queue_max_iodepth must be at least 1".into(),
            ));
        }
        if self.aio_poll.is_zero() {
            return Err(BdevError::Config("aio_poll must be non-zero".into()));
        }
        if !self.aio_op_timeout.is_zero()
            && !self.aio_op_suicide_timeout.is_zero()
            && self.aio_op_suicide_timeout < self.aio_op_timeout
        {
            return Err(BdevError::Config(
                "aio_op_suicide_timeout must not be below aio_op_timeout".into(),
            ));
        }
        Ok(())
    }
}

fn secs(v: f64) -> Duration {
    Duration::try_from_secs_f64(v).unwrap_or(Duration::ZERO)
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparseable config value");
            None
        }
    }
}

fn env_bool(key: &str) -> Option<bool> {
    let raw = std::env::var(key).ok()?;
    Some(matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let c = DeviceConfig::default();
        assert!(c.validate().is_ok());
        assert_eq!(c.aio_reap_max, 16);
        assert_eq!(c.aio_queue_max_iodepth, 1024);
        assert_eq!(c.aio_stats_min_period, Duration::from_secs(5));
        assert_eq!(c.backend, AioBackend::Libaio);
    }

    #[test]
    fn test_invalid_block_size() {
        assert!(DeviceConfig::new().block_size(1000).validate().is_err());
        assert!(DeviceConfig::new().block_size(256).validate().is_err());
        assert!(DeviceConfig::new().block_size(512).validate().is_ok());
    }

    #[test]
    fn test_thresholds_ordering() {
        let c = DeviceConfig::new()
            .aio_op_timeout(Duration::from_secs(10))
            .aio_op_suicide_timeout(Duration::from_secs(1));
        assert!(c.validate().is_err());
        // Disabled suicide timeout is always fine.
        let c = c.aio_op_suicide_timeout(Duration::ZERO);
        assert!(c.validate().is_ok());
    }

    #[test]
    fn test_backend_parse() {
        assert_eq!("io_uring".parse::<AioBackend>().unwrap(), AioBackend::IoUring);
        assert_eq!("LIBAIO".parse::<AioBackend>().unwrap(), AioBackend::Libaio);
        assert_eq!("emulated".parse::<AioBackend>().unwrap(), AioBackend::Emulated);
        assert!("spdk".parse::<AioBackend>().is_err());
    }

    #[test]
    fn test_env_overlay() {
        // Unique keys per test binary run; no other test reads these.
        std::env::set_var("BDEV_AIO_REAP_MAX", "64");
        std::env::set_var("BDEV_AIO_OP_TIMEOUT", "0.5");
        std::env::set_var("BDEV_BACKEND", "emulated");
        std::env::set_var("BDEV_AIO_QUEUE_MAX_IODEPTH", "not-a-number");
        let c = DeviceConfig::from_env();
        std::env::remove_var("BDEV_AIO_REAP_MAX");
        std::env::remove_var("BDEV_AIO_OP_TIMEOUT");
        std::env::remove_var("BDEV_BACKEND");
        std::env::remove_var("BDEV_AIO_QUEUE_MAX_IODEPTH");

        assert_eq!(c.aio_reap_max, 64);
        assert_eq!(c.aio_op_timeout, Duration::from_millis(500));
        assert_eq!(c.backend, AioBackend::Emulated);
        assert_eq!(c.aio_queue_max_iodepth, 1024);
    }
}
