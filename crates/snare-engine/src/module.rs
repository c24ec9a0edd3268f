use std::time::Duration;

use crate::address::{Address, Offset, ResolvedAddress};

/// Module loaded within an attached process.
///
/// The base address is only meaningful for the lifetime of the process
/// (and of the mapping), so a `ModuleInfo` is never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleInfo {
    /// File name of the module (e.g., `libc.so.6`).
    name: String,

    /// Base address of the module.
    base: Address,

    /// Size of the module mapping, in bytes.
    size: u64,
}

impl ModuleInfo {
    /// Creates a new module description.
    pub fn new(name: impl Into<String>, base: Address, size: u64) -> Self {
        Self {
            name: name.into(),
            base,
            size,
        }
    }

    /// Returns the file name of the module.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the base address of the module.
    pub const fn base(&self) -> Address {
        self.base
    }

    /// Returns the size of the module mapping.
    pub const fn size(&self) -> u64 {
        self.size
    }

    /// Returns whether `addr` lies within the module mapping.
    pub fn contains(&self, addr: Address) -> bool {
        addr.offset_from(self.base)
            .is_some_and(|offset| offset.get() < self.size)
    }

    /// Computes the absolute address of `offset` within this module.
    ///
    /// Returns `None` if the offset lies outside of the module.
    pub fn resolve(&self, offset: Offset) -> Option<ResolvedAddress> {
        if offset.get() >= self.size {
            return None;
        }

        self.base
            .checked_add(offset)
            .map(|address| ResolvedAddress::new(address, offset))
    }
}

/// Bounded polling policy.
///
/// Polling stops at whichever comes first: `max_attempts` attempts, or
/// `timeout` elapsed.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of attempts.
    pub max_attempts: u32,

    /// Delay between the first two attempts.
    pub interval: Duration,

    /// Factor applied to the delay after every attempt.
    pub backoff: f64,

    /// Upper bound of the delay between two attempts.
    pub max_interval: Duration,

    /// Overall time budget.
    pub timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 20,
            interval: Duration::from_millis(250),
            backoff: 1.5,
            max_interval: Duration::from_secs(2),
            timeout: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Creates a fixed-interval policy.
    pub fn new(max_attempts: u32, interval: Duration, timeout: Duration) -> Self {
        Self {
            max_attempts,
            interval,
            backoff: 1.0,
            max_interval: interval,
            timeout,
        }
    }

    /// Enables exponential backoff.
    pub fn with_backoff(mut self, factor: f64, max_interval: Duration) -> Self {
        self.backoff = factor.max(1.0);
        self.max_interval = max_interval.max(self.interval);
        self
    }

    /// Returns the delay to wait after the attempt numbered `attempt`
    /// (starting at 0).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let nanos = self.interval.as_nanos() as f64 * self.backoff.max(1.0).powi(exponent);

        if !nanos.is_finite() || nanos >= self.max_interval.as_nanos() as f64 {
            return self.max_interval;
        }

        Duration::from_nanos(nanos.round() as u64)
    }
}
