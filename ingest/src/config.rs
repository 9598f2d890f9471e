//! Immutable run configuration.

use std::num::NonZeroUsize;
use std::ops::RangeInclusive;
use std::time::Duration;

use thiserror::Error;

use crate::Height;

/// Default number of concurrent workers.
pub const DEFAULT_POOL_SIZE: NonZeroUsize = unsafe { NonZeroUsize::new_unchecked(10) };

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid height range {from}..={to}")]
    InvalidRange { from: Height, to: Height },
    #[error("pool size must be greater than 0")]
    PoolSize,
}

/// Configuration of a single [`Dispatcher`](crate::dispatch::Dispatcher) run.
///
/// It can only be built through [`Config::new`], so that any value observed by the dispatcher has been validated.
///
/// ```
/// # use ingest::config::Config;
/// let config = Config::new(100, 104, 2).unwrap().with_tip_clamp(true);
///
/// assert_eq!(config.range(), 100..=104);
/// assert_eq!(config.event_capacity(), 4);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    from: Height,
    to: Height,
    pool_size: NonZeroUsize,
    clamp_to_tip: bool,
    flush_interval: Option<Duration>,
}

impl Config {
    /// Validate an inclusive `[from, to]` range processed by `pool_size` workers.
    pub fn new(from: Height, to: Height, pool_size: usize) -> Result<Self, Error> {
        if from > to {
            return Err(Error::InvalidRange { from, to });
        }

        let pool_size = NonZeroUsize::new(pool_size).ok_or(Error::PoolSize)?;

        Ok(Self {
            from,
            to,
            pool_size,
            clamp_to_tip: false,
            flush_interval: None,
        })
    }

    /// Build a new `Config` that clamps the end of the range to the source's chain tip before resolving pending heights.
    #[inline]
    pub fn with_tip_clamp(self, clamp_to_tip: bool) -> Self {
        Self { clamp_to_tip, ..self }
    }

    /// Build a new `Config` that also flushes the store every `period` while workers are running.
    ///
    /// The store is flushed once after the last worker returns in any case.
    #[inline]
    pub fn with_flush_interval(self, period: Duration) -> Self {
        Self {
            flush_interval: (!period.is_zero()).then_some(period),
            ..self
        }
    }

    #[inline]
    pub fn range(&self) -> RangeInclusive<Height> {
        self.from..=self.to
    }

    #[inline]
    pub fn pool_size(&self) -> NonZeroUsize {
        self.pool_size
    }

    #[inline]
    pub fn clamp_to_tip(&self) -> bool {
        self.clamp_to_tip
    }

    #[inline]
    pub fn flush_interval(&self) -> Option<Duration> {
        self.flush_interval
    }

    /// Capacity of the progress event stream.
    #[inline]
    pub fn event_capacity(&self) -> usize {
        self.pool_size.get().saturating_mul(2)
    }

    /// Return the range clamped to `tip`, or `None` when the whole range lies above it.
    pub fn clamped_range(&self, tip: Height) -> Option<RangeInclusive<Height>> {
        (self.from <= tip).then(|| self.from..=self.to.min(tip))
    }
}
