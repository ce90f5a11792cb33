//! Registry configuration.
//!
//! Defaults match the values long-poll hosts expect out of the box: the
//! purge loop sweeps every 5 seconds and a receiver that has not
//! re-registered for 2 minutes is reclaimed.

use std::time::Duration;

use tracing::warn;

/// Default interval between purge sweeps (5 seconds).
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(5);

/// Default receiver lease (2 minutes).
pub const DEFAULT_RECEIVER_TIMEOUT: Duration = Duration::from_secs(120);

/// Default number of messages retained per receiver queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Smallest tick the purge loop accepts; tokio intervals reject zero.
const MIN_TICK_INTERVAL: Duration = Duration::from_millis(1);

/// Configuration for a [`LongpollRegistry`](crate::LongpollRegistry).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LongpollConfig {
    /// How often the purge loop sweeps for expired receivers.
    ///
    /// This sets sweep granularity only; eviction is governed by
    /// `receiver_timeout`.
    pub tick_interval: Duration,

    /// Inactivity after which a receiver is eligible for purge.
    pub receiver_timeout: Duration,

    /// Maximum messages retained in each receiver queue.
    pub queue_capacity: usize,
}

impl Default for LongpollConfig {
    fn default() -> Self {
        Self {
            tick_interval: DEFAULT_TICK_INTERVAL,
            receiver_timeout: DEFAULT_RECEIVER_TIMEOUT,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

impl LongpollConfig {
    /// Create a configuration with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a configuration from the environment, falling back to defaults.
    ///
    /// Reads:
    /// - `WADDLE_LONGPOLL_TICK_SECS`
    /// - `WADDLE_LONGPOLL_TIMEOUT_SECS`
    /// - `WADDLE_LONGPOLL_QUEUE_CAPACITY`
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(secs) = env_u64("WADDLE_LONGPOLL_TICK_SECS") {
            config.tick_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = env_u64("WADDLE_LONGPOLL_TIMEOUT_SECS") {
            config.receiver_timeout = Duration::from_secs(secs);
        }
        if let Some(capacity) = env_u64("WADDLE_LONGPOLL_QUEUE_CAPACITY") {
            config.queue_capacity = usize::try_from(capacity).unwrap_or(usize::MAX);
        }

        config
    }

    /// Set the purge sweep interval.
    pub fn with_tick_interval(mut self, tick_interval: Duration) -> Self {
        self.tick_interval = tick_interval;
        self
    }

    /// Set the receiver lease duration.
    pub fn with_receiver_timeout(mut self, receiver_timeout: Duration) -> Self {
        self.receiver_timeout = receiver_timeout;
        self
    }

    /// Set the per-receiver queue capacity.
    pub fn with_queue_capacity(mut self, queue_capacity: usize) -> Self {
        self.queue_capacity = queue_capacity;
        self
    }

    /// Tick interval clamped to what `tokio::time::interval` accepts.
    pub(crate) fn effective_tick_interval(&self) -> Duration {
        self.tick_interval.max(MIN_TICK_INTERVAL)
    }
}

fn env_u64(name: &str) -> Option<u64> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(var = name, value = %raw, "Ignoring invalid long-poll setting");
            None
        }
    }
}
