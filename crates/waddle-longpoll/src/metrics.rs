//! Long-poll registry metrics.
//!
//! Two layers are provided:
//! - [`RegistryMetrics`]: in-process atomic counters, readable through
//!   [`LongpollRegistry::metrics`](crate::LongpollRegistry::metrics).
//! - OpenTelemetry instruments recorded against the global meter provider,
//!   which must be initialized by the host application (waddle-server).
//!   Without a provider the instruments are no-ops.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

use opentelemetry::metrics::{Counter, Gauge, Meter};
use opentelemetry::KeyValue;

static METER: OnceLock<Meter> = OnceLock::new();

fn meter() -> &'static Meter {
    METER.get_or_init(|| opentelemetry::global::meter("waddle-longpoll"))
}

/// Counter for receiver registrations.
pub fn registrations() -> Counter<u64> {
    meter()
        .u64_counter("longpoll.registrations")
        .with_description("Total receiver registrations")
        .with_unit("registration")
        .build()
}

/// Counter for messages offered to the registry.
pub fn messages() -> Counter<u64> {
    meter()
        .u64_counter("longpoll.messages")
        .with_description("Total messages sent through the registry")
        .with_unit("message")
        .build()
}

/// Counter for receivers evicted by the purge loop.
pub fn receivers_purged() -> Counter<u64> {
    meter()
        .u64_counter("longpoll.receivers.purged")
        .with_description("Total receivers evicted after their lease expired")
        .with_unit("receiver")
        .build()
}

/// Gauge for live receivers.
pub fn receivers_active() -> Gauge<i64> {
    meter()
        .i64_gauge("longpoll.receivers.active")
        .with_description("Current number of registered receivers")
        .with_unit("receiver")
        .build()
}

/// Record a registration, new or lease refresh.
pub fn record_registration(new_receiver: bool) {
    registrations().add(
        1,
        &[KeyValue::new(
            "outcome",
            if new_receiver { "created" } else { "refreshed" },
        )],
    );
}

/// Record a send attempt.
pub fn record_message(delivered: bool) {
    messages().add(
        1,
        &[KeyValue::new(
            "result",
            if delivered { "queued" } else { "receiver_not_found" },
        )],
    );
}

/// Record the outcome of one purge sweep.
pub fn record_sweep(purged: usize, remaining: usize) {
    if purged > 0 {
        receivers_purged().add(purged as u64, &[]);
    }
    receivers_active().record(remaining as i64, &[]);
}

/// In-process counters for a single registry.
#[derive(Debug, Default)]
pub struct RegistryMetrics {
    /// Receivers created by a first registration.
    pub receivers_created: AtomicU64,

    /// Lease refreshes from re-registration.
    pub leases_refreshed: AtomicU64,

    /// Messages queued to a live receiver.
    pub messages_sent: AtomicU64,

    /// Sends rejected with `ReceiverNotFound`.
    pub send_misses: AtomicU64,

    /// Receivers evicted by the purge loop.
    pub receivers_purged: AtomicU64,

    /// Completed purge sweeps.
    pub sweeps: AtomicU64,
}

impl RegistryMetrics {
    /// Create new registry metrics.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_registration(&self, new_receiver: bool) {
        if new_receiver {
            self.receivers_created.fetch_add(1, Ordering::Relaxed);
        } else {
            self.leases_refreshed.fetch_add(1, Ordering::Relaxed);
        }
        record_registration(new_receiver);
    }

    pub(crate) fn record_send(&self, delivered: bool) {
        if delivered {
            self.messages_sent.fetch_add(1, Ordering::Relaxed);
        } else {
            self.send_misses.fetch_add(1, Ordering::Relaxed);
        }
        record_message(delivered);
    }

    pub(crate) fn record_sweep(&self, purged: usize, remaining: usize) {
        self.sweeps.fetch_add(1, Ordering::Relaxed);
        self.receivers_purged
            .fetch_add(purged as u64, Ordering::Relaxed);
        record_sweep(purged, remaining);
    }

    /// Take a point-in-time copy of the counters.
    pub fn snapshot(&self) -> RegistryMetricsSnapshot {
        RegistryMetricsSnapshot {
            receivers_created: self.receivers_created.load(Ordering::Relaxed),
            leases_refreshed: self.leases_refreshed.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            send_misses: self.send_misses.load(Ordering::Relaxed),
            receivers_purged: self.receivers_purged.load(Ordering::Relaxed),
            sweeps: self.sweeps.load(Ordering::Relaxed),
        }
    }
}

/// Copy of [`RegistryMetrics`] at one instant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryMetricsSnapshot {
    pub receivers_created: u64,
    pub leases_refreshed: u64,
    pub messages_sent: u64,
    pub send_misses: u64,
    pub receivers_purged: u64,
    pub sweeps: u64,
}
