//! Lease expiry: the sweep and the background loop that drives it.

use std::sync::{Arc, PoisonError, Weak};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, instrument};

use super::receiver_registry::{LongpollRegistry, ReceiverKey, RegistryInner};

impl<K, M> LongpollRegistry<K, M>
where
    K: ReceiverKey,
    M: Send + 'static,
{
    /// Evict every receiver whose lease has expired.
    ///
    /// The whole pass runs under one write lock, so concurrent callers see
    /// each receiver either untouched or gone. The purge hook is spawned once
    /// per evicted key after the lock is released.
    ///
    /// Returns the number of evicted receivers.
    #[instrument(skip(self), name = "longpoll.purge")]
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();

        let (purged, hook, remaining) = {
            let mut state = self.inner.write();
            let timeout = state.timeout;
            let mut purged = Vec::new();

            state.entries.retain(|key, entry| {
                if entry.is_expired(now, timeout) {
                    purged.push(key.clone());
                    false
                } else {
                    true
                }
            });

            (purged, state.on_purge.clone(), state.entries.len())
        };

        let count = purged.len();
        self.inner.metrics.record_sweep(count, remaining);

        if count > 0 {
            info!(count, remaining, "Purged expired receivers");
        }

        for key in purged {
            debug!(key = ?key, "Receiver lease expired");
            if let Some(hook) = &hook {
                self.spawn_hook(Arc::clone(hook), key);
            }
        }

        count
    }

    /// Stop the purge loop and wait for it to exit.
    ///
    /// Registered receivers stay in place but are no longer evicted by the
    /// loop; [`purge_expired`](Self::purge_expired) still works. Calling this
    /// more than once is harmless.
    pub async fn shutdown(&self) {
        if !self.inner.shutdown.is_cancelled() {
            info!("Shutting down long-poll purge loop");
            self.inner.shutdown.cancel();
        }

        let task = self
            .inner
            .purge_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(task) = task {
            let _ = task.await;
        }
    }

    /// Check if [`shutdown`](Self::shutdown) has been requested.
    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Start the background sweep on the registry's runtime.
    ///
    /// The task holds only a weak reference, so it also exits once every
    /// registry handle has been dropped.
    pub(super) fn spawn_purge_loop(&self, tick: Duration) -> JoinHandle<()> {
        let registry: Weak<RegistryInner<K, M>> = Arc::downgrade(&self.inner);
        let shutdown = self.inner.shutdown.clone();
        // First sweep one tick after construction, not immediately.
        let first_sweep = Instant::now() + tick;

        self.inner.runtime.spawn(async move {
            let mut ticker = tokio::time::interval_at(first_sweep, tick);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            info!(tick_ms = tick.as_millis() as u64, "Long-poll purge loop started");

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(inner) = registry.upgrade() else {
                            break;
                        };
                        LongpollRegistry { inner }.purge_expired();
                    }
                }
            }

            info!("Long-poll purge loop stopped");
        })
    }
}
