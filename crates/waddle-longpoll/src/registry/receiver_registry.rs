//! Receiver registry implementation.
//!
//! Maps receiver keys to their message queues and tracks when each receiver
//! last registered.

use std::borrow::Borrow;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use crate::config::LongpollConfig;
use crate::error::LongpollError;
use crate::metrics::RegistryMetrics;
use crate::queue::SeqQueue;

/// Bounds required of a receiver key.
///
/// Implemented for every hashable, comparable, cloneable type; session ids,
/// user ids and correlation tokens all qualify.
pub trait ReceiverKey: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static {}

impl<T> ReceiverKey for T where T: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static {}

/// Callback fired with the registry and the affected key.
///
/// Each invocation runs in its own task and is never awaited by the
/// operation that triggered it.
pub type ReceiverHook<K, M> =
    Arc<dyn Fn(LongpollRegistry<K, M>, K) -> BoxFuture<'static, ()> + Send + Sync>;

/// One registered receiver.
pub(super) struct ReceiverEntry<M> {
    /// Queue handed out on every registration of this key
    pub(super) queue: Arc<SeqQueue<M>>,
    /// Last time the key was registered
    pub(super) last_activity: Instant,
}

impl<M> ReceiverEntry<M> {
    fn new(queue: Arc<SeqQueue<M>>, now: Instant) -> Self {
        Self {
            queue,
            last_activity: now,
        }
    }

    /// Time since the receiver last registered.
    pub(super) fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity)
    }

    /// Check if the lease has run out.
    pub(super) fn is_expired(&self, now: Instant, timeout: Duration) -> bool {
        self.idle_for(now) >= timeout
    }
}

/// State guarded as a unit by the registry lock.
pub(super) struct RegistryState<K, M> {
    pub(super) entries: HashMap<K, ReceiverEntry<M>>,
    pub(super) timeout: Duration,
    pub(super) on_register: Option<ReceiverHook<K, M>>,
    pub(super) on_purge: Option<ReceiverHook<K, M>>,
}

pub(super) struct RegistryInner<K, M> {
    pub(super) state: RwLock<RegistryState<K, M>>,
    pub(super) metrics: RegistryMetrics,
    pub(super) runtime: Handle,
    pub(super) queue_capacity: usize,
    pub(super) shutdown: CancellationToken,
    pub(super) purge_task: Mutex<Option<JoinHandle<()>>>,
}

impl<K, M> RegistryInner<K, M> {
    // Critical sections never run caller code, so a poisoned lock still
    // guards consistent state.
    pub(super) fn read(&self) -> RwLockReadGuard<'_, RegistryState<K, M>> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub(super) fn write(&self) -> RwLockWriteGuard<'_, RegistryState<K, M>> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<K, M> Drop for RegistryInner<K, M> {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Registry of long-poll receivers.
///
/// Cheap to clone: every clone is a handle to the same registry. Pass a
/// handle to each component that needs it.
///
/// ## Usage
///
/// ```ignore
/// let registry: LongpollRegistry<String, Event> = LongpollRegistry::new();
///
/// // Long-poll request: park on the session key.
/// let queue = registry.register(session_id.clone());
/// let next = tokio::time::timeout(poll_deadline, queue.pull(last_seq + 1)).await;
///
/// // Elsewhere: deliver to the session.
/// match registry.send(&session_id, event) {
///     Ok(()) => {}
///     Err(LongpollError::ReceiverNotFound) => { /* lease expired */ }
/// }
/// ```
pub struct LongpollRegistry<K, M> {
    pub(super) inner: Arc<RegistryInner<K, M>>,
}

impl<K, M> Clone for LongpollRegistry<K, M> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, M> LongpollRegistry<K, M>
where
    K: ReceiverKey,
    M: Send + 'static,
{
    /// Create a registry with default settings and start its purge loop.
    ///
    /// # Panics
    ///
    /// Panics if called outside the context of a Tokio runtime.
    pub fn new() -> Self {
        Self::with_config(LongpollConfig::default())
    }

    /// Create a registry with the given configuration and start its purge loop.
    ///
    /// # Panics
    ///
    /// Panics if called outside the context of a Tokio runtime.
    pub fn with_config(config: LongpollConfig) -> Self {
        Self::with_runtime(config, Handle::current())
    }

    /// Create a registry whose purge loop and hooks run on `runtime`.
    ///
    /// Unlike [`with_config`](Self::with_config) this may be called from any
    /// thread.
    pub fn with_runtime(config: LongpollConfig, runtime: Handle) -> Self {
        info!(
            tick_ms = config.tick_interval.as_millis() as u64,
            timeout_ms = config.receiver_timeout.as_millis() as u64,
            queue_capacity = config.queue_capacity,
            "Creating long-poll registry"
        );

        let registry = Self {
            inner: Arc::new(RegistryInner {
                state: RwLock::new(RegistryState {
                    entries: HashMap::new(),
                    timeout: config.receiver_timeout,
                    on_register: None,
                    on_purge: None,
                }),
                metrics: RegistryMetrics::new(),
                runtime,
                queue_capacity: config.queue_capacity,
                shutdown: CancellationToken::new(),
                purge_task: Mutex::new(None),
            }),
        };

        let task = registry.spawn_purge_loop(config.effective_tick_interval());
        *registry
            .inner
            .purge_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(task);

        registry
    }

    /// Register a receiver and return its queue.
    ///
    /// A new key gets a fresh queue and fires the register hook. An existing
    /// key gets its lease extended and the same queue back; the hook is not
    /// fired again.
    #[instrument(skip(self), name = "longpoll.register")]
    pub fn register(&self, key: K) -> Arc<SeqQueue<M>> {
        let now = Instant::now();

        let (queue, created, hook) = {
            let mut state = self.inner.write();
            let hook = state.on_register.clone();
            match state.entries.entry(key.clone()) {
                Entry::Occupied(mut occupied) => {
                    occupied.get_mut().last_activity = now;
                    (Arc::clone(&occupied.get().queue), false, None)
                }
                Entry::Vacant(vacant) => {
                    let queue = Arc::new(SeqQueue::new(self.inner.queue_capacity));
                    vacant.insert(ReceiverEntry::new(Arc::clone(&queue), now));
                    (queue, true, hook)
                }
            }
        };

        self.inner.metrics.record_registration(created);
        if created {
            debug!("Registered new receiver");
        } else {
            debug!("Refreshed receiver lease");
        }

        if let Some(hook) = hook {
            self.spawn_hook(hook, key);
        }

        queue
    }

    /// Push a message to a registered receiver.
    ///
    /// Does not extend the receiver's lease; only [`register`](Self::register)
    /// does.
    ///
    /// # Errors
    ///
    /// Returns [`LongpollError::ReceiverNotFound`] if no live receiver is
    /// registered under `key`. Nothing is created in that case.
    #[instrument(skip(self, message), name = "longpoll.send")]
    pub fn send<Q>(&self, key: &Q, message: M) -> Result<(), LongpollError>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + fmt::Debug + ?Sized,
    {
        let seq = match self.inner.read().entries.get(key) {
            Some(entry) => entry.queue.push(message),
            None => {
                debug!("Receiver not found");
                self.inner.metrics.record_send(false);
                return Err(LongpollError::ReceiverNotFound);
            }
        };

        debug!(seq, "Message queued for receiver");
        self.inner.metrics.record_send(true);
        Ok(())
    }

    /// Set the receiver lease. Applies from the next sweep on.
    pub fn set_timeout(&self, timeout: Duration) {
        self.inner.write().timeout = timeout;
        debug!(timeout_ms = timeout.as_millis() as u64, "Receiver timeout updated");
    }

    /// Get the current receiver lease.
    pub fn timeout(&self) -> Duration {
        self.inner.read().timeout
    }

    /// Replace the hook fired when a new receiver registers.
    pub fn set_register_hook<F, Fut>(&self, hook: F)
    where
        F: Fn(LongpollRegistry<K, M>, K) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.inner.write().on_register = Some(boxed_hook(hook));
    }

    /// Replace the hook fired when the purge loop evicts a receiver.
    pub fn set_purge_hook<F, Fut>(&self, hook: F)
    where
        F: Fn(LongpollRegistry<K, M>, K) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.inner.write().on_purge = Some(boxed_hook(hook));
    }

    /// Remove the register hook.
    pub fn clear_register_hook(&self) {
        self.inner.write().on_register = None;
    }

    /// Remove the purge hook.
    pub fn clear_purge_hook(&self) {
        self.inner.write().on_purge = None;
    }

    /// Check if a receiver is registered under `key`.
    pub fn contains<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.inner.read().entries.contains_key(key)
    }

    /// Look up a receiver's queue without extending its lease.
    pub fn queue<Q>(&self, key: &Q) -> Option<Arc<SeqQueue<M>>>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.inner
            .read()
            .entries
            .get(key)
            .map(|entry| Arc::clone(&entry.queue))
    }

    /// Time left before a receiver becomes eligible for purge.
    ///
    /// Returns `None` if the receiver is not registered.
    pub fn lease_remaining<Q>(&self, key: &Q) -> Option<Duration>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let state = self.inner.read();
        let entry = state.entries.get(key)?;
        Some(state.timeout.saturating_sub(entry.idle_for(Instant::now())))
    }

    /// Get the number of registered receivers.
    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    /// Check if no receivers are registered.
    pub fn is_empty(&self) -> bool {
        self.inner.read().entries.is_empty()
    }

    /// List all registered receiver keys.
    pub fn receivers(&self) -> Vec<K> {
        self.inner.read().entries.keys().cloned().collect()
    }

    /// Get registry metrics.
    pub fn metrics(&self) -> &RegistryMetrics {
        &self.inner.metrics
    }

    /// Run a hook in its own task, outside the registry lock.
    pub(super) fn spawn_hook(&self, hook: ReceiverHook<K, M>, key: K) {
        let registry = self.clone();
        self.inner.runtime.spawn(async move {
            hook(registry, key).await;
        });
    }
}

impl<K, M> Default for LongpollRegistry<K, M>
where
    K: ReceiverKey,
    M: Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

fn boxed_hook<K, M, F, Fut>(hook: F) -> ReceiverHook<K, M>
where
    F: Fn(LongpollRegistry<K, M>, K) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |registry, key| hook(registry, key).boxed())
}

impl<K, M> fmt::Debug for LongpollRegistry<K, M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.read();
        f.debug_struct("LongpollRegistry")
            .field("receiver_count", &state.entries.len())
            .field("timeout", &state.timeout)
            .field("shut_down", &self.inner.shutdown.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;
    use tokio::sync::mpsc::error::TryRecvError;

    fn test_registry() -> LongpollRegistry<u64, u64> {
        LongpollRegistry::new()
    }

    #[tokio::test]
    async fn test_registry_creation() {
        let registry = test_registry();
        assert!(registry.is_empty());
        assert_eq!(registry.timeout(), Duration::from_secs(120));
    }

    #[tokio::test]
    async fn test_register_creates_entry() {
        let registry = test_registry();
        registry.register(127);

        assert!(registry.contains(&127));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_register_twice_returns_same_queue() {
        let registry = test_registry();
        let first = registry.register(127);
        let second = registry.register(127);

        assert!(Arc::ptr_eq(&first, &second));
        // Should still only have one receiver
        assert_eq!(registry.len(), 1);

        let snapshot = registry.metrics().snapshot();
        assert_eq!(snapshot.receivers_created, 1);
        assert_eq!(snapshot.leases_refreshed, 1);
    }

    #[tokio::test]
    async fn test_send_to_unregistered_receiver() {
        let registry = test_registry();

        let result = registry.send(&127, 721);
        assert_eq!(result, Err(LongpollError::ReceiverNotFound));
        assert!(!registry.contains(&127));
        assert_eq!(registry.metrics().snapshot().send_misses, 1);
    }

    #[tokio::test]
    async fn test_send_to_registered_receiver() {
        let registry = test_registry();
        let queue = registry.register(127);

        registry.send(&127, 721).unwrap();

        let message = queue.pull(0).await;
        assert_eq!(message.seq, 0);
        assert_eq!(message.value, 721);
    }

    #[tokio::test]
    async fn test_send_preserves_order() {
        let registry = test_registry();
        let queue = registry.register(1);

        for value in 0..10 {
            registry.send(&1, value).unwrap();
        }

        let values: Vec<_> = queue.pull_batch(0).await.into_iter().map(|m| m.value).collect();
        assert_eq!(values, (0..10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_borrowed_key_lookup() {
        let registry: LongpollRegistry<String, &'static str> = LongpollRegistry::new();
        registry.register("session-1".to_string());

        assert!(registry.contains("session-1"));
        assert!(registry.send("session-1", "hello").is_ok());
        assert!(registry.queue("session-1").is_some());
        assert!(registry.queue("session-2").is_none());
    }

    #[tokio::test]
    async fn test_set_timeout() {
        let registry = test_registry();
        registry.set_timeout(Duration::from_secs(1));
        assert_eq!(registry.timeout(), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lease_remaining() {
        let registry = test_registry();
        registry.set_timeout(Duration::from_secs(10));
        registry.register(7);

        tokio::time::advance(Duration::from_secs(4)).await;
        assert_eq!(registry.lease_remaining(&7), Some(Duration::from_secs(6)));
        assert_eq!(registry.lease_remaining(&8), None);
    }

    #[tokio::test]
    async fn test_register_hook_fires_once_per_new_key() {
        let registry = test_registry();
        let (tx, mut rx) = mpsc::unbounded_channel();

        registry.set_register_hook(move |_registry, key| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(key);
            }
        });

        registry.register(127);
        registry.register(127);
        registry.register(128);

        let first = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        let second = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        let mut keys = vec![first.unwrap(), second.unwrap()];
        keys.sort_unstable();
        assert_eq!(keys, vec![127, 128]);

        // Re-registration of 127 must not have fired a third time.
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_register_hook_is_replaced() {
        let registry = test_registry();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let first_tx = tx.clone();
        registry.set_register_hook(move |_registry, _key| {
            let tx = first_tx.clone();
            async move {
                let _ = tx.send("first");
            }
        });
        registry.set_register_hook(move |_registry, _key| {
            let tx = tx.clone();
            async move {
                let _ = tx.send("second");
            }
        });

        registry.register(1);

        let fired = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        assert_eq!(fired, Some("second"));
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_hook_can_call_back_into_registry() {
        let registry = test_registry();
        let (tx, mut rx) = mpsc::unbounded_channel();

        registry.set_register_hook(move |registry, key| {
            let tx = tx.clone();
            async move {
                registry.send(&key, 42).unwrap();
                let _ = tx.send(());
            }
        });

        let queue = registry.register(5);
        tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap();

        assert_eq!(queue.try_pull(0).map(|m| m.value), Some(42));
    }

    #[tokio::test]
    async fn test_cleared_register_hook_does_not_fire() {
        let registry = test_registry();
        let (tx, mut rx) = mpsc::unbounded_channel::<u64>();
        // Keep a sender alive so an empty channel means the hook never ran.
        let _tx_guard = tx.clone();

        registry.set_register_hook(move |_registry, key| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(key);
            }
        });
        registry.clear_register_hook();
        registry.register(1);

        tokio::task::yield_now().await;
        assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));
    }

    #[tokio::test]
    async fn test_receivers_lists_keys() {
        let registry = test_registry();
        registry.register(1);
        registry.register(2);

        let mut receivers = registry.receivers();
        receivers.sort_unstable();
        assert_eq!(receivers, vec![1, 2]);
    }
}
