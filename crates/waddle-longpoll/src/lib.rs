//! # waddle-longpoll
//!
//! Long-poll receiver registry for Waddle Social.
//!
//! Lets many clients park on a receiver key and collect messages pushed to
//! that key, while idle receivers are reclaimed after a lease timeout. It is
//! the primitive behind HTTP long-polling endpoints: the host translates a
//! poll request into [`LongpollRegistry::register`] plus a
//! [`SeqQueue::pull`] bounded by its own deadline, and a delivery into
//! [`LongpollRegistry::send`].
//!
//! ## Architecture
//!
//! - **Registry**: one `RwLock` over the key → entry map, the lease timeout
//!   and the register/purge hooks
//! - **Queue**: per-receiver [`SeqQueue`] with sequence-addressed replay
//! - **Purge loop**: background Tokio task sweeping expired receivers every
//!   tick (5s by default), stopped by [`LongpollRegistry::shutdown`]
//!
//! The registry keeps nothing across restarts and does not coordinate with
//! other nodes. A message sent just before its receiver is purged is only
//! reachable through queue handles obtained earlier.

pub mod config;
pub mod metrics;
pub mod queue;
pub mod registry;

mod error;

pub use config::{
    LongpollConfig, DEFAULT_QUEUE_CAPACITY, DEFAULT_RECEIVER_TIMEOUT, DEFAULT_TICK_INTERVAL,
};
pub use error::LongpollError;
pub use metrics::{RegistryMetrics, RegistryMetricsSnapshot};
pub use queue::{SeqQueue, Sequenced};
pub use registry::{LongpollRegistry, ReceiverHook, ReceiverKey};
