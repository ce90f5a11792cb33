//! Long-poll receiver registry.
//!
//! Clients park on a receiver key and drain a per-receiver [`SeqQueue`];
//! producers push messages by key; a background purge loop reclaims
//! receivers whose lease expired.
//!
//! ## Architecture
//!
//! ```text
//!  register(key) ──► ┌──────────────────────────────┐ ◄── purge loop (every tick)
//!                    │ RwLock<RegistryState>        │       evicts idle entries,
//!  send(key, msg) ─► │   key → ReceiverEntry        │       fires purge hook
//!                    │          ├ Arc<SeqQueue<M>> ─┼──► long-poll consumer
//!                    │          └ last_activity     │       (pull from seq)
//!                    └──────────────────────────────┘
//! ```
//!
//! Only re-registration extends a receiver's lease; sending to it does not.
//!
//! [`SeqQueue`]: crate::queue::SeqQueue

mod purge;
mod receiver_registry;

pub use receiver_registry::{LongpollRegistry, ReceiverHook, ReceiverKey};
