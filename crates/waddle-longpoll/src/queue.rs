//! Sequenced per-receiver message queue.
//!
//! Every pushed message is stamped with a monotonically increasing sequence
//! number starting at 0. Consumers pull from an arbitrary sequence, which
//! lets a long-poll client resume from the last sequence it acknowledged.
//!
//! ```text
//!  push ──► [ seq 3 | seq 4 | seq 5 | seq 6 ] ──► pull(from = 5) → seq 5
//!             oldest                   newest
//! ```
//!
//! Pushing never blocks: once `capacity` messages are retained the oldest
//! one is dropped. Pulling waits until a message at or after the requested
//! sequence exists.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;
use tracing::debug;

/// A message together with its position in the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sequenced<M> {
    /// Position of the message, starting at 0 for the first push.
    pub seq: u64,
    /// The message itself.
    pub value: M,
}

struct Buffer<M> {
    messages: VecDeque<Sequenced<M>>,
    next_seq: u64,
}

impl<M> Buffer<M> {
    /// Index of the first retained message with `seq >= from`.
    fn position(&self, from: u64) -> Option<usize> {
        let oldest = self.messages.front()?.seq;
        let index = usize::try_from(from.saturating_sub(oldest)).ok()?;
        (index < self.messages.len()).then_some(index)
    }
}

/// Ordered message queue for one long-poll receiver.
pub struct SeqQueue<M> {
    buffer: Mutex<Buffer<M>>,
    notify: Notify,
    capacity: usize,
}

impl<M> SeqQueue<M> {
    /// Create a queue retaining at most `capacity` messages (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            buffer: Mutex::new(Buffer {
                messages: VecDeque::with_capacity(capacity.min(64)),
                next_seq: 0,
            }),
            notify: Notify::new(),
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Buffer<M>> {
        self.buffer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a message without blocking and wake every waiting consumer.
    ///
    /// Returns the sequence number assigned to the message.
    pub fn push(&self, value: M) -> u64 {
        let seq = {
            let mut buffer = self.lock();
            let seq = buffer.next_seq;
            buffer.next_seq += 1;
            buffer.messages.push_back(Sequenced { seq, value });
            if buffer.messages.len() > self.capacity {
                if let Some(dropped) = buffer.messages.pop_front() {
                    debug!(seq = dropped.seq, capacity = self.capacity, "Dropped oldest queued message");
                }
            }
            seq
        };
        self.notify.notify_waiters();
        seq
    }

    /// Sequence number the next pushed message will receive.
    pub fn next_seq(&self) -> u64 {
        self.lock().next_seq
    }

    /// Number of retained messages.
    pub fn len(&self) -> usize {
        self.lock().messages.len()
    }

    /// Check if no messages are retained.
    pub fn is_empty(&self) -> bool {
        self.lock().messages.is_empty()
    }

    /// Maximum number of retained messages.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl<M: Clone> SeqQueue<M> {
    /// Return the first retained message with `seq >= from`, if any.
    ///
    /// When `from` points at a message that has already been dropped, the
    /// oldest retained message is returned instead.
    pub fn try_pull(&self, from: u64) -> Option<Sequenced<M>> {
        let buffer = self.lock();
        let index = buffer.position(from)?;
        buffer.messages.get(index).cloned()
    }

    /// Return every retained message with `seq >= from`.
    pub fn try_pull_batch(&self, from: u64) -> Vec<Sequenced<M>> {
        let buffer = self.lock();
        match buffer.position(from) {
            Some(index) => buffer.messages.range(index..).cloned().collect(),
            None => Vec::new(),
        }
    }

    /// Wait for the first message with `seq >= from`.
    ///
    /// Does not touch any registry lock; wrap in `tokio::time::timeout` to
    /// bound a long-poll request.
    pub async fn pull(&self, from: u64) -> Sequenced<M> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register interest before checking so a concurrent push is not missed.
            notified.as_mut().enable();

            if let Some(message) = self.try_pull(from) {
                return message;
            }
            notified.await;
        }
    }

    /// Wait until at least one message with `seq >= from` exists, then
    /// return all of them.
    pub async fn pull_batch(&self, from: u64) -> Vec<Sequenced<M>> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let batch = self.try_pull_batch(from);
            if !batch.is_empty() {
                return batch;
            }
            notified.await;
        }
    }
}

impl<M> fmt::Debug for SeqQueue<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let buffer = self.lock();
        f.debug_struct("SeqQueue")
            .field("len", &buffer.messages.len())
            .field("next_seq", &buffer.next_seq)
            .field("capacity", &self.capacity)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_push_assigns_sequences() {
        let queue = SeqQueue::new(16);
        assert_eq!(queue.push("a"), 0);
        assert_eq!(queue.push("b"), 1);
        assert_eq!(queue.next_seq(), 2);
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_try_pull_from_sequence() {
        let queue = SeqQueue::new(16);
        queue.push(10);
        queue.push(20);
        queue.push(30);

        assert_eq!(queue.try_pull(0), Some(Sequenced { seq: 0, value: 10 }));
        assert_eq!(queue.try_pull(2), Some(Sequenced { seq: 2, value: 30 }));
        assert_eq!(queue.try_pull(3), None);
    }

    #[test]
    fn test_try_pull_batch() {
        let queue = SeqQueue::new(16);
        for value in 0..5 {
            queue.push(value);
        }

        let values: Vec<_> = queue.try_pull_batch(2).into_iter().map(|m| m.value).collect();
        assert_eq!(values, vec![2, 3, 4]);
        assert!(queue.try_pull_batch(5).is_empty());
    }

    #[test]
    fn test_capacity_drops_oldest() {
        let queue = SeqQueue::new(2);
        queue.push("first");
        queue.push("second");
        queue.push("third");

        assert_eq!(queue.len(), 2);
        // Sequence 0 was dropped; the oldest retained message is returned.
        assert_eq!(queue.try_pull(0), Some(Sequenced { seq: 1, value: "second" }));
        assert_eq!(queue.next_seq(), 3);
    }

    #[test]
    fn test_zero_capacity_keeps_one() {
        let queue = SeqQueue::new(0);
        queue.push(1);
        queue.push(2);
        assert_eq!(queue.capacity(), 1);
        assert_eq!(queue.try_pull(0).map(|m| m.value), Some(2));
    }

    #[tokio::test]
    async fn test_pull_waits_for_push() {
        let queue = Arc::new(SeqQueue::new(16));

        let consumer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.pull(0).await })
        };

        tokio::task::yield_now().await;
        queue.push(721);

        let message = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .expect("pull timed out")
            .expect("consumer panicked");
        assert_eq!(message, Sequenced { seq: 0, value: 721 });
    }

    #[tokio::test]
    async fn test_pull_batch_waits_for_requested_sequence() {
        let queue = Arc::new(SeqQueue::new(16));
        queue.push("old");

        let consumer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.pull_batch(1).await })
        };

        tokio::task::yield_now().await;
        queue.push("new");

        let batch = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .expect("pull timed out")
            .expect("consumer panicked");
        assert_eq!(batch, vec![Sequenced { seq: 1, value: "new" }]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pull_times_out_without_messages() {
        let queue: SeqQueue<u32> = SeqQueue::new(16);
        let result = tokio::time::timeout(Duration::from_secs(30), queue.pull(0)).await;
        assert!(result.is_err());
    }
}
