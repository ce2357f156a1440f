//! Bounded byte channel
//!
//! Fixed-capacity byte queue underneath every audio buffer in the pipeline.
//! Writes are all-or-nothing, so a reader never observes half of an item.
//!
//! The channel is single-producer/single-consumer by contract: two tasks must
//! not call [`BoundedByteChannel::send`] concurrently, nor two tasks
//! [`BoundedByteChannel::receive_upto`]. That discipline is not enforced.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

use crate::{Error, Result};

/// What happens when an item does not fit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Suspend the producer until space frees up or the timeout elapses
    BlockWithTimeout,
    /// Never block; discard the incoming item
    DropNewestOnFull,
}

/// Result of a send
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// The whole item was buffered
    Sent,
    /// No space became available before the timeout
    TimedOut,
    /// The item was discarded (full channel or larger than capacity)
    Dropped,
}

/// Fixed-capacity byte queue with blocking and non-blocking modes
#[derive(Debug)]
pub struct BoundedByteChannel {
    capacity: usize,
    policy: OverflowPolicy,
    queue: Mutex<VecDeque<u8>>,
    /// Signalled whenever bytes are consumed
    space: Notify,
    /// Signalled whenever bytes are produced
    data: Notify,
}

impl BoundedByteChannel {
    /// Create a channel holding at most `capacity` bytes
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `capacity` is zero
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Result<Self> {
        if capacity == 0 {
            return Err(Error::Config(
                "channel capacity must be non-zero".to_string(),
            ));
        }

        Ok(Self {
            capacity,
            policy,
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            space: Notify::new(),
            data: Notify::new(),
        })
    }

    /// Maximum number of buffered bytes
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Overflow policy chosen at construction
    #[must_use]
    pub const fn policy(&self) -> OverflowPolicy {
        self.policy
    }

    /// Bytes currently buffered
    #[must_use]
    pub fn occupied_bytes(&self) -> usize {
        self.lock().len()
    }

    /// Bytes that can be written without blocking
    #[must_use]
    pub fn free_bytes(&self) -> usize {
        self.capacity - self.occupied_bytes()
    }

    /// Send an item according to the channel's overflow policy
    ///
    /// Under [`OverflowPolicy::BlockWithTimeout`] this suspends until the
    /// whole item fits or `timeout` elapses. An item larger than the capacity
    /// can never fit and is reported as [`SendOutcome::Dropped`].
    pub async fn send(&self, bytes: &[u8], timeout: Duration) -> SendOutcome {
        if bytes.is_empty() {
            return SendOutcome::Sent;
        }

        if bytes.len() > self.capacity {
            tracing::warn!(
                bytes = bytes.len(),
                capacity = self.capacity,
                "item larger than channel capacity, dropping"
            );
            return SendOutcome::Dropped;
        }

        match self.policy {
            OverflowPolicy::DropNewestOnFull => self.try_send(bytes),
            OverflowPolicy::BlockWithTimeout => {
                let deadline = Instant::now() + timeout;
                loop {
                    if self.push(bytes) {
                        return SendOutcome::Sent;
                    }
                    if tokio::time::timeout_at(deadline, self.space.notified())
                        .await
                        .is_err()
                    {
                        return if self.push(bytes) {
                            SendOutcome::Sent
                        } else {
                            SendOutcome::TimedOut
                        };
                    }
                }
            }
        }
    }

    /// Send without ever suspending, regardless of policy
    ///
    /// Safe to call from real-time device callbacks.
    pub fn try_send(&self, bytes: &[u8]) -> SendOutcome {
        if bytes.is_empty() {
            return SendOutcome::Sent;
        }

        if self.push(bytes) {
            SendOutcome::Sent
        } else {
            tracing::debug!(bytes = bytes.len(), "channel full, dropping newest item");
            SendOutcome::Dropped
        }
    }

    /// Receive up to `max_bytes`, waiting at most `timeout` for anything to arrive
    ///
    /// Returns as soon as any bytes are available. An empty result means the
    /// timeout elapsed with nothing buffered, which is not an error.
    pub async fn receive_upto(&self, max_bytes: usize, timeout: Duration) -> Vec<u8> {
        if max_bytes == 0 {
            return Vec::new();
        }

        let deadline = Instant::now() + timeout;
        loop {
            let bytes = self.try_receive_upto(max_bytes);
            if !bytes.is_empty() {
                return bytes;
            }
            if tokio::time::timeout_at(deadline, self.data.notified())
                .await
                .is_err()
            {
                return self.try_receive_upto(max_bytes);
            }
        }
    }

    /// Receive up to `max_bytes` without waiting
    #[must_use]
    pub fn try_receive_upto(&self, max_bytes: usize) -> Vec<u8> {
        let mut queue = self.lock();
        let n = max_bytes.min(queue.len());
        let bytes: Vec<u8> = queue.drain(..n).collect();
        drop(queue);

        if n > 0 {
            self.space.notify_one();
        }
        bytes
    }

    /// Copy up to `dst.len()` bytes into `dst` without waiting or allocating
    ///
    /// Returns the number of bytes written.
    pub fn try_receive_into(&self, dst: &mut [u8]) -> usize {
        let mut queue = self.lock();
        let n = dst.len().min(queue.len());
        for (slot, byte) in dst.iter_mut().zip(queue.drain(..n)) {
            *slot = byte;
        }
        drop(queue);

        if n > 0 {
            self.space.notify_one();
        }
        n
    }

    /// Wait until at least `min_bytes` are buffered
    ///
    /// Returns `false` if the timeout elapsed first.
    pub async fn wait_for_occupied(&self, min_bytes: usize, timeout: Duration) -> bool {
        let target = min_bytes.min(self.capacity);
        let deadline = Instant::now() + timeout;
        loop {
            if self.occupied_bytes() >= target {
                return true;
            }
            if tokio::time::timeout_at(deadline, self.data.notified())
                .await
                .is_err()
            {
                return self.occupied_bytes() >= target;
            }
        }
    }

    /// Discard everything buffered, returning how many bytes were dropped
    pub fn drain_all(&self) -> usize {
        let mut queue = self.lock();
        let dropped = queue.len();
        queue.clear();
        drop(queue);

        if dropped > 0 {
            self.space.notify_one();
        }
        dropped
    }

    fn push(&self, bytes: &[u8]) -> bool {
        let mut queue = self.lock();
        if self.capacity - queue.len() < bytes.len() {
            return false;
        }
        queue.extend(bytes);
        drop(queue);

        self.data.notify_one();
        true
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<u8>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    const SHORT: Duration = Duration::from_millis(20);

    fn channel(capacity: usize, policy: OverflowPolicy) -> BoundedByteChannel {
        BoundedByteChannel::new(capacity, policy).unwrap()
    }

    #[test]
    fn zero_capacity_is_a_config_error() {
        let err = BoundedByteChannel::new(0, OverflowPolicy::BlockWithTimeout).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn receives_bytes_in_order() {
        let ch = channel(16, OverflowPolicy::BlockWithTimeout);
        assert_eq!(ch.send(&[1, 2, 3], SHORT).await, SendOutcome::Sent);
        assert_eq!(ch.send(&[4, 5], SHORT).await, SendOutcome::Sent);
        assert_eq!(ch.occupied_bytes(), 5);

        assert_eq!(ch.receive_upto(4, SHORT).await, vec![1, 2, 3, 4]);
        assert_eq!(ch.receive_upto(4, SHORT).await, vec![5]);
        assert_eq!(ch.occupied_bytes(), 0);
    }

    #[tokio::test]
    async fn blocking_send_times_out_without_partial_write() {
        let ch = channel(8, OverflowPolicy::BlockWithTimeout);
        assert_eq!(ch.send(&[0; 6], SHORT).await, SendOutcome::Sent);

        assert_eq!(ch.send(&[1; 4], SHORT).await, SendOutcome::TimedOut);
        assert_eq!(ch.occupied_bytes(), 6);
    }

    #[tokio::test]
    async fn blocked_send_resumes_when_space_frees() {
        let ch = Arc::new(channel(8, OverflowPolicy::BlockWithTimeout));
        ch.send(&[0; 8], SHORT).await;

        let producer = {
            let ch = Arc::clone(&ch);
            tokio::spawn(async move { ch.send(&[7; 4], Duration::from_secs(2)).await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(ch.receive_upto(4, SHORT).await, vec![0; 4]);

        assert_eq!(producer.await.unwrap(), SendOutcome::Sent);
        assert_eq!(ch.occupied_bytes(), 8);
    }

    #[tokio::test]
    async fn drop_newest_never_blocks() {
        let ch = channel(4, OverflowPolicy::DropNewestOnFull);
        assert_eq!(ch.send(&[1, 2, 3], Duration::from_secs(5)).await, SendOutcome::Sent);

        let started = std::time::Instant::now();
        assert_eq!(ch.send(&[4, 5], Duration::from_secs(5)).await, SendOutcome::Dropped);
        assert!(started.elapsed() < Duration::from_secs(1));

        assert_eq!(ch.try_receive_upto(8), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn oversized_item_is_dropped() {
        let ch = channel(4, OverflowPolicy::BlockWithTimeout);
        assert_eq!(ch.send(&[0; 5], Duration::from_secs(5)).await, SendOutcome::Dropped);
        assert_eq!(ch.occupied_bytes(), 0);
    }

    #[tokio::test]
    async fn receive_returns_empty_on_timeout() {
        let ch = channel(4, OverflowPolicy::BlockWithTimeout);
        assert!(ch.receive_upto(4, SHORT).await.is_empty());
    }

    #[tokio::test]
    async fn receive_wakes_on_late_data() {
        let ch = Arc::new(channel(8, OverflowPolicy::BlockWithTimeout));
        let consumer = {
            let ch = Arc::clone(&ch);
            tokio::spawn(async move { ch.receive_upto(8, Duration::from_secs(2)).await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        ch.send(&[9, 9], SHORT).await;

        assert_eq!(consumer.await.unwrap(), vec![9, 9]);
    }

    #[tokio::test]
    async fn wait_for_occupied_sees_threshold() {
        let ch = channel(8, OverflowPolicy::BlockWithTimeout);
        ch.send(&[0; 3], SHORT).await;
        assert!(!ch.wait_for_occupied(4, SHORT).await);

        ch.send(&[0; 1], SHORT).await;
        assert!(ch.wait_for_occupied(4, SHORT).await);
    }

    #[test]
    fn receive_into_copies_without_allocating() {
        let ch = channel(8, OverflowPolicy::DropNewestOnFull);
        ch.try_send(&[1, 2, 3]);

        let mut dst = [0u8; 2];
        assert_eq!(ch.try_receive_into(&mut dst), 2);
        assert_eq!(dst, [1, 2]);
        assert_eq!(ch.occupied_bytes(), 1);
    }

    #[test]
    fn drain_all_empties_channel() {
        let ch = channel(8, OverflowPolicy::DropNewestOnFull);
        ch.try_send(&[1; 6]);
        assert_eq!(ch.drain_all(), 6);
        assert_eq!(ch.occupied_bytes(), 0);
        assert_eq!(ch.free_bytes(), 8);
    }

    #[test]
    fn occupancy_stays_within_capacity() {
        let ch = channel(64, OverflowPolicy::DropNewestOnFull);

        // Deterministic xorshift so failures reproduce
        let mut state: u32 = 0x9E37_79B9;
        let mut next = move || {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            state
        };

        let mut expected = 0usize;
        for _ in 0..5_000 {
            let len = (next() % 40) as usize;
            if next() % 2 == 0 {
                if ch.try_send(&vec![0xAB; len]) == SendOutcome::Sent {
                    expected += len;
                }
            } else {
                expected -= ch.try_receive_upto(len).len();
            }

            let occupied = ch.occupied_bytes();
            assert!(occupied <= ch.capacity());
            assert_eq!(occupied, expected);
        }
    }
}
