// Bounded frame queue between the capture and decode threads

use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};

use crate::config::OverflowPolicy;
use crate::video::RawFrame;

/// Evictions attempted before a push gives up and drops the new frame
const MAX_EVICT_ATTEMPTS: usize = 3;

/// Result of a non-blocking push
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// Queue was full; the pushed frame was discarded
    DroppedNewest,
    /// Queue was full; the oldest queued frame was discarded
    EvictedOldest,
}

impl PushOutcome {
    /// Whether a frame was lost
    pub fn dropped(self) -> bool {
        self != PushOutcome::Queued
    }
}

/// The decode side is gone
#[derive(Debug, thiserror::Error)]
#[error("Frame queue closed")]
pub struct QueueClosed;

/// Sending half of a capture queue. Never blocks.
pub struct FrameQueue {
    tx: Sender<RawFrame>,
    // Only held for EvictOldest
    evict: Option<Receiver<RawFrame>>,
    policy: OverflowPolicy,
    consumer_alive: Arc<AtomicBool>,
}

/// Receiving half of a capture queue.
///
/// Dropping it, including during a panic unwind, closes the queue for the
/// sender even when the sender holds its own receiver for evictions.
pub struct FrameReceiver {
    rx: Receiver<RawFrame>,
    alive: Arc<AtomicBool>,
}

impl Deref for FrameReceiver {
    type Target = Receiver<RawFrame>;

    fn deref(&self) -> &Receiver<RawFrame> {
        &self.rx
    }
}

impl Drop for FrameReceiver {
    fn drop(&mut self) {
        self.alive.store(false, Ordering::Release);
    }
}

/// Create a capture queue of `capacity` frames (at least one)
pub fn frame_queue(capacity: usize, policy: OverflowPolicy) -> (FrameQueue, FrameReceiver) {
    let (tx, rx) = bounded(capacity.max(1));
    let evict = match policy {
        OverflowPolicy::DropNewest => None,
        OverflowPolicy::EvictOldest => Some(rx.clone()),
    };
    let alive = Arc::new(AtomicBool::new(true));
    let queue = FrameQueue {
        tx,
        evict,
        policy,
        consumer_alive: alive.clone(),
    };
    (queue, FrameReceiver { rx, alive })
}

impl FrameQueue {
    pub fn policy(&self) -> OverflowPolicy {
        self.policy
    }

    /// Enqueue without blocking, applying the overflow policy when full
    pub fn push(&self, frame: RawFrame) -> Result<PushOutcome, QueueClosed> {
        if !self.consumer_alive.load(Ordering::Acquire) {
            return Err(QueueClosed);
        }

        let mut frame = frame;
        let mut evicted = false;

        for _ in 0..=MAX_EVICT_ATTEMPTS {
            match self.tx.try_send(frame) {
                Ok(()) => {
                    return Ok(if evicted {
                        PushOutcome::EvictedOldest
                    } else {
                        PushOutcome::Queued
                    });
                }
                Err(TrySendError::Full(rejected)) => match &self.evict {
                    None => return Ok(PushOutcome::DroppedNewest),
                    Some(rx) => {
                        // The consumer may have emptied a slot in the meantime
                        if rx.try_recv().is_ok() {
                            evicted = true;
                        }
                        frame = rejected;
                    }
                },
                Err(TrySendError::Disconnected(_)) => return Err(QueueClosed),
            }
        }

        Ok(PushOutcome::DroppedNewest)
    }

    pub fn len(&self) -> usize {
        self.tx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tx.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(seq: u64) -> RawFrame {
        RawFrame::new(vec![0xFF, 0xD8, seq as u8, 0xFF, 0xD9], seq)
    }

    fn drain(rx: &FrameReceiver) -> Vec<u64> {
        rx.try_iter().map(|f| f.sequence).collect()
    }

    #[test]
    fn drop_newest_keeps_first_k() {
        let (queue, rx) = frame_queue(5, OverflowPolicy::DropNewest);

        let dropped = (0..12)
            .map(|i| queue.push(frame(i)).unwrap())
            .filter(|o| o.dropped())
            .count();

        assert_eq!(dropped, 7);
        assert_eq!(drain(&rx), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn evict_oldest_keeps_last_k() {
        let (queue, rx) = frame_queue(5, OverflowPolicy::EvictOldest);

        let outcomes: Vec<_> = (0..12).map(|i| queue.push(frame(i)).unwrap()).collect();

        assert_eq!(outcomes.iter().filter(|o| o.dropped()).count(), 7);
        assert!(outcomes[5..].iter().all(|o| *o == PushOutcome::EvictedOldest));
        assert_eq!(drain(&rx), vec![7, 8, 9, 10, 11]);
    }

    #[test]
    fn push_after_consumer_gone_is_closed() {
        let (queue, rx) = frame_queue(2, OverflowPolicy::DropNewest);
        drop(rx);
        assert!(queue.push(frame(0)).is_err());
    }

    #[test]
    fn evicting_queue_closes_when_consumer_is_gone() {
        let (queue, rx) = frame_queue(2, OverflowPolicy::EvictOldest);
        assert_eq!(queue.push(frame(0)).unwrap(), PushOutcome::Queued);
        drop(rx);

        let outcomes: Vec<_> = (1..5).map(|i| queue.push(frame(i))).collect();
        assert!(outcomes.iter().all(|o| matches!(o, Err(QueueClosed))));
    }

    #[test]
    fn consumer_panic_closes_the_queue() {
        let (queue, rx) = frame_queue(2, OverflowPolicy::EvictOldest);
        let consumer = std::thread::spawn(move || {
            let _rx = rx;
            panic!("decoder blew up");
        });
        assert!(consumer.join().is_err());
        assert!(queue.push(frame(0)).is_err());
    }

    #[test]
    fn zero_capacity_is_clamped() {
        let (queue, rx) = frame_queue(0, OverflowPolicy::DropNewest);
        assert_eq!(queue.push(frame(0)).unwrap(), PushOutcome::Queued);
        assert_eq!(queue.push(frame(1)).unwrap(), PushOutcome::DroppedNewest);
        assert_eq!(drain(&rx), vec![0]);
    }
}
