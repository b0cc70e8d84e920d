#![deny(unsafe_code)]
#![deny(missing_docs)]

//! # Overview
//!
//! `transfer` is the hand-off point between the worker pool, which produces
//! framed transfer blocks in whatever order its tasks finish, and the channel
//! writer, which must emit them in message order. Producers reserve a
//! monotone message number up front and commit the finished bytes later; the
//! consumer drains strictly in numeric order and blocks on gaps left by
//! still-running tasks.
//!
//! # Design
//!
//! One mutex guards the segment map and cursors; a condition variable wakes
//! the consumer when the next-in-line segment is committed. Delivered
//! segments stay retained until [`TransferQueue::acknowledge`] advances the
//! start cursor, so a reconnecting peer can be replayed from its last
//! acknowledged message number without the producers re-running.
//!
//! # Invariants
//!
//! - Message numbers are assigned at reservation time and never reused.
//! - The consumer observes segments in strictly increasing number order.
//! - `acknowledged <= drained <= reserved` at all times.
//! - After [`TransferQueue::stop`], the consumer drains every segment
//!   reserved before the stop point and then observes shutdown.

use std::collections::BTreeMap;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// Errors raised on misuse of the queue cursors.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    /// A commit referenced a message number that was never reserved.
    #[error("commit for unreserved message number {number}")]
    UnknownMessage {
        /// Offending message number.
        number: u64,
    },

    /// An acknowledgement ran past what has been handed to the consumer.
    #[error("acknowledgement of {number} exceeds drained cursor {drained}")]
    AckBeyondDrained {
        /// Acknowledged number.
        number: u64,
        /// Current drain cursor.
        drained: u64,
    },
}

/// One committed transfer segment.
#[derive(Clone, Debug)]
pub struct Segment {
    /// Position in the total order of the session.
    pub number: u64,
    /// Framed block bytes, ready for the channel.
    pub bytes: Arc<[u8]>,
}

enum Slot {
    Pending,
    Ready(Arc<[u8]>),
}

struct State {
    segments: BTreeMap<u64, Slot>,
    /// Next number handed out by `reserve`.
    reserved: u64,
    /// Next number the consumer will deliver.
    drained: u64,
    /// Lowest retained number; everything below has been acknowledged.
    acknowledged: u64,
    /// Set once `stop` is called; records the cut-off number.
    stop_at: Option<u64>,
}

/// Ordered queue of transfer segments shared by producers and one consumer.
pub struct TransferQueue {
    state: Mutex<State>,
    ready: Condvar,
}

impl Default for TransferQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl TransferQueue {
    /// Creates an empty queue with cursors at zero.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                segments: BTreeMap::new(),
                reserved: 0,
                drained: 0,
                acknowledged: 0,
                stop_at: None,
            }),
            ready: Condvar::new(),
        }
    }

    /// Reserves the next message number for a producer task.
    ///
    /// The consumer will not proceed past this number until the matching
    /// [`commit`](Self::commit) lands.
    pub fn reserve(&self) -> u64 {
        let mut state = self.state.lock().unwrap();
        let number = state.reserved;
        state.reserved += 1;
        state.segments.insert(number, Slot::Pending);
        number
    }

    /// Fills a previously reserved slot with its finished bytes.
    pub fn commit(&self, number: u64, bytes: Vec<u8>) -> Result<(), TransferError> {
        let mut state = self.state.lock().unwrap();
        match state.segments.get_mut(&number) {
            Some(slot @ Slot::Pending) => {
                *slot = Slot::Ready(bytes.into());
                self.ready.notify_all();
                Ok(())
            }
            _ => Err(TransferError::UnknownMessage { number }),
        }
    }

    /// Reserves and commits in one step, for bytes produced inline.
    pub fn push(&self, bytes: Vec<u8>) -> u64 {
        let mut state = self.state.lock().unwrap();
        let number = state.reserved;
        state.reserved += 1;
        state.segments.insert(number, Slot::Ready(bytes.into()));
        self.ready.notify_all();
        number
    }

    /// Enqueues the shutdown sentinel.
    ///
    /// The consumer drains every segment reserved before this call and then
    /// sees `None` from the draining calls.
    pub fn stop(&self) {
        let mut state = self.state.lock().unwrap();
        if state.stop_at.is_none() {
            state.stop_at = Some(state.reserved);
        }
        self.ready.notify_all();
    }

    /// Whether the consumer has drained everything before the stop point.
    pub fn is_finished(&self) -> bool {
        let state = self.state.lock().unwrap();
        matches!(state.stop_at, Some(stop) if state.drained >= stop)
    }

    /// Delivers the next segment if it is already committed.
    ///
    /// Returns `Ok(None)` when the next segment is pending, not yet
    /// reserved, or past the stop point.
    pub fn try_next(&self) -> Option<Segment> {
        let mut state = self.state.lock().unwrap();
        Self::take_ready(&mut state)
    }

    /// Delivers the next segment, waiting up to `timeout` for a gap to fill.
    pub fn next_timeout(&self, timeout: Duration) -> Option<Segment> {
        let mut state = self.state.lock().unwrap();
        loop {
            if let Some(segment) = Self::take_ready(&mut state) {
                return Some(segment);
            }
            if matches!(state.stop_at, Some(stop) if state.drained >= stop) {
                return None;
            }
            let (next, timed_out) = self.ready.wait_timeout(state, timeout).unwrap();
            state = next;
            if timed_out.timed_out() {
                return Self::take_ready(&mut state);
            }
        }
    }

    fn take_ready(state: &mut State) -> Option<Segment> {
        if matches!(state.stop_at, Some(stop) if state.drained >= stop) {
            return None;
        }
        let number = state.drained;
        match state.segments.get(&number) {
            Some(Slot::Ready(bytes)) => {
                let segment = Segment {
                    number,
                    bytes: Arc::clone(bytes),
                };
                state.drained += 1;
                Some(segment)
            }
            _ => None,
        }
    }

    /// Drops retained segments below `number`; the peer confirmed receipt.
    pub fn acknowledge(&self, number: u64) -> Result<(), TransferError> {
        let mut state = self.state.lock().unwrap();
        if number > state.drained {
            return Err(TransferError::AckBeyondDrained {
                number,
                drained: state.drained,
            });
        }
        while state.acknowledged < number {
            let acknowledged = state.acknowledged;
            state.segments.remove(&acknowledged);
            state.acknowledged += 1;
        }
        Ok(())
    }

    /// Clones the retained, already-delivered segments numbered `from` and
    /// up, oldest first, for replay after a reconnect.
    pub fn replay_from(&self, from: u64) -> Vec<Segment> {
        let state = self.state.lock().unwrap();
        state
            .segments
            .range(from..state.drained)
            .filter_map(|(&number, slot)| match slot {
                Slot::Ready(bytes) => Some(Segment {
                    number,
                    bytes: Arc::clone(bytes),
                }),
                Slot::Pending => None,
            })
            .collect()
    }

    /// Next message number the consumer will deliver.
    pub fn drained(&self) -> u64 {
        self.state.lock().unwrap().drained
    }

    /// Next message number `reserve` will hand out.
    pub fn reserved(&self) -> u64 {
        self.state.lock().unwrap().reserved
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn segments_drain_in_number_order() {
        let queue = TransferQueue::new();
        let a = queue.reserve();
        let b = queue.reserve();
        queue.commit(b, vec![2]).expect("commit b");
        // The consumer must wait for `a` even though `b` is ready.
        assert!(queue.try_next().is_none());
        queue.commit(a, vec![1]).expect("commit a");
        assert_eq!(&*queue.try_next().expect("first").bytes, &[1]);
        assert_eq!(&*queue.try_next().expect("second").bytes, &[2]);
        assert!(queue.try_next().is_none());
    }

    #[test]
    fn out_of_order_commits_resolve_under_blocking_drain() {
        let queue = Arc::new(TransferQueue::new());
        let numbers: Vec<u64> = (0..8).map(|_| queue.reserve()).collect();
        let producer = {
            let queue = Arc::clone(&queue);
            let numbers = numbers.clone();
            thread::spawn(move || {
                for &number in numbers.iter().rev() {
                    queue
                        .commit(number, number.to_le_bytes().to_vec())
                        .expect("commit");
                }
            })
        };
        for expected in &numbers {
            let segment = queue
                .next_timeout(Duration::from_secs(5))
                .expect("segment before timeout");
            assert_eq!(segment.number, *expected);
        }
        producer.join().expect("producer");
    }

    #[test]
    fn stop_is_observed_only_after_drain() {
        let queue = TransferQueue::new();
        queue.push(vec![9]);
        queue.stop();
        assert!(!queue.is_finished());
        assert!(queue.try_next().is_some());
        assert!(queue.try_next().is_none());
        assert!(queue.is_finished());
        assert!(queue.next_timeout(Duration::from_millis(10)).is_none());
    }

    #[test]
    fn commit_to_unreserved_number_fails() {
        let queue = TransferQueue::new();
        assert!(matches!(
            queue.commit(3, vec![]),
            Err(TransferError::UnknownMessage { number: 3 })
        ));
    }

    #[test]
    fn retained_segments_replay_until_acknowledged() {
        let queue = TransferQueue::new();
        for i in 0..4u8 {
            queue.push(vec![i]);
        }
        while queue.try_next().is_some() {}
        assert_eq!(queue.replay_from(0).len(), 4);
        queue.acknowledge(2).expect("ack");
        let tail = queue.replay_from(0);
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].number, 2);
        assert!(queue.replay_from(3).len() == 1);
    }

    #[test]
    fn acknowledge_cannot_pass_the_drain_cursor() {
        let queue = TransferQueue::new();
        queue.push(vec![1]);
        assert!(matches!(
            queue.acknowledge(1),
            Err(TransferError::AckBeyondDrained { .. })
        ));
        queue.try_next().expect("drain");
        queue.acknowledge(1).expect("ack after drain");
    }
}
