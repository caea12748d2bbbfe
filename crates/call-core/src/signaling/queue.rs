//! Gated FIFO message queue.
//!
//! A queue starts suspended. While suspended, messages whose
//! [`Enqueue::enqueue`] predicate is `true` are buffered and every other
//! message is dropped with a log line. [`MessageQueue::resume`] drains the
//! buffer in order before opening the fast path, under the same lock, so a
//! message pushed after resume can never overtake a buffered one.

use std::collections::VecDeque;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use super::messages::Enqueue;
use crate::observability::metrics;

/// What happened to a pushed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Handed to the consumer.
    Delivered,
    /// Held until the queue resumes.
    Buffered,
    /// Discarded.
    Dropped,
}

impl Disposition {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Disposition::Delivered => "delivered",
            Disposition::Buffered => "buffered",
            Disposition::Dropped => "dropped",
        }
    }
}

#[derive(Debug)]
struct QueueState<M> {
    resumed: bool,
    buffer: VecDeque<M>,
}

/// Gated FIFO feeding a single consumer.
#[derive(Debug)]
pub struct MessageQueue<M> {
    direction: &'static str,
    state: Mutex<QueueState<M>>,
    tx: mpsc::UnboundedSender<M>,
}

impl<M: Enqueue + Send> MessageQueue<M> {
    /// Create a suspended queue and the receiver its consumer reads from.
    #[must_use]
    pub fn new(direction: &'static str) -> (Self, mpsc::UnboundedReceiver<M>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let queue = Self {
            direction,
            state: Mutex::new(QueueState {
                resumed: false,
                buffer: VecDeque::new(),
            }),
            tx,
        };
        (queue, rx)
    }

    /// Offer a message to the queue.
    pub async fn push(&self, message: M) -> Disposition {
        let label = message.label();
        let mut state = self.state.lock().await;

        let disposition = if state.resumed {
            self.forward(message)
        } else if message.enqueue() {
            state.buffer.push_back(message);
            Disposition::Buffered
        } else {
            debug!(
                target: "call.signaling",
                direction = self.direction,
                message_type = label,
                "Queue suspended, dropping message"
            );
            Disposition::Dropped
        };
        drop(state);

        metrics::record_signaling_message(self.direction, label, disposition.as_str());
        disposition
    }

    /// Drain buffered messages in order, then open the fast path.
    /// Returns the number of messages drained.
    pub async fn resume(&self) -> usize {
        let mut state = self.state.lock().await;
        if state.resumed {
            return 0;
        }

        let mut drained = 0;
        while let Some(message) = state.buffer.pop_front() {
            if self.forward(message) == Disposition::Delivered {
                drained += 1;
            }
        }
        state.resumed = true;

        debug!(
            target: "call.signaling",
            direction = self.direction,
            drained,
            "Queue resumed"
        );
        drained
    }

    /// Close the gate again. Later pushes buffer or drop.
    pub async fn suspend(&self) {
        self.state.lock().await.resumed = false;
    }

    /// Discard buffered messages.
    pub async fn clear(&self) -> usize {
        let mut state = self.state.lock().await;
        let discarded = state.buffer.len();
        state.buffer.clear();
        discarded
    }

    pub async fn is_resumed(&self) -> bool {
        self.state.lock().await.resumed
    }

    pub async fn buffered(&self) -> usize {
        self.state.lock().await.buffer.len()
    }

    fn forward(&self, message: M) -> Disposition {
        let label = message.label();
        if self.tx.send(message).is_err() {
            warn!(
                target: "call.signaling",
                direction = self.direction,
                message_type = label,
                "Queue consumer gone, dropping message"
            );
            return Disposition::Dropped;
        }
        Disposition::Delivered
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Msg {
        name: &'static str,
        buffered: bool,
    }

    impl Enqueue for Msg {
        fn enqueue(&self) -> bool {
            self.buffered
        }

        fn label(&self) -> &'static str {
            self.name
        }
    }

    fn buffered(name: &'static str) -> Msg {
        Msg {
            name,
            buffered: true,
        }
    }

    fn control(name: &'static str) -> Msg {
        Msg {
            name,
            buffered: false,
        }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Msg>) -> Vec<&'static str> {
        let mut names = Vec::new();
        while let Ok(message) = rx.try_recv() {
            names.push(message.name);
        }
        names
    }

    #[tokio::test]
    async fn test_resume_drains_in_order_before_fast_path() {
        let (queue, mut rx) = MessageQueue::new("outbound");

        assert_eq!(queue.push(buffered("A")).await, Disposition::Buffered);
        assert_eq!(queue.push(buffered("B")).await, Disposition::Buffered);
        assert_eq!(queue.push(buffered("C")).await, Disposition::Buffered);
        assert!(drain(&mut rx).is_empty());

        assert_eq!(queue.resume().await, 3);
        assert_eq!(queue.push(control("D")).await, Disposition::Delivered);

        assert_eq!(drain(&mut rx), vec!["A", "B", "C", "D"]);
    }

    #[tokio::test]
    async fn test_non_enqueueable_dropped_while_suspended() {
        let (queue, mut rx) = MessageQueue::new("outbound");

        assert_eq!(queue.push(control("accept")).await, Disposition::Dropped);
        queue.resume().await;

        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_suspend_closes_gate_again() {
        let (queue, mut rx) = MessageQueue::new("inbound");
        queue.resume().await;
        queue.suspend().await;

        assert!(!queue.is_resumed().await);
        assert_eq!(queue.push(buffered("late")).await, Disposition::Buffered);
        assert_eq!(queue.buffered().await, 1);
        assert_eq!(queue.clear().await, 1);
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_resume_is_idempotent() {
        let (queue, mut rx) = MessageQueue::new("inbound");
        queue.push(buffered("A")).await;

        assert_eq!(queue.resume().await, 1);
        assert_eq!(queue.resume().await, 0);
        assert_eq!(drain(&mut rx), vec!["A"]);
    }

    #[tokio::test]
    async fn test_consumer_gone_drops() {
        let (queue, rx) = MessageQueue::new("outbound");
        drop(rx);
        queue.resume().await;

        assert_eq!(queue.push(control("end")).await, Disposition::Dropped);
    }
}
