//! Fan-out hub: distributes one conversation's message stream to any
//! number of subscribers, each behind a bounded buffer so a slow consumer
//! cannot block the parser loop or other subscribers.
//!
//! Per-subscriber bounded `mpsc` channels rather than one shared broadcast
//! channel, so a single slow subscriber can be dropped without penalizing
//! the others.

use std::collections::HashMap;

use tokio::sync::mpsc;
use tracing::warn;
use uuid::Uuid;

use crate::schema::Message;

/// A frame delivered to a live subscriber over its channel.
#[derive(Debug, Clone)]
pub enum SubscriberEvent {
    Message(Message),
    /// This subscriber's buffer overflowed and it has been dropped.
    BackpressureDropped,
}

pub type SubscriberId = Uuid;

/// Owns the live subscriber set for one conversation. Guarded by a mutex
/// internal to the runtime; the parser publishes by iterating the current
/// subscriber set directly.
#[derive(Default)]
pub struct SubscriberHub {
    subscribers: HashMap<SubscriberId, mpsc::Sender<SubscriberEvent>>,
}

impl SubscriberHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new live subscriber with the given buffer capacity,
    /// returning its id (for unsubscribe) and the receiving half. The
    /// underlying channel is sized one slot larger than `capacity`: that
    /// extra slot is reserved for the `BackpressureDropped` control frame
    /// so it is never itself lost to the backpressure it reports.
    pub fn subscribe(&mut self, capacity: usize) -> (SubscriberId, mpsc::Receiver<SubscriberEvent>) {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(capacity.max(1) + 1);
        self.subscribers.insert(id, tx);
        (id, rx)
    }

    pub fn unsubscribe(&mut self, id: SubscriberId) {
        self.subscribers.remove(&id);
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }

    /// Publishes one message to every live subscriber. A subscriber whose
    /// buffer is full is sent a single `BackpressureDropped` frame on a
    /// best-effort basis and then removed.
    ///
    /// Once only the reserved slot remains (`capacity() <= 1`), the
    /// message is not queued at all — it is replaced by the drop frame, so
    /// that frame always has room and is never itself silently dropped by
    /// a channel that is already full of undelivered messages.
    pub fn publish(&mut self, message: Message) {
        let mut dropped = Vec::new();
        for (id, tx) in self.subscribers.iter() {
            if tx.capacity() <= 1 {
                warn!(subscriber = %id, "subscriber buffer full, dropping");
                let _ = tx.try_send(SubscriberEvent::BackpressureDropped);
                dropped.push(*id);
                continue;
            }
            match tx.try_send(SubscriberEvent::Message(message.clone())) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(subscriber = %id, "subscriber buffer full, dropping");
                    let _ = tx.try_send(SubscriberEvent::BackpressureDropped);
                    dropped.push(*id);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    dropped.push(*id);
                }
            }
        }
        for id in dropped {
            self.subscribers.remove(&id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ContentBlock, Message};

    fn text(n: &str) -> Message {
        Message::new("c1", None, ContentBlock::Text { content: n.into() })
    }

    #[tokio::test]
    async fn two_subscribers_attached_before_first_message_see_same_order() {
        let mut hub = SubscriberHub::new();
        let (_id1, mut rx1) = hub.subscribe(16);
        let (_id2, mut rx2) = hub.subscribe(16);

        for n in ["a", "b", "c"] {
            hub.publish(text(n));
        }

        for expected in ["a", "b", "c"] {
            let SubscriberEvent::Message(m1) = rx1.recv().await.unwrap() else { panic!() };
            let SubscriberEvent::Message(m2) = rx2.recv().await.unwrap() else { panic!() };
            assert_eq!(m1.block, ContentBlock::Text { content: expected.into() });
            assert_eq!(m2.block, ContentBlock::Text { content: expected.into() });
        }
    }

    #[tokio::test]
    async fn full_buffer_drops_subscriber_with_backpressure_frame() {
        let mut hub = SubscriberHub::new();
        let (_slow_id, mut slow_rx) = hub.subscribe(4);
        let (_fast_id, mut fast_rx) = hub.subscribe(1000);

        for i in 0..1000 {
            hub.publish(text(&i.to_string()));
        }

        // The slow subscriber's queue holds its first 4 messages, then a
        // BackpressureDropped frame, and nothing further.
        for _ in 0..4 {
            assert!(matches!(slow_rx.recv().await.unwrap(), SubscriberEvent::Message(_)));
        }
        assert!(matches!(slow_rx.recv().await.unwrap(), SubscriberEvent::BackpressureDropped));

        let mut fast_count = 0;
        while let Ok(event) = fast_rx.try_recv() {
            if matches!(event, SubscriberEvent::Message(_)) {
                fast_count += 1;
            }
        }
        assert_eq!(fast_count, 1000);
    }

    #[test]
    fn unsubscribe_removes_from_hub() {
        let mut hub = SubscriberHub::new();
        let (id, _rx) = hub.subscribe(8);
        assert!(!hub.is_empty());
        hub.unsubscribe(id);
        assert!(hub.is_empty());
    }
}
