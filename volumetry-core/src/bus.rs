//! Fan-out of typed events to realtime subscribers.
//!
//! Each subscriber gets its own bounded buffer. A publisher never waits: a
//! full buffer disconnects that subscriber (the websocket layer observes the
//! closed channel and drops the connection).

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use volumetry_model::BusMessage;

pub const DEFAULT_SUBSCRIBER_BUFFER: usize = 256;

#[derive(Debug)]
pub struct EventBus {
    subscribers: DashMap<Uuid, mpsc::Sender<BusMessage>>,
    buffer: usize,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_SUBSCRIBER_BUFFER)
    }
}

impl EventBus {
    pub fn new(buffer: usize) -> Self {
        Self {
            subscribers: DashMap::new(),
            buffer: buffer.max(1),
        }
    }

    pub fn subscribe(&self) -> (Uuid, mpsc::Receiver<BusMessage>) {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(self.buffer);
        self.subscribers.insert(id, tx);
        (id, rx)
    }

    pub fn unsubscribe(&self, id: Uuid) {
        self.subscribers.remove(&id);
    }

    /// Deliver to every subscriber whose buffer has room; disconnect the
    /// rest. Publish order is preserved per subscriber because each message
    /// lands in its channel before the publisher returns.
    pub fn publish(&self, message: &BusMessage) {
        let mut slow: Vec<Uuid> = Vec::new();
        for entry in self.subscribers.iter() {
            match entry.value().try_send(message.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    debug!(subscriber = %entry.key(), "disconnecting slow subscriber");
                    slow.push(*entry.key());
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    slow.push(*entry.key());
                }
            }
        }
        for id in slow {
            self.subscribers.remove(&id);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_messages_in_publish_order() {
        let bus = EventBus::new(16);
        let (_, mut rx) = bus.subscribe();

        bus.publish(&BusMessage::scan_error("a", "queue_full", "full"));
        bus.publish(&BusMessage::scan_error("b", "queue_full", "full"));

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        match (first, second) {
            (
                BusMessage::ScanError { volume_id: a, .. },
                BusMessage::ScanError { volume_id: b, .. },
            ) => {
                assert_eq!(a, "a");
                assert_eq!(b, "b");
            }
            other => panic!("unexpected frames: {other:?}"),
        }
    }

    #[tokio::test]
    async fn slow_subscriber_is_disconnected_not_waited_on() {
        let bus = EventBus::new(1);
        let (_, mut rx) = bus.subscribe();

        bus.publish(&BusMessage::pong());
        // buffer is full now; the next publish drops the subscriber
        bus.publish(&BusMessage::pong());
        assert_eq!(bus.subscriber_count(), 0);

        // the buffered frame still drains, then the channel reports closed
        assert!(rx.recv().await.is_some());
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn unsubscribe_removes_the_channel() {
        let bus = EventBus::new(4);
        let (id, mut rx) = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);

        bus.unsubscribe(id);
        assert_eq!(bus.subscriber_count(), 0);
        assert!(rx.recv().await.is_none());
    }
}
