//! Fan-out with snapshot-then-live subscriptions.
//!
//! Every subscriber owns an unbounded queue, so a slow reader delays only
//! itself and never loses an event.

use std::sync::{Mutex, MutexGuard, PoisonError};

use futures_util::stream::{self, BoxStream, StreamExt};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;

pub type EventStream<T> = BoxStream<'static, T>;

/// Multi-subscriber event bus.
///
/// The bus itself holds no state. Owners that offer snapshot semantics must
/// call [`publish`](Self::publish) and
/// [`subscribe_with_snapshot`](Self::subscribe_with_snapshot) under the same
/// lock that guards the state being snapshotted; that way an event is either
/// part of the snapshot or delivered live, never both and never neither.
pub struct EventBus<T> {
    subscribers: Mutex<Vec<UnboundedSender<T>>>,
}

impl<T> Default for EventBus<T>
where
    T: Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> EventBus<T>
where
    T: Clone + Send + 'static,
{
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
        }
    }

    fn subscribers(&self) -> MutexGuard<'_, Vec<UnboundedSender<T>>> {
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queues `event` for every current subscriber and forgets the ones whose
    /// stream has been dropped. Having none is not an error.
    pub fn publish(&self, event: T) {
        self.subscribers().retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        let mut subscribers = self.subscribers();
        subscribers.retain(|tx| !tx.is_closed());
        subscribers.len()
    }

    /// Live events only.
    pub fn subscribe(&self) -> EventStream<T> {
        self.subscribe_with_snapshot(Vec::new())
    }

    /// Yields `snapshot` first, then every event published after this call.
    pub fn subscribe_with_snapshot(&self, snapshot: Vec<T>) -> EventStream<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        for event in snapshot {
            // The receiver is still in hand, so this cannot fail.
            let _ = tx.send(event);
        }
        self.subscribers().push(tx);
        drain(rx).boxed()
    }
}

fn drain<T>(rx: UnboundedReceiver<T>) -> impl futures_util::Stream<Item = T>
where
    T: Send + 'static,
{
    stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|event| (event, rx)) })
}

/// Drives `stream` on a background task, handing every event to `callback`.
pub fn spawn_subscriber<T, F>(mut stream: EventStream<T>, mut callback: F) -> JoinHandle<()>
where
    T: Send + 'static,
    F: FnMut(T) + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(event) = stream.next().await {
            callback(event);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn snapshot_precedes_live_events() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe_with_snapshot(vec![1, 2]);
        bus.publish(3);

        assert_eq!(sub.next().await, Some(1));
        assert_eq!(sub.next().await, Some(2));
        assert_eq!(sub.next().await, Some(3));
    }

    #[tokio::test]
    async fn every_subscriber_sees_events_in_order() {
        let bus = EventBus::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);

        bus.publish("x");
        bus.publish("y");

        assert_eq!(a.next().await, Some("x"));
        assert_eq!(a.next().await, Some("y"));
        assert_eq!(b.next().await, Some("x"));
        assert_eq!(b.next().await, Some("y"));
    }

    #[tokio::test]
    async fn stream_ends_when_bus_dropped() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe();
        drop(bus);
        assert_eq!(sub.next().await, None::<u8>);
    }

    #[tokio::test]
    async fn burst_larger_than_any_buffer_is_delivered() {
        let bus = EventBus::new();
        let sub = bus.subscribe_with_snapshot(vec![0]);
        for i in 1..=5_000u32 {
            bus.publish(i);
        }
        drop(bus);

        let received: Vec<u32> = sub.collect().await;
        assert_eq!(received, (0..=5_000).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn dropped_subscribers_are_pruned() {
        let bus = EventBus::new();
        let kept = bus.subscribe();
        let gone = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);

        drop(gone);
        bus.publish(1u8);
        assert_eq!(bus.subscriber_count(), 1);
        drop(kept);
        assert_eq!(bus.subscriber_count(), 0);
    }
}
