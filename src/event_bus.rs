//! Generic typed publish/subscribe primitive (C12).
//!
//! Each component defines its own event type (`LifecycleEvent`, connection
//! events, registry events, ...) and owns a `Topic<Event>`. Subscribers get a
//! `broadcast::Receiver` and decide themselves how to consume it; a listener
//! that panics inside its own task never takes other subscribers down with
//! it, since each subscriber drives its own receive loop.

use tokio::sync::broadcast;

const DEFAULT_CAPACITY: usize = 256;

/// A single named event topic carrying values of type `T`.
pub struct Topic<T> {
    sender: broadcast::Sender<T>,
}

impl<T: Clone + Send + 'static> Topic<T> {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Topic { sender }
    }

    /// Registers a new listener. Each subscriber sees every event published
    /// after this call, in publication order.
    pub fn subscribe(&self) -> broadcast::Receiver<T> {
        self.sender.subscribe()
    }

    /// Publishes an event. Returns the number of active listeners; `Ok(0)`
    /// (no listeners) is not an error — events are fire-and-forget.
    pub fn publish(&self, event: T) -> usize {
        self.sender.send(event).unwrap_or(0)
    }

    pub fn listener_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Drops every current subscriber's ability to receive further events by
    /// replacing the underlying channel. Already-queued events for existing
    /// receivers are unaffected; new `subscribe()` calls attach to the fresh
    /// channel.
    pub fn remove_all_listeners(&mut self) {
        let (sender, _) = broadcast::channel(DEFAULT_CAPACITY);
        self.sender = sender;
    }
}

impl<T: Clone + Send + 'static> Default for Topic<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Awaits exactly one event from `topic`, then stops listening. Mirrors the
/// "one-shot subscription" requirement without requiring callers to manage
/// receiver lifetime themselves.
pub async fn once<T: Clone + Send + 'static>(topic: &Topic<T>) -> Option<T> {
    let mut rx = topic.subscribe();
    rx.recv().await.ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_published_events_in_order() {
        let topic: Topic<u32> = Topic::new();
        let mut rx = topic.subscribe();
        topic.publish(1);
        topic.publish(2);
        assert_eq!(rx.recv().await.unwrap(), 1);
        assert_eq!(rx.recv().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn once_resolves_with_next_event_only() {
        let topic: Topic<u32> = Topic::new();
        let wait = tokio::spawn({
            let mut rx = topic.subscribe();
            async move { rx.recv().await.unwrap() }
        });
        topic.publish(42);
        assert_eq!(wait.await.unwrap(), 42);
    }

    #[tokio::test]
    async fn remove_all_listeners_detaches_old_subscribers() {
        let mut topic: Topic<u32> = Topic::new();
        let mut rx = topic.subscribe();
        topic.remove_all_listeners();
        topic.publish(7);
        assert!(rx.recv().await.is_err());
    }
}
