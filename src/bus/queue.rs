//! Channel-backed listeners for consumers that live on their own task.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{Event, EventBus, Listener, ListenerHandle};

type Filter = Box<dyn Fn(&Event) -> bool + Send + Sync>;

/// Forwards matching events into an unbounded channel; `on_event` never blocks.
pub struct QueueListener {
    tx: mpsc::UnboundedSender<Event>,
    filter: Filter,
}

impl QueueListener {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Event>) {
        Self::with_filter(|_| true)
    }

    pub fn with_filter<F>(filter: F) -> (Self, mpsc::UnboundedReceiver<Event>)
    where
        F: Fn(&Event) -> bool + Send + Sync + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                filter: Box::new(filter),
            },
            rx,
        )
    }
}

impl Listener for QueueListener {
    fn on_event(&self, event: &Event) {
        if (self.filter)(event) {
            // Receiver gone: the owning subscription is shutting down.
            let _ = self.tx.send(event.clone());
        }
    }
}

/// A long-lived client subscription.
///
/// The listener is registered before [`Subscription::spawn`] returns. The
/// forwarding task deregisters it once the token is cancelled or the
/// subscription is dropped.
pub struct Subscription {
    rx: mpsc::UnboundedReceiver<Event>,
    task: JoinHandle<()>,
}

impl Subscription {
    pub fn spawn<F>(bus: Arc<EventBus>, filter: F, token: CancellationToken) -> Self
    where
        F: Fn(&Event) -> bool + Send + Sync + 'static,
    {
        let (listener, mut queue) = QueueListener::with_filter(filter);
        let handle = bus.add_listener(Arc::new(listener));
        let (client_tx, rx) = mpsc::unbounded_channel();

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = client_tx.closed() => break,
                    event = queue.recv() => match event {
                        Some(event) => {
                            if client_tx.send(event).is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
            remove(&bus, handle);
        });

        Self { rx, task }
    }

    /// Next event, or `None` once the subscription has ended.
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

fn remove(bus: &EventBus, handle: ListenerHandle) {
    if bus.remove_listener(handle) {
        log::debug!("Subscription {:?} closed", handle);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn queue_listener_applies_filter() {
        let (listener, mut rx) =
            QueueListener::with_filter(|e| matches!(e, Event::InstancesLoaded { .. }));
        listener.on_event(&Event::InstancesChanged);
        listener.on_event(&Event::InstancesLoaded { count: 2 });

        assert_eq!(rx.try_recv().unwrap(), Event::InstancesLoaded { count: 2 });
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn subscription_forwards_matching_events() {
        let bus = Arc::new(EventBus::new());
        let token = CancellationToken::new();
        let mut sub = Subscription::spawn(
            Arc::clone(&bus),
            |e| e.instance_id() == Some("a"),
            token.clone(),
        );

        bus.dispatch(&Event::InstanceLoaded {
            instance_id: "b".to_string(),
        });
        bus.dispatch(&Event::InstanceLoaded {
            instance_id: "a".to_string(),
        });

        let event = tokio::time::timeout(Duration::from_secs(1), sub.recv())
            .await
            .unwrap();
        assert_eq!(
            event,
            Some(Event::InstanceLoaded {
                instance_id: "a".to_string()
            })
        );
        token.cancel();
    }

    #[tokio::test]
    async fn cancellation_removes_listener() {
        let bus = Arc::new(EventBus::new());
        let token = CancellationToken::new();
        let mut sub = Subscription::spawn(Arc::clone(&bus), |_| true, token.clone());
        assert_eq!(bus.listener_count(), 1);

        token.cancel();
        let end = tokio::time::timeout(Duration::from_secs(1), sub.recv())
            .await
            .unwrap();
        assert!(end.is_none());
        assert_eq!(bus.listener_count(), 0);
    }

    #[tokio::test]
    async fn dropping_subscription_removes_listener() {
        let bus = Arc::new(EventBus::new());
        let sub = Subscription::spawn(Arc::clone(&bus), |_| true, CancellationToken::new());
        drop(sub);

        tokio::time::timeout(Duration::from_secs(1), async {
            while bus.listener_count() > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }
}
