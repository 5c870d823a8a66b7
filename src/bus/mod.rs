//! In-process publish/subscribe for domain events.
//!
//! Dispatch is synchronous: every listener runs on the caller's context before
//! [`EventBus::dispatch`] returns. The listener list is cloned under the read lock
//! and the lock is released before any listener runs, so a listener may add or
//! remove listeners (including itself) while handling an event.
//!
//! Listeners that need to do async work should not block in `on_event`; wrap them
//! in a [`QueueListener`] or use a [`Subscription`].

mod event;
mod queue;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

pub use event::{DownloadProgress, Event, LogKind, LogPayload};
pub use queue::{QueueListener, Subscription};

pub trait Listener: Send + Sync {
    fn on_event(&self, event: &Event);
}

impl<F> Listener for F
where
    F: Fn(&Event) + Send + Sync,
{
    fn on_event(&self, event: &Event) {
        self(event)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerHandle(u64);

#[derive(Default)]
pub struct EventBus {
    listeners: RwLock<Vec<(ListenerHandle, Arc<dyn Listener>)>>,
    next_handle: AtomicU64,
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("listeners", &self.listener_count())
            .finish()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_listener(&self, listener: Arc<dyn Listener>) -> ListenerHandle {
        let handle = ListenerHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        let mut listeners = self.listeners.write().unwrap_or_else(|e| e.into_inner());
        listeners.push((handle, listener));
        drop(listeners);
        handle
    }

    /// Returns `false` if the handle was not registered.
    pub fn remove_listener(&self, handle: ListenerHandle) -> bool {
        let mut listeners = self.listeners.write().unwrap_or_else(|e| e.into_inner());
        let before = listeners.len();
        listeners.retain(|(h, _)| *h != handle);
        listeners.len() != before
    }

    pub fn dispatch(&self, event: &Event) {
        let listeners: Vec<Arc<dyn Listener>> = {
            let listeners = self.listeners.read().unwrap_or_else(|e| e.into_inner());
            listeners.iter().map(|(_, l)| Arc::clone(l)).collect()
        };

        for listener in listeners {
            listener.on_event(event);
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    use super::*;

    #[test]
    fn dispatch_reaches_every_listener_in_order() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for tag in ["a", "b"] {
            let seen = Arc::clone(&seen);
            bus.add_listener(Arc::new(move |_: &Event| {
                seen.lock().unwrap().push(tag);
            }));
        }

        bus.dispatch(&Event::InstancesChanged);
        assert_eq!(*seen.lock().unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn removed_listener_is_not_called() {
        let bus = EventBus::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let handle = bus.add_listener(Arc::new(move |_: &Event| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        bus.dispatch(&Event::InstancesChanged);
        assert!(bus.remove_listener(handle));
        assert!(!bus.remove_listener(handle));
        bus.dispatch(&Event::InstancesChanged);

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(bus.listener_count(), 0);
    }

    #[test]
    fn listener_can_register_during_dispatch() {
        let bus = Arc::new(EventBus::new());
        let weak = Arc::downgrade(&bus);
        bus.add_listener(Arc::new(move |_: &Event| {
            if let Some(bus) = weak.upgrade() {
                bus.add_listener(Arc::new(|_: &Event| {}));
            }
        }));

        bus.dispatch(&Event::InstancesChanged);
        assert_eq!(bus.listener_count(), 2);
    }

    #[test]
    fn listener_can_remove_itself() {
        let bus = Arc::new(EventBus::new());
        let slot: Arc<Mutex<Option<ListenerHandle>>> = Arc::new(Mutex::new(None));
        let calls = Arc::new(AtomicUsize::new(0));

        let weak = Arc::downgrade(&bus);
        let own = Arc::clone(&slot);
        let counter = Arc::clone(&calls);
        let handle = bus.add_listener(Arc::new(move |_: &Event| {
            counter.fetch_add(1, Ordering::SeqCst);
            let handle = own.lock().unwrap().take();
            if let (Some(bus), Some(handle)) = (weak.upgrade(), handle) {
                bus.remove_listener(handle);
            }
        }));
        *slot.lock().unwrap() = Some(handle);

        bus.dispatch(&Event::InstancesChanged);
        bus.dispatch(&Event::InstancesChanged);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
