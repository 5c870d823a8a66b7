//! Per-instance log buffers.
//!
//! The broker listens on the bus: `Log` events are buffered and a deleted
//! instance drops its buffer. Clients attaching to an instance first read the
//! buffered lines, then follow live events through a [`Subscription`].

mod buffer;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};

use tokio_util::sync::CancellationToken;

use crate::bus::{Event, EventBus, Listener, LogPayload, Subscription};
use crate::error::{AppError, Result};

use buffer::LogBuffer;
pub use buffer::LogLine;

pub const DEFAULT_BUFFER_SIZE: usize = 1000;

#[derive(Debug, Default)]
struct Buffers {
    live: HashMap<String, Arc<Mutex<LogBuffer>>>,
    /// Deleted instances. Lines still in flight for them are dropped.
    retired: HashSet<String>,
}

impl Buffers {
    fn open(&mut self, instance_id: &str, capacity: usize) -> Arc<Mutex<LogBuffer>> {
        Arc::clone(
            self.live
                .entry(instance_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(LogBuffer::new(capacity)))),
        )
    }
}

#[derive(Debug)]
pub struct LogBroker {
    capacity: usize,
    buffers: RwLock<Buffers>,
}

impl Default for LogBroker {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_SIZE)
    }
}

impl LogBroker {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            buffers: RwLock::new(Buffers::default()),
        }
    }

    fn buffer(&self, instance_id: &str) -> Option<Arc<Mutex<LogBuffer>>> {
        let buffers = self.buffers.read().unwrap_or_else(|e| e.into_inner());
        buffers.live.get(instance_id).map(Arc::clone)
    }

    fn create(&self, instance_id: &str) -> Arc<Mutex<LogBuffer>> {
        let mut buffers = self.buffers.write().unwrap_or_else(|e| e.into_inner());
        buffers.retired.remove(instance_id);
        let buffer = buffers.open(instance_id, self.capacity);
        drop(buffers);
        buffer
    }

    fn push_to(buffer: &Mutex<LogBuffer>, payload: LogPayload) -> u64 {
        let mut buffer = buffer.lock().unwrap_or_else(|e| e.into_inner());
        buffer.push(payload)
    }

    /// Buffer a line and return its id.
    pub fn push(&self, instance_id: &str, payload: LogPayload) -> u64 {
        let buffer = match self.buffer(instance_id) {
            Some(buffer) => buffer,
            None => self.create(instance_id),
        };
        Self::push_to(&buffer, payload)
    }

    /// Like [`push`](Self::push), but lines of retired instances are dropped.
    fn push_event(&self, instance_id: &str, payload: LogPayload) -> Option<u64> {
        if let Some(buffer) = self.buffer(instance_id) {
            return Some(Self::push_to(&buffer, payload));
        }
        let mut buffers = self.buffers.write().unwrap_or_else(|e| e.into_inner());
        if buffers.retired.contains(instance_id) {
            return None;
        }
        let buffer = buffers.open(instance_id, self.capacity);
        drop(buffers);
        Some(Self::push_to(&buffer, payload))
    }

    /// Drop the buffer of a deleted instance and ignore its late lines.
    fn retire(&self, instance_id: &str) {
        let mut buffers = self.buffers.write().unwrap_or_else(|e| e.into_inner());
        buffers.live.remove(instance_id);
        buffers.retired.insert(instance_id.to_string());
    }

    /// Remove and return the most recent line.
    pub fn pop(&self, instance_id: &str) -> Result<LogLine> {
        self.buffer(instance_id)
            .and_then(|buffer| {
                let mut buffer = buffer.lock().unwrap_or_else(|e| e.into_inner());
                buffer.pop()
            })
            .ok_or_else(|| AppError::buffer_empty(instance_id))
    }

    pub fn load_buffer(&self, instance_id: &str) -> Vec<LogLine> {
        self.buffer(instance_id)
            .map(|buffer| {
                let buffer = buffer.lock().unwrap_or_else(|e| e.into_inner());
                buffer.snapshot()
            })
            .unwrap_or_default()
    }

    pub fn remove(&self, instance_id: &str) {
        let mut buffers = self.buffers.write().unwrap_or_else(|e| e.into_inner());
        buffers.live.remove(instance_id);
    }

    /// Buffered lines plus a live stream of the instance's `Log` events.
    ///
    /// The subscription is registered before the snapshot is taken: a line
    /// pushed in between may appear in both, but never in neither.
    pub fn attach(
        &self,
        bus: Arc<EventBus>,
        instance_id: &str,
        token: CancellationToken,
    ) -> (Vec<LogLine>, Subscription) {
        let id = instance_id.to_string();
        let subscription = Subscription::spawn(
            bus,
            move |event| matches!(event, Event::Log { instance_id, .. } if *instance_id == id),
            token,
        );
        (self.load_buffer(instance_id), subscription)
    }
}

impl Listener for LogBroker {
    fn on_event(&self, event: &Event) {
        match event {
            Event::Log {
                instance_id,
                payload,
            } => {
                if self.push_event(instance_id, payload.clone()).is_none() {
                    log::debug!("Dropping late log line of deleted instance {}", instance_id);
                }
            }
            Event::InstanceDeleted { instance_id } => self.retire(instance_id),
            Event::InstanceCreated { .. }
            | Event::InstanceLoaded { .. }
            | Event::StatusChanged { .. }
            | Event::InstancesChanged
            | Event::InstancesLoaded { .. } => {}
        }
    }
}
