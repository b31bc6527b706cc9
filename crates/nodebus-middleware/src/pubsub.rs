//! In-process, typed, topic-based publish/subscribe.
//!
//! [`LocalRegistry`] keeps, per topic, the declared payload type and the list
//! of locally bound callbacks.  Publishing invokes every callback
//! synchronously on the caller's thread; a panicking callback is isolated and
//! logged so the remaining subscribers still receive the message.
//!
//! The registry knows nothing about the network.  The node facade layers
//! remote delivery on top of it.

use std::any::{Any, TypeId, type_name};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use nodebus_types::BusError;
use tracing::{debug, error};

use crate::handle::Registration;

/// Callback bound to a topic carrying messages of type `T`.
pub type Callback<T> = Arc<dyn Fn(&T) + Send + Sync + 'static>;

struct TopicEntry {
    type_id: TypeId,
    type_name: &'static str,
    publishers: usize,
    subscribers: Vec<(u64, Arc<dyn Any + Send + Sync>)>,
}

impl TopicEntry {
    fn is_unused(&self) -> bool {
        self.publishers == 0 && self.subscribers.is_empty()
    }
}

/// Registry of local topics.  Shared between nodes of one process through
/// [`Registries`][crate::node::Registries].
#[derive(Default)]
pub struct LocalRegistry {
    topics: Mutex<HashMap<String, TopicEntry>>,
    next_id: AtomicU64,
}

impl LocalRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, TopicEntry>> {
        self.topics.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Look up `topic`, creating it with payload type `T` when absent.
    fn declare<'a, T: 'static>(
        topics: &'a mut HashMap<String, TopicEntry>,
        topic: &str,
    ) -> Result<&'a mut TopicEntry, BusError> {
        let entry = topics.entry(topic.to_string()).or_insert_with(|| TopicEntry {
            type_id: TypeId::of::<T>(),
            type_name: type_name::<T>(),
            publishers: 0,
            subscribers: Vec::new(),
        });
        if entry.type_id != TypeId::of::<T>() {
            return Err(BusError::TypeMismatch {
                name: topic.to_string(),
                expected: entry.type_name.to_string(),
                found: type_name::<T>().to_string(),
            });
        }
        Ok(entry)
    }

    /// Declare a publisher of `T` on `topic`.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::TypeMismatch`] when the topic already carries a
    /// different payload type.
    pub fn advertise<T: Send + Sync + 'static>(
        self: &Arc<Self>,
        topic: &str,
    ) -> Result<LocalPublisher<T>, BusError> {
        let mut topics = self.lock();
        let entry = Self::declare::<T>(&mut topics, topic)?;
        entry.publishers += 1;
        debug!(topic, "created publisher");
        Ok(LocalPublisher {
            topic: topic.to_string(),
            registry: Arc::clone(self),
            _marker: PhantomData,
        })
    }

    /// Bind `callback` to `topic`.  The callback receives every message
    /// published locally from now on, regardless of whether publishers
    /// already exist.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::TypeMismatch`] when the topic already carries a
    /// different payload type.
    pub fn subscribe<T, F>(self: &Arc<Self>, topic: &str, callback: F) -> Result<Registration, BusError>
    where
        T: Send + Sync + 'static,
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let callback: Callback<T> = Arc::new(callback);
        {
            let mut topics = self.lock();
            let entry = Self::declare::<T>(&mut topics, topic)?;
            entry.subscribers.push((id, Arc::new(callback)));
        }
        debug!(topic, "added local subscriber");

        let registry = Arc::downgrade(self);
        let name = topic.to_string();
        Ok(Registration::new(topic, move || {
            if let Some(registry) = registry.upgrade() {
                registry.unsubscribe(&name, id);
            }
        }))
    }

    /// Deliver `message` to every local subscriber of `topic`.
    ///
    /// Returns the number of callbacks that completed without panicking.
    /// Publishing to a topic without subscribers is not an error.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::TypeMismatch`] when `T` differs from the topic's
    /// declared payload type.
    pub fn publish<T: 'static>(&self, topic: &str, message: &T) -> Result<usize, BusError> {
        let callbacks: Vec<Arc<dyn Any + Send + Sync>> = {
            let topics = self.lock();
            match topics.get(topic) {
                None => return Ok(0),
                Some(entry) if entry.type_id != TypeId::of::<T>() => {
                    return Err(BusError::TypeMismatch {
                        name: topic.to_string(),
                        expected: entry.type_name.to_string(),
                        found: type_name::<T>().to_string(),
                    });
                }
                Some(entry) => entry.subscribers.iter().map(|(_, cb)| Arc::clone(cb)).collect(),
            }
        };

        let mut delivered = 0;
        for erased in callbacks {
            let Some(callback) = erased.downcast_ref::<Callback<T>>() else {
                continue;
            };
            match catch_unwind(AssertUnwindSafe(|| callback(message))) {
                Ok(()) => delivered += 1,
                Err(panic) => {
                    error!(topic, error = %panic_message(&panic), "subscriber callback panicked");
                }
            }
        }
        Ok(delivered)
    }

    /// Topics currently known to the registry.
    pub fn topics(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of local callbacks bound to `topic`.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.lock().get(topic).map_or(0, |e| e.subscribers.len())
    }

    fn unsubscribe(&self, topic: &str, id: u64) {
        let mut topics = self.lock();
        if let Some(entry) = topics.get_mut(topic) {
            entry.subscribers.retain(|(sid, _)| *sid != id);
            if entry.is_unused() {
                topics.remove(topic);
            }
            debug!(topic, "removed local subscriber");
        }
    }

    fn retire_publisher(&self, topic: &str) {
        let mut topics = self.lock();
        if let Some(entry) = topics.get_mut(topic) {
            entry.publishers = entry.publishers.saturating_sub(1);
            if entry.is_unused() {
                topics.remove(topic);
            }
        }
    }
}

/// Render a caught panic payload for logging.
pub(crate) fn panic_message(panic: &Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Typed local publisher.  Dropping it retires the publisher from its topic.
pub struct LocalPublisher<T> {
    topic: String,
    registry: Arc<LocalRegistry>,
    _marker: PhantomData<fn(&T)>,
}

impl<T: 'static> LocalPublisher<T> {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Deliver `message` to the local subscribers of this topic.
    pub fn publish(&self, message: &T) -> Result<usize, BusError> {
        self.registry.publish(&self.topic, message)
    }
}

impl<T> Drop for LocalPublisher<T> {
    fn drop(&mut self) {
        self.registry.retire_publisher(&self.topic);
    }
}
