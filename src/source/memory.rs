//! In-process remote source.

use crate::error::{Result, SyncError};
use crate::state::{apply_event, Baseline};
use crate::types::{ChangeEvent, CollectionName, Entity, EntityId};
use crossbeam_channel::{bounded, Sender};
use parking_lot::{Condvar, Mutex, RwLock};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tracing::debug;

use super::types::{CloseReason, EventSubscription, SourceMessage, SubscriptionId, Unsubscribe};
use super::RemoteSource;

/// Configuration for a [`MemoryStore`].
#[derive(Clone, Debug)]
pub struct MemoryStoreConfig {
    /// Max buffered messages per subscriber before it is dropped.
    /// Default: 1000
    pub buffer_size: usize,
}

impl Default for MemoryStoreConfig {
    fn default() -> Self {
        Self { buffer_size: 1000 }
    }
}

/// Internal subscriber state.
struct Subscriber {
    collection: CollectionName,
    sender: Sender<SourceMessage>,
}

impl Subscriber {
    /// Try to send a message. Returns false if the buffer is full or the
    /// receiver is gone (subscriber will be dropped).
    fn try_send(&self, message: SourceMessage) -> bool {
        match self.sender.try_send(message) {
            Ok(()) => true,
            Err(crossbeam_channel::TrySendError::Full(_)) => false,
            Err(crossbeam_channel::TrySendError::Disconnected(_)) => false,
        }
    }
}

struct Inner {
    config: MemoryStoreConfig,
    /// Collection contents. Held for write across commit + broadcast so
    /// snapshots and streams agree on commit order.
    collections: RwLock<HashMap<CollectionName, Baseline>>,
    subscribers: RwLock<HashMap<SubscriptionId, Subscriber>>,
    next_entity_id: AtomicU64,
    next_subscription_id: AtomicU64,
    /// One-shot injected failures.
    snapshot_failures: Mutex<HashMap<CollectionName, String>>,
    subscribe_failures: Mutex<HashMap<CollectionName, String>>,
    /// While true, `fetch_snapshot` blocks after capturing its snapshot.
    snapshots_held: Mutex<bool>,
    snapshots_released: Condvar,
    snapshots_taken: AtomicUsize,
}

impl Inner {
    fn unsubscribe(&self, id: SubscriptionId) {
        let mut subs = self.subscribers.write();
        if let Some(sub) = subs.remove(&id) {
            // Best effort
            let _ = sub.sender.try_send(SourceMessage::Closed {
                reason: CloseReason::Unsubscribed,
            });
        }
    }

    /// Send to every subscriber of a collection. Drops subscribers that fail to receive.
    fn broadcast(&self, collection: &CollectionName, message: SourceMessage) {
        let mut to_remove = Vec::new();

        {
            let subs = self.subscribers.read();
            for (id, sub) in subs.iter() {
                if &sub.collection == collection && !sub.try_send(message.clone()) {
                    to_remove.push(*id);
                }
            }
        }

        if !to_remove.is_empty() {
            let mut subs = self.subscribers.write();
            for id in to_remove {
                if let Some(sub) = subs.remove(&id) {
                    debug!(subscription = id.0, %collection, "dropping slow subscriber");
                    // Might fail if the buffer is still full, that's ok
                    let _ = sub.sender.try_send(SourceMessage::Closed {
                        reason: CloseReason::BufferOverflow,
                    });
                }
            }
        }
    }
}

/// A [`RemoteSource`] that keeps collections in memory and broadcasts every
/// committed change to bounded subscriber channels.
///
/// Ids are assigned from a single counter shared by all collections. Cloning
/// the store yields another handle to the same data.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_config(MemoryStoreConfig::default())
    }

    pub fn with_config(config: MemoryStoreConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                collections: RwLock::new(HashMap::new()),
                subscribers: RwLock::new(HashMap::new()),
                next_entity_id: AtomicU64::new(1),
                next_subscription_id: AtomicU64::new(1),
                snapshot_failures: Mutex::new(HashMap::new()),
                subscribe_failures: Mutex::new(HashMap::new()),
                snapshots_held: Mutex::new(false),
                snapshots_released: Condvar::new(),
                snapshots_taken: AtomicUsize::new(0),
            }),
        }
    }

    // --- Data ---

    /// Replace a collection's contents without emitting events.
    pub fn seed(&self, collection: &str, entities: Vec<Entity>) -> Result<()> {
        let collection = CollectionName::new(collection)?;
        for entity in &entities {
            if let Ok(n) = entity.id.as_str().parse::<u64>() {
                self.inner.next_entity_id.fetch_max(n + 1, Ordering::SeqCst);
            }
        }
        self.inner
            .collections
            .write()
            .insert(collection, Baseline::from_snapshot(entities));
        Ok(())
    }

    /// Create an entity from a JSON object of fields and broadcast `Created`.
    pub fn insert(&self, collection: &str, fields: Value) -> Result<Entity> {
        let collection = CollectionName::new(collection)?;
        let fields = into_fields(fields)?;
        let id = EntityId::from(self.inner.next_entity_id.fetch_add(1, Ordering::SeqCst));
        let mut entity = Entity::new(id);
        entity.merge(&fields);

        let event = ChangeEvent::created(entity.clone());
        self.commit(&collection, event);
        Ok(entity)
    }

    /// Merge fields into an existing entity and broadcast `Updated`.
    ///
    /// Returns false (and emits nothing) if the entity does not exist.
    pub fn update(&self, collection: &str, id: impl Into<EntityId>, fields: Value) -> Result<bool> {
        let collection = CollectionName::new(collection)?;
        let id = id.into();
        let fields = into_fields(fields)?;

        let mut collections = self.inner.collections.write();
        let Some(contents) = collections.get_mut(&collection) else {
            return Ok(false);
        };
        if !contents.contains(&id) {
            return Ok(false);
        }
        let event = ChangeEvent::updated(id, fields);
        apply_event(contents, event.clone());
        self.inner.broadcast(&collection, event.into());
        Ok(true)
    }

    /// Remove an entity and broadcast `Deleted`.
    ///
    /// Returns false (and emits nothing) if the entity does not exist.
    pub fn delete(&self, collection: &str, id: impl Into<EntityId>) -> Result<bool> {
        let collection = CollectionName::new(collection)?;
        let id = id.into();

        let mut collections = self.inner.collections.write();
        let Some(contents) = collections.get_mut(&collection) else {
            return Ok(false);
        };
        if !contents.contains(&id) {
            return Ok(false);
        }
        let event = ChangeEvent::deleted(id);
        apply_event(contents, event.clone());
        self.inner.broadcast(&collection, event.into());
        Ok(true)
    }

    /// Broadcast an event without touching stored data.
    ///
    /// Lets callers reproduce duplicate, stale or unknown deliveries.
    pub fn emit(&self, collection: &str, event: ChangeEvent) -> Result<()> {
        let collection = CollectionName::new(collection)?;
        let _guard = self.inner.collections.read();
        self.inner.broadcast(&collection, event.into());
        Ok(())
    }

    /// Current contents of a collection.
    pub fn entities(&self, collection: &str) -> Vec<Entity> {
        let Ok(collection) = CollectionName::new(collection) else {
            return Vec::new();
        };
        self.inner
            .collections
            .read()
            .get(&collection)
            .map(|c| c.entities().to_vec())
            .unwrap_or_default()
    }

    fn commit(&self, collection: &CollectionName, event: ChangeEvent) {
        let mut collections = self.inner.collections.write();
        let contents = collections.entry(collection.clone()).or_default();
        apply_event(contents, event.clone());
        self.inner.broadcast(collection, event.into());
    }

    // --- Streams ---

    /// Close every stream of a collection with the given reason.
    pub fn close(&self, collection: &str, reason: CloseReason) -> Result<()> {
        let collection = CollectionName::new(collection)?;
        let mut subs = self.inner.subscribers.write();
        subs.retain(|_, sub| {
            if sub.collection != collection {
                return true;
            }
            let _ = sub.sender.try_send(SourceMessage::Closed {
                reason: reason.clone(),
            });
            false
        });
        Ok(())
    }

    /// Number of open streams across all collections.
    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.read().len()
    }

    // --- Fault injection ---

    /// Make the next snapshot fetch of a collection fail.
    pub fn fail_next_snapshot(&self, collection: &str, message: impl Into<String>) -> Result<()> {
        let collection = CollectionName::new(collection)?;
        self.inner
            .snapshot_failures
            .lock()
            .insert(collection, message.into());
        Ok(())
    }

    /// Make the next subscribe call for a collection fail.
    pub fn fail_next_subscribe(&self, collection: &str, message: impl Into<String>) -> Result<()> {
        let collection = CollectionName::new(collection)?;
        self.inner
            .subscribe_failures
            .lock()
            .insert(collection, message.into());
        Ok(())
    }

    /// Block snapshot fetches after they capture their data, until released.
    pub fn hold_snapshots(&self) {
        *self.inner.snapshots_held.lock() = true;
    }

    pub fn release_snapshots(&self) {
        *self.inner.snapshots_held.lock() = false;
        self.inner.snapshots_released.notify_all();
    }

    /// How many snapshots have been captured so far.
    pub fn snapshots_taken(&self) -> usize {
        self.inner.snapshots_taken.load(Ordering::SeqCst)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RemoteSource for MemoryStore {
    fn fetch_snapshot(&self, collection: &CollectionName) -> Result<Vec<Entity>> {
        if let Some(message) = self.inner.snapshot_failures.lock().remove(collection) {
            self.inner.snapshots_taken.fetch_add(1, Ordering::SeqCst);
            return Err(SyncError::SnapshotFetch(message));
        }

        let snapshot = self
            .inner
            .collections
            .read()
            .get(collection)
            .map(|c| c.entities().to_vec())
            .unwrap_or_default();
        self.inner.snapshots_taken.fetch_add(1, Ordering::SeqCst);

        let mut held = self.inner.snapshots_held.lock();
        while *held {
            self.inner.snapshots_released.wait(&mut held);
        }

        Ok(snapshot)
    }

    fn subscribe(&self, collection: &CollectionName) -> Result<EventSubscription> {
        if let Some(message) = self.inner.subscribe_failures.lock().remove(collection) {
            return Err(SyncError::Subscription(message));
        }

        let id = SubscriptionId(self.inner.next_subscription_id.fetch_add(1, Ordering::SeqCst));
        let (sender, receiver) = bounded(self.inner.config.buffer_size);

        self.inner.subscribers.write().insert(
            id,
            Subscriber {
                collection: collection.clone(),
                sender,
            },
        );

        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let unsubscribe = Unsubscribe::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.unsubscribe(id);
            }
        });

        Ok(EventSubscription::new(receiver, unsubscribe))
    }
}

fn into_fields(value: Value) -> Result<Map<String, Value>> {
    match value {
        Value::Object(map) => Ok(map),
        other => Err(SyncError::Deserialization(format!(
            "expected a JSON object of fields, got {}",
            other
        ))),
    }
}
