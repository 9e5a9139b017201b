//! Main engine tying a remote source to per-collection reconcilers.

use crate::error::{Result, SyncError};
use crate::reconciler::Reconciler;
use crate::source::{RemoteSource, SourceMessage, Unsubscribe};
use crate::types::{ChangeEvent, CollectionName, Entity, Predicate, SyncStatus};
use crossbeam_channel::{bounded, never, select, Receiver, RecvTimeoutError, Sender};
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Engine configuration.
#[derive(Clone, Debug)]
pub struct SyncConfig {
    /// Buffered updates per listener before the listener is dropped.
    pub update_buffer: usize,

    /// Name prefix for reconciliation and fetch threads.
    pub worker_name: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            update_buffer: 64,
            worker_name: "entity-sync".to_string(),
        }
    }
}

/// Unique identifier for one activation.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ActivationId(pub u64);

impl fmt::Debug for ActivationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Activation({})", self.0)
    }
}

impl fmt::Display for ActivationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A consistent read of everything a consumer renders.
///
/// `loading`, `error` and an empty `projection` are independent: a consumer
/// can always tell "still loading" from "failed" from "nothing matches".
#[derive(Clone, Debug)]
pub struct SyncView {
    pub version: u64,
    pub status: SyncStatus,
    pub loading: bool,
    pub error: Option<SyncError>,
    pub projection: Vec<Entity>,
}

impl SyncView {
    fn from_reconciler(r: &Reconciler) -> Self {
        Self {
            version: r.version(),
            status: r.status(),
            loading: r.is_loading(),
            error: r.error().cloned(),
            projection: r.projection().to_vec(),
        }
    }
}

/// State shared between a handle and its worker.
struct Shared {
    id: ActivationId,
    reconciler: RwLock<Reconciler>,
    listeners: Mutex<Vec<Sender<SyncView>>>,
    update_buffer: usize,
}

impl Shared {
    /// Run one transition under the write lock and publish the result.
    ///
    /// This is the only path that mutates the reconciler, so transitions are
    /// applied one at a time in the order they reach the lock.
    fn mutate<F>(&self, f: F) -> bool
    where
        F: FnOnce(&mut Reconciler) -> bool,
    {
        let mut reconciler = self.reconciler.write();
        if !f(&mut reconciler) {
            return false;
        }

        // Published while still holding the lock so listeners see versions in order
        let mut listeners = self.listeners.lock();
        if !listeners.is_empty() {
            let view = SyncView::from_reconciler(&reconciler);
            let id = self.id;
            listeners.retain(|tx| match tx.try_send(view.clone()) {
                Ok(()) => true,
                Err(crossbeam_channel::TrySendError::Full(_)) => {
                    warn!(activation = %id, "dropping slow update listener");
                    false
                }
                Err(crossbeam_channel::TrySendError::Disconnected(_)) => false,
            });
        }
        true
    }

    fn listen(&self) -> Receiver<SyncView> {
        let (tx, rx) = bounded(self.update_buffer);
        // Hold the reconciler lock so a deactivation can't slip in between
        let reconciler = self.reconciler.read();
        if !reconciler.is_deactivated() {
            self.listeners.lock().push(tx);
        }
        rx
    }
}

/// What the worker loop woke up for.
enum Step {
    Shutdown,
    Snapshot(Option<Result<Vec<Entity>>>),
    Message(Option<SourceMessage>),
}

/// Reconciliation loop for one activation.
///
/// Owns the receiving ends of the snapshot result and the change stream and
/// feeds both into the shared reconciler. Exits on shutdown or once both
/// inputs are exhausted.
struct Worker {
    shared: Arc<Shared>,
    shutdown: Receiver<()>,
    snapshot: Receiver<Result<Vec<Entity>>>,
    events: Option<Receiver<SourceMessage>>,
}

impl Worker {
    fn run(self) {
        let Worker {
            shared,
            shutdown,
            mut snapshot,
            events,
        } = self;
        let mut snapshot_pending = true;
        let mut stream_open = events.is_some();
        let mut events = events.unwrap_or_else(never);

        while snapshot_pending || stream_open {
            let step = select! {
                recv(shutdown) -> _ => Step::Shutdown,
                recv(snapshot) -> msg => Step::Snapshot(msg.ok()),
                recv(events) -> msg => Step::Message(msg.ok()),
            };

            match step {
                Step::Shutdown => break,

                Step::Snapshot(result) => {
                    let result = result.unwrap_or_else(|| {
                        Err(SyncError::SnapshotFetch("snapshot fetch abandoned".to_string()))
                    });
                    if let Err(e) = &result {
                        warn!(activation = %shared.id, error = %e, "snapshot fetch failed");
                    }
                    shared.mutate(|r| r.on_snapshot(result));
                    snapshot_pending = false;
                    snapshot = never();
                }

                Step::Message(Some(SourceMessage::Event { event })) => {
                    shared.mutate(|r| r.on_event(event));
                }

                Step::Message(Some(SourceMessage::Closed { reason })) => {
                    warn!(activation = %shared.id, %reason, "change stream closed");
                    shared.mutate(|r| r.on_stream_closed(reason.to_string()));
                    stream_open = false;
                    events = never();
                }

                Step::Message(None) => {
                    warn!(activation = %shared.id, "change stream disconnected");
                    shared.mutate(|r| r.on_stream_closed("stream disconnected"));
                    stream_open = false;
                    events = never();
                }
            }
        }

        debug!(activation = %shared.id, "worker stopped");
    }
}

/// Resources owned by a live activation, released by `deactivate`.
struct Controls {
    shutdown: Option<Sender<()>>,
    unsubscribe: Option<Unsubscribe>,
    worker: Option<JoinHandle<()>>,
}

/// Handle to one activation.
///
/// Exposes the current projection, loading flag and error signal. Dropping
/// the handle deactivates it.
pub struct SyncHandle {
    shared: Arc<Shared>,
    controls: Mutex<Controls>,
}

impl SyncHandle {
    pub fn id(&self) -> ActivationId {
        self.shared.id
    }

    pub fn collection(&self) -> CollectionName {
        self.shared.reconciler.read().collection().clone()
    }

    /// Current filtered view, in baseline order.
    pub fn projection(&self) -> Vec<Entity> {
        self.shared.reconciler.read().projection().to_vec()
    }

    pub fn is_loading(&self) -> bool {
        self.shared.reconciler.read().is_loading()
    }

    /// Most recent failure, if any. Not cleared by later successes.
    pub fn error(&self) -> Option<SyncError> {
        self.shared.reconciler.read().error().cloned()
    }

    pub fn status(&self) -> SyncStatus {
        self.shared.reconciler.read().status()
    }

    pub fn version(&self) -> u64 {
        self.shared.reconciler.read().version()
    }

    /// Number of entities in the unfiltered baseline.
    pub fn baseline_len(&self) -> usize {
        self.shared.reconciler.read().baseline().len()
    }

    pub fn predicate(&self) -> Option<Predicate> {
        self.shared.reconciler.read().predicate().cloned()
    }

    /// Everything at once, from a single lock acquisition.
    pub fn view(&self) -> SyncView {
        SyncView::from_reconciler(&self.shared.reconciler.read())
    }

    /// Receive a [`SyncView`] after every committed change.
    ///
    /// The channel is bounded; a listener that falls behind is dropped and
    /// its receiver disconnects. Disconnects immediately on a deactivated
    /// handle.
    pub fn updates(&self) -> Receiver<SyncView> {
        self.shared.listen()
    }

    /// Block until the view satisfies `condition` or the timeout expires.
    pub fn wait_until<F>(&self, condition: F, timeout: Duration) -> Option<SyncView>
    where
        F: Fn(&SyncView) -> bool,
    {
        let deadline = Instant::now() + timeout;
        let mut updates = self.updates();
        let view = self.view();
        if condition(&view) {
            return Some(view);
        }

        loop {
            let remaining = deadline.checked_duration_since(Instant::now())?;
            match updates.recv_timeout(remaining) {
                Ok(view) if condition(&view) => return Some(view),
                Ok(_) => {}
                Err(RecvTimeoutError::Timeout) => return None,
                Err(RecvTimeoutError::Disconnected) => {
                    // Dropped for falling behind, or deactivated
                    let view = self.view();
                    if condition(&view) {
                        return Some(view);
                    }
                    if view.status == SyncStatus::Deactivated {
                        return None;
                    }
                    updates = self.updates();
                }
            }
        }
    }

    /// Replace the predicate and recompute the projection. No refetch.
    pub fn reconfigure_predicate(&self, predicate: Option<Predicate>) -> Result<()> {
        if self.shared.mutate(|r| r.set_predicate(predicate)) {
            debug!(activation = %self.shared.id, "predicate reconfigured");
            Ok(())
        } else {
            Err(SyncError::Deactivated)
        }
    }

    /// Cancel the subscription and release the baseline.
    ///
    /// Idempotent. Once this returns no further event is applied, and a
    /// snapshot still in flight is discarded when it lands.
    pub fn deactivate(&self) {
        let changed = self.shared.mutate(|r| r.deactivate());

        let mut controls = self.controls.lock();
        controls.shutdown.take();
        if let Some(unsubscribe) = controls.unsubscribe.take() {
            unsubscribe.cancel();
        }
        if let Some(worker) = controls.worker.take() {
            if worker.thread().id() != thread::current().id() && worker.join().is_err() {
                warn!(activation = %self.shared.id, "worker panicked");
            }
        }
        drop(controls);

        self.shared.listeners.lock().clear();

        if changed {
            info!(activation = %self.shared.id, "deactivated");
        }
    }
}

impl Drop for SyncHandle {
    fn drop(&mut self) {
        self.deactivate();
    }
}

impl fmt::Debug for SyncHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reconciler = self.shared.reconciler.read();
        f.debug_struct("SyncHandle")
            .field("id", &self.shared.id)
            .field("collection", reconciler.collection())
            .field("status", &reconciler.status())
            .field("version", &reconciler.version())
            .finish()
    }
}

/// Synchronizes named collections from a [`RemoteSource`].
///
/// Each [`activate`](SyncEngine::activate) call is fully isolated: its own
/// baseline, its own subscription, its own reconciliation thread.
pub struct SyncEngine {
    source: Arc<dyn RemoteSource>,
    config: SyncConfig,
    next_id: AtomicU64,
}

impl SyncEngine {
    pub fn new(source: impl RemoteSource) -> Self {
        Self::with_config(source, SyncConfig::default())
    }

    pub fn with_config(source: impl RemoteSource, config: SyncConfig) -> Self {
        Self {
            source: Arc::new(source),
            config,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Start synchronizing a collection.
    ///
    /// Opens the change stream first, then starts the snapshot fetch on its
    /// own thread. Events that arrive before the snapshot are buffered and
    /// replayed on top of it. Failures of either step are reported through
    /// the handle's error signal, not through this result; only an invalid
    /// name or a failure to start threads is returned here.
    pub fn activate(
        &self,
        collection: impl AsRef<str>,
        predicate: Option<Predicate>,
    ) -> Result<SyncHandle> {
        let collection = CollectionName::new(collection.as_ref())?;
        let id = ActivationId(self.next_id.fetch_add(1, Ordering::SeqCst));

        let mut reconciler = Reconciler::new(collection.clone(), predicate);
        reconciler.begin();
        let shared = Arc::new(Shared {
            id,
            reconciler: RwLock::new(reconciler),
            listeners: Mutex::new(Vec::new()),
            update_buffer: self.config.update_buffer,
        });

        let (events, unsubscribe) = match self.source.subscribe(&collection) {
            Ok(subscription) => {
                let (receiver, unsubscribe) = subscription.into_parts();
                (Some(receiver), Some(unsubscribe))
            }
            Err(e) => {
                warn!(activation = %id, %collection, error = %e, "subscribe failed");
                let reason = match e {
                    SyncError::Subscription(msg) => msg,
                    other => other.to_string(),
                };
                shared.mutate(|r| r.on_stream_closed(reason));
                (None, None)
            }
        };

        let (snapshot_tx, snapshot_rx) = bounded(1);
        let source = Arc::clone(&self.source);
        let fetch_collection = collection.clone();
        thread::Builder::new()
            .name(format!("{}-fetch-{}", self.config.worker_name, id))
            .spawn(move || {
                let result = source.fetch_snapshot(&fetch_collection);
                // Receiver is gone if the activation was torn down meanwhile
                let _ = snapshot_tx.send(result);
            })?;

        let (shutdown_tx, shutdown_rx) = bounded(0);
        let worker = Worker {
            shared: Arc::clone(&shared),
            shutdown: shutdown_rx,
            snapshot: snapshot_rx,
            events,
        };
        let worker = thread::Builder::new()
            .name(format!("{}-{}", self.config.worker_name, id))
            .spawn(move || worker.run())?;

        info!(activation = %id, %collection, "activated");

        Ok(SyncHandle {
            shared,
            controls: Mutex::new(Controls {
                shutdown: Some(shutdown_tx),
                unsubscribe,
                worker: Some(worker),
            }),
        })
    }

    /// Tear down an activation. Same as [`SyncHandle::deactivate`].
    pub fn deactivate(&self, handle: &SyncHandle) {
        handle.deactivate();
    }

    /// Replace an activation's predicate. Same as [`SyncHandle::reconfigure_predicate`].
    pub fn reconfigure_predicate(
        &self,
        handle: &SyncHandle,
        predicate: Option<Predicate>,
    ) -> Result<()> {
        handle.reconfigure_predicate(predicate)
    }

    /// Switch an activation to another collection.
    ///
    /// The old activation is torn down and a fresh one started from a new
    /// snapshot, keeping the predicate.
    pub fn retarget(&self, handle: SyncHandle, collection: impl AsRef<str>) -> Result<SyncHandle> {
        let collection = CollectionName::new(collection.as_ref())?;
        let predicate = handle.predicate();
        handle.deactivate();
        self.activate(collection.as_str(), predicate)
    }
}

/// Feed a sequence of events through a fresh reconciler, as if they arrived
/// after `snapshot`. Returns the resulting projection.
///
/// Useful for previewing what a stream will do to a known state without
/// starting an activation.
pub fn replay(
    snapshot: Vec<Entity>,
    events: impl IntoIterator<Item = ChangeEvent>,
    predicate: Option<Predicate>,
) -> Vec<Entity> {
    // The name is never used to reach a source
    let Ok(collection) = CollectionName::new("replay") else {
        return Vec::new();
    };
    let mut reconciler = Reconciler::new(collection, predicate);
    reconciler.begin();
    reconciler.on_snapshot(Ok(snapshot));
    for event in events {
        reconciler.on_event(event);
    }
    reconciler.projection().to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MemoryStore;
    use serde_json::json;

    const WAIT: Duration = Duration::from_secs(5);

    fn names(entities: &[Entity]) -> Vec<String> {
        entities
            .iter()
            .filter_map(|e| e.get_str("name").map(str::to_string))
            .collect()
    }

    #[test]
    fn test_activate_loads_snapshot() {
        let store = MemoryStore::new();
        store.insert("tasks", json!({"name": "A"})).unwrap();

        let engine = SyncEngine::new(store.clone());
        let handle = engine.activate("tasks", None).unwrap();

        let view = handle.wait_until(|v| v.status == SyncStatus::Synced, WAIT).unwrap();
        assert!(!view.loading);
        assert!(view.error.is_none());
        assert_eq!(names(&view.projection), vec!["A"]);
    }

    #[test]
    fn test_activate_rejects_empty_name() {
        let engine = SyncEngine::new(MemoryStore::new());
        let result = engine.activate("", None);
        assert!(matches!(result, Err(SyncError::InvalidCollection(_))));
    }

    #[test]
    fn test_updates_channel_sees_changes() {
        let store = MemoryStore::new();
        let engine = SyncEngine::new(store.clone());
        let handle = engine.activate("tasks", None).unwrap();
        handle.wait_until(|v| !v.loading, WAIT).unwrap();

        let updates = handle.updates();
        store.insert("tasks", json!({"name": "B"})).unwrap();

        let view = updates.recv_timeout(WAIT).unwrap();
        assert_eq!(names(&view.projection), vec!["B"]);
    }

    #[test]
    fn test_deactivate_is_idempotent_and_unsubscribes() {
        let store = MemoryStore::new();
        let engine = SyncEngine::new(store.clone());
        let handle = engine.activate("tasks", None).unwrap();
        assert_eq!(store.subscriber_count(), 1);

        engine.deactivate(&handle);
        engine.deactivate(&handle);

        assert_eq!(store.subscriber_count(), 0);
        assert_eq!(handle.status(), SyncStatus::Deactivated);
        assert!(matches!(
            handle.reconfigure_predicate(None),
            Err(SyncError::Deactivated)
        ));
        assert!(handle.updates().recv_timeout(Duration::from_millis(50)).is_err());
    }

    #[test]
    fn test_drop_handle_unsubscribes() {
        let store = MemoryStore::new();
        let engine = SyncEngine::new(store.clone());
        {
            let _handle = engine.activate("tasks", None).unwrap();
            assert_eq!(store.subscriber_count(), 1);
        }
        assert_eq!(store.subscriber_count(), 0);
    }

    #[test]
    fn test_replay_helper() {
        let projection = replay(
            vec![Entity::new(1).with_field("name", "A")],
            vec![
                ChangeEvent::created(Entity::new(2).with_field("name", "B")),
                ChangeEvent::deleted(1),
            ],
            None,
        );
        assert_eq!(names(&projection), vec!["B"]);
    }
}
