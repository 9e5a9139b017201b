//! Reconciliation state machine for one activation.
//!
//! The reconciler owns the baseline and projection and decides what every
//! input (snapshot result, change event, stream closure, predicate change,
//! deactivation) does to them. It is free of threads and channels; the
//! engine serializes calls into it behind a single lock.
//!
//! ```text
//! Idle --begin--> Loading --snapshot ok--> Synced
//!                    |                       |
//!                    +--snapshot err--> Error (live events still applied)
//!                                            |
//!          stream closed (any live state) -> Error (baseline frozen)
//!          deactivate (any state) ---------> Deactivated
//! ```
//!
//! Events received while loading are buffered and replayed in arrival order
//! once the snapshot resolves, so nothing produced during the fetch window
//! is lost.

use crate::error::SyncError;
use crate::state::{apply_event, ApplyOutcome, Baseline, IgnoreReason};
use crate::types::{ChangeEvent, CollectionName, Entity, Predicate, SyncStatus};
use tracing::debug;

#[derive(Debug)]
enum Phase {
    Idle,
    Loading { buffered: Vec<ChangeEvent> },
    Live,
    Deactivated,
}

/// Baseline, projection and lifecycle state of one activation.
#[derive(Debug)]
pub struct Reconciler {
    collection: CollectionName,
    phase: Phase,
    baseline: Baseline,
    predicate: Option<Predicate>,
    projection: Vec<Entity>,
    /// Most recent failure. Never cleared automatically.
    error: Option<SyncError>,
    stream_open: bool,
    /// Bumped on every observable change.
    version: u64,
}

impl Reconciler {
    pub fn new(collection: CollectionName, predicate: Option<Predicate>) -> Self {
        Self {
            collection,
            phase: Phase::Idle,
            baseline: Baseline::new(),
            predicate,
            projection: Vec::new(),
            error: None,
            stream_open: true,
            version: 0,
        }
    }

    // --- Accessors ---

    pub fn collection(&self) -> &CollectionName {
        &self.collection
    }

    pub fn status(&self) -> SyncStatus {
        match self.phase {
            Phase::Deactivated => SyncStatus::Deactivated,
            _ if self.error.is_some() => SyncStatus::Error,
            Phase::Idle => SyncStatus::Idle,
            Phase::Loading { .. } => SyncStatus::Loading,
            Phase::Live => SyncStatus::Synced,
        }
    }

    pub fn is_loading(&self) -> bool {
        matches!(self.phase, Phase::Loading { .. })
    }

    pub fn is_deactivated(&self) -> bool {
        matches!(self.phase, Phase::Deactivated)
    }

    pub fn is_stream_open(&self) -> bool {
        self.stream_open
    }

    pub fn error(&self) -> Option<&SyncError> {
        self.error.as_ref()
    }

    pub fn baseline(&self) -> &Baseline {
        &self.baseline
    }

    pub fn projection(&self) -> &[Entity] {
        &self.projection
    }

    pub fn predicate(&self) -> Option<&Predicate> {
        self.predicate.as_ref()
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Events held back until the snapshot lands.
    pub fn buffered_len(&self) -> usize {
        match &self.phase {
            Phase::Loading { buffered } => buffered.len(),
            _ => 0,
        }
    }

    // --- Transitions ---
    //
    // Every transition returns true when it produced an observable change
    // (and bumped the version), false when it was a no-op.

    /// Start loading. Only valid from `Idle`.
    pub fn begin(&mut self) -> bool {
        if !matches!(self.phase, Phase::Idle) {
            return false;
        }
        self.phase = Phase::Loading {
            buffered: Vec::new(),
        };
        self.version += 1;
        true
    }

    /// Install the snapshot result and replay anything buffered meanwhile.
    ///
    /// A failed fetch leaves the baseline as it was, records the error, and
    /// still replays buffered events so the subscription keeps working.
    /// Results arriving in any phase other than `Loading` are discarded.
    pub fn on_snapshot(&mut self, result: Result<Vec<Entity>, SyncError>) -> bool {
        let buffered = match std::mem::replace(&mut self.phase, Phase::Live) {
            Phase::Loading { buffered } => buffered,
            other => {
                debug!(collection = %self.collection, "discarding snapshot outside of loading");
                self.phase = other;
                return false;
            }
        };

        match result {
            Ok(snapshot) => {
                debug!(
                    collection = %self.collection,
                    entities = snapshot.len(),
                    replayed = buffered.len(),
                    "installing snapshot"
                );
                self.baseline = Baseline::from_snapshot(snapshot);
            }
            Err(e) => {
                let e = if e.is_snapshot() {
                    e
                } else {
                    SyncError::SnapshotFetch(e.to_string())
                };
                self.error = Some(e);
            }
        }

        for event in buffered {
            self.apply(event);
        }

        self.commit();
        true
    }

    /// Handle one change event from the stream.
    pub fn on_event(&mut self, event: ChangeEvent) -> bool {
        if !self.stream_open {
            return false;
        }
        if let Phase::Loading { buffered } = &mut self.phase {
            buffered.push(event);
            return false;
        }
        if !matches!(self.phase, Phase::Live) || !self.apply(event) {
            return false;
        }
        self.commit();
        true
    }

    /// The event stream failed or ended. The baseline is frozen from here on.
    pub fn on_stream_closed(&mut self, reason: impl Into<String>) -> bool {
        if self.is_deactivated() || !self.stream_open {
            return false;
        }
        self.stream_open = false;
        self.error = Some(SyncError::Subscription(reason.into()));
        self.version += 1;
        true
    }

    /// Swap the predicate and recompute the projection over the current baseline.
    pub fn set_predicate(&mut self, predicate: Option<Predicate>) -> bool {
        if self.is_deactivated() {
            return false;
        }
        self.predicate = predicate;
        self.commit();
        true
    }

    /// Tear down: drop buffered events, release the baseline.
    pub fn deactivate(&mut self) -> bool {
        if self.is_deactivated() {
            return false;
        }
        self.phase = Phase::Deactivated;
        self.stream_open = false;
        self.baseline.clear();
        self.projection.clear();
        self.version += 1;
        true
    }

    /// Apply one event to the baseline without recomputing the projection.
    fn apply(&mut self, event: ChangeEvent) -> bool {
        let outcome = apply_event(&mut self.baseline, event);
        match &outcome {
            ApplyOutcome::Ignored(IgnoreReason::StaleUpdate(id)) => {
                debug!(collection = %self.collection, %id, "dropping update for unknown entity");
            }
            ApplyOutcome::Ignored(IgnoreReason::UnknownEvent) => {
                debug!(collection = %self.collection, "ignoring unknown event kind");
            }
            _ => {}
        }
        outcome.changed()
    }

    fn commit(&mut self) {
        self.projection = self.baseline.project(self.predicate.as_ref());
        self.version += 1;
    }
}
