//! # Entity Sync
//!
//! Keeps an in-memory, optionally filtered view of a remote entity
//! collection up to date: load a snapshot, subscribe to the change stream,
//! and reconcile every change into the view as it arrives.
//!
//! ## Core Concepts
//!
//! - **Baseline**: the engine's copy of the whole collection, one entity per id
//! - **Projection**: the baseline filtered by an optional predicate
//! - **Change events**: `Created`, `Updated` (partial fields), `Deleted`
//! - **Activation**: one snapshot + stream lifetime for one collection name
//!
//! Events that arrive while the snapshot is still loading are buffered and
//! replayed on top of it in arrival order, so nothing produced during the
//! fetch window is lost.
//!
//! ## Example
//!
//! ```ignore
//! use entity_sync::{MemoryStore, Predicate, SyncEngine};
//!
//! let store = MemoryStore::new();
//! let engine = SyncEngine::new(store.clone());
//!
//! let handle = engine.activate("tasks", Some(Predicate::field_eq("done", false)))?;
//!
//! store.insert("tasks", json!({"name": "write docs", "done": false}))?;
//!
//! for view in handle.updates().iter() {
//!     if let Some(err) = &view.error {
//!         eprintln!("sync failed: {}", err);
//!     } else if view.loading {
//!         println!("loading...");
//!     } else {
//!         println!("{} open tasks", view.projection.len());
//!     }
//! }
//! ```

pub mod engine;
pub mod error;
pub mod reconciler;
pub mod source;
pub mod state;
pub mod types;

// Re-exports
pub use engine::{replay, ActivationId, SyncConfig, SyncEngine, SyncHandle, SyncView};
pub use error::{Result, SyncError};
pub use reconciler::Reconciler;
pub use source::{
    CloseReason, EventSubscription, MemoryStore, MemoryStoreConfig, RemoteSource, SourceMessage,
    SubscriptionId, Unsubscribe,
};
pub use state::{apply_event, ApplyOutcome, Baseline, IgnoreReason};
pub use types::*;
