//! Remote store boundary.
//!
//! The engine consumes two capabilities from whatever backs a collection:
//! a one-shot snapshot fetch and a long-lived change stream. Both are
//! expressed by [`RemoteSource`]. Implementations may block inside
//! `fetch_snapshot`; the engine always calls it off the reconciliation
//! thread.
//!
//! [`MemoryStore`] is an in-process implementation, useful for embedding
//! and for tests.
//!
//! # Example
//!
//! ```ignore
//! let store = MemoryStore::new();
//! let sub = store.subscribe(&CollectionName::new("tasks")?)?;
//!
//! store.insert("tasks", json!({"name": "write docs"}))?;
//!
//! match sub.recv_timeout(Duration::from_secs(1)) {
//!     Ok(SourceMessage::Event { event }) => println!("got {:?}", event),
//!     Ok(SourceMessage::Closed { reason }) => println!("closed: {}", reason),
//!     Err(_) => {}
//! }
//! ```

mod memory;
mod types;

use crate::error::Result;
use crate::types::{CollectionName, Entity};

pub use memory::{MemoryStore, MemoryStoreConfig};
pub use types::{CloseReason, EventSubscription, SourceMessage, SubscriptionId, Unsubscribe};

/// Snapshot and change-stream capabilities of a remote entity store.
pub trait RemoteSource: Send + Sync + 'static {
    /// Load the full current contents of a collection.
    fn fetch_snapshot(&self, collection: &CollectionName) -> Result<Vec<Entity>>;

    /// Open a change stream for a collection.
    ///
    /// Events committed after this returns must be delivered on the stream,
    /// in commit order.
    fn subscribe(&self, collection: &CollectionName) -> Result<EventSubscription>;
}
