//! Baseline state and change application.
//!
//! The baseline is the engine's authoritative copy of one collection. It is
//! only ever mutated through [`apply_event`] or by installing a snapshot, and
//! it never holds two entities with the same id.

mod baseline;
mod operations;

pub use baseline::Baseline;
pub use operations::{apply_event, ApplyOutcome, IgnoreReason};
