//! # Core Module
//!
//! The stateful heart of the pipeline: the tile-indexed in-memory store that
//! the ingest client writes, and that the dispatcher, subscriber sessions and
//! batch synchronizer read.

pub mod store;

pub use store::{PutOutcome, VesselStore};
