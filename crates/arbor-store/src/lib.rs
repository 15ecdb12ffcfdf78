//! Arbor Object Store - Allocation, identity and links
//!
//! This crate implements the keyed repository every other layer allocates
//! through:
//! - Ordered key pool with generation-checked recycling
//! - Zero-initialised payload entries, hash-indexed by key
//! - Directed, weighted links between entries
//! - Externally backed payloads (recorded, never touched)

pub mod entry;
pub mod pool;
pub mod store;

pub use entry::*;
pub use pool::*;
pub use store::*;
