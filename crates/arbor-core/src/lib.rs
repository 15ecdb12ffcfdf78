//! Arbor Core - Fundamental types and primitives
//!
//! This crate defines the types shared by every layer of the substrate:
//! - Identifiers (Key, Handle)
//! - Time primitives (Timestamp)
//! - The topology table bounding fan-out at each depth
//! - Events, payload ownership tags and object multisets
//! - The error taxonomy

pub mod error;
pub mod event;
pub mod id;
pub mod level;
pub mod object;
pub mod time;
pub mod topology;

pub use error::*;
pub use event::*;
pub use id::*;
pub use level::*;
pub use object::*;
pub use time::*;
pub use topology::*;
