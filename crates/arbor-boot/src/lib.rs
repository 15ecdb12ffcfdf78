//! Arbor Boot - staged construction of the membrane hierarchy
//!
//! Stage0 checks the attested Stage1 image, Stage1 builds the store and
//! the root membrane with its contexts, Stage2 fills the contexts with
//! partition slots and Stage3 spawns the service, application and thread
//! tiers. Every stage works on an explicit [`KernelContext`] owned by the
//! caller. A failed stage halts the sequencer for good.

pub mod config;
pub mod context;
pub mod provider;
pub mod sequencer;
pub mod stages;

pub use config::*;
pub use context::*;
pub use provider::*;
pub use sequencer::*;
pub use stages::*;
