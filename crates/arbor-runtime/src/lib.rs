//! Arbor Runtime - event loop tree and membrane rule engine
//!
//! Every membrane is paired with exactly one event loop. Loops form a tree
//! whose fan-out per depth is bounded by the [`arbor_core::Topology`];
//! membranes form the same tree and evolve their object stock when their
//! loop dispatches an `Evolve` event.
//!
//! Threading: each loop may run on its own OS thread ([`EventLoop::spawn`]),
//! blocking on its queue while idle. Loops that are not spawned can be
//! driven from the caller with [`EventLoop::drain`] and
//! [`EventLoop::drain_tree`].

pub mod event_loop;
pub mod handler;
pub mod membrane;
pub mod rule;
pub mod stats;

pub use event_loop::*;
pub use handler::*;
pub use membrane::*;
pub use rule::*;
pub use stats::*;
