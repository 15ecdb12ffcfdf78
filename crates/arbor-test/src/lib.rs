//! Arbor Test Harness - seeded stimuli and hierarchy invariants
//!
//! This crate provides:
//! - Weighted, reproducible stimulus generation
//! - A harness that boots a kernel, feeds it stimuli and drains the tree
//! - Invariant checks over the resulting hierarchy

pub mod integration;
pub mod stimulus;

pub use integration::*;
pub use stimulus::*;
