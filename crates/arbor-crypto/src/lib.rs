//! Arbor Crypto - Boot image attestation
//!
//! Provides the primitives behind the firmware gate:
//! - SHA-256 digests of stage images
//! - Ed25519 signing of digests by a release key
//! - Verification against a trusted public anchor

pub mod attestation;

pub use attestation::*;
