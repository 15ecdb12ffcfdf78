//! Boot configuration and the Stage1 manifest

use bytes::Bytes;

use arbor_core::Topology;
use arbor_crypto::{Attestation, AttestationKey};
use arbor_runtime::MembraneConfig;
use arbor_store::StoreConfig;

/// Magic prefix every manifest must carry
pub const BOOT_MAGIC: [u8; 4] = *b"ARBR";

/// Boot configuration
#[derive(Clone, Debug, Default)]
pub struct BootConfig {
    /// Fan-out table for every tier
    pub topology: Topology,
    pub store: StoreConfig,
    pub membrane: MembraneConfig,
    /// Put every loop on its own thread once the hierarchy is built
    pub run_loops: bool,
}

/// The Stage1 image and its attestation
#[derive(Clone, Debug)]
pub struct BootManifest {
    pub magic: [u8; 4],
    pub stage1_image: Bytes,
    pub attestation: Attestation,
}

impl BootManifest {
    /// Manifest for `image` signed with `key`
    pub fn signed(key: &AttestationKey, image: impl Into<Bytes>) -> Self {
        let stage1_image = image.into();
        let attestation = key.attest(&stage1_image);
        BootManifest {
            magic: BOOT_MAGIC,
            stage1_image,
            attestation,
        }
    }
}
