//! Externally owned partition resources

use arbor_core::{Key, KernelResult, Opaque};

/// Handles a partition slot carries without interpreting them
#[derive(Clone, Debug, Default)]
pub struct PartitionResources {
    pub reservoir: Option<Opaque>,
    pub engine: Option<Opaque>,
}

/// Supplies the reservoir and differential-engine handles for each
/// partition slot as Stage2 builds it
pub trait PartitionProvider {
    fn provision(&self, index: usize, partition: Key) -> KernelResult<PartitionResources>;
}

/// Provider for systems with no external engines
#[derive(Clone, Copy, Debug, Default)]
pub struct NullProvider;

impl PartitionProvider for NullProvider {
    fn provision(&self, _index: usize, _partition: Key) -> KernelResult<PartitionResources> {
        Ok(PartitionResources::default())
    }
}
