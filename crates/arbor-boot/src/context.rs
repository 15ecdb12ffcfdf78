//! Kernel context - everything the boot stages construct

use std::collections::HashMap;
use std::sync::Arc;

use tracing::info;

use arbor_core::{BootStage, Key, KernelResult, Opaque, SecurityLevel, Topology};
use arbor_runtime::{Membrane, Substrate, TeardownReport};
use arbor_store::ObjectStore;

/// A Stage2 partition: its membrane plus the external handles it carries
#[derive(Clone, Debug)]
pub struct PartitionSlot {
    pub membrane: Membrane,
    pub reservoir: Option<Opaque>,
    pub engine: Option<Opaque>,
}

/// Stage3 tiers
#[derive(Clone, Debug, Default)]
pub struct UserTiers {
    pub services: Vec<Membrane>,
    pub apps: Vec<Membrane>,
    pub threads: Vec<Membrane>,
}

impl UserTiers {
    pub fn len(&self) -> usize {
        self.services.len() + self.apps.len() + self.threads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Explicit handoff between boot stages
///
/// Owned by whoever drives the boot. Shutting it down stops any loop
/// threads and tears the hierarchy down from the leaves up.
pub struct KernelContext {
    substrate: Arc<Substrate>,
    root: Membrane,
    contexts: Vec<Membrane>,
    partitions: Vec<PartitionSlot>,
    tiers: UserTiers,
    levels: HashMap<Key, SecurityLevel>,
    stage: BootStage,
}

impl KernelContext {
    pub(crate) fn new(substrate: Arc<Substrate>, root: Membrane) -> Self {
        let mut levels = HashMap::new();
        levels.insert(root.key(), SecurityLevel::Hypervisor);
        KernelContext {
            substrate,
            root,
            contexts: Vec::new(),
            partitions: Vec::new(),
            tiers: UserTiers::default(),
            levels,
            stage: BootStage::Stage1,
        }
    }

    pub fn store(&self) -> &Arc<ObjectStore> {
        &self.substrate.store
    }

    pub fn topology(&self) -> &Arc<Topology> {
        &self.substrate.topology
    }

    pub fn substrate(&self) -> &Arc<Substrate> {
        &self.substrate
    }

    pub fn root(&self) -> &Membrane {
        &self.root
    }

    pub fn contexts(&self) -> &[Membrane] {
        &self.contexts
    }

    pub fn partitions(&self) -> &[PartitionSlot] {
        &self.partitions
    }

    pub fn tiers(&self) -> &UserTiers {
        &self.tiers
    }

    /// Last stage that completed on this context
    pub fn stage(&self) -> BootStage {
        self.stage
    }

    pub fn level_of(&self, key: Key) -> Option<SecurityLevel> {
        self.levels.get(&key).copied()
    }

    /// Membranes in the hierarchy, root included
    pub fn membrane_count(&self) -> usize {
        self.root.subtree().len()
    }

    pub(crate) fn push_contexts(&mut self, contexts: Vec<Membrane>) {
        self.tag(&contexts, SecurityLevel::Kernel);
        self.contexts.extend(contexts);
    }

    pub(crate) fn push_partition(&mut self, slot: PartitionSlot) {
        self.levels.insert(slot.membrane.key(), SecurityLevel::Kernel);
        self.partitions.push(slot);
    }

    pub(crate) fn set_tiers(&mut self, tiers: UserTiers) {
        self.tag(&tiers.services, SecurityLevel::Service);
        self.tag(&tiers.apps, SecurityLevel::App);
        self.tag(&tiers.threads, SecurityLevel::Thread);
        self.tiers = tiers;
    }

    pub(crate) fn mark(&mut self, stage: BootStage) {
        self.stage = stage;
    }

    fn tag(&mut self, membranes: &[Membrane], level: SecurityLevel) {
        for membrane in membranes {
            self.levels.insert(membrane.key(), level);
        }
    }

    /// Run every loop in the hierarchy on its own thread
    ///
    /// Membranes created later below a running loop get a thread of their
    /// own; all of them are joined by [`stop_loops`](Self::stop_loops).
    pub fn start_loops(&mut self) -> KernelResult<usize> {
        let running = self.substrate.thread_count();
        if running > 0 {
            return Ok(running);
        }
        let threads = self.root.event_loop().spawn_tree()?;
        let started = threads.len();
        for thread in threads {
            self.substrate.register_thread(thread);
        }
        info!(loops = started, "loop threads started");
        Ok(started)
    }

    pub fn loop_thread_count(&self) -> usize {
        self.substrate.thread_count()
    }

    /// Stop and join every loop thread
    pub fn stop_loops(&mut self) {
        let joined = self.substrate.join_threads();
        if joined > 0 {
            info!(loops = joined, "loop threads stopped");
        }
    }

    /// Tear the hierarchy down, deepest membranes first
    pub fn shutdown(mut self) -> KernelResult<TeardownReport> {
        self.stop_loops();
        let report = self.root.destroy()?;
        info!(
            membranes = report.membranes,
            loops = report.loops,
            freed = report.freed,
            handed_back = report.handed_back.len(),
            entries_left = self.substrate.store.entry_count(),
            "kernel shut down"
        );
        Ok(report)
    }
}

impl Drop for KernelContext {
    fn drop(&mut self) {
        self.stop_loops();
    }
}

impl std::fmt::Debug for KernelContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelContext")
            .field("stage", &self.stage)
            .field("root", &self.root.key())
            .field("contexts", &self.contexts.len())
            .field("partitions", &self.partitions.len())
            .field("tiers", &self.tiers.len())
            .field("loop_threads", &self.substrate.thread_count())
            .finish()
    }
}
