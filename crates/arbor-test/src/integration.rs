//! End-to-end integration harness
//!
//! Boots a kernel through the full attested sequence, installs a closed
//! rule set on every membrane, feeds seeded stimuli through the loops and
//! checks that the hierarchy still holds together:
//! - fan-out at every depth stays within the topology
//! - every membrane is paired with a loop of the same key and depth
//! - the weighted object total only changes by what was injected
//! - every message and broadcast copy arrives
//! - shutdown returns every store entry

use std::sync::Arc;

use bytes::Bytes;

use arbor_boot::{BootConfig, BootManifest, BootSequencer, KernelContext};
use arbor_core::{
    Event, EventKind, EventPayload, KernelResult, Multiset, ObjectType, Timestamp, Topology,
};
use arbor_crypto::AttestationKey;
use arbor_runtime::{Membrane, Rule, StructuralAction};
use arbor_store::ObjectStore;

use crate::{Stimulus, StimulusConfig, StimulusGenerator, CARGO, PRODUCT, REACTANT};

const STAGE1_IMAGE: &[u8] = b"arbor integration stage1";

/// Weight of each object type in the conserved total
fn weight(object: ObjectType) -> u64 {
    match object {
        PRODUCT => 2,
        _ => 1,
    }
}

fn weighted_total(stock: &Multiset) -> u64 {
    stock.iter().map(|(object, n)| weight(object) * n).sum()
}

/// Rules every harness membrane carries: `2R <-> P` keeps `R + 2P`
/// constant, cargo climbs towards the root
fn closed_rules() -> Vec<Rule> {
    vec![
        Rule::new(2).consumes(REACTANT, 2).produces(PRODUCT, 1),
        Rule::new(1).consumes(PRODUCT, 1).produces(REACTANT, 2),
        Rule::new(0)
            .consumes(CARGO, 1)
            .produces(CARGO, 1)
            .then(StructuralAction::SendOut),
    ]
}

#[derive(Debug, Clone)]
pub struct IntegrationTestConfig {
    pub topology: Topology,
    /// Stimuli per run
    pub stimuli: usize,
    pub stimulus: StimulusConfig,
    pub seed: u64,
    /// Evolve every membrane this many times after the stimuli
    pub settle_rounds: usize,
}

impl Default for IntegrationTestConfig {
    fn default() -> Self {
        Self {
            topology: Topology::from_table(&[0, 1, 1, 2, 2, 2, 2, 2, 2]),
            stimuli: 200,
            stimulus: StimulusConfig::default(),
            seed: 42,
            settle_rounds: 4,
        }
    }
}

impl IntegrationTestConfig {
    /// Smallest hierarchy that still has every tier
    pub fn minimal() -> Self {
        Self {
            topology: Topology::from_table(&[0, 1, 1, 2, 1, 1, 1, 1, 1]),
            stimuli: 50,
            stimulus: StimulusConfig::quiet(),
            ..Default::default()
        }
    }

    pub fn standard() -> Self {
        Self::default()
    }

    /// The canonical hierarchy under heavy traffic
    pub fn stress() -> Self {
        Self {
            topology: Topology::canonical(),
            stimuli: 2_000,
            stimulus: StimulusConfig::noisy(),
            ..Default::default()
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }
}

/// Result of an integration run
#[derive(Debug, Clone, Default)]
pub struct IntegrationTestResult {
    pub membranes: usize,
    pub stimuli_applied: usize,
    /// Stimuli refused at post time (full queue)
    pub stimuli_refused: usize,
    pub events_processed: u64,
    pub messages_sent: usize,
    pub messages_received: usize,
    pub broadcasts: usize,
    pub propagated: u64,
    pub timers: u64,
    pub unhandled: u64,
    /// Membrane faults recorded during the run
    pub faults: u64,
    pub injected_weight: u64,
    pub final_weight: u64,
    pub entries_left: u64,
    pub invariant_violations: Vec<String>,
}

impl IntegrationTestResult {
    pub fn passed(&self) -> bool {
        self.invariant_violations.is_empty()
    }
}

/// Integration test harness
pub struct IntegrationTestHarness {
    config: IntegrationTestConfig,
    generator: StimulusGenerator,
}

impl IntegrationTestHarness {
    pub fn new(config: IntegrationTestConfig) -> Self {
        let generator = StimulusGenerator::new(config.stimulus.clone(), config.seed);
        Self { config, generator }
    }

    /// Boot, stimulate, settle, check, shut down
    pub fn run(&mut self) -> KernelResult<IntegrationTestResult> {
        let ctx = self.boot()?;
        let membranes = ctx.root().subtree();
        for membrane in &membranes {
            for rule in closed_rules() {
                membrane.add_rule(rule)?;
            }
        }

        let mut result = IntegrationTestResult {
            membranes: membranes.len(),
            ..Default::default()
        };

        let stimuli = self.generator.batch(membranes.len(), self.config.stimuli);
        for stimulus in stimuli {
            match self.apply(&ctx, &membranes, &stimulus, &mut result) {
                Ok(()) => result.stimuli_applied += 1,
                Err(_) => result.stimuli_refused += 1,
            }
            // Keep queues short the way a running system would
            ctx.root().event_loop().drain_tree();
        }

        for _ in 0..self.config.settle_rounds {
            for membrane in &membranes {
                let _ = membrane.tick();
            }
            ctx.root().event_loop().drain_tree();
        }

        self.collect(&membranes, &mut result);
        check_fan_out(ctx.topology(), &membranes, &mut result);
        check_pairing(&membranes, &mut result);
        self.check_counts(&membranes, &mut result);

        let store: Arc<ObjectStore> = ctx.store().clone();
        ctx.shutdown()?;
        result.entries_left = store.entry_count();
        if result.entries_left != 0 {
            result.invariant_violations.push(format!(
                "{} store entries left after shutdown",
                result.entries_left
            ));
        }
        Ok(result)
    }

    fn boot(&self) -> KernelResult<KernelContext> {
        let key = AttestationKey::generate();
        let manifest = BootManifest::signed(&key, STAGE1_IMAGE);
        let config = BootConfig {
            topology: self.config.topology.clone(),
            ..Default::default()
        };
        BootSequencer::new(config, key.anchor(), manifest).boot()
    }

    fn apply(
        &self,
        ctx: &KernelContext,
        membranes: &[Membrane],
        stimulus: &Stimulus,
        result: &mut IntegrationTestResult,
    ) -> KernelResult<()> {
        match *stimulus {
            Stimulus::Seed {
                target,
                object,
                count,
            } => {
                let dst = &membranes[target];
                let parcel = Multiset::from_pairs([(object, count)]);
                dst.event_loop().post_event(
                    Event::new(EventKind::Propagate, dst.key())
                        .addressed_to(dst.key())
                        .with_payload(EventPayload::Objects(parcel)),
                )?;
                result.injected_weight += weight(object) * count;
            }
            Stimulus::Tick { target } => {
                membranes[target].tick()?;
            }
            Stimulus::Broadcast => {
                let root = ctx.root();
                root.event_loop()
                    .post(EventKind::Propagate, root.key(), EventPayload::None)?;
                result.broadcasts += 1;
            }
            Stimulus::Message { from, to, len } => {
                let body = Bytes::from(vec![(from % 256) as u8; len]);
                membranes[from].send(&membranes[to], body)?;
                result.messages_sent += 1;
            }
            Stimulus::Timer { target } => {
                let looper = membranes[target].event_loop();
                looper.post_event(
                    Event::new(EventKind::TimerExpire, looper.id()).at(Timestamp::now()),
                )?;
                result.timers += 1;
            }
        }
        Ok(())
    }

    fn collect(&self, membranes: &[Membrane], result: &mut IntegrationTestResult) {
        for membrane in membranes {
            let stats = membrane.event_loop().stats();
            result.events_processed += stats.processed;
            result.propagated += stats.propagated;
            result.unhandled += stats.unhandled;
            result.faults += membrane.fault_count();
            result.final_weight += weighted_total(&membrane.stock());
            while membrane.receive().is_some() {
                result.messages_received += 1;
            }
        }
    }

    fn check_counts(&self, membranes: &[Membrane], result: &mut IntegrationTestResult) {
        if result.final_weight != result.injected_weight {
            result.invariant_violations.push(format!(
                "weighted total {} differs from injected {}",
                result.final_weight, result.injected_weight
            ));
        }
        if result.messages_received != result.messages_sent {
            result.invariant_violations.push(format!(
                "{} messages sent, {} received",
                result.messages_sent, result.messages_received
            ));
        }
        let edges = membranes.len().saturating_sub(1) as u64;
        let expected = result.broadcasts as u64 * edges;
        if result.propagated != expected {
            result.invariant_violations.push(format!(
                "{} broadcast copies, expected {}",
                result.propagated, expected
            ));
        }
        // No stage handler is installed on harness loops
        if result.unhandled != result.timers {
            result.invariant_violations.push(format!(
                "{} timers posted, {} reached the unhandled path",
                result.timers, result.unhandled
            ));
        }
    }
}

fn check_fan_out(topology: &Topology, membranes: &[Membrane], result: &mut IntegrationTestResult) {
    for membrane in membranes {
        let children = membrane.children();
        for child in &children {
            if child.depth() <= membrane.depth() {
                result.invariant_violations.push(format!(
                    "{} at depth {} has child at depth {}",
                    membrane.key(),
                    membrane.depth(),
                    child.depth()
                ));
            }
            let limit = topology.max_children(child.depth()) as usize;
            let peers = children.iter().filter(|c| c.depth() == child.depth()).count();
            if peers > limit {
                result.invariant_violations.push(format!(
                    "{} holds {} children at depth {}, limit {}",
                    membrane.key(),
                    peers,
                    child.depth(),
                    limit
                ));
            }
        }
    }
}

fn check_pairing(membranes: &[Membrane], result: &mut IntegrationTestResult) {
    for membrane in membranes {
        let looper = membrane.event_loop();
        if looper.id() != membrane.key() || looper.depth() != membrane.depth() {
            result
                .invariant_violations
                .push(format!("{} is paired with loop {}", membrane.key(), looper.id()));
        }
        if looper.child_count() != membrane.children().len() {
            result.invariant_violations.push(format!(
                "{} has {} children but its loop has {}",
                membrane.key(),
                membrane.children().len(),
                looper.child_count()
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_closed_rules_conserve_weight() {
        let mut stock = Multiset::from_pairs([(REACTANT, 5), (PRODUCT, 2)]);
        let before = weighted_total(&stock);
        for rule in closed_rules().iter().take(2) {
            if stock.covers(&rule.lhs) {
                stock.subtract(&rule.lhs).unwrap();
                stock.merge(&rule.rhs);
            }
        }
        assert_eq!(weighted_total(&stock), before);
    }

    #[test]
    fn test_minimal_run() {
        let mut harness = IntegrationTestHarness::new(IntegrationTestConfig::minimal());
        let result = harness.run().unwrap();
        assert!(result.passed(), "violations: {:?}", result.invariant_violations);
        // root + 2 contexts + 2 partitions + 1 service + 1 app + 1 thread
        assert_eq!(result.membranes, 8);
        assert_eq!(result.entries_left, 0);
    }

    #[test]
    fn test_standard_run() {
        let mut harness = IntegrationTestHarness::new(IntegrationTestConfig::standard());
        let result = harness.run().unwrap();
        assert!(result.passed(), "violations: {:?}", result.invariant_violations);
        assert!(result.stimuli_applied > 0);
        assert!(result.events_processed >= result.stimuli_applied as u64);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(8))]

        #[test]
        fn prop_any_seed_keeps_invariants(seed in any::<u64>()) {
            let config = IntegrationTestConfig::minimal().with_seed(seed);
            let result = IntegrationTestHarness::new(config).run().unwrap();
            prop_assert!(result.passed(), "violations: {:?}", result.invariant_violations);
        }
    }
}
