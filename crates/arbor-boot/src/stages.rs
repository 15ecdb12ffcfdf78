//! The four boot stages
//!
//! Tier placement in the membrane tree:
//!
//! | tier       | depth | count                                  |
//! |------------|-------|----------------------------------------|
//! | root       | 0     | 1                                      |
//! | contexts   | 3     | `max_children(3)` under the root       |
//! | partitions | 5     | `max_children(5)` under each context   |
//! | services   | 6     | `max_children(5)` in total             |
//! | apps       | 7     | `max_children(6)` in total             |
//! | threads    | 8     | `max_children(7)` in total             |
//!
//! Stage3 tiers are dealt round-robin over the tier above.

use std::sync::Arc;

use tracing::{debug, info, warn};

use arbor_core::{KernelError, KernelResult};
use arbor_crypto::TrustAnchor;
use arbor_runtime::{Membrane, Substrate};
use arbor_store::ObjectStore;

use crate::{BootConfig, BootManifest, KernelContext, PartitionProvider, PartitionSlot, UserTiers, BOOT_MAGIC};

pub const CONTEXT_DEPTH: u32 = 3;
pub const PARTITION_DEPTH: u32 = 5;
pub const SERVICE_DEPTH: u32 = 6;
pub const APP_DEPTH: u32 = 7;
pub const THREAD_DEPTH: u32 = 8;

/// Stage0: check the Stage1 image against the trust anchor
pub fn stage0_verify(manifest: &BootManifest, anchor: &TrustAnchor) -> KernelResult<()> {
    if manifest.magic != BOOT_MAGIC {
        warn!(magic = ?manifest.magic, "bad manifest magic");
        return Err(KernelError::SecurityAttestationFailed(
            "bad manifest magic".into(),
        ));
    }
    if manifest.stage1_image.is_empty() {
        return Err(KernelError::SecurityAttestationFailed(
            "empty stage1 image".into(),
        ));
    }
    anchor.verify(&manifest.stage1_image, &manifest.attestation)?;
    info!(
        anchor = anchor.fingerprint(),
        image_len = manifest.stage1_image.len(),
        "stage1 image attested"
    );
    Ok(())
}

/// Stage1: object store, root membrane and the top contexts
pub fn stage1_hypervisor(config: &BootConfig) -> KernelResult<KernelContext> {
    let store = Arc::new(ObjectStore::with_config(config.store.clone()));
    let substrate = Substrate::new(
        store,
        Arc::new(config.topology.clone()),
        config.membrane.clone(),
    );

    let root = Membrane::create_root(&substrate)?;
    let mut ctx = KernelContext::new(substrate.clone(), root.clone());

    let count = substrate.topology.max_children(CONTEXT_DEPTH);
    let contexts = (0..count)
        .map(|_| Membrane::create_fresh(&substrate, Some(&root), CONTEXT_DEPTH))
        .collect::<KernelResult<Vec<_>>>()?;
    ctx.push_contexts(contexts);

    info!(root = %root.key(), contexts = count, "hypervisor stage complete");
    Ok(ctx)
}

/// Stage2: partition slots under every context
pub fn stage2_partitions(
    ctx: &mut KernelContext,
    provider: &dyn PartitionProvider,
) -> KernelResult<()> {
    let substrate = ctx.substrate().clone();
    let per_context = substrate.topology.max_children(PARTITION_DEPTH);

    for context in ctx.contexts().to_vec() {
        for _ in 0..per_context {
            let membrane = Membrane::create_fresh(&substrate, Some(&context), PARTITION_DEPTH)?;
            let index = ctx.partitions().len();
            let resources = provider.provision(index, membrane.key())?;
            debug!(
                partition = %membrane.key(),
                index,
                reservoir = resources.reservoir.is_some(),
                engine = resources.engine.is_some(),
                "partition slot built"
            );
            ctx.push_partition(PartitionSlot {
                membrane,
                reservoir: resources.reservoir,
                engine: resources.engine,
            });
        }
    }

    info!(partitions = ctx.partitions().len(), "partition stage complete");
    Ok(())
}

/// Stage3: service, application and thread tiers
pub fn stage3_userspace(ctx: &mut KernelContext) -> KernelResult<()> {
    let substrate = ctx.substrate().clone();
    let topology = substrate.topology.clone();
    let partitions: Vec<Membrane> = ctx.partitions().iter().map(|p| p.membrane.clone()).collect();

    let services = spawn_tier(
        &substrate,
        &partitions,
        topology.max_children(PARTITION_DEPTH),
        SERVICE_DEPTH,
    )?;
    let apps = spawn_tier(
        &substrate,
        &services,
        topology.max_children(SERVICE_DEPTH),
        APP_DEPTH,
    )?;
    let threads = spawn_tier(
        &substrate,
        &apps,
        topology.max_children(APP_DEPTH),
        THREAD_DEPTH,
    )?;

    info!(
        services = services.len(),
        apps = apps.len(),
        threads = threads.len(),
        "userspace stage complete"
    );
    ctx.set_tiers(UserTiers {
        services,
        apps,
        threads,
    });
    Ok(())
}

/// Create `total` membranes at `depth`, dealt round-robin over `parents`
fn spawn_tier(
    substrate: &Arc<Substrate>,
    parents: &[Membrane],
    total: u32,
    depth: u32,
) -> KernelResult<Vec<Membrane>> {
    if parents.is_empty() {
        if total > 0 {
            warn!(depth, total, "no parents for tier, skipped");
        }
        return Ok(Vec::new());
    }
    (0..total as usize)
        .map(|i| Membrane::create_fresh(substrate, Some(&parents[i % parents.len()]), depth))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbor_core::{SecurityLevel, Topology};
    use arbor_crypto::AttestationKey;

    use crate::NullProvider;

    #[test]
    fn test_stage0_rejects_bad_magic() {
        let key = AttestationKey::generate();
        let mut manifest = BootManifest::signed(&key, &b"hypervisor"[..]);
        assert!(stage0_verify(&manifest, &key.anchor()).is_ok());

        manifest.magic = *b"XXXX";
        let err = stage0_verify(&manifest, &key.anchor()).unwrap_err();
        assert!(matches!(err, KernelError::SecurityAttestationFailed(_)));
    }

    #[test]
    fn test_stage0_rejects_empty_image() {
        let key = AttestationKey::generate();
        let manifest = BootManifest::signed(&key, bytes::Bytes::new());
        assert!(stage0_verify(&manifest, &key.anchor()).is_err());
    }

    #[test]
    fn test_stage1_builds_contexts() {
        let ctx = stage1_hypervisor(&BootConfig::default()).unwrap();
        assert_eq!(ctx.contexts().len(), 2);
        for context in ctx.contexts() {
            assert_eq!(context.depth(), CONTEXT_DEPTH);
            assert_eq!(ctx.level_of(context.key()), Some(SecurityLevel::Kernel));
        }
        assert_eq!(ctx.level_of(ctx.root().key()), Some(SecurityLevel::Hypervisor));
        assert_eq!(ctx.membrane_count(), 3);
    }

    #[test]
    fn test_stage2_partitions_per_context() {
        let mut ctx = stage1_hypervisor(&BootConfig::default()).unwrap();
        stage2_partitions(&mut ctx, &NullProvider).unwrap();

        assert_eq!(ctx.partitions().len(), 18);
        for context in ctx.contexts() {
            assert_eq!(context.children().len(), 9);
        }
        assert!(ctx.partitions().iter().all(|p| p.reservoir.is_none()));
    }

    #[test]
    fn test_stage3_round_robin() {
        let mut ctx = stage1_hypervisor(&BootConfig::default()).unwrap();
        stage2_partitions(&mut ctx, &NullProvider).unwrap();
        stage3_userspace(&mut ctx).unwrap();

        let tiers = ctx.tiers();
        assert_eq!(tiers.services.len(), 9);
        assert_eq!(tiers.apps.len(), 20);
        assert_eq!(tiers.threads.len(), 48);

        // 20 apps over 9 services: the first two take three each
        let per_service: Vec<usize> = tiers.services.iter().map(|s| s.children().len()).collect();
        assert_eq!(per_service, vec![3, 3, 2, 2, 2, 2, 2, 2, 2]);
        assert!(tiers.threads.iter().all(|t| t.depth() == THREAD_DEPTH));
        assert_eq!(ctx.level_of(tiers.apps[0].key()), Some(SecurityLevel::App));
    }

    #[test]
    fn test_shallow_topology_skips_tiers() {
        let config = BootConfig {
            topology: Topology::from_table(&[0, 1, 1, 2, 4]),
            ..Default::default()
        };
        let mut ctx = stage1_hypervisor(&config).unwrap();
        stage2_partitions(&mut ctx, &NullProvider).unwrap();
        stage3_userspace(&mut ctx).unwrap();

        assert_eq!(ctx.contexts().len(), 2);
        assert!(ctx.partitions().is_empty());
        assert!(ctx.tiers().is_empty());
    }
}
