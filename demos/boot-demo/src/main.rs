//! Arbor Boot Demo
//!
//! Boots the canonical hierarchy from a signed manifest, then:
//! - seeds objects into the thread tier
//! - lets a cargo rule carry them up towards the root
//! - broadcasts one propagate through every loop
//! - prints loop and store counters and shuts down
//!
//! Pass `--threads` to run every loop on its own thread instead of
//! draining them from here. `RUST_LOG` controls log output.

use std::thread;
use std::time::Duration;

use bytes::Bytes;
use tracing::info;
use tracing_subscriber::EnvFilter;

use arbor_boot::{BootConfig, BootManifest, BootSequencer, KernelContext};
use arbor_core::{BootStage, EventKind, EventPayload, ObjectType};
use arbor_crypto::AttestationKey;
use arbor_runtime::{Rule, StructuralAction};

const CARGO: ObjectType = ObjectType(1);
const SEALED: ObjectType = ObjectType(2);

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let threaded = std::env::args().any(|arg| arg == "--threads");

    println!("╔════════════════════════════════════════════════════════════╗");
    println!("║           Arbor Boot Demo                                  ║");
    println!("║     Attested boot of the membrane hierarchy                ║");
    println!("╚════════════════════════════════════════════════════════════╝");
    println!();

    let key = AttestationKey::generate();
    let manifest = BootManifest::signed(&key, Bytes::from_static(b"arbor demo hypervisor"));
    let config = BootConfig {
        run_loops: threaded,
        ..Default::default()
    };

    let mut sequencer = BootSequencer::new(config, key.anchor(), manifest);
    while sequencer.stage() != BootStage::Running {
        let next = sequencer.advance()?;
        println!("  boot -> {}", next.name());
    }
    let ctx = sequencer
        .take_context()
        .ok_or("boot finished without a kernel context")?;

    println!();
    println!("Hierarchy:");
    println!("  contexts:   {}", ctx.contexts().len());
    println!("  partitions: {}", ctx.partitions().len());
    println!("  services:   {}", ctx.tiers().services.len());
    println!("  apps:       {}", ctx.tiers().apps.len());
    println!("  threads:    {}", ctx.tiers().threads.len());
    println!("  membranes:  {}", ctx.membrane_count());
    println!("  store:      {} entries", ctx.store().entry_count());

    // Each membrane forwards one cargo per tick; the root seals one per tick
    for membrane in ctx.root().subtree() {
        membrane.add_rule(
            Rule::new(0)
                .consumes(CARGO, 1)
                .produces(CARGO, 1)
                .then(StructuralAction::SendOut),
        )?;
    }
    ctx.root()
        .add_rule(Rule::new(1).consumes(CARGO, 1).produces(SEALED, 1))?;

    for leaf in &ctx.tiers().threads {
        leaf.add_object(CARGO, 2)?;
    }
    let seeded = 2 * ctx.tiers().threads.len() as u64;

    for _ in 0..=ctx.topology().max_depth() {
        for membrane in ctx.root().subtree() {
            membrane.tick()?;
        }
        settle(&ctx, threaded);
    }

    let root = ctx.root();
    root.event_loop()
        .post(EventKind::Propagate, root.key(), EventPayload::None)?;
    settle(&ctx, threaded);

    println!();
    println!("Evolution:");
    println!("  seeded:     {} cargo", seeded);
    let sealed = root.count(SEALED);
    println!("  sealed:     {} at the root", sealed);
    println!("  in transit: {}", seeded - sealed);

    let mut processed = 0;
    let mut propagated = 0;
    for looper in root.event_loop().subtree() {
        let stats = looper.stats();
        processed += stats.processed;
        propagated += stats.propagated;
    }
    println!("  processed:  {} events", processed);
    println!("  propagated: {} copies", propagated);

    let store = ctx.store().clone();
    let report = ctx.shutdown()?;
    info!(membranes = report.membranes, loops = report.loops, "demo complete");

    println!();
    println!("Shutdown:");
    println!("  membranes:  {}", report.membranes);
    println!("  loops:      {}", report.loops);
    println!("  store left: {} entries", store.entry_count());
    Ok(())
}

/// Let queued work finish
fn settle(ctx: &KernelContext, threaded: bool) {
    if threaded {
        thread::sleep(Duration::from_millis(20));
    } else {
        ctx.root().event_loop().drain_tree();
    }
}
