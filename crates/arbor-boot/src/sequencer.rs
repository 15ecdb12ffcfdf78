//! Boot state machine

use tracing::{error, info};

use arbor_core::{BootStage, KernelError, KernelResult};
use arbor_crypto::TrustAnchor;

use crate::{
    stage0_verify, stage1_hypervisor, stage2_partitions, stage3_userspace, BootConfig,
    BootManifest, KernelContext, NullProvider, PartitionProvider,
};

/// Drives the stages strictly forward
///
/// A stage failure moves the sequencer to `Halted`; from then on every
/// call reports the stage that failed. Nothing is rolled back.
pub struct BootSequencer<P: PartitionProvider = NullProvider> {
    config: BootConfig,
    anchor: TrustAnchor,
    manifest: BootManifest,
    provider: P,
    stage: BootStage,
    halted_at: Option<BootStage>,
    context: Option<KernelContext>,
}

impl BootSequencer<NullProvider> {
    pub fn new(config: BootConfig, anchor: TrustAnchor, manifest: BootManifest) -> Self {
        Self::with_provider(config, anchor, manifest, NullProvider)
    }
}

impl<P: PartitionProvider> BootSequencer<P> {
    pub fn with_provider(
        config: BootConfig,
        anchor: TrustAnchor,
        manifest: BootManifest,
        provider: P,
    ) -> Self {
        BootSequencer {
            config,
            anchor,
            manifest,
            provider,
            stage: BootStage::Stage0,
            halted_at: None,
            context: None,
        }
    }

    /// Stage that runs on the next `advance`, or a terminal state
    pub fn stage(&self) -> BootStage {
        self.stage
    }

    /// Stage whose failure halted the sequencer
    pub fn halted_at(&self) -> Option<BootStage> {
        self.halted_at
    }

    pub fn context(&self) -> Option<&KernelContext> {
        self.context.as_ref()
    }

    /// Take whatever was built, e.g. to inspect or tear down after a halt
    pub fn take_context(&mut self) -> Option<KernelContext> {
        self.context.take()
    }

    /// Run the current stage and move to the next
    pub fn advance(&mut self) -> KernelResult<BootStage> {
        let stage = self.stage;
        match stage {
            BootStage::Halted => {
                return Err(KernelError::Halted(self.halted_at.unwrap_or(stage)));
            }
            BootStage::Running => return Ok(stage),
            _ => {}
        }

        if let Err(err) = self.run_stage(stage) {
            error!(stage = stage.name(), error = %err, "boot halted");
            self.stage = BootStage::Halted;
            self.halted_at = Some(stage);
            return Err(err);
        }

        let next = stage.next().unwrap_or(BootStage::Running);
        if let Some(ctx) = self.context.as_mut() {
            ctx.mark(stage);
        }
        self.stage = next;
        info!(completed = stage.name(), next = next.name(), "boot stage complete");
        Ok(next)
    }

    fn run_stage(&mut self, stage: BootStage) -> KernelResult<()> {
        match stage {
            BootStage::Stage0 => stage0_verify(&self.manifest, &self.anchor),
            BootStage::Stage1 => {
                self.context = Some(stage1_hypervisor(&self.config)?);
                Ok(())
            }
            BootStage::Stage2 => stage2_partitions(built(&mut self.context)?, &self.provider),
            BootStage::Stage3 => {
                let run_loops = self.config.run_loops;
                let ctx = built(&mut self.context)?;
                stage3_userspace(ctx)?;
                if run_loops {
                    ctx.start_loops()?;
                }
                Ok(())
            }
            BootStage::Running | BootStage::Halted => Ok(()),
        }
    }

    /// Advance until `Running` and hand over the context
    pub fn boot(mut self) -> KernelResult<KernelContext> {
        while self.stage != BootStage::Running {
            self.advance()?;
        }
        self.context
            .take()
            .ok_or_else(|| KernelError::invalid("boot finished without a kernel context"))
    }
}

fn built(context: &mut Option<KernelContext>) -> KernelResult<&mut KernelContext> {
    context
        .as_mut()
        .ok_or_else(|| KernelError::invalid("no kernel context before stage1"))
}
