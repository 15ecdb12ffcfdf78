//! Seams between a loop and the units it dispatches into

use arbor_core::{Event, Key, KernelResult, Timestamp};

/// Externally owned handler for timer, I/O and interrupt events
///
/// All methods default to accepting the event and doing nothing.
pub trait StageHandler: Send + Sync {
    fn on_timer(&self, loop_id: Key, event: &Event) -> KernelResult<()> {
        let _ = (loop_id, event);
        Ok(())
    }

    fn on_io_ready(&self, loop_id: Key, event: &Event) -> KernelResult<()> {
        let _ = (loop_id, event);
        Ok(())
    }

    fn on_interrupt(&self, loop_id: Key, event: &Event) -> KernelResult<()> {
        let _ = (loop_id, event);
        Ok(())
    }
}

/// Unit paired with a loop: receives `Evolve` ticks and delivered payloads
pub trait EventSink: Send + Sync {
    fn sink_key(&self) -> Key;

    fn evolve_at(&self, timestamp: Timestamp) -> KernelResult<()>;

    fn deliver(&self, event: &Event) -> KernelResult<()>;
}
