use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicU64, Ordering},
};

use anyhow::{Result, bail};
use plexus_bus::{
    Capabilities, Dependency, Module, ModuleDefinition, OwnedBus, is_main_thread, submit_module,
};
use tracing::{debug, info};

use super::{Frame, stats::FrameStats};

/// Updates between two heartbeat log lines
pub const BEAT_EVERY: u64 = 600;

/// Logs a line every [`BEAT_EVERY`] updates while the host has focus, and
/// checks frame delivery on the main-thread context.
pub struct Heartbeat {
    updates: AtomicU64,
    focused: AtomicBool,
    main_thread_frames: Arc<AtomicU64>,
}

impl Heartbeat {
    pub fn updates(&self) -> u64 {
        self.updates.load(Ordering::Relaxed)
    }

    pub fn main_thread_frames(&self) -> u64 {
        self.main_thread_frames.load(Ordering::Relaxed)
    }
}

impl Module for Heartbeat {
    fn capabilities(&self) -> Capabilities {
        Capabilities::UPDATE | Capabilities::FOCUS
    }

    fn register(&self, bus: &OwnedBus) -> Result<()> {
        let frames = self.main_thread_frames.clone();
        bus.on_broadcast_main_thread(100, move |_: Frame, _| {
            let frames = frames.clone();
            async move {
                if !is_main_thread() {
                    bail!("frame delivered off the main-thread context");
                }
                frames.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
        })?;
        Ok(())
    }

    fn update(&self) -> Result<()> {
        let updates = self.updates.fetch_add(1, Ordering::Relaxed) + 1;
        if updates % BEAT_EVERY == 0 && self.focused.load(Ordering::Relaxed) {
            info!("💓 {} updates", updates);
        }
        Ok(())
    }

    fn on_focus(&self, focused: bool) -> Result<()> {
        debug!("Heartbeat focus: {}", focused);
        self.focused.store(focused, Ordering::Relaxed);
        Ok(())
    }
}

impl ModuleDefinition for Heartbeat {
    const NAME: &'static str = "heartbeat";

    fn dependencies() -> Vec<Dependency> {
        vec![Dependency::module::<FrameStats>()]
    }

    fn priority() -> i32 {
        10
    }

    fn create() -> Result<Self> {
        Ok(Heartbeat {
            updates: AtomicU64::new(0),
            focused: AtomicBool::new(true),
            main_thread_frames: Arc::new(AtomicU64::new(0)),
        })
    }
}

submit_module!(Heartbeat);
