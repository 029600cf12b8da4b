use std::sync::{
    Arc, OnceLock,
    atomic::{AtomicU64, Ordering},
};

use anyhow::Result;
use plexus_bus::{
    Capabilities, Dependency, Module, ModuleContext, ModuleDefinition, OwnedBus, SharedMessageBus,
    submit_module,
};
use tracing::{debug, info};

use super::{Frame, clock::Clock};

/// Asks [`FrameStats`] for its counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct StatsQuery;

/// Zeroes the counters of [`FrameStats`].
#[derive(Clone, Copy, Debug, Default)]
pub struct ResetStats;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub frames: u64,
    pub physics_frames: u64,
    pub late_updates: u64,
    pub last_frame: u64,
}

#[derive(Default)]
struct Counters {
    frames: AtomicU64,
    physics_frames: AtomicU64,
    late_updates: AtomicU64,
    last_frame: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            frames: self.frames.load(Ordering::Relaxed),
            physics_frames: self.physics_frames.load(Ordering::Relaxed),
            late_updates: self.late_updates.load(Ordering::Relaxed),
            last_frame: self.last_frame.load(Ordering::Relaxed),
        }
    }

    fn reset(&self) {
        self.frames.store(0, Ordering::Relaxed);
        self.physics_frames.store(0, Ordering::Relaxed);
        self.late_updates.store(0, Ordering::Relaxed);
    }
}

/// Counts frames seen on the bus and serves them through [`StatsQuery`].
///
/// Cached answers are invalidated whenever the counters move.
pub struct FrameStats {
    counters: Arc<Counters>,
    bus: OnceLock<SharedMessageBus>,
}

fn invalidate(bus: &SharedMessageBus) {
    bus.queries()
        .invalidate::<StatsQuery, StatsSnapshot>(&StatsQuery);
}

impl Module for FrameStats {
    fn capabilities(&self) -> Capabilities {
        Capabilities::LATE_UPDATE | Capabilities::QUIT
    }

    fn on_create(&self, ctx: &ModuleContext) -> Result<()> {
        _ = self.bus.set(ctx.bus());
        Ok(())
    }

    fn register(&self, bus: &OwnedBus) -> Result<()> {
        let counters = self.counters.clone();
        let handle = bus.new_handle();
        bus.on_broadcast(0, move |frame: Frame, _| {
            counters.frames.fetch_add(1, Ordering::Relaxed);
            if frame.physics {
                counters.physics_frames.fetch_add(1, Ordering::Relaxed);
            }
            counters.last_frame.store(frame.index, Ordering::Relaxed);
            invalidate(&handle);
            async { Ok(()) }
        })?;

        let counters = self.counters.clone();
        let handle = bus.new_handle();
        bus.on_command(move |_: ResetStats, _| {
            counters.reset();
            invalidate(&handle);
            debug!("Frame counters reset");
            async { Ok(()) }
        })?;

        let counters = self.counters.clone();
        bus.on_query(move |_: StatsQuery, _| {
            let snapshot = counters.snapshot();
            async move { Ok(snapshot) }
        })?;
        Ok(())
    }

    fn late_update(&self) -> Result<()> {
        self.counters.late_updates.fetch_add(1, Ordering::Relaxed);
        if let Some(bus) = self.bus.get() {
            invalidate(bus);
        }
        Ok(())
    }

    fn on_quit(&self) -> Result<()> {
        let snapshot = self.counters.snapshot();
        info!(
            frames = snapshot.frames,
            physics_frames = snapshot.physics_frames,
            "📊 {} frames seen, last one #{}",
            snapshot.frames,
            snapshot.last_frame
        );
        Ok(())
    }
}

impl ModuleDefinition for FrameStats {
    const NAME: &'static str = "frame_stats";

    fn dependencies() -> Vec<Dependency> {
        vec![Dependency::interface::<dyn Clock>()]
    }

    fn create() -> Result<Self> {
        Ok(FrameStats {
            counters: Arc::new(Counters::default()),
            bus: OnceLock::new(),
        })
    }
}

submit_module!(FrameStats);
