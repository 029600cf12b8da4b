use std::{sync::Arc, time::Duration};

use anyhow::Result;
use parking_lot::Mutex;
use plexus_bus::{Capabilities, Module, ModuleDefinition, OwnedBus, TypeKey, submit_module};
use tokio::time::Instant;
use tracing::info;

/// Time source other modules depend on as `dyn Clock`.
pub trait Clock: Send + Sync {
    /// Running time, pauses excluded
    fn uptime(&self) -> Duration;
}

/// Query answered with the host [`Clock::uptime`].
///
/// The answer changes on every call: query it with caching disabled.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Uptime;

#[derive(Debug)]
struct ClockState {
    started: Instant,
    paused_at: Option<Instant>,
    paused_for: Duration,
}

impl ClockState {
    fn uptime(&self) -> Duration {
        let now = self.paused_at.unwrap_or_else(Instant::now);
        now.duration_since(self.started)
            .saturating_sub(self.paused_for)
    }
}

pub struct SystemClock {
    state: Arc<Mutex<ClockState>>,
}

impl Clock for SystemClock {
    fn uptime(&self) -> Duration {
        self.state.lock().uptime()
    }
}

impl Module for SystemClock {
    fn capabilities(&self) -> Capabilities {
        Capabilities::PAUSE | Capabilities::QUIT
    }

    fn register(&self, bus: &OwnedBus) -> Result<()> {
        let state = self.state.clone();
        bus.on_query(move |_: Uptime, _| {
            let uptime = state.lock().uptime();
            async move { Ok(uptime) }
        })?;
        Ok(())
    }

    fn on_pause(&self, paused: bool) -> Result<()> {
        let mut state = self.state.lock();
        match (paused, state.paused_at) {
            (true, None) => state.paused_at = Some(Instant::now()),
            (false, Some(since)) => {
                state.paused_for += since.elapsed();
                state.paused_at = None;
            }
            _ => {}
        }
        Ok(())
    }

    fn on_quit(&self) -> Result<()> {
        info!("⏱️  Host ran for {:?}", self.uptime());
        Ok(())
    }
}

impl ModuleDefinition for SystemClock {
    const NAME: &'static str = "system_clock";

    fn interfaces() -> Vec<TypeKey> {
        vec![TypeKey::of::<dyn Clock>()]
    }

    fn priority() -> i32 {
        -10
    }

    fn create() -> Result<Self> {
        Ok(SystemClock {
            state: Arc::new(Mutex::new(ClockState {
                started: Instant::now(),
                paused_at: None,
                paused_for: Duration::ZERO,
            })),
        })
    }
}

submit_module!(SystemClock);
