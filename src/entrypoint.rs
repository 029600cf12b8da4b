use anyhow::Result;
use plexus_bus::{CancellationToken, ModuleHost, log_warn};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::{
    builtin::{
        Frame, builtin_catalog,
        clock::Uptime,
        stats::{StatsQuery, StatsSnapshot},
    },
    utils::conf::Conf,
};

pub fn welcome_message(conf: &Conf) {
    info!(
        "
   ┌─┐┬  ┌─┐─┐ ┬┬ ┬┌─┐
   ├─┘│  ├┤ ┌┴┬┘│ │└─┐
   ┴  ┴─┘└─┘┴ └─└─┘└─┘  {}

    ⏲️  tick interval: {:?}, physics every {} frame(s)
    🧩 modules: {}
    ",
        conf.id,
        conf.tick_interval,
        conf.physics_every,
        if conf.modules.enabled.is_empty() {
            "all enabled by default".to_string()
        } else {
            conf.modules.enabled.join(", ")
        },
    );
}

/// What a run of the frame loop produced.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub frames: u64,
    pub modules: Vec<&'static str>,
    /// Counters of the `frame_stats` module, when it ran
    pub stats: Option<StatsSnapshot>,
}

/// Runs the frame loop until `shutdown` is cancelled or `max_frames` is
/// reached, then quits and disposes every module, the bus and the
/// main-thread context in that order.
pub async fn main_loop(conf: Conf, shutdown: CancellationToken) -> Result<RunSummary> {
    let mut host = ModuleHost::new(conf.bus.clone(), builtin_catalog());

    let report = host.start(&conf.modules);
    if let Some(cycle) = &report.cycle {
        warn!("Modules registered despite a dependency cycle: {:?}", cycle);
    }
    for (key, reason) in &report.skipped {
        warn!("Module {} not started: {}", key, reason);
    }
    let modules = host.registry().registered();
    info!("🧩 Started modules: {}", modules.join(", "));

    let mut interval = tokio::time::interval(conf.tick_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut frames = 0u64;
    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                info!("Shutdown requested, stopping the frame loop");
                break;
            }
            _ = interval.tick() => {}
        }

        frames += 1;
        let frame = Frame {
            index: frames,
            physics: frames % conf.physics_every == 0,
        };
        match host.bus().broadcast(frame, &shutdown).await {
            Ok(report) if !report.is_success() => {
                debug!("Frame {} dispatch: {:?}", frames, report.outcome);
            }
            Ok(_) => {}
            Err(e) => {
                warn!("Frame loop stopped: {}", e);
                break;
            }
        }
        host.update();
        if frame.physics {
            host.physics_update();
        }
        host.late_update();

        if conf.max_frames > 0 && frames >= conf.max_frames {
            info!("Reached {} frames, stopping", frames);
            break;
        }
    }

    let token = CancellationToken::new();
    let stats = if host.bus().queries().has_handler::<StatsQuery, StatsSnapshot>() {
        log_warn!(
            host.bus().try_query::<StatsQuery, StatsSnapshot>(StatsQuery, &token).await,
            "Querying frame stats"
        )
        .ok()
    } else {
        None
    };
    let no_cache = host.bus().queries().options().clone().without_cache();
    if let Ok(uptime) = host
        .bus()
        .queries()
        .try_query_with::<Uptime, std::time::Duration>(Uptime, &no_cache, &token)
        .await
    {
        debug!("Clock uptime at shutdown: {:?}", uptime);
    }

    host.on_quit();
    host.dispose_async().await;

    Ok(RunSummary {
        frames,
        modules,
        stats,
    })
}

/// Runs the frame loop as a process: SIGINT and SIGTERM stop it gracefully.
pub async fn main_process(conf: Conf) -> Result<RunSummary> {
    let shutdown = CancellationToken::new();
    let signals = shutdown.clone();
    let watcher = tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix;
            let (Ok(mut interrupt), Ok(mut terminate)) = (
                unix::signal(unix::SignalKind::interrupt()),
                unix::signal(unix::SignalKind::terminate()),
            ) else {
                warn!("Could not install signal handlers");
                return;
            };
            tokio::select! {
                _ = interrupt.recv() => info!("SIGINT received, shutting down"),
                _ = terminate.recv() => info!("SIGTERM received, shutting down"),
                _ = signals.cancelled() => return,
            }
        }
        #[cfg(not(unix))]
        {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("Ctrl-C received, shutting down"),
                _ = signals.cancelled() => return,
            }
        }
        signals.cancel();
    });

    let summary = main_loop(conf, shutdown.clone()).await;
    shutdown.cancel();
    _ = watcher.await;
    summary
}
