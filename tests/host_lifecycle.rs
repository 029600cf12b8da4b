use std::time::Duration;

use plexus::{
    builtin::{builtin_catalog, clock::Uptime, stats::StatsSnapshot},
    entrypoint::main_loop,
    utils::conf::Conf,
};
use plexus_bus::{CancellationToken, ModuleHost, ModuleState, ModulesConf, TypeKey};

fn test_conf(max_frames: u64) -> Conf {
    let mut conf = Conf::new(vec![], None, Some(max_frames)).unwrap();
    conf.tick_interval = Duration::from_millis(1);
    conf.physics_every = 2;
    conf
}

#[test_log::test(tokio::test)]
async fn runs_a_bounded_number_of_frames() {
    let summary = main_loop(test_conf(6), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.frames, 6);
    assert_eq!(
        summary.modules,
        vec!["system_clock", "frame_stats", "heartbeat"]
    );
    assert_eq!(
        summary.stats,
        Some(StatsSnapshot {
            frames: 6,
            physics_frames: 3,
            late_updates: 6,
            last_frame: 6,
        })
    );
}

#[test_log::test(tokio::test)]
async fn cancellation_stops_the_loop() {
    let shutdown = CancellationToken::new();
    shutdown.cancel();
    let summary = main_loop(test_conf(0), shutdown).await.unwrap();
    assert_eq!(summary.frames, 0);
    assert_eq!(summary.stats.map(|s| s.frames), Some(0));
}

#[test_log::test(tokio::test)]
async fn disabled_dependency_cascades() {
    let mut conf = test_conf(2);
    conf.modules.disabled = vec!["system_clock".to_string()];
    let summary = main_loop(conf, CancellationToken::new()).await.unwrap();
    assert!(summary.modules.is_empty());
    assert_eq!(summary.stats, None);
}

#[test_log::test(tokio::test)]
async fn host_exposes_builtin_handlers() {
    let mut host = ModuleHost::new(Default::default(), builtin_catalog());
    let report = host.start(&ModulesConf {
        enabled: vec!["frame_stats".to_string(), "system_clock".to_string()],
        ..Default::default()
    });
    assert_eq!(report.registered.len(), 2);

    let registry = host.registry();
    assert_eq!(registry.registered(), vec!["system_clock", "frame_stats"]);
    assert_eq!(
        registry.state_of(TypeKey::of::<plexus::builtin::stats::FrameStats>()),
        ModuleState::Active
    );

    let token = CancellationToken::new();
    let uptime: Duration = host.bus().try_query(Uptime, &token).await.unwrap();
    assert!(uptime < Duration::from_secs(60));

    host.on_pause(true);
    host.on_quit();
    host.dispose_async().await;
    assert!(host.bus().is_disposed());
    assert!(registry_is_empty(&host));
}

fn registry_is_empty(host: &ModuleHost) -> bool {
    host.registry().registered().is_empty()
}
