use std::{
    cell::RefCell,
    sync::{
        Barrier, LazyLock, OnceLock,
        atomic::{AtomicUsize, Ordering},
    },
};

use super::*;
use crate::bus::OwnedBus;

thread_local! {
    static EVENTS: RefCell<Vec<String>> = const { RefCell::new(Vec::new()) };
}

fn record(event: impl Into<String>) {
    EVENTS.with(|events| events.borrow_mut().push(event.into()));
}

fn take_events() -> Vec<String> {
    EVENTS.with(|events| std::mem::take(&mut *events.borrow_mut()))
}

macro_rules! recording_module {
    ($name:ident, deps: [$($dep:expr),*], caps: $caps:expr) => {
        struct $name;

        impl Module for $name {
            fn capabilities(&self) -> Capabilities {
                $caps
            }
            fn on_create(&self, _ctx: &ModuleContext) -> Result<()> {
                record(concat!("create ", stringify!($name)));
                Ok(())
            }
            fn register(&self, _bus: &OwnedBus) -> Result<()> {
                record(concat!("register ", stringify!($name)));
                Ok(())
            }
            fn unregister(&self, _bus: &OwnedBus) -> Result<()> {
                record(concat!("unregister ", stringify!($name)));
                Ok(())
            }
            fn dispose(&self) -> Result<()> {
                record(concat!("dispose ", stringify!($name)));
                Ok(())
            }
            fn update(&self) -> Result<()> {
                record(concat!("update ", stringify!($name)));
                Ok(())
            }
        }

        impl ModuleDefinition for $name {
            const NAME: &'static str = stringify!($name);

            fn dependencies() -> Vec<Dependency> {
                vec![$($dep),*]
            }

            fn create() -> Result<Self> {
                Ok($name)
            }
        }
    };
}

recording_module!(Storage, deps: [], caps: Capabilities::UPDATE);
recording_module!(Indexer, deps: [Dependency::module::<Storage>()], caps: Capabilities::UPDATE);
recording_module!(CycleLeft, deps: [Dependency::module::<CycleRight>()], caps: Capabilities::NONE);
recording_module!(CycleRight, deps: [Dependency::module::<CycleLeft>()], caps: Capabilities::NONE);
recording_module!(Loner, deps: [], caps: Capabilities::NONE);
recording_module!(Orphan, deps: [Dependency::module::<Loner>()], caps: Capabilities::NONE);
recording_module!(OrphanUser, deps: [Dependency::module::<Orphan>()], caps: Capabilities::NONE);

fn registry() -> ModuleRegistry {
    ModuleRegistry::new(&SharedMessageBus::new())
}

#[test_log::test]
fn dependencies_register_first_and_unregister_last() {
    let registry = registry();
    take_events();
    let report = registry.register_batch(&[
        ModuleDescriptor::of::<Indexer>(),
        ModuleDescriptor::of::<Storage>(),
    ]);
    assert_eq!(
        report.registered,
        vec![TypeKey::of::<Storage>(), TypeKey::of::<Indexer>()]
    );
    assert!(report.cycle.is_none());
    assert_eq!(
        take_events(),
        vec![
            "create Storage",
            "register Storage",
            "create Indexer",
            "register Indexer"
        ]
    );
    assert_eq!(registry.state_of(TypeKey::of::<Indexer>()), ModuleState::Active);
    assert_eq!(registry.registered(), vec!["Storage", "Indexer"]);

    assert_eq!(registry.tick(), 0);
    assert_eq!(take_events(), vec!["update Storage", "update Indexer"]);

    assert_eq!(registry.dispose(), 2);
    assert_eq!(
        take_events(),
        vec![
            "unregister Indexer",
            "dispose Indexer",
            "unregister Storage",
            "dispose Storage"
        ]
    );
    assert_eq!(registry.state_of(TypeKey::of::<Storage>()), ModuleState::Disposed);
    assert!(registry.registration_order().is_empty());
}

#[test_log::test]
fn cycles_are_logged_and_registration_goes_on() {
    let registry = registry();
    let report = registry.register_batch(&[
        ModuleDescriptor::of::<CycleLeft>(),
        ModuleDescriptor::of::<CycleRight>(),
        ModuleDescriptor::of::<Loner>(),
    ]);
    let cycle = report.cycle.expect("cycle must be reported");
    assert!(cycle.contains(&TypeKey::of::<CycleLeft>()));
    assert!(cycle.contains(&TypeKey::of::<CycleRight>()));
    assert_eq!(report.registered.len(), 3);
    assert_eq!(report.registered[0], TypeKey::of::<Loner>());
    assert!(registry.is_registered(TypeKey::of::<CycleLeft>()));
    assert_eq!(registry.dispose(), 3);
}

#[test_log::test]
fn unresolved_dependencies_cascade() {
    let registry = registry();
    let report = registry.register_batch(&[
        ModuleDescriptor::of::<OrphanUser>(),
        ModuleDescriptor::of::<Orphan>(),
        ModuleDescriptor::of::<Storage>(),
    ]);
    assert_eq!(report.registered, vec![TypeKey::of::<Storage>()]);
    let skipped: Vec<TypeKey> = report.skipped.iter().map(|(key, _)| *key).collect();
    assert!(skipped.contains(&TypeKey::of::<Orphan>()));
    assert!(skipped.contains(&TypeKey::of::<OrphanUser>()));

    // Satisfied by an already registered module
    registry.register::<Loner>();
    let report = registry.register_batch(&[
        ModuleDescriptor::of::<OrphanUser>(),
        ModuleDescriptor::of::<Orphan>(),
    ]);
    assert_eq!(report.registered.len(), 2);
    assert_eq!(report.registered[0], TypeKey::of::<Orphan>());
}

#[test]
fn duplicates_are_skipped() {
    let registry = registry();
    let report = registry.register_batch(&[
        ModuleDescriptor::of::<Loner>(),
        ModuleDescriptor::of::<Loner>(),
    ]);
    assert_eq!(report.registered.len(), 1);
    assert_eq!(report.skipped.len(), 1);
    let report = registry.register::<Loner>();
    assert!(report.registered.is_empty());
    assert_eq!(report.skipped[0].1, "already registered");
}

#[test]
fn double_removal_is_a_no_op() {
    let registry = registry();
    registry.register::<Loner>();
    take_events();
    assert!(registry.unregister::<Loner>());
    assert!(!registry.unregister::<Loner>());
    assert_eq!(registry.dispose(), 0);
    assert_eq!(take_events(), vec!["unregister Loner", "dispose Loner"]);
}

struct Faulty;

impl Module for Faulty {
    fn capabilities(&self) -> Capabilities {
        Capabilities::UPDATE | Capabilities::QUIT
    }
    fn update(&self) -> Result<()> {
        Err(anyhow!("update failed"))
    }
    fn on_quit(&self) -> Result<()> {
        panic!("quit exploded")
    }
}

impl ModuleDefinition for Faulty {
    const NAME: &'static str = "Faulty";
    fn priority() -> i32 {
        -1
    }
    fn create() -> Result<Self> {
        Ok(Faulty)
    }
}

struct Unbuildable;

impl Module for Unbuildable {}

impl ModuleDefinition for Unbuildable {
    const NAME: &'static str = "Unbuildable";
    fn create() -> Result<Self> {
        Err(anyhow!("missing configuration"))
    }
}

#[test_log::test]
fn failing_callbacks_are_isolated() {
    let registry = registry();
    let report = registry.register_batch(&[
        ModuleDescriptor::of::<Unbuildable>(),
        ModuleDescriptor::of::<Faulty>(),
        ModuleDescriptor::of::<Storage>(),
    ]);
    assert_eq!(
        report.registered,
        vec![TypeKey::of::<Faulty>(), TypeKey::of::<Storage>()]
    );
    assert_eq!(report.skipped[0].0, TypeKey::of::<Unbuildable>());
    assert!(report.skipped[0].1.contains("missing configuration"));
    take_events();

    assert_eq!(registry.tick(), 1);
    assert_eq!(take_events(), vec!["update Storage"]);
    assert_eq!(registry.quit(), 1);
    assert_eq!(registry.members(Capabilities::QUIT), vec![TypeKey::of::<Faulty>()]);
    assert_eq!(registry.pause(true), 0);
}

trait Clock: Send + Sync {}

struct SystemClock;

impl Module for SystemClock {
    fn on_create(&self, _ctx: &ModuleContext) -> Result<()> {
        record("create SystemClock");
        Ok(())
    }
}

impl ModuleDefinition for SystemClock {
    const NAME: &'static str = "SystemClock";
    fn interfaces() -> Vec<TypeKey> {
        vec![TypeKey::of::<dyn Clock>()]
    }
    fn priority() -> i32 {
        10
    }
    fn create() -> Result<Self> {
        Ok(SystemClock)
    }
}

#[derive(Clone, Debug, Hash)]
struct Tick(u64);

static TICKS_SEEN: AtomicUsize = AtomicUsize::new(0);

struct Scheduler {
    token: OnceLock<CancellationToken>,
}

impl Module for Scheduler {
    fn capabilities(&self) -> Capabilities {
        Capabilities::CANCELLATION
    }
    fn on_create(&self, ctx: &ModuleContext) -> Result<()> {
        record("create Scheduler");
        _ = self.token.set(ctx.cancellation_token());
        Ok(())
    }
    fn register(&self, bus: &OwnedBus) -> Result<()> {
        bus.on_broadcast(0, |tick: Tick, _| async move {
            TICKS_SEEN.fetch_add(tick.0 as usize, Ordering::SeqCst);
            Ok(())
        })?;
        bus.on_query(|_: Tick, _| async { Ok(7u64) })?;
        Ok(())
    }
}

impl ModuleDefinition for Scheduler {
    const NAME: &'static str = "Scheduler";
    fn dependencies() -> Vec<Dependency> {
        vec![Dependency::interface::<dyn Clock>()]
    }
    fn create() -> Result<Self> {
        Ok(Scheduler {
            token: OnceLock::new(),
        })
    }
}

#[tokio::test]
async fn interface_dependencies_and_owned_handlers() {
    let bus = SharedMessageBus::new();
    let registry = ModuleRegistry::new(&bus);
    take_events();
    let report = registry.register_batch(&[
        ModuleDescriptor::of::<Scheduler>(),
        ModuleDescriptor::of::<SystemClock>(),
    ]);
    assert_eq!(report.registered.len(), 2);
    assert_eq!(take_events(), vec!["create SystemClock", "create Scheduler"]);

    let token = CancellationToken::new();
    bus.broadcast(Tick(3), &token).await.unwrap();
    assert_eq!(TICKS_SEEN.load(Ordering::SeqCst), 3);
    assert_eq!(bus.query::<Tick, u64>(Tick(0), &token).await.unwrap(), 7);

    let module_token = {
        let state = registry.state.lock();
        state.entries[&TypeKey::of::<Scheduler>()]
            .context
            .cancellation_token()
    };
    assert!(!module_token.is_cancelled());
    assert!(registry.unregister::<Scheduler>());
    assert!(module_token.is_cancelled());
    assert_eq!(bus.broadcasts().handler_count::<Tick>(), 0);
    assert!(!bus.queries().has_handler::<Tick, u64>());
    assert_eq!(bus.pool().free_count(), 2);
    bus.broadcast(Tick(3), &token).await.unwrap();
    assert_eq!(TICKS_SEEN.load(Ordering::SeqCst), 3);
}

struct Rejecting;

impl Module for Rejecting {
    fn capabilities(&self) -> Capabilities {
        Capabilities::UPDATE
    }
    fn register(&self, bus: &OwnedBus) -> Result<()> {
        bus.on_command(|_: Tick, _| async { Ok(()) })?;
        anyhow::bail!("refusing to register")
    }
    fn dispose(&self) -> Result<()> {
        record("dispose Rejecting");
        Ok(())
    }
}

impl ModuleDefinition for Rejecting {
    const NAME: &'static str = "Rejecting";
    fn create() -> Result<Self> {
        Ok(Rejecting)
    }
}

#[test_log::test]
fn failed_registration_hook_rolls_back() {
    let bus = SharedMessageBus::new();
    let registry = ModuleRegistry::new(&bus);
    take_events();
    let report = registry.register::<Rejecting>();
    assert!(report.registered.is_empty());
    assert!(report.skipped[0].1.contains("refusing to register"));
    assert!(!bus.commands().has_handler::<Tick>());
    assert!(registry.members(Capabilities::UPDATE).is_empty());
    assert_eq!(registry.state_of(TypeKey::of::<Rejecting>()), ModuleState::Disposed);
    assert_eq!(take_events(), vec!["dispose Rejecting"]);
}

#[test]
fn catalog_selection() {
    let mut catalog = ModuleCatalog::new();
    catalog.add::<Storage>().add::<Indexer>().add::<Loner>().add::<Storage>();
    assert_eq!(catalog.descriptors().len(), 3);

    let by_list = catalog.select(&ModulesConf {
        enabled: vec!["Loner".into(), "Unknown".into(), "Storage".into()],
        ..Default::default()
    });
    let names: Vec<_> = by_list.iter().map(|d| d.name).collect();
    assert_eq!(names, vec!["Loner", "Storage"]);

    let by_filter = catalog.select(&ModulesConf {
        name_filter: Some("er".into()),
        disabled: vec!["Loner".into()],
        ..Default::default()
    });
    let names: Vec<_> = by_filter.iter().map(|d| d.name).collect();
    assert_eq!(names, vec!["Indexer"]);

    assert_eq!(catalog.select(&ModulesConf::default()).len(), 3);
}

#[test]
fn capability_flags() {
    let caps = Capabilities::UPDATE | Capabilities::FOCUS;
    assert!(caps.contains(Capabilities::FOCUS));
    assert!(!caps.contains(Capabilities::PAUSE));
    assert_eq!(caps.flags().count(), 2);
    assert_eq!(format!("{caps:?}"), "Capabilities(update | focus)");
    assert!(Capabilities::NONE.is_empty());
}

#[tokio::test]
async fn host_lifecycle() {
    let catalog = ModuleCatalog::new().with::<Storage>().with::<Indexer>();
    let mut host = ModuleHost::new(BusConfig::default(), catalog);
    take_events();
    let report = host.start(&ModulesConf::default());
    assert_eq!(report.registered.len(), 2);
    host.update();
    host.late_update();
    host.on_pause(true);
    host.on_focus(false);
    host.on_quit();
    host.dispose_async().await;
    let events = take_events();
    assert_eq!(events.last().map(String::as_str), Some("dispose Storage"));
    assert!(host.bus().is_disposed());
    assert!(host.registry().registration_order().is_empty());
}

static SLOW_CREATED: AtomicUsize = AtomicUsize::new(0);
static SLOW_DISPOSED: AtomicUsize = AtomicUsize::new(0);

struct SlowStart;

impl Module for SlowStart {
    fn dispose(&self) -> Result<()> {
        SLOW_DISPOSED.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl ModuleDefinition for SlowStart {
    const NAME: &'static str = "SlowStart";
    fn create() -> Result<Self> {
        SLOW_CREATED.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(std::time::Duration::from_millis(50));
        Ok(SlowStart)
    }
}

#[test_log::test]
fn racing_batches_install_a_module_once() {
    let registry = registry();
    let reports: Vec<RegistrationReport> = std::thread::scope(|s| {
        let racers: Vec<_> = (0..2)
            .map(|_| s.spawn(|| registry.register::<SlowStart>()))
            .collect();
        racers.into_iter().map(|r| r.join().unwrap()).collect()
    });

    assert_eq!(reports.iter().map(|r| r.registered.len()).sum::<usize>(), 1);
    assert_eq!(reports.iter().map(|r| r.skipped.len()).sum::<usize>(), 1);
    assert_eq!(SLOW_CREATED.load(Ordering::SeqCst), 1);
    assert_eq!(registry.registration_order(), vec![TypeKey::of::<SlowStart>()]);

    assert_eq!(registry.dispose(), 1);
    assert_eq!(SLOW_DISPOSED.load(Ordering::SeqCst), 1);
}

static GATE: LazyLock<Barrier> = LazyLock::new(|| Barrier::new(2));
static GATE_UPDATES: AtomicUsize = AtomicUsize::new(0);

/// Parks its first update between two barrier waits.
struct Gate;

impl Module for Gate {
    fn capabilities(&self) -> Capabilities {
        Capabilities::UPDATE
    }
    fn update(&self) -> Result<()> {
        if GATE_UPDATES.fetch_add(1, Ordering::SeqCst) == 0 {
            GATE.wait();
            GATE.wait();
        }
        Ok(())
    }
}

impl ModuleDefinition for Gate {
    const NAME: &'static str = "Gate";
    fn create() -> Result<Self> {
        Ok(Gate)
    }
}

#[test_log::test]
fn registry_changes_while_a_callback_runs() {
    let registry = registry();
    assert_eq!(registry.register::<Gate>().registered.len(), 1);

    let (registered, removed) = std::thread::scope(|s| {
        let other = s.spawn(|| {
            GATE.wait();
            let registered = registry.register::<Storage>().registered.len();
            let removed = registry.unregister::<Gate>();
            GATE.wait();
            (registered, removed)
        });
        assert_eq!(registry.tick(), 0);
        other.join().unwrap()
    });
    assert_eq!(registered, 1);
    assert!(removed);
    assert!(registry.is_registered(TypeKey::of::<Storage>()));
    assert_eq!(registry.state_of(TypeKey::of::<Gate>()), ModuleState::Disposed);

    // The next pass sees the new category list
    take_events();
    assert_eq!(registry.tick(), 0);
    assert_eq!(take_events(), vec!["update Storage"]);
    assert_eq!(GATE_UPDATES.load(Ordering::SeqCst), 1);
}
