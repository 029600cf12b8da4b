//! Module system: dependency-ordered lifecycle of the units that install
//! handlers on the bus and take part in the host's frame callbacks.

use std::{
    collections::{HashMap, HashSet},
    fmt,
    ops::BitOr,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::Arc,
};

use anyhow::{Result, anyhow};
use parking_lot::{Mutex, ReentrantMutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    bus::{BusConfig, SharedMessageBus, TypeKey, main_thread::MainThreadContext},
    utils::logger::panic_message,
};

mod catalog;
pub mod graph;

pub use catalog::{ModuleCatalog, ModuleDescriptor, ModuleReg, ModulesConf};
use graph::{DependencyGraph, GraphNode};

/// Lifecycle callback categories a module takes part in.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Capabilities(u8);

impl Capabilities {
    pub const NONE: Capabilities = Capabilities(0);
    pub const UPDATE: Capabilities = Capabilities(1);
    pub const LATE_UPDATE: Capabilities = Capabilities(1 << 1);
    pub const PHYSICS_UPDATE: Capabilities = Capabilities(1 << 2);
    pub const PAUSE: Capabilities = Capabilities(1 << 3);
    pub const FOCUS: Capabilities = Capabilities(1 << 4);
    pub const QUIT: Capabilities = Capabilities(1 << 5);
    /// Holds a cancellation source that must be cancelled on unregistration
    pub const CANCELLATION: Capabilities = Capabilities(1 << 6);

    const FLAGS: [(Capabilities, &'static str); 7] = [
        (Self::UPDATE, "update"),
        (Self::LATE_UPDATE, "late_update"),
        (Self::PHYSICS_UPDATE, "physics_update"),
        (Self::PAUSE, "pause"),
        (Self::FOCUS, "focus"),
        (Self::QUIT, "quit"),
        (Self::CANCELLATION, "cancellation"),
    ];

    pub const fn union(self, other: Capabilities) -> Capabilities {
        Capabilities(self.0 | other.0)
    }

    pub const fn contains(self, other: Capabilities) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// The single-flag categories set in `self`.
    pub fn flags(self) -> impl Iterator<Item = Capabilities> {
        Self::FLAGS
            .into_iter()
            .map(|(flag, _)| flag)
            .filter(move |flag| self.contains(*flag))
    }
}

impl BitOr for Capabilities {
    type Output = Capabilities;

    fn bitor(self, rhs: Capabilities) -> Capabilities {
        self.union(rhs)
    }
}

impl fmt::Debug for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = Self::FLAGS
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        write!(f, "Capabilities({})", names.join(" | "))
    }
}

/// A declared dependency. Interface dependencies are satisfied by every module
/// of the batch that lists the interface, use `TypeKey::of::<dyn Trait>()`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Dependency {
    Module(TypeKey),
    Interface(TypeKey),
}

impl Dependency {
    pub fn module<M: 'static>() -> Self {
        Dependency::Module(TypeKey::of::<M>())
    }

    pub fn interface<I: ?Sized + 'static>() -> Self {
        Dependency::Interface(TypeKey::of::<I>())
    }

    pub fn key(&self) -> TypeKey {
        match self {
            Dependency::Module(key) | Dependency::Interface(key) => *key,
        }
    }
}

/// Handed to a module right after construction.
pub struct ModuleContext {
    key: TypeKey,
    name: &'static str,
    bus: SharedMessageBus,
    token: CancellationToken,
}

impl ModuleContext {
    pub fn key(&self) -> TypeKey {
        self.key
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Handle on the bus the module is registered with.
    pub fn bus(&self) -> SharedMessageBus {
        self.bus.new_handle()
    }

    /// Cancelled when the module is unregistered.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }
}

/// Behaviour of a registered module. Every hook has a no-op default.
///
/// Hooks take `&self`: modules are shared between the registry and the
/// category snapshots taken for each callback pass.
pub trait Module: Send + Sync + 'static {
    fn capabilities(&self) -> Capabilities {
        Capabilities::NONE
    }

    fn on_create(&self, _ctx: &ModuleContext) -> Result<()> {
        Ok(())
    }

    /// Installs the module's handlers. Everything subscribed through `bus` is
    /// removed automatically when the module unregisters.
    fn register(&self, _bus: &crate::bus::OwnedBus) -> Result<()> {
        Ok(())
    }

    fn unregister(&self, _bus: &crate::bus::OwnedBus) -> Result<()> {
        Ok(())
    }

    fn dispose(&self) -> Result<()> {
        Ok(())
    }

    fn update(&self) -> Result<()> {
        Ok(())
    }

    fn late_update(&self) -> Result<()> {
        Ok(())
    }

    fn physics_update(&self) -> Result<()> {
        Ok(())
    }

    fn on_pause(&self, _paused: bool) -> Result<()> {
        Ok(())
    }

    fn on_focus(&self, _focused: bool) -> Result<()> {
        Ok(())
    }

    fn on_quit(&self) -> Result<()> {
        Ok(())
    }
}

/// Static description of a module type.
pub trait ModuleDefinition: Module + Sized {
    const NAME: &'static str;

    fn dependencies() -> Vec<Dependency> {
        Vec::new()
    }

    /// Interfaces this module provides to interface dependencies.
    fn interfaces() -> Vec<TypeKey> {
        Vec::new()
    }

    /// Orders modules the graph leaves unconstrained. Lower first.
    fn priority() -> i32 {
        0
    }

    fn enabled_by_default() -> bool {
        true
    }

    fn create() -> Result<Self>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModuleState {
    Unregistered,
    Created,
    Registered,
    Active,
    Unregistering,
    Disposed,
}

#[derive(Clone, Debug, Default)]
pub struct RegistrationReport {
    /// In registration order
    pub registered: Vec<TypeKey>,
    pub skipped: Vec<(TypeKey, String)>,
    /// Set when the batch could not be fully ordered
    pub cycle: Option<Vec<TypeKey>>,
}

impl RegistrationReport {
    fn skip(&mut self, descriptor: &ModuleDescriptor, reason: String) {
        warn!(module = descriptor.name, "Skipping module {}: {}", descriptor.name, reason);
        self.skipped.push((descriptor.key, reason));
    }
}

struct ModuleEntry {
    descriptor: ModuleDescriptor,
    module: Arc<dyn Module>,
    context: ModuleContext,
    capabilities: Capabilities,
}

type CategoryList = Vec<(TypeKey, Arc<dyn Module>)>;

#[derive(Default)]
struct RegistryState {
    entries: HashMap<TypeKey, Arc<ModuleEntry>>,
    order: Vec<TypeKey>,
    categories: HashMap<Capabilities, CategoryList>,
    states: HashMap<TypeKey, ModuleState>,
}

impl RegistryState {
    fn set_state(&mut self, key: TypeKey, state: ModuleState) {
        self.states.insert(key, state);
    }
}

/// Runs a module hook, turning panics into errors.
fn guarded<T>(call: impl FnOnce() -> Result<T>) -> Result<T> {
    match catch_unwind(AssertUnwindSafe(call)) {
        Ok(res) => res,
        Err(panic) => Err(anyhow!("panicked: {}", panic_message(panic.as_ref()))),
    }
}

/// Owns the registered modules. The registry-wide lock is never held while
/// module code runs.
///
/// Registration and unregistration batches are serialized, so a module type
/// is constructed and installed at most once even when batches race. The lock
/// is reentrant: a hook may start a nested batch on the same thread.
/// Capability callbacks do not take it.
pub struct ModuleRegistry {
    bus: SharedMessageBus,
    batches: ReentrantMutex<()>,
    state: Mutex<RegistryState>,
}

impl ModuleRegistry {
    pub fn new(bus: &SharedMessageBus) -> Self {
        ModuleRegistry {
            bus: bus.new_handle(),
            batches: ReentrantMutex::new(()),
            state: Mutex::new(RegistryState::default()),
        }
    }

    pub fn bus(&self) -> &SharedMessageBus {
        &self.bus
    }

    pub fn register<M: ModuleDefinition>(&self) -> RegistrationReport {
        self.register_batch(&[ModuleDescriptor::of::<M>()])
    }

    /// Registers `batch` in dependency order. Configuration problems skip the
    /// offending module and never abort the batch.
    pub fn register_batch(&self, batch: &[ModuleDescriptor]) -> RegistrationReport {
        let _batch = self.batches.lock();
        let mut report = RegistrationReport::default();

        let mut candidates: Vec<ModuleDescriptor> = Vec::with_capacity(batch.len());
        let (registered_keys, registered_providers) = {
            let state = self.state.lock();
            let descriptors: Vec<ModuleDescriptor> =
                state.entries.values().map(|e| e.descriptor).collect();
            (state.entries.keys().copied().collect::<HashSet<_>>(), descriptors)
        };
        for descriptor in batch {
            if registered_keys.contains(&descriptor.key) {
                report.skip(descriptor, "already registered".to_string());
            } else if candidates.iter().any(|c| c.key == descriptor.key) {
                report.skip(descriptor, "listed twice in the batch".to_string());
            } else {
                candidates.push(*descriptor);
            }
        }

        // Dropping a module can leave its dependents unresolved, iterate until stable
        loop {
            let unresolved = candidates.iter().enumerate().find_map(|(i, descriptor)| {
                descriptor
                    .dependencies()
                    .into_iter()
                    .find(|dependency| {
                        !candidates
                            .iter()
                            .chain(registered_providers.iter())
                            .any(|provider| provider.key != descriptor.key && provider.provides(dependency))
                    })
                    .map(|dependency| (i, dependency))
            });
            let Some((index, dependency)) = unresolved else {
                break;
            };
            let descriptor = candidates.remove(index);
            report.skip(
                &descriptor,
                format!("unresolved dependency on {}", dependency.key()),
            );
        }

        let nodes: Vec<GraphNode> = candidates
            .iter()
            .map(|d| GraphNode {
                key: d.key,
                interfaces: d.interfaces(),
                dependencies: d.dependencies(),
                priority: d.priority(),
            })
            .collect();
        let order = match DependencyGraph::build(&nodes).sort() {
            Ok(order) => order,
            Err(e) => {
                error!("{}, registering the remaining modules by priority", e);
                let order = e.fallback_order();
                let graph::GraphError::Cycle { path, .. } = e;
                report.cycle = Some(path);
                order
            }
        };

        for key in order {
            let Some(descriptor) = candidates.iter().find(|d| d.key == key).copied() else {
                continue;
            };
            match self.register_one(&descriptor) {
                Ok(()) => report.registered.push(key),
                Err(e) => report.skip(&descriptor, format!("{e:#}")),
            }
        }

        info!(
            registered = report.registered.len(),
            skipped = report.skipped.len(),
            "Registered module batch"
        );
        report
    }

    fn register_one(&self, descriptor: &ModuleDescriptor) -> Result<()> {
        let key = descriptor.key;
        let module = guarded(|| descriptor.create())
            .map_err(|e| e.context(format!("constructing {}", descriptor.name)))?;

        let context = ModuleContext {
            key,
            name: descriptor.name,
            bus: self.bus.new_handle(),
            token: CancellationToken::new(),
        };
        self.state.lock().set_state(key, ModuleState::Created);
        if let Err(e) = guarded(|| module.on_create(&context)) {
            self.state.lock().set_state(key, ModuleState::Unregistered);
            return Err(e.context(format!("creating {}", descriptor.name)));
        }

        let capabilities = guarded(|| Ok(module.capabilities())).unwrap_or_default();
        let entry = Arc::new(ModuleEntry {
            descriptor: *descriptor,
            module: Arc::clone(&module),
            context,
            capabilities,
        });
        {
            let mut state = self.state.lock();
            state.entries.insert(key, Arc::clone(&entry));
            state.order.push(key);
            for flag in capabilities.flags() {
                state
                    .categories
                    .entry(flag)
                    .or_default()
                    .push((key, Arc::clone(&module)));
            }
        }

        let owned = self.bus.owned(key);
        if let Err(e) = guarded(|| module.register(&owned)) {
            error!(module = descriptor.name, "Registration hook of {} failed: {:#}", descriptor.name, e);
            self.teardown(key);
            return Err(e.context(format!("registering {}", descriptor.name)));
        }
        {
            let mut state = self.state.lock();
            state.set_state(key, ModuleState::Registered);
            // A registration hook may have unregistered the module already
            if state.entries.contains_key(&key) {
                state.set_state(key, ModuleState::Active);
            }
        }
        debug!(module = descriptor.name, capabilities = ?capabilities, "Module active");
        Ok(())
    }

    /// Unregisters the registered modules among `keys`, dependents first.
    /// Keys that are not registered are ignored.
    pub fn unregister_batch(&self, keys: &[TypeKey]) -> usize {
        let _batch = self.batches.lock();
        let descriptors: Vec<ModuleDescriptor> = {
            let state = self.state.lock();
            keys.iter()
                .filter_map(|key| match state.entries.get(key) {
                    Some(entry) => Some(entry.descriptor),
                    None => {
                        debug!("Module {} is not registered, nothing to remove", key);
                        None
                    }
                })
                .collect()
        };
        let nodes: Vec<GraphNode> = descriptors
            .iter()
            .map(|d| GraphNode {
                key: d.key,
                interfaces: d.interfaces(),
                dependencies: d.dependencies(),
                priority: d.priority(),
            })
            .collect();
        let mut order = match DependencyGraph::build(&nodes).sort() {
            Ok(order) => order,
            Err(e) => {
                warn!("{}, unregistering in reverse priority order", e);
                e.fallback_order()
            }
        };
        order.reverse();
        order.into_iter().filter(|key| self.teardown(*key)).count()
    }

    pub fn unregister<M: 'static>(&self) -> bool {
        self.unregister_batch(&[TypeKey::of::<M>()]) == 1
    }

    /// Removes one module: unregistration hook, owned handlers, categories,
    /// cancellation, then the dispose hook. Returns false if it was not registered.
    fn teardown(&self, key: TypeKey) -> bool {
        let entry = {
            let mut state = self.state.lock();
            let Some(entry) = state.entries.remove(&key) else {
                return false;
            };
            state.order.retain(|k| *k != key);
            for list in state.categories.values_mut() {
                list.retain(|(k, _)| *k != key);
            }
            state.set_state(key, ModuleState::Unregistering);
            entry
        };
        let name = entry.descriptor.name;

        let owned = self.bus.owned(key);
        if let Err(e) = guarded(|| entry.module.unregister(&owned)) {
            error!(module = name, "Unregistration hook of {} failed: {:#}", name, e);
        }
        let removed = owned.unsubscribe_all();
        entry.context.token.cancel();
        if let Err(e) = guarded(|| entry.module.dispose()) {
            error!(module = name, "Dispose hook of {} failed: {:#}", name, e);
        }
        self.state.lock().set_state(key, ModuleState::Disposed);
        debug!(module = name, handlers = removed, "Module disposed");
        true
    }

    /// Unregisters every module, dependents first. Calling it again is a no-op.
    pub fn dispose(&self) -> usize {
        let keys = self.registration_order();
        let removed = self.unregister_batch(&keys);
        if removed > 0 {
            info!(removed, "Module registry disposed");
        }
        removed
    }

    fn dispatch(
        &self,
        capability: Capabilities,
        hook: &'static str,
        call: impl Fn(&dyn Module) -> Result<()>,
    ) -> usize {
        let snapshot: CategoryList = self
            .state
            .lock()
            .categories
            .get(&capability)
            .cloned()
            .unwrap_or_default();
        let mut failures = 0;
        for (key, module) in snapshot {
            if let Err(e) = guarded(|| call(module.as_ref())) {
                failures += 1;
                error!(module = %key, hook, "{} of {} failed: {:#}", hook, key, e);
            }
        }
        failures
    }

    /// Each `tick`-like call returns how many callbacks failed.
    pub fn tick(&self) -> usize {
        self.dispatch(Capabilities::UPDATE, "update", |m| m.update())
    }

    pub fn late_tick(&self) -> usize {
        self.dispatch(Capabilities::LATE_UPDATE, "late_update", |m| m.late_update())
    }

    pub fn physics_tick(&self) -> usize {
        self.dispatch(Capabilities::PHYSICS_UPDATE, "physics_update", |m| {
            m.physics_update()
        })
    }

    pub fn pause(&self, paused: bool) -> usize {
        self.dispatch(Capabilities::PAUSE, "on_pause", |m| m.on_pause(paused))
    }

    pub fn focus(&self, focused: bool) -> usize {
        self.dispatch(Capabilities::FOCUS, "on_focus", |m| m.on_focus(focused))
    }

    pub fn quit(&self) -> usize {
        self.dispatch(Capabilities::QUIT, "on_quit", |m| m.on_quit())
    }

    pub fn state_of(&self, key: TypeKey) -> ModuleState {
        self.state
            .lock()
            .states
            .get(&key)
            .copied()
            .unwrap_or(ModuleState::Unregistered)
    }

    pub fn is_registered(&self, key: TypeKey) -> bool {
        self.state.lock().entries.contains_key(&key)
    }

    pub fn registered(&self) -> Vec<&'static str> {
        let state = self.state.lock();
        state
            .order
            .iter()
            .filter_map(|key| state.entries.get(key).map(|e| e.descriptor.name))
            .collect()
    }

    pub fn registration_order(&self) -> Vec<TypeKey> {
        self.state.lock().order.clone()
    }

    /// Modules taking part in `capability`, in registration order.
    pub fn members(&self, capability: Capabilities) -> Vec<TypeKey> {
        let state = self.state.lock();
        state
            .order
            .iter()
            .filter(|key| {
                state
                    .entries
                    .get(key)
                    .is_some_and(|e| e.capabilities.contains(capability))
            })
            .copied()
            .collect()
    }
}

/// Embedder surface: one bus, one main-thread context and the registry.
pub struct ModuleHost {
    bus: SharedMessageBus,
    registry: ModuleRegistry,
    catalog: ModuleCatalog,
    main_thread: Option<MainThreadContext>,
}

impl ModuleHost {
    /// Must be called from within a tokio runtime.
    pub fn new(config: BusConfig, catalog: ModuleCatalog) -> Self {
        let main_thread = MainThreadContext::spawn();
        let bus = SharedMessageBus::with_main_thread(config, main_thread.handle());
        ModuleHost {
            registry: ModuleRegistry::new(&bus),
            bus,
            catalog,
            main_thread: Some(main_thread),
        }
    }

    pub fn bus(&self) -> &SharedMessageBus {
        &self.bus
    }

    pub fn registry(&self) -> &ModuleRegistry {
        &self.registry
    }

    pub fn catalog(&self) -> &ModuleCatalog {
        &self.catalog
    }

    /// Registers the catalog modules selected by `conf`.
    pub fn start(&self, conf: &ModulesConf) -> RegistrationReport {
        let selected = self.catalog.select(conf);
        if selected.is_empty() {
            warn!("No module selected, the host will idle");
        }
        self.registry.register_batch(&selected)
    }

    pub fn update(&self) {
        self.registry.tick();
    }

    pub fn late_update(&self) {
        self.registry.late_tick();
    }

    pub fn physics_update(&self) {
        self.registry.physics_tick();
    }

    pub fn on_pause(&self, paused: bool) {
        self.registry.pause(paused);
    }

    pub fn on_focus(&self, focused: bool) {
        self.registry.focus(focused);
    }

    pub fn on_quit(&self) {
        self.registry.quit();
    }

    /// Tears down the modules, then the bus engines and pool, then the
    /// main-thread context.
    pub async fn dispose_async(&mut self) {
        self.registry.dispose();
        self.bus.dispose().await;
        if let Some(main_thread) = self.main_thread.take() {
            main_thread.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests;
