use std::{fmt, sync::Arc};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::bus::TypeKey;

use super::{Dependency, Module, ModuleDefinition};

/// Type-erased constructor and metadata of a [`ModuleDefinition`].
#[derive(Clone, Copy)]
pub struct ModuleDescriptor {
    pub key: TypeKey,
    pub name: &'static str,
    dependencies: fn() -> Vec<Dependency>,
    interfaces: fn() -> Vec<TypeKey>,
    priority: fn() -> i32,
    enabled_by_default: fn() -> bool,
    create: fn() -> Result<Arc<dyn Module>>,
}

fn create_module<M: ModuleDefinition>() -> Result<Arc<dyn Module>> {
    Ok(Arc::new(M::create()?))
}

impl ModuleDescriptor {
    pub fn of<M: ModuleDefinition>() -> Self {
        ModuleDescriptor {
            key: TypeKey::of::<M>(),
            name: M::NAME,
            dependencies: M::dependencies,
            interfaces: M::interfaces,
            priority: M::priority,
            enabled_by_default: M::enabled_by_default,
            create: create_module::<M>,
        }
    }

    pub fn dependencies(&self) -> Vec<Dependency> {
        (self.dependencies)()
    }

    pub fn interfaces(&self) -> Vec<TypeKey> {
        (self.interfaces)()
    }

    pub fn priority(&self) -> i32 {
        (self.priority)()
    }

    pub fn enabled_by_default(&self) -> bool {
        (self.enabled_by_default)()
    }

    pub fn create(&self) -> Result<Arc<dyn Module>> {
        (self.create)()
    }

    /// Whether this module satisfies `dependency`.
    pub fn provides(&self, dependency: &Dependency) -> bool {
        match dependency {
            Dependency::Module(key) => self.key == *key,
            Dependency::Interface(interface) => {
                self.key == *interface || self.interfaces().contains(interface)
            }
        }
    }
}

impl fmt::Debug for ModuleDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleDescriptor")
            .field("name", &self.name)
            .field("key", &self.key)
            .finish()
    }
}

/// Link-time registration entry, see [`submit_module!`](crate::submit_module).
pub struct ModuleReg(pub fn() -> ModuleDescriptor);
inventory::collect!(ModuleReg);

/// Registers a [`ModuleDefinition`] for discovery through [`ModuleCatalog::discovered`].
#[macro_export]
macro_rules! submit_module {
    ($module:ty) => {
        $crate::inventory::submit! {
            $crate::modules::ModuleReg($crate::modules::ModuleDescriptor::of::<$module>)
        }
    };
}

/// Which modules a host starts.
///
/// A non-empty `enabled` list is authoritative and gives the registration
/// order. Otherwise every known module whose name contains `name_filter` and
/// that is enabled by default is selected. `disabled` always wins.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(default)]
pub struct ModulesConf {
    pub enabled: Vec<String>,
    pub name_filter: Option<String>,
    pub disabled: Vec<String>,
}

/// The modules a host knows how to build.
#[derive(Clone, Debug, Default)]
pub struct ModuleCatalog {
    descriptors: Vec<ModuleDescriptor>,
}

impl ModuleCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every module registered with `submit_module!` in the linked crates, by name.
    pub fn discovered() -> Self {
        let mut catalog = Self::new();
        catalog.extend_discovered();
        catalog
    }

    pub fn extend_discovered(&mut self) -> &mut Self {
        let mut found: Vec<ModuleDescriptor> =
            inventory::iter::<ModuleReg>().map(|reg| (reg.0)()).collect();
        found.sort_by_key(|d| d.name);
        for descriptor in found {
            self.push(descriptor);
        }
        self
    }

    pub fn with<M: ModuleDefinition>(mut self) -> Self {
        self.add::<M>();
        self
    }

    pub fn add<M: ModuleDefinition>(&mut self) -> &mut Self {
        self.push(ModuleDescriptor::of::<M>());
        self
    }

    fn push(&mut self, descriptor: ModuleDescriptor) {
        if self.descriptors.iter().any(|d| d.key == descriptor.key) {
            debug!("Module {} already in catalog", descriptor.name);
            return;
        }
        self.descriptors.push(descriptor);
    }

    pub fn descriptors(&self) -> &[ModuleDescriptor] {
        &self.descriptors
    }

    pub fn get(&self, name: &str) -> Option<&ModuleDescriptor> {
        self.descriptors.iter().find(|d| d.name == name)
    }

    pub fn select(&self, conf: &ModulesConf) -> Vec<ModuleDescriptor> {
        let allowed = |d: &ModuleDescriptor| !conf.disabled.iter().any(|n| n == d.name);

        if !conf.enabled.is_empty() {
            return conf
                .enabled
                .iter()
                .filter_map(|name| {
                    let found = self.get(name);
                    if found.is_none() {
                        warn!("Enabled module {} is not known to this host", name);
                    }
                    found
                })
                .filter(|d| allowed(d))
                .copied()
                .collect();
        }

        self.descriptors
            .iter()
            .filter(|d| {
                conf.name_filter
                    .as_deref()
                    .is_none_or(|filter| d.name.contains(filter))
            })
            .filter(|d| d.enabled_by_default() && allowed(d))
            .copied()
            .collect()
    }
}
