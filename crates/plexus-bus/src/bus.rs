//! Event bus used for typed messaging across modules in the same process.
//!
//! The bus is an explicit context object: build one [`SharedMessageBus`], hand
//! out handles with [`SharedMessageBus::new_handle`], and dispose it once when
//! the host shuts down.

use std::{
    any::{TypeId, type_name},
    fmt,
    future::Future,
    hash::{Hash, Hasher},
    ops::Deref,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use broadcast::BroadcastEngine;
use command::CommandEngine;
use context::ExecutionOptions;
use handler::HandlerRecord;
use main_thread::MainThreadHandle;
use metrics::BusMetrics;
use pool::{Pool, PoolConfig};
use query::{QueryEngine, QueryError};
use report::DispatchReport;

pub mod broadcast;
pub mod command;
pub mod context;
pub mod handler;
pub mod main_thread;
pub mod metrics;
pub mod pool;
pub mod query;
pub mod query_cache;
pub mod report;

pub use handler::{HandlerId, HandlerInfo};

/// Identity of a Rust type, usable for `dyn Trait` interfaces as well.
/// Equality and hashing only consider the `TypeId`.
#[derive(Clone, Copy)]
pub struct TypeKey {
    id: TypeId,
    name: &'static str,
}

impl TypeKey {
    pub fn of<T: ?Sized + 'static>() -> Self {
        TypeKey {
            id: TypeId::of::<T>(),
            name: type_name::<T>(),
        }
    }

    pub fn id(&self) -> TypeId {
        self.id
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Last path segment of the type name, generics included.
    pub fn short_name(&self) -> &'static str {
        let base = self.name.split('<').next().unwrap_or(self.name);
        match base.rfind("::") {
            Some(idx) => &self.name[idx + 2..],
            None => self.name,
        }
    }
}

impl PartialEq for TypeKey {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for TypeKey {}

impl Hash for TypeKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for TypeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

impl fmt::Display for TypeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.short_name())
    }
}

/// Addresses a subscriber list (broadcast), a handler slot (command), or a
/// handler slot for a given result type (query).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ChannelKey {
    pub message: TypeKey,
    pub result: Option<TypeKey>,
}

impl ChannelKey {
    pub fn message<M: 'static>() -> Self {
        ChannelKey {
            message: TypeKey::of::<M>(),
            result: None,
        }
    }

    pub fn query<Q: 'static, R: 'static>() -> Self {
        ChannelKey {
            message: TypeKey::of::<Q>(),
            result: Some(TypeKey::of::<R>()),
        }
    }
}

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.result {
            Some(result) => write!(f, "{} -> {}", self.message, result),
            None => write!(f, "{}", self.message),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BusError {
    /// A dispatch engine or the handler pool was used after teardown.
    #[error("{component} has been disposed")]
    Disposed { component: &'static str },
}

/// How a handler is installed. Commands and queries ignore `priority`.
#[derive(Clone, Copy, Debug, Default)]
pub struct SubscribeOptions {
    /// Lower values are dispatched first.
    pub priority: i32,
    pub main_thread: bool,
    pub owner: Option<TypeKey>,
}

impl SubscribeOptions {
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn on_main_thread(mut self) -> Self {
        self.main_thread = true;
        self
    }

    pub fn owned_by(mut self, owner: TypeKey) -> Self {
        self.owner = Some(owner);
        self
    }
}

/// Static configuration of a bus: pool sizing and default execution policy per engine.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct BusConfig {
    pub pool: PoolConfig,
    pub broadcast: ExecutionOptions,
    pub command: ExecutionOptions,
    pub query: ExecutionOptions,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            pool: PoolConfig::default(),
            broadcast: ExecutionOptions::default(),
            command: ExecutionOptions::default(),
            query: ExecutionOptions::default().with_cache(std::time::Duration::from_secs(5)),
        }
    }
}

struct BusInner {
    pool: Arc<Pool<HandlerRecord>>,
    broadcasts: BroadcastEngine,
    commands: CommandEngine,
    queries: QueryEngine,
    disposed: AtomicBool,
}

pub struct SharedMessageBus {
    inner: Arc<BusInner>,
}

impl SharedMessageBus {
    pub fn new_handle(&self) -> Self {
        SharedMessageBus {
            inner: Arc::clone(&self.inner),
        }
    }

    pub fn new() -> Self {
        Self::build(BusConfig::default(), None)
    }

    pub fn with_config(config: BusConfig) -> Self {
        Self::build(config, None)
    }

    /// Handlers flagged as main-thread bound are handed off to `main_thread` before running.
    pub fn with_main_thread(config: BusConfig, main_thread: MainThreadHandle) -> Self {
        Self::build(config, Some(main_thread))
    }

    fn build(config: BusConfig, main_thread: Option<MainThreadHandle>) -> Self {
        let pool = Arc::new(HandlerRecord::pool(config.pool));
        let metrics = BusMetrics::global();
        SharedMessageBus {
            inner: Arc::new(BusInner {
                broadcasts: BroadcastEngine::new(
                    Arc::clone(&pool),
                    config.broadcast,
                    main_thread.clone(),
                    metrics.clone(),
                ),
                commands: CommandEngine::new(
                    Arc::clone(&pool),
                    config.command,
                    main_thread.clone(),
                    metrics.clone(),
                ),
                queries: QueryEngine::new(Arc::clone(&pool), config.query, main_thread, metrics),
                pool,
                disposed: AtomicBool::new(false),
            }),
        }
    }

    pub fn broadcasts(&self) -> &BroadcastEngine {
        &self.inner.broadcasts
    }

    pub fn commands(&self) -> &CommandEngine {
        &self.inner.commands
    }

    pub fn queries(&self) -> &QueryEngine {
        &self.inner.queries
    }

    pub fn pool(&self) -> &Pool<HandlerRecord> {
        &self.inner.pool
    }

    /// A view of this bus whose subscriptions are tagged with `owner`.
    pub fn owned(&self, owner: TypeKey) -> OwnedBus {
        OwnedBus {
            bus: self.new_handle(),
            owner,
        }
    }

    pub async fn broadcast<M>(
        &self,
        message: M,
        token: &CancellationToken,
    ) -> Result<DispatchReport, BusError>
    where
        M: Clone + Send + Sync + 'static,
    {
        self.inner.broadcasts.broadcast(message, token).await
    }

    pub async fn execute<C>(
        &self,
        command: C,
        token: &CancellationToken,
    ) -> Result<DispatchReport, BusError>
    where
        C: Send + Sync + 'static,
    {
        self.inner.commands.execute(command, token).await
    }

    pub async fn query<Q, R>(&self, query: Q, token: &CancellationToken) -> Result<R, BusError>
    where
        Q: Hash + Send + Sync + 'static,
        R: Clone + Default + Send + Sync + 'static,
    {
        self.inner.queries.query(query, token).await
    }

    pub async fn try_query<Q, R>(&self, query: Q, token: &CancellationToken) -> Result<R, QueryError>
    where
        Q: Hash + Send + Sync + 'static,
        R: Clone + Send + Sync + 'static,
    {
        self.inner.queries.try_query(query, token).await
    }

    /// Removes every handler installed by `owner` from the three engines.
    pub fn unsubscribe_owner(&self, owner: TypeKey) -> usize {
        let removed = self.inner.broadcasts.unsubscribe_owner(owner)
            + self.inner.commands.unsubscribe_owner(owner)
            + self.inner.queries.unsubscribe_owner(owner);
        if removed > 0 {
            debug!(owner = %owner, removed, "Removed handlers owned by {}", owner);
        }
        removed
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::Acquire)
    }

    /// Tears down the engines (broadcast, command, query) then the handler pool.
    /// Calling it again is a no-op.
    pub async fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.broadcasts.dispose();
        self.inner.commands.dispose();
        self.inner.queries.dispose().await;
        self.inner.pool.dispose();
        info!("Message bus disposed");
    }
}

impl Default for SharedMessageBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Bus handle handed to a module while it installs or removes its handlers.
pub struct OwnedBus {
    bus: SharedMessageBus,
    owner: TypeKey,
}

impl Deref for OwnedBus {
    type Target = SharedMessageBus;

    fn deref(&self) -> &Self::Target {
        &self.bus
    }
}

impl OwnedBus {
    pub fn owner(&self) -> TypeKey {
        self.owner
    }

    fn options(&self) -> SubscribeOptions {
        SubscribeOptions::default().owned_by(self.owner)
    }

    pub fn on_broadcast<M, F, Fut>(&self, priority: i32, handler: F) -> Result<HandlerId, BusError>
    where
        M: Clone + Send + Sync + 'static,
        F: Fn(M, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.bus
            .broadcasts()
            .subscribe(self.options().with_priority(priority), handler)
    }

    pub fn on_broadcast_main_thread<M, F, Fut>(
        &self,
        priority: i32,
        handler: F,
    ) -> Result<HandlerId, BusError>
    where
        M: Clone + Send + Sync + 'static,
        F: Fn(M, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.bus.broadcasts().subscribe(
            self.options().with_priority(priority).on_main_thread(),
            handler,
        )
    }

    pub fn on_command<C, F, Fut>(&self, handler: F) -> Result<HandlerId, BusError>
    where
        C: Send + Sync + 'static,
        F: Fn(C, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.bus.commands().subscribe(self.options(), handler)
    }

    pub fn on_query<Q, R, F, Fut>(&self, handler: F) -> Result<HandlerId, BusError>
    where
        Q: Send + Sync + 'static,
        R: Clone + Send + Sync + 'static,
        F: Fn(Q, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
    {
        self.bus.queries().subscribe(self.options(), handler)
    }

    /// Removes every handler this owner installed.
    pub fn unsubscribe_all(&self) -> usize {
        self.bus.unsubscribe_owner(self.owner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    trait Marker {}

    #[test]
    fn type_key_names() {
        let key = TypeKey::of::<Vec<u8>>();
        assert_eq!(key.short_name(), "Vec<u8>");
        assert_eq!(TypeKey::of::<dyn Marker>(), TypeKey::of::<dyn Marker>());
        assert_ne!(TypeKey::of::<dyn Marker>(), TypeKey::of::<u8>());
        assert_eq!(format!("{}", ChannelKey::query::<u32, String>()), "u32 -> String");
    }

    #[tokio::test]
    async fn dispose_is_idempotent_and_blocks_use() {
        let bus = SharedMessageBus::new();
        let other = bus.new_handle();
        bus.dispose().await;
        other.dispose().await;
        assert!(other.is_disposed());
        let res = other.broadcast(1usize, &CancellationToken::new()).await;
        assert!(matches!(res, Err(BusError::Disposed { .. })));
        assert!(other.pool().is_disposed());
    }
}
