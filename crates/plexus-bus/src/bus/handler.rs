use std::{
    any::Any,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use anyhow::Result;
use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::bus::{
    SubscribeOptions, TypeKey,
    pool::{Pool, PoolConfig},
};

/// Handler signature shared by broadcasts and commands.
pub(crate) type ActionFn<M> =
    Arc<dyn Fn(M, CancellationToken) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Handler signature of queries.
pub(crate) type QueryFn<Q, R> =
    Arc<dyn Fn(Q, CancellationToken) -> BoxFuture<'static, Result<R>> + Send + Sync>;

static NEXT_HANDLER_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of an installed handler.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(u64);

impl HandlerId {
    fn next() -> Self {
        HandlerId(NEXT_HANDLER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for HandlerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Read-only view of an installed handler, used to select handlers for removal.
#[derive(Clone, Copy, Debug)]
pub struct HandlerInfo {
    pub id: HandlerId,
    pub priority: i32,
    pub main_thread: bool,
    pub owner: Option<TypeKey>,
}

/// Pooled wrapper around a type-erased handler.
///
/// A record is either free (owned by the pool) or installed (held by exactly one
/// channel snapshot or slot). Installed records are shared through `Arc`, so one
/// can only go back to the pool once no dispatch holds it anymore.
pub struct HandlerRecord {
    id: HandlerId,
    priority: i32,
    main_thread: bool,
    owner: Option<TypeKey>,
    callable: Option<Arc<dyn Any + Send + Sync>>,
}

impl HandlerRecord {
    fn blank() -> Self {
        HandlerRecord {
            id: HandlerId(0),
            priority: 0,
            main_thread: false,
            owner: None,
            callable: None,
        }
    }

    fn reset(&mut self) {
        *self = Self::blank();
    }

    pub(crate) fn pool(config: PoolConfig) -> Pool<HandlerRecord> {
        Pool::new(config, HandlerRecord::blank, HandlerRecord::reset)
    }

    /// Fills a free record. The typed callable is checked here once, dispatch
    /// only recovers it.
    pub(crate) fn install<C>(&mut self, options: &SubscribeOptions, callable: C) -> HandlerId
    where
        C: Any + Send + Sync,
    {
        self.id = HandlerId::next();
        self.priority = options.priority;
        self.main_thread = options.main_thread;
        self.owner = options.owner;
        self.callable = Some(Arc::new(callable));
        self.id
    }

    pub(crate) fn callable<C: Any + Clone>(&self) -> Option<C> {
        self.callable.as_ref()?.downcast_ref::<C>().cloned()
    }

    pub fn id(&self) -> HandlerId {
        self.id
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn main_thread(&self) -> bool {
        self.main_thread
    }

    pub fn owner(&self) -> Option<TypeKey> {
        self.owner
    }

    pub fn info(&self) -> HandlerInfo {
        HandlerInfo {
            id: self.id,
            priority: self.priority,
            main_thread: self.main_thread,
            owner: self.owner,
        }
    }

    /// Name of the owner, for logs.
    pub fn origin(&self) -> &'static str {
        self.owner.map(|o| o.name()).unwrap_or("<anonymous>")
    }
}

/// Hands an uninstalled record back to the pool. A record still referenced by
/// an in-flight dispatch is dropped instead.
pub(crate) fn recycle(pool: &Pool<HandlerRecord>, record: Arc<HandlerRecord>) {
    match Arc::try_unwrap(record) {
        Ok(record) => pool.release(record),
        Err(record) => trace!(
            handler = %record.id,
            "Handler record still in use by a dispatch, not recycled"
        ),
    }
}
