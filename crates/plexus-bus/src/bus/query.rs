//! Request/response dispatch with result caching and single-flight
//! de-duplication.
//!
//! A query is addressed by its `ChannelKey(Q, R)` and fingerprinted by hashing
//! the query value. Concurrent identical queries share one execution: the first
//! caller (leader) publishes a shared future in the pending map, later callers
//! (joiners) await it, and the leader's guard removes it once the leader is done.

use std::{
    any::Any,
    future::Future,
    hash::{DefaultHasher, Hash, Hasher},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use anyhow::anyhow;
use dashmap::{DashMap, mapref::entry::Entry};
use futures::{
    FutureExt,
    future::{BoxFuture, Shared},
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, error, trace, warn};

use crate::bus::{
    BusError, ChannelKey, HandlerId, HandlerInfo, SubscribeOptions, TypeKey,
    broadcast::invoke,
    context::{ExecutionContext, ExecutionOptions, HandlerOutcome},
    handler::{HandlerRecord, QueryFn, recycle},
    main_thread::MainThreadHandle,
    metrics::BusMetrics,
    pool::Pool,
    query_cache::{CacheKey, QueryCache},
};

#[derive(Debug, Clone, thiserror::Error)]
pub enum QueryError {
    #[error("no handler for query {0}")]
    NotFound(ChannelKey),
    #[error("query handler failed: {0:#}")]
    Failed(Arc<anyhow::Error>),
    #[error("query cancelled")]
    Cancelled,
    #[error("query handler timed out")]
    TimedOut,
    #[error(transparent)]
    Disposed(#[from] BusError),
}

type Flight<R> = Shared<BoxFuture<'static, Result<R, QueryError>>>;

struct PendingEntry {
    flight_id: u64,
    /// `Flight<R>` for the entry's result type
    flight: Arc<dyn Any + Send + Sync>,
}

type PendingMap = DashMap<CacheKey, PendingEntry>;

/// Removes the leader's pending entry on every exit path, cancellation included.
struct PendingGuard {
    pending: Arc<PendingMap>,
    key: CacheKey,
    flight_id: u64,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.pending
            .remove_if(&self.key, |_, entry| entry.flight_id == self.flight_id);
    }
}

pub fn fingerprint<Q: Hash>(query: &Q) -> u64 {
    let mut hasher = DefaultHasher::new();
    query.hash(&mut hasher);
    hasher.finish()
}

pub struct QueryEngine {
    slots: DashMap<ChannelKey, Arc<HandlerRecord>>,
    pending: Arc<PendingMap>,
    cache: Arc<QueryCache>,
    pool: Arc<Pool<HandlerRecord>>,
    options: ExecutionOptions,
    main_thread: Option<MainThreadHandle>,
    metrics: BusMetrics,
    next_flight: AtomicU64,
    flights: TaskTracker,
    shutdown: CancellationToken,
    disposed: AtomicBool,
}

impl QueryEngine {
    pub(crate) fn new(
        pool: Arc<Pool<HandlerRecord>>,
        options: ExecutionOptions,
        main_thread: Option<MainThreadHandle>,
        metrics: BusMetrics,
    ) -> Self {
        QueryEngine {
            slots: DashMap::new(),
            pending: Arc::new(DashMap::new()),
            cache: Arc::new(QueryCache::new(options.cache_capacity)),
            pool,
            options,
            main_thread,
            metrics,
            next_flight: AtomicU64::new(0),
            flights: TaskTracker::new(),
            shutdown: CancellationToken::new(),
            disposed: AtomicBool::new(false),
        }
    }

    fn ensure_live(&self) -> Result<(), BusError> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(BusError::Disposed {
                component: "query engine",
            });
        }
        Ok(())
    }

    pub fn options(&self) -> &ExecutionOptions {
        &self.options
    }

    pub fn subscribe<Q, R, F, Fut>(
        &self,
        options: SubscribeOptions,
        handler: F,
    ) -> Result<HandlerId, BusError>
    where
        Q: Send + Sync + 'static,
        R: Clone + Send + Sync + 'static,
        F: Fn(Q, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
    {
        self.ensure_live()?;
        let callable: QueryFn<Q, R> = Arc::new(move |query, token| handler(query, token).boxed());
        let mut record = self.pool.acquire()?;
        let id = record.install(&options, callable);
        let key = ChannelKey::query::<Q, R>();

        if let Some(previous) = self.slots.insert(key, Arc::new(record)) {
            warn!(
                channel = %key,
                "Replacing query handler {} of {} installed by {}",
                previous.id(),
                key,
                previous.origin()
            );
            recycle(&self.pool, previous);
        } else {
            debug!(channel = %key, handler = %id, "Query handler subscribed");
        }
        Ok(id)
    }

    pub fn unsubscribe<Q: 'static, R: 'static>(&self) -> bool {
        match self.slots.remove(&ChannelKey::query::<Q, R>()) {
            Some((_, record)) => {
                recycle(&self.pool, record);
                true
            }
            None => false,
        }
    }

    pub fn unsubscribe_owner(&self, owner: TypeKey) -> usize {
        let owned: Vec<ChannelKey> = self
            .slots
            .iter()
            .filter(|slot| slot.value().owner() == Some(owner))
            .map(|slot| *slot.key())
            .collect();
        let mut removed = 0;
        for key in owned {
            if let Some((_, record)) = self
                .slots
                .remove_if(&key, |_, record| record.owner() == Some(owner))
            {
                recycle(&self.pool, record);
                removed += 1;
            }
        }
        removed
    }

    pub fn has_handler<Q: 'static, R: 'static>(&self) -> bool {
        self.slots.contains_key(&ChannelKey::query::<Q, R>())
    }

    pub fn handler<Q: 'static, R: 'static>(&self) -> Option<HandlerInfo> {
        self.slots
            .get(&ChannelKey::query::<Q, R>())
            .map(|slot| slot.value().info())
    }

    /// Lenient form: any failure other than a disposed engine yields `R::default()`.
    pub async fn query<Q, R>(&self, query: Q, token: &CancellationToken) -> Result<R, BusError>
    where
        Q: Hash + Send + Sync + 'static,
        R: Clone + Default + Send + Sync + 'static,
    {
        self.query_with(query, &self.options, token).await
    }

    pub async fn query_with<Q, R>(
        &self,
        query: Q,
        options: &ExecutionOptions,
        token: &CancellationToken,
    ) -> Result<R, BusError>
    where
        Q: Hash + Send + Sync + 'static,
        R: Clone + Default + Send + Sync + 'static,
    {
        match self.try_query_with(query, options, token).await {
            Ok(value) => Ok(value),
            Err(QueryError::Disposed(e)) => Err(e),
            Err(_) => Ok(R::default()),
        }
    }

    pub async fn try_query<Q, R>(&self, query: Q, token: &CancellationToken) -> Result<R, QueryError>
    where
        Q: Hash + Send + Sync + 'static,
        R: Clone + Send + Sync + 'static,
    {
        self.try_query_with(query, &self.options, token).await
    }

    /// Strict form: every failure is returned to the caller.
    pub async fn try_query_with<Q, R>(
        &self,
        query: Q,
        options: &ExecutionOptions,
        token: &CancellationToken,
    ) -> Result<R, QueryError>
    where
        Q: Hash + Send + Sync + 'static,
        R: Clone + Send + Sync + 'static,
    {
        self.ensure_live()?;
        let key = ChannelKey::query::<Q, R>();
        let Some(record) = self.slots.get(&key).map(|slot| Arc::clone(slot.value())) else {
            warn!(channel = %key, "No handler for query {}", key);
            return Err(QueryError::NotFound(key));
        };
        let cache_key = (key, fingerprint(&query));

        if options.cache_capacity != self.options.cache_capacity {
            trace!(
                channel = %key,
                "Per-call cache capacity {} ignored, the cache holds {} entries",
                options.cache_capacity,
                self.cache.capacity()
            );
        }
        if options.caching() {
            let hit = self.cache.get::<R>(&cache_key, options.cache_ttl);
            self.metrics.cache_lookup::<Q>(hit.is_some());
            if let Some(value) = hit {
                return Ok(value);
            }
        }
        if token.is_cancelled() {
            debug!(channel = %key, "Query cancelled before dispatch");
            return Err(QueryError::Cancelled);
        }

        if !options.dedup_enabled {
            return self
                .flight(record, cache_key, query, options.clone(), token.clone())
                .await;
        }

        let flight_id = self.next_flight.fetch_add(1, Ordering::Relaxed);
        let (flight, leader) = match self.pending.entry(cache_key) {
            Entry::Occupied(entry) => {
                let Some(flight) = entry.get().flight.downcast_ref::<Flight<R>>().cloned() else {
                    return Err(QueryError::Failed(Arc::new(anyhow!(
                        "pending query on {key} has an unexpected result type"
                    ))));
                };
                (flight, false)
            }
            Entry::Vacant(entry) => {
                let flight = self
                    .flight(record, cache_key, query, options.clone(), token.clone())
                    .shared();
                entry.insert(PendingEntry {
                    flight_id,
                    flight: Arc::new(flight.clone()),
                });
                (flight, true)
            }
        };
        let _guard = leader.then(|| PendingGuard {
            pending: Arc::clone(&self.pending),
            key: cache_key,
            flight_id,
        });
        if !leader {
            debug!(channel = %key, "Joining in-flight query");
            self.metrics.dedup_join::<Q>();
        }

        tokio::select! {
            biased;
            _ = token.cancelled() => Err(QueryError::Cancelled),
            res = flight => res,
        }
    }

    /// One execution of the installed handler. Successful results are written
    /// through to the cache.
    fn flight<Q, R>(
        &self,
        record: Arc<HandlerRecord>,
        cache_key: CacheKey,
        query: Q,
        options: ExecutionOptions,
        token: CancellationToken,
    ) -> BoxFuture<'static, Result<R, QueryError>>
    where
        Q: Send + Sync + 'static,
        R: Clone + Send + Sync + 'static,
    {
        let main_thread = self.main_thread.clone();
        let cache = Arc::clone(&self.cache);
        let metrics = self.metrics.clone();
        let shutdown = self.shutdown.clone();
        let key = cache_key.0;

        let run = async move {
            let ctx = ExecutionContext::new(&token, options);
            let Some(callable) = record.callable::<QueryFn<Q, R>>() else {
                return Err(QueryError::Failed(Arc::new(anyhow!(
                    "handler installed on {key} has an unexpected signature"
                ))));
            };
            let on_main = record.main_thread() || ctx.options().main_thread_required;
            let outcome = invoke(
                main_thread.as_ref(),
                on_main,
                ctx.handler_scope(ctx.token()),
                move |token| callable(query, token),
            )
            .await;

            let (result, label) = match outcome {
                HandlerOutcome::Completed(value) => {
                    if ctx.options().caching() {
                        cache.insert(cache_key, value.clone());
                    }
                    (Ok(value), "completed")
                }
                HandlerOutcome::Failed(e) => {
                    error!(
                        channel = %key,
                        handler = %record.id(),
                        owner = record.origin(),
                        "Query handler for {} failed: {:#}",
                        key,
                        e
                    );
                    (Err(QueryError::Failed(Arc::new(e))), "faulted")
                }
                HandlerOutcome::TimedOut => {
                    debug!(channel = %key, "Query handler timed out");
                    (Err(QueryError::TimedOut), "cancelled")
                }
                HandlerOutcome::Cancelled | HandlerOutcome::Skipped => {
                    debug!(channel = %key, "Query cancelled");
                    (Err(QueryError::Cancelled), "cancelled")
                }
            };
            metrics.queried::<Q>(label, ctx.elapsed());
            result
        };

        self.flights
            .track_future(async move {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => Err(QueryError::Disposed(BusError::Disposed {
                        component: "query engine",
                    })),
                    res = run => res,
                }
            })
            .boxed()
    }

    /// Drops the cached result of `query`, if any.
    pub fn invalidate<Q, R>(&self, query: &Q) -> bool
    where
        Q: Hash + 'static,
        R: 'static,
    {
        self.cache
            .remove(&(ChannelKey::query::<Q, R>(), fingerprint(query)))
    }

    pub fn invalidate_channel<Q: 'static, R: 'static>(&self) -> usize {
        self.cache.remove_channel(&ChannelKey::query::<Q, R>())
    }

    pub fn clear(&self) {
        self.cache.clear();
        debug!("Query cache cleared");
    }

    /// Fixed by the engine options. `cache_capacity` of per-call options is ignored.
    pub fn cache_capacity(&self) -> usize {
        self.cache.capacity()
    }

    pub fn cached_len(&self) -> usize {
        self.cache.len()
    }

    /// Number of executions currently shared through the pending map.
    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }

    /// Cancels in-flight executions and waits for them to wind down, then
    /// releases every handler and the cache.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shutdown.cancel();
        self.pending.clear();
        self.flights.close();
        self.flights.wait().await;

        let keys: Vec<ChannelKey> = self.slots.iter().map(|slot| *slot.key()).collect();
        let mut removed = 0;
        for key in keys {
            if let Some((_, record)) = self.slots.remove(&key) {
                recycle(&self.pool, record);
                removed += 1;
            }
        }
        self.cache.clear();
        debug!(removed, "Query engine disposed");
    }
}
