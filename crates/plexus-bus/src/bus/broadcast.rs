//! Multi-subscriber, priority-ordered fan-out.
//!
//! Each message type owns a copy-on-write snapshot of its subscribers. Writers
//! build a new snapshot under the channel's mutation lock; dispatch only loads
//! the current snapshot and never locks.

use std::{
    any::TypeId,
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use anyhow::anyhow;
use arc_swap::ArcSwap;
use dashmap::DashMap;
use futures::{FutureExt, future::join_all};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::bus::{
    BusError, ChannelKey, HandlerId, HandlerInfo, SubscribeOptions, TypeKey,
    context::{
        CancellationPolicy, ConcurrencyMode, ErrorPolicy, ExecutionContext, ExecutionOptions,
        HandlerOutcome, HandlerScope,
    },
    handler::{ActionFn, HandlerRecord, recycle},
    main_thread::MainThreadHandle,
    metrics::BusMetrics,
    pool::Pool,
    report::{DispatchOutcome, DispatchReport},
};

type Snapshot = Vec<Arc<HandlerRecord>>;

struct BroadcastChannel {
    key: ChannelKey,
    /// Serializes writers; readers go through `snapshot` directly
    mutation: Mutex<()>,
    snapshot: ArcSwap<Snapshot>,
}

impl BroadcastChannel {
    fn new(key: ChannelKey) -> Self {
        BroadcastChannel {
            key,
            mutation: Mutex::new(()),
            snapshot: ArcSwap::from_pointee(Vec::new()),
        }
    }

    /// Replaces the snapshot with one that excludes every record matching `pred`,
    /// and returns the removed records.
    fn remove_where(&self, pred: impl Fn(&HandlerRecord) -> bool) -> Vec<Arc<HandlerRecord>> {
        let _guard = self.mutation.lock();
        let current = self.snapshot.load_full();
        if !current.iter().any(|r| pred(r)) {
            return Vec::new();
        }
        let (removed, kept): (Vec<_>, Vec<_>) =
            current.iter().cloned().partition(|r| pred(r));
        self.snapshot.store(Arc::new(kept));
        removed
    }
}

pub struct BroadcastEngine {
    channels: DashMap<TypeId, Arc<BroadcastChannel>>,
    pool: Arc<Pool<HandlerRecord>>,
    options: ExecutionOptions,
    main_thread: Option<MainThreadHandle>,
    metrics: BusMetrics,
    disposed: AtomicBool,
}

impl BroadcastEngine {
    pub(crate) fn new(
        pool: Arc<Pool<HandlerRecord>>,
        options: ExecutionOptions,
        main_thread: Option<MainThreadHandle>,
        metrics: BusMetrics,
    ) -> Self {
        BroadcastEngine {
            channels: DashMap::new(),
            pool,
            options,
            main_thread,
            metrics,
            disposed: AtomicBool::new(false),
        }
    }

    fn ensure_live(&self) -> Result<(), BusError> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(BusError::Disposed {
                component: "broadcast engine",
            });
        }
        Ok(())
    }

    pub fn options(&self) -> &ExecutionOptions {
        &self.options
    }

    fn channel<M: 'static>(&self) -> Arc<BroadcastChannel> {
        self.channels
            .entry(TypeId::of::<M>())
            .or_insert_with(|| Arc::new(BroadcastChannel::new(ChannelKey::message::<M>())))
            .clone()
    }

    fn existing_channel<M: 'static>(&self) -> Option<Arc<BroadcastChannel>> {
        self.channels
            .get(&TypeId::of::<M>())
            .map(|channel| Arc::clone(channel.value()))
    }

    /// Installs `handler` for `M`. Handlers with equal priority keep their
    /// registration order.
    pub fn subscribe<M, F, Fut>(
        &self,
        options: SubscribeOptions,
        handler: F,
    ) -> Result<HandlerId, BusError>
    where
        M: Clone + Send + Sync + 'static,
        F: Fn(M, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.ensure_live()?;
        let callable: ActionFn<M> = Arc::new(move |message, token| handler(message, token).boxed());
        let mut record = self.pool.acquire()?;
        let id = record.install(&options, callable);

        let channel = self.channel::<M>();
        {
            let _guard = channel.mutation.lock();
            let current = channel.snapshot.load();
            if options.owner.is_some() && current.iter().any(|r| r.owner() == options.owner) {
                warn!(
                    channel = %channel.key,
                    owner = record.origin(),
                    "{} subscribes another handler to {}",
                    record.origin(),
                    channel.key
                );
            }
            let mut next: Snapshot = Vec::with_capacity(current.len() + 1);
            next.extend(current.iter().cloned());
            next.push(Arc::new(record));
            // Stable: equal priorities keep registration order
            next.sort_by_key(|r| r.priority());
            channel.snapshot.store(Arc::new(next));
        }
        debug!(channel = %channel.key, handler = %id, priority = options.priority, "Broadcast handler subscribed");
        Ok(id)
    }

    /// Removes the handlers of `M` matching `pred` and returns how many were removed.
    pub fn unsubscribe<M: 'static>(&self, pred: impl Fn(&HandlerInfo) -> bool) -> usize {
        let Some(channel) = self.existing_channel::<M>() else {
            return 0;
        };
        let removed = channel.remove_where(|r| pred(&r.info()));
        self.recycle_all(removed)
    }

    pub fn unsubscribe_id<M: 'static>(&self, id: HandlerId) -> bool {
        self.unsubscribe::<M>(|info| info.id == id) > 0
    }

    /// Removes every handler installed by `owner`, on every channel.
    pub fn unsubscribe_owner(&self, owner: TypeKey) -> usize {
        let channels: Vec<_> = self.channels.iter().map(|c| Arc::clone(c.value())).collect();
        channels
            .into_iter()
            .map(|channel| {
                let removed = channel.remove_where(|r| r.owner() == Some(owner));
                self.recycle_all(removed)
            })
            .sum()
    }

    fn recycle_all(&self, removed: Vec<Arc<HandlerRecord>>) -> usize {
        let count = removed.len();
        for record in removed {
            recycle(&self.pool, record);
        }
        count
    }

    pub fn handler_count<M: 'static>(&self) -> usize {
        self.existing_channel::<M>()
            .map(|channel| channel.snapshot.load().len())
            .unwrap_or(0)
    }

    /// Subscribers of `M` in dispatch order.
    pub fn handlers<M: 'static>(&self) -> Vec<HandlerInfo> {
        self.existing_channel::<M>()
            .map(|channel| channel.snapshot.load().iter().map(|r| r.info()).collect())
            .unwrap_or_default()
    }

    pub async fn broadcast<M>(
        &self,
        message: M,
        token: &CancellationToken,
    ) -> Result<DispatchReport, BusError>
    where
        M: Clone + Send + Sync + 'static,
    {
        self.broadcast_with(message, &self.options, token).await
    }

    /// Offers `message` to every subscriber of `M`. Individual handler failures
    /// only show up in the report.
    pub async fn broadcast_with<M>(
        &self,
        message: M,
        options: &ExecutionOptions,
        token: &CancellationToken,
    ) -> Result<DispatchReport, BusError>
    where
        M: Clone + Send + Sync + 'static,
    {
        self.ensure_live()?;
        let Some(channel) = self.existing_channel::<M>() else {
            return Ok(DispatchReport::no_handler());
        };
        let snapshot = channel.snapshot.load_full();
        if snapshot.is_empty() {
            return Ok(DispatchReport::no_handler());
        }

        let ctx = ExecutionContext::new(token, options.clone());
        debug!(
            channel = %channel.key,
            handlers = snapshot.len(),
            mode = ?options.concurrency,
            "Broadcast started"
        );
        let mut report = match options.concurrency {
            ConcurrencyMode::Sequential => {
                self.run_sequential(&ctx, &channel.key, message, &snapshot)
                    .await
            }
            ConcurrencyMode::Concurrent => {
                self.run_concurrent(&ctx, &channel.key, message, &snapshot)
                    .await
            }
        };
        report.elapsed = ctx.elapsed();
        if report.outcome == DispatchOutcome::Cancelled {
            debug!(channel = %channel.key, skipped = report.skipped, "Broadcast cancelled");
        }
        debug!(
            channel = %channel.key,
            succeeded = report.succeeded,
            failed = report.failed,
            "Broadcast finished in {:?}",
            report.elapsed
        );
        self.metrics.dispatched::<M>("broadcast", &report);
        Ok(report)
    }

    async fn run_sequential<M>(
        &self,
        ctx: &ExecutionContext,
        key: &ChannelKey,
        message: M,
        snapshot: &[Arc<HandlerRecord>],
    ) -> DispatchReport
    where
        M: Clone + Send + Sync + 'static,
    {
        let options = ctx.options();
        let mut report = DispatchReport::new(snapshot.len());
        for (index, record) in snapshot.iter().enumerate() {
            if ctx.is_cancelled() {
                report.skip_remaining(snapshot.len() - index);
                report.stop(DispatchOutcome::Cancelled);
                break;
            }
            let on_main = record.main_thread() || options.main_thread_required;
            let outcome = match record.callable::<ActionFn<M>>() {
                Some(callable) => {
                    let message = message.clone();
                    invoke(
                        self.main_thread.as_ref(),
                        on_main,
                        ctx.handler_scope(ctx.token()),
                        move |token| callable(message, token),
                    )
                    .await
                }
                None => mismatched(key),
            };
            report.record(key, record, &outcome);

            let remaining = snapshot.len() - index - 1;
            match outcome {
                HandlerOutcome::Failed(_) if options.error_policy == ErrorPolicy::StopOnError => {
                    report.skip_remaining(remaining);
                    report.stop(DispatchOutcome::Faulted);
                    break;
                }
                ref o if o.is_cancellation()
                    && options.cancellation_policy == CancellationPolicy::CancelAll =>
                {
                    ctx.cancel();
                    report.skip_remaining(remaining);
                    report.stop(DispatchOutcome::Cancelled);
                    break;
                }
                _ => {}
            }
        }
        if report.outcome == DispatchOutcome::Completed && ctx.is_cancelled() {
            report.stop(DispatchOutcome::Cancelled);
        }
        report
    }

    async fn run_concurrent<M>(
        &self,
        ctx: &ExecutionContext,
        key: &ChannelKey,
        message: M,
        snapshot: &[Arc<HandlerRecord>],
    ) -> DispatchReport
    where
        M: Clone + Send + Sync + 'static,
    {
        let options = ctx.options();
        let stop = ctx.stop_signal();
        let mut pending = Vec::with_capacity(snapshot.len());
        for record in snapshot {
            let on_main = record.main_thread() || options.main_thread_required;
            let scope = ctx.handler_scope(&stop);
            let callable = record.callable::<ActionFn<M>>();
            let message = message.clone();
            let main_thread = self.main_thread.clone();
            let stop = stop.clone();
            let error_policy = options.error_policy;
            let cancellation_policy = options.cancellation_policy;
            let key = *key;
            let task = async move {
                let outcome = match callable {
                    Some(callable) => {
                        invoke(main_thread.as_ref(), on_main, scope, move |token| {
                            callable(message, token)
                        })
                        .await
                    }
                    None => mismatched(&key),
                };
                match &outcome {
                    HandlerOutcome::Failed(_) if error_policy == ErrorPolicy::StopOnError => {
                        stop.cancel()
                    }
                    o if o.is_cancellation()
                        && cancellation_policy == CancellationPolicy::CancelAll =>
                    {
                        stop.cancel()
                    }
                    _ => {}
                }
                outcome
            };
            if on_main {
                // Driven by the caller so a dispatch issued from the main-thread
                // context can still run it inline
                pending.push(task.boxed());
            } else {
                let handle = tokio::spawn(task);
                pending.push(
                    async move {
                        handle.await.unwrap_or_else(|e| {
                            HandlerOutcome::Failed(anyhow!("handler task failed: {e}"))
                        })
                    }
                    .boxed(),
                );
            }
        }

        let outcomes = join_all(pending).await;
        let mut report = DispatchReport::new(snapshot.len());
        for (record, outcome) in snapshot.iter().zip(outcomes.iter()) {
            report.record(key, record, outcome);
        }
        if report.failed > 0 && options.error_policy == ErrorPolicy::StopOnError {
            report.stop(DispatchOutcome::Faulted);
        } else if ctx.is_cancelled() || stop.is_cancelled() {
            report.stop(DispatchOutcome::Cancelled);
        }
        report
    }

    /// Drops every channel and hands the records back to the pool. Later calls fail.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        let channels: Vec<_> = self.channels.iter().map(|c| Arc::clone(c.value())).collect();
        self.channels.clear();
        let removed: usize = channels
            .into_iter()
            .map(|channel| self.recycle_all(channel.remove_where(|_| true)))
            .sum();
        debug!(removed, "Broadcast engine disposed");
    }
}

/// Runs one handler inside `scope`, on the main-thread context when required.
pub(crate) async fn invoke<T, C, Fut>(
    main_thread: Option<&MainThreadHandle>,
    on_main: bool,
    scope: HandlerScope,
    call: C,
) -> HandlerOutcome<T>
where
    T: Send + 'static,
    C: FnOnce(CancellationToken) -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
{
    let token = scope.token().clone();
    let run = scope.run(async move { call(token).await });
    match (on_main, main_thread) {
        (true, Some(main_thread)) => main_thread
            .run(run)
            .await
            .unwrap_or_else(|closed| HandlerOutcome::Failed(closed.into())),
        _ => run.await,
    }
}

fn mismatched<T>(key: &ChannelKey) -> HandlerOutcome<T> {
    HandlerOutcome::Failed(anyhow!("handler installed on {key} has an unexpected signature"))
}
