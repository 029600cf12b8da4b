//! Single-handler command dispatch. Installing a handler for a command type that
//! already has one replaces it.

use std::{
    any::TypeId,
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use dashmap::DashMap;
use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::bus::{
    BusError, ChannelKey, HandlerId, HandlerInfo, SubscribeOptions, TypeKey,
    broadcast::invoke,
    context::{CancellationPolicy, ErrorPolicy, ExecutionContext, ExecutionOptions, HandlerOutcome},
    handler::{ActionFn, HandlerRecord, recycle},
    main_thread::MainThreadHandle,
    metrics::BusMetrics,
    pool::Pool,
    report::{DispatchOutcome, DispatchReport},
};

pub struct CommandEngine {
    slots: DashMap<TypeId, (ChannelKey, Arc<HandlerRecord>)>,
    pool: Arc<Pool<HandlerRecord>>,
    options: ExecutionOptions,
    main_thread: Option<MainThreadHandle>,
    metrics: BusMetrics,
    disposed: AtomicBool,
}

impl CommandEngine {
    pub(crate) fn new(
        pool: Arc<Pool<HandlerRecord>>,
        options: ExecutionOptions,
        main_thread: Option<MainThreadHandle>,
        metrics: BusMetrics,
    ) -> Self {
        CommandEngine {
            slots: DashMap::new(),
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
                component: "command engine",
            });
        }
        Ok(())
    }

    pub fn options(&self) -> &ExecutionOptions {
        &self.options
    }

    pub fn subscribe<C, F, Fut>(
        &self,
        options: SubscribeOptions,
        handler: F,
    ) -> Result<HandlerId, BusError>
    where
        C: Send + Sync + 'static,
        F: Fn(C, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.ensure_live()?;
        let callable: ActionFn<C> = Arc::new(move |command, token| handler(command, token).boxed());
        let mut record = self.pool.acquire()?;
        let id = record.install(&options, callable);
        let key = ChannelKey::message::<C>();

        let previous = self
            .slots
            .insert(TypeId::of::<C>(), (key, Arc::new(record)));
        if let Some((_, previous)) = previous {
            warn!(
                channel = %key,
                "Replacing command handler {} of {} installed by {}",
                previous.id(),
                key,
                previous.origin()
            );
            recycle(&self.pool, previous);
        } else {
            debug!(channel = %key, handler = %id, "Command handler subscribed");
        }
        Ok(id)
    }

    /// Removes the handler of `C`, if any.
    pub fn unsubscribe<C: 'static>(&self) -> bool {
        match self.slots.remove(&TypeId::of::<C>()) {
            Some((_, (_, record))) => {
                recycle(&self.pool, record);
                true
            }
            None => false,
        }
    }

    /// Removes the handler of `C` only if it is still `id`.
    pub fn unsubscribe_id<C: 'static>(&self, id: HandlerId) -> bool {
        match self
            .slots
            .remove_if(&TypeId::of::<C>(), |_, (_, record)| record.id() == id)
        {
            Some((_, (_, record))) => {
                recycle(&self.pool, record);
                true
            }
            None => false,
        }
    }

    pub fn unsubscribe_owner(&self, owner: TypeKey) -> usize {
        let owned: Vec<TypeId> = self
            .slots
            .iter()
            .filter(|slot| slot.value().1.owner() == Some(owner))
            .map(|slot| *slot.key())
            .collect();
        owned
            .into_iter()
            .filter_map(|type_id| {
                self.slots
                    .remove_if(&type_id, |_, (_, record)| record.owner() == Some(owner))
            })
            .map(|(_, (_, record))| recycle(&self.pool, record))
            .count()
    }

    pub fn has_handler<C: 'static>(&self) -> bool {
        self.slots.contains_key(&TypeId::of::<C>())
    }

    pub fn handler<C: 'static>(&self) -> Option<HandlerInfo> {
        self.slots
            .get(&TypeId::of::<C>())
            .map(|slot| slot.value().1.info())
    }

    pub async fn execute<C>(
        &self,
        command: C,
        token: &CancellationToken,
    ) -> Result<DispatchReport, BusError>
    where
        C: Send + Sync + 'static,
    {
        self.execute_with(command, &self.options, token).await
    }

    /// Runs the handler of `C`. A missing handler is logged and reported, not an error.
    pub async fn execute_with<C>(
        &self,
        command: C,
        options: &ExecutionOptions,
        token: &CancellationToken,
    ) -> Result<DispatchReport, BusError>
    where
        C: Send + Sync + 'static,
    {
        self.ensure_live()?;
        // Clone out of the map so no shard lock is held across the await
        let Some((key, record)) = self
            .slots
            .get(&TypeId::of::<C>())
            .map(|slot| (slot.value().0, Arc::clone(&slot.value().1)))
        else {
            warn!(
                channel = %ChannelKey::message::<C>(),
                "No handler for command {}",
                TypeKey::of::<C>()
            );
            let report = DispatchReport::no_handler();
            self.metrics.dispatched::<C>("command", &report);
            return Ok(report);
        };

        let ctx = ExecutionContext::new(token, options.clone());
        let mut report = DispatchReport::new(1);
        if ctx.is_cancelled() {
            report.skip_remaining(1);
            report.stop(DispatchOutcome::Cancelled);
        } else {
            let on_main = record.main_thread() || options.main_thread_required;
            let outcome = match record.callable::<ActionFn<C>>() {
                Some(callable) => {
                    invoke(
                        self.main_thread.as_ref(),
                        on_main,
                        ctx.handler_scope(ctx.token()),
                        move |token| callable(command, token),
                    )
                    .await
                }
                None => HandlerOutcome::Failed(anyhow::anyhow!(
                    "handler installed on {key} has an unexpected signature"
                )),
            };
            report.record(&key, &record, &outcome);
            match outcome {
                HandlerOutcome::Failed(_) if options.error_policy == ErrorPolicy::StopOnError => {
                    report.stop(DispatchOutcome::Faulted)
                }
                HandlerOutcome::Skipped => report.stop(DispatchOutcome::Cancelled),
                ref o if o.is_cancellation()
                    && (options.cancellation_policy == CancellationPolicy::CancelAll
                        || ctx.is_cancelled()) =>
                {
                    report.stop(DispatchOutcome::Cancelled)
                }
                _ => {}
            }
        }
        report.elapsed = ctx.elapsed();
        debug!(
            channel = %key,
            outcome = ?report.outcome,
            "Command executed in {:?}",
            report.elapsed
        );
        self.metrics.dispatched::<C>("command", &report);
        Ok(report)
    }

    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        let types: Vec<TypeId> = self.slots.iter().map(|slot| *slot.key()).collect();
        let removed = types
            .into_iter()
            .filter_map(|type_id| self.slots.remove(&type_id))
            .map(|(_, (_, record))| recycle(&self.pool, record))
            .count();
        debug!(removed, "Command engine disposed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{SharedMessageBus, pool::PoolConfig, BusConfig};
    use std::sync::atomic::AtomicUsize;

    struct Reload {
        delta: usize,
    }

    fn counting(bus: &SharedMessageBus, counter: &Arc<AtomicUsize>, scale: usize) -> HandlerId {
        let counter = Arc::clone(counter);
        bus.commands()
            .subscribe(SubscribeOptions::default(), move |cmd: Reload, _| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(cmd.delta * scale, Ordering::SeqCst);
                    Ok(())
                }
            })
            .unwrap()
    }

    #[tokio::test]
    async fn replacement_recycles_the_previous_handler() {
        let bus = SharedMessageBus::with_config(BusConfig {
            pool: PoolConfig {
                capacity: 4,
                prewarm: 0,
            },
            ..Default::default()
        });
        let counter = Arc::new(AtomicUsize::new(0));
        let first = counting(&bus, &counter, 1);
        assert_eq!(bus.pool().free_count(), 0);
        let second = counting(&bus, &counter, 100);
        assert_ne!(first, second);
        assert_eq!(bus.pool().free_count(), 1);
        assert_eq!(bus.pool().created_count(), 2);

        let report = bus
            .execute(Reload { delta: 1 }, &CancellationToken::new())
            .await
            .unwrap();
        assert!(report.is_success());
        assert_eq!(counter.load(Ordering::SeqCst), 100);

        assert!(!bus.commands().unsubscribe_id::<Reload>(first));
        assert!(bus.commands().unsubscribe_id::<Reload>(second));
        assert!(!bus.commands().has_handler::<Reload>());
        assert_eq!(bus.pool().free_count(), 2);
    }

    #[test_log::test(tokio::test)]
    async fn missing_handler_is_not_an_error() {
        let bus = SharedMessageBus::new();
        let report = bus
            .execute(Reload { delta: 1 }, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.outcome, DispatchOutcome::NoHandler);
    }

    #[tokio::test]
    async fn failure_policy_decides_the_outcome() {
        let bus = SharedMessageBus::new();
        bus.commands()
            .subscribe(SubscribeOptions::default(), |_: Reload, _| async {
                Err(anyhow::anyhow!("cannot reload"))
            })
            .unwrap();
        let token = CancellationToken::new();
        let report = bus.execute(Reload { delta: 0 }, &token).await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.outcome, DispatchOutcome::Completed);
        assert!(!report.is_success());

        let strict = ExecutionOptions::default().with_error_policy(ErrorPolicy::StopOnError);
        let report = bus
            .commands()
            .execute_with(Reload { delta: 0 }, &strict, &token)
            .await
            .unwrap();
        assert_eq!(report.outcome, DispatchOutcome::Faulted);

        token.cancel();
        let report = bus.execute(Reload { delta: 0 }, &token).await.unwrap();
        assert_eq!(report.outcome, DispatchOutcome::Cancelled);
        assert_eq!(report.failed, 0);
    }

    #[tokio::test]
    async fn owner_removal_only_touches_owned_slots() {
        let bus = SharedMessageBus::new();
        let owner = TypeKey::of::<Reload>();
        bus.commands()
            .subscribe(SubscribeOptions::default().owned_by(owner), |_: Reload, _| async {
                Ok(())
            })
            .unwrap();
        bus.commands()
            .subscribe(SubscribeOptions::default(), |_: u8, _| async { Ok(()) })
            .unwrap();
        assert_eq!(bus.commands().unsubscribe_owner(owner), 1);
        assert!(bus.commands().has_handler::<u8>());
        assert!(bus.commands().handler::<u8>().unwrap().owner.is_none());
        assert!(!bus.commands().unsubscribe::<Reload>());
    }
}
