//! Bounded, thread-safe object pool.
//!
//! User callbacks (factory, reset, disposer) always run outside the pool lock.

use std::{
    panic::{AssertUnwindSafe, catch_unwind},
    sync::atomic::{AtomicUsize, Ordering},
};

use anyhow::Result;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{trace, warn};

use crate::{bus::BusError, utils::logger::panic_message};

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum number of free items kept around
    pub capacity: usize,
    /// Items constructed up front
    pub prewarm: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            capacity: 256,
            prewarm: 0,
        }
    }
}

type Factory<T> = Box<dyn Fn() -> T + Send + Sync>;
type Reset<T> = Box<dyn Fn(&mut T) + Send + Sync>;
type Disposer<T> = Box<dyn Fn(T) -> Result<()> + Send + Sync>;

struct PoolState<T> {
    free: Vec<T>,
    disposed: bool,
}

pub struct Pool<T> {
    config: PoolConfig,
    factory: Factory<T>,
    reset: Reset<T>,
    disposer: Option<Disposer<T>>,
    state: Mutex<PoolState<T>>,
    created: AtomicUsize,
}

impl<T> Pool<T> {
    pub fn new(
        config: PoolConfig,
        factory: impl Fn() -> T + Send + Sync + 'static,
        reset: impl Fn(&mut T) + Send + Sync + 'static,
    ) -> Self {
        let pool = Pool {
            config,
            factory: Box::new(factory),
            reset: Box::new(reset),
            disposer: None,
            state: Mutex::new(PoolState {
                free: Vec::new(),
                disposed: false,
            }),
            created: AtomicUsize::new(0),
        };
        pool.prewarm(config.prewarm);
        pool
    }

    /// Hook run on items leaving the pool for good (overflow or pool disposal).
    pub fn with_disposer(
        mut self,
        disposer: impl Fn(T) -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.disposer = Some(Box::new(disposer));
        self
    }

    pub fn config(&self) -> PoolConfig {
        self.config
    }

    /// Returns a recycled item, or a freshly built one when the free list is empty.
    pub fn acquire(&self) -> Result<T, BusError> {
        {
            let mut state = self.state.lock();
            if state.disposed {
                return Err(BusError::Disposed {
                    component: "handler pool",
                });
            }
            if let Some(item) = state.free.pop() {
                return Ok(item);
            }
        }
        Ok(self.create())
    }

    /// Resets `item` and keeps it if there is room, disposes it otherwise.
    pub fn release(&self, mut item: T) {
        (self.reset)(&mut item);
        let overflow = {
            let mut state = self.state.lock();
            if !state.disposed && state.free.len() < self.config.capacity {
                state.free.push(item);
                None
            } else {
                Some(item)
            }
        };
        if let Some(item) = overflow {
            trace!("Pool full or disposed, disposing released item");
            self.dispose_item(item);
        }
    }

    /// Builds up to `count` items, never past capacity.
    pub fn prewarm(&self, count: usize) {
        let missing = {
            let state = self.state.lock();
            if state.disposed {
                return;
            }
            count.min(self.config.capacity.saturating_sub(state.free.len()))
        };
        let items: Vec<T> = (0..missing).map(|_| self.create()).collect();
        let overflow = {
            let mut state = self.state.lock();
            let room = if state.disposed {
                0
            } else {
                self.config.capacity.saturating_sub(state.free.len())
            };
            let mut items = items;
            let overflow = items.split_off(room.min(items.len()));
            state.free.extend(items);
            overflow
        };
        for item in overflow {
            self.dispose_item(item);
        }
    }

    /// Drains the free list through the disposer. Failing items are logged and skipped.
    pub fn dispose(&self) {
        let drained = {
            let mut state = self.state.lock();
            if state.disposed {
                return;
            }
            state.disposed = true;
            std::mem::take(&mut state.free)
        };
        for item in drained {
            self.dispose_item(item);
        }
    }

    pub fn free_count(&self) -> usize {
        self.state.lock().free.len()
    }

    pub fn created_count(&self) -> usize {
        self.created.load(Ordering::Relaxed)
    }

    pub fn is_disposed(&self) -> bool {
        self.state.lock().disposed
    }

    fn create(&self) -> T {
        self.created.fetch_add(1, Ordering::Relaxed);
        (self.factory)()
    }

    fn dispose_item(&self, item: T) {
        let Some(disposer) = &self.disposer else {
            return;
        };
        match catch_unwind(AssertUnwindSafe(|| disposer(item))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Error while disposing pooled item: {:#}", e),
            Err(panic) => warn!(
                "Panic while disposing pooled item: {}",
                panic_message(panic.as_ref())
            ),
        }
    }
}
