//! Execution policy and cancellation composition for a single dispatch.
//!
//! Every dispatch owns one [`ExecutionContext`]. Its token is a child of the
//! caller's token and is cancelled once the overall timeout elapses. Each
//! handler then runs inside a [`HandlerScope`], a child of the dispatch token
//! (or of a sibling stop signal) carrying the per-handler deadline.

use std::{future::Future, panic::AssertUnwindSafe, time::Duration};

use anyhow::anyhow;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_with::{DurationMilliSeconds, serde_as};
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;

use crate::utils::logger::panic_message;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ConcurrencyMode {
    /// Handlers run one after the other, in priority order
    #[default]
    Sequential,
    /// Handlers run as independent tasks
    Concurrent,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ErrorPolicy {
    /// A failing handler is logged and the dispatch moves on
    #[default]
    Continue,
    /// The first failing handler stops the dispatch and cancels its siblings
    StopOnError,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CancellationPolicy {
    /// A cancelled or timed out handler is skipped, the others still run
    #[default]
    SkipCurrent,
    /// A cancelled or timed out handler aborts the remaining fan-out
    CancelAll,
}

#[serde_as]
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct ExecutionOptions {
    /// Hand every handler off to the main-thread context
    pub main_thread_required: bool,
    pub concurrency: ConcurrencyMode,
    /// Overall timeout of one dispatch
    #[serde_as(as = "Option<DurationMilliSeconds>")]
    pub timeout: Option<Duration>,
    /// Timeout of each handler invocation
    #[serde_as(as = "Option<DurationMilliSeconds>")]
    pub handler_timeout: Option<Duration>,
    pub error_policy: ErrorPolicy,
    pub cancellation_policy: CancellationPolicy,
    /// Queries only
    pub cache_enabled: bool,
    /// Queries only. Zero disables caching altogether.
    #[serde_as(as = "DurationMilliSeconds")]
    pub cache_ttl: Duration,
    /// Queries only. Sizes the engine cache when the bus is built; per-call
    /// options cannot resize it.
    pub cache_capacity: usize,
    /// Queries only: collapse concurrent identical queries into one execution
    pub dedup_enabled: bool,
}

impl Default for ExecutionOptions {
    fn default() -> Self {
        Self {
            main_thread_required: false,
            concurrency: ConcurrencyMode::Sequential,
            timeout: None,
            handler_timeout: None,
            error_policy: ErrorPolicy::Continue,
            cancellation_policy: CancellationPolicy::SkipCurrent,
            cache_enabled: false,
            cache_ttl: Duration::ZERO,
            cache_capacity: 1024,
            dedup_enabled: true,
        }
    }
}

impl ExecutionOptions {
    pub fn concurrent() -> Self {
        Self::default().with_concurrency(ConcurrencyMode::Concurrent)
    }

    pub fn with_concurrency(mut self, concurrency: ConcurrencyMode) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_handler_timeout(mut self, timeout: Duration) -> Self {
        self.handler_timeout = Some(timeout);
        self
    }

    pub fn with_error_policy(mut self, policy: ErrorPolicy) -> Self {
        self.error_policy = policy;
        self
    }

    pub fn with_cancellation_policy(mut self, policy: CancellationPolicy) -> Self {
        self.cancellation_policy = policy;
        self
    }

    pub fn with_cache(mut self, ttl: Duration) -> Self {
        self.cache_enabled = true;
        self.cache_ttl = ttl;
        self
    }

    pub fn without_cache(mut self) -> Self {
        self.cache_enabled = false;
        self
    }

    pub fn with_cache_capacity(mut self, capacity: usize) -> Self {
        self.cache_capacity = capacity;
        self
    }

    pub fn with_dedup(mut self, enabled: bool) -> Self {
        self.dedup_enabled = enabled;
        self
    }

    pub fn on_main_thread(mut self) -> Self {
        self.main_thread_required = true;
        self
    }

    /// Whether query results are read from and written to the cache.
    pub fn caching(&self) -> bool {
        self.cache_enabled && !self.cache_ttl.is_zero()
    }
}

/// Result of one handler invocation.
#[derive(Debug)]
pub enum HandlerOutcome<T> {
    Completed(T),
    Failed(anyhow::Error),
    /// Cancelled while running, by the caller, the overall timeout or a sibling
    Cancelled,
    /// The per-handler timeout elapsed
    TimedOut,
    /// Never invoked, the scope was already cancelled
    Skipped,
}

impl<T> HandlerOutcome<T> {
    pub fn is_cancellation(&self) -> bool {
        matches!(self, HandlerOutcome::Cancelled | HandlerOutcome::TimedOut)
    }
}

pub struct ExecutionContext {
    token: CancellationToken,
    options: ExecutionOptions,
    started: Instant,
    deadline: Option<Instant>,
}

impl ExecutionContext {
    pub fn new(external: &CancellationToken, options: ExecutionOptions) -> Self {
        let started = Instant::now();
        ExecutionContext {
            token: external.child_token(),
            deadline: options.timeout.map(|timeout| started + timeout),
            options,
            started,
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn options(&self) -> &ExecutionOptions {
        &self.options
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Also trips the dispatch token once the overall timeout has elapsed.
    pub fn is_cancelled(&self) -> bool {
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                self.token.cancel();
            }
        }
        self.token.is_cancelled()
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Signal shared by concurrent siblings: tripping it cancels every handler
    /// scope created from it, but not the dispatch itself.
    pub fn stop_signal(&self) -> CancellationToken {
        self.token.child_token()
    }

    /// Scope for one handler invocation, linked to `parent` and bounded by the
    /// per-handler timeout.
    pub fn handler_scope(&self, parent: &CancellationToken) -> HandlerScope {
        HandlerScope {
            token: parent.child_token(),
            deadline: self.options.handler_timeout.map(|t| Instant::now() + t),
            dispatch: self.token.clone(),
            dispatch_deadline: self.deadline,
        }
    }
}

impl Drop for ExecutionContext {
    fn drop(&mut self) {
        // Stray concurrent handlers must not outlive their dispatch
        self.token.cancel();
    }
}

pub struct HandlerScope {
    token: CancellationToken,
    deadline: Option<Instant>,
    dispatch: CancellationToken,
    dispatch_deadline: Option<Instant>,
}

impl HandlerScope {
    /// Token handed to the handler.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Drives `fut` until it completes, its scope is cancelled, or one of the
    /// deadlines passes. Panics are reported as failures.
    pub async fn run<T, F>(self, fut: F) -> HandlerOutcome<T>
    where
        F: Future<Output = anyhow::Result<T>>,
    {
        if self.token.is_cancelled() {
            return HandlerOutcome::Skipped;
        }
        let guarded = AssertUnwindSafe(fut).catch_unwind();
        tokio::select! {
            biased;
            _ = self.token.cancelled() => HandlerOutcome::Cancelled,
            _ = sleep_until_opt(self.dispatch_deadline) => {
                self.dispatch.cancel();
                HandlerOutcome::Cancelled
            }
            _ = sleep_until_opt(self.deadline) => {
                self.token.cancel();
                HandlerOutcome::TimedOut
            }
            res = guarded => match res {
                Ok(Ok(value)) => HandlerOutcome::Completed(value),
                Ok(Err(_)) if self.token.is_cancelled() => HandlerOutcome::Cancelled,
                Ok(Err(e)) => HandlerOutcome::Failed(e),
                Err(panic) => HandlerOutcome::Failed(anyhow!(
                    "handler panicked: {}",
                    panic_message(panic.as_ref())
                )),
            },
        }
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn handler_timeout_only_cancels_the_handler() {
        let external = CancellationToken::new();
        let ctx = ExecutionContext::new(
            &external,
            ExecutionOptions::default().with_handler_timeout(Duration::from_millis(50)),
        );
        let scope = ctx.handler_scope(ctx.token());
        let token = scope.token().clone();
        let outcome = scope
            .run(async move {
                token.cancelled().await;
                anyhow::Ok(())
            })
            .await;
        assert!(matches!(outcome, HandlerOutcome::TimedOut));
        assert!(!ctx.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn overall_timeout_cancels_the_dispatch() {
        let external = CancellationToken::new();
        let ctx = ExecutionContext::new(
            &external,
            ExecutionOptions::default().with_timeout(Duration::from_millis(20)),
        );
        let scope = ctx.handler_scope(ctx.token());
        let outcome = scope
            .run(async {
                tokio::time::sleep(Duration::from_secs(1)).await;
                anyhow::Ok(1)
            })
            .await;
        assert!(matches!(outcome, HandlerOutcome::Cancelled));
        assert!(ctx.is_cancelled());
        assert!(!external.is_cancelled());
    }

    #[tokio::test]
    async fn external_cancellation_skips_and_panics_fail() {
        let external = CancellationToken::new();
        let ctx = ExecutionContext::new(&external, ExecutionOptions::default());
        let outcome = ctx
            .handler_scope(ctx.token())
            .run(async {
                if external.is_cancelled() {
                    return anyhow::Ok(());
                }
                panic!("boom")
            })
            .await;
        assert!(matches!(outcome, HandlerOutcome::Failed(_)));

        external.cancel();
        assert!(ctx.is_cancelled());
        let outcome = ctx
            .handler_scope(ctx.token())
            .run(async { anyhow::Ok(()) })
            .await;
        assert!(matches!(outcome, HandlerOutcome::Skipped));
    }

    #[test]
    fn options_deserialize_with_defaults() {
        let options: ExecutionOptions = serde_json::from_str(
            r#"{"concurrency":"Concurrent","handler_timeout":250,"cache_ttl":5000}"#,
        )
        .unwrap();
        assert_eq!(options.concurrency, ConcurrencyMode::Concurrent);
        assert_eq!(options.handler_timeout, Some(Duration::from_millis(250)));
        assert_eq!(options.timeout, None);
        assert!(!options.caching());
        assert!(options.clone().with_cache(Duration::from_secs(1)).caching());
        assert!(!options.with_cache(Duration::ZERO).caching());
    }
}
