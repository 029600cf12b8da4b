//! Single designated execution context for handlers that need main-thread affinity.
//!
//! Jobs posted to the context run one at a time, in posting order. Code already
//! running on the context runs inline instead of posting to itself.

use std::future::Future;

use futures::future::BoxFuture;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

tokio::task_local! {
    static ON_MAIN_THREAD: ();
}

type Job = BoxFuture<'static, ()>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("main-thread context is not running")]
pub struct MainThreadClosed;

#[derive(Clone, Debug)]
pub struct MainThreadHandle {
    jobs: mpsc::UnboundedSender<Job>,
}

pub struct MainThreadContext {
    handle: MainThreadHandle,
    stop: CancellationToken,
    pump: JoinHandle<()>,
}

impl MainThreadContext {
    /// Starts the context on the current tokio runtime.
    pub fn spawn() -> Self {
        let (jobs, mut receiver) = mpsc::unbounded_channel::<Job>();
        let stop = CancellationToken::new();
        let pump_stop = stop.clone();
        let pump = tokio::spawn(ON_MAIN_THREAD.scope((), async move {
            loop {
                tokio::select! {
                    biased;
                    job = receiver.recv() => match job {
                        Some(job) => job.await,
                        None => break,
                    },
                    _ = pump_stop.cancelled() => {
                        receiver.close();
                        while let Some(job) = receiver.recv().await {
                            job.await;
                        }
                        break;
                    }
                }
            }
            debug!("Main-thread context drained");
        }));
        MainThreadContext {
            handle: MainThreadHandle { jobs },
            stop,
            pump,
        }
    }

    pub fn handle(&self) -> MainThreadHandle {
        self.handle.clone()
    }

    /// Stops accepting jobs; queued jobs still run before the pump exits.
    pub async fn shutdown(mut self) {
        self.stop.cancel();
        if let Err(e) = (&mut self.pump).await {
            tracing::error!("Main-thread context exited abnormally: {}", e);
        }
        info!("Main-thread context stopped");
    }
}

impl Drop for MainThreadContext {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

/// Whether the caller is running on the main-thread context.
pub fn is_main_thread() -> bool {
    ON_MAIN_THREAD.try_with(|_| ()).is_ok()
}

impl MainThreadHandle {
    /// Runs `fut` on the main-thread context and waits for its output.
    pub async fn run<T, F>(&self, fut: F) -> Result<T, MainThreadClosed>
    where
        T: Send + 'static,
        F: Future<Output = T> + Send + 'static,
    {
        if is_main_thread() {
            return Ok(fut.await);
        }
        let (sender, receiver) = oneshot::channel();
        self.jobs
            .send(Box::pin(async move {
                _ = sender.send(fut.await);
            }))
            .map_err(|_| MainThreadClosed)?;
        receiver.await.map_err(|_| MainThreadClosed)
    }

    pub fn is_closed(&self) -> bool {
        self.jobs.is_closed()
    }
}
