use std::time::Duration;

use tracing::{debug, error};

use crate::bus::{ChannelKey, context::HandlerOutcome, handler::HandlerRecord};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Every handler was offered the message (some may have failed under `Continue`)
    #[default]
    Completed,
    /// Nothing subscribed to the channel
    NoHandler,
    /// Stopped by a failing handler under `StopOnError`
    Faulted,
    /// Stopped by the caller, the overall timeout, or `CancelAll`
    Cancelled,
}

/// Aggregate result of one broadcast or command dispatch.
#[derive(Clone, Debug, Default)]
pub struct DispatchReport {
    pub handlers: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub timed_out: usize,
    pub skipped: usize,
    pub elapsed: Duration,
    pub outcome: DispatchOutcome,
    /// Rendered error of the first failing handler
    pub first_error: Option<String>,
}

impl DispatchReport {
    pub fn no_handler() -> Self {
        DispatchReport {
            outcome: DispatchOutcome::NoHandler,
            ..Default::default()
        }
    }

    pub(crate) fn new(handlers: usize) -> Self {
        DispatchReport {
            handlers,
            ..Default::default()
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome == DispatchOutcome::Completed && self.failed == 0
    }

    /// Counts an outcome and logs it against the handler that produced it.
    pub(crate) fn record(
        &mut self,
        channel: &ChannelKey,
        record: &HandlerRecord,
        outcome: &HandlerOutcome<()>,
    ) {
        match outcome {
            HandlerOutcome::Completed(()) => self.succeeded += 1,
            HandlerOutcome::Failed(e) => {
                error!(
                    channel = %channel,
                    handler = %record.id(),
                    owner = record.origin(),
                    "Handler for {} failed: {:#}",
                    channel,
                    e
                );
                self.failed += 1;
                if self.first_error.is_none() {
                    self.first_error = Some(format!("{e:#}"));
                }
            }
            HandlerOutcome::Cancelled => {
                debug!(channel = %channel, handler = %record.id(), "Handler cancelled");
                self.cancelled += 1;
            }
            HandlerOutcome::TimedOut => {
                debug!(channel = %channel, handler = %record.id(), "Handler timed out");
                self.timed_out += 1;
            }
            HandlerOutcome::Skipped => self.skipped += 1,
        }
    }

    pub(crate) fn skip_remaining(&mut self, count: usize) {
        self.skipped += count;
    }

    pub(crate) fn stop(&mut self, outcome: DispatchOutcome) {
        self.outcome = outcome;
    }
}
