//! Pipeline director: one sweep over the store.
//!
//! A sweep runs three phases in order: process ready messages, retry failed
//! ones, archive expired ones. Failures are isolated per message; only a
//! failed fetch aborts the sweep.

use std::collections::HashSet;
use std::sync::Arc;

use futures::StreamExt;
use futures::stream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::model::{Message, MessageId};
use crate::pipeline::dispatcher::Dispatcher;
use crate::store::MessageStore;

/// Counters for one dispatch phase.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PhaseSummary {
    /// Messages the fetch returned for this phase (after de-duplication).
    pub candidates: usize,
    pub sent: usize,
    pub failed: usize,
    /// Per-message store or state errors.
    pub errors: usize,
    /// Not started because the sweep was cancelled.
    pub skipped: usize,
}

impl PhaseSummary {
    fn merge(&mut self, result: &Result<bool, PipelineError>) {
        match result {
            Ok(true) => self.sent += 1,
            Ok(false) => self.failed += 1,
            Err(PipelineError::Cancelled { .. }) => self.skipped += 1,
            Err(_) => self.errors += 1,
        }
    }
}

/// Counters for one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepSummary {
    pub process: PhaseSummary,
    pub retry: PhaseSummary,
    pub archived: usize,
    pub archive_errors: usize,
    /// Cancellation was observed and later work was not started.
    pub cancelled: bool,
}

pub struct Director {
    messages: Arc<dyn MessageStore>,
    dispatcher: Arc<Dispatcher>,
    config: PipelineConfig,
}

impl Director {
    pub fn new(
        messages: Arc<dyn MessageStore>,
        dispatcher: Arc<Dispatcher>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            messages,
            dispatcher,
            config: config.with_floors(),
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Full sweep: process, retry, archive.
    pub async fn run_sweep(&self, cancel: &CancellationToken) -> Result<SweepSummary, PipelineError> {
        let mut summary = SweepSummary::default();
        let mut dispatched = HashSet::new();

        let ready = self.messages.find_ready_to_process().await?;
        summary.process = self.dispatch_all(ready, &mut dispatched, cancel).await;
        if cancel.is_cancelled() {
            summary.cancelled = true;
            return Ok(summary);
        }

        let retry = self
            .messages
            .find_ready_to_retry(self.config.max_error_count)
            .await?;
        summary.retry = self.dispatch_all(retry, &mut dispatched, cancel).await;
        if cancel.is_cancelled() {
            summary.cancelled = true;
            return Ok(summary);
        }

        let expired = self
            .messages
            .find_ready_to_archive(self.config.max_days_to_live)
            .await?;
        for message in expired {
            if cancel.is_cancelled() {
                summary.cancelled = true;
                break;
            }
            match self.messages.archive(&message, &self.config.system_user).await {
                Ok(()) => summary.archived += 1,
                Err(e) => {
                    summary.archive_errors += 1;
                    error!(
                        message_id = ?message.id,
                        message_key = %message.message_key,
                        error = %e,
                        "Failed to archive message"
                    );
                }
            }
        }

        info!(
            processed = summary.process.candidates,
            retried = summary.retry.candidates,
            sent = summary.process.sent + summary.retry.sent,
            failed = summary.process.failed + summary.retry.failed,
            archived = summary.archived,
            "Sweep complete"
        );
        Ok(summary)
    }

    /// Processing-only sweep: dispatch ready messages, nothing else.
    pub async fn process_only(
        &self,
        cancel: &CancellationToken,
    ) -> Result<SweepSummary, PipelineError> {
        let mut dispatched = HashSet::new();
        let ready = self.messages.find_ready_to_process().await?;
        let process = self.dispatch_all(ready, &mut dispatched, cancel).await;
        debug!(
            candidates = process.candidates,
            sent = process.sent,
            failed = process.failed,
            "Processing sweep complete"
        );
        Ok(SweepSummary {
            process,
            cancelled: cancel.is_cancelled(),
            ..SweepSummary::default()
        })
    }

    /// Dispatch `messages` with bounded concurrency, skipping any already
    /// dispatched in this sweep. Results are merged in fetch order.
    async fn dispatch_all(
        &self,
        messages: Vec<Message>,
        dispatched: &mut HashSet<MessageId>,
        cancel: &CancellationToken,
    ) -> PhaseSummary {
        let batch: Vec<Message> = messages
            .into_iter()
            .filter(|m| match m.id {
                Some(id) if dispatched.insert(id) => true,
                _ => {
                    debug!(message_key = %m.message_key, "Already dispatched this sweep, skipping");
                    false
                }
            })
            .collect();

        let mut summary = PhaseSummary {
            candidates: batch.len(),
            ..PhaseSummary::default()
        };

        let results: Vec<Result<bool, PipelineError>> = stream::iter(batch)
            .map(|message| async move {
                let result = self
                    .dispatcher
                    .dispatch(&message, cancel)
                    .await
                    .map(|report| report.is_sent());
                match &result {
                    Ok(_) | Err(PipelineError::Cancelled { .. }) => {}
                    Err(e) => error!(
                        message_id = ?message.id,
                        message_key = %message.message_key,
                        error = %e,
                        "Dispatch failed"
                    ),
                }
                result
            })
            .buffered(self.config.max_concurrent_dispatches)
            .collect()
            .await;

        for result in &results {
            summary.merge(result);
        }
        summary
    }
}
