//! Scheduling loop: runs sweeps on a fixed cadence until cancelled.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::{LoopVariant, SchedulerConfig};
use crate::error::PipelineError;
use crate::pipeline::director::{Director, SweepSummary};

pub struct Scheduler {
    director: Arc<Director>,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(director: Arc<Director>, config: SchedulerConfig) -> Self {
        Self {
            director,
            config: config.with_floors(),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Wait the startup delay, then sweep and pause until `cancel` fires.
    ///
    /// A cancelled wait returns at once; a sweep in progress is allowed to
    /// finish first. Returns the number of sweeps run.
    pub async fn run(&self, cancel: CancellationToken) -> u64 {
        info!(
            variant = ?self.config.variant,
            startup_delay_secs = self.config.startup_delay.as_secs_f64(),
            throttle_secs = self.config.throttle.as_secs_f64(),
            "Scheduler starting"
        );

        let mut sweeps = 0u64;
        if !wait(self.config.startup_delay, &cancel).await {
            info!("Scheduler cancelled during startup delay");
            return sweeps;
        }

        loop {
            match self.sweep(&cancel).await {
                Ok(summary) if summary.cancelled => {
                    info!("Sweep interrupted by shutdown");
                }
                Ok(_) => {}
                Err(e) => error!(error = %e, "Sweep failed"),
            }
            sweeps += 1;

            if cancel.is_cancelled() || !wait(self.config.throttle, &cancel).await {
                break;
            }
        }

        info!(sweeps, "Scheduler stopped");
        sweeps
    }

    async fn sweep(&self, cancel: &CancellationToken) -> Result<SweepSummary, PipelineError> {
        match self.config.variant {
            LoopVariant::Pipeline => self.director.run_sweep(cancel).await,
            LoopVariant::ProcessOnly => self.director.process_only(cancel).await,
        }
    }
}

/// Sleep for `duration`. Returns false if cancelled first.
async fn wait(duration: std::time::Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

/// Spawn the scheduling loop as a background task.
pub fn spawn_scheduler(
    scheduler: Arc<Scheduler>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<u64> {
    tokio::spawn(async move { scheduler.run(cancel).await })
}
