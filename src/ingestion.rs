//! The polling pipeline: a fixed sequence of steps run once per cycle.

use crate::bus::{LedgerService, StateUpdateService};
use crate::error::Result;
use alloy_primitives::Address;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Idle,
    /// Number of units the step handled (blocks, transfers, holders).
    Progress(usize),
}

#[async_trait]
pub trait PollStep: Send + Sync {
    fn name(&self) -> &'static str;

    async fn execute(&self) -> Result<StepOutcome>;
}

/// Pulls the next state update after the stored tip and applies it.
pub struct BlockIngester {
    service: Arc<dyn StateUpdateService>,
    ledger: Arc<dyn LedgerService>,
    token: Option<Address>,
    start_height: u64,
}

impl BlockIngester {
    pub fn new(
        service: Arc<dyn StateUpdateService>,
        ledger: Arc<dyn LedgerService>,
        token: Option<Address>,
        start_height: u64,
    ) -> Self {
        Self {
            service,
            ledger,
            token,
            start_height,
        }
    }
}

#[async_trait]
impl PollStep for BlockIngester {
    fn name(&self) -> &'static str {
        "blocks"
    }

    async fn execute(&self) -> Result<StepOutcome> {
        let tip = self.ledger.get_latest_block().await?;
        let since = tip.map_or(self.start_height, |b| b.height);
        let update = self
            .service
            .get_state_update(since, self.token, tip.map(|b| b.hash))
            .await?;

        if update.is_empty() {
            return Ok(StepOutcome::Idle);
        }

        let summary = self.ledger.apply_state(update).await?;
        if let Some(latest) = summary.latest {
            info!(
                "Indexed up to block {} ({} blocks, {} transfers)",
                latest.height, summary.blocks, summary.transfers
            );
        }
        Ok(StepOutcome::Progress(
            summary.blocks + summary.healed.map_or(0, |h| h.blocks),
        ))
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CycleReport {
    pub progressed: usize,
    pub failed: usize,
}

pub struct IngestionLoop {
    steps: Vec<Box<dyn PollStep>>,
    poll_interval: Duration,
    error_backoff: Duration,
    cancel: CancellationToken,
}

impl IngestionLoop {
    pub fn new(
        steps: Vec<Box<dyn PollStep>>,
        poll_interval: Duration,
        error_backoff: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            steps,
            poll_interval,
            error_backoff,
            cancel,
        }
    }

    /// Runs cycles until cancelled. A cancelled loop finishes the step in flight.
    pub async fn run(&self) {
        info!(
            "Starting ingestion loop with steps: {}",
            self.steps.iter().map(|s| s.name()).collect::<Vec<_>>().join(", ")
        );

        while !self.cancel.is_cancelled() {
            self.run_cycle().await;
            if !self.pause(self.poll_interval).await {
                break;
            }
        }

        info!("Ingestion loop stopped");
    }

    /// Runs every step once, in order. Errors are logged and the cycle moves on.
    pub async fn run_cycle(&self) -> CycleReport {
        let mut report = CycleReport::default();

        for step in &self.steps {
            if self.cancel.is_cancelled() {
                break;
            }

            match step.execute().await {
                Ok(StepOutcome::Progress(units)) => {
                    debug!(step = step.name(), units, "step made progress");
                    report.progressed += 1;
                }
                Ok(StepOutcome::Idle) => {}
                Err(e) => {
                    error!(
                        step = step.name(),
                        transient = e.is_transient(),
                        "Step failed: {}",
                        e
                    );
                    report.failed += 1;
                    if !self.pause(self.error_backoff).await {
                        break;
                    }
                }
            }
        }

        report
    }

    /// Sleeps for `duration`; false when cancelled meanwhile.
    async fn pause(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }
}
