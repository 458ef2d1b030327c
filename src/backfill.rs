use crate::error::Result;
use crate::ingestion::{PollStep, StepOutcome};
use crate::repository::{BlockRepository, Database, TransferRepository};
use crate::rpc::ChainClient;
use alloy_primitives::B256;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

const BACKFILL_BATCH_SIZE: usize = 100;

/// Stamps transfers with the timestamp of their block.
pub struct DateBackfill {
    db: Database,
    chain: Arc<dyn ChainClient>,
    batch_size: usize,
}

impl DateBackfill {
    pub fn new(db: Database, chain: Arc<dyn ChainClient>) -> Self {
        Self {
            db,
            chain,
            batch_size: BACKFILL_BATCH_SIZE,
        }
    }

    /// Fills in dates for up to one batch of undated transfers. Returns the
    /// number of transfers updated.
    pub async fn backfill(&self) -> Result<usize> {
        let db = self.db.clone();
        let batch_size = self.batch_size;
        let (pending, mut timestamps) = tokio::task::spawn_blocking(move || {
            let conn = db.lock();
            let pending = TransferRepository::new(&conn).get_without_date(batch_size)?;
            let blocks = BlockRepository::new(&conn);

            let mut timestamps: BTreeMap<u64, Option<u64>> = BTreeMap::new();
            for (_, height) in &pending {
                if !timestamps.contains_key(height) {
                    timestamps.insert(*height, blocks.get_timestamp(*height)?);
                }
            }
            Ok::<_, crate::error::IndexerError>((pending, timestamps))
        })
        .await??;

        if pending.is_empty() {
            return Ok(0);
        }

        for (height, timestamp) in timestamps.iter_mut().filter(|(_, ts)| ts.is_none()) {
            match self.chain.get_block(*height, false).await? {
                Some(block) => *timestamp = Some(block.timestamp),
                None => warn!(height, "no block for undated transfers"),
            }
        }

        let dated: Vec<(B256, u64)> = pending
            .into_iter()
            .filter_map(|(id, height)| {
                timestamps
                    .get(&height)
                    .copied()
                    .flatten()
                    .map(|ts| (id, ts))
            })
            .collect();

        let db = self.db.clone();
        let updated = tokio::task::spawn_blocking(move || {
            let conn = db.lock();
            let tx = conn.unchecked_transaction()?;
            let repo = TransferRepository::new(&tx);
            let mut updated = 0;
            for (id, date) in &dated {
                updated += repo.set_date(id, *date)?;
            }
            tx.commit()?;
            Ok::<_, crate::error::IndexerError>(updated)
        })
        .await??;

        debug!(updated, "backfilled transfer dates");
        Ok(updated)
    }
}

#[async_trait]
impl PollStep for DateBackfill {
    fn name(&self) -> &'static str {
        "dates"
    }

    async fn execute(&self) -> Result<StepOutcome> {
        Ok(match self.backfill().await? {
            0 => StepOutcome::Idle,
            n => StepOutcome::Progress(n),
        })
    }
}
