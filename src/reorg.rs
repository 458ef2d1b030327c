//! Detection of invalidated blocks and the poll step that heals them.

use crate::config::Config;
use crate::error::Result;
use crate::ingestion::{PollStep, StepOutcome};
use crate::repository::SqliteLedger;
use crate::rpc::ChainClient;
use alloy_primitives::B256;
use async_trait::async_trait;
use futures::stream::{self, StreamExt, TryStreamExt};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

pub struct ReorgDetector {
    chain: Arc<dyn ChainClient>,
    ledger: SqliteLedger,
    lookup_distance: u64,
    concurrency: usize,
}

impl ReorgDetector {
    pub fn new(chain: Arc<dyn ChainClient>, ledger: SqliteLedger, config: &Config) -> Self {
        Self {
            chain,
            ledger,
            lookup_distance: config.heal_lookup_distance,
            concurrency: config.tx_fetch_concurrency,
        }
    }

    /// True when the chain no longer has `hash` at `height`.
    pub async fn check_tip(&self, height: u64, hash: B256) -> Result<bool> {
        let block = self.chain.get_block(height, false).await?;
        Ok(block.is_none_or(|block| block.hash != hash))
    }

    /// Lowest recently indexed height whose block is no longer canonical.
    ///
    /// Only the last `lookup_distance` indexed blocks are checked. When the
    /// indexer trails the chain tip by more than that window the check is
    /// skipped; reorgs deeper than the window go unnoticed.
    pub async fn find_divergence(&self) -> Result<Option<u64>> {
        let recent = self.ledger.recent_blocks(self.lookup_distance).await?;
        let Some(oldest) = recent.last() else {
            return Ok(None);
        };

        let tip = self.chain.get_height().await?;
        if tip.saturating_sub(self.lookup_distance) > oldest.height {
            debug!(
                tip,
                oldest = oldest.height,
                "indexer is behind the reorg window, skipping check"
            );
            return Ok(None);
        }

        let diverged: Vec<Option<u64>> = stream::iter(recent.iter().copied())
            .map(|block| async move {
                let diverged = self.check_tip(block.height, block.hash).await?;
                Ok::<_, crate::error::IndexerError>(diverged.then_some(block.height))
            })
            .buffer_unordered(self.concurrency)
            .try_collect()
            .await?;

        Ok(diverged.into_iter().flatten().min())
    }
}

/// Poll step that archives everything above a divergence point.
pub struct Healer {
    detector: Arc<ReorgDetector>,
    ledger: SqliteLedger,
    force_heal_to: Mutex<Option<u64>>,
}

impl Healer {
    pub fn new(
        detector: Arc<ReorgDetector>,
        ledger: SqliteLedger,
        force_heal_to: Option<u64>,
    ) -> Self {
        Self {
            detector,
            ledger,
            force_heal_to: Mutex::new(force_heal_to),
        }
    }

    fn forced_height(&self) -> Option<u64> {
        *self.force_heal_to.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn clear_forced_height(&self) {
        *self.force_heal_to.lock().unwrap_or_else(|p| p.into_inner()) = None;
    }
}

#[async_trait]
impl PollStep for Healer {
    fn name(&self) -> &'static str {
        "healer"
    }

    async fn execute(&self) -> Result<StepOutcome> {
        if let Some(height) = self.forced_height() {
            warn!(height, "forced heal requested");
            let summary = self.ledger.heal_from(height).await?;
            self.clear_forced_height();
            return Ok(StepOutcome::Progress(summary.blocks));
        }

        match self.detector.find_divergence().await? {
            Some(height) => {
                warn!(height, "reorg detected, healing");
                let summary = self.ledger.heal_from(height).await?;
                info!(
                    "Healed from block {}: {} blocks, {} transfers archived",
                    height, summary.blocks, summary.transfers
                );
                Ok(StepOutcome::Progress(summary.blocks))
            }
            None => Ok(StepOutcome::Idle),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;
    use crate::repository::{Database, StateUpdate};
    use crate::repository::models::Block;
    use crate::test_utils::{MockChain, make_block, transfer};

    async fn indexed(
        chain: &MockChain,
        ledger: &SqliteLedger,
        heights: std::ops::RangeInclusive<u64>,
    ) {
        let mut blocks: Vec<Block> = Vec::new();
        for height in heights {
            let chain_block = chain.block_at(height).unwrap();
            blocks.push(make_block(height, 0, chain_block.parent_hash, &[]));
        }
        ledger
            .apply_state(StateUpdate {
                incoming_blocks: blocks,
                reversed_block_hashes: vec![],
            })
            .await
            .unwrap();
    }

    fn setup(config: &Config) -> (Arc<MockChain>, SqliteLedger, ReorgDetector) {
        let chain = Arc::new(MockChain::new());
        let ledger = SqliteLedger::from_config(Database::in_memory().unwrap(), config);
        let detector = ReorgDetector::new(chain.clone(), ledger.clone(), config);
        (chain, ledger, detector)
    }

    #[tokio::test]
    async fn finds_lowest_diverged_height() {
        let config = test_config();
        let (chain, ledger, detector) = setup(&config);
        for _ in 0..5 {
            chain.push_block(0, &[], 0);
        }
        indexed(&chain, &ledger, 1..=5).await;
        assert_eq!(detector.find_divergence().await.unwrap(), None);

        chain.rewind_to(3);
        chain.push_block(1, &[transfer(0, 1, 1)], 0);
        chain.push_block(1, &[], 0);
        chain.push_block(1, &[], 0);

        assert_eq!(detector.find_divergence().await.unwrap(), Some(3));
    }

    #[tokio::test]
    async fn missing_blocks_count_as_diverged() {
        let config = test_config();
        let (chain, ledger, detector) = setup(&config);
        for _ in 0..3 {
            chain.push_block(0, &[], 0);
        }
        indexed(&chain, &ledger, 1..=3).await;
        chain.rewind_to(2);

        assert_eq!(detector.find_divergence().await.unwrap(), Some(2));
        assert!(detector.check_tip(3, B256::ZERO).await.unwrap());
    }

    #[tokio::test]
    async fn skips_check_when_far_behind() {
        let mut config = test_config();
        config.heal_lookup_distance = 2;
        let (chain, ledger, detector) = setup(&config);
        for _ in 0..10 {
            chain.push_block(0, &[], 0);
        }
        indexed(&chain, &ledger, 1..=3).await;
        chain.rewind_to(2);
        for _ in 0..10 {
            chain.push_block(1, &[], 0);
        }

        assert_eq!(detector.find_divergence().await.unwrap(), None);
    }

    #[tokio::test]
    async fn forced_heal_runs_once() {
        let config = test_config();
        let (chain, ledger, detector) = setup(&config);
        for _ in 0..4 {
            chain.push_block(0, &[], 0);
        }
        indexed(&chain, &ledger, 1..=4).await;

        let healer = Healer::new(Arc::new(detector), ledger.clone(), Some(3));
        assert_eq!(healer.execute().await.unwrap(), StepOutcome::Progress(2));
        assert_eq!(ledger.get_latest_block().await.unwrap().unwrap().height, 2);

        // chain still matches, nothing left to heal
        assert_eq!(healer.execute().await.unwrap(), StepOutcome::Idle);
        assert_eq!(ledger.get_latest_block().await.unwrap().unwrap().height, 2);
    }
}
