//! Service boundaries between the block producer and the ledger consumer.
//!
//! Both sides exchange serde-serialisable [`StateUpdate`] and [`BlockRef`]
//! values, so a transport can be slotted in behind these traits.

use crate::assembler::BlockService;
use crate::error::Result;
use crate::repository::models::{BlockRef, StateUpdate};
use crate::repository::{ApplySummary, SqliteLedger};
use alloy_primitives::{Address, B256};
use async_trait::async_trait;

#[async_trait]
pub trait StateUpdateService: Send + Sync {
    async fn get_state_update(
        &self,
        since: u64,
        token: Option<Address>,
        known_hash: Option<B256>,
    ) -> Result<StateUpdate>;
}

#[async_trait]
pub trait LedgerService: Send + Sync {
    async fn apply_state(&self, update: StateUpdate) -> Result<ApplySummary>;

    async fn get_latest_block(&self) -> Result<Option<BlockRef>>;
}

#[async_trait]
impl StateUpdateService for BlockService {
    async fn get_state_update(
        &self,
        since: u64,
        token: Option<Address>,
        known_hash: Option<B256>,
    ) -> Result<StateUpdate> {
        BlockService::get_state_update(self, since, token, known_hash).await
    }
}

#[async_trait]
impl LedgerService for SqliteLedger {
    async fn apply_state(&self, update: StateUpdate) -> Result<ApplySummary> {
        SqliteLedger::apply_state(self, update).await
    }

    async fn get_latest_block(&self) -> Result<Option<BlockRef>> {
        SqliteLedger::get_latest_block(self).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::Database;
    use crate::test_utils::{make_chain, transfer};

    #[tokio::test]
    async fn updates_survive_serialisation_between_services() {
        let ledger: Box<dyn LedgerService> =
            Box::new(SqliteLedger::new(Database::in_memory().unwrap(), 10, true));
        let update = StateUpdate {
            incoming_blocks: make_chain(1, 0, &[vec![transfer(0, 1, 42)]]),
            reversed_block_hashes: vec![],
        };

        let wire = serde_json::to_string(&update).unwrap();
        let received: StateUpdate = serde_json::from_str(&wire).unwrap();
        assert_eq!(received, update);

        let summary = ledger.apply_state(received).await.unwrap();
        assert_eq!(summary.transfers, 1);
        assert_eq!(
            ledger.get_latest_block().await.unwrap().map(|b| b.hash),
            Some(update.incoming_blocks[0].hash)
        );
    }
}
