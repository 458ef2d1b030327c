//! Atomic application of state updates and the reorg heal procedure.
//!
//! Every write here runs inside `spawn_blocking` while holding the database
//! lock, so an apply, a heal batch and a holder recomputation never interleave.

use super::models::{self, Block, BlockRef, StateUpdate};
use super::{BlockRepository, Database, HolderRepository, TransactionRepository, TransferRepository};
use crate::config::Config;
use crate::error::{IndexerError, Result};
use alloy_primitives::{Address, B256};
use rusqlite::Connection;
use std::collections::{BTreeSet, HashSet};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ApplySummary {
    pub healed: Option<HealSummary>,
    pub blocks: usize,
    pub transactions: usize,
    pub transfers: usize,
    pub latest: Option<BlockRef>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct HealSummary {
    pub from_height: u64,
    pub transfers: usize,
    pub transactions: usize,
    pub blocks: usize,
    pub affected_addresses: usize,
}

#[derive(Clone)]
pub struct SqliteLedger {
    db: Database,
    heal_batch_size: usize,
    keep_empty_transactions: bool,
}

impl SqliteLedger {
    pub fn new(db: Database, heal_batch_size: usize, keep_empty_transactions: bool) -> Self {
        Self {
            db,
            heal_batch_size: heal_batch_size.max(1),
            keep_empty_transactions,
        }
    }

    pub fn from_config(db: Database, config: &Config) -> Self {
        Self::new(db, config.heal_batch_size, config.keep_empty_transactions)
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Applies reversals first, then the incoming blocks in one SQL transaction.
    ///
    /// Structural validation of the incoming blocks happens before anything is
    /// written; a rejected update leaves the store untouched.
    pub async fn apply_state(&self, update: StateUpdate) -> Result<ApplySummary> {
        validate_blocks(&update.incoming_blocks, self.keep_empty_transactions)?;

        let ledger = self.clone();
        tokio::task::spawn_blocking(move || ledger.apply_blocking(update)).await?
    }

    pub async fn get_latest_block(&self) -> Result<Option<BlockRef>> {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || {
            let conn = db.lock();
            Ok(BlockRepository::new(&conn).get_latest()?)
        })
        .await?
    }

    /// Most recent indexed blocks, newest first.
    pub async fn recent_blocks(&self, limit: u64) -> Result<Vec<BlockRef>> {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || {
            let conn = db.lock();
            Ok(BlockRepository::new(&conn).get_recent(limit)?)
        })
        .await?
    }

    /// Archives every block, transaction and transfer at or above `height`
    /// and flags the affected holders for recomputation.
    pub async fn heal_from(&self, height: u64) -> Result<HealSummary> {
        let ledger = self.clone();
        tokio::task::spawn_blocking(move || {
            let conn = ledger.db.lock();
            ledger.heal_blocking(&conn, height)
        })
        .await?
    }

    fn apply_blocking(&self, update: StateUpdate) -> Result<ApplySummary> {
        let conn = self.db.lock();
        let mut summary = ApplySummary::default();

        if !update.reversed_block_hashes.is_empty() {
            let repo = BlockRepository::new(&conn);
            let mut lowest: Option<u64> = None;
            for hash in &update.reversed_block_hashes {
                let block = repo
                    .get_by_hash(hash)?
                    .ok_or_else(|| IndexerError::NotFound(format!("block {hash:?}")))?;
                lowest = Some(lowest.map_or(block.height, |h| h.min(block.height)));
            }
            if let Some(height) = lowest {
                warn!(height, "reversing blocks");
                summary.healed = Some(self.heal_blocking(&conn, height)?);
            }
        }

        if update.incoming_blocks.is_empty() {
            summary.latest = BlockRepository::new(&conn).get_latest()?;
            return Ok(summary);
        }

        let tx = conn.unchecked_transaction()?;
        check_parent(&tx, &update.incoming_blocks)?;

        let blocks = BlockRepository::new(&tx);
        let transactions = TransactionRepository::new(&tx);
        let transfers = TransferRepository::new(&tx);

        for block in &update.incoming_blocks {
            blocks.insert(block)?;
            for transaction in &block.transactions {
                transactions.insert(transaction)?;
                summary.transfers += transfers.insert_batch(&transaction.transfers)?;
            }
            summary.transactions += block.transactions.len();
        }
        summary.blocks = update.incoming_blocks.len();
        summary.latest = blocks.get_latest()?;
        tx.commit()?;

        debug!(
            blocks = summary.blocks,
            transactions = summary.transactions,
            transfers = summary.transfers,
            "applied state update"
        );
        Ok(summary)
    }

    fn heal_blocking(&self, conn: &Connection, height: u64) -> Result<HealSummary> {
        let archived_at = unix_now();
        let mut summary = HealSummary {
            from_height: height,
            ..Default::default()
        };
        let mut affected_total: HashSet<Address> = HashSet::new();

        loop {
            let tx = conn.unchecked_transaction()?;
            let transfer_repo = TransferRepository::new(&tx);
            let batch = transfer_repo.get_from_height(height, self.heal_batch_size)?;

            if batch.is_empty() {
                summary.transactions +=
                    TransactionRepository::new(&tx).archive_from_height(height, archived_at)?;
                summary.blocks +=
                    BlockRepository::new(&tx).archive_from_height(height, archived_at)?;
                tx.commit()?;
                break;
            }

            let affected: BTreeSet<Address> =
                batch.iter().flat_map(|t| [t.from, t.to]).collect();
            let tx_hashes: BTreeSet<B256> = batch.iter().map(|t| t.tx_hash).collect();
            let event_ids: Vec<B256> = batch.iter().map(|t| t.event_id).collect();
            let affected: Vec<Address> = affected.into_iter().collect();
            let tx_hashes: Vec<B256> = tx_hashes.into_iter().collect();

            summary.transfers += transfer_repo.archive_by_ids(&event_ids, archived_at)?;
            summary.transactions +=
                TransactionRepository::new(&tx).archive_by_hashes(&tx_hashes, archived_at)?;
            transfer_repo.unprocess_for_addresses(&affected)?;
            HolderRepository::new(&tx).mark_dirty(&affected)?;
            tx.commit()?;

            debug!(
                height,
                transfers = event_ids.len(),
                addresses = affected.len(),
                "archived heal batch"
            );
            affected_total.extend(affected);
        }

        summary.affected_addresses = affected_total.len();
        info!(
            from_height = height,
            blocks = summary.blocks,
            transactions = summary.transactions,
            transfers = summary.transfers,
            addresses = summary.affected_addresses,
            "heal completed"
        );
        Ok(summary)
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

fn invalid(message: String) -> IndexerError {
    IndexerError::Validation(message)
}

/// Checks the first incoming block against the stored tip.
fn check_parent(conn: &Connection, blocks: &[Block]) -> Result<()> {
    let Some(first) = blocks.first() else {
        return Ok(());
    };
    let repo = BlockRepository::new(conn);

    if repo.get_by_hash(&first.hash)?.is_some() {
        return Err(invalid(format!("block {:?} is already indexed", first.hash)));
    }

    if let Some(tip) = repo.get_latest()? {
        if first.height != tip.height + 1 {
            return Err(invalid(format!(
                "block {} does not extend indexed tip {}",
                first.height, tip.height
            )));
        }
        if first.parent_hash != tip.hash {
            return Err(invalid(format!(
                "block {} parent {:?} does not match indexed tip {:?}",
                first.height, first.parent_hash, tip.hash
            )));
        }
    }
    Ok(())
}

/// Structural checks that need no store access.
pub fn validate_blocks(blocks: &[Block], keep_empty_transactions: bool) -> Result<()> {
    let mut tx_hashes: HashSet<B256> = HashSet::new();
    let mut event_ids: HashSet<B256> = HashSet::new();

    for (i, block) in blocks.iter().enumerate() {
        if block.hash.is_zero() {
            return Err(invalid(format!("block {} has a zero hash", block.height)));
        }
        if let Some(prev) = i.checked_sub(1).map(|p| &blocks[p]) {
            if block.height != prev.height + 1 {
                return Err(invalid(format!(
                    "block heights not contiguous: {} follows {}",
                    block.height, prev.height
                )));
            }
            if block.parent_hash != prev.hash {
                return Err(invalid(format!(
                    "block {} parent does not link to {:?}",
                    block.height, prev.hash
                )));
            }
        }

        let listed: Vec<B256> = block.transactions.iter().map(|t| t.hash).collect();
        if listed != block.transaction_hashes {
            return Err(invalid(format!(
                "block {} transaction list does not match its transactions",
                block.height
            )));
        }

        let mut indexes: HashSet<u64> = HashSet::new();
        for transaction in &block.transactions {
            if transaction.block_hash != block.hash || transaction.block_height != block.height {
                return Err(invalid(format!(
                    "transaction {:?} does not reference block {}",
                    transaction.hash, block.height
                )));
            }
            if !tx_hashes.insert(transaction.hash) || !indexes.insert(transaction.index) {
                return Err(invalid(format!(
                    "duplicate transaction {:?} in update",
                    transaction.hash
                )));
            }
            if transaction.event_count == 0 && !keep_empty_transactions {
                return Err(invalid(format!(
                    "transaction {:?} carries no token events",
                    transaction.hash
                )));
            }
            if transaction.transfers.len() > transaction.event_count {
                return Err(invalid(format!(
                    "transaction {:?} has more transfers than events",
                    transaction.hash
                )));
            }

            for transfer in &transaction.transfers {
                if transfer.tx_hash != transaction.hash
                    || transfer.block_hash != block.hash
                    || transfer.block_height != block.height
                {
                    return Err(invalid(format!(
                        "transfer {:?} does not reference its transaction",
                        transfer.event_id
                    )));
                }
                let expected =
                    models::event_id(&transfer.block_hash, &transfer.tx_hash, transfer.event_index);
                if transfer.event_id != expected {
                    return Err(invalid(format!(
                        "transfer {:?} has a non-derived event id",
                        transfer.event_id
                    )));
                }
                if !event_ids.insert(transfer.event_id) {
                    return Err(invalid(format!(
                        "duplicate transfer {:?} in update",
                        transfer.event_id
                    )));
                }
            }
        }

        if models::holder_deltas(block.transfers())? != block.holder_deltas {
            return Err(invalid(format!(
                "block {} holder deltas do not match its transfers",
                block.height
            )));
        }
    }
    Ok(())
}
