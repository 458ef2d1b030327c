use crate::config::Config;
use crate::error::{IndexerError, Result};
use crate::events::{DecodedEvent, decode_logs};
use crate::reorg::ReorgDetector;
use crate::repository::models::{self, Block, StateUpdate, Transaction, TransferEvent};
use crate::rpc::{ChainBlock, ChainClient, TxDetail};
use alloy_primitives::{Address, B256};
use futures::stream::{self, StreamExt, TryStreamExt};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

/// Transactions that emitted token logs in one block, in log order.
#[derive(Debug, Clone)]
struct LogGroup {
    block_hash: B256,
    tx_hashes: Vec<B256>,
}

pub struct BlockAssembler {
    chain: Arc<dyn ChainClient>,
    permits: Arc<Semaphore>,
    max_lookup_distance: u64,
    concurrency: usize,
    keep_empty_transactions: bool,
    scan_block_transactions: bool,
}

impl BlockAssembler {
    pub fn new(chain: Arc<dyn ChainClient>, config: &Config) -> Self {
        Self {
            chain,
            permits: Arc::new(Semaphore::new(config.tx_fetch_concurrency)),
            max_lookup_distance: config.max_lookup_distance,
            concurrency: config.tx_fetch_concurrency,
            keep_empty_transactions: config.keep_empty_transactions,
            scan_block_transactions: config.scan_block_transactions,
        }
    }

    /// Builds the blocks after `since`, at most `max_lookup_distance` of them,
    /// ascending and gap-free. Any failure aborts the whole batch.
    pub async fn assemble(&self, since: u64, token: Option<Address>) -> Result<Vec<Block>> {
        let tip = self.limited(self.chain.get_height()).await?;
        let lookup = self.max_lookup_distance.min(tip.saturating_sub(since));
        if lookup == 0 {
            return Ok(Vec::new());
        }

        let from = since + 1;
        let to = since + lookup;
        let mut groups = match token {
            Some(token) => group_logs(self.limited(self.chain.get_logs(token, from, to)).await?)?,
            None => BTreeMap::new(),
        };

        let blocks: Vec<Block> = stream::iter(from..=to)
            .map(|height| self.fetch_block(height, groups.remove(&height), token))
            .buffered(self.concurrency)
            .try_collect()
            .await?;

        info!(
            "Assembled blocks {}-{} ({} transfers), chain tip {}",
            from,
            to,
            blocks.iter().map(|b| b.transfers().count()).sum::<usize>(),
            tip
        );
        Ok(blocks)
    }

    async fn fetch_block(
        &self,
        height: u64,
        group: Option<LogGroup>,
        token: Option<Address>,
    ) -> Result<Block> {
        let block = self
            .limited(self.chain.get_block(height, self.scan_block_transactions))
            .await?
            .ok_or_else(|| IndexerError::NotFound(format!("block {height}")))?;

        let mut tx_hashes = Vec::new();
        if let Some(group) = group {
            if group.block_hash != block.hash {
                return Err(IndexerError::ChainInconsistent(format!(
                    "logs at height {height} reference {:?}, node returned {:?}",
                    group.block_hash, block.hash
                )));
            }
            tx_hashes = group.tx_hashes;
        }
        if self.scan_block_transactions {
            if let Some(hash) = tx_hashes
                .iter()
                .find(|hash| !block.transaction_hashes.contains(hash))
            {
                return Err(IndexerError::ChainInconsistent(format!(
                    "transaction {hash:?} with logs is not part of block {height}"
                )));
            }
            tx_hashes = block.transaction_hashes.clone();
        }

        let details: Vec<TxDetail> = stream::iter(tx_hashes)
            .map(|hash| async move {
                self.limited(self.chain.get_transaction_with_receipt(hash))
                    .await?
                    .ok_or_else(|| IndexerError::NotFound(format!("transaction {hash:?}")))
            })
            .buffered(self.concurrency)
            .try_collect()
            .await?;

        if let Some(detail) = details.iter().find(|d| d.block_hash != block.hash) {
            warn!(height, tx = ?detail.hash, "transaction moved to another block");
            return Err(IndexerError::ChainInconsistent(format!(
                "transaction {:?} belongs to {:?}, expected {:?}",
                detail.hash, detail.block_hash, block.hash
            )));
        }

        build_block(&block, details, token, self.keep_empty_transactions)
    }

    async fn limited<T>(&self, call: impl Future<Output = Result<T>>) -> Result<T> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|e| IndexerError::Network(e.to_string()))?;
        call.await
    }
}

fn group_logs(logs: Vec<crate::rpc::ChainLog>) -> Result<BTreeMap<u64, LogGroup>> {
    let mut groups: BTreeMap<u64, LogGroup> = BTreeMap::new();
    for log in logs {
        let group = groups.entry(log.block_height).or_insert_with(|| LogGroup {
            block_hash: log.block_hash,
            tx_hashes: Vec::new(),
        });
        if group.block_hash != log.block_hash {
            return Err(IndexerError::ChainInconsistent(format!(
                "logs at height {} reference two blocks",
                log.block_height
            )));
        }
        if !group.tx_hashes.contains(&log.tx_hash) {
            group.tx_hashes.push(log.tx_hash);
        }
    }
    Ok(groups)
}

/// Turns chain data for one block into its stored form.
pub fn build_block(
    block: &ChainBlock,
    mut details: Vec<TxDetail>,
    token: Option<Address>,
    keep_empty_transactions: bool,
) -> Result<Block> {
    details.sort_by_key(|detail| detail.index);

    let mut transactions = Vec::with_capacity(details.len());
    for detail in details {
        let decoded = decode_logs(&detail.logs, token)?;
        if decoded.is_empty() && !keep_empty_transactions {
            continue;
        }

        let mut transfers = Vec::new();
        for entry in &decoded {
            let DecodedEvent::Transfer { from, to, amount } = entry.event else {
                continue;
            };
            let event_index = detail
                .logs
                .iter()
                .position(|log| log.log_index == entry.log.log_index)
                .unwrap_or_default() as u64;

            transfers.push(TransferEvent {
                event_id: models::event_id(&block.hash, &detail.hash, event_index),
                tx_hash: detail.hash,
                block_hash: block.hash,
                block_height: block.height,
                from,
                to,
                amount,
                event_index,
                date: None,
                processed_balance: false,
            });
        }

        transactions.push(Transaction {
            hash: detail.hash,
            block_hash: block.hash,
            block_height: block.height,
            index: detail.index,
            from: detail.from,
            to: detail.to,
            nonce: detail.nonce,
            gas_price: detail.gas_price,
            gas_used: detail.gas_used,
            gas_limit: detail.gas_limit,
            v: detail.v,
            r: detail.r,
            s: detail.s,
            event_count: decoded.len(),
            transfers,
        });
    }

    let holder_deltas = models::holder_deltas(transactions.iter().flat_map(|tx| &tx.transfers))?;
    debug!(
        height = block.height,
        transactions = transactions.len(),
        holders = holder_deltas.len(),
        "built block"
    );

    Ok(Block {
        hash: block.hash,
        parent_hash: block.parent_hash,
        height: block.height,
        timestamp: block.timestamp,
        transaction_hashes: transactions.iter().map(|tx| tx.hash).collect(),
        transactions,
        holder_deltas,
    })
}

/// Produces the next state update for a consumer that has indexed up to `since`.
pub struct BlockService {
    assembler: BlockAssembler,
    detector: Arc<ReorgDetector>,
}

impl BlockService {
    pub fn new(assembler: BlockAssembler, detector: Arc<ReorgDetector>) -> Self {
        Self {
            assembler,
            detector,
        }
    }

    /// Reverses `known_hash` when the chain no longer has it at `since`,
    /// otherwise returns the blocks that follow.
    pub async fn get_state_update(
        &self,
        since: u64,
        token: Option<Address>,
        known_hash: Option<B256>,
    ) -> Result<StateUpdate> {
        if let Some(hash) = known_hash {
            if self.detector.check_tip(since, hash).await? {
                warn!(height = since, ?hash, "indexed tip is no longer canonical");
                return Ok(StateUpdate::reversal(hash));
            }
        }

        Ok(StateUpdate {
            incoming_blocks: self.assembler.assemble(since, token).await?,
            reversed_block_hashes: Vec::new(),
        })
    }
}
