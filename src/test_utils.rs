//! In-memory chain double and block builders shared by unit tests.

use crate::assembler::build_block;
use crate::error::{IndexerError, Result};
use crate::events::Transfer;
use crate::repository::models::{Balance, Block};
use crate::rpc::{ChainBlock, ChainClient, ChainLog, TxDetail};
use alloy::sol_types::SolEvent;
use alloy_primitives::ruint::UintTryFrom;
use alloy_primitives::{Address, B256, U256, address, keccak256};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

pub const TOKEN: Address = address!("0x5FbDB2315678afecb367f032d93F642f64180aa3");

pub type Movement = (Address, Address, U256);

pub fn addr(byte: u8) -> Address {
    Address::repeat_byte(byte)
}

/// A transfer between the test addresses `from` and `to`.
pub fn transfer<T>(from: u8, to: u8, amount: T) -> Movement
where
    U256: UintTryFrom<T>,
{
    (addr(from), addr(to), U256::from(amount))
}

pub fn signed(value: i128) -> Balance {
    Balance::from_sums(
        U256::from(value.max(0).unsigned_abs()),
        U256::from(value.min(0).unsigned_abs()),
    )
}

pub fn block_hash(height: u64, fork: u8) -> B256 {
    keccak256(format!("block-{height}-{fork}"))
}

pub fn tx_hash(block_hash: &B256, index: u64) -> B256 {
    keccak256(format!("tx-{block_hash:?}-{index}"))
}

pub fn timestamp(height: u64) -> u64 {
    1_700_000_000 + height * 12
}

pub fn transfer_log<T>(
    block_hash: B256,
    block_height: u64,
    tx_hash: B256,
    log_index: u64,
    from: Address,
    to: Address,
    amount: T,
) -> ChainLog
where
    U256: UintTryFrom<T>,
{
    let data = Transfer {
        from,
        to,
        value: U256::from(amount),
    }
    .encode_log_data();

    ChainLog {
        address: TOKEN,
        topics: data.topics().to_vec(),
        data: data.data,
        block_hash,
        block_height,
        tx_hash,
        log_index,
    }
}

/// Chain-side view of one block: one transaction per transfer, followed by
/// `empty_txs` transactions that emit nothing.
pub fn chain_block(
    height: u64,
    fork: u8,
    parent_hash: B256,
    transfers: &[Movement],
    empty_txs: usize,
) -> (ChainBlock, Vec<TxDetail>) {
    let hash = block_hash(height, fork);
    let mut details = Vec::new();

    for (i, (from, to, amount)) in transfers.iter().enumerate() {
        let index = i as u64;
        let hash_i = tx_hash(&hash, index);
        let log = transfer_log(hash, height, hash_i, index, *from, *to, *amount);
        details.push(tx_detail(hash, height, index, *from, vec![log]));
    }
    for i in 0..empty_txs {
        let index = (transfers.len() + i) as u64;
        details.push(tx_detail(hash, height, index, addr(0xee), Vec::new()));
    }

    let block = ChainBlock {
        hash,
        parent_hash,
        height,
        timestamp: timestamp(height),
        transaction_hashes: details.iter().map(|d| d.hash).collect(),
    };
    (block, details)
}

fn tx_detail(
    block_hash: B256,
    height: u64,
    index: u64,
    from: Address,
    logs: Vec<ChainLog>,
) -> TxDetail {
    let hash = tx_hash(&block_hash, index);
    TxDetail {
        hash,
        block_hash,
        block_height: height,
        index,
        from,
        to: Some(TOKEN),
        nonce: index,
        gas_price: 1_000_000_000,
        gas_used: 51_000,
        gas_limit: 60_000,
        v: 1,
        r: keccak256(hash),
        s: B256::repeat_byte(0x05),
        logs,
    }
}

/// The stored form of a block, as the assembler would produce it.
pub fn make_block(
    height: u64,
    fork: u8,
    parent_hash: B256,
    transfers: &[Movement],
) -> Block {
    let (block, details) = chain_block(height, fork, parent_hash, transfers, 0);
    build_block(&block, details, Some(TOKEN), true).unwrap()
}

/// Consecutive blocks starting at `start`, each holding the given transfers.
pub fn make_chain(start: u64, fork: u8, blocks: &[Vec<Movement>]) -> Vec<Block> {
    let mut parent = start
        .checked_sub(1)
        .map(|h| block_hash(h, 0))
        .unwrap_or(B256::ZERO);
    let mut out = Vec::new();
    for (i, transfers) in blocks.iter().enumerate() {
        let block = make_block(start + i as u64, fork, parent, transfers);
        parent = block.hash;
        out.push(block);
    }
    out
}

#[derive(Default)]
struct MockState {
    blocks: BTreeMap<u64, ChainBlock>,
    txs: HashMap<B256, TxDetail>,
}

/// Forkable in-memory chain implementing [`ChainClient`].
#[derive(Default)]
pub struct MockChain {
    state: Mutex<MockState>,
    failures: AtomicUsize,
    pub calls: AtomicUsize,
}

impl MockChain {
    pub fn new() -> Self {
        let chain = Self::default();
        chain.push_block(0, &[], 0);
        chain
    }

    /// Appends a block on top of the current tip.
    pub fn push_block(
        &self,
        fork: u8,
        transfers: &[Movement],
        empty_txs: usize,
    ) -> ChainBlock {
        let mut state = self.state.lock().unwrap();
        let (height, parent) = match state.blocks.last_key_value() {
            Some((height, block)) => (height + 1, block.hash),
            None => (0, B256::ZERO),
        };
        let (block, details) = chain_block(height, fork, parent, transfers, empty_txs);
        for detail in details {
            state.txs.insert(detail.hash, detail);
        }
        state.blocks.insert(height, block.clone());
        block
    }

    /// Drops every block at or above `height`, as a reorg would.
    pub fn rewind_to(&self, height: u64) {
        let mut state = self.state.lock().unwrap();
        let dropped = state.blocks.split_off(&height);
        for block in dropped.values() {
            for hash in &block.transaction_hashes {
                state.txs.remove(hash);
            }
        }
    }

    pub fn block_at(&self, height: u64) -> Option<ChainBlock> {
        self.state.lock().unwrap().blocks.get(&height).cloned()
    }

    /// The next `count` calls fail with a network error.
    pub fn fail_next(&self, count: usize) {
        self.failures.store(count, Ordering::SeqCst);
    }

    fn enter(&self) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(IndexerError::Network("connection refused".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl ChainClient for MockChain {
    async fn get_height(&self) -> Result<u64> {
        self.enter()?;
        let state = self.state.lock().unwrap();
        Ok(state.blocks.keys().next_back().copied().unwrap_or_default())
    }

    async fn get_block(&self, height: u64, include_txs: bool) -> Result<Option<ChainBlock>> {
        self.enter()?;
        let state = self.state.lock().unwrap();
        Ok(state.blocks.get(&height).cloned().map(|mut block| {
            if !include_txs {
                block.transaction_hashes.clear();
            }
            block
        }))
    }

    async fn get_transaction_with_receipt(&self, hash: B256) -> Result<Option<TxDetail>> {
        self.enter()?;
        Ok(self.state.lock().unwrap().txs.get(&hash).cloned())
    }

    async fn get_logs(&self, address: Address, from: u64, to: u64) -> Result<Vec<ChainLog>> {
        self.enter()?;
        let mut logs = Vec::new();
        if from > to {
            return Ok(logs);
        }
        let state = self.state.lock().unwrap();
        for block in state.blocks.range(from..=to).map(|(_, b)| b) {
            for hash in &block.transaction_hashes {
                if let Some(detail) = state.txs.get(hash) {
                    logs.extend(detail.logs.iter().filter(|l| l.address == address).cloned());
                }
            }
        }
        Ok(logs)
    }
}
