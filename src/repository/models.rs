use alloy_primitives::ruint::ParseError;
use alloy_primitives::{Address, B256, U256, keccak256};
use serde::{Deserialize, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::{IndexerError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Block {
    pub hash: B256,
    pub parent_hash: B256,
    pub height: u64,
    pub timestamp: u64,
    pub transaction_hashes: Vec<B256>,
    pub transactions: Vec<Transaction>,
    pub holder_deltas: BTreeMap<Address, HolderDelta>,
}

impl Block {
    pub fn transfers(&self) -> impl Iterator<Item = &TransferEvent> {
        self.transactions.iter().flat_map(|tx| tx.transfers.iter())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub hash: B256,
    pub block_hash: B256,
    pub block_height: u64,
    pub index: u64,
    pub from: Address,
    pub to: Option<Address>,
    pub nonce: u64,
    pub gas_price: u128,
    pub gas_used: u64,
    pub gas_limit: u64,
    pub v: u64,
    pub r: B256,
    pub s: B256,
    /// Number of decoded token events (transfers and approvals) in the receipt.
    pub event_count: usize,
    pub transfers: Vec<TransferEvent>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferEvent {
    pub event_id: B256,
    pub tx_hash: B256,
    pub block_hash: B256,
    pub block_height: u64,
    pub from: Address,
    pub to: Address,
    pub amount: U256,
    pub event_index: u64,
    /// Unix seconds of the containing block.
    pub date: Option<u64>,
    pub processed_balance: bool,
}

/// Content-derived identifier: replaying the same block always yields the same id.
pub fn event_id(block_hash: &B256, tx_hash: &B256, event_index: u64) -> B256 {
    let mut preimage = [0u8; 72];
    preimage[..32].copy_from_slice(block_hash.as_slice());
    preimage[32..64].copy_from_slice(tx_hash.as_slice());
    preimage[64..].copy_from_slice(&event_index.to_be_bytes());
    keccak256(preimage)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HolderDelta {
    pub incoming: U256,
    pub outgoing: U256,
}

/// Folds transfers into per-address incoming/outgoing totals.
pub fn holder_deltas<'a>(
    transfers: impl IntoIterator<Item = &'a TransferEvent>,
) -> Result<BTreeMap<Address, HolderDelta>> {
    let mut deltas: BTreeMap<Address, HolderDelta> = BTreeMap::new();
    for transfer in transfers {
        let outgoing = &mut deltas.entry(transfer.from).or_default().outgoing;
        *outgoing = outgoing
            .checked_add(transfer.amount)
            .ok_or_else(|| overflow(&transfer.from))?;

        let incoming = &mut deltas.entry(transfer.to).or_default().incoming;
        *incoming = incoming
            .checked_add(transfer.amount)
            .ok_or_else(|| overflow(&transfer.to))?;
    }
    Ok(deltas)
}

fn overflow(address: &Address) -> IndexerError {
    IndexerError::Validation(format!("holder delta overflow for {address:?}"))
}

/// Net token position: a sign and a full 256-bit magnitude.
///
/// Incoming and outgoing sums are each bounded by `U256::MAX`, so their
/// difference always fits. Zero is never negative.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Balance {
    negative: bool,
    magnitude: U256,
}

impl Balance {
    pub const ZERO: Balance = Balance {
        negative: false,
        magnitude: U256::ZERO,
    };

    pub fn from_sums(incoming: U256, outgoing: U256) -> Self {
        if incoming >= outgoing {
            Self {
                negative: false,
                magnitude: incoming - outgoing,
            }
        } else {
            Self {
                negative: true,
                magnitude: outgoing - incoming,
            }
        }
    }

    pub fn is_negative(&self) -> bool {
        self.negative
    }

    pub fn magnitude(&self) -> U256 {
        self.magnitude
    }
}

impl fmt::Display for Balance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.negative {
            write!(f, "-")?;
        }
        write!(f, "{}", self.magnitude)
    }
}

impl FromStr for Balance {
    type Err = ParseError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (negative, digits) = match s.strip_prefix('-') {
            Some(digits) => (true, digits),
            None => (false, s),
        };
        let magnitude = U256::from_str_radix(digits, 10)?;
        Ok(Self {
            negative: negative && !magnitude.is_zero(),
            magnitude,
        })
    }
}

impl Serialize for Balance {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Holder {
    pub address: Address,
    pub incoming_sum: U256,
    pub outgoing_sum: U256,
    pub balance: Balance,
    pub last_processed_height: Option<u64>,
    pub estimate_balance: f64,
    pub dirty: bool,
}

impl Holder {
    pub fn empty(address: Address) -> Self {
        Self {
            address,
            incoming_sum: U256::ZERO,
            outgoing_sum: U256::ZERO,
            balance: Balance::ZERO,
            last_processed_height: None,
            estimate_balance: 0.0,
            dirty: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockRef {
    pub hash: B256,
    pub height: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateUpdate {
    pub incoming_blocks: Vec<Block>,
    pub reversed_block_hashes: Vec<B256>,
}

impl StateUpdate {
    pub fn reversal(hash: B256) -> Self {
        Self {
            incoming_blocks: Vec::new(),
            reversed_block_hashes: vec![hash],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.incoming_blocks.is_empty() && self.reversed_block_hashes.is_empty()
    }
}
