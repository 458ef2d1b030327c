//! Derives holder balances from the active transfer log.
//!
//! A holder row tracks the highest transfer height already folded into its
//! sums. Blocks are applied atomically in height order, so the transfers
//! above that height are exactly the ones not yet counted. Heals flag the
//! affected holders dirty, and a dirty holder is recomputed from scratch.

use crate::config::Config;
use crate::error::{IndexerError, Result};
use crate::ingestion::{PollStep, StepOutcome};
use crate::repository::models::{Balance, Holder};
use crate::repository::{Database, HolderRepository, TransferRepository};
use alloy_primitives::utils::format_units;
use alloy_primitives::{Address, B256, U256};
use async_trait::async_trait;
use rusqlite::Connection;
use std::collections::BTreeSet;
use tracing::{debug, info};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AggregateSummary {
    pub recomputed: usize,
    pub folded: usize,
    pub transfers: usize,
}

#[derive(Clone)]
pub struct BalanceAggregator {
    db: Database,
    batch_size: usize,
    decimals: u8,
}

impl BalanceAggregator {
    pub fn new(db: Database, config: &Config) -> Self {
        Self {
            db,
            batch_size: config.balance_batch_size,
            decimals: config.token_decimals,
        }
    }

    /// Runs one bounded aggregation cycle.
    pub async fn process_batch(&self) -> Result<AggregateSummary> {
        let aggregator = self.clone();
        tokio::task::spawn_blocking(move || aggregator.process_blocking()).await?
    }

    fn process_blocking(&self) -> Result<AggregateSummary> {
        let conn = self.db.lock();
        let mut summary = AggregateSummary::default();

        let tx = conn.unchecked_transaction()?;
        let dirty = HolderRepository::new(&tx).get_dirty(self.batch_size)?;
        for address in &dirty {
            self.recompute(&tx, address)?;
        }
        tx.commit()?;
        summary.recomputed += dirty.len();

        let tx = conn.unchecked_transaction()?;
        let transfers = TransferRepository::new(&tx).get_unprocessed(self.batch_size)?;
        let touched: BTreeSet<Address> = transfers.iter().flat_map(|t| [t.from, t.to]).collect();

        for address in &touched {
            match HolderRepository::new(&tx).get(address)? {
                Some(holder) if !holder.dirty => {
                    self.fold(&tx, holder)?;
                    summary.folded += 1;
                }
                _ => {
                    self.recompute(&tx, address)?;
                    summary.recomputed += 1;
                }
            }
        }

        let ids: Vec<B256> = transfers.iter().map(|t| t.event_id).collect();
        TransferRepository::new(&tx).mark_processed(&ids)?;
        tx.commit()?;
        summary.transfers = ids.len();

        if summary.transfers > 0 || !dirty.is_empty() {
            debug!(
                transfers = summary.transfers,
                recomputed = summary.recomputed,
                folded = summary.folded,
                "aggregated balances"
            );
        }
        Ok(summary)
    }

    /// Full re-aggregation over every active transfer touching `address`.
    fn recompute(&self, conn: &Connection, address: &Address) -> Result<()> {
        let holders = HolderRepository::new(conn);
        let sums = TransferRepository::new(conn).sum_for_address(address, None)?;
        if sums.count == 0 {
            holders.delete(address)?;
            return Ok(());
        }

        let holder = self.holder(*address, sums.incoming, sums.outgoing, sums.max_height)?;
        holders.upsert(&holder)?;
        Ok(())
    }

    /// Adds the transfers above the holder's last processed height.
    fn fold(&self, conn: &Connection, holder: Holder) -> Result<()> {
        let sums = TransferRepository::new(conn)
            .sum_for_address(&holder.address, holder.last_processed_height)?;
        if sums.count == 0 {
            return Ok(());
        }

        let incoming = checked_add(holder.incoming_sum, sums.incoming)?;
        let outgoing = checked_add(holder.outgoing_sum, sums.outgoing)?;
        let last = holder.last_processed_height.max(sums.max_height);
        let updated = self.holder(holder.address, incoming, outgoing, last)?;
        HolderRepository::new(conn).upsert(&updated)?;
        Ok(())
    }

    fn holder(
        &self,
        address: Address,
        incoming: U256,
        outgoing: U256,
        last_processed_height: Option<u64>,
    ) -> Result<Holder> {
        let balance = Balance::from_sums(incoming, outgoing);

        Ok(Holder {
            address,
            incoming_sum: incoming,
            outgoing_sum: outgoing,
            balance,
            last_processed_height,
            estimate_balance: estimate(balance, self.decimals)?,
            dirty: false,
        })
    }
}

fn checked_add(total: U256, value: U256) -> Result<U256> {
    total
        .checked_add(value)
        .ok_or_else(|| IndexerError::Validation("Overflow in sum calculation".to_string()))
}

/// Display approximation of `balance` in whole tokens.
pub fn estimate(balance: Balance, decimals: u8) -> Result<f64> {
    let formatted = format_units(balance.magnitude(), decimals)
        .map_err(|e| IndexerError::Validation(e.to_string()))?;
    let magnitude = formatted
        .parse::<f64>()
        .map_err(|e| IndexerError::Validation(format!("{formatted}: {e}")))?;
    Ok(if balance.is_negative() {
        -magnitude
    } else {
        magnitude
    })
}

#[async_trait]
impl PollStep for BalanceAggregator {
    fn name(&self) -> &'static str {
        "balances"
    }

    async fn execute(&self) -> Result<StepOutcome> {
        let summary = self.process_batch().await?;
        let work = summary.transfers + summary.recomputed;
        if work == 0 {
            return Ok(StepOutcome::Idle);
        }
        info!(
            "Processed {} transfers, {} holders updated",
            summary.transfers,
            summary.recomputed + summary.folded
        );
        Ok(StepOutcome::Progress(work))
    }
}
