use crate::query::formatters::{
    LedgerStats, OutputFormat, format_holder, format_stats, format_top_holders,
    format_transaction, format_transfers,
};
use crate::repository::{
    BlockRepository, HolderRepository, TransactionRepository, TransferRepository,
};
use alloy_primitives::{Address, B256};
use anyhow::Result;
use std::str::FromStr;

pub struct HistoryQuery {
    pub address: String,
    pub limit: usize,
    pub offset: usize,
}

pub fn cmd_holder(
    holder_repo: &HolderRepository,
    transfer_repo: &TransferRepository,
    query: HistoryQuery,
    decimals: u8,
    format: &OutputFormat,
) -> Result<()> {
    let address = Address::from_str(&query.address)
        .map_err(|_| anyhow::anyhow!("Invalid address format: {}", query.address))?;

    let holder = holder_repo
        .get(&address)?
        .ok_or_else(|| anyhow::anyhow!("No holder record for {:?}", address))?;
    let (transfers, total) =
        transfer_repo.get_address_history(&address, query.limit, query.offset)?;

    println!("{}", format_holder(&holder, decimals, format));
    if matches!(format, OutputFormat::Table) && !transfers.is_empty() {
        println!("Transfers {}-{} of {}", query.offset + 1, query.offset + transfers.len(), total);
    }
    println!("{}", format_transfers(&transfers, decimals, format));

    Ok(())
}

pub fn cmd_transaction(
    tx_repo: &TransactionRepository,
    transfer_repo: &TransferRepository,
    hash: &str,
    decimals: u8,
    format: &OutputFormat,
) -> Result<()> {
    let hash = B256::from_str(hash)
        .map_err(|_| anyhow::anyhow!("Invalid transaction hash: {}", hash))?;

    let mut tx = tx_repo
        .get_by_hash(&hash)?
        .ok_or_else(|| anyhow::anyhow!("Transaction {:?} is not indexed", hash))?;
    tx.transfers = transfer_repo.get_by_tx_hash(&hash)?;

    println!("{}", format_transaction(&tx, decimals, format));

    Ok(())
}

pub fn cmd_transfers(
    transfer_repo: &TransferRepository,
    limit: usize,
    offset: usize,
    decimals: u8,
    format: &OutputFormat,
) -> Result<()> {
    let (transfers, _) = transfer_repo.get_processed_page(limit, offset)?;
    println!("{}", format_transfers(&transfers, decimals, format));

    Ok(())
}

pub fn cmd_top_holders(
    holder_repo: &HolderRepository,
    count: usize,
    offset: usize,
    decimals: u8,
    format: &OutputFormat,
) -> Result<()> {
    let holders = holder_repo.get_top(count, offset)?;
    println!("{}", format_top_holders(&holders, offset, decimals, format));

    Ok(())
}

pub fn cmd_stats(
    holder_repo: &HolderRepository,
    block_repo: &BlockRepository,
    transfer_repo: &TransferRepository,
    days: usize,
    format: &OutputFormat,
) -> Result<()> {
    let stats = LedgerStats {
        holders: holder_repo.count()?,
        latest_block: block_repo.get_latest()?,
        days_activity: transfer_repo.get_days_activity(days)?,
    };
    println!("{}", format_stats(&stats, format));

    Ok(())
}
