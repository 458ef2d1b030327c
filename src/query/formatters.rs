use crate::repository::models::{Balance, BlockRef, Holder, Transaction, TransferEvent};
use crate::repository::DayActivity;
use alloy_primitives::U256;
use alloy_primitives::utils::format_units;
use comfy_table::{Cell, Table, modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL};
use csv::Writer;
use serde_json::json;

#[derive(Debug, Clone)]
pub enum OutputFormat {
    Table,
    Json,
    Csv,
}

impl From<&str> for OutputFormat {
    fn from(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "json" => OutputFormat::Json,
            "csv" => OutputFormat::Csv,
            _ => OutputFormat::Table,
        }
    }
}

pub struct LedgerStats {
    pub holders: usize,
    pub latest_block: Option<BlockRef>,
    pub days_activity: Vec<DayActivity>,
}

fn table(header: Vec<&str>) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_header(header);
    table
}

fn finish_csv(wtr: Writer<Vec<u8>>) -> String {
    String::from_utf8(wtr.into_inner().unwrap_or_default()).unwrap_or_default()
}

fn units(value: U256, decimals: u8) -> String {
    format_units(value, decimals).unwrap_or_else(|_| value.to_string())
}

fn balance_units(balance: Balance, decimals: u8) -> String {
    let sign = if balance.is_negative() { "-" } else { "" };
    format!("{sign}{}", units(balance.magnitude(), decimals))
}

fn date(transfer: &TransferEvent) -> String {
    transfer
        .date
        .map_or("pending".to_string(), |d| d.to_string())
}

pub fn format_transfers(
    transfers: &[TransferEvent],
    decimals: u8,
    format: &OutputFormat,
) -> String {
    match format {
        OutputFormat::Table => format_transfers_table(transfers, decimals),
        OutputFormat::Json => format_transfers_json(transfers, decimals),
        OutputFormat::Csv => format_transfers_csv(transfers, decimals),
    }
}

fn format_transfers_table(transfers: &[TransferEvent], decimals: u8) -> String {
    if transfers.is_empty() {
        return "No transfers found.".to_string();
    }

    let mut table = table(vec!["Block", "From", "To", "Value", "Date", "Tx Hash"]);
    for transfer in transfers {
        table.add_row(vec![
            Cell::new(transfer.block_height),
            Cell::new(format!("{:#}", transfer.from)),
            Cell::new(format!("{:#}", transfer.to)),
            Cell::new(units(transfer.amount, decimals)),
            Cell::new(date(transfer)),
            Cell::new(format_tx_hash(&format!("{:?}", transfer.tx_hash))),
        ]);
    }

    table.to_string()
}

fn transfer_json(transfer: &TransferEvent, decimals: u8) -> serde_json::Value {
    json!({
        "event_id": format!("{:?}", transfer.event_id),
        "block_height": transfer.block_height,
        "transaction_hash": format!("{:?}", transfer.tx_hash),
        "event_index": transfer.event_index,
        "from": format!("{:?}", transfer.from),
        "to": format!("{:?}", transfer.to),
        "value": units(transfer.amount, decimals),
        "value_wei": transfer.amount.to_string(),
        "date": transfer.date,
    })
}

fn format_transfers_json(transfers: &[TransferEvent], decimals: u8) -> String {
    let json_transfers: Vec<_> = transfers
        .iter()
        .map(|t| transfer_json(t, decimals))
        .collect();

    serde_json::to_string_pretty(&json_transfers).unwrap_or_else(|_| "[]".to_string())
}

fn format_transfers_csv(transfers: &[TransferEvent], decimals: u8) -> String {
    let mut wtr = Writer::from_writer(vec![]);

    let _ = wtr.write_record([
        "block_height",
        "from",
        "to",
        "value",
        "value_wei",
        "transaction_hash",
        "event_index",
        "date",
    ]);

    for transfer in transfers {
        let _ = wtr.write_record([
            &transfer.block_height.to_string(),
            &format!("{:?}", transfer.from),
            &format!("{:?}", transfer.to),
            &units(transfer.amount, decimals),
            &transfer.amount.to_string(),
            &format!("{:?}", transfer.tx_hash),
            &transfer.event_index.to_string(),
            &date(transfer),
        ]);
    }

    finish_csv(wtr)
}

pub fn format_holder(holder: &Holder, decimals: u8, format: &OutputFormat) -> String {
    let balance = balance_units(holder.balance, decimals);
    let incoming = units(holder.incoming_sum, decimals);
    let outgoing = units(holder.outgoing_sum, decimals);

    match format {
        OutputFormat::Table => {
            let mut table = table(vec!["Metric", "Value (Formatted)", "Value (Wei)"]);
            table.add_row(vec![
                Cell::new("Balance"),
                Cell::new(&balance),
                Cell::new(holder.balance.to_string()),
            ]);
            table.add_row(vec![
                Cell::new("Total Incoming"),
                Cell::new(&incoming),
                Cell::new(holder.incoming_sum.to_string()),
            ]);
            table.add_row(vec![
                Cell::new("Total Outgoing"),
                Cell::new(&outgoing),
                Cell::new(holder.outgoing_sum.to_string()),
            ]);
            table.to_string()
        }
        OutputFormat::Json => json!({
            "address": format!("{:?}", holder.address),
            "balance": balance,
            "balance_wei": holder.balance.to_string(),
            "total_incoming": incoming,
            "total_incoming_wei": holder.incoming_sum.to_string(),
            "total_outgoing": outgoing,
            "total_outgoing_wei": holder.outgoing_sum.to_string(),
            "pending_recompute": holder.dirty,
        })
        .to_string(),
        OutputFormat::Csv => {
            let mut wtr = Writer::from_writer(vec![]);
            let _ = wtr.write_record(["metric", "value_formatted", "value_wei"]);
            let _ = wtr.write_record(["balance", &balance, &holder.balance.to_string()]);
            let _ = wtr.write_record([
                "total_incoming",
                &incoming,
                &holder.incoming_sum.to_string(),
            ]);
            let _ = wtr.write_record([
                "total_outgoing",
                &outgoing,
                &holder.outgoing_sum.to_string(),
            ]);
            finish_csv(wtr)
        }
    }
}

pub fn format_transaction(tx: &Transaction, decimals: u8, format: &OutputFormat) -> String {
    match format {
        OutputFormat::Table => {
            let mut table = table(vec!["Field", "Value"]);
            table.add_row(vec![Cell::new("Hash"), Cell::new(format!("{:?}", tx.hash))]);
            table.add_row(vec![Cell::new("Block"), Cell::new(tx.block_height)]);
            table.add_row(vec![Cell::new("Index"), Cell::new(tx.index)]);
            table.add_row(vec![Cell::new("From"), Cell::new(format!("{:#}", tx.from))]);
            table.add_row(vec![
                Cell::new("To"),
                Cell::new(tx.to.map_or("contract creation".to_string(), |to| format!("{to:#}"))),
            ]);
            table.add_row(vec![Cell::new("Nonce"), Cell::new(tx.nonce)]);
            table.add_row(vec![Cell::new("Gas Used"), Cell::new(tx.gas_used)]);
            table.add_row(vec![Cell::new("Token Events"), Cell::new(tx.event_count)]);
            format!(
                "{table}\n{}",
                format_transfers_table(&tx.transfers, decimals)
            )
        }
        OutputFormat::Json => serde_json::to_string_pretty(&json!({
            "hash": format!("{:?}", tx.hash),
            "block_hash": format!("{:?}", tx.block_hash),
            "block_height": tx.block_height,
            "index": tx.index,
            "from": format!("{:?}", tx.from),
            "to": tx.to.map(|to| format!("{to:?}")),
            "nonce": tx.nonce,
            "gas_price": tx.gas_price.to_string(),
            "gas_used": tx.gas_used,
            "gas_limit": tx.gas_limit,
            "event_count": tx.event_count,
            "transfers": tx
                .transfers
                .iter()
                .map(|t| transfer_json(t, decimals))
                .collect::<Vec<_>>(),
        }))
        .unwrap_or_else(|_| "{}".to_string()),
        OutputFormat::Csv => format_transfers_csv(&tx.transfers, decimals),
    }
}

pub fn format_top_holders(
    holders: &[Holder],
    offset: usize,
    decimals: u8,
    format: &OutputFormat,
) -> String {
    match format {
        OutputFormat::Table => format_top_holders_table(holders, offset, decimals),
        OutputFormat::Json => format_top_holders_json(holders, offset, decimals),
        OutputFormat::Csv => format_top_holders_csv(holders, offset, decimals),
    }
}

fn format_top_holders_table(holders: &[Holder], offset: usize, decimals: u8) -> String {
    if holders.is_empty() {
        return "No holders found.".to_string();
    }

    let mut table = table(vec!["Rank", "Address", "Balance", "Balance (Wei)"]);
    for (i, holder) in holders.iter().enumerate() {
        table.add_row(vec![
            Cell::new(offset + i + 1),
            Cell::new(format!("{:#}", &holder.address)),
            Cell::new(balance_units(holder.balance, decimals)),
            Cell::new(holder.balance.to_string()),
        ]);
    }

    table.to_string()
}

fn format_top_holders_json(holders: &[Holder], offset: usize, decimals: u8) -> String {
    let json_holders: Vec<_> = holders
        .iter()
        .enumerate()
        .map(|(i, holder)| {
            json!({
                "rank": offset + i + 1,
                "address": format!("{:?}", holder.address),
                "balance": balance_units(holder.balance, decimals),
                "balance_wei": holder.balance.to_string(),
            })
        })
        .collect();

    serde_json::to_string_pretty(&json_holders).unwrap_or_else(|_| "[]".to_string())
}

fn format_top_holders_csv(holders: &[Holder], offset: usize, decimals: u8) -> String {
    let mut wtr = Writer::from_writer(vec![]);

    let _ = wtr.write_record(["rank", "address", "balance", "balance_wei"]);

    for (i, holder) in holders.iter().enumerate() {
        let _ = wtr.write_record([
            &(offset + i + 1).to_string(),
            &format!("{:?}", holder.address),
            &balance_units(holder.balance, decimals),
            &holder.balance.to_string(),
        ]);
    }

    finish_csv(wtr)
}

pub fn format_stats(stats: &LedgerStats, format: &OutputFormat) -> String {
    let latest = stats
        .latest_block
        .map_or("N/A".to_string(), |b| b.height.to_string());

    match format {
        OutputFormat::Table => {
            let mut summary = table(vec!["Metric", "Value"]);
            summary.add_row(vec![Cell::new("Holders"), Cell::new(stats.holders)]);
            summary.add_row(vec![Cell::new("Latest Block"), Cell::new(&latest)]);

            let mut activity = table(vec!["Day (UTC)", "Transfers"]);
            for day in &stats.days_activity {
                activity.add_row(vec![Cell::new(day.day), Cell::new(day.count)]);
            }
            format!("{summary}\n{activity}")
        }
        OutputFormat::Json => serde_json::to_string_pretty(&json!({
            "holders": stats.holders,
            "latest_block": stats.latest_block.map(|b| b.height),
            "days_activity": stats.days_activity,
        }))
        .unwrap_or_else(|_| "{}".to_string()),
        OutputFormat::Csv => {
            let mut wtr = Writer::from_writer(vec![]);
            let _ = wtr.write_record(["metric", "value"]);
            let _ = wtr.write_record(["holders", &stats.holders.to_string()]);
            let _ = wtr.write_record(["latest_block", &latest]);
            for day in &stats.days_activity {
                let _ = wtr.write_record([format!("day_{}", day.day), day.count.to_string()]);
            }
            finish_csv(wtr)
        }
    }
}

fn format_tx_hash(hash: &str) -> String {
    format!("{}...{}", &hash[..6], &hash[hash.len() - 4..])
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::Address;

    fn holder() -> Holder {
        let mut holder = Holder::empty(Address::repeat_byte(1));
        holder.incoming_sum = U256::from(2_500_000_000_000_000_000u128);
        holder.outgoing_sum = U256::from(500_000_000_000_000_000u128);
        holder.balance = Balance::from_sums(holder.incoming_sum, holder.outgoing_sum);
        holder
    }

    #[test]
    fn holder_json_uses_token_units() {
        let output = format_holder(&holder(), 18, &OutputFormat::Json);
        let value: serde_json::Value = serde_json::from_str(&output).unwrap();
        assert_eq!(value["balance"], "2.000000000000000000");
        assert_eq!(value["total_outgoing_wei"], "500000000000000000");
    }

    #[test]
    fn negative_balance_keeps_sign() {
        let mut holder = Holder::empty(Address::ZERO);
        holder.outgoing_sum = U256::MAX;
        holder.balance = Balance::from_sums(U256::ZERO, U256::MAX);

        let output = format_holder(&holder, 18, &OutputFormat::Json);
        let value: serde_json::Value = serde_json::from_str(&output).unwrap();
        assert_eq!(value["balance_wei"], format!("-{}", U256::MAX));
        assert!(value["balance"].as_str().unwrap().starts_with("-115792089237316195423570985"));
    }

    #[test]
    fn top_holders_csv_ranks_from_offset() {
        let output = format_top_holders(&[holder()], 10, 18, &OutputFormat::Csv);
        let mut lines = output.lines();
        assert_eq!(lines.next(), Some("rank,address,balance,balance_wei"));
        assert!(lines.next().unwrap().starts_with("11,0x0101"));
    }

    #[test]
    fn empty_transfer_table_has_message() {
        assert_eq!(
            format_transfers(&[], 18, &OutputFormat::Table),
            "No transfers found."
        );
    }
}
