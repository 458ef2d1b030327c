use super::codec;
use super::models::TransferEvent;
use alloy_primitives::{Address, B256, U256};
use rusqlite::{Connection, Row, ToSql, params, params_from_iter};
use serde::Serialize;
use std::str::FromStr;

use crate::error::{IndexerError, Result};

pub struct TransferRepository<'a> {
    conn: &'a Connection,
}

impl<'a> TransferRepository<'a> {
    const INSERT_TRANSFER: &'static str = "INSERT OR IGNORE INTO transfers (
            event_id, tx_hash, block_hash, block_height, from_address, to_address,
            amount, event_index, date, processed_balance
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)";

    const SELECT_TRANSFER: &'static str = "SELECT event_id, tx_hash, block_hash, block_height,
            from_address, to_address, amount, event_index, date, processed_balance
        FROM transfers";

    const COLUMNS: &'static str = "event_id, tx_hash, block_hash, block_height,
            from_address, to_address, amount, event_index, date, processed_balance";

    const SELECT_ADDRESS_AMOUNTS: &'static str =
        "SELECT from_address, to_address, amount, block_height FROM transfers
         WHERE (from_address = ?1 OR to_address = ?1)
           AND (?2 IS NULL OR block_height > ?2)";

    const SELECT_WITHOUT_DATE: &'static str =
        "SELECT event_id, block_height FROM transfers WHERE date IS NULL LIMIT ?1";

    const UPDATE_DATE: &'static str = "UPDATE transfers SET date = ?1 WHERE event_id = ?2";

    const SELECT_DAYS_ACTIVITY: &'static str = "SELECT (date / 86400) * 86400 AS day, COUNT(*)
        FROM transfers WHERE date IS NOT NULL
        GROUP BY day ORDER BY day DESC LIMIT ?1";

    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Inserts transfers, skipping ids that are already stored. Returns the number inserted.
    pub fn insert_batch(&self, transfers: &[TransferEvent]) -> rusqlite::Result<usize> {
        let mut stmt = self.conn.prepare_cached(Self::INSERT_TRANSFER)?;
        let mut count = 0;

        for transfer in transfers {
            count += stmt.execute(params![
                codec::hash(&transfer.event_id),
                codec::hash(&transfer.tx_hash),
                codec::hash(&transfer.block_hash),
                transfer.block_height,
                codec::address(&transfer.from),
                codec::address(&transfer.to),
                transfer.amount.to_string(),
                transfer.event_index,
                transfer.date,
                transfer.processed_balance,
            ])?;
        }

        Ok(count)
    }

    /// Oldest transfers whose amounts are not yet folded into holder rows.
    pub fn get_unprocessed(&self, limit: usize) -> rusqlite::Result<Vec<TransferEvent>> {
        self.execute_query(
            vec!["processed_balance = 0"],
            Vec::new(),
            Some(" ORDER BY block_height ASC, event_index ASC"),
            Some((limit, 0)),
        )
    }

    pub fn mark_processed(&self, event_ids: &[B256]) -> rusqlite::Result<usize> {
        self.update_in(
            "UPDATE transfers SET processed_balance = 1 WHERE event_id IN",
            event_ids.iter().map(codec::hash).collect(),
        )
    }

    /// Re-queues every active transfer touching one of `addresses`.
    pub fn unprocess_for_addresses(&self, addresses: &[Address]) -> rusqlite::Result<usize> {
        if addresses.is_empty() {
            return Ok(0);
        }
        let values: Vec<String> = addresses.iter().map(codec::address).collect();
        let placeholders = vec!["?"; values.len()].join(", ");
        let query = format!(
            "UPDATE transfers SET processed_balance = 0
             WHERE from_address IN ({placeholders}) OR to_address IN ({placeholders})"
        );
        let params = values.iter().chain(values.iter());
        self.conn.execute(&query, params_from_iter(params))
    }

    /// Highest transfers at or above `height`, newest first.
    pub fn get_from_height(
        &self,
        height: u64,
        limit: usize,
    ) -> rusqlite::Result<Vec<TransferEvent>> {
        self.execute_query(
            vec!["block_height >= ?"],
            vec![Box::new(height)],
            Some(" ORDER BY block_height DESC, event_index DESC"),
            Some((limit, 0)),
        )
    }

    pub fn archive_by_ids(&self, event_ids: &[B256], archived_at: u64) -> rusqlite::Result<usize> {
        if event_ids.is_empty() {
            return Ok(0);
        }
        let values: Vec<String> = event_ids.iter().map(codec::hash).collect();
        let placeholders = vec!["?"; values.len()].join(", ");
        let archive = format!(
            "INSERT INTO transfers_archive ({cols}, archived_at)
             SELECT {cols}, {archived_at} FROM transfers WHERE event_id IN ({placeholders})",
            cols = Self::COLUMNS,
        );
        self.conn.execute(&archive, params_from_iter(values.iter()))?;
        self.update_in("DELETE FROM transfers WHERE event_id IN", values)
    }

    /// Incoming and outgoing sums over active transfers touching `address`,
    /// restricted to heights above `above` when given, plus the highest height seen.
    pub fn sum_for_address(
        &self,
        address: &Address,
        above: Option<u64>,
    ) -> Result<AddressSums> {
        let address_str = codec::address(address);
        let mut stmt = self.conn.prepare_cached(Self::SELECT_ADDRESS_AMOUNTS)?;
        let rows = stmt
            .query_map(params![address_str, above], |row| {
                Ok((
                    codec::address_at(row, 0)?,
                    codec::address_at(row, 1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, u64>(3)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut sums = AddressSums::default();
        for (from, to, amount, height) in rows {
            let value = U256::from_str(&amount).map_err(|_| {
                IndexerError::Validation(format!("Invalid value format in database: {amount}"))
            })?;
            if to == *address {
                sums.incoming = checked_add(sums.incoming, value)?;
            }
            if from == *address {
                sums.outgoing = checked_add(sums.outgoing, value)?;
            }
            sums.max_height = sums.max_height.max(Some(height));
            sums.count += 1;
        }

        Ok(sums)
    }

    pub fn get_without_date(&self, limit: usize) -> rusqlite::Result<Vec<(B256, u64)>> {
        let mut stmt = self.conn.prepare(Self::SELECT_WITHOUT_DATE)?;
        stmt.query_map(params![limit], |row| Ok((codec::hash_at(row, 0)?, row.get(1)?)))?
            .collect()
    }

    pub fn set_date(&self, event_id: &B256, date: u64) -> rusqlite::Result<usize> {
        self.conn
            .execute(Self::UPDATE_DATE, params![date, codec::hash(event_id)])
    }

    pub fn get_by_tx_hash(&self, tx_hash: &B256) -> rusqlite::Result<Vec<TransferEvent>> {
        self.execute_query(
            vec!["tx_hash = ?"],
            vec![Box::new(codec::hash(tx_hash))],
            Some(" ORDER BY event_index ASC"),
            None,
        )
    }

    pub fn get_address_history(
        &self,
        address: &Address,
        limit: usize,
        offset: usize,
    ) -> rusqlite::Result<(Vec<TransferEvent>, usize)> {
        let address_str = codec::address(address);
        let transfers = self.execute_query(
            vec!["(from_address = ? OR to_address = ?)"],
            vec![Box::new(address_str.clone()), Box::new(address_str.clone())],
            Some(" ORDER BY block_height DESC, event_index DESC"),
            Some((limit, offset)),
        )?;
        let total = self.conn.query_row(
            "SELECT COUNT(*) FROM transfers WHERE from_address = ?1 OR to_address = ?1",
            params![address_str],
            |row| row.get(0),
        )?;
        Ok((transfers, total))
    }

    /// Transfers already reflected in balances and dated, newest first.
    pub fn get_processed_page(
        &self,
        limit: usize,
        offset: usize,
    ) -> rusqlite::Result<(Vec<TransferEvent>, usize)> {
        let condition = "processed_balance = 1 AND date IS NOT NULL";
        let transfers = self.execute_query(
            vec![condition],
            Vec::new(),
            Some(" ORDER BY block_height DESC, event_index DESC"),
            Some((limit, offset)),
        )?;
        let total = self.conn.query_row(
            &format!("SELECT COUNT(*) FROM transfers WHERE {condition}"),
            [],
            |row| row.get(0),
        )?;
        Ok((transfers, total))
    }

    pub fn get_days_activity(&self, days: usize) -> rusqlite::Result<Vec<DayActivity>> {
        let mut stmt = self.conn.prepare(Self::SELECT_DAYS_ACTIVITY)?;
        stmt.query_map(params![days], |row| {
            Ok(DayActivity {
                day: row.get(0)?,
                count: row.get(1)?,
            })
        })?
        .collect()
    }

    fn update_in(&self, statement: &str, values: Vec<String>) -> rusqlite::Result<usize> {
        if values.is_empty() {
            return Ok(0);
        }
        let placeholders = vec!["?"; values.len()].join(", ");
        let query = format!("{statement} ({placeholders})");
        self.conn.execute(&query, params_from_iter(values))
    }

    fn execute_query(
        &self,
        conditions: Vec<&str>,
        params: Vec<Box<dyn ToSql>>,
        order_by: Option<&str>,
        page: Option<(usize, usize)>,
    ) -> rusqlite::Result<Vec<TransferEvent>> {
        let mut query = Self::SELECT_TRANSFER.to_string();

        if !conditions.is_empty() {
            query.push_str(" WHERE ");
            query.push_str(&conditions.join(" AND "));
        }

        if let Some(order) = order_by {
            query.push_str(order);
        }

        if let Some((limit, offset)) = page {
            query.push_str(&format!(" LIMIT {limit} OFFSET {offset}"));
        }

        let mut stmt = self.conn.prepare(&query)?;
        stmt.query_map(params_from_iter(params), Self::row_to_transfer)?
            .collect()
    }

    fn row_to_transfer(row: &Row) -> rusqlite::Result<TransferEvent> {
        Ok(TransferEvent {
            event_id: codec::hash_at(row, 0)?,
            tx_hash: codec::hash_at(row, 1)?,
            block_hash: codec::hash_at(row, 2)?,
            block_height: row.get(3)?,
            from: codec::address_at(row, 4)?,
            to: codec::address_at(row, 5)?,
            amount: codec::u256_at(row, 6)?,
            event_index: row.get(7)?,
            date: row.get(8)?,
            processed_balance: row.get(9)?,
        })
    }
}

fn checked_add(total: U256, value: U256) -> Result<U256> {
    total
        .checked_add(value)
        .ok_or_else(|| IndexerError::Validation("Overflow in sum calculation".to_string()))
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AddressSums {
    pub incoming: U256,
    pub outgoing: U256,
    pub max_height: Option<u64>,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DayActivity {
    pub day: i64,
    pub count: i64,
}
