use super::codec;
use super::models::Transaction;
use alloy_primitives::B256;
use rusqlite::{Connection, OptionalExtension, Row, params, params_from_iter};

pub struct TransactionRepository<'a> {
    conn: &'a Connection,
}

impl<'a> TransactionRepository<'a> {
    const INSERT_TRANSACTION: &'static str = "INSERT INTO transactions (
            hash, block_hash, block_height, tx_index, from_address, to_address,
            nonce, gas_price, gas_used, gas_limit, v, r, s, event_count
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)";

    const SELECT_TRANSACTION: &'static str = "SELECT hash, block_hash, block_height, tx_index,
            from_address, to_address, nonce, gas_price, gas_used, gas_limit, v, r, s, event_count
        FROM transactions";

    const ARCHIVE_COLUMNS: &'static str = "hash, block_hash, block_height, tx_index,
            from_address, to_address, nonce, gas_price, gas_used, gas_limit, v, r, s, event_count";

    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    pub fn insert(&self, tx: &Transaction) -> rusqlite::Result<()> {
        self.conn.execute(
            Self::INSERT_TRANSACTION,
            params![
                codec::hash(&tx.hash),
                codec::hash(&tx.block_hash),
                tx.block_height,
                tx.index,
                codec::address(&tx.from),
                tx.to.as_ref().map(codec::address),
                tx.nonce,
                tx.gas_price.to_string(),
                tx.gas_used,
                tx.gas_limit,
                tx.v,
                codec::hash(&tx.r),
                codec::hash(&tx.s),
                tx.event_count,
            ],
        )?;
        Ok(())
    }

    /// Loads the stored transaction without its transfers.
    pub fn get_by_hash(&self, hash: &B256) -> rusqlite::Result<Option<Transaction>> {
        let query = format!("{} WHERE hash = ?1", Self::SELECT_TRANSACTION);
        self.conn
            .query_row(&query, params![codec::hash(hash)], Self::row_to_transaction)
            .optional()
    }

    /// Moves the given transactions into the archive table.
    pub fn archive_by_hashes(&self, hashes: &[B256], archived_at: u64) -> rusqlite::Result<usize> {
        if hashes.is_empty() {
            return Ok(0);
        }

        let placeholders = vec!["?"; hashes.len()].join(", ");
        let values: Vec<String> = hashes.iter().map(codec::hash).collect();

        let delete = format!("DELETE FROM transactions WHERE hash IN ({placeholders})");
        let archive = format!(
            "INSERT INTO transactions_archive ({cols}, archived_at)
             SELECT {cols}, {archived_at} FROM transactions WHERE hash IN ({placeholders})",
            cols = Self::ARCHIVE_COLUMNS,
        );

        self.conn
            .execute(&archive, params_from_iter(values.iter()))?;
        self.conn.execute(&delete, params_from_iter(values.iter()))
    }

    /// Moves every transaction at or above `height` into the archive table.
    pub fn archive_from_height(&self, height: u64, archived_at: u64) -> rusqlite::Result<usize> {
        let archive = format!(
            "INSERT INTO transactions_archive ({cols}, archived_at)
             SELECT {cols}, ?2 FROM transactions WHERE block_height >= ?1",
            cols = Self::ARCHIVE_COLUMNS,
        );
        self.conn.execute(&archive, params![height, archived_at])?;
        self.conn.execute(
            "DELETE FROM transactions WHERE block_height >= ?1",
            params![height],
        )
    }

    fn row_to_transaction(row: &Row) -> rusqlite::Result<Transaction> {
        Ok(Transaction {
            hash: codec::hash_at(row, 0)?,
            block_hash: codec::hash_at(row, 1)?,
            block_height: row.get(2)?,
            index: row.get(3)?,
            from: codec::address_at(row, 4)?,
            to: codec::opt_address_at(row, 5)?,
            nonce: row.get(6)?,
            gas_price: codec::u128_at(row, 7)?,
            gas_used: row.get(8)?,
            gas_limit: row.get(9)?,
            v: row.get(10)?,
            r: codec::hash_at(row, 11)?,
            s: codec::hash_at(row, 12)?,
            event_count: row.get(13)?,
            transfers: Vec::new(),
        })
    }
}
