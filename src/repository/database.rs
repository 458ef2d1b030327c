use anyhow::{Context, Result};
use rusqlite::Connection;
use std::sync::{Arc, Mutex, MutexGuard};

/// Shared handle to the SQLite ledger. Every writer locks the connection for
/// the duration of one SQL transaction, so applies, heals and holder
/// recomputations are serialized.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    pub fn new(db_path: &str) -> Result<Self> {
        let db_path = db_path.strip_prefix("sqlite:").unwrap_or(db_path);
        let conn = Connection::open(db_path).context("Failed to open database")?;
        Self::from_connection(conn)
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", "OFF")?;
        create_tables(&conn)?;
        Ok(Database {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn lock(&self) -> MutexGuard<'_, Connection> {
        // Open SQL transactions roll back on drop, so a poisoned guard is consistent.
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS blocks (
        hash TEXT PRIMARY KEY,
        parent_hash TEXT NOT NULL,
        height INTEGER NOT NULL UNIQUE,
        timestamp INTEGER NOT NULL,
        transaction_count INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS blocks_archive (
        archive_id INTEGER PRIMARY KEY AUTOINCREMENT,
        hash TEXT NOT NULL,
        parent_hash TEXT NOT NULL,
        height INTEGER NOT NULL,
        timestamp INTEGER NOT NULL,
        transaction_count INTEGER NOT NULL,
        archived_at INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS transactions (
        hash TEXT PRIMARY KEY,
        block_hash TEXT NOT NULL,
        block_height INTEGER NOT NULL,
        tx_index INTEGER NOT NULL,
        from_address TEXT NOT NULL,
        to_address TEXT,
        nonce INTEGER NOT NULL,
        gas_price TEXT NOT NULL,
        gas_used INTEGER NOT NULL,
        gas_limit INTEGER NOT NULL,
        v INTEGER NOT NULL,
        r TEXT NOT NULL,
        s TEXT NOT NULL,
        event_count INTEGER NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_transactions_block_height
        ON transactions(block_height);

    CREATE TABLE IF NOT EXISTS transactions_archive (
        archive_id INTEGER PRIMARY KEY AUTOINCREMENT,
        hash TEXT NOT NULL,
        block_hash TEXT NOT NULL,
        block_height INTEGER NOT NULL,
        tx_index INTEGER NOT NULL,
        from_address TEXT NOT NULL,
        to_address TEXT,
        nonce INTEGER NOT NULL,
        gas_price TEXT NOT NULL,
        gas_used INTEGER NOT NULL,
        gas_limit INTEGER NOT NULL,
        v INTEGER NOT NULL,
        r TEXT NOT NULL,
        s TEXT NOT NULL,
        event_count INTEGER NOT NULL,
        archived_at INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS transfers (
        event_id TEXT PRIMARY KEY,
        tx_hash TEXT NOT NULL,
        block_hash TEXT NOT NULL,
        block_height INTEGER NOT NULL,
        from_address TEXT NOT NULL,
        to_address TEXT NOT NULL,
        amount TEXT NOT NULL,
        event_index INTEGER NOT NULL,
        date INTEGER,
        processed_balance INTEGER NOT NULL DEFAULT 0
    );

    CREATE INDEX IF NOT EXISTS idx_transfers_block_height ON transfers(block_height);
    CREATE INDEX IF NOT EXISTS idx_transfers_tx_hash ON transfers(tx_hash);
    CREATE INDEX IF NOT EXISTS idx_transfers_from ON transfers(from_address);
    CREATE INDEX IF NOT EXISTS idx_transfers_to ON transfers(to_address);
    CREATE INDEX IF NOT EXISTS idx_transfers_processed ON transfers(processed_balance);

    CREATE TABLE IF NOT EXISTS transfers_archive (
        archive_id INTEGER PRIMARY KEY AUTOINCREMENT,
        event_id TEXT NOT NULL,
        tx_hash TEXT NOT NULL,
        block_hash TEXT NOT NULL,
        block_height INTEGER NOT NULL,
        from_address TEXT NOT NULL,
        to_address TEXT NOT NULL,
        amount TEXT NOT NULL,
        event_index INTEGER NOT NULL,
        date INTEGER,
        processed_balance INTEGER NOT NULL,
        archived_at INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS holders (
        address TEXT PRIMARY KEY,
        incoming_sum TEXT NOT NULL,
        outgoing_sum TEXT NOT NULL,
        balance TEXT NOT NULL,
        last_processed_height INTEGER,
        estimate_balance REAL NOT NULL DEFAULT 0,
        dirty INTEGER NOT NULL DEFAULT 0
    );

    CREATE INDEX IF NOT EXISTS idx_holders_estimate ON holders(estimate_balance);
    CREATE INDEX IF NOT EXISTS idx_holders_dirty ON holders(dirty);
";

fn create_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(SCHEMA)
        .context("Failed to create ledger tables")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_creation_is_idempotent() {
        let db = Database::in_memory().unwrap();
        let conn = db.lock();
        create_tables(&conn).unwrap();

        let tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master \
                 WHERE type = 'table' AND name NOT LIKE 'sqlite_%'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 7);
    }
}
