use super::codec;
use super::models::{Block, BlockRef};
use alloy_primitives::B256;
use rusqlite::{Connection, OptionalExtension, params};

pub struct BlockRepository<'a> {
    conn: &'a Connection,
}

impl<'a> BlockRepository<'a> {
    const INSERT_BLOCK: &'static str = "INSERT INTO blocks (
            hash, parent_hash, height, timestamp, transaction_count
        ) VALUES (?1, ?2, ?3, ?4, ?5)";

    const GET_LATEST: &'static str =
        "SELECT hash, height FROM blocks ORDER BY height DESC LIMIT 1";

    const GET_BY_HASH: &'static str = "SELECT hash, height FROM blocks WHERE hash = ?1";

    const GET_BY_HEIGHT: &'static str = "SELECT hash, height FROM blocks WHERE height = ?1";

    const GET_RECENT: &'static str =
        "SELECT hash, height FROM blocks ORDER BY height DESC LIMIT ?1";

    const GET_TIMESTAMP: &'static str = "SELECT timestamp FROM blocks WHERE height = ?1";

    const ARCHIVE_FROM_HEIGHT: &'static str = "INSERT INTO blocks_archive (
            hash, parent_hash, height, timestamp, transaction_count, archived_at
        )
        SELECT hash, parent_hash, height, timestamp, transaction_count, ?2
        FROM blocks WHERE height >= ?1";

    const DELETE_FROM_HEIGHT: &'static str = "DELETE FROM blocks WHERE height >= ?1";

    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    pub fn insert(&self, block: &Block) -> rusqlite::Result<()> {
        self.conn.execute(
            Self::INSERT_BLOCK,
            params![
                codec::hash(&block.hash),
                codec::hash(&block.parent_hash),
                block.height,
                block.timestamp,
                block.transactions.len(),
            ],
        )?;
        Ok(())
    }

    pub fn get_latest(&self) -> rusqlite::Result<Option<BlockRef>> {
        self.conn
            .query_row(Self::GET_LATEST, [], Self::row_to_ref)
            .optional()
    }

    pub fn get_by_hash(&self, hash: &B256) -> rusqlite::Result<Option<BlockRef>> {
        self.conn
            .query_row(Self::GET_BY_HASH, params![codec::hash(hash)], Self::row_to_ref)
            .optional()
    }

    pub fn get_by_height(&self, height: u64) -> rusqlite::Result<Option<BlockRef>> {
        self.conn
            .query_row(Self::GET_BY_HEIGHT, params![height], Self::row_to_ref)
            .optional()
    }

    /// Most recent indexed blocks, newest first.
    pub fn get_recent(&self, limit: u64) -> rusqlite::Result<Vec<BlockRef>> {
        let mut stmt = self.conn.prepare(Self::GET_RECENT)?;
        stmt.query_map(params![limit], Self::row_to_ref)?
            .collect()
    }

    pub fn get_timestamp(&self, height: u64) -> rusqlite::Result<Option<u64>> {
        self.conn
            .query_row(Self::GET_TIMESTAMP, params![height], |row| row.get(0))
            .optional()
    }

    /// Moves every block at or above `height` into the archive table.
    pub fn archive_from_height(&self, height: u64, archived_at: u64) -> rusqlite::Result<usize> {
        self.conn
            .execute(Self::ARCHIVE_FROM_HEIGHT, params![height, archived_at])?;
        self.conn.execute(Self::DELETE_FROM_HEIGHT, params![height])
    }

    fn row_to_ref(row: &rusqlite::Row) -> rusqlite::Result<BlockRef> {
        Ok(BlockRef {
            hash: codec::hash_at(row, 0)?,
            height: row.get(1)?,
        })
    }
}
