use super::codec;
use super::models::Holder;
use alloy_primitives::Address;
use rusqlite::{Connection, OptionalExtension, Row, params};

pub struct HolderRepository<'a> {
    conn: &'a Connection,
}

impl<'a> HolderRepository<'a> {
    const UPSERT_HOLDER: &'static str = "INSERT INTO holders (
            address, incoming_sum, outgoing_sum, balance, last_processed_height,
            estimate_balance, dirty
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        ON CONFLICT(address) DO UPDATE SET
            incoming_sum = excluded.incoming_sum,
            outgoing_sum = excluded.outgoing_sum,
            balance = excluded.balance,
            last_processed_height = excluded.last_processed_height,
            estimate_balance = excluded.estimate_balance,
            dirty = excluded.dirty";

    const MARK_DIRTY: &'static str = "INSERT INTO holders (
            address, incoming_sum, outgoing_sum, balance, last_processed_height,
            estimate_balance, dirty
        ) VALUES (?1, '0', '0', '0', NULL, 0, 1)
        ON CONFLICT(address) DO UPDATE SET dirty = 1";

    const SELECT_HOLDER: &'static str = "SELECT address, incoming_sum, outgoing_sum, balance,
            last_processed_height, estimate_balance, dirty
        FROM holders";

    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    pub fn get(&self, address: &Address) -> rusqlite::Result<Option<Holder>> {
        let query = format!("{} WHERE address = ?1", Self::SELECT_HOLDER);
        self.conn
            .query_row(&query, params![codec::address(address)], Self::row_to_holder)
            .optional()
    }

    pub fn upsert(&self, holder: &Holder) -> rusqlite::Result<()> {
        self.conn.execute(
            Self::UPSERT_HOLDER,
            params![
                codec::address(&holder.address),
                holder.incoming_sum.to_string(),
                holder.outgoing_sum.to_string(),
                holder.balance.to_string(),
                holder.last_processed_height,
                holder.estimate_balance,
                holder.dirty,
            ],
        )?;
        Ok(())
    }

    /// Flags holders for full recomputation, creating empty rows where missing.
    pub fn mark_dirty(&self, addresses: &[Address]) -> rusqlite::Result<usize> {
        let mut stmt = self.conn.prepare_cached(Self::MARK_DIRTY)?;
        let mut count = 0;
        for address in addresses {
            count += stmt.execute(params![codec::address(address)])?;
        }
        Ok(count)
    }

    pub fn get_dirty(&self, limit: usize) -> rusqlite::Result<Vec<Address>> {
        let mut stmt = self
            .conn
            .prepare("SELECT address FROM holders WHERE dirty = 1 LIMIT ?1")?;
        stmt.query_map(params![limit], |row| codec::address_at(row, 0))?
            .collect()
    }

    pub fn delete(&self, address: &Address) -> rusqlite::Result<usize> {
        self.conn.execute(
            "DELETE FROM holders WHERE address = ?1",
            params![codec::address(address)],
        )
    }

    /// Holders ordered by estimated balance, largest first.
    pub fn get_top(&self, limit: usize, offset: usize) -> rusqlite::Result<Vec<Holder>> {
        let query = format!(
            "{} ORDER BY estimate_balance DESC, address ASC LIMIT ?1 OFFSET ?2",
            Self::SELECT_HOLDER
        );
        let mut stmt = self.conn.prepare(&query)?;
        stmt.query_map(params![limit, offset], Self::row_to_holder)?
            .collect()
    }

    pub fn count(&self) -> rusqlite::Result<usize> {
        self.conn
            .query_row("SELECT COUNT(*) FROM holders", [], |row| row.get(0))
    }

    fn row_to_holder(row: &Row) -> rusqlite::Result<Holder> {
        Ok(Holder {
            address: codec::address_at(row, 0)?,
            incoming_sum: codec::u256_at(row, 1)?,
            outgoing_sum: codec::u256_at(row, 2)?,
            balance: codec::balance_at(row, 3)?,
            last_processed_height: row.get(4)?,
            estimate_balance: row.get(5)?,
            dirty: row.get(6)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::database::Database;
    use crate::repository::models::Balance;
    use alloy_primitives::U256;

    #[test]
    fn mark_dirty_keeps_existing_sums() {
        let db = Database::in_memory().unwrap();
        let conn = db.lock();
        let repo = HolderRepository::new(&conn);
        let addr = Address::repeat_byte(0xaa);

        let mut holder = Holder::empty(addr);
        holder.incoming_sum = U256::from(10);
        holder.balance = Balance::from_sums(U256::from(10), U256::ZERO);
        holder.last_processed_height = Some(3);
        repo.upsert(&holder).unwrap();

        repo.mark_dirty(&[addr, Address::repeat_byte(0xbb)]).unwrap();

        let stored = repo.get(&addr).unwrap().unwrap();
        assert!(stored.dirty);
        assert_eq!(stored.incoming_sum, U256::from(10));
        assert_eq!(stored.last_processed_height, Some(3));

        let created = repo.get(&Address::repeat_byte(0xbb)).unwrap().unwrap();
        assert!(created.dirty);
        assert_eq!(created.balance, Balance::ZERO);
        assert_eq!(repo.get_dirty(10).unwrap().len(), 2);
    }

    #[test]
    fn top_holders_sorted_by_estimate() {
        let db = Database::in_memory().unwrap();
        let conn = db.lock();
        let repo = HolderRepository::new(&conn);

        for (byte, estimate) in [(1u8, 5.0), (2, 50.0), (3, 0.5)] {
            let mut holder = Holder::empty(Address::repeat_byte(byte));
            holder.estimate_balance = estimate;
            repo.upsert(&holder).unwrap();
        }

        let top = repo.get_top(2, 0).unwrap();
        assert_eq!(top[0].address, Address::repeat_byte(2));
        assert_eq!(top[1].address, Address::repeat_byte(1));
        assert_eq!(repo.get_top(2, 2).unwrap().len(), 1);
        assert_eq!(repo.count().unwrap(), 3);
    }
}
