//! Text encodings for chain values stored in SQLite.
//!
//! Addresses and hashes are stored as lowercase `0x` hex, amounts as base-10
//! strings so the full 256-bit range survives a round trip.

use super::models::Balance;
use alloy_primitives::{Address, B256, U256};
use rusqlite::Row;
use rusqlite::types::Type;
use std::str::FromStr;

pub fn address(address: &Address) -> String {
    format!("{address:?}")
}

pub fn hash(hash: &B256) -> String {
    format!("{hash:?}")
}

fn conversion_error<E>(idx: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

pub fn address_at(row: &Row, idx: usize) -> rusqlite::Result<Address> {
    Address::from_str(&row.get::<_, String>(idx)?).map_err(|e| conversion_error(idx, e))
}

pub fn opt_address_at(row: &Row, idx: usize) -> rusqlite::Result<Option<Address>> {
    row.get::<_, Option<String>>(idx)?
        .map(|raw| Address::from_str(&raw).map_err(|e| conversion_error(idx, e)))
        .transpose()
}

pub fn hash_at(row: &Row, idx: usize) -> rusqlite::Result<B256> {
    B256::from_str(&row.get::<_, String>(idx)?).map_err(|e| conversion_error(idx, e))
}

pub fn u256_at(row: &Row, idx: usize) -> rusqlite::Result<U256> {
    U256::from_str(&row.get::<_, String>(idx)?).map_err(|e| conversion_error(idx, e))
}

pub fn balance_at(row: &Row, idx: usize) -> rusqlite::Result<Balance> {
    Balance::from_str(&row.get::<_, String>(idx)?).map_err(|e| conversion_error(idx, e))
}

pub fn u128_at(row: &Row, idx: usize) -> rusqlite::Result<u128> {
    row.get::<_, String>(idx)?
        .parse::<u128>()
        .map_err(|e| conversion_error(idx, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stored_address_is_lowercase_hex() {
        let addr = Address::from_str("0x9d35B9DC0eF17Acc3a8872566694cDa9fb484f34").unwrap();
        assert_eq!(address(&addr), "0x9d35b9dc0ef17acc3a8872566694cda9fb484f34");
    }

    #[test]
    fn amounts_survive_sqlite_round_trip() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        let max = U256::MAX;
        let negative = Balance::from_sums(U256::ZERO, max);

        let (amount, balance) = conn
            .query_row(
                "SELECT ?1, ?2",
                rusqlite::params![max.to_string(), negative.to_string()],
                |row| Ok((u256_at(row, 0)?, balance_at(row, 1)?)),
            )
            .unwrap();

        assert_eq!(amount, max);
        assert_eq!(balance, negative);
    }
}
