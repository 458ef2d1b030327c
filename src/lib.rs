pub mod aggregator;
pub mod api;
pub mod assembler;
pub mod backfill;
pub mod bus;
pub mod config;
pub mod error;
pub mod events;
pub mod ingestion;
pub mod query;
pub mod reorg;
pub mod repository;
pub mod rpc;

#[cfg(test)]
pub(crate) mod test_utils;
