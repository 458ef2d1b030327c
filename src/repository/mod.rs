pub mod block_repository;
pub mod codec;
pub mod database;
pub mod holder_repository;
pub mod ledger_store;
pub mod models;
pub mod transaction_repository;
pub mod transfer_repository;

pub use block_repository::BlockRepository;
pub use database::Database;
pub use holder_repository::HolderRepository;
pub use ledger_store::{ApplySummary, HealSummary, SqliteLedger};
pub use models::{Block, BlockRef, Holder, HolderDelta, StateUpdate, Transaction, TransferEvent};
pub use transaction_repository::TransactionRepository;
pub use transfer_repository::{AddressSums, DayActivity, TransferRepository};
