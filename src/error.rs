//! Error taxonomy shared by every pipeline stage.
//!
//! Lower layers (chain client, decoder, store) return these typed errors and
//! the assembler propagates them untouched, so a failed batch never reaches
//! the store half-built. The ingestion loop is the only place that catches
//! and continues.

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IndexerError {
    /// Transport failure talking to the node. Retried on the next cycle.
    #[error("network error: {0}")]
    Network(String),

    /// A chain call exceeded the configured request timeout.
    #[error("{operation} timed out after {}ms", .after.as_millis())]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    /// A log carried a known event signature but its payload did not decode.
    #[error("decode error: {0}")]
    Decode(String),

    /// Assembled data violated a structural constraint; the whole update is rejected.
    #[error("validation error: {0}")]
    Validation(String),

    /// A referenced block, transaction or reversal target does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The node answered with data that contradicts itself within one batch,
    /// usually because a reorg happened while the batch was being fetched.
    #[error("chain inconsistent: {0}")]
    ChainInconsistent(String),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl IndexerError {
    /// Whether the failure is expected to clear up by itself on a later cycle.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            IndexerError::Network(_)
                | IndexerError::Timeout { .. }
                | IndexerError::ChainInconsistent(_)
                | IndexerError::Storage(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, IndexerError>;
