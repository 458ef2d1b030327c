use alloy::consensus::Transaction as _;
use alloy::providers::fillers::FillProvider;
use alloy::providers::{Provider, ProviderBuilder};
use alloy::rpc::types::{BlockNumberOrTag, Filter, Log};
use alloy::transports::TransportResult;
use alloy_primitives::{Address, B256, Bytes};
use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::timeout;
use tokio_retry::RetryIf;
use tokio_retry::strategy::{ExponentialBackoff, jitter};
use tracing::{debug, info, warn};

use crate::error::{IndexerError, Result};

type AlloyFullProvider = FillProvider<
    alloy::providers::fillers::JoinFill<
        alloy::providers::Identity,
        alloy::providers::fillers::JoinFill<
            alloy::providers::fillers::GasFiller,
            alloy::providers::fillers::JoinFill<
                alloy::providers::fillers::BlobGasFiller,
                alloy::providers::fillers::JoinFill<
                    alloy::providers::fillers::NonceFiller,
                    alloy::providers::fillers::ChainIdFiller,
                >,
            >,
        >,
    >,
    alloy::providers::RootProvider,
>;

const MAX_RESULTS_ERROR: &str = "exceeds max results";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainBlock {
    pub hash: B256,
    pub parent_hash: B256,
    pub height: u64,
    pub timestamp: u64,
    /// Empty unless the block was requested with transactions.
    pub transaction_hashes: Vec<B256>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainLog {
    pub address: Address,
    pub topics: Vec<B256>,
    pub data: Bytes,
    pub block_hash: B256,
    pub block_height: u64,
    pub tx_hash: B256,
    pub log_index: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxDetail {
    pub hash: B256,
    pub block_hash: B256,
    pub block_height: u64,
    pub index: u64,
    pub from: Address,
    pub to: Option<Address>,
    pub nonce: u64,
    pub gas_price: u128,
    pub gas_used: u64,
    pub gas_limit: u64,
    pub v: u64,
    pub r: B256,
    pub s: B256,
    /// Receipt logs in receipt order.
    pub logs: Vec<ChainLog>,
}

/// Read-only view of an EVM node.
#[async_trait]
pub trait ChainClient: Send + Sync {
    async fn get_height(&self) -> Result<u64>;

    /// `Ok(None)` when the node has no block at `height` yet.
    async fn get_block(&self, height: u64, include_txs: bool) -> Result<Option<ChainBlock>>;

    async fn get_transaction_with_receipt(&self, hash: B256) -> Result<Option<TxDetail>>;

    /// Logs emitted by `address` in `[from, to]`, inclusive.
    async fn get_logs(&self, address: Address, from: u64, to: u64) -> Result<Vec<ChainLog>>;
}

#[derive(Clone)]
pub struct RpcClient {
    providers: Vec<AlloyFullProvider>,
    urls: Vec<String>,
    current_provider: Arc<AtomicUsize>,
    request_timeout: Duration,
}

impl RpcClient {
    pub fn new(rpc_urls: &[String], request_timeout: Duration) -> anyhow::Result<Self> {
        if rpc_urls.is_empty() {
            return Err(anyhow::anyhow!("At least one RPC URL must be provided"));
        }

        let mut providers = Vec::new();
        for url in rpc_urls {
            let parsed_url = url
                .parse()
                .map_err(|_| anyhow::anyhow!("Invalid RPC URL: {}", url))?;
            let provider: AlloyFullProvider = ProviderBuilder::new().connect_http(parsed_url);
            providers.push(provider);
        }

        Ok(RpcClient {
            providers,
            urls: rpc_urls.to_vec(),
            current_provider: Arc::new(AtomicUsize::new(0)),
            request_timeout,
        })
    }

    fn get_provider(&self) -> &AlloyFullProvider {
        let index = self.current_provider.load(Ordering::Relaxed) % self.providers.len();
        &self.providers[index]
    }

    pub fn get_current_url(&self) -> &str {
        let index = self.current_provider.load(Ordering::Relaxed) % self.urls.len();
        &self.urls[index]
    }

    pub fn rotate_provider(&self) {
        let current = self.current_provider.load(Ordering::Relaxed);
        let next = (current + 1) % self.providers.len();
        self.current_provider.store(next, Ordering::Relaxed);

        if self.providers.len() > 1 {
            debug!("Rotating to RPC provider #{}", next);
        }
    }

    /// A single retry, on the next provider.
    fn get_retry_strategy(&self) -> impl Iterator<Item = Duration> {
        ExponentialBackoff::from_millis(100)
            .max_delay(Duration::from_secs(1))
            .map(jitter)
            .take(1)
    }

    fn handle_error(&self, operation: &str, error_str: &str) {
        warn!(
            "RPC error in {} on {}: {}, rotating provider",
            operation,
            self.get_current_url(),
            error_str
        );
        self.rotate_provider();
    }

    fn handle_timeout(&self, operation: &'static str) -> IndexerError {
        warn!(
            "{} timed out after {}ms on {}, rotating provider",
            operation,
            self.request_timeout.as_millis(),
            self.get_current_url()
        );
        self.rotate_provider();
        IndexerError::Timeout {
            operation,
            after: self.request_timeout,
        }
    }

    /// Runs one provider call under the request timeout. Transport errors are
    /// retried once on the next provider; timeouts and range-limit errors are not.
    async fn request<T, F, Fut>(&self, operation: &'static str, call: F) -> Result<T>
    where
        F: Fn(AlloyFullProvider) -> Fut,
        Fut: Future<Output = TransportResult<T>>,
    {
        let call = &call;
        RetryIf::start(
            self.get_retry_strategy(),
            move || async move {
                let provider = self.get_provider().clone();
                match timeout(self.request_timeout, call(provider)).await {
                    Ok(Ok(value)) => Ok(value),
                    Ok(Err(e)) => {
                        let error_str = e.to_string();
                        if !error_str.contains(MAX_RESULTS_ERROR) {
                            self.handle_error(operation, &error_str);
                        }
                        Err(IndexerError::Network(error_str))
                    }
                    Err(_) => Err(self.handle_timeout(operation)),
                }
            },
            |e: &IndexerError| {
                matches!(e, IndexerError::Network(message) if !message.contains(MAX_RESULTS_ERROR))
            },
        )
        .await
    }

    async fn get_logs_internal(
        &self,
        from_block: u64,
        to_block: u64,
        contract_address: Address,
    ) -> Result<Vec<Log>> {
        let filter = Filter::new()
            .address(contract_address)
            .from_block(from_block)
            .to_block(to_block);

        self.request("eth_getLogs", |provider| {
            let filter = filter.clone();
            async move { provider.get_logs(&filter).await }
        })
        .await
    }

    fn parse_max_results_error(error_str: &str) -> Option<(u64, u64)> {
        let re = Regex::new(r"retry with the range (\d+)-(\d+)").ok()?;
        let captures = re.captures(error_str)?;

        let from = captures.get(1)?.as_str().parse().ok()?;
        let to = captures.get(2)?.as_str().parse().ok()?;

        Some((from, to))
    }

    /// Fetches logs for the whole range, following the node's suggested
    /// sub-ranges when a single response would be too large.
    async fn get_logs_split(
        &self,
        from_block: u64,
        to_block: u64,
        contract_address: Address,
    ) -> Result<Vec<Log>> {
        let mut all_logs = Vec::new();
        let mut current_from = from_block;

        while current_from <= to_block {
            match self
                .get_logs_internal(current_from, to_block, contract_address)
                .await
            {
                Ok(logs) => {
                    all_logs.extend(logs);
                    break;
                }
                Err(IndexerError::Network(error_str)) if error_str.contains(MAX_RESULTS_ERROR) => {
                    let Some((suggested_from, suggested_to)) =
                        Self::parse_max_results_error(&error_str)
                    else {
                        return Err(IndexerError::Network(error_str));
                    };
                    if suggested_to < current_from {
                        return Err(IndexerError::Network(error_str));
                    }

                    info!(
                        "Hit max results limit for blocks {}-{}, splitting at block {}",
                        current_from, to_block, suggested_to
                    );

                    let logs = self
                        .get_logs_internal(suggested_from, suggested_to, contract_address)
                        .await?;
                    all_logs.extend(logs);
                    current_from = suggested_to + 1;
                }
                Err(e) => return Err(e),
            }
        }

        Ok(all_logs)
    }
}

fn chain_log(log: &Log) -> Result<ChainLog> {
    let missing = |field: &str| {
        IndexerError::ChainInconsistent(format!("log without {field} returned by node"))
    };

    Ok(ChainLog {
        address: log.address(),
        topics: log.topics().to_vec(),
        data: log.data().data.clone(),
        block_hash: log.block_hash.ok_or_else(|| missing("block hash"))?,
        block_height: log.block_number.ok_or_else(|| missing("block number"))?,
        tx_hash: log.transaction_hash.ok_or_else(|| missing("transaction hash"))?,
        log_index: log.log_index.ok_or_else(|| missing("log index"))?,
    })
}

#[async_trait]
impl ChainClient for RpcClient {
    async fn get_height(&self) -> Result<u64> {
        self.request("eth_blockNumber", |provider| async move {
            provider.get_block_number().await
        })
        .await
    }

    async fn get_block(&self, height: u64, include_txs: bool) -> Result<Option<ChainBlock>> {
        let block = self
            .request("eth_getBlockByNumber", |provider| async move {
                provider
                    .get_block_by_number(BlockNumberOrTag::Number(height))
                    .await
            })
            .await?;

        Ok(block.map(|block| ChainBlock {
            hash: block.header.hash,
            parent_hash: block.header.parent_hash,
            height: block.header.number,
            timestamp: block.header.timestamp,
            transaction_hashes: if include_txs {
                block.transactions.hashes().collect()
            } else {
                Vec::new()
            },
        }))
    }

    async fn get_transaction_with_receipt(&self, hash: B256) -> Result<Option<TxDetail>> {
        let (tx, receipt) = tokio::try_join!(
            self.request("eth_getTransactionByHash", |provider| async move {
                provider.get_transaction_by_hash(hash).await
            }),
            self.request("eth_getTransactionReceipt", |provider| async move {
                provider.get_transaction_receipt(hash).await
            }),
        )?;

        let (Some(tx), Some(receipt)) = (tx, receipt) else {
            return Ok(None);
        };

        let (Some(block_hash), Some(block_height)) = (receipt.block_hash, receipt.block_number)
        else {
            return Err(IndexerError::ChainInconsistent(format!(
                "transaction {hash:?} has a receipt without a block"
            )));
        };

        let signature = tx.inner.inner().signature();
        let logs = receipt
            .inner
            .logs()
            .iter()
            .map(chain_log)
            .collect::<Result<Vec<_>>>()?;

        Ok(Some(TxDetail {
            hash,
            block_hash,
            block_height,
            index: receipt.transaction_index.unwrap_or_default(),
            from: tx.inner.signer(),
            to: tx.to(),
            nonce: tx.nonce(),
            gas_price: tx.gas_price().unwrap_or(receipt.effective_gas_price),
            gas_used: receipt.gas_used,
            gas_limit: tx.gas_limit(),
            v: u64::from(signature.v()),
            r: B256::from(signature.r()),
            s: B256::from(signature.s()),
            logs,
        }))
    }

    async fn get_logs(&self, address: Address, from: u64, to: u64) -> Result<Vec<ChainLog>> {
        if from > to {
            return Ok(Vec::new());
        }
        self.get_logs_split(from, to, address)
            .await?
            .iter()
            .map(chain_log)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::transports::TransportErrorKind;

    fn two_providers() -> RpcClient {
        RpcClient::new(
            &[
                "http://localhost:8545".to_string(),
                "http://localhost:8546".to_string(),
            ],
            Duration::from_secs(1),
        )
        .unwrap()
    }

    #[test]
    fn parses_suggested_log_range() {
        let message = "query exceeds max results 10000, retry with the range 100-250";
        assert_eq!(
            RpcClient::parse_max_results_error(message),
            Some((100, 250))
        );
        assert_eq!(RpcClient::parse_max_results_error("connection reset"), None);
    }

    #[test]
    fn rejects_empty_or_invalid_urls() {
        assert!(RpcClient::new(&[], Duration::from_secs(1)).is_err());
        assert!(RpcClient::new(&["not a url".to_string()], Duration::from_secs(1)).is_err());
    }

    #[test]
    fn rotates_between_providers() {
        let client = two_providers();

        assert_eq!(client.get_current_url(), "http://localhost:8545");
        client.rotate_provider();
        assert_eq!(client.get_current_url(), "http://localhost:8546");
        client.rotate_provider();
        assert_eq!(client.get_current_url(), "http://localhost:8545");
    }

    #[tokio::test]
    async fn transport_error_is_retried_on_next_provider() {
        let client = two_providers();
        let attempts = AtomicUsize::new(0);

        let value = client
            .request("eth_blockNumber", |_| {
                let attempt = attempts.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt == 0 {
                        Err(TransportErrorKind::custom_str("connection reset"))
                    } else {
                        Ok(7u64)
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(value, 7);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert_eq!(client.get_current_url(), "http://localhost:8546");
    }

    #[tokio::test]
    async fn range_limit_error_is_not_retried() {
        let client = two_providers();
        let attempts = AtomicUsize::new(0);

        let result: Result<u64> = client
            .request("eth_getLogs", |_| {
                attempts.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(TransportErrorKind::custom_str(
                        "query exceeds max results 10000, retry with the range 1-5",
                    ))
                }
            })
            .await;

        assert!(matches!(result, Err(IndexerError::Network(m)) if m.contains(MAX_RESULTS_ERROR)));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert_eq!(client.get_current_url(), "http://localhost:8545");
    }
}
