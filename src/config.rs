use alloy_primitives::Address;
use anyhow::{Context, Result};
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub json_rpc_urls: Vec<String>,
    pub request_timeout: Duration,
    pub erc20_contract_address: Address,
    pub token_decimals: u8,
    pub database_url: String,
    pub start_height: u64,
    pub max_lookup_distance: u64,
    pub tx_fetch_concurrency: usize,
    pub heal_lookup_distance: u64,
    pub heal_batch_size: usize,
    pub force_heal_to: Option<u64>,
    pub balance_batch_size: usize,
    pub keep_empty_transactions: bool,
    pub scan_block_transactions: bool,
    pub poll_interval: Duration,
    pub error_backoff: Duration,
    pub http_port: u16,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        // JSON_RPC_URLS takes a comma separated list; JSON_RPC_URL is the single-node shorthand.
        let json_rpc_urls: Vec<String> = std::env::var("JSON_RPC_URLS")
            .or_else(|_| std::env::var("JSON_RPC_URL"))
            .context("JSON_RPC_URLS or JSON_RPC_URL must be set in .env")?
            .split(',')
            .map(|url| url.trim().to_string())
            .filter(|url| !url.is_empty())
            .collect();

        let contract_address_str = std::env::var("ERC20_CONTRACT_ADDRESS")
            .context("ERC20_CONTRACT_ADDRESS must be set in .env")?;

        let erc20_contract_address = Address::from_str(contract_address_str.trim())
            .context("Invalid ERC20_CONTRACT_ADDRESS format")?;

        let database_url = std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| "sqlite:./indexer.db".to_string());

        let force_heal_to = match std::env::var("FORCE_HEAL_TO") {
            Ok(raw) => {
                let height: i64 = raw
                    .trim()
                    .parse()
                    .with_context(|| format!("Invalid FORCE_HEAL_TO value: {raw}"))?;
                u64::try_from(height).ok()
            }
            Err(_) => None,
        };

        let config = Config {
            json_rpc_urls,
            request_timeout: Duration::from_millis(env_or("REQUEST_TIMEOUT_MS", 5_000)?),
            erc20_contract_address,
            token_decimals: env_or("TOKEN_DECIMALS", 18)?,
            database_url,
            start_height: env_or("FROM_BLOCK", 0)?,
            max_lookup_distance: env_or("BLOCK_MAX_LOOKUP_DISTANCE", 10)?,
            tx_fetch_concurrency: env_or("BLOCK_REQUEST_TX_BATCH", 30)?,
            heal_lookup_distance: env_or("HEAL_LOOKUP_DISTANCE", 50)?,
            heal_batch_size: env_or("HEAL_BATCH_SIZE", 250)?,
            force_heal_to,
            balance_batch_size: env_or("BALANCE_BATCH_SIZE", 100)?,
            keep_empty_transactions: env_or("KEEP_EMPTY_TRANSACTIONS", true)?,
            scan_block_transactions: env_or("SCAN_BLOCK_TRANSACTIONS", false)?,
            poll_interval: Duration::from_millis(env_or("POLL_INTERVAL_MS", 100)?),
            error_backoff: Duration::from_millis(env_or("ERROR_BACKOFF_MS", 500)?),
            http_port: env_or("PORT", 3000)?,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.json_rpc_urls.is_empty() {
            anyhow::bail!("At least one RPC URL must be provided");
        }
        if self.max_lookup_distance == 0 {
            anyhow::bail!("BLOCK_MAX_LOOKUP_DISTANCE must be greater than zero");
        }
        if self.tx_fetch_concurrency == 0 {
            anyhow::bail!("BLOCK_REQUEST_TX_BATCH must be greater than zero");
        }
        if self.heal_lookup_distance == 0 || self.heal_batch_size == 0 {
            anyhow::bail!("HEAL_LOOKUP_DISTANCE and HEAL_BATCH_SIZE must be greater than zero");
        }
        if self.balance_batch_size == 0 {
            anyhow::bail!("BALANCE_BATCH_SIZE must be greater than zero");
        }
        if self.request_timeout.is_zero() {
            anyhow::bail!("REQUEST_TIMEOUT_MS must be greater than zero");
        }
        Ok(())
    }
}

fn env_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("Invalid {key} value: {raw}")),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
pub(crate) fn test_config() -> Config {
    Config {
        json_rpc_urls: vec!["http://localhost:8545".to_string()],
        request_timeout: Duration::from_secs(5),
        erc20_contract_address: crate::test_utils::TOKEN,
        token_decimals: 18,
        database_url: ":memory:".to_string(),
        start_height: 0,
        max_lookup_distance: 10,
        tx_fetch_concurrency: 4,
        heal_lookup_distance: 50,
        heal_batch_size: 2,
        force_heal_to: None,
        balance_batch_size: 10,
        keep_empty_transactions: true,
        scan_block_transactions: false,
        poll_interval: Duration::from_millis(1),
        error_backoff: Duration::from_millis(1),
        http_port: 3000,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_rejects_zero_bounds() {
        let mut config = test_config();
        assert!(config.validate().is_ok());

        config.max_lookup_distance = 0;
        assert!(config.validate().is_err());

        let mut config = test_config();
        config.json_rpc_urls.clear();
        assert!(config.validate().is_err());

        let mut config = test_config();
        config.heal_batch_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn env_or_falls_back_to_default() {
        let value: u64 = env_or("ERC20_LEDGER_TEST_UNSET_KEY", 42).unwrap();
        assert_eq!(value, 42);
    }
}
