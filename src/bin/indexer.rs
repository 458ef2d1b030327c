use anyhow::Result;
use erc20_ledger::aggregator::BalanceAggregator;
use erc20_ledger::assembler::{BlockAssembler, BlockService};
use erc20_ledger::backfill::DateBackfill;
use erc20_ledger::config::Config;
use erc20_ledger::ingestion::{BlockIngester, IngestionLoop, PollStep};
use erc20_ledger::reorg::{Healer, ReorgDetector};
use erc20_ledger::repository::{Database, SqliteLedger};
use erc20_ledger::rpc::{ChainClient, RpcClient};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting ERC20 ledger indexer");

    let config = Config::from_env()?;
    info!("Configuration loaded");
    info!("Contract address: {:?}", config.erc20_contract_address);
    info!(
        "RPC URLs: {} endpoint(s) configured",
        config.json_rpc_urls.len()
    );

    let db = Database::new(&config.database_url)?;
    info!("Database initialized");

    let client: Arc<dyn ChainClient> =
        Arc::new(RpcClient::new(&config.json_rpc_urls, config.request_timeout)?);
    info!("RPC client ready");

    let ledger = SqliteLedger::from_config(db.clone(), &config);
    let detector = Arc::new(ReorgDetector::new(client.clone(), ledger.clone(), &config));
    let service = BlockService::new(
        BlockAssembler::new(client.clone(), &config),
        detector.clone(),
    );

    let steps: Vec<Box<dyn PollStep>> = vec![
        Box::new(Healer::new(detector, ledger.clone(), config.force_heal_to)),
        Box::new(BlockIngester::new(
            Arc::new(service),
            Arc::new(ledger),
            Some(config.erc20_contract_address),
            config.start_height,
        )),
        Box::new(BalanceAggregator::new(db.clone(), &config)),
        Box::new(DateBackfill::new(db, client)),
    ];

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {}", e);
            return;
        }
        info!("Shutdown requested");
        shutdown.cancel();
    });

    IngestionLoop::new(steps, config.poll_interval, config.error_backoff, cancel)
        .run()
        .await;

    Ok(())
}
