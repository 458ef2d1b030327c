use anyhow::Result;
use clap::{Parser, Subcommand};
use erc20_ledger::config::Config;
use erc20_ledger::query::commands::{
    HistoryQuery, cmd_holder, cmd_stats, cmd_top_holders, cmd_transaction, cmd_transfers,
};
use erc20_ledger::query::formatters::OutputFormat;
use erc20_ledger::repository::{
    BlockRepository, Database, HolderRepository, TransactionRepository, TransferRepository,
};

#[derive(Parser)]
#[command(name = "query")]
#[command(about = "Query the indexed ERC20 ledger", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "table")]
    format: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Balance, totals and transfer history of one address
    Holder {
        address: String,
        #[arg(long, default_value = "15")]
        limit: usize,
        #[arg(long, default_value = "0")]
        offset: usize,
    },
    /// A transaction and the token events it emitted
    Tx {
        hash: String,
    },
    /// Latest transfers with settled balances and dates
    Txs {
        #[arg(long, default_value = "15")]
        limit: usize,
        #[arg(long, default_value = "0")]
        offset: usize,
    },
    Top {
        #[arg(default_value = "10")]
        count: usize,
        #[arg(long, default_value = "0")]
        offset: usize,
    },
    Info {
        #[arg(long, default_value = "7")]
        days: usize,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let format = OutputFormat::from(cli.format.as_str());

    let config = Config::from_env()?;
    let decimals = config.token_decimals;

    let db = Database::new(&config.database_url)?;
    let conn = db.lock();
    let holder_repo = HolderRepository::new(&conn);
    let transfer_repo = TransferRepository::new(&conn);

    match cli.command {
        Commands::Holder {
            address,
            limit,
            offset,
        } => {
            let query = HistoryQuery {
                address,
                limit,
                offset,
            };
            cmd_holder(&holder_repo, &transfer_repo, query, decimals, &format)?;
        }
        Commands::Tx { hash } => {
            let tx_repo = TransactionRepository::new(&conn);
            cmd_transaction(&tx_repo, &transfer_repo, &hash, decimals, &format)?;
        }
        Commands::Txs { limit, offset } => {
            cmd_transfers(&transfer_repo, limit, offset, decimals, &format)?;
        }
        Commands::Top { count, offset } => {
            cmd_top_holders(&holder_repo, count, offset, decimals, &format)?;
        }
        Commands::Info { days } => {
            let block_repo = BlockRepository::new(&conn);
            cmd_stats(&holder_repo, &block_repo, &transfer_repo, days, &format)?;
        }
    }

    Ok(())
}
