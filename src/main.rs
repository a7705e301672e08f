use std::env;
use std::io;
use std::sync::Arc;

use anyhow::{Context, Result};
use ledger_bank::config::StoreBackend;
use ledger_bank::csv::{read_steps, write_accounts};
use ledger_bank::store::{LedgerStore, MemoryLedger, SqliteLedger};
use ledger_bank::{Bank, BankConfig};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let config = BankConfig::from_env().context("invalid configuration")?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.logging.level)),
        )
        .with_writer(io::stderr)
        .init();

    let path = env::args()
        .nth(1)
        .context("usage: ledger-bank <script.csv>")?;

    if !path.ends_with(".csv") {
        warn!(path, "input file seems to not be a csv file");
    }

    let store: Arc<dyn LedgerStore> = match config.store.backend {
        StoreBackend::Memory => Arc::new(MemoryLedger::new()),
        StoreBackend::Sqlite => Arc::new(
            SqliteLedger::open(&config.store.sqlite_path, config.store.busy_timeout)
                .with_context(|| {
                    format!("opening {}", config.store.sqlite_path.display())
                })?,
        ),
    };

    let bank = Bank::new(config, store);
    bank.bootstrap().await?;

    let steps = read_steps(path.clone())?;
    let (step_sender, step_receiver) = tokio::sync::mpsc::channel(16);

    tokio::spawn(async move {
        for result in steps {
            match result {
                Ok(step) => {
                    if step_sender.send(step).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!("{e}");
                }
            }
        }
    });

    let summary = bank.run(ReceiverStream::new(step_receiver)).await;
    info!(
        applied = summary.applied,
        rejected = summary.rejected,
        "script finished"
    );

    let accounts = bank.account_summaries().await?;
    write_accounts(io::stdout().lock(), &accounts)?;
    Ok(())
}
