use socratease_core::SocrateaseClient;
use socratease_sync::config::ConnectorConfig;
use socratease_sync::engine::SyncEngine;
use socratease_sync::sink::{MemorySink, SyncOp, Table};
use socratease_sync::state::SyncState;
use socratease_sync::store::SqliteStore;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CliMode {
    Run,
    DryRun,
    Help,
}

fn parse_cli_mode<I>(args: I) -> anyhow::Result<CliMode>
where
    I: IntoIterator<Item = String>,
{
    let mut mode = CliMode::Run;
    for arg in args.into_iter().skip(1) {
        match arg.as_str() {
            "--dry-run" => mode = CliMode::DryRun,
            "--help" | "-h" => mode = CliMode::Help,
            other => anyhow::bail!("unknown argument: {other}"),
        }
    }
    Ok(mode)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mode = parse_cli_mode(std::env::args())?;
    if mode == CliMode::Help {
        println!("Usage: socratease-sync [--dry-run]");
        println!("  --dry-run   Fetch everything and report batch sizes without writing");
        return Ok(());
    }

    let config = ConnectorConfig::from_env()?;
    let client = match config.base_url.as_deref() {
        Some(base_url) => SocrateaseClient::with_base_url(base_url, config.api_key.as_str())?,
        None => SocrateaseClient::new(config.api_key.as_str())?,
    };

    if mode == CliMode::DryRun {
        let mut engine = SyncEngine::new(client, MemorySink::default(), config.page_size);
        let state = engine.run(SyncState::default()).await?;
        for op in engine.into_sink().into_ops() {
            match op {
                SyncOp::Upsert { table, rows } => {
                    info!(table = table.as_str(), rows = rows.len(), "would upsert");
                }
                SyncOp::Checkpoint { state } => {
                    info!(units_last_ts = %state.units_last_ts, "would checkpoint");
                }
            }
        }
        info!(units_last_ts = %state.units_last_ts, "dry run complete");
        return Ok(());
    }

    let store = match config.database_path.as_deref() {
        Some(path) => SqliteStore::open(path).await?,
        None => SqliteStore::new_default().await?,
    };
    let prior = store.load_state().await?;
    let mut engine = SyncEngine::new(client, store, config.page_size);
    let state = engine.run(prior).await?;
    info!(units_last_ts = %state.units_last_ts, "sync complete");

    let store = engine.into_sink();
    for table in Table::ALL {
        let rows = store.count_rows(table).await?;
        info!(table = table.as_str(), rows, "destination row count");
    }

    Ok(())
}
