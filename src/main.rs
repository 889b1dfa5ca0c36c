use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use imap_sync_core::config::Config;
use imap_sync_core::mail::registry::AccountRegistry;
use imap_sync_core::store::{MessageStore, SqliteMessageStore};

struct Cli {
    config_path: PathBuf,
    log_level: Option<String>,
}

fn print_usage() {
    eprintln!(
        r#"syncd - multi-account IMAP sync core

Usage: syncd [options]

Options:
    --config <path>      Path to the account configuration TOML file
                          (default: $XDG_CONFIG_HOME/imap-sync-core/config.toml)
    --log-level <level>  Log level/filter passed to `tracing_subscriber::EnvFilter`
                          (default: $RUST_LOG, or "info")
    -h, --help           Show this help message
"#
    );
}

fn parse_args() -> Result<Option<Cli>> {
    let mut config_path = None;
    let mut log_level = None;

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => {
                let value = args.next().context("--config requires a path argument")?;
                config_path = Some(PathBuf::from(value));
            }
            "--log-level" => {
                let value = args.next().context("--log-level requires a value")?;
                log_level = Some(value);
            }
            "-h" | "--help" => {
                print_usage();
                return Ok(None);
            }
            other => {
                eprintln!("Unknown argument: {other}");
                print_usage();
                anyhow::bail!("unknown argument: {other}");
            }
        }
    }

    let config_path = match config_path {
        Some(path) => path,
        None => Config::config_path()?,
    };

    Ok(Some(Cli { config_path, log_level }))
}

fn setup_logging(cli_log_level: Option<&str>) {
    let filter = cli_log_level
        .map(EnvFilter::new)
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

/// Resolves to completion on SIGINT, and on Unix also SIGTERM.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let Some(cli) = parse_args()? else {
        return Ok(());
    };

    setup_logging(cli.log_level.as_deref());

    let config = Config::load(&cli.config_path)
        .with_context(|| format!("failed to load config from {}", cli.config_path.display()))?;

    if config.accounts.is_empty() {
        tracing::warn!("no accounts configured; nothing to sync");
        return Ok(());
    }

    let data_dir = Config::data_dir()?;
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("failed to create data directory {}", data_dir.display()))?;
    let database_path = data_dir.join("sync.sqlite3");
    let database_url = format!("sqlite://{}?mode=rwc", database_path.display());

    let store: Arc<dyn MessageStore> = Arc::new(SqliteMessageStore::connect(&database_url).await?);

    let registry = Arc::new(AccountRegistry::new(config, store));
    let mut run_handle = tokio::spawn({
        let registry = registry.clone();
        async move { registry.run().await }
    });

    tokio::select! {
        result = &mut run_handle => result??,
        _ = shutdown_signal() => {
            tracing::info!("shutdown signal received");
            registry.shutdown();
            run_handle.await??;
        }
    }

    Ok(())
}
