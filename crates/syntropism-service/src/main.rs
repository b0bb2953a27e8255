use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use syntropism_core::Credits;
use syntropism_service::ticker::ClearingTicker;
use syntropism_service::{build_router, ServiceConfig, ServiceState};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "syntropismd", version, about = "Syntropism resource economy service")]
struct Cli {
    /// JSON file with the economy configuration. Defaults apply when absent.
    #[arg(long, env = "SYNTROPISM_CONFIG")]
    config: Option<PathBuf>,
    /// REST socket address to bind, e.g. 127.0.0.1:8093
    #[arg(long, default_value = "127.0.0.1:8093", env = "SYNTROPISM_LISTEN")]
    listen: SocketAddr,
    /// Clearing period in milliseconds, clamped to 100..=10000.
    #[arg(long, default_value_t = 1_000, env = "SYNTROPISM_TICK_MS")]
    tick_ms: u64,
    /// Disable the periodic ticker; cycles then only run via POST /v1/cycles.
    #[arg(long, default_value_t = false)]
    no_ticker: bool,
    /// Persist state to this JSON file instead of keeping it in memory.
    #[arg(long, env = "SYNTROPISM_STATE_FILE")]
    state_file: Option<PathBuf>,
    /// Endowment of the genesis agent, in whole credits.
    #[arg(long, env = "SYNTROPISM_GENESIS_CREDITS")]
    genesis_credits: Option<u64>,
}

fn resolve_config(cli: &Cli) -> anyhow::Result<ServiceConfig> {
    let mut config = match &cli.config {
        Some(path) => ServiceConfig::from_file(path)?,
        None => ServiceConfig::default(),
    };
    config = config.with_tick_interval(Duration::from_millis(cli.tick_ms));
    if let Some(path) = &cli.state_file {
        config = config.with_state_file(path.clone());
    }
    if let Some(credits) = cli.genesis_credits {
        config = config.with_genesis_credits(Credits::from_credits(credits));
    }
    config.economy.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                EnvFilter::new("syntropism_service=info,syntropism_core=info,info")
            }),
        )
        .init();

    let cli = Cli::parse();
    let config = resolve_config(&cli)?;
    let tick_interval = config.tick_interval;
    let state = ServiceState::bootstrap(config).await?;
    info!(
        storage = state.economy.storage_label(),
        cycle = state.economy.current_cycle().await,
        "Economy ready"
    );

    let ticker = if cli.no_ticker {
        None
    } else {
        Some(ClearingTicker::new(state.economy.clone(), tick_interval).spawn())
    };

    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(cli.listen).await?;
    info!("syntropism-service REST listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown requested");
        })
        .await?;

    if let Some(ticker) = ticker {
        ticker.shutdown().await;
    }
    Ok(())
}
