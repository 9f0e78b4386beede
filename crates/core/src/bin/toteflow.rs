//! `toteflow` daemon and operator tools.
//!
//! ```text
//! toteflow [serve]                  run the HTTP API and the hourly sweep
//! toteflow sweep                    run one sweep against the configured ledger
//! toteflow quote 1000 [--token USDC] [--rate-bps 1000]
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};

use toteflow::accrual::calculator::{format_units, parse_units, project, BasisPoints};
use toteflow::accrual::ledger::{InMemoryLedger, LedgerStore};
use toteflow::accrual::rates::RateOracle;
use toteflow::accrual::scheduler::AccrualScheduler;
use toteflow::accrual::service::AccrualService;
use toteflow::api::{self, ApiState};
use toteflow::config::AccrualConfig;
use toteflow::util::time_source::{shared, RealTime};

const QUOTE_HORIZONS_DAYS: [u32; 5] = [1, 7, 30, 90, 365];

#[derive(Parser, Debug)]
#[command(name = "toteflow", version, about = "ToteFlow yield accrual service")]
struct Cli {
    /// TOML configuration file.
    #[arg(long, env = "TOTEFLOW_CONFIG")]
    config: Option<PathBuf>,

    /// Overrides `listen_addr`.
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Overrides `database_path`.
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// Emit logs as JSON lines.
    #[arg(long, env = "TOTEFLOW_LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the HTTP API and run the periodic sweep (default).
    Serve,
    /// Run a single accrual sweep and exit.
    Sweep,
    /// Print projected yield, fee and payout for a principal.
    Quote {
        /// Principal in whole token units, e.g. `1000` or `250.5`.
        amount: String,
        #[arg(long, default_value = "USDC")]
        token: String,
        /// Annual rate; defaults to the configured fallback rate.
        #[arg(long)]
        rate_bps: Option<u32>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let mut config = AccrualConfig::load(cli.config.as_deref())?;
    if let Some(listen) = cli.listen {
        config.listen_addr = listen;
    }
    if let Some(path) = cli.db_path {
        config.database_path = Some(path);
    }

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config).await,
        Command::Sweep => sweep_once(config).await,
        Command::Quote {
            amount,
            token,
            rate_bps,
        } => quote(&config, &amount, &token, rate_bps),
    }
}

#[cfg(feature = "trace")]
fn init_tracing(json: bool) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[cfg(not(feature = "trace"))]
fn init_tracing(_json: bool) {}

fn open_store(config: &AccrualConfig) -> anyhow::Result<Arc<dyn LedgerStore>> {
    match &config.database_path {
        #[cfg(feature = "redb")]
        Some(path) => {
            let ledger = toteflow::accrual::redb_store::RedbLedger::open(path)
                .with_context(|| format!("opening ledger at {}", path.display()))?;
            Ok(Arc::new(ledger))
        }
        #[cfg(not(feature = "redb"))]
        Some(path) => anyhow::bail!(
            "database_path {} set but this build has no redb support",
            path.display()
        ),
        None => {
            tracing::warn!("No database_path configured, ledger is in memory only");
            Ok(Arc::new(InMemoryLedger::new()))
        }
    }
}

fn build_service(config: &AccrualConfig) -> anyhow::Result<Arc<AccrualService>> {
    let store = open_store(config)?;
    let rates = RateOracle::from_config(config).context("building rate oracle")?;
    Ok(Arc::new(AccrualService::new(
        store,
        Arc::new(rates),
        shared(RealTime),
        config.fee_rate()?,
        config.tokens.clone(),
    )))
}

async fn serve(config: AccrualConfig) -> anyhow::Result<()> {
    let service = build_service(&config)?;
    let scheduler = Arc::new(AccrualScheduler::new(service.clone(), config.sweep_interval()));
    let sweeps = scheduler.clone().start();

    let app = api::router(ApiState { service, scheduler });
    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("binding {}", config.listen_addr))?;
    tracing::info!(addr = %config.listen_addr, "ToteFlow: listening");

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    sweeps.stop().await;
    tracing::info!("ToteFlow: stopped");
    served.context("HTTP server failed")
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "ToteFlow: cannot listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("ToteFlow: shutdown requested");
}

async fn sweep_once(config: AccrualConfig) -> anyhow::Result<()> {
    let service = build_service(&config)?;
    let scheduler = AccrualScheduler::new(service, config.sweep_interval());
    let report = scheduler.run_now().await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn quote(
    config: &AccrualConfig,
    amount: &str,
    token: &str,
    rate_bps: Option<u32>,
) -> anyhow::Result<()> {
    let token = config
        .tokens
        .iter()
        .find(|t| t.symbol == token)
        .with_context(|| format!("unknown token {token:?}"))?;
    let principal = parse_units(amount, token.decimals)?;
    let rate = BasisPoints::new(rate_bps.unwrap_or(config.fallback_rate_bps));
    let fee = config.fee_rate()?;
    let units = |a| format_units(a, token.decimals);

    println!(
        "{} {} at {} APY, platform fee {} of yield",
        units(principal),
        token.symbol,
        rate,
        fee.bps()
    );
    println!(
        "{:>5}  {:>20}  {:>20}  {:>20}  {:>22}",
        "days", "yield", "platform fee", "payee yield", "payout"
    );
    for days in QUOTE_HORIZONS_DAYS {
        let p = project(principal, rate, fee, days)?;
        println!(
            "{:>5}  {:>20}  {:>20}  {:>20}  {:>22}",
            p.days,
            units(p.yield_amount),
            units(p.platform_fee),
            units(p.payee_amount),
            units(p.payout)
        );
    }
    Ok(())
}
