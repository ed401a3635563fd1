//! Options trading daemon - entry point.
//!
//! One subcommand: `run`. Loads a JSON config, wires the account poller,
//! lifecycle manager, and configured strategy runners together, and drives
//! them with a fixed-interval event loop until Ctrl+C.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use coincall_options_trader::account::{AccountPoller, AccountSnapshot};
use coincall_options_trader::config::AppConfig;
use coincall_options_trader::market_data::HttpMarketDataSource;
use coincall_options_trader::oms::{BlockQuoteExecutor, ExecutionRouter, LifecycleManager};
use coincall_options_trader::persistence::TradeStatePersistence;
use coincall_options_trader::strategy::{ChainOptionSelector, StrategyConfig, StrategyRunner, StrategyRunnerRegistry};
use coincall_options_trader::types::Symbol;
use coincall_options_trader::venue::HttpVenueTransport;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock as StdRwLock};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "coincall-options-trader")]
#[command(about = "Automated multi-leg options trading daemon for a single crypto options venue", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the trading daemon
    Run {
        /// Path to configuration file
        #[arg(short, long, default_value = "config.json")]
        config: String,

        /// Paper trading mode (no orders sent to the venue)
        #[arg(long)]
        paper: bool,

        /// Live trading mode (CAUTION - real money)
        #[arg(long)]
        live: bool,
    },
}

fn setup_logging(verbose: bool, command_name: &str) -> Result<()> {
    std::fs::create_dir_all("logs")?;

    let log_filename = format!("{}_{}.log", command_name, chrono::Local::now().format("%Y-%m-%d_%H-%M-%S"));
    let log_path = PathBuf::from("logs").join(&log_filename);

    let level = if verbose { "debug" } else { "info" };
    let filter_str = format!("{level},hyper=warn,hyper_util=warn,reqwest=warn,rustls=warn,h2=warn");
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&filter_str));

    let file_appender = tracing_appender::rolling::never("logs", &log_filename);

    let console_layer = tracing_subscriber::fmt::layer().with_target(true).with_line_number(true).with_ansi(true);
    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(file_appender)
        .with_target(true)
        .with_line_number(true)
        .with_ansi(false);

    tracing_subscriber::registry().with(env_filter).with(console_layer).with(file_layer).init();

    info!("Logging initialized");
    info!(path = %log_path.display(), "log file");
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Commands::Run { .. } => setup_logging(cli.verbose, "run")?,
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;

    match cli.command {
        Commands::Run { config, paper, live } => {
            if !paper && !live {
                anyhow::bail!("must specify either --paper or --live mode");
            }
            if paper && live {
                anyhow::bail!("cannot specify both --paper and --live modes");
            }
            runtime.block_on(run_async(config, paper))
        }
    }
}

async fn run_async(config_path: String, paper_mode: bool) -> Result<()> {
    dotenv::dotenv().ok();

    let config = AppConfig::from_file(&config_path).context(format!("failed to load config from {config_path}"))?;

    let mode_str = if paper_mode { "PAPER" } else { "LIVE" };
    info!(mode = mode_str, strategies = config.strategies.len(), "starting options trading daemon");

    if !paper_mode {
        warn!("LIVE TRADING MODE - real money at risk");
        warn!("press Ctrl+C within 10 seconds to abort");
        for i in (1..=10).rev() {
            info!(seconds_remaining = i, "starting");
            sleep(Duration::from_secs(1)).await;
        }
    }

    let credentials = config.venue.credentials()?;
    let client_config = config.venue.client_config();
    let transport: Arc<dyn coincall_options_trader::venue::VenueTransport> =
        Arc::new(HttpVenueTransport::new(credentials, client_config));

    let market_data: Arc<dyn coincall_options_trader::market_data::MarketDataSource> =
        Arc::new(HttpMarketDataSource::new(config.venue.base_url.clone()));

    let router = ExecutionRouter::new(config.execution.router);
    let rfq_executor = BlockQuoteExecutor::new(Default::default());
    let persistence = TradeStatePersistence::new(config.state_file.clone());

    let lifecycle = Arc::new(LifecycleManager::new(
        transport.clone(),
        market_data.clone(),
        router,
        rfq_executor,
        persistence,
    ));

    let selector: Arc<dyn coincall_options_trader::strategy::OptionSelector> = Arc::new(ChainOptionSelector::new(market_data.clone()));

    // Exit predicates read current leg marks synchronously off this cache
    // rather than awaiting the market-data source directly; the cache is
    // refreshed once per loop tick before predicates are evaluated. A leg
    // with no cached mark yet reports its own fill price, so an unpriced
    // leg never looks like a loss.
    let mark_cache: Arc<StdRwLock<HashMap<Symbol, Decimal>>> = Arc::new(StdRwLock::new(HashMap::new()));

    let mut registry = StrategyRunnerRegistry::new();
    for def in &config.strategies {
        let mark_of = {
            let cache = mark_cache.clone();
            Arc::new(move |leg: &coincall_options_trader::oms::Leg| {
                cache.read().unwrap().get(&leg.symbol).copied().unwrap_or(leg.avg_fill_price)
            })
        };
        let strategy_config = StrategyConfig {
            strategy_id: def.strategy_id.clone(),
            check_interval_secs: def.check_interval_secs,
            max_concurrent_trades: def.max_concurrent_trades,
            cooldown_secs: def.cooldown_secs,
            max_trades_per_day: def.max_trades_per_day,
            leg_templates: def.legs.clone(),
            rfq_action: def.rfq_action,
            entry_predicates: def.entry_predicates.iter().cloned().map(|spec| spec.build()).collect(),
            exit_predicates: def.exit_predicates.iter().cloned().map(|spec| spec.build(mark_of.clone())).collect(),
        };
        registry.register(Arc::new(StrategyRunner::new(strategy_config, selector.clone(), None)));
    }
    let registry = Arc::new(registry);

    let poller = Arc::new(tokio::sync::Mutex::new(AccountPoller::new(transport.clone(), Duration::from_secs(config.poller_interval_seconds))));

    let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("received Ctrl+C, initiating shutdown");
                let _ = shutdown_tx.send(()).await;
            }
            Err(e) => error!(error = %e, "failed to install signal handler"),
        }
    });

    // The poller's own interval task is the single clock driving the
    // trading loop: every published snapshot fans out through this
    // listener to a tick pass, rather than a second, separately-timed
    // interval racing the poller's internal one to read `latest()`.
    {
        let lifecycle = lifecycle.clone();
        let registry = registry.clone();
        let market_data = market_data.clone();
        let mark_cache = mark_cache.clone();
        poller.lock().await.register_listener(Arc::new(move |snapshot: AccountSnapshot| {
            let lifecycle = lifecycle.clone();
            let registry = registry.clone();
            let market_data = market_data.clone();
            let mark_cache = mark_cache.clone();
            tokio::spawn(async move {
                lifecycle.tick_all(&snapshot).await;
                refresh_mark_cache(&lifecycle, &registry, market_data.as_ref(), &mark_cache).await;
                registry.tick_all(&snapshot, &lifecycle).await;
            });
        }));
    }

    poller.lock().await.start();
    spawn_health_reporter(poller.clone(), lifecycle.clone(), registry.clone());

    info!("entering trading loop");
    shutdown_rx.recv().await;
    info!("shutdown signal received");

    poller.lock().await.stop().await;
    info!("options trading daemon stopped");
    Ok(())
}

/// Logs uptime, equity, available margin, margin utilization, net delta,
/// and open-position count every 5 minutes (spec.md:270), mirroring
/// `original_source/health_check.py`'s periodic health report.
fn spawn_health_reporter(
    poller: Arc<tokio::sync::Mutex<AccountPoller>>,
    lifecycle: Arc<LifecycleManager>,
    registry: Arc<StrategyRunnerRegistry>,
) {
    let started_at = Instant::now();
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(300));
        loop {
            tick.tick().await;
            let Some(snapshot) = poller.lock().await.latest() else {
                continue;
            };
            let mut open_positions = 0usize;
            for strategy_id in registry.strategy_ids() {
                open_positions += lifecycle.active_trades_for(&strategy_id).await.len();
            }
            info!(
                uptime_secs = started_at.elapsed().as_secs(),
                equity = %snapshot.equity,
                available_margin = %snapshot.available_margin,
                margin_utilization_pct = %snapshot.margin_utilization_pct(),
                net_delta = %snapshot.net_delta(),
                open_positions,
                "health report"
            );
        }
    });
}

/// Refreshes the synchronous mark-price cache exit predicates read from, by
/// looking up option details for every leg of every active trade across
/// all registered strategies.
async fn refresh_mark_cache(
    lifecycle: &LifecycleManager,
    registry: &StrategyRunnerRegistry,
    market_data: &dyn coincall_options_trader::market_data::MarketDataSource,
    cache: &StdRwLock<HashMap<Symbol, Decimal>>,
) {
    for strategy_id in registry.strategy_ids() {
        for trade in lifecycle.active_trades_for(&strategy_id).await {
            for leg in trade.open_legs.iter().chain(trade.close_legs.iter()) {
                match market_data.get_option_details(&leg.symbol).await {
                    Ok(Some(details)) => {
                        cache.write().unwrap().insert(leg.symbol.clone(), details.mark);
                    }
                    Ok(None) => {}
                    Err(e) => {
                        tracing::debug!(symbol = %leg.symbol, error = %e, "mark price refresh failed");
                    }
                }
            }
        }
    }
}
