//! Polymarket up/down sniper entry point.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::Duration;

use clap::{Parser, Subcommand};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use polymarket_sniper::api::{create_router, AppState};
use polymarket_sniper::config::Config;
use polymarket_sniper::market::{CandidateFilter, GammaScanner, Market, MarketScanner, SidePick};
use polymarket_sniper::metrics;
use polymarket_sniper::error::BotError;
use polymarket_sniper::signing::{address_of, Credentials};
use polymarket_sniper::sniper::{http_client, live_context, run_session, side_pick, SniperSupervisor};
use polymarket_sniper::utils::{shutdown_signal, stop_channel};

/// Last-second Fill-or-Kill sniper for Polymarket up/down markets.
#[derive(Parser, Debug)]
#[command(name = "polymarket-sniper")]
#[command(about = "Buys the likely winner of short crypto up/down markets just before resolution")]
#[command(version)]
struct Args {
    /// Enable verbose logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Option<Command>,

    /// Run in dry-run mode (no real orders).
    #[arg(long)]
    dry_run: Option<bool>,

    /// HTTP server port for health/status.
    #[arg(short, long)]
    port: Option<u16>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Scan for markets and snipe them until stopped (default).
    Run {
        /// Run in dry-run mode (no real orders).
        #[arg(long)]
        dry_run: Option<bool>,

        /// HTTP server port for health/status.
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Snipe one known market and exit.
    Snipe {
        /// Condition id.
        #[arg(long)]
        market_id: String,

        /// Up (YES) token id.
        #[arg(long)]
        up_token: String,

        /// Down (NO) token id.
        #[arg(long)]
        down_token: String,

        /// Resolution deadline, RFC 3339.
        #[arg(long)]
        deadline: String,

        /// up, down or favorite. Defaults to SIDE.
        #[arg(long)]
        side: Option<String>,

        /// Run in dry-run mode (no real orders).
        #[arg(long)]
        dry_run: Option<bool>,
    },

    /// Check configuration validity.
    CheckConfig,

    /// Run the scanner once and print the candidate market.
    Discover,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments
    let args = Args::parse();

    // .env must be visible before RUST_LOG is read
    dotenvy::dotenv().ok();

    // Initialize logging
    let filter = if args.verbose {
        EnvFilter::new("polymarket_sniper=debug,info")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    if args.json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter)
            .init();
    }

    // Initialize metrics
    metrics::init_metrics();

    // Handle subcommands
    match args.command {
        Some(Command::CheckConfig) => cmd_check_config().await,
        Some(Command::Discover) => cmd_discover().await,
        Some(Command::Run { dry_run, port }) => cmd_run(dry_run.or(args.dry_run), port.or(args.port)).await,
        Some(Command::Snipe {
            market_id,
            up_token,
            down_token,
            deadline,
            side,
            dry_run,
        }) => cmd_snipe(market_id, up_token, down_token, deadline, side, dry_run.or(args.dry_run)).await,
        None => cmd_run(args.dry_run, args.port).await,
    }
}

/// Load and validate configuration, applying the CLI dry-run override.
fn load_config(dry_run_override: Option<bool>) -> anyhow::Result<Config> {
    info!("Loading configuration...");
    let mut config = Config::load().map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    // Override with CLI args if provided
    if let Some(dry_run) = dry_run_override {
        config.dry_run = dry_run;
    }

    if let Err(e) = config.validate() {
        error!("Invalid configuration: {}", e);
        return Err(anyhow::anyhow!("Configuration validation failed: {}", e));
    }

    Ok(config)
}

/// Check configuration validity.
async fn cmd_check_config() -> anyhow::Result<()> {
    println!("======================================================================");
    println!("POLYMARKET SNIPER - CONFIGURATION CHECK");
    println!("======================================================================");

    // Load configuration
    print!("Loading configuration... ");
    let mut config = match Config::load() {
        Ok(c) => {
            println!("OK");
            c
        }
        Err(e) => {
            println!("FAILED");
            println!("  Error: {}", e);
            return Err(anyhow::anyhow!("Configuration load failed"));
        }
    };

    // Validate configuration
    print!("Validating configuration... ");
    match config.validate() {
        Ok(()) => println!("OK"),
        Err(e) => {
            println!("FAILED");
            println!("  Error: {}", e);
            return Err(anyhow::anyhow!("Configuration validation failed"));
        }
    }

    let api_configured = config.polymarket_api_key.is_some();

    // Check private key
    print!("Checking private key... ");
    let signer = Credentials::take_from(&mut config).and_then(|c| c.signer().map_err(BotError::from));
    match signer {
        Ok(signer) => {
            println!("OK");
            println!("  Wallet address: {}", address_of(&signer));
        }
        Err(e) => {
            println!("FAILED");
            println!("  Error: {}", e);
            return Err(anyhow::anyhow!("Private key invalid"));
        }
    }

    // Show configuration summary
    println!("----------------------------------------------------------------------");
    println!("Configuration Summary:");
    println!("  Signature Type: {} ({})", config.polymarket_signature_type,
        match config.polymarket_signature_type {
            0 => "EOA - Standard wallet",
            1 => "Magic.link - Proxy wallet",
            2 => "Gnosis Safe - Multi-sig",
            _ => "Unknown",
        });

    if config.is_magic_link() {
        match &config.polymarket_funder {
            Some(funder) => println!("  Funder Address: {}", funder),
            None => println!("  WARNING: Magic.link requires POLYMARKET_FUNDER to be set!"),
        }
    }

    println!("  API Credentials: {}", if api_configured { "Set" } else { "Not set" });
    println!("  Trigger Offset: {}s before deadline", config.trigger_offset_seconds);
    println!("  Monitor Window: {} min", config.monitor_window_minutes);
    println!("  Buy Price: ${}", config.buy_price);
    println!("  Buy Size: {} shares", config.buy_size);
    println!("  Min Win Probability: {}", config.min_win_probability);
    println!("  Side: {}", config.side);
    println!("  Dry Run: {}", config.dry_run);
    println!("  Scan Queries: {}", config.scan_queries().join(" | "));
    println!("======================================================================");
    println!("CONFIGURATION CHECK PASSED");
    println!("======================================================================");

    Ok(())
}

/// Run the scanner once and print what it would snipe next.
async fn cmd_discover() -> anyhow::Result<()> {
    let config = Config::load()?;
    let http = http_client(&config)?;
    let side = side_pick(&config)?;
    let scanner = GammaScanner::new(http, config.polymarket_gamma_url.clone(), config.scan_queries(), side);

    let now = OffsetDateTime::now_utc();
    let filter = CandidateFilter {
        now,
        horizon: config.supervisor().scan_horizon,
        exclude: HashSet::new(),
    };

    println!("Searching for crypto up/down markets...");
    match scanner.next_candidate(&filter).await? {
        Some(market) => {
            println!("======================================================================");
            println!("Found market: {}", market.label());
            println!("  Condition ID: {}", market.id);
            println!("  UP Token: {}", market.up_token_id);
            println!("  DOWN Token: {}", market.down_token_id);
            println!("  Deadline: {}", market.deadline.format(&Rfc3339)?);
            println!("  Time remaining: {}", market.time_remaining_str(now));
            println!("  Side: {}", market.side);
            println!("======================================================================");
        }
        None => {
            println!("No market resolves within the next {} minutes", config.scan_horizon_minutes);
        }
    }

    Ok(())
}

/// Snipe a single market given on the command line.
async fn cmd_snipe(
    market_id: String,
    up_token: String,
    down_token: String,
    deadline: String,
    side: Option<String>,
    dry_run_override: Option<bool>,
) -> anyhow::Result<()> {
    let mut config = load_config(dry_run_override)?;
    let deadline = OffsetDateTime::parse(&deadline, &Rfc3339)
        .map_err(|e| anyhow::anyhow!("Invalid --deadline '{}': {}", deadline, e))?;
    let side = match side {
        Some(s) => s
            .parse::<SidePick>()
            .map_err(|_| anyhow::anyhow!("Invalid --side '{}'", s))?,
        None => side_pick(&config)?,
    };

    let market = Market {
        id: market_id,
        up_token_id: up_token,
        down_token_id: down_token,
        side,
        deadline,
        question: None,
    };

    info!(
        market = %market.id,
        deadline = %market.deadline,
        side = %market.side,
        mode = if config.dry_run { "DRY RUN" } else { "LIVE" },
        "Sniping single market"
    );

    if config.metrics_enabled {
        metrics::install_exporter(config.metrics_port)?;
    }

    let (stop_tx, stop) = stop_channel();
    tokio::spawn(async move {
        shutdown_signal().await;
        stop_tx.send_replace(true);
    });

    let http = http_client(&config)?;
    let ctx = live_context(&mut config, http)?;
    let record = run_session(market, config.sniper(), ctx, stop).await;

    println!("======================================================================");
    println!("Session finished: {}", record.state);
    if let Some(probability) = record.probability.and_then(|p| p.value()) {
        println!("  Probability at fire: {}", probability);
    }
    if let Some(result) = &record.result {
        println!("  Execution: {}", result.status);
        if let (Some(price), Some(size)) = (result.filled_price, result.filled_size) {
            println!("  Filled: {} shares @ ${}", size, price);
        }
        if let Some(order_id) = &result.order_id {
            println!("  Order ID: {}", order_id);
        }
        println!("  Latency: {}ms over {} attempt(s)", result.latency.as_millis(), result.attempts);
    }
    println!("======================================================================");

    Ok(())
}

/// Run the supervisor loop with the health server alongside.
async fn cmd_run(dry_run_override: Option<bool>, port_override: Option<u16>) -> anyhow::Result<()> {
    let mut config = load_config(dry_run_override)?;

    info!("Configuration loaded successfully");
    info!("Mode: {}", if config.dry_run { "DRY RUN" } else { "LIVE TRADING" });
    info!("Buy: {} shares @ ${}", config.buy_size, config.buy_price);
    info!("Trigger: {}s before deadline, min probability {}", config.trigger_offset_seconds, config.min_win_probability);

    if config.metrics_enabled {
        metrics::install_exporter(config.metrics_port)?;
        info!("Metrics exporter listening on port {}", config.metrics_port);
    }

    let supervisor = SniperSupervisor::from_config(&mut config)?;

    // Create app state
    let app_state = AppState::new(supervisor.watch_stats(), supervisor.watch_session(), config.dry_run);

    // Start HTTP server
    let port = port_override.unwrap_or(config.port);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    info!("HTTP server listening on {}", addr);

    let router = create_router(app_state.clone());

    // Spawn HTTP server
    let _server_handle = tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown_signal())
            .await
    });

    let (stop_tx, stop) = stop_channel();
    tokio::spawn(async move {
        shutdown_signal().await;
        stop_tx.send_replace(true);
    });

    app_state.set_ready(true);
    let result = supervisor.run(stop).await;
    app_state.set_ready(false);

    match result {
        Ok(stats) => {
            info!(
                sessions = stats.sessions,
                settled = stats.settled,
                aborted = stats.aborted,
                failed = stats.failed,
                "Sniper stopped"
            );
            // Let the server finish in-flight requests
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok(())
        }
        Err(e) => {
            warn!("Supervisor exited with error: {}", e);
            Err(e.into())
        }
    }
}
