use clap::{Parser, Subcommand};
use funding_rate_arbitrage::{
    config::ArbitrageConfig,
    strategy::ArbitrageEngine,
    utils::{logger, metrics},
    ArbitrageError, Result,
};
use std::path::PathBuf;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "funding-arb")]
#[command(about = "Delta-neutral funding-rate arbitrage engine")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "config/funding_arb.toml")]
    config: PathBuf,

    /// Log level
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Log file path
    #[arg(long, default_value = "logs/funding_arb.log")]
    log_file: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the engine until Ctrl-C
    Run {
        /// Simulate fills with a paper ledger
        #[arg(long, conflicts_with = "live")]
        dry_run: bool,

        /// Send real orders
        #[arg(long)]
        live: bool,
    },
    /// Validate configuration
    Validate,
    /// Print one market snapshot
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    logger::init(&cli.log_level, &cli.log_file)?;

    info!("Starting {} v{}", funding_rate_arbitrage::APP_NAME, funding_rate_arbitrage::VERSION);

    let config = ArbitrageConfig::from_file(&cli.config)?;
    info!("Configuration loaded from: {}", cli.config.display());

    match cli.command {
        Commands::Run { dry_run, live } => run(config, dry_run, live).await,
        Commands::Validate => validate_config(config),
        Commands::Status => show_status(config).await,
    }
}

async fn run(mut config: ArbitrageConfig, dry_run: bool, live: bool) -> Result<()> {
    if dry_run {
        config.strategy.dry_run = true;
    }
    if live {
        config.strategy.dry_run = false;
    }
    if !config.strategy.dry_run && cfg!(feature = "dry-run-only") {
        return Err(ArbitrageError::Config("This build only supports dry-run mode".to_string()).into());
    }
    config.validate()?;

    if config.monitoring.enable_metrics {
        metrics::install_prometheus_exporter(&config.monitoring.metrics_listen_addr)?;
        info!("Metrics exported on {}", config.monitoring.metrics_listen_addr);
    }

    if config.strategy.dry_run {
        info!("Dry-run mode: orders are simulated, no funds at risk");
    } else {
        warn!("Live trading mode: real orders will be placed");
    }

    let mut engine = ArbitrageEngine::from_config(config)?;
    let handle = engine.handle();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Ctrl-C received; stopping after the current cycle");
                handle.stop();
            }
            Err(e) => error!("Failed to listen for Ctrl-C: {}", e),
        }
    });

    let summary = engine.run().await?;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

fn validate_config(config: ArbitrageConfig) -> Result<()> {
    info!("Validating configuration...");

    match config.validate() {
        Ok(()) => {
            info!("Configuration is valid");
            println!("Configuration validation passed!");
            Ok(())
        }
        Err(e) => {
            error!("Configuration validation failed: {}", e);
            Err(e)
        }
    }
}

async fn show_status(mut config: ArbitrageConfig) -> Result<()> {
    // Status only reads public market data.
    config.strategy.dry_run = true;
    config.validate()?;

    let engine = ArbitrageEngine::from_config(config)?;
    engine.initialize().await?;
    let snapshot = engine.snapshot().await?;

    println!("Funding spreads ({} vs {}):", snapshot.exchange_a, snapshot.exchange_b);
    for spread in snapshot.spreads.values() {
        let volatility = snapshot
            .volatility_of(&spread.symbol)
            .volatility_pct
            .map_or_else(|| "n/a".to_string(), |v| format!("{:.3}%", v));
        println!(
            "  {:<8} A {:+.5}%  B {:+.5}%  annualized {:>7.2}%  short {:<8} long {:<8} volatility {}",
            spread.symbol,
            spread.rate_a * 100.0,
            spread.rate_b * 100.0,
            spread.annualized_spread,
            spread.short_exchange.to_string(),
            spread.long_exchange.to_string(),
            volatility
        );
    }
    for (symbol, pair) in &snapshot.quotes {
        if pair.a.is_none() || pair.b.is_none() {
            println!("  {:<8} quote missing on at least one venue", symbol);
        }
    }
    Ok(())
}
