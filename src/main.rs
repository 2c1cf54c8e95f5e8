use anyhow::Context;
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{Shell, generate};
use datapulse::Orchestrator;
use datapulse::orchestration::{
    DataEvent, DataNotification, DataType, FilterParams, ManualVisibility, OrchestratorConfig,
};
use futures::stream::{self, StreamExt};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::sleep;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "datapulse")]
#[command(author, version, about = "Demand-driven polling, request dedup and loading state for live data")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Simulate UI components and a fetch-controller sharing one orchestrator
    Run {
        /// Seconds to run the simulation
        #[arg(long, default_value = "10")]
        duration: u64,

        /// Move the app to the background after this many seconds
        #[arg(long)]
        background_after: Option<u64>,

        /// Simulated network latency per fetch, in milliseconds
        #[arg(long, default_value = "150")]
        tick_ms: u64,

        /// JSON orchestrator configuration
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<OrchestratorConfig> {
    let Some(path) = path else {
        return Ok(OrchestratorConfig::default());
    };
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    OrchestratorConfig::from_json(&json).with_context(|| format!("parsing config {}", path.display()))
}

async fn simulated_fetch(latency: Duration, fetches: Arc<AtomicU64>) -> Result<u64, String> {
    sleep(latency).await;
    Ok(fetches.fetch_add(1, Ordering::SeqCst) + 1)
}

/// Listens on every data type's channel and fetches whatever is needed.
async fn run_fetch_controller(orchestrator: Arc<Orchestrator>, latency: Duration, fetches: Arc<AtomicU64>) {
    let mut channels = Vec::new();
    for data_type in DataType::KNOWN {
        let rx = orchestrator.registry().notifications(&data_type).await;
        channels.push(BroadcastStream::new(rx).boxed());
    }
    let mut events = stream::select_all(channels);

    while let Some(event) = events.next().await {
        let DataNotification { data_type, event } = match event {
            Ok(notification) => notification,
            Err(e) => {
                warn!("Fetch-controller fell behind: {}", e);
                continue;
            }
        };

        match event {
            DataEvent::NotNeeded => debug!("Dropping interest in {}", data_type),
            DataEvent::Needed | DataEvent::Refresh => {
                if !orchestrator.registry().has_subscriptions(&data_type, None).await {
                    continue;
                }
                let orchestrator = Arc::clone(&orchestrator);
                let fetches = Arc::clone(&fetches);
                tokio::spawn(async move {
                    let key = data_type.to_string();
                    match orchestrator
                        .fetch(&data_type, &key, move || simulated_fetch(latency, fetches))
                        .await
                    {
                        Ok(version) => info!("📦 {} ready (version {})", data_type, version),
                        Err(e) => warn!("Fetch for {} failed: {}", data_type, e),
                    }
                });
            }
        }
    }
}

async fn run(
    duration: Duration,
    background_after: Option<Duration>,
    latency: Duration,
    config: OrchestratorConfig,
) -> anyhow::Result<()> {
    let visibility = Arc::new(ManualVisibility::default());
    let orchestrator = Orchestrator::start(config, visibility.clone())?;
    let fetches = Arc::new(AtomicU64::new(0));

    let controller = tokio::spawn(run_fetch_controller(
        Arc::clone(&orchestrator),
        latency,
        Arc::clone(&fetches),
    ));

    if let Some(after) = background_after {
        let visibility = Arc::clone(&visibility);
        tokio::spawn(async move {
            sleep(after).await;
            visibility.background();
        });
    }

    // Portfolio widget follows the selected wallet; the user switches wallets
    // right away, so only the second one should ever be subscribed.
    let portfolio = orchestrator.debounced("portfolio-widget");
    portfolio
        .want("holdings", DataType::Balances, Some(FilterParams::for_wallet("0xA11CE")))
        .await;
    portfolio
        .want("holdings", DataType::Balances, Some(FilterParams::for_wallet("0xB0B")))
        .await;
    portfolio.want("value", DataType::PortfolioValue, None).await;

    let registry = orchestrator.registry();
    registry.subscribe("price-ticker", DataType::MarketData, None).await;
    registry.subscribe("price-ticker", DataType::TokenPrices, None).await;

    let script = async {
        sleep(duration / 2).await;
        let removed = registry.unsubscribe_all("price-ticker").await;
        info!("Price ticker closed ({} subscriptions released)", removed);
        sleep(duration - duration / 2).await;
    };
    tokio::select! {
        () = script => {}
        _ = tokio::signal::ctrl_c() => info!("Interrupted"),
    }

    portfolio.release_all().await;
    // let the loading cleanup and last fetches settle before reporting
    sleep(latency).await;

    let stats = orchestrator.stats().await;
    println!("{}", serde_json::to_string_pretty(&stats)?);
    println!("simulated fetches: {}", fetches.load(Ordering::SeqCst));

    orchestrator.shutdown().await;
    controller.abort();
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            duration,
            background_after,
            tick_ms,
            config,
        } => {
            init_logging();
            let config = load_config(config.as_ref())?;
            run(
                Duration::from_secs(duration),
                background_after.map(Duration::from_secs),
                Duration::from_millis(tick_ms),
                config,
            )
            .await
        }
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            let name = cmd.get_name().to_string();
            generate(shell, &mut cmd, name, &mut io::stdout());
            Ok(())
        }
    }
}
