//! Analysis consumer entry point

use analysis_consumer::config::{resolve_config_path, ConsumerConfig};
use analysis_consumer::consumer::{AnalysisConsumer, TerminationSignals};
use analysis_consumer::observability::{init_logging, HealthServer, LogSettings, MetricsCollector};
use analysis_consumer::scanner::HttpHeadersScanner;
use analysis_consumer::{ConsumerError, ConsumerResult};
use analysis_consumer::transport::AmqpConnector;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tracing::{error, info, warn};

/// RabbitMQ consumer for analysis requests
#[derive(Parser)]
#[command(name = "analysis-consumer")]
#[command(about = "Consumes analysis requests from RabbitMQ and publishes scan results")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Verbose logging, repeat for trace
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the consumer until a termination signal arrives
    Run,
    /// Validate the configuration
    Config {
        /// Print the resolved configuration with secrets masked
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_logging(LogSettings::from_env().with_verbosity(cli.verbose));

    info!("Starting analysis consumer v{}", env!("CARGO_PKG_VERSION"));

    let config = match load_configuration(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e.sanitized());
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run => run_consumer(config).await,
        Commands::Config { show } => handle_config_command(&config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }
}

fn load_configuration(explicit: Option<&std::path::Path>) -> ConsumerResult<ConsumerConfig> {
    let path = resolve_config_path(explicit)?;
    info!("Loading configuration from: {}", path.display());
    Ok(ConsumerConfig::load_from_file(&path)?)
}

async fn run_consumer(config: ConsumerConfig) -> Result<(), Box<dyn std::error::Error>> {
    let scanner = match HttpHeadersScanner::new(config.scanner_config()) {
        Ok(scanner) => Arc::new(scanner),
        Err(e) => {
            let err = ConsumerError::scanner_init(e.to_string());
            error!("{}", err.sanitized());
            process::exit(1);
        }
    };

    let connector = AmqpConnector::new(config.app_name.clone());
    let metrics = Arc::new(MetricsCollector::new());
    let consumer = Arc::new(AnalysisConsumer::new(
        config.consumer_settings(),
        connector,
        scanner,
        Arc::clone(&metrics),
    ));

    if config.health.enabled {
        let health_server = Arc::new(HealthServer::new(
            config.app_name.clone(),
            config.health.port,
            consumer.subscribe_state(),
            Arc::clone(&metrics),
        ));
        tokio::spawn(health_server.start());
    }

    let mut signals = TerminationSignals::register()?;

    let runner = Arc::clone(&consumer);
    let run_handle = tokio::spawn(async move { runner.run().await });

    let signal = signals.recv().await;
    info!("Received signal: {}", signal);

    // Later signals while draining are only reported
    let shutdown = consumer.shutdown(signal);
    tokio::pin!(shutdown);
    let outcome = loop {
        tokio::select! {
            outcome = &mut shutdown => break outcome,
            extra = signals.recv() => {
                warn!("Received signal: {} while shutting down, still draining", extra);
            }
        }
    };

    match run_handle.await {
        Ok(Err(e)) => warn!("Consumer loop ended with error: {}", e.sanitized()),
        Err(e) => warn!("Consumer task failed: {}", e),
        Ok(Ok(())) => {}
    }

    outcome?;
    Ok(())
}

fn handle_config_command(
    config: &ConsumerConfig,
    show: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    if show {
        println!("Current configuration:");
        println!("{}", toml::to_string_pretty(&config.redacted())?);
        println!(
            "Broker endpoint: {}",
            config.connection_options().redacted_uri()?
        );
    }

    info!("Configuration validation complete");
    Ok(())
}
