mod aggregation;
mod backend;
mod broker;
mod config;
mod consumer;
mod database;
mod engine;
mod types;
mod web;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, info_span, warn, Instrument};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use backend::HttpBackendClient;
use broker::{Broker, QueuePublisher, ResultSink, SqlBroker, SqlConnector};
use config::{ConfigStore, Settings};
use consumer::{supervise, ConsumerOptions, ResultConsumer, WorkerLaunch};
use database::ResultStore;
use engine::{job_queue, EnsembleCoordinator};
use types::{utc_to_epoch, AggregatedResult, ClassScore};
use web::{start_server, AppState};

#[derive(Parser)]
#[command(name = "ensemble_pipeline")]
#[command(version)]
#[command(about = "Fan-out classification ensemble with a durable result queue", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path
    #[arg(short, long, default_value = "ensemble.toml")]
    config: String,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the ensemble HTTP service
    Serve {
        /// Bind address (overrides server.host)
        #[arg(long)]
        host: Option<String>,
        /// Port (overrides server.port)
        #[arg(short, long)]
        port: Option<u16>,
        /// Publish aggregated results to the durable queue
        #[arg(long)]
        publish: bool,
    },
    /// Run N consumer worker processes against the result queue
    Consume {
        /// Number of workers (overrides consumer.workers)
        #[arg(short, long)]
        workers: Option<usize>,
    },
    /// Run a single consumer worker in this process
    #[command(hide = true)]
    Worker {
        #[arg(long, default_value = "0")]
        id: usize,
    },
    /// Publish aggregated results to the queue, from a JSON file or as samples
    Publish {
        /// JSON file with one result or an array of results
        #[arg(short, long)]
        file: Option<PathBuf>,
        /// Request id for a generated sample (random by default)
        #[arg(long)]
        request_id: Option<String>,
        /// Number of generated samples
        #[arg(short = 'n', long, default_value = "1")]
        count: usize,
    },
    /// Delete every stored result
    Purge {
        /// Actually delete
        #[arg(long)]
        yes: bool,
    },
    /// Show stored result count, queue depth and end-to-end latency
    Stats {
        /// Only consider the N most recent results
        #[arg(short, long)]
        limit: Option<u32>,
        /// Print the stored row for one request instead
        #[arg(long)]
        request_id: Option<String>,
    },
    /// Print the effective settings as TOML
    ShowConfig,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.log_json);

    let settings = Settings::load(&cli.config).with_context(|| format!("loading settings from {}", cli.config))?;

    // a worker is a single cooperative event loop; everything else gets the pool
    let mut builder = match cli.command {
        Commands::Worker { .. } => tokio::runtime::Builder::new_current_thread(),
        _ => tokio::runtime::Builder::new_multi_thread(),
    };
    let runtime = builder.enable_all().build()?;

    runtime.block_on(run(cli, settings))
}

fn init_logging(verbose: bool, json: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn run(cli: Cli, settings: Settings) -> Result<()> {
    match cli.command {
        Commands::Serve { host, port, publish } => {
            let host = host.unwrap_or_else(|| settings.server.host.clone());
            let port = port.unwrap_or(settings.server.port);
            let publish = publish || settings.server.publish_results;
            run_server(&settings, &host, port, publish).await?;
        }
        Commands::Consume { workers } => {
            let workers = workers.unwrap_or(settings.consumer.workers);
            let mut global_args = Vec::new();
            if cli.verbose {
                global_args.push("--verbose".to_string());
            }
            if cli.log_json {
                global_args.push("--log-json".to_string());
            }

            let launch = WorkerLaunch::current_exe(cli.config.clone(), global_args)?;
            info!("Starting {} consumer workers on '{}'", workers, settings.broker.queue_name);
            supervise(&launch, workers, shutdown_signal()).await?;
        }
        Commands::Worker { id } => {
            let name = format!("worker-{}-{}", id, std::process::id());
            let span = info_span!("worker", name = %name);
            run_worker(&settings, name).instrument(span).await?;
        }
        Commands::Publish { file, request_id, count } => {
            publish_results(&settings, file, request_id, count).await?;
        }
        Commands::Purge { yes } => {
            let store = ResultStore::new(&settings.storage.url).await?;
            if yes {
                let deleted = store.delete_all().await?;
                println!("Deleted {} results", deleted);
            } else {
                let count = store.count_results().await?;
                warn!("Refusing to delete {} results without --yes", count);
            }
        }
        Commands::Stats { limit, request_id } => match request_id {
            Some(request_id) => show_result(&settings, &request_id).await?,
            None => show_stats(&settings, limit).await?,
        },
        Commands::ShowConfig => {
            println!("{}", settings.to_toml()?);
        }
    }

    Ok(())
}

async fn run_server(settings: &Settings, host: &str, port: u16, publish: bool) -> Result<()> {
    let config = Arc::new(ConfigStore::new(settings.ensemble.to_config())?);
    let active = config.snapshot().await;
    info!(
        "Ensemble of {} endpoints, strategy {}",
        active.endpoints().len(),
        active.strategy.name()
    );

    let client = Arc::new(HttpBackendClient::new(settings.backend.timeout()));
    info!("Backend calls time out after {:?}", client.timeout());
    let coordinator = Arc::new(EnsembleCoordinator::new(client, settings.backend.input_shape));

    let sink: Option<Arc<dyn ResultSink>> = if publish {
        info!("Publishing results to '{}'", settings.broker.queue_name);
        let publisher = Arc::new(QueuePublisher::new(
            SqlConnector::new(settings.broker.url.clone()),
            settings.broker.queue_name.clone(),
            &settings.retry,
        ));
        // publishes racing this first connect fail fast and are counted
        tokio::spawn({
            let publisher = Arc::clone(&publisher);
            async move {
                if let Err(e) = publisher.connect().await {
                    warn!("Result queue not reachable at startup: {}", e);
                }
            }
        });
        Some(publisher)
    } else {
        None
    };

    let (jobs, runner) = job_queue(settings.server.job_queue_capacity, coordinator, Arc::clone(&config), sink);
    let runner = tokio::spawn(runner.run());

    let mut changes = config.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = changes.recv().await {
            debug!("Configuration change applied: {:?}", event);
        }
    });

    start_server(AppState::new(config, jobs), host, port, shutdown_signal()).await?;

    info!("Waiting for in-flight ensemble jobs");
    runner.await?;
    Ok(())
}

async fn run_worker(settings: &Settings, name: String) -> Result<()> {
    let store = Arc::new(ResultStore::new(&settings.storage.url).await?);
    debug!("Reconnect schedule: {:?}", settings.retry.delays());

    let options = ConsumerOptions::from_settings(name, settings);
    let mut consumer = ResultConsumer::new(
        SqlConnector::new(settings.broker.url.clone()),
        store,
        &settings.retry,
        options,
    );

    // a spent retry budget propagates out of main as a non-zero exit
    consumer.run(shutdown_signal()).await?;
    Ok(())
}

async fn publish_results(settings: &Settings, file: Option<PathBuf>, request_id: Option<String>, count: usize) -> Result<()> {
    let results = match file {
        Some(path) => {
            let text = tokio::fs::read_to_string(&path)
                .await
                .with_context(|| format!("reading {}", path.display()))?;
            match serde_json::from_str::<Vec<AggregatedResult>>(&text) {
                Ok(results) => results,
                Err(_) => vec![serde_json::from_str::<AggregatedResult>(&text)?],
            }
        }
        None => (0..count.max(1))
            .map(|i| {
                let id = match (&request_id, i) {
                    (Some(id), 0) => id.clone(),
                    (Some(id), i) => format!("{}-{}", id, i),
                    (None, _) => Uuid::new_v4().to_string(),
                };
                AggregatedResult::new(id, vec![ClassScore::new("cat", 0.8), ClassScore::new("dog", 0.2)])
                    .with_timestamp(Some(utc_to_epoch(Utc::now())))
            })
            .collect(),
    };

    let publisher = QueuePublisher::new(
        SqlConnector::new(settings.broker.url.clone()),
        settings.broker.queue_name.clone(),
        &settings.retry,
    );
    for result in &results {
        publisher.publish(result).await?;
        println!("Published {}", result);
    }
    Ok(())
}

async fn show_stats(settings: &Settings, limit: Option<u32>) -> Result<()> {
    let store = ResultStore::new(&settings.storage.url).await?;
    let broker = SqlBroker::connect(&settings.broker.url).await?;

    println!("\n=== Result Store ===");
    println!("Stored results: {}", store.count_results().await?);
    println!(
        "Queued messages ({}): {}",
        settings.broker.queue_name,
        broker.message_count(&settings.broker.queue_name).await?
    );

    match store.latency_summary(limit).await? {
        Some(summary) => {
            println!("\n=== End-to-end Latency (s) ===");
            println!("Samples: {}", summary.count);
            println!("Mean:    {:.4}", summary.mean);
            println!("Min:     {:.4}", summary.min);
            println!("Max:     {:.4}", summary.max);
            println!("Stddev:  {:.4}", summary.stddev);
            println!("P99:     {:.4}", summary.p99);
        }
        None => println!("\nNo results with both timestamps yet"),
    }
    broker.close().await;
    Ok(())
}

async fn show_result(settings: &Settings, request_id: &str) -> Result<()> {
    let store = ResultStore::new(&settings.storage.url).await?;
    match store.get_result(request_id).await? {
        Some(stored) => println!("{}", serde_json::to_string_pretty(&stored)?),
        None => println!("No stored result for {}", request_id),
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Cannot listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Cannot listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}
