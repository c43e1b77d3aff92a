use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tracing::{error, info, warn};

use pipeline_plugin::broker::{create_broker, Broker, MemoryBroker};
use pipeline_plugin::commands;
use pipeline_plugin::config::{self, PluginSettings};
use pipeline_plugin::{PipelinePlugin, PluginEvent};

#[derive(Parser, Debug)]
#[command(name = "pipeline-plugin")]
#[command(about = "Queue-backed pipeline plugin: consume, log and pipe JSON messages", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Path to configuration file (YAML/JSON/TOML); environment only when omitted
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,
}

#[derive(Debug, clap::Subcommand)]
enum Command {
    /// Run the plugin (default)
    Run,
    /// Validate configuration and print the queue routing
    Check,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_tracing(args.debug, args.log_json)?;

    let settings = match &args.config {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            config::load_from_path(path)
                .await
                .with_context(|| format!("Failed to load configuration from {}", path.display()))?
        }
        None => {
            info!("Loading configuration from environment");
            config::load_from_env()
                .await
                .context("Failed to load configuration from environment")?
        }
    };

    match args.command.unwrap_or(Command::Run) {
        Command::Check => commands::run_config_check(settings).await?,
        Command::Run => run(settings).await?,
    }

    Ok(())
}

fn init_tracing(debug: bool, json: bool) -> anyhow::Result<()> {
    let log_level = if debug { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive(format!("pipeline_plugin={log_level}").parse()?);

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
    Ok(())
}

async fn run(settings: PluginSettings) -> anyhow::Result<()> {
    // Keep a concrete handle on the in-process broker so stdin can feed it.
    let memory = settings
        .broker
        .starts_with("memory:")
        .then(MemoryBroker::new);
    let broker: Arc<dyn Broker> = match &memory {
        Some(memory) => Arc::new(memory.clone()),
        None => create_broker(&settings.broker)?,
    };

    info!(
        "Starting {} plugin on {} input pipe(s)",
        settings.variant,
        settings.input_pipes.len()
    );
    let (plugin, mut events) = PipelinePlugin::new(settings, broker)?;
    plugin
        .initialize()
        .await
        .context("Plugin initialization failed")?;

    let feeder = match (memory, plugin.routing().inputs().first()) {
        (Some(memory), Some(queue)) => Some(tokio::spawn(feed_stdin(memory, queue.clone()))),
        _ => None,
    };

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => print_event(&event),
                None => break,
            },
            _ = &mut shutdown => break,
        }
    }

    info!("Shutting down {}", plugin.name());
    if let Some(feeder) = feeder {
        feeder.abort();
    }
    if let Err(e) = plugin.close().await {
        error!("Failed to close plugin: {}", e);
    }

    print!("{}", plugin.metrics().render());
    Ok(())
}

/// Each non-empty stdin line becomes one inbound message.
async fn feed_stdin(memory: MemoryBroker, queue: String) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                if let Err(e) = memory.deliver(&queue, line.to_string()).await {
                    error!("Failed to deliver stdin line to '{}': {}", queue, e);
                }
            }
            Ok(None) => {
                info!("Stdin closed");
                break;
            }
            Err(e) => {
                warn!("Error reading from stdin: {}", e);
                break;
            }
        }
    }
}

fn print_event(event: &PluginEvent) {
    match event {
        PluginEvent::Data(payload) => println!("data {payload}"),
        PluginEvent::Log(payload) => println!("log {payload}"),
        PluginEvent::Ready => info!("Plugin ready"),
        PluginEvent::Failed { stage, error } => error!("Setup failed during {}: {}", stage, error),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received terminate signal");
        },
    }
}
