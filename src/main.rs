use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use kube::api::Api;
use stack_controller::config::{
    parse_duration, PublishedServiceType, DEFAULT_DELETION_QUEUE_DEPTH, DEFAULT_QUEUE_DEPTH,
    DEFAULT_REVISION_HISTORY_LIMIT,
};
use stack_controller::controller::{self, ControllerState, RevisionHistory};
use stack_controller::crd::Stack;
use stack_controller::{ControllerConfig, Error};
use tokio::sync::watch;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the controller
    Run(RunArgs),
    /// Show version and build information
    Version,
    /// Print the recorded spec revisions of a Stack
    History(HistoryArgs),
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// Only watch this namespace (all namespaces when unset)
    #[arg(long, env = "STACK_NAMESPACE")]
    namespace: Option<String>,

    /// Period of the full Stack resync
    #[arg(long, env = "RECONCILE_INTERVAL", default_value = "12h", value_parser = parse_duration)]
    reconcile_interval: Duration,

    /// Service type used for published ports
    #[arg(long, env = "DEFAULT_SERVICE_TYPE", default_value_t = PublishedServiceType::LoadBalancer)]
    default_service_type: PublishedServiceType,

    /// Distinct Stack keys the work queue holds
    #[arg(long, env = "QUEUE_DEPTH", default_value_t = DEFAULT_QUEUE_DEPTH)]
    queue_depth: usize,

    /// Buffered Stack deletions
    #[arg(long, env = "DELETION_QUEUE_DEPTH", default_value_t = DEFAULT_DELETION_QUEUE_DEPTH)]
    deletion_queue_depth: usize,

    /// Delay before a transiently failed Stack is reconciled again
    #[arg(long, env = "REQUEUE_DELAY", default_value = "15s", value_parser = parse_duration)]
    requeue_delay: Duration,

    /// Spec revisions kept on each Stack
    #[arg(long, env = "REVISION_HISTORY_LIMIT", default_value_t = DEFAULT_REVISION_HISTORY_LIMIT)]
    revision_history_limit: usize,

    /// Port of the health, readiness and metrics endpoints
    #[arg(long, env = "METRICS_PORT", default_value_t = 8080)]
    metrics_port: u16,
}

impl RunArgs {
    fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            namespace: self.namespace.clone(),
            reconcile_interval: self.reconcile_interval,
            default_service_type: self.default_service_type,
            queue_depth: self.queue_depth,
            deletion_queue_depth: self.deletion_queue_depth,
            requeue_delay: self.requeue_delay,
            revision_history_limit: self.revision_history_limit,
        }
    }
}

#[derive(Parser, Debug)]
struct HistoryArgs {
    /// Stack name
    name: String,

    #[arg(long, short, env = "STACK_NAMESPACE", default_value = "default")]
    namespace: String,

    /// Print only this revision
    #[arg(long)]
    revision: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let args = Args::parse();

    match args.command {
        Commands::Version => {
            println!("stack-controller v{}", env!("CARGO_PKG_VERSION"));
            println!("Build Date: {}", env!("BUILD_DATE"));
            println!("Git SHA: {}", env!("GIT_SHA"));
            Ok(())
        }
        Commands::History(history_args) => run_history(history_args).await,
        Commands::Run(run_args) => run_controller(run_args).await,
    }
}

async fn run_history(args: HistoryArgs) -> Result<(), Error> {
    let client = kube::Client::try_default().await?;
    let api: Api<Stack> = Api::namespaced(client, &args.namespace);
    let stack = api.get(&args.name).await?;
    let history = RevisionHistory::revisions_of(&stack);

    match args.revision {
        Some(number) => {
            let revision = history.get(number).ok_or_else(|| {
                Error::ConfigError(format!(
                    "revision {} of {}/{} not found",
                    number, args.namespace, args.name
                ))
            })?;
            println!("{}", revision.spec);
        }
        None if history.is_empty() => println!("No revisions recorded"),
        None => {
            for revision in history.iter() {
                println!("{}\t{}", revision.number, revision.spec);
            }
        }
    }
    Ok(())
}

async fn run_controller(args: RunArgs) -> Result<(), Error> {
    let env_filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();

    let fmt_layer = fmt::layer().with_target(true);

    // Register the subscriber with both stdout logging and OpenTelemetry tracing
    let registry = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer);

    let otel_enabled = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").is_ok();

    if otel_enabled {
        let otel_layer = stack_controller::telemetry::init_telemetry(&registry);
        registry.with(otel_layer).init();
        info!("OpenTelemetry tracing initialized");
    } else {
        registry.init();
        info!("OpenTelemetry tracing disabled (OTEL_EXPORTER_OTLP_ENDPOINT not set)");
    }

    info!("Starting stack-controller v{}", env!("CARGO_PKG_VERSION"));

    let client = kube::Client::try_default().await?;
    info!("Connected to Kubernetes cluster");

    let config = args.controller_config();
    info!(
        "Watching {} (resync every {}s, published services: {})",
        config.namespace.as_deref().unwrap_or("all namespaces"),
        config.reconcile_interval.as_secs(),
        config.default_service_type
    );

    let (state, deletions) = ControllerState::new(config);
    let state = Arc::new(state);
    let (stop_tx, stop_rx) = watch::channel(false);

    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received shutdown signal"),
            Err(e) => warn!("Failed to listen for shutdown signal: {}", e),
        }
        let _ = stop_tx.send(true);
    });

    #[cfg(feature = "rest-api")]
    {
        let api_state = state.clone();
        let api_stop = stop_rx.clone();
        let port = args.metrics_port;
        tokio::spawn(async move {
            if let Err(e) = stack_controller::rest_api::run_server(api_state, port, api_stop).await
            {
                error!("REST API server error: {:?}", e);
            }
        });
    }

    let result = controller::run_controller(client, state, deletions, stop_rx).await;
    if let Err(e) = &result {
        error!("Controller failed: {}", e);
    }

    stack_controller::telemetry::shutdown_telemetry();
    result
}
