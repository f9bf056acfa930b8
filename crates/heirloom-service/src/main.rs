use clap::{Parser, Subcommand};
use heirloom_service::{build_router, scheduler, ServiceConfig, ServiceState};
use std::net::SocketAddr;
use std::process::ExitCode;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "heirloomd", version, about = "Heirloom dead man's switch service")]
struct Cli {
    /// Configuration file path (any format the `config` crate reads)
    #[arg(short, long, env = "HEIRLOOM_CONFIG", global = true)]
    config: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long, env = "HEIRLOOM_LOG_JSON", global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Serve the REST API, optionally running the engine on an internal ticker.
    Serve {
        /// Socket address to bind, e.g. 127.0.0.1:8095
        #[arg(long, env = "HEIRLOOM_LISTEN")]
        listen: Option<SocketAddr>,
        /// Seconds between scheduled runs; 0 leaves scheduling to an external cron.
        #[arg(long, env = "HEIRLOOM_SCHEDULE_SECS")]
        schedule_secs: Option<u64>,
    },
    /// Execute one scheduled run, print its JSON report and exit.
    RunOnce,
}

fn init_tracing(config: &ServiceConfig, json: bool) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| config.logging.level.clone().into());

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    let mut config = ServiceConfig::load(cli.config.as_deref())?;
    init_tracing(&config, cli.log_json || config.logging.json);

    match cli.command {
        Command::Serve {
            listen,
            schedule_secs,
        } => {
            if let Some(listen) = listen {
                config.server.listen_addr = listen;
            }
            if let Some(secs) = schedule_secs {
                config.scheduler.interval_secs = secs;
            }
            serve(config).await?;
            Ok(ExitCode::SUCCESS)
        }
        Command::RunOnce => run_once(config).await,
    }
}

async fn serve(config: ServiceConfig) -> anyhow::Result<()> {
    let state = ServiceState::bootstrap(&config).await?;

    let ticker = config.scheduler.enabled().then(|| {
        scheduler::spawn_ticker(
            state.engine.clone(),
            Duration::from_secs(config.scheduler.interval_secs),
        )
    });

    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(config.server.listen_addr).await?;
    info!(
        storage = config.storage.label(),
        scheduler = ticker.is_some(),
        "heirloom-service REST listening on {}",
        listener.local_addr()?
    );

    axum::serve(listener, app).await?;
    if let Some(ticker) = ticker {
        ticker.abort();
    }
    Ok(())
}

/// The engine only fails a whole run when it cannot load its scan set; that is the
/// one case that exits non-zero.
async fn run_once(config: ServiceConfig) -> anyhow::Result<ExitCode> {
    let state = ServiceState::bootstrap(&config).await?;
    match scheduler::run_scheduled(&state.engine).await {
        Ok(report) => {
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(ExitCode::SUCCESS)
        }
        // Already logged with its cause.
        Err(_) => Ok(ExitCode::FAILURE),
    }
}
