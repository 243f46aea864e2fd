use std::env;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, anyhow};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use vocalis::{AppState, CoreState, ProviderRegistry, ServerConfig, config, routes};

const USAGE: &str = "Usage: vocalis [--config <path>] [--log-level <level>]";

/// Why startup or serving stopped.
enum Exit {
    /// Bad flags or configuration
    Config(anyhow::Error),
    /// Could not build the server or bind its socket
    Init(anyhow::Error),
    Interrupted,
}

impl Exit {
    fn code(&self) -> u8 {
        match self {
            Exit::Config(_) => 1,
            Exit::Init(_) => 2,
            Exit::Interrupted => 130,
        }
    }
}

struct Args {
    config: Option<PathBuf>,
    log_level: Option<String>,
}

fn parse_args() -> anyhow::Result<Args> {
    let mut parsed = Args {
        config: None,
        log_level: None,
    };
    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => {
                let path = args.next().ok_or_else(|| anyhow!("--config requires a file path"))?;
                parsed.config = Some(PathBuf::from(path));
            }
            "--log-level" => {
                parsed.log_level = Some(args.next().ok_or_else(|| anyhow!("--log-level requires a value"))?);
            }
            "-h" | "--help" => {
                println!("{USAGE}");
                std::process::exit(0);
            }
            other => anyhow::bail!("Unknown argument '{other}'. {USAGE}"),
        }
    }
    Ok(parsed)
}

/// `RUST_LOG` wins over `--log-level`, which wins over `info`.
fn init_tracing(level: Option<&str>) -> anyhow::Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(level.unwrap_or("info"))
            .with_context(|| format!("Invalid log level '{}'", level.unwrap_or_default()))?,
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
    Ok(())
}

async fn run() -> Result<(), Exit> {
    let args = parse_args().map_err(Exit::Config)?;
    init_tracing(args.log_level.as_deref()).map_err(Exit::Config)?;

    let config = ServerConfig::load(args.config.as_deref())
        .map_err(|e| Exit::Config(anyhow!("Failed to load configuration: {e}")))?;
    let providers = ProviderRegistry::with_dev_providers();
    config::validate(&config, &providers).map_err(|e| Exit::Config(anyhow!("Invalid configuration: {e}")))?;

    let address = config.address();
    let core_state = CoreState::new(config, providers).map_err(|e| Exit::Config(anyhow!(e)))?;
    tracing::info!(
        "Plugins registered: {:?}, auth {}",
        core_state.plugins.names(),
        if core_state.config.auth_enabled() { "enabled" } else { "disabled" }
    );
    let app = routes::create_router(AppState::new(core_state));

    let listener = TcpListener::bind(&address)
        .await
        .with_context(|| format!("Failed to bind {address}"))
        .map_err(Exit::Init)?;
    println!("Server listening on {address}");

    let interrupted = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };
    tokio::select! {
        served = axum::serve(listener, app) => served.context("Server error").map_err(Exit::Init),
        _ = interrupted => {
            tracing::info!("Interrupted, shutting down");
            Err(Exit::Interrupted)
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(exit) => {
            match &exit {
                Exit::Config(e) | Exit::Init(e) => eprintln!("Error: {e:#}"),
                Exit::Interrupted => {}
            }
            ExitCode::from(exit.code())
        }
    }
}
