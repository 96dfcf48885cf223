use std::{process::ExitCode, sync::Arc};

use mcp_aggregator::{
    child::ProcessLauncher,
    config::{Config, ConfigError},
    logging,
    registry::ServerRegistry,
};
use tokio::signal;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> ExitCode {
    let config = match Config::from_args(std::env::args()) {
        Ok(config) => config,
        Err(ConfigError::Cli(err)) => err.exit(),
        Err(err) => {
            logging::init_logging(false);
            error!(error = %err, "invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    logging::init_logging(config.verbose);

    match run(config).await {
        Ok(code) => code,
        Err(err) => {
            error!(error = %err, "aggregator failed to start");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: Config) -> Result<ExitCode, ConfigError> {
    let Config {
        bind_addr,
        timeouts,
        namespacing,
        servers,
        ..
    } = config;

    let listener = mcp_aggregator::bind(bind_addr).await?;
    let registry = Arc::new(ServerRegistry::new(
        servers,
        namespacing,
        timeouts,
        Arc::new(ProcessLauncher::new()),
    ));

    Ok(mcp_aggregator::run(listener, registry, shutdown_signal())
        .await
        .into())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            warn!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut terminate) => {
                terminate.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received ctrl-c, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
