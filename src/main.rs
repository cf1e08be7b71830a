use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use pgflight::cache::QueryCache;
use pgflight::config::Config;
use pgflight::server::Server;
use pgflight::tls::TlsContextPair;

/// Caching, query-deduplicating PostgreSQL proxy.
#[derive(Parser)]
#[command(name = "pgflight", version, about)]
struct Args {
    /// Path to the YAML configuration file.
    #[arg(default_value = "config.yaml")]
    config: PathBuf,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let config_missing = !args.config.exists();
    let config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("pgflight: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let level = match config.logging.level() {
        Ok(level) => level,
        Err(e) => {
            eprintln!("pgflight: {}", e);
            return ExitCode::FAILURE;
        }
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    if config_missing {
        warn!(path = %args.config.display(), "config file not found, using defaults");
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.server.num_threads)
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "failed to build runtime");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(config)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "fatal error");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let config = Arc::new(config);

    let tls = Arc::new(TlsContextPair::new()?);
    let cache = Arc::new(QueryCache::new(&config.cache).await);

    let addr = format!(
        "{}:{}",
        config.server.listen_address, config.server.listen_port
    );
    let listener = TcpListener::bind(&addr).await?;
    info!(
        %addr,
        upstream_host = %config.database.host,
        upstream_port = config.database.port,
        "pgflight starting"
    );

    let server = Server::new(listener, config, cache, tls);
    let shutdown = server.shutdown_token();

    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        info!("shutdown signal received");
        shutdown.cancel();
    });

    server.serve().await?;
    info!("shutdown complete");
    Ok(())
}

/// Resolves on SIGINT or, on unix, SIGTERM.
async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
