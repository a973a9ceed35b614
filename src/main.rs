//! cacheproxy binary: load the configuration, start the accept loop and run
//! the operator console on stdin until `exit` or Ctrl+C.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio::io::BufReader;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use cacheproxy::cache::spawn_sweeper;
use cacheproxy::{Backend, CacheStore, Config, Console, ConsoleExit, Proxy, Server, Shutdown};

#[derive(Parser)]
#[command(name = "cacheproxy")]
#[command(about = "Caching forwarding proxy for a single HTTP backend", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match Config::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "configuration error");
            return ExitCode::FAILURE;
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "failed to start runtime");
            return ExitCode::FAILURE;
        }
    };

    let code = runtime.block_on(run(config));
    // Stdin is read on a blocking thread that would otherwise hold up exit.
    runtime.shutdown_background();
    code
}

async fn run(config: Config) -> ExitCode {
    let server = match Server::bind(config.listen_addr()).await {
        Ok(server) => server,
        Err(e) => {
            error!(error = %e, "failed to start proxy");
            return ExitCode::FAILURE;
        }
    };
    let server = match config.max_connections() {
        Some(max) => server.with_connection_limit(max),
        None => server,
    };

    let shutdown = Shutdown::new();
    let cache = Arc::new(CacheStore::new(config.expiration()));
    let backend = Backend::new(config.backend_addr(), config.backend_timeout());
    let proxy = Arc::new(
        Proxy::new(Arc::clone(&cache), backend).with_client_timeout(config.client_timeout()),
    );
    info!(
        backend = %proxy.backend().addr(),
        expiration = ?proxy.cache().expiration(),
        "cache proxy starting"
    );

    if let Some(every) = config.sweep_interval() {
        spawn_sweeper(Arc::clone(&cache), every, shutdown.clone());
    }

    let accept_loop = tokio::spawn(server.run(proxy, shutdown.clone()));

    let console = Console::new(cache, shutdown.clone());
    let input = BufReader::new(tokio::io::stdin());
    tokio::select! {
        result = console.run(input, tokio::io::stdout()) => match result {
            Ok(ConsoleExit::Exit) => {}
            Ok(ConsoleExit::EndOfInput) => {
                info!("console closed, press Ctrl+C to stop");
                wait_for_interrupt(&shutdown).await;
            }
            Err(e) => {
                warn!(error = %e, "console failed, press Ctrl+C to stop");
                wait_for_interrupt(&shutdown).await;
            }
        },
        _ = tokio::signal::ctrl_c() => info!("interrupted"),
    }

    shutdown.trigger();
    if let Err(e) = accept_loop.await {
        error!(error = %e, "accept loop panicked");
    }
    info!("application terminated");
    ExitCode::SUCCESS
}

/// Waits for Ctrl+C, or for shutdown triggered elsewhere.
async fn wait_for_interrupt(shutdown: &Shutdown) {
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("interrupted"),
        _ = shutdown.triggered() => {}
    }
}
