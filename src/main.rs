//! Process entry point: load configuration, raise the fd limit, connect to
//! the store, and serve the demultiplexed RPC surface until a shutdown
//! signal arrives (spec.md §5 "Resource limits", §6 "Exit codes").

use std::process::ExitCode;
use std::sync::Arc;

use controller::events::listener::EventListener;
use controller::handlers::ControllerService;
use controller::store::postgres::PostgresStore;
use controller::store::Store;
use controller::{server, Config};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "fatal error, exiting");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::from_env()?;
    raise_fd_limit();

    let store = PostgresStore::connect(&config.database_url).await?;
    let feed = Arc::new(store.change_feed());
    let store: Arc<dyn Store> = Arc::new(store);
    let listener = EventListener::new(feed);
    let service = ControllerService::new(store, listener, Arc::new(config.clone()));

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        tracing::info!("shutdown signal received");
        signal_token.cancel();
    });

    server::serve(service, &config, shutdown).await?;
    tracing::info!("shutdown complete");
    Ok(())
}

/// Raise the file-descriptor soft limit to the hard limit so the process
/// can hold many concurrent long-lived streaming connections (spec.md §5
/// "Resource limits").
fn raise_fd_limit() {
    match rlimit::Resource::NOFILE.get() {
        Ok((soft, hard)) if soft < hard => {
            if let Err(e) = rlimit::Resource::NOFILE.set(hard, hard) {
                tracing::warn!(error = %e, "failed to raise NOFILE soft limit");
            } else {
                tracing::info!(soft, hard, "raised NOFILE soft limit to hard limit");
            }
        }
        Ok(_) => {}
        Err(e) => tracing::warn!(error = %e, "failed to read NOFILE limit"),
    }
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
    tokio::select! {
        _ = sigterm.recv() => {}
        _ = sigint.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
