//! PeerGuard - WireGuard peer manager service
//!
//! Reads settings from the environment, opens the peer store, brings the
//! interface up and keeps it reconciled until asked to stop.

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{fmt, EnvFilter};

use peerguard::command::CommandRunner;
use peerguard::{
    JsonStateFile, KeyBackend, KeyManager, NativeKeys, PeerGuardError, PeerStore, Settings,
    SystemRunner, WgQuickInterface, WgToolKeys,
};

/// PeerGuard - WireGuard peer manager
#[derive(Parser, Debug)]
#[command(name = "peerguard")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    // RUST_LOG wins over --verbose
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if args.verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });

    fmt().with_env_filter(filter).with_target(false).init();

    match run().await {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e.user_message());
            ExitCode::from(u8::try_from(e.exit_code()).unwrap_or(u8::MAX))
        }
    }
}

async fn run() -> Result<(), PeerGuardError> {
    let settings = Settings::from_env()?;
    tracing::info!(
        "PeerGuard starting for {} on port {}",
        settings.interface,
        settings.listen_port
    );

    let runner: Arc<dyn CommandRunner> = Arc::new(SystemRunner::new());
    let keys: Arc<dyn KeyManager> = match settings.key_backend {
        KeyBackend::WgTool => {
            Arc::new(WgToolKeys::new(runner.clone()).with_timeout(settings.command_timeout))
        }
        KeyBackend::Native => Arc::new(NativeKeys::new()),
    };
    let live = WgQuickInterface::new(runner, &settings.interface, settings.config_file())
        .with_timeout(settings.command_timeout);
    let backend = JsonStateFile::new(settings.state_file(), settings.persist_timeout);

    let store = PeerStore::open(settings, keys, Arc::new(live), Arc::new(backend)).await?;
    store.bring_up().await?;
    tracing::info!("Managing {} peers", store.list().len());

    wait_for_shutdown().await;

    if let Err(e) = store.bring_down().await {
        tracing::error!("Failed to bring interface down: {}", e);
    }
    Ok(())
}

/// Resolve on Ctrl+C or SIGTERM
async fn wait_for_shutdown() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, shutting down...");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, shutting down...");
        }
    }
}
