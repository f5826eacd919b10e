//! # UCP Checkout Engine
//!
//! ## Usage
//!
//! ```bash
//! export UCP_MERCHANT_ID=merchant_acme
//! export UCP_MERCHANT_PUBLIC_KEY=<hex ed25519 key>
//!
//! # Run the daemon
//! ucp-engine
//! ```

use tokio::sync::watch;
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use ucp_server::{workers, AppConfig, AppState, LogFormat};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env()?;

    // Initialize logging
    let filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();
    match config.log_format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .init(),
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter)
            .init(),
    }

    print_banner();

    let state = AppState::new(config).await?;

    info!("Environment: {}", state.config.environment);
    info!("Merchant: {}", state.merchant_id);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let sweeper = tokio::spawn(workers::run_sweeper(
        state.sweeper.clone(),
        state.clock.clone(),
        state.config.sweep_interval,
        shutdown_rx.clone(),
    ));
    let dispatcher = tokio::spawn(state.webhooks.clone().run(shutdown_rx));

    info!("🚀 UCP engine running, Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;

    info!("🛑 Shutting down");
    // Receivers only go away once both workers have exited
    if shutdown_tx.send(true).is_err() {
        warn!("Workers had already stopped");
    }
    for (name, handle) in [("sweeper", sweeper), ("webhook dispatcher", dispatcher)] {
        if let Err(e) = handle.await {
            warn!("{} ended abnormally: {}", name, e);
        }
    }

    info!("👋 Bye");
    Ok(())
}

fn print_banner() {
    println!(
        r#"
  🛒 UCP Checkout Engine
  ━━━━━━━━━━━━━━━━━━━━━━━
  Sessions, stock, tokens, webhooks
  Version: {}

"#,
        env!("CARGO_PKG_VERSION")
    );
}
