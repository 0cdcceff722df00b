// =============================================================================
// Meridian Hedge Nexus — Main Entry Point
// =============================================================================
//
// Cross-exchange perpetual-futures hedging: one supervisor process owning
// the venue set and the risk aggregator, one hedge-engine task per symbol.
// SIGINT/SIGTERM start a cooperative shutdown; fatal initialisation (empty
// snapshot, fewer than two venues) exits non-zero.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod chance_searcher;
mod config;
mod exchange_info;
mod funding_cache;
mod hedge_engine;
mod ipc;
mod market_data;
mod notify;
mod risk_aggregator;
mod spread_analyzer;
mod strategy_math;
mod supervisor;
mod types;
mod venue;

use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::Settings;
use crate::notify::{LogNotifier, Notifier};
use crate::supervisor::Supervisor;

#[tokio::main]
async fn main() {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Meridian Hedge Nexus — Starting Up               ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let settings = Settings::from_env();
    info!(symbols = ?settings.symbols, venues = ?settings.venues, "configured universe");

    // ── 2. Venue adapters ────────────────────────────────────────────────
    let venues = venue::build_venues(&settings.venues, &settings.symbols);
    let notifier: Arc<dyn Notifier> = Arc::new(LogNotifier);

    // ── 3. Supervisor ────────────────────────────────────────────────────
    let mut supervisor = match Supervisor::new(settings, venues, notifier) {
        Ok(supervisor) => supervisor,
        Err(e) => {
            error!(error = %e, "supervisor construction failed");
            std::process::exit(1);
        }
    };

    // ── 4. Signal handling (idempotent under repeated signals) ───────────
    let shutdown = supervisor.shutdown_handle();
    tokio::spawn(async move {
        let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(stream) => stream,
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                return;
            }
        };
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => warn!("SIGINT received — starting cooperative shutdown"),
                _ = sigterm.recv() => warn!("SIGTERM received — starting cooperative shutdown"),
            }
            shutdown.trigger();
        }
    });

    // ── 5. Run until shutdown ────────────────────────────────────────────
    if let Err(e) = supervisor.run().await {
        error!(error = %e, "supervisor exited with fatal error");
        std::process::exit(1);
    }

    info!("Meridian Hedge Nexus shut down complete.");
}
