// =============================================================================
// Supervisor — one hedge engine per symbol, shared risk snapshot, health
// =============================================================================
//
// Owns the venue set, the funding-rate cache and the aggregator.  Each child
// is an isolated task with its own snapshot slot, stop flag and stats; the
// supervisor is the only writer into the slots.  Startup is serialised to
// avoid REST rate-limit bursts; shutdown is cooperative with a hard join
// timeout per child.
// =============================================================================

pub mod health;

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::Settings;
use crate::exchange_info::CombinedSnapshot;
use crate::funding_cache::FundingRateCache;
use crate::hedge_engine::{EngineStats, RealtimeHedgeEngine};
use crate::ipc::{SnapshotSlot, StopFlag};
use crate::market_data::{OrderBookStream, SyntheticBookStream, WsDepthStream};
use crate::notify::{Channel, Notifier};
use crate::risk_aggregator::RiskAggregator;
use crate::venue::VenueRef;

use health::EngineHealth;

/// Per-child join timeout during shutdown.
const CHILD_JOIN_TIMEOUT: Duration = Duration::from_secs(3);

/// Static parameters of one engine child.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub symbol: String,
    pub exchange1_code: String,
    pub exchange2_code: String,
}

fn child_key(config: &EngineConfig) -> String {
    format!("{}_{}_{}", config.symbol, config.exchange1_code, config.exchange2_code)
}

struct Child {
    config: EngineConfig,
    slot: SnapshotSlot,
    stop: StopFlag,
    handle: JoinHandle<()>,
    stats: Arc<EngineStats>,
    health: EngineHealth,
}

pub struct Supervisor {
    settings: Settings,
    venues: Vec<VenueRef>,
    funding_cache: Arc<FundingRateCache>,
    aggregator: Arc<RiskAggregator>,
    notifier: Arc<dyn Notifier>,
    children: HashMap<String, Child>,
    cached_snapshot: Option<Arc<CombinedSnapshot>>,
    shutdown_flag: StopFlag,
    shutdown_started: bool,
    last_notify: Option<Instant>,
    engines_started: u64,
    total_restarts: u64,
    started_at: Instant,
}

impl Supervisor {
    pub fn new(settings: Settings, venues: Vec<VenueRef>, notifier: Arc<dyn Notifier>) -> Result<Self> {
        anyhow::ensure!(
            venues.len() >= 2,
            "at least 2 venues are required, got {}",
            venues.len()
        );

        let funding_cache = Arc::new(FundingRateCache::new());
        let aggregator = Arc::new(RiskAggregator::new(
            venues.clone(),
            settings.venue_limits,
            funding_cache.clone(),
        ));

        Ok(Self {
            settings,
            venues,
            funding_cache,
            aggregator,
            notifier,
            children: HashMap::new(),
            cached_snapshot: None,
            shutdown_flag: StopFlag::new(),
            shutdown_started: false,
            last_notify: None,
            engines_started: 0,
            total_restarts: 0,
            started_at: Instant::now(),
        })
    }

    /// Clone of the outer stop flag, for signal handlers.
    pub fn shutdown_handle(&self) -> StopFlag {
        self.shutdown_flag.clone()
    }

    #[cfg(test)]
    pub(crate) fn child_count(&self) -> usize {
        self.children.len()
    }

    // -------------------------------------------------------------------------
    // Startup
    // -------------------------------------------------------------------------

    /// Build the first snapshot. An empty snapshot at boot is fatal.
    pub async fn initialize(&mut self) -> Result<()> {
        let snapshot = self
            .aggregator
            .snapshot(false)
            .await
            .context("initial risk snapshot failed — refusing to start")?;
        info!("initial risk snapshot:\n{snapshot}");
        self.cached_snapshot = Some(Arc::new(snapshot));
        Ok(())
    }

    /// Launch one engine per symbol: configured whitelist plus whatever we
    /// already hold. Launches are staggered to stay under REST limits.
    pub async fn start_engines(&mut self) {
        let mut symbols: BTreeSet<String> = self.settings.symbols.iter().cloned().collect();
        if let Some(snapshot) = &self.cached_snapshot {
            symbols.extend(snapshot.holding_symbols());
        }

        let total = symbols.len();
        for (index, symbol) in symbols.into_iter().enumerate() {
            let Some((code1, code2)) = self.select_optimal_pair(&symbol).await else {
                warn!(symbol = %symbol, "no viable venue pair — skipping");
                continue;
            };
            let config = EngineConfig {
                symbol: symbol.clone(),
                exchange1_code: code1,
                exchange2_code: code2,
            };
            if let Err(e) = self.spawn_child(config, 0).await {
                error!(symbol = %symbol, error = %e, "failed to launch engine");
                continue;
            }

            if index + 1 < total {
                let delay = Duration::from_secs_f64(self.settings.manager.engine_startup_delay_sec);
                if self.shutdown_flag.sleep(delay).await {
                    return;
                }
            }
        }
        info!(engines = self.children.len(), "engine launch complete");
    }

    // -------------------------------------------------------------------------
    // Venue pair scoring
    // -------------------------------------------------------------------------

    fn venue_by_code(&self, code: &str) -> Option<VenueRef> {
        self.venues.iter().find(|v| v.exchange_code() == code).cloned()
    }

    /// Static per-venue reliability prior.
    fn reliability_prior(code: &str) -> f64 {
        match code {
            "binance" => 0.95,
            "hyperliquid" | "okx" => 0.90,
            "lighter" | "bybit" => 0.85,
            "aster" => 0.80,
            _ => 0.70,
        }
    }

    /// Weighted pair score: funding differential 40%, fees 20%,
    /// reliability 25%, liquidity prior 15%.
    async fn pair_score(&self, venue1: &VenueRef, venue2: &VenueRef, symbol: &str) -> f64 {
        let rate1 = venue1.get_funding_rate(symbol).await.unwrap_or(0.0);
        let rate2 = venue2.get_funding_rate(symbol).await.unwrap_or(0.0);
        let funding_score = ((rate1 - rate2).abs() * 10_000.0).min(10.0) * 0.4;

        let avg_fee = (venue1.taker_fee_rate() + venue2.taker_fee_rate()) / 2.0;
        let fee_score = ((0.002 - avg_fee) * 1000.0).max(0.0) * 0.2;

        let reliability = (Self::reliability_prior(venue1.exchange_code())
            + Self::reliability_prior(venue2.exchange_code()))
            / 2.0
            * 10.0
            * 0.25;

        // Flat liquidity prior carrying the remaining weight.
        let liquidity_score = 0.75;

        funding_score + fee_score + reliability + liquidity_score
    }

    /// Deterministic best pair for `symbol`; ties break on venue ordering.
    async fn select_optimal_pair(&self, symbol: &str) -> Option<(String, String)> {
        if self.venues.len() < 2 {
            return None;
        }

        let mut best: Option<((String, String), f64)> = None;
        for i in 0..self.venues.len() {
            for j in (i + 1)..self.venues.len() {
                let score = self.pair_score(&self.venues[i], &self.venues[j], symbol).await;
                let pair = (
                    self.venues[i].exchange_code().to_string(),
                    self.venues[j].exchange_code().to_string(),
                );
                info!(symbol, pair = format!("{}-{}", pair.0, pair.1), score = format!("{score:.4}"), "pair scored");
                match &best {
                    Some((_, best_score)) if score <= *best_score => {}
                    _ => best = Some((pair, score)),
                }
            }
        }
        best.map(|(pair, _)| pair)
    }

    // -------------------------------------------------------------------------
    // Child lifecycle
    // -------------------------------------------------------------------------

    /// Depth stream for a venue: a real WebSocket feed when an endpoint is
    /// configured, a synthetic tick-derived book otherwise.
    fn stream_for_venue(venue: &VenueRef) -> Arc<dyn OrderBookStream> {
        let key = format!("DEPTH_WS_URL_{}", venue.exchange_code().to_uppercase());
        match std::env::var(&key) {
            Ok(url) => Arc::new(WsDepthStream::new(url)),
            Err(_) => Arc::new(SyntheticBookStream::new(venue.clone())),
        }
    }

    async fn spawn_child(&mut self, config: EngineConfig, restart_count: u32) -> Result<()> {
        let key = child_key(&config);
        if let Some(existing) = self.children.get(&key) {
            if !existing.handle.is_finished() {
                info!(child = %key, "engine already running — skipping spawn");
                return Ok(());
            }
        }

        let venue1 = self
            .venue_by_code(&config.exchange1_code)
            .with_context(|| format!("unknown venue {}", config.exchange1_code))?;
        let venue2 = self
            .venue_by_code(&config.exchange2_code)
            .with_context(|| format!("unknown venue {}", config.exchange2_code))?;

        let slot = SnapshotSlot::new();
        if let Some(snapshot) = &self.cached_snapshot {
            slot.publish(snapshot.clone());
        }
        let stop = StopFlag::new();

        let trade_config = crate::config::TradeConfig::daemon(&config.symbol);
        let mut engine = RealtimeHedgeEngine::new(
            Self::stream_for_venue(&venue1),
            Self::stream_for_venue(&venue2),
            venue1,
            venue2,
            trade_config,
            self.settings.risk.clone(),
            slot.clone(),
            stop.clone(),
            self.notifier.clone(),
        )
        .with_aggregator(self.aggregator.clone());
        let stats = engine.stats();

        let task_symbol = config.symbol.clone();
        let handle = tokio::spawn(async move {
            if let Err(e) = engine.run().await {
                error!(symbol = %task_symbol, error = %e, "engine exited with error");
            }
        });

        let mut child_health = EngineHealth::new();
        child_health.restart_count = restart_count;

        info!(
            child = %key,
            restart_count,
            "engine child launched"
        );
        self.children.insert(
            key,
            Child {
                config,
                slot,
                stop,
                handle,
                stats,
                health: child_health,
            },
        );
        self.engines_started += 1;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Steady-state loop
    // -------------------------------------------------------------------------

    pub async fn run(&mut self) -> Result<()> {
        self.initialize().await?;
        self.start_engines().await;
        info!("supervisor main loop running");

        while !self.shutdown_flag.is_stopped() {
            self.refresh_risk_data().await;
            self.check_engine_health().await;
            self.maybe_send_digest().await;

            let interval = Duration::from_secs(self.settings.manager.risk_update_interval_min * 60);
            if self.shutdown_flag.sleep(interval).await {
                break;
            }
        }

        self.shutdown().await;
        Ok(())
    }

    /// Refresh the combined snapshot and broadcast it into every child's
    /// slot. Steady-state failures keep the previous snapshot (children
    /// apply the staleness bound on read).
    async fn refresh_risk_data(&mut self) {
        match self.aggregator.snapshot(false).await {
            Ok(snapshot) => {
                if let Some(reason) = snapshot.should_notify_risk() {
                    self.notifier
                        .notify(&format!("risk alert:\n{reason}"), Channel::Risk)
                        .await;
                }
                let snapshot = Arc::new(snapshot);
                for child in self.children.values() {
                    child.slot.publish(snapshot.clone());
                }
                self.cached_snapshot = Some(snapshot);
            }
            Err(e) => {
                warn!(error = %e, "snapshot refresh failed — children keep the previous snapshot");
            }
        }
    }

    /// Classify every child and restart the failed ones within budget.
    async fn check_engine_health(&mut self) {
        let process_mb = health::process_memory_mb();
        let mut failed_keys = Vec::new();

        for (key, child) in self.children.iter_mut() {
            if child.handle.is_finished() {
                warn!(child = %key, "engine task has exited");
                child.health.healthy = false;
                child.health.consecutive_failures += 1;
                failed_keys.push(key.clone());
                continue;
            }

            child.health.memory_usage_mb = process_mb;
            if process_mb > self.settings.manager.memory_limit_mb {
                warn!(
                    child = %key,
                    memory_mb = format!("{process_mb:.0}"),
                    limit_mb = self.settings.manager.memory_limit_mb,
                    "memory above limit"
                );
                child.health.healthy = false;
            } else {
                child.health.healthy = true;
            }

            if let Some(idle_ms) = child.stats.idle_ms() {
                if idle_ms > self.settings.manager.no_trade_timeout_min * 60_000 {
                    warn!(child = %key, idle_min = idle_ms / 60_000, "engine shows no recent activity");
                }
            }
        }

        for key in failed_keys {
            let Some(child) = self.children.remove(&key) else {
                continue;
            };

            if !health::should_restart(&child.health, self.settings.manager.max_restart_attempts) {
                let msg = format!(
                    "engine {key} removed permanently after {} restarts",
                    child.health.restart_count
                );
                error!("{msg}");
                self.notifier.notify(&msg, Channel::Risk).await;
                continue;
            }

            let backoff_min = self
                .settings
                .manager
                .restart_backoff_factor
                .powi(child.health.restart_count as i32);
            if backoff_min > 1.0 {
                info!(child = %key, backoff_min = format!("{backoff_min:.1}"), "restart backoff");
                if self
                    .shutdown_flag
                    .sleep(Duration::from_secs_f64(backoff_min * 60.0))
                    .await
                {
                    return;
                }
            }

            let next_restart = child.health.restart_count + 1;
            match self.spawn_child(child.config.clone(), next_restart).await {
                Ok(()) => {
                    self.total_restarts += 1;
                    info!(child = %key, attempt = next_restart, "engine restarted");
                }
                Err(e) => error!(child = %key, error = %e, "engine restart failed"),
            }
        }
    }

    /// Periodic digest of activity, memory and restart counts.
    async fn maybe_send_digest(&mut self) {
        if !self.settings.manager.enable_notifications {
            return;
        }
        let interval = Duration::from_secs(self.settings.manager.notify_interval_min * 60);
        let due = self.last_notify.map(|at| at.elapsed() >= interval).unwrap_or(true);
        if !due {
            return;
        }

        let active = self.children.values().filter(|c| !c.handle.is_finished()).count();
        let healthy = self.children.values().filter(|c| c.health.healthy).count();
        let trades: u64 = self
            .children
            .values()
            .map(|c| c.stats.trade_count.load(std::sync::atomic::Ordering::Relaxed))
            .sum();
        let max_restarts = self.children.values().map(|c| c.health.restart_count).max().unwrap_or(0);

        let (cache_age, cache_venues, cache_pairs) = self.funding_cache.cache_info();
        let mut digest = format!(
            "supervisor digest\nengines: {active} active ({healthy} healthy)\n\
             started/restarted: {}/{}\ntrades: {trades}\n\
             memory: {:.0} MB\nmax restarts: {max_restarts}\nuptime: {} min\n\
             funding cache: {cache_venues} venues / {cache_pairs} pairs (age {}s)",
            self.engines_started,
            self.total_restarts,
            health::process_memory_mb(),
            self.started_at.elapsed().as_secs() / 60,
            cache_age.map(|a| a.as_secs()).unwrap_or(0)
        );
        if let Some(snapshot) = &self.cached_snapshot {
            digest.push_str(&format!("\n{snapshot}"));
        }

        self.notifier.notify(&digest, Channel::Trade).await;
        self.last_notify = Some(Instant::now());
    }

    // -------------------------------------------------------------------------
    // Shutdown
    // -------------------------------------------------------------------------

    /// Cooperative shutdown: broadcast stop, join each child with a hard
    /// timeout, then abort stragglers. Safe to call more than once.
    pub async fn shutdown(&mut self) {
        if self.shutdown_started {
            return;
        }
        self.shutdown_started = true;
        self.shutdown_flag.trigger();
        warn!("supervisor shutting down");

        // Last look at the book before the engines go away.
        if let Ok(snapshot) = self.aggregator.snapshot(false).await {
            self.notifier.notify(&snapshot.to_string(), Channel::Trade).await;
        }

        for child in self.children.values() {
            child.stop.trigger();
        }

        for (key, mut child) in self.children.drain() {
            match tokio::time::timeout(CHILD_JOIN_TIMEOUT, &mut child.handle).await {
                Ok(_) => info!(child = %key, "engine joined"),
                Err(_) => {
                    warn!(child = %key, "engine did not stop in time — aborting");
                    child.handle.abort();
                    let _ = child.handle.await;
                }
            }
        }

        let report = format!(
            "supervisor stopped\nuptime: {} min\nengines started: {}\nrestarts: {}",
            self.started_at.elapsed().as_secs() / 60,
            self.engines_started,
            self.total_restarts
        );
        self.notifier.notify(&report, Channel::Trade).await;
        info!("supervisor shutdown complete");
    }
}
