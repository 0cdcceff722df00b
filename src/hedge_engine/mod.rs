// =============================================================================
// Realtime hedge engine — single-writer control loop for one symbol / pair
// =============================================================================
//
// One logical task drives the loop: consume both live books, evaluate the
// spread signal under the layered risk gate, size against live depth, fire
// both market legs concurrently, reconcile fills and adapt the minimum
// profit-rate.  Order placement is the only fan-out, and it is joined
// before the next iteration — there is never more than one trade in flight.
// =============================================================================

pub mod balance;
pub mod execution;
pub mod signal;
pub mod sizing;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use tracing::{error, info, warn};

use crate::config::{RiskConfig, TradeConfig};
use crate::ipc::{SnapshotSlot, StopFlag};
use crate::market_data::{BookCell, OrderBook, OrderBookStream};
use crate::notify::{Channel, Notifier};
use crate::risk_aggregator::RiskAggregator;
use crate::spread_analyzer::SpreadAnalyzer;
use crate::strategy_math::calculate_zscore;
use crate::types::{base_symbol, Position, Side};
use crate::venue::VenueRef;

use execution::{place_dual_market_orders, resolve_avg_price, spread_profit};
use signal::{build_signal, MarketInfo, TradeSignal};
use sizing::calc_trade_amount;

/// Hard cap on signal age at execution time: beyond this the trade would
/// cross at stale prices and is dropped.
const MAX_SIGNAL_DELAY_MS: f64 = 50.0;
/// Soft latency bound: stages slower than this are logged.
const WARN_SIGNAL_DELAY_MS: f64 = 10.0;
/// Market-info (spread stats + funding) cache lifetime.
const MARKET_INFO_TTL: Duration = Duration::from_secs(3600);
/// Post-trade pause cap in minutes.
const MAX_PAUSE_MIN: f64 = 3.0;
/// No-trade downshifts allowed per engine lifetime.
const MAX_RATE_DOWNSHIFTS: u32 = 5;
/// Historical-mean deviation factor that marks a regime break.
const REGIME_DEVIATION_FACTOR: f64 = 3.0;

fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// -----------------------------------------------------------------------------
// Shared stats
// -----------------------------------------------------------------------------

/// Lock-free view of a running engine, shared with the supervisor for
/// health checks and digests.
#[derive(Default)]
pub struct EngineStats {
    pub running: AtomicBool,
    pub trade_count: AtomicU64,
    cum_volume_bits: AtomicU64,
    cum_profit_bits: AtomicU64,
    pub last_trade_epoch_ms: AtomicU64,
    pub last_tick_epoch_ms: AtomicU64,
}

impl EngineStats {
    pub fn new() -> Self {
        Self::default()
    }

    fn record_tick(&self) {
        self.last_tick_epoch_ms.store(epoch_ms(), Ordering::Relaxed);
    }

    fn record_trade(&self, cum_volume: f64, cum_profit: f64) {
        self.trade_count.fetch_add(1, Ordering::Relaxed);
        self.cum_volume_bits.store(cum_volume.to_bits(), Ordering::Relaxed);
        self.cum_profit_bits.store(cum_profit.to_bits(), Ordering::Relaxed);
        self.last_trade_epoch_ms.store(epoch_ms(), Ordering::Relaxed);
    }

    pub fn cum_volume(&self) -> f64 {
        f64::from_bits(self.cum_volume_bits.load(Ordering::Relaxed))
    }

    pub fn cum_profit(&self) -> f64 {
        f64::from_bits(self.cum_profit_bits.load(Ordering::Relaxed))
    }

    /// Milliseconds since the loop last made progress, `None` before start.
    pub fn idle_ms(&self) -> Option<u64> {
        let last = self.last_tick_epoch_ms.load(Ordering::Relaxed);
        if last == 0 {
            None
        } else {
            Some(epoch_ms().saturating_sub(last))
        }
    }
}

// -----------------------------------------------------------------------------
// Gate rejection
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RejectKind {
    /// Spread profit rate below the requirement — poll again quickly.
    ProfitRate,
    /// Anything else (stale book, thin depth, risk limits) — back off longer.
    Other,
}

#[derive(Debug, Clone)]
struct GateReject {
    kind: RejectKind,
    reason: String,
}

// -----------------------------------------------------------------------------
// Engine
// -----------------------------------------------------------------------------

pub struct RealtimeHedgeEngine {
    stream1: Arc<dyn OrderBookStream>,
    stream2: Arc<dyn OrderBookStream>,
    venue1: VenueRef,
    venue2: VenueRef,
    trade_config: TradeConfig,
    risk_config: RiskConfig,
    symbol: String,
    exchange_pair: String,
    venue_codes: Vec<String>,
    taker_fee_rate: f64,
    snapshot_slot: SnapshotSlot,
    stop: StopFlag,
    aggregator: Option<Arc<RiskAggregator>>,
    notifier: Arc<dyn Notifier>,
    stats: Arc<EngineStats>,

    book1: BookCell,
    book2: BookCell,

    running: bool,
    timeout_enabled: bool,
    trade_count: u64,
    cum_volume: f64,
    cum_profit: f64,
    remaining_amount: f64,
    last_trade_time: Instant,
    position1: Option<Position>,
    position2: Option<Position>,

    recent_profit_rates: Vec<f64>,
    last_adjustment_trade_count: u64,
    initial_min_profit_rate: f64,
    rate_downshift_count: u32,

    market_info: Option<(MarketInfo, Instant)>,
    last_wait_log: Option<Instant>,
}

impl RealtimeHedgeEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        stream1: Arc<dyn OrderBookStream>,
        stream2: Arc<dyn OrderBookStream>,
        venue1: VenueRef,
        venue2: VenueRef,
        trade_config: TradeConfig,
        risk_config: RiskConfig,
        snapshot_slot: SnapshotSlot,
        stop: StopFlag,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let symbol = base_symbol(&trade_config.pair1);
        let exchange_pair = format!("{}-{}", venue1.exchange_code(), venue2.exchange_code());
        let venue_codes = vec![
            venue1.exchange_code().to_string(),
            venue2.exchange_code().to_string(),
        ];
        let taker_fee_rate = venue1.taker_fee_rate() + venue2.taker_fee_rate();
        let timeout_enabled = trade_config.no_trade_timeout_sec > 0.0;
        let remaining_amount = trade_config.total_amount;
        let initial_min_profit_rate = risk_config.min_profit_rate;

        Self {
            stream1,
            stream2,
            venue1,
            venue2,
            trade_config,
            risk_config,
            symbol,
            exchange_pair,
            venue_codes,
            taker_fee_rate,
            snapshot_slot,
            stop,
            aggregator: None,
            notifier,
            stats: Arc::new(EngineStats::new()),
            book1: BookCell::new(),
            book2: BookCell::new(),
            running: false,
            timeout_enabled,
            trade_count: 0,
            cum_volume: 0.0,
            cum_profit: 0.0,
            remaining_amount,
            last_trade_time: Instant::now(),
            position1: None,
            position2: None,
            recent_profit_rates: Vec::new(),
            last_adjustment_trade_count: 0,
            initial_min_profit_rate,
            rate_downshift_count: 0,
            market_info: None,
            last_wait_log: None,
        }
    }

    /// Attach the aggregator used for post-trade snapshot refreshes.
    pub fn with_aggregator(mut self, aggregator: Arc<RiskAggregator>) -> Self {
        self.aggregator = Some(aggregator);
        self
    }

    pub fn stats(&self) -> Arc<EngineStats> {
        self.stats.clone()
    }

    #[cfg(test)]
    pub(crate) fn test_book_cells(&self) -> (BookCell, BookCell) {
        (self.book1.clone(), self.book2.clone())
    }

    #[cfg(test)]
    pub(crate) fn min_profit_rate(&self) -> f64 {
        self.risk_config.min_profit_rate
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Subscribe, wait for both books, then run the trading loop to
    /// completion and stop both streams.
    pub async fn run(&mut self) -> Result<()> {
        info!(
            symbol = %self.symbol,
            pair = %self.exchange_pair,
            daemon = self.trade_config.daemon_mode,
            total_amount = self.trade_config.total_amount,
            min_profit_rate = self.risk_config.min_profit_rate,
            max_orderbook_age_sec = self.risk_config.max_orderbook_age_sec,
            "hedge engine starting"
        );

        let cell1 = self.book1.clone();
        self.stream1
            .subscribe(&self.trade_config.pair1, Arc::new(move |book| cell1.store(book)));
        let cell2 = self.book2.clone();
        self.stream2
            .subscribe(&self.trade_config.pair2, Arc::new(move |book| cell2.store(book)));

        self.stream1.start().await.context("stream1 failed to start")?;
        self.stream2.start().await.context("stream2 failed to start")?;

        // Give the streams a grace window, then keep retrying with a log.
        for _ in 0..50 {
            if self.book1.load().is_some() && self.book2.load().is_some() {
                break;
            }
            if self.stop.sleep(Duration::from_millis(100)).await {
                self.shutdown_streams().await;
                return Ok(());
            }
        }
        while self.book1.load().is_none() || self.book2.load().is_none() {
            if self.stop.is_stopped() {
                self.shutdown_streams().await;
                return Ok(());
            }
            error!(symbol = %self.symbol, pair = %self.exchange_pair, "order books not ready");
            self.stop.sleep(Duration::from_secs(1)).await;
        }
        self.stop.sleep(Duration::from_millis(100)).await;
        info!(symbol = %self.symbol, pair = %self.exchange_pair, "order books ready");

        self.running = true;
        self.stats.running.store(true, Ordering::SeqCst);
        self.trading_loop().await;
        self.shutdown_streams().await;
        self.stats.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Stop both streams in parallel, capped at 5 s.
    async fn shutdown_streams(&self) {
        let stop_both = async {
            tokio::join!(self.stream1.stop(), self.stream2.stop());
        };
        if tokio::time::timeout(Duration::from_secs(5), stop_both).await.is_err() {
            warn!(pair = %self.exchange_pair, "stream stop timed out — continuing shutdown");
        }
    }

    // -------------------------------------------------------------------------
    // Main loop
    // -------------------------------------------------------------------------

    async fn trading_loop(&mut self) {
        info!(symbol = %self.symbol, pair = %self.exchange_pair, "trading loop started");
        if let Err(e) = self.update_exchange_info().await {
            warn!(error = %e, "initial position refresh failed");
        }
        if self.timeout_enabled {
            info!(
                timeout_sec = self.trade_config.no_trade_timeout_sec,
                "no-trade timeout armed"
            );
        }

        while self.running
            && !self.stop.is_stopped()
            && (self.remaining_amount > 0.0 || self.trade_config.daemon_mode)
        {
            self.stats.record_tick();

            if self.trade_config.daemon_mode && self.snapshot_slot.read().is_none() {
                if self.should_log_waiting() {
                    warn!(symbol = %self.symbol, "risk snapshot not yet available — waiting");
                }
                self.stop.sleep(Duration::from_secs(1)).await;
                continue;
            }

            if self.timeout_enabled {
                let idle = self.last_trade_time.elapsed().as_secs_f64();
                if idle > self.trade_config.no_trade_timeout_sec {
                    warn!(
                        idle_sec = idle,
                        trades = self.trade_count,
                        "no-trade timeout elapsed — stopping engine"
                    );
                    break;
                }
            }

            self.maybe_downshift_min_rate();

            let generated_at = Instant::now();
            let signal = if self.trade_config.daemon_mode {
                self.compute_signal_daemon(generated_at).await
            } else {
                self.compute_signal_fixed(generated_at).await
            };
            let Some(signal) = signal else {
                self.stop.sleep(Duration::from_millis(50)).await;
                continue;
            };
            self.warn_if_slow(&signal, "signal generation");

            let reject = self.risk_check(&signal).await;
            self.warn_if_slow(&signal, "risk gate");

            if let Some(reject) = reject {
                let backoff = match reject.kind {
                    RejectKind::ProfitRate => {
                        if self.should_log_waiting() {
                            info!(
                                symbol = %self.symbol,
                                pair = %self.exchange_pair,
                                spread_rate = format!("{:.4}%", signal.spread_rate * 100.0),
                                z_score = format!("{:.2}/{:.2}", signal.z_score, signal.z_score_after_fee),
                                reason = %reject.reason,
                                "waiting for spread"
                            );
                        }
                        Duration::from_millis(100)
                    }
                    RejectKind::Other => {
                        if self.should_log_waiting() {
                            warn!(symbol = %self.symbol, pair = %self.exchange_pair, "{}", reject.reason);
                        }
                        Duration::from_millis(300)
                    }
                };
                self.stop.sleep(backoff).await;
                continue;
            }

            let (Some(book1), Some(book2)) = (self.book1.load(), self.book2.load()) else {
                self.stop.sleep(Duration::from_millis(50)).await;
                continue;
            };
            let max_open_notional = self.max_open_notional_value();
            let amount = match calc_trade_amount(
                &self.venue1,
                &self.venue2,
                &self.trade_config,
                &signal,
                &book1,
                &book2,
                self.remaining_amount,
                max_open_notional,
            )
            .await
            {
                Ok(amount) => amount,
                Err(e) => {
                    warn!(error = %e, "sizing failed — skipping tick");
                    self.stop.sleep(Duration::from_millis(50)).await;
                    continue;
                }
            };
            self.warn_if_slow(&signal, "sizing");

            if amount <= 0.0 {
                warn!(symbol = %self.symbol, "sized amount is zero — skipping trade");
                self.stop.sleep(Duration::from_millis(50)).await;
                continue;
            }

            match self.execute_trade(&signal, amount).await {
                Ok(_) => {}
                Err(e) => {
                    error!(symbol = %self.symbol, error = %e, "trade pipeline failed — halting engine");
                    self.notifier
                        .notify(
                            &format!("{} {}: engine halting: {e}", self.symbol, self.exchange_pair),
                            Channel::Risk,
                        )
                        .await;
                    break;
                }
            }

            if let Err(e) = self.update_exchange_info().await {
                warn!(error = %e, "post-trade position refresh failed");
            }
            self.auto_force_reduce_to_safe().await;

            self.stop
                .sleep(Duration::from_secs_f64(self.trade_config.trade_interval_sec))
                .await;
        }

        info!(
            symbol = %self.symbol,
            pair = %self.exchange_pair,
            trades = self.trade_count,
            cum_volume = format!("{:.2}", self.cum_volume),
            cum_profit = format!("{:.2}", self.cum_profit),
            "trading loop finished"
        );
        self.auto_balance_position().await;
    }

    fn warn_if_slow(&self, signal: &TradeSignal, stage: &str) {
        let delay = signal.delay_ms();
        if delay > WARN_SIGNAL_DELAY_MS {
            warn!(
                symbol = %self.symbol,
                pair = %self.exchange_pair,
                stage,
                delay_ms = format!("{delay:.2}"),
                "tick stage slow"
            );
        }
    }

    /// Throttle waiting logs to one line per 10 s.
    fn should_log_waiting(&mut self) -> bool {
        let now = Instant::now();
        match self.last_wait_log {
            Some(at) if now.duration_since(at) < Duration::from_secs(10) => false,
            _ => {
                self.last_wait_log = Some(now);
                true
            }
        }
    }

    // -------------------------------------------------------------------------
    // Market info (1h cached)
    // -------------------------------------------------------------------------

    async fn pair_market_info(&mut self) -> MarketInfo {
        if let Some((info, fetched_at)) = &self.market_info {
            if fetched_at.elapsed() < MARKET_INFO_TTL {
                return info.clone();
            }
        }

        let analyzer = SpreadAnalyzer::new(self.venue1.clone(), self.venue2.clone());
        let spread_stats = match analyzer.analyze_spread(&self.symbol, "1m", 1000).await {
            Ok(stats) => Some(stats),
            Err(e) => {
                warn!(symbol = %self.symbol, error = %e, "spread analysis unavailable");
                None
            }
        };

        let funding_rate1 = match self.venue1.get_funding_rate(&self.trade_config.pair1).await {
            Ok(rate) => rate,
            Err(e) => {
                warn!(venue = %self.venue1.exchange_code(), error = %e, "funding rate unavailable");
                0.0
            }
        };
        let funding_rate2 = match self.venue2.get_funding_rate(&self.trade_config.pair2).await {
            Ok(rate) => rate,
            Err(e) => {
                warn!(venue = %self.venue2.exchange_code(), error = %e, "funding rate unavailable");
                0.0
            }
        };

        let info = MarketInfo {
            spread_stats,
            funding_rate1,
            funding_rate2,
        };
        self.market_info = Some((info.clone(), Instant::now()));
        info
    }

    // -------------------------------------------------------------------------
    // Snapshot helpers
    // -------------------------------------------------------------------------

    fn can_add_position(&self) -> bool {
        match self.snapshot_slot.read_checked(&self.exchange_pair) {
            Some(snapshot) => snapshot.can_add_position(&self.venue_codes),
            None => false,
        }
    }

    fn max_open_notional_value(&self) -> f64 {
        self.snapshot_slot
            .read_checked(&self.exchange_pair)
            .and_then(|s| s.max_open_notional_value(&self.venue_codes))
            .unwrap_or(f64::INFINITY)
    }

    /// Refresh the combined snapshot (when an aggregator is attached),
    /// re-read this symbol's per-venue positions and re-balance if needed.
    pub(crate) async fn update_exchange_info(&mut self) -> Result<()> {
        if let Some(aggregator) = &self.aggregator {
            match aggregator.snapshot(false).await {
                Ok(snapshot) => self.snapshot_slot.publish(Arc::new(snapshot)),
                Err(e) => warn!(error = %e, "snapshot refresh failed — keeping previous"),
            }
        }

        match self.snapshot_slot.read_checked(&self.exchange_pair) {
            Some(snapshot) => {
                let mut positions = snapshot.symbol_positions(&self.symbol, &self.venue_codes);
                self.position2 = positions.pop().flatten();
                self.position1 = positions.pop().flatten();
                if self.position1.is_some() && self.position2.is_some() {
                    self.auto_balance_position().await;
                }
            }
            None => {
                self.position1 = None;
                self.position2 = None;
            }
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Signal generation
    // -------------------------------------------------------------------------

    fn current_spread(book1: &OrderBook, book2: &OrderBook) -> Option<f64> {
        let mid1 = book1.mid_price()?;
        let mid2 = book2.mid_price()?;
        if mid2 == 0.0 {
            return None;
        }
        Some((mid1 - mid2) / mid2)
    }

    /// Whether a trade on these sides opens/grows the hedge or reduces it.
    fn classify_add_position(&self, side1: Side, side2: Side) -> bool {
        match (&self.position1, &self.position2) {
            (Some(p1), Some(p2)) => {
                p1.position_side() == Some(side1) && p2.position_side() == Some(side2)
            }
            _ => true,
        }
    }

    /// Daemon mode: the engine decides sides from the z-score, falling back
    /// to the reduce direction when risk forbids adding.
    async fn compute_signal_daemon(&mut self, generated_at: Instant) -> Option<TradeSignal> {
        let book1 = self.book1.load()?;
        let book2 = self.book2.load()?;
        let current_spread = Self::current_spread(&book1, &book2)?;

        let info = self.pair_market_info().await;
        let z_score = calculate_zscore(
            current_spread,
            info.spread_stats.as_ref(),
            info.funding_rate1,
            info.funding_rate2,
            None,
            0.0,
        );

        let (side1, side2) = if self.can_add_position() {
            // Undervalued spread: long venue 1 against venue 2; mirrored
            // when overvalued.
            if z_score <= 0.0 {
                (Side::Buy, Side::Sell)
            } else {
                (Side::Sell, Side::Buy)
            }
        } else {
            // Risk limits forbid adding: only the reduce direction remains.
            let p1 = self.position1.as_ref()?;
            let p2 = self.position2.as_ref()?;
            (p1.position_side()?.opposite(), p2.position_side()?.opposite())
        };

        let price1 = book1.taking_price(side1)?;
        let price2 = book2.taking_price(side2)?;
        let is_add = self.classify_add_position(side1, side2);

        Some(build_signal(
            &self.trade_config.pair1,
            &self.trade_config.pair2,
            (side1, side2),
            (price1, price2),
            current_spread,
            &info,
            self.trade_config.zscore_threshold,
            self.taker_fee_rate,
            is_add,
            generated_at,
        ))
    }

    /// Fixed-side mode: the operator chose the direction; only prices move.
    async fn compute_signal_fixed(&mut self, generated_at: Instant) -> Option<TradeSignal> {
        let book1 = self.book1.load()?;
        let book2 = self.book2.load()?;
        let current_spread = Self::current_spread(&book1, &book2)?;

        let side1 = self.trade_config.side1;
        let side2 = self.trade_config.side2;
        let price1 = book1.taking_price(side1)?;
        let price2 = book2.taking_price(side2)?;

        let info = self.pair_market_info().await;
        let is_add = self.classify_add_position(side1, side2);

        Some(build_signal(
            &self.trade_config.pair1,
            &self.trade_config.pair2,
            (side1, side2),
            (price1, price2),
            current_spread,
            &info,
            self.trade_config.zscore_threshold,
            self.taker_fee_rate,
            is_add,
            generated_at,
        ))
    }

    // -------------------------------------------------------------------------
    // Risk gate
    // -------------------------------------------------------------------------

    /// Ordered risk gate; the first failure short-circuits with a
    /// human-readable reason.
    async fn risk_check(&mut self, signal: &TradeSignal) -> Option<GateReject> {
        // a. Aggregator clearance for adds.
        if self.trade_config.daemon_mode && signal.is_add_position && !self.can_add_position() {
            return Some(GateReject {
                kind: RejectKind::Other,
                reason: format!(
                    "cannot add position, risk limited ({:.3}%|{:.2})",
                    signal.spread_rate * 100.0,
                    signal.z_score
                ),
            });
        }

        // b. Order-book freshness.
        if let Some(reject) = self.check_orderbook_freshness() {
            return Some(reject);
        }

        let (Some(book1), Some(book2)) = (self.book1.load(), self.book2.load()) else {
            return Some(GateReject {
                kind: RejectKind::Other,
                reason: "order books incomplete".to_string(),
            });
        };

        // c. Venue bid/ask spread.
        for (code, book) in [
            (self.venue1.exchange_code(), &book1),
            (self.venue2.exchange_code(), &book2),
        ] {
            if let Some(spread) = book.spread_pct() {
                if spread > self.risk_config.max_spread_pct {
                    return Some(GateReject {
                        kind: RejectKind::Other,
                        reason: format!(
                            "{code} {}: venue spread too wide ({:.4}% > {:.4}%)",
                            book.pair,
                            spread * 100.0,
                            self.risk_config.max_spread_pct * 100.0
                        ),
                    });
                }
            }
        }

        // d. Directional depth.
        let liquidity1 = book1.taking_liquidity_usd(signal.side1, self.risk_config.liquidity_depth_levels);
        let liquidity2 = book2.taking_liquidity_usd(signal.side2, self.risk_config.liquidity_depth_levels);
        if liquidity1 < self.risk_config.min_liquidity_usd {
            return Some(GateReject {
                kind: RejectKind::Other,
                reason: format!(
                    "{} {}: insufficient liquidity (${liquidity1:.2})",
                    self.venue1.exchange_code(),
                    book1.pair
                ),
            });
        }
        if liquidity2 < self.risk_config.min_liquidity_usd {
            return Some(GateReject {
                kind: RejectKind::Other,
                reason: format!(
                    "{} {}: insufficient liquidity (${liquidity2:.2})",
                    self.venue2.exchange_code(),
                    book2.pair
                ),
            });
        }

        // e. Spread profit rate.
        let required = if signal.is_add_position {
            self.risk_config.min_profit_rate
        } else {
            self.risk_config.reduce_pos_min_profit_rate
        };
        if signal.spread_rate < required {
            return Some(GateReject {
                kind: RejectKind::ProfitRate,
                reason: format!(
                    "spread profit rate below requirement ({:.4}% < {:.4}%)",
                    signal.spread_rate * 100.0,
                    required * 100.0
                ),
            });
        }

        if self.trade_config.daemon_mode {
            // f. Regime break: current spread far from its history.
            let info = self.pair_market_info().await;
            if let Some(stats) = &info.spread_stats {
                let mean = stats.mean_spread;
                if mean != 0.0 {
                    if let Some(current) = Self::current_spread(&book1, &book2) {
                        let deviation = (current - mean).abs() / mean.abs();
                        if deviation > REGIME_DEVIATION_FACTOR {
                            return Some(GateReject {
                                kind: RejectKind::Other,
                                reason: format!(
                                    "spread regime break: {:.4}% deviates {deviation:.1}x from mean",
                                    current * 100.0
                                ),
                            });
                        }
                    }
                }
            }

            // g. The fee-adjusted score must support the chosen side.
            if !signal.is_zscore_triggered() {
                return Some(GateReject {
                    kind: RejectKind::ProfitRate,
                    reason: format!(
                        "z-score does not support chosen side (z={:.2}, threshold={:.2})",
                        signal.z_score_after_fee, signal.zscore_threshold
                    ),
                });
            }
        }

        None
    }

    fn check_orderbook_freshness(&self) -> Option<GateReject> {
        let max_age = self.risk_config.max_orderbook_age_sec;
        let book1 = self.book1.load();
        let book2 = self.book2.load();

        let (Some(book1), Some(book2)) = (book1, book2) else {
            return Some(GateReject {
                kind: RejectKind::Other,
                reason: "order books incomplete".to_string(),
            });
        };
        if book1.is_stale(max_age) {
            return Some(GateReject {
                kind: RejectKind::Other,
                reason: format!(
                    "{} {}: order-book stale ({:.2}s)",
                    self.venue1.exchange_code(),
                    book1.pair,
                    book1.age().as_secs_f64()
                ),
            });
        }
        if book2.is_stale(max_age) {
            return Some(GateReject {
                kind: RejectKind::Other,
                reason: format!(
                    "{} {}: order-book stale ({:.2}s)",
                    self.venue2.exchange_code(),
                    book2.pair,
                    book2.age().as_secs_f64()
                ),
            });
        }
        None
    }

    // -------------------------------------------------------------------------
    // Execution
    // -------------------------------------------------------------------------

    /// Execute one dual-leg trade. `Ok(false)` means the trade was skipped
    /// or only partially placed (handled by alert + auto-balance); errors
    /// mean reconciliation failed and the engine must halt.
    async fn execute_trade(&mut self, signal: &TradeSignal, amount: f64) -> Result<bool> {
        info!(
            symbol = %self.symbol,
            pair = %self.exchange_pair,
            amount,
            value = format!("{:.2}", amount * signal.price1),
            price1 = signal.price1,
            price2 = signal.price2,
            spread_rate = format!("{:.4}%", signal.spread_rate * 100.0),
            z_score = format!("{:.2}", signal.z_score),
            delay_ms = format!("{:.2}", signal.delay_ms()),
            "executing hedge trade"
        );

        let delay = signal.delay_ms();
        if delay > MAX_SIGNAL_DELAY_MS {
            error!(
                symbol = %self.symbol,
                pair = %self.exchange_pair,
                delay_ms = format!("{delay:.2}"),
                "signal too old — trade aborted"
            );
            return Ok(false);
        } else if delay > WARN_SIGNAL_DELAY_MS {
            warn!(
                symbol = %self.symbol,
                pair = %self.exchange_pair,
                delay_ms = format!("{delay:.2}"),
                "signal latency elevated"
            );
        }

        let reduce_only = !signal.is_add_position;
        let (result1, result2) = place_dual_market_orders(
            &self.venue1,
            &self.trade_config.pair1,
            signal.side1,
            &self.venue2,
            &self.trade_config.pair2,
            signal.side2,
            amount,
            signal.price1,
            signal.price2,
            reduce_only,
        )
        .await;

        let (receipt1, receipt2) = match (result1, result2) {
            (Ok(r1), Ok(r2)) => (r1, r2),
            (Ok(_), Err(e)) => {
                self.alert_one_leg_failure(self.venue2.exchange_code(), signal.side2, amount, &e)
                    .await;
                return Ok(false);
            }
            (Err(e), Ok(_)) => {
                self.alert_one_leg_failure(self.venue1.exchange_code(), signal.side1, amount, &e)
                    .await;
                return Ok(false);
            }
            (Err(e1), Err(e2)) => {
                warn!(
                    symbol = %self.symbol,
                    error1 = %e1,
                    error2 = %e2,
                    "both legs failed — skipping tick"
                );
                return Ok(false);
            }
        };

        // Give the venues a moment to index the fills.
        tokio::time::sleep(Duration::from_millis(100)).await;

        let avg_price1 = resolve_avg_price(&self.venue1, &self.trade_config.pair1, &receipt1).await?;
        let avg_price2 = resolve_avg_price(&self.venue2, &self.trade_config.pair2, &receipt2).await?;

        let profit = spread_profit(signal.side1, avg_price1, avg_price2, amount);
        let executed_rate = profit / (amount * avg_price1);

        self.trade_count += 1;
        self.cum_volume += amount * avg_price1;
        self.cum_profit += profit;
        self.remaining_amount -= amount;
        self.last_trade_time = Instant::now();
        self.stats.record_trade(self.cum_volume, self.cum_profit);

        let trade_msg = format!(
            "{} {} trade #{}: fills {avg_price1:.6}/{avg_price2:.6} profit ${profit:.2} ({:.4}%) cum ${:.2} (${:.2})",
            self.symbol,
            self.exchange_pair,
            self.trade_count,
            executed_rate * 100.0,
            self.cum_volume,
            self.cum_profit
        );
        info!("{trade_msg}");
        self.notifier.notify(&signal.to_string(), Channel::Quiet).await;
        self.notifier.notify(&trade_msg, Channel::Quiet).await;

        // An opportunistic daemon engine converts to perpetual mode once it
        // actually holds a position.
        if self.trade_count == 1 && self.trade_config.daemon_mode && self.trade_config.no_trade_timeout_sec > 0.0
        {
            self.trade_config.no_trade_timeout_sec = 0.0;
            self.timeout_enabled = false;
            info!(symbol = %self.symbol, "position established — converting to perpetual mode");
        }

        self.adjust_min_profit_rate(executed_rate);

        // Under-performing fills pause the engine proportionally.
        let floor = if signal.is_add_position {
            self.risk_config.min_profit_rate
        } else {
            self.risk_config.reduce_pos_min_profit_rate
        };
        if floor != 0.0 {
            let pause_min = ((floor - executed_rate) / floor.abs()).min(MAX_PAUSE_MIN);
            if pause_min > 0.0 {
                info!(
                    symbol = %self.symbol,
                    executed_rate = format!("{:.4}%", executed_rate * 100.0),
                    pause_sec = (pause_min * 60.0) as u64,
                    "fill under-performed the minimum rate — pausing"
                );
                self.stop.sleep(Duration::from_secs_f64(pause_min * 60.0)).await;
            }
        }

        Ok(true)
    }

    async fn alert_one_leg_failure(&self, venue: &str, side: Side, amount: f64, error: &anyhow::Error) {
        error!(
            symbol = %self.symbol,
            venue,
            side = %side,
            amount,
            error = %error,
            "ONE LEG FAILED — hedge is one-sided"
        );
        self.notifier
            .notify(
                &format!(
                    "{} {}: leg on {venue} failed ({side} {amount}): {error} — auto-balance will attempt repair",
                    self.symbol, self.exchange_pair
                ),
                Channel::Risk,
            )
            .await;
    }

    // -------------------------------------------------------------------------
    // Adaptive minimum profit rate
    // -------------------------------------------------------------------------

    /// Track realised rates and adapt the minimum requirement.
    ///
    /// The floor is `max(initial, user_min_profit_rate)` — downward
    /// adjustments never breach it.
    fn adjust_min_profit_rate(&mut self, executed_rate: f64) {
        if !self.risk_config.enable_dynamic_profit_rate {
            return;
        }

        self.recent_profit_rates.push(executed_rate);
        let window = self.risk_config.profit_rate_adjust_threshold;
        if self.recent_profit_rates.len() > window {
            let excess = self.recent_profit_rates.len() - window;
            self.recent_profit_rates.drain(..excess);
        }
        if self.recent_profit_rates.len() < window {
            return;
        }
        if self.trade_count - self.last_adjustment_trade_count < window as u64 {
            return;
        }

        let avg: f64 = self.recent_profit_rates.iter().sum::<f64>() / self.recent_profit_rates.len() as f64;
        let current = self.risk_config.min_profit_rate;

        if avg > current * 1.5 {
            let raised = current + self.risk_config.profit_rate_adjust_step;
            self.risk_config.min_profit_rate = raised;
            self.last_adjustment_trade_count = self.trade_count;
            self.recent_profit_rates.clear();
            info!(
                symbol = %self.symbol,
                avg_rate = format!("{:.4}%", avg * 100.0),
                old = format!("{:.4}%", current * 100.0),
                new = format!("{:.4}%", raised * 100.0),
                "realised rates well above requirement — raising minimum"
            );
        } else if current * 1.05 < avg
            && avg < current * 1.1
            && current > self.risk_config.user_min_profit_rate
            && current > self.initial_min_profit_rate
        {
            let floor = self.initial_min_profit_rate.max(self.risk_config.user_min_profit_rate);
            let lowered = (current - self.risk_config.profit_rate_adjust_step).max(floor);
            if lowered < current {
                self.risk_config.min_profit_rate = lowered;
                self.last_adjustment_trade_count = self.trade_count;
                self.recent_profit_rates.clear();
                info!(
                    symbol = %self.symbol,
                    avg_rate = format!("{:.4}%", avg * 100.0),
                    old = format!("{:.4}%", current * 100.0),
                    new = format!("{:.4}%", lowered * 100.0),
                    "realised rates hugging the requirement — lowering minimum"
                );
            }
        }
    }

    /// Lower the minimum after a long dry spell, never below the floor and
    /// at most five times per engine lifetime.
    fn maybe_downshift_min_rate(&mut self) {
        if !self.risk_config.enable_dynamic_profit_rate || self.risk_config.no_trade_reduce_timeout_sec <= 0.0 {
            return;
        }
        let idle = self.last_trade_time.elapsed().as_secs_f64();
        if idle <= self.risk_config.no_trade_reduce_timeout_sec {
            return;
        }
        let current = self.risk_config.min_profit_rate;
        if current <= self.initial_min_profit_rate
            || current <= self.risk_config.user_min_profit_rate
            || self.rate_downshift_count >= MAX_RATE_DOWNSHIFTS
        {
            return;
        }

        let step = self.risk_config.profit_rate_adjust_step * self.risk_config.no_trade_reduce_step_multiplier;
        let floor = self.initial_min_profit_rate.max(self.risk_config.user_min_profit_rate);
        let lowered = (current - step).max(floor);
        if lowered < current {
            self.risk_config.min_profit_rate = lowered;
            self.rate_downshift_count += 1;
            // Reset the clock so consecutive ticks don't stack downshifts.
            self.last_trade_time = Instant::now();
            warn!(
                symbol = %self.symbol,
                idle_sec = idle as u64,
                old = format!("{:.4}%", current * 100.0),
                new = format!("{:.4}%", lowered * 100.0),
                downshifts = self.rate_downshift_count,
                "no fills — lowering minimum profit rate"
            );
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RiskConfig, TradeConfig, VenueRiskLimits};
    use crate::funding_cache::FundingRateCache;
    use crate::market_data::depth_stream::NullStream;
    use crate::market_data::BookLevel;
    use crate::notify::RecordingNotifier;
    use crate::types::Kline;
    use crate::venue::PaperVenue;

    fn wiggle_klines(base: f64) -> Vec<Kline> {
        (0..60)
            .map(|i| {
                let close = base * (1.0 + if i % 2 == 0 { 0.001 } else { -0.001 });
                Kline {
                    open_time: i,
                    open: close,
                    high: close,
                    low: close,
                    close,
                }
            })
            .collect()
    }

    fn flat_klines(price: f64) -> Vec<Kline> {
        (0..60)
            .map(|i| Kline {
                open_time: i,
                open: price,
                high: price,
                low: price,
                close: price,
            })
            .collect()
    }

    fn paper_venue(code: &str, margin: f64, klines: Vec<Kline>) -> Arc<PaperVenue> {
        Arc::new(
            PaperVenue::new(code)
                .with_fees(0.0, 0.0)
                .with_margin(margin)
                .with_mark_price("BTC", 100.0)
                .with_klines("BTC", "1m", klines),
        )
    }

    fn deep_book(pair: &str, bid: f64, ask: f64) -> Arc<OrderBook> {
        Arc::new(OrderBook::new(
            pair,
            vec![BookLevel { price: bid, size: 100.0 }],
            vec![BookLevel { price: ask, size: 100.0 }],
            1,
        ))
    }

    struct Harness {
        engine: RealtimeHedgeEngine,
        notifier: Arc<RecordingNotifier>,
        stop: StopFlag,
    }

    fn harness(v1: Arc<PaperVenue>, v2: Arc<PaperVenue>, risk: RiskConfig) -> Harness {
        let notifier = Arc::new(RecordingNotifier::new());
        let stop = StopFlag::new();
        let aggregator = Arc::new(RiskAggregator::new(
            vec![v1.clone() as VenueRef, v2.clone() as VenueRef],
            VenueRiskLimits::default(),
            Arc::new(FundingRateCache::new()),
        ));
        let engine = RealtimeHedgeEngine::new(
            Arc::new(NullStream),
            Arc::new(NullStream),
            v1 as VenueRef,
            v2 as VenueRef,
            TradeConfig::daemon("BTC"),
            risk,
            SnapshotSlot::new(),
            stop.clone(),
            notifier.clone(),
        )
        .with_aggregator(aggregator);
        Harness {
            engine,
            notifier,
            stop,
        }
    }

    #[tokio::test]
    async fn gate_rejects_stale_order_book() {
        let v1 = paper_venue("paper1", 100_000.0, wiggle_klines(100.0));
        let v2 = paper_venue("paper2", 100_000.0, flat_klines(100.0));
        let mut h = harness(v1, v2, RiskConfig::default());
        h.engine.update_exchange_info().await.unwrap();

        let (cell1, cell2) = h.engine.test_book_cells();
        let mut stale = OrderBook::new(
            "BTCUSDT",
            vec![BookLevel { price: 99.9, size: 100.0 }],
            vec![BookLevel { price: 100.0, size: 100.0 }],
            1,
        );
        stale.timestamp = SystemTime::now() - Duration::from_secs(2);
        cell1.store(Arc::new(stale));
        cell2.store(deep_book("BTCUSDT", 99.9, 100.0));

        let signal = h.engine.compute_signal_daemon(Instant::now()).await.unwrap();
        let reject = h.engine.risk_check(&signal).await.expect("stale book must reject");
        assert!(reject.reason.contains("order-book stale"), "got: {}", reject.reason);
    }

    #[tokio::test]
    async fn gate_rejects_zscore_side_mismatch() {
        let v1 = paper_venue("paper1", 100_000.0, wiggle_klines(100.0));
        let v2 = paper_venue("paper2", 100_000.0, flat_klines(100.0));
        let mut h = harness(v1, v2, RiskConfig::default());
        h.engine.update_exchange_info().await.unwrap();

        let (cell1, cell2) = h.engine.test_book_cells();
        cell1.store(deep_book("BTCUSDT", 99.99, 100.01));
        cell2.store(deep_book("BTCUSDT", 99.99, 100.01));

        // A -3 sigma spread implies side1 = BUY; force SELL instead.
        let info = h.engine.pair_market_info().await;
        let signal = build_signal(
            "BTCUSDT",
            "BTCUSDT",
            (Side::Sell, Side::Buy),
            (100.2, 100.0),
            -0.003,
            &info,
            2.0,
            0.0,
            true,
            Instant::now(),
        );
        assert!(signal.z_score_after_fee <= -2.0);

        let reject = h.engine.risk_check(&signal).await.expect("side mismatch must reject");
        assert!(
            reject.reason.contains("z-score does not support chosen side"),
            "got: {}",
            reject.reason
        );
    }

    #[tokio::test]
    async fn daemon_loop_trades_and_books_profit() {
        let v1 = paper_venue("paper1", 100_000.0, wiggle_klines(100.0));
        let v2 = paper_venue("paper2", 100_000.0, flat_klines(100.0));
        let risk = RiskConfig {
            // Books are injected once; keep them valid for the whole test.
            max_orderbook_age_sec: 300.0,
            ..RiskConfig::default()
        };
        let h = harness(v1.clone(), v2.clone(), risk);
        let (cell1, cell2) = h.engine.test_book_cells();
        let stats = h.engine.stats();
        let stop = h.stop.clone();

        // Venue 1 trades 0.25% under venue 2: z = -2.5 against a 0.1% sigma,
        // so the engine longs venue 1 and shorts venue 2.
        cell1.store(deep_book("BTCUSDT", 99.70, 99.80));
        cell2.store(deep_book("BTCUSDT", 99.95, 100.05));

        let mut engine = h.engine;
        let handle = tokio::spawn(async move {
            engine.run().await.unwrap();
        });

        let deadline = Instant::now() + Duration::from_secs(5);
        while stats.trade_count.load(Ordering::Relaxed) == 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        stop.trigger();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("engine did not stop")
            .unwrap();

        let trades = stats.trade_count.load(Ordering::Relaxed);
        assert!(trades >= 1, "engine never traded");
        assert!(stats.cum_profit() > 0.0);
        assert!(stats.cum_volume() > 0.0);

        // The hedge is balanced: long venue 1, short venue 2, equal size.
        let p1 = v1.position_amount("BTCUSDT");
        let p2 = v2.position_amount("BTCUSDT");
        assert!(p1 > 0.0);
        assert!(p2 < 0.0);
        assert!((p1 + p2).abs() < 1e-9);
        assert!(h.notifier.contains("trade #1"));
    }

    #[tokio::test]
    async fn never_opens_when_adding_is_forbidden() {
        // Margins below the $100 floor: can_add_position is false everywhere.
        let v1 = paper_venue("paper1", 50.0, wiggle_klines(100.0));
        let v2 = paper_venue("paper2", 50.0, flat_klines(100.0));
        let risk = RiskConfig {
            max_orderbook_age_sec: 300.0,
            ..RiskConfig::default()
        };
        let h = harness(v1.clone(), v2.clone(), risk);
        let (cell1, cell2) = h.engine.test_book_cells();
        let stats = h.engine.stats();
        let stop = h.stop.clone();

        cell1.store(deep_book("BTCUSDT", 99.70, 99.80));
        cell2.store(deep_book("BTCUSDT", 99.95, 100.05));

        let mut engine = h.engine;
        let handle = tokio::spawn(async move {
            engine.run().await.unwrap();
        });
        tokio::time::sleep(Duration::from_millis(500)).await;
        stop.trigger();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("engine did not stop")
            .unwrap();

        assert_eq!(stats.trade_count.load(Ordering::Relaxed), 0);
        assert_eq!(v1.position_amount("BTCUSDT"), 0.0);
        assert_eq!(v2.position_amount("BTCUSDT"), 0.0);
    }

    #[tokio::test]
    async fn adaptive_rate_raises_on_rich_fills_and_floors_on_lowering() {
        let v1 = paper_venue("paper1", 100_000.0, wiggle_klines(100.0));
        let v2 = paper_venue("paper2", 100_000.0, flat_klines(100.0));
        let mut h = harness(v1, v2, RiskConfig::default());
        let initial = h.engine.risk_config.min_profit_rate;
        let user_floor = h.engine.risk_config.user_min_profit_rate;
        let step = h.engine.risk_config.profit_rate_adjust_step;

        // Three fills far above the requirement raise it one step.
        h.engine.trade_count = 3;
        for _ in 0..3 {
            h.engine.adjust_min_profit_rate(0.002);
        }
        assert!((h.engine.min_profit_rate() - (initial + step)).abs() < 1e-12);
        assert!(h.engine.recent_profit_rates.is_empty());

        // Rates hugging the requirement lower it, but never below
        // max(initial, user floor).
        h.engine.risk_config.min_profit_rate = 0.00115;
        h.engine.trade_count = 9;
        h.engine.last_adjustment_trade_count = 3;
        for _ in 0..3 {
            h.engine.adjust_min_profit_rate(0.00123);
        }
        assert!(h.engine.min_profit_rate() < 0.00115);
        assert!(h.engine.min_profit_rate() >= initial.max(user_floor));
    }

    #[tokio::test]
    async fn no_trade_downshift_respects_floor_and_budget() {
        let v1 = paper_venue("paper1", 100_000.0, wiggle_klines(100.0));
        let v2 = paper_venue("paper2", 100_000.0, flat_klines(100.0));
        let risk = RiskConfig {
            no_trade_reduce_timeout_sec: 0.01,
            ..RiskConfig::default()
        };
        let mut h = harness(v1, v2, risk);
        let initial = h.engine.initial_min_profit_rate;
        let user_floor = h.engine.risk_config.user_min_profit_rate;

        // Simulate an earlier upward adjustment.
        h.engine.risk_config.min_profit_rate = 0.0012;

        for _ in 0..8 {
            tokio::time::sleep(Duration::from_millis(15)).await;
            h.engine.maybe_downshift_min_rate();
        }

        assert!(h.engine.min_profit_rate() >= initial.max(user_floor));
        assert!(h.engine.rate_downshift_count <= MAX_RATE_DOWNSHIFTS);
        // It actually moved down from the raised level.
        assert!(h.engine.min_profit_rate() < 0.0012);
    }
}
