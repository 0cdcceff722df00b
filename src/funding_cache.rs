// =============================================================================
// Funding-Rate Cache — shared (venue, symbol) → single-period rate map
// =============================================================================
//
// TTL 30 minutes.  Reads never block on the network: a stale read spawns a
// background refresh and returns whatever is currently held.  Concurrent
// refreshes are deduplicated by a single in-progress flag.
//
// Rates are stored in single-period (8 h) form.  APY scaling happens at the
// consumer (×3×365); venues with 1 h or 4 h funding schedules must already
// have been normalised by their adapters.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use parking_lot::RwLock;
use tracing::{error, info, warn};

use crate::types::base_symbol;

/// Default refresh interval.
const CACHE_TTL: Duration = Duration::from_secs(30 * 60);

/// Primary aggregator: per-venue funding rates across many venues.
const PRIMARY_URL: &str = "https://mainnet.zklighter.elliot.ai/api/v1/funding-rates";
/// Comparison aggregator: 8 h-period rates for aster/binance/bybit/okx.
const COMPARISON_URL: &str =
    "https://www.asterdex.com/bapi/future/v1/public/future/aster/marketing/funding-rate-comparison";

type RateMap = HashMap<String, HashMap<String, f64>>;

#[derive(Default)]
struct CacheState {
    /// venue (lowercase) → base symbol (uppercase) → single-period rate.
    rates: RateMap,
    last_update: Option<Instant>,
}

struct CacheInner {
    client: reqwest::Client,
    primary_url: String,
    comparison_url: String,
    ttl: Duration,
    state: RwLock<CacheState>,
    refreshing: AtomicBool,
}

/// Process-wide funding-rate cache, owned by the supervisor and shared by
/// address with every consumer.
#[derive(Clone)]
pub struct FundingRateCache {
    inner: Arc<CacheInner>,
}

impl FundingRateCache {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(CacheInner {
                client: reqwest::Client::builder()
                    .timeout(Duration::from_secs(10))
                    .build()
                    .expect("failed to build reqwest client for FundingRateCache"),
                primary_url: PRIMARY_URL.to_string(),
                comparison_url: COMPARISON_URL.to_string(),
                ttl: CACHE_TTL,
                state: RwLock::new(CacheState::default()),
                refreshing: AtomicBool::new(false),
            }),
        }
    }

    /// Cached single-period rate for (venue, symbol), `None` when unknown.
    ///
    /// A stale or empty cache triggers a non-blocking background refresh;
    /// the caller always receives the previously held value.
    pub fn get(&self, venue: &str, symbol: &str) -> Option<f64> {
        if self.should_refresh() {
            self.spawn_refresh();
        }

        let state = self.inner.state.read();
        state
            .rates
            .get(&venue.to_lowercase())
            .and_then(|per_venue| per_venue.get(&base_symbol(symbol)))
            .copied()
    }

    fn should_refresh(&self) -> bool {
        let state = self.inner.state.read();
        match state.last_update {
            Some(at) => at.elapsed() >= self.inner.ttl,
            None => true,
        }
    }

    fn spawn_refresh(&self) {
        if self.inner.refreshing.swap(true, Ordering::SeqCst) {
            return;
        }
        let inner = self.inner.clone();
        tokio::spawn(async move {
            inner.refresh_once().await;
            inner.refreshing.store(false, Ordering::SeqCst);
        });
    }

    /// Blocking refresh, for callers that need rates before proceeding.
    pub async fn force_update(&self) {
        if self.inner.refreshing.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.refresh_once().await;
        self.inner.refreshing.store(false, Ordering::SeqCst);
    }

    /// Age of the current map and a coarse size summary, for diagnostics.
    pub fn cache_info(&self) -> (Option<Duration>, usize, usize) {
        let state = self.inner.state.read();
        let age = state.last_update.map(|at| at.elapsed());
        let venues = state.rates.len();
        let pairs = state.rates.values().map(HashMap::len).sum();
        (age, venues, pairs)
    }

    #[cfg(test)]
    pub(crate) fn install(&self, rates: RateMap) {
        let mut state = self.inner.state.write();
        state.rates = rates;
        state.last_update = Some(Instant::now());
    }
}

impl Default for FundingRateCache {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheInner {
    async fn refresh_once(&self) {
        let mut fresh: RateMap = HashMap::new();

        match self.fetch_json(&self.primary_url).await {
            Ok(body) => apply_primary_rates(&mut fresh, &body),
            Err(e) => warn!(error = %e, "funding cache: primary source failed"),
        }

        match self.fetch_json(&self.comparison_url).await {
            Ok(body) => apply_comparison_rates(&mut fresh, &body),
            Err(e) => warn!(error = %e, "funding cache: comparison source failed"),
        }

        if fresh.is_empty() {
            // Total failure: keep whatever we had rather than wiping it.
            error!("funding cache refresh produced no data — retaining previous map");
            return;
        }

        let venues = fresh.len();
        let pairs: usize = fresh.values().map(HashMap::len).sum();
        let mut state = self.state.write();
        state.rates = fresh;
        state.last_update = Some(Instant::now());
        info!(venues, pairs, "funding-rate cache refreshed");
    }

    async fn fetch_json(&self, url: &str) -> Result<serde_json::Value> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("GET {url} failed"))?;
        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .with_context(|| format!("failed to parse response from {url}"))?;
        if !status.is_success() {
            anyhow::bail!("{url} returned {status}: {body}");
        }
        Ok(body)
    }
}

// -----------------------------------------------------------------------------
// Source parsers
// -----------------------------------------------------------------------------

/// Primary payload: `{"funding_rates": [{"exchange", "symbol", "rate"}, ...]}`.
fn apply_primary_rates(map: &mut RateMap, body: &serde_json::Value) {
    let Some(entries) = body["funding_rates"].as_array() else {
        warn!("funding cache: primary payload missing funding_rates array");
        return;
    };
    for item in entries {
        let Some(exchange) = item["exchange"].as_str() else { continue };
        let Some(symbol) = item["symbol"].as_str() else { continue };
        let rate = number_or_string(&item["rate"]).unwrap_or(0.0);
        map.entry(exchange.to_lowercase())
            .or_default()
            .insert(symbol.to_uppercase(), rate);
    }
}

/// Comparison payload: `{"data": {"details": [{"period": "8h", "pair", ...}]}}`.
///
/// Only 8 h-period rows are accepted; other schedules are the adapter's
/// problem, not the cache's.
fn apply_comparison_rates(map: &mut RateMap, body: &serde_json::Value) {
    let Some(details) = body["data"]["details"].as_array() else {
        warn!("funding cache: comparison payload missing data.details array");
        return;
    };
    for item in details {
        if item["period"].as_str() != Some("8h") {
            continue;
        }
        let Some(pair) = item["pair"].as_str() else { continue };
        let symbol = base_symbol(pair);

        for (venue, field) in [
            ("aster", "asterFundingRate"),
            ("binance", "bnFundingRate"),
            ("bybit", "bybitFundingRate"),
            ("okx", "okxFundingRate"),
        ] {
            if let Some(rate) = number_or_string(&item[field]) {
                map.entry(venue.to_string()).or_default().insert(symbol.clone(), rate);
            }
        }
    }
}

fn number_or_string(val: &serde_json::Value) -> Option<f64> {
    if let Some(n) = val.as_f64() {
        Some(n)
    } else {
        val.as_str().and_then(|s| s.parse().ok())
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primary_parser_fills_per_venue_maps() {
        let body = serde_json::json!({
            "funding_rates": [
                {"exchange": "lighter", "symbol": "BTC", "rate": 0.0001},
                {"exchange": "hyperliquid", "symbol": "eth", "rate": "-0.0002"}
            ]
        });
        let mut map = RateMap::new();
        apply_primary_rates(&mut map, &body);
        assert_eq!(map["lighter"]["BTC"], 0.0001);
        assert_eq!(map["hyperliquid"]["ETH"], -0.0002);
    }

    #[test]
    fn comparison_parser_filters_to_8h_and_strips_quote() {
        let body = serde_json::json!({
            "data": {"details": [
                {"period": "8h", "pair": "BTCUSDT",
                 "asterFundingRate": "0.0003", "bnFundingRate": 0.0001,
                 "bybitFundingRate": null, "okxFundingRate": "0.0002"},
                {"period": "4h", "pair": "ETHUSDT", "bnFundingRate": 0.5}
            ]}
        });
        let mut map = RateMap::new();
        apply_comparison_rates(&mut map, &body);
        assert_eq!(map["aster"]["BTC"], 0.0003);
        assert_eq!(map["binance"]["BTC"], 0.0001);
        assert_eq!(map["okx"]["BTC"], 0.0002);
        assert!(!map.contains_key("bybit"));
        // 4h rows are ignored outright.
        assert!(map.get("binance").map(|m| !m.contains_key("ETH")).unwrap_or(true));
    }

    #[test]
    fn one_source_failing_does_not_wipe_the_other() {
        let mut map = RateMap::new();
        apply_primary_rates(
            &mut map,
            &serde_json::json!({"funding_rates": [{"exchange": "lighter", "symbol": "BTC", "rate": 0.0001}]}),
        );
        // Comparison source returned garbage.
        apply_comparison_rates(&mut map, &serde_json::json!({"error": "down"}));
        assert_eq!(map["lighter"]["BTC"], 0.0001);
    }

    #[tokio::test]
    async fn get_reads_installed_rates_without_network() {
        let cache = Arc::new(FundingRateCache::new());
        let mut rates = RateMap::new();
        rates.entry("binance".into()).or_default().insert("BTC".into(), 0.0001);
        cache.install(rates);

        assert_eq!(cache.get("BINANCE", "BTCUSDT"), Some(0.0001));
        assert_eq!(cache.get("binance", "BTC"), Some(0.0001));
        assert_eq!(cache.get("bybit", "BTC"), None);
    }
}
