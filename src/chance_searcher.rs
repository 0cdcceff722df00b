// =============================================================================
// Chance searcher — funding-rate differential scan across one venue pair
// =============================================================================
//
// Walks the common-symbol set of two venues, reads cached funding rates,
// keeps the pairs whose annualised differential clears the threshold and
// optionally attaches historical spread statistics.  Opportunity
// construction is bounded to a few in flight so the K-line fetches stay
// under venue rate limits.
// =============================================================================

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Result;
use futures_util::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::funding_cache::FundingRateCache;
use crate::spread_analyzer::{SpreadAnalyzer, SpreadStatistics};
use crate::types::{base_symbol, Side};
use crate::venue::VenueRef;

/// Funding periods per year (8-hour schedule).
const PERIODS_PER_YEAR: f64 = 3.0 * 365.0;

/// Validity floor: 8% APY profit after splitting the differential.
pub const MIN_FUNDING_PROFIT_RATE: f64 = 0.08;

/// One ranked funding-arbitrage candidate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FundingOpportunity {
    /// Base symbol (no quote suffix).
    pub pair: String,
    pub exchange1: String,
    pub exchange2: String,
    /// Annualised funding rates.
    pub funding_rate1: f64,
    pub funding_rate2: f64,
    pub funding_diff_abs: f64,
    /// Harvestable rate: half the differential.
    pub funding_profit_rate: f64,
    pub position_side1: Side,
    pub position_side2: Side,
    pub spread_stats: Option<SpreadStatistics>,
    /// Historical mean spread signed in the direction of the trade.
    pub mean_spread_profit_rate: f64,
    pub price1: f64,
    pub price2: f64,
}

impl FundingOpportunity {
    /// Whether the candidate clears the validity floor.
    pub fn is_funding_opportunity(&self) -> bool {
        self.funding_profit_rate >= MIN_FUNDING_PROFIT_RATE
    }

    /// Live price gap relative to the pair average.
    pub fn cur_price_diff_pct(&self) -> f64 {
        if self.price1 > 0.0 && self.price2 > 0.0 {
            (self.price1 - self.price2) / ((self.price1 + self.price2) / 2.0)
        } else {
            0.0
        }
    }

    /// Funding harvest plus mean-reversion potential.
    pub fn combined_profit_potential(&self) -> f64 {
        match &self.spread_stats {
            Some(stats) => self.funding_profit_rate + stats.mean_spread.abs(),
            None => self.funding_profit_rate,
        }
    }
}

/// Search parameters.
#[derive(Debug, Clone)]
pub struct SearchConfig {
    /// Minimum annualised funding differential.
    pub min_funding_diff: f64,
    pub max_opportunities: usize,
    pub include_spread_analysis: bool,
    pub spread_analysis_interval: String,
    pub spread_analysis_limit: usize,
    /// When set, restricts the scan and skips the differential floor.
    pub whitelist: Option<Vec<String>>,
    pub min_mean_spread_profit_rate: f64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            min_funding_diff: MIN_FUNDING_PROFIT_RATE,
            max_opportunities: 50,
            include_spread_analysis: true,
            spread_analysis_interval: "1m".to_string(),
            spread_analysis_limit: 1000,
            whitelist: None,
            min_mean_spread_profit_rate: 0.0005,
        }
    }
}

/// Opportunity scanner bound to one venue pair.
pub struct ChanceSearcher {
    venue1: VenueRef,
    venue2: VenueRef,
    funding_cache: Arc<FundingRateCache>,
    analyzer: SpreadAnalyzer,
    config: SearchConfig,
}

impl ChanceSearcher {
    pub fn new(
        venue1: VenueRef,
        venue2: VenueRef,
        funding_cache: Arc<FundingRateCache>,
        config: SearchConfig,
    ) -> Self {
        let analyzer = SpreadAnalyzer::new(venue1.clone(), venue2.clone());
        Self {
            venue1,
            venue2,
            funding_cache,
            analyzer,
            config,
        }
    }

    /// Symbols listed on both venues (base form).
    async fn common_symbols(&self) -> Result<HashSet<String>> {
        let (ticks1, ticks2) = tokio::join!(self.venue1.get_all_tick_price(), self.venue2.get_all_tick_price());
        let ticks1 = ticks1?;
        let ticks2 = ticks2?;

        let names1: HashSet<String> = ticks1.iter().map(|t| base_symbol(&t.name)).collect();
        let names2: HashSet<String> = ticks2.iter().map(|t| base_symbol(&t.name)).collect();
        let common: HashSet<String> = names1.intersection(&names2).cloned().collect();

        info!(
            venue1 = %self.venue1.exchange_code(),
            venue2 = %self.venue2.exchange_code(),
            common = common.len(),
            "common symbol set resolved"
        );
        Ok(common)
    }

    /// Annualised funding differentials for every common symbol with cached
    /// rates on both sides.
    fn funding_rate_diffs(&self, symbols: &HashSet<String>) -> Vec<(String, f64)> {
        let code1 = self.venue1.exchange_code().to_string();
        let code2 = self.venue2.exchange_code().to_string();

        let mut diffs = Vec::new();
        for symbol in symbols {
            let rate1 = self.funding_cache.get(&code1, symbol);
            let rate2 = self.funding_cache.get(&code2, symbol);
            if let (Some(r1), Some(r2)) = (rate1, rate2) {
                let diff = ((r1 - r2) * PERIODS_PER_YEAR).abs();
                diffs.push((symbol.clone(), diff));
            }
        }
        diffs
    }

    async fn create_opportunity(&self, symbol: String, funding_diff: f64) -> Option<FundingOpportunity> {
        let code1 = self.venue1.exchange_code().to_string();
        let code2 = self.venue2.exchange_code().to_string();

        let rate1 = self.funding_cache.get(&code1, &symbol)? * PERIODS_PER_YEAR;
        let rate2 = self.funding_cache.get(&code2, &symbol)? * PERIODS_PER_YEAR;

        // The richer funding side is shorted; the other leg hedges it.
        let (position_side1, position_side2) = if rate1 > rate2 {
            (Side::Sell, Side::Buy)
        } else {
            (Side::Buy, Side::Sell)
        };

        let (price1, price2) = match tokio::join!(
            self.venue1.get_tick_price(&symbol),
            self.venue2.get_tick_price(&symbol)
        ) {
            (Ok(p1), Ok(p2)) => (p1, p2),
            (r1, r2) => {
                warn!(symbol = %symbol, ok1 = r1.is_ok(), ok2 = r2.is_ok(), "tick price fetch failed");
                (0.0, 0.0)
            }
        };

        let mut opportunity = FundingOpportunity {
            pair: symbol.clone(),
            exchange1: code1,
            exchange2: code2,
            funding_rate1: rate1,
            funding_rate2: rate2,
            funding_diff_abs: funding_diff,
            funding_profit_rate: funding_diff / 2.0,
            position_side1,
            position_side2,
            spread_stats: None,
            mean_spread_profit_rate: 0.0,
            price1,
            price2,
        };

        if self.config.include_spread_analysis && price1 > 0.0 && price2 > 0.0 {
            match self
                .analyzer
                .analyze_spread(
                    &symbol,
                    &self.config.spread_analysis_interval,
                    self.config.spread_analysis_limit,
                )
                .await
            {
                Ok(stats) => {
                    // Entering the trade earns the mean spread when shorting
                    // the rich side, pays it otherwise.
                    opportunity.mean_spread_profit_rate = if rate1 > rate2 {
                        stats.mean_spread
                    } else {
                        -stats.mean_spread
                    };
                    opportunity.spread_stats = Some(stats);
                }
                Err(e) => warn!(symbol = %symbol, error = %e, "spread analysis failed"),
            }
        }

        Some(opportunity)
    }

    /// Run the full scan, ranked by funding profit rate descending.
    pub async fn search_opportunities(&self) -> Result<Vec<FundingOpportunity>> {
        let mut symbols = self.common_symbols().await?;
        if let Some(whitelist) = &self.config.whitelist {
            symbols.retain(|s| whitelist.contains(s));
        }
        if symbols.is_empty() {
            warn!("no common symbols to scan");
            return Ok(Vec::new());
        }

        let mut qualified = self.funding_rate_diffs(&symbols);
        qualified.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        if self.config.whitelist.is_none() {
            qualified.retain(|(_, diff)| *diff >= self.config.min_funding_diff);
            qualified.truncate(self.config.max_opportunities);
        }
        if qualified.is_empty() {
            info!(
                min_diff = self.config.min_funding_diff,
                "no symbol clears the funding differential floor"
            );
            return Ok(Vec::new());
        }

        // Bounded fan-out: at most 3 opportunity builds in flight.
        let mut opportunities: Vec<FundingOpportunity> = stream::iter(qualified)
            .map(|(symbol, diff)| self.create_opportunity(symbol, diff))
            .buffer_unordered(3)
            .filter_map(|opp| async move { opp })
            .collect()
            .await;

        opportunities.sort_by(|a, b| {
            (b.funding_profit_rate, b.combined_profit_potential())
                .partial_cmp(&(a.funding_profit_rate, a.combined_profit_potential()))
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        // The mean-spread floor only means something when analysis ran.
        if self.config.whitelist.is_none() && self.config.include_spread_analysis {
            opportunities.retain(|o| o.mean_spread_profit_rate >= self.config.min_mean_spread_profit_rate);
        }

        info!(
            venue1 = %self.venue1.exchange_code(),
            venue2 = %self.venue2.exchange_code(),
            found = opportunities.len(),
            "funding opportunity scan complete"
        );
        Ok(opportunities)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::venue::PaperVenue;

    fn cache_with(rates: &[(&str, &str, f64)]) -> Arc<FundingRateCache> {
        let cache = Arc::new(FundingRateCache::new());
        let mut map = std::collections::HashMap::new();
        for (venue, symbol, rate) in rates {
            map.entry(venue.to_string())
                .or_insert_with(std::collections::HashMap::new)
                .insert(symbol.to_string(), *rate);
        }
        cache.install(map);
        cache
    }

    fn searcher(cache: Arc<FundingRateCache>, config: SearchConfig) -> ChanceSearcher {
        let v1 = Arc::new(
            PaperVenue::new("paper1")
                .with_mark_price("BTC", 100.0)
                .with_mark_price("ETH", 2000.0),
        );
        let v2 = Arc::new(
            PaperVenue::new("paper2")
                .with_mark_price("BTC", 100.5)
                .with_mark_price("ETH", 2001.0),
        );
        ChanceSearcher::new(v1, v2, cache, config)
    }

    #[tokio::test]
    async fn finds_pairs_above_the_differential_floor() {
        // BTC: 0.0002 vs -0.0001 per period -> APY diff ~0.3285.
        // ETH: identical rates -> no differential.
        let cache = cache_with(&[
            ("paper1", "BTC", 0.0002),
            ("paper2", "BTC", -0.0001),
            ("paper1", "ETH", 0.0001),
            ("paper2", "ETH", 0.0001),
        ]);
        let config = SearchConfig {
            include_spread_analysis: false,
            ..SearchConfig::default()
        };
        let found = searcher(cache, config).search_opportunities().await.unwrap();

        assert_eq!(found.len(), 1);
        let opp = &found[0];
        assert_eq!(opp.pair, "BTC");
        // Venue 1 pays more: short it, long venue 2.
        assert_eq!(opp.position_side1, Side::Sell);
        assert_eq!(opp.position_side2, Side::Buy);
        assert!((opp.funding_diff_abs - 0.0003 * 1095.0).abs() < 1e-9);
        assert!((opp.funding_profit_rate - opp.funding_diff_abs / 2.0).abs() < 1e-12);
        assert!(opp.is_funding_opportunity());
        assert!((opp.price1 - 100.0).abs() < 1e-9);
        assert!((opp.price2 - 100.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn whitelist_bypasses_the_floor_and_filters_symbols() {
        let cache = cache_with(&[
            ("paper1", "BTC", 0.00011),
            ("paper2", "BTC", 0.0001),
            ("paper1", "ETH", 0.01),
            ("paper2", "ETH", -0.01),
        ]);
        let config = SearchConfig {
            include_spread_analysis: false,
            whitelist: Some(vec!["BTC".to_string()]),
            ..SearchConfig::default()
        };
        let found = searcher(cache, config).search_opportunities().await.unwrap();
        // ETH's huge differential is excluded; BTC's tiny one survives.
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].pair, "BTC");
        assert!(!found[0].is_funding_opportunity());
    }

    #[tokio::test]
    async fn missing_cache_entries_are_skipped() {
        let cache = cache_with(&[("paper1", "BTC", 0.0005)]);
        let config = SearchConfig {
            include_spread_analysis: false,
            ..SearchConfig::default()
        };
        let found = searcher(cache, config).search_opportunities().await.unwrap();
        assert!(found.is_empty());
    }

    #[test]
    fn price_diff_uses_the_pair_average() {
        let opp = FundingOpportunity {
            pair: "BTC".into(),
            exchange1: "paper1".into(),
            exchange2: "paper2".into(),
            funding_rate1: 0.2,
            funding_rate2: 0.0,
            funding_diff_abs: 0.2,
            funding_profit_rate: 0.1,
            position_side1: Side::Sell,
            position_side2: Side::Buy,
            spread_stats: None,
            mean_spread_profit_rate: 0.0,
            price1: 101.0,
            price2: 99.0,
        };
        assert!((opp.cur_price_diff_pct() - 2.0 / 100.0).abs() < 1e-12);
    }
}
