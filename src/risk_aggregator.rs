// =============================================================================
// Risk aggregator — periodic multi-venue balance / position / funding sweep
// =============================================================================
//
// Every tick: fetch each venue's margin and positions in parallel, attach
// current funding rates, fold same-symbol positions into the hedged view and
// (optionally) run the opportunity scan over every venue pair.
//
// Failure policy: a single venue failing is logged and omitted; the snapshot
// is still emitted while at least one venue remains.  Zero surviving venues
// is an error — the supervisor decides whether that is fatal.
// =============================================================================

use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use futures_util::future::join_all;
use tracing::{error, info, warn};

use crate::chance_searcher::{ChanceSearcher, FundingOpportunity, SearchConfig};
use crate::config::VenueRiskLimits;
use crate::exchange_info::{CombinedSnapshot, VenueAccountInfo};
use crate::funding_cache::FundingRateCache;
use crate::venue::VenueRef;

/// How many ranked opportunities a snapshot carries.
const OPPORTUNITY_LIMIT: usize = 5;

pub struct RiskAggregator {
    venues: Vec<VenueRef>,
    limits: VenueRiskLimits,
    funding_cache: Arc<FundingRateCache>,
    search_config: SearchConfig,
}

impl RiskAggregator {
    pub fn new(venues: Vec<VenueRef>, limits: VenueRiskLimits, funding_cache: Arc<FundingRateCache>) -> Self {
        Self {
            venues,
            limits,
            funding_cache,
            search_config: SearchConfig::default(),
        }
    }

    pub fn with_search_config(mut self, config: SearchConfig) -> Self {
        self.search_config = config;
        self
    }

    pub fn venues(&self) -> &[VenueRef] {
        &self.venues
    }

    /// One venue's account state, with funding rates attached per position.
    async fn fetch_venue_info(&self, venue: &VenueRef) -> Result<VenueAccountInfo> {
        let start = Instant::now();
        let code = venue.exchange_code().to_string();

        let (total_margin, available_margin, mmr, positions) = tokio::join!(
            venue.get_total_margin(),
            venue.get_available_margin(),
            venue.get_cross_margin_ratio(),
            venue.get_all_cur_positions(),
        );

        let total_margin = total_margin.with_context(|| format!("{code}: total margin fetch failed"))?;
        let available_margin = available_margin.with_context(|| format!("{code}: available margin fetch failed"))?;
        let maintenance_margin_ratio = mmr.with_context(|| format!("{code}: margin ratio fetch failed"))?;
        let mut positions = positions.with_context(|| format!("{code}: position fetch failed"))?;

        for pos in &mut positions {
            match venue.get_funding_rate(&pos.pair).await {
                Ok(rate) => pos.funding_rate = Some(rate),
                Err(e) => warn!(venue = %code, pair = %pos.pair, error = %e, "funding rate fetch failed"),
            }
        }

        Ok(VenueAccountInfo {
            exchange_code: code,
            taker_fee_rate: venue.taker_fee_rate(),
            maker_fee_rate: venue.maker_fee_rate(),
            limits: self.limits,
            total_margin,
            available_margin,
            maintenance_margin_ratio,
            positions,
            time_cost_sec: start.elapsed().as_secs_f64(),
        })
    }

    /// Build one combined snapshot.
    pub async fn snapshot(&self, find_opportunities: bool) -> Result<CombinedSnapshot> {
        let start = Instant::now();

        let results = join_all(self.venues.iter().map(|venue| self.fetch_venue_info(venue))).await;

        let mut infos = Vec::with_capacity(results.len());
        for (venue, result) in self.venues.iter().zip(results) {
            match result {
                Ok(info) => infos.push(info),
                Err(e) => error!(venue = %venue.exchange_code(), error = %e, "venue snapshot failed — omitting"),
            }
        }

        if infos.is_empty() {
            bail!("every venue failed — snapshot is empty");
        }

        let opportunities = if find_opportunities && self.venues.len() >= 2 {
            self.search_all_pairs().await
        } else {
            Vec::new()
        };

        let snapshot = CombinedSnapshot::build(infos, opportunities, start.elapsed().as_secs_f64());
        info!(
            venues = snapshot.exchange_infos.len(),
            merged_positions = snapshot.merged_positions.len(),
            opportunities = snapshot.funding_opportunities.len(),
            time_cost_sec = format!("{:.2}", snapshot.time_cost_sec),
            "combined snapshot built"
        );
        Ok(snapshot)
    }

    /// Opportunity scan over every venue pair, ranked and truncated.
    async fn search_all_pairs(&self) -> Vec<FundingOpportunity> {
        let mut all = Vec::new();
        for i in 0..self.venues.len() {
            for j in (i + 1)..self.venues.len() {
                let searcher = ChanceSearcher::new(
                    self.venues[i].clone(),
                    self.venues[j].clone(),
                    self.funding_cache.clone(),
                    self.search_config.clone(),
                );
                match searcher.search_opportunities().await {
                    Ok(mut found) => all.append(&mut found),
                    Err(e) => warn!(
                        venue1 = %self.venues[i].exchange_code(),
                        venue2 = %self.venues[j].exchange_code(),
                        error = %e,
                        "opportunity scan failed"
                    ),
                }
            }
        }
        all.sort_by(|a, b| {
            b.funding_profit_rate
                .partial_cmp(&a.funding_profit_rate)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        all.truncate(OPPORTUNITY_LIMIT);
        all
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::venue::PaperVenue;

    fn venue_with_position(code: &str, amount: f64) -> Arc<PaperVenue> {
        Arc::new(
            PaperVenue::new(code)
                .with_margin(10_000.0)
                .with_mark_price("BTC", 100.0)
                .with_funding_rate("BTC", 0.12)
                .with_position("BTCUSDT", amount, 100.0),
        )
    }

    #[tokio::test]
    async fn snapshot_merges_positions_and_attaches_funding() {
        let v1 = venue_with_position("paper1", 0.5);
        let v2 = venue_with_position("paper2", -0.5);
        let agg = RiskAggregator::new(
            vec![v1 as VenueRef, v2 as VenueRef],
            VenueRiskLimits::default(),
            Arc::new(FundingRateCache::new()),
        );

        let snapshot = agg.snapshot(false).await.unwrap();
        assert_eq!(snapshot.exchange_infos.len(), 2);
        assert_eq!(snapshot.merged_positions.len(), 1);

        let merged = &snapshot.merged_positions[0];
        assert_eq!(merged.symbol, "BTC");
        assert!(merged.total_amount.abs() < 1e-12);

        // Funding rates were attached: long pays 12%, short earns 12%.
        let info = snapshot.venue_info("paper1").unwrap();
        assert_eq!(info.positions[0].funding_rate, Some(0.12));
        assert!(merged.funding_profit_rate_apy.abs() < 1e-12);
    }

    #[tokio::test]
    async fn single_venue_failure_is_omitted_not_fatal() {
        let v1 = venue_with_position("paper1", 0.5);
        let v2 = venue_with_position("paper2", -0.5);
        v2.set_fail_account(true);

        let agg = RiskAggregator::new(
            vec![v1 as VenueRef, v2 as VenueRef],
            VenueRiskLimits::default(),
            Arc::new(FundingRateCache::new()),
        );
        let snapshot = agg.snapshot(false).await.unwrap();
        assert_eq!(snapshot.exchange_infos.len(), 1);
        assert_eq!(snapshot.exchange_infos[0].exchange_code, "paper1");
    }

    #[tokio::test]
    async fn all_venues_failing_is_an_error() {
        let v1 = venue_with_position("paper1", 0.5);
        v1.set_fail_account(true);

        let agg = RiskAggregator::new(
            vec![v1 as VenueRef],
            VenueRiskLimits::default(),
            Arc::new(FundingRateCache::new()),
        );
        assert!(agg.snapshot(false).await.is_err());
    }
}
