// =============================================================================
// Hedge-spread analyzer — historical cross-venue spread statistics
// =============================================================================
//
// Pulls K-lines from two venues in parallel, aligns them on open-time
// intersection and computes the distribution of (close1 - close2) / close2.
// The whole analysis is rejected when fewer than 50 aligned samples remain;
// thin overlap produces meaningless standard deviations.
// =============================================================================

use std::collections::BTreeSet;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;
use tracing::warn;

use crate::types::Kline;
use crate::venue::VenueRef;

/// Minimum aligned samples for a valid analysis.
pub const MIN_ALIGNED_SAMPLES: usize = 50;

/// Distribution summary of a cross-venue spread series.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpreadStatistics {
    pub mean_spread: f64,
    /// Sample standard deviation (n - 1).
    pub std_spread: f64,
    pub min_spread: f64,
    pub max_spread: f64,
    pub median_spread: f64,
    pub percentile_25: f64,
    pub percentile_75: f64,
    pub sample_count: usize,
    /// 95% CI: mean ± 1.96 · std / sqrt(n).
    pub confidence_interval_95: (f64, f64),
}

impl std::fmt::Display for SpreadStatistics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "n={} mean={:.4}% std={:.4}% range=[{:.4}%, {:.4}%] ci95=[{:.4}%, {:.4}%]",
            self.sample_count,
            self.mean_spread * 100.0,
            self.std_spread * 100.0,
            self.min_spread * 100.0,
            self.max_spread * 100.0,
            self.confidence_interval_95.0 * 100.0,
            self.confidence_interval_95.1 * 100.0,
        )
    }
}

/// Analyzer bound to one venue pair.
pub struct SpreadAnalyzer {
    venue1: VenueRef,
    venue2: VenueRef,
    pair_label: String,
}

impl SpreadAnalyzer {
    pub fn new(venue1: VenueRef, venue2: VenueRef) -> Self {
        let pair_label = format!("{}-{}", venue1.exchange_code(), venue2.exchange_code());
        Self {
            venue1,
            venue2,
            pair_label,
        }
    }

    /// Full pipeline: fetch, align, compute.
    pub async fn analyze_spread(&self, symbol: &str, interval: &str, limit: usize) -> Result<SpreadStatistics> {
        let (klines1, klines2) = self.aligned_klines(symbol, interval, limit).await?;

        if klines1.len() < MIN_ALIGNED_SAMPLES {
            bail!(
                "{} {symbol}: too few samples after alignment ({} < {MIN_ALIGNED_SAMPLES})",
                self.pair_label,
                klines1.len()
            );
        }

        let spreads = price_spreads(&klines1, &klines2);
        if spreads.len() < MIN_ALIGNED_SAMPLES {
            bail!(
                "{} {symbol}: too few valid spreads ({} < {MIN_ALIGNED_SAMPLES})",
                self.pair_label,
                spreads.len()
            );
        }

        spread_statistics(&spreads)
    }

    /// Fetch both K-line series in parallel and keep the open-time
    /// intersection, sorted ascending.
    async fn aligned_klines(&self, symbol: &str, interval: &str, limit: usize) -> Result<(Vec<Kline>, Vec<Kline>)> {
        let (res1, res2) = tokio::join!(
            self.venue1.get_klines(symbol, interval, limit),
            self.venue2.get_klines(symbol, interval, limit),
        );
        let mut klines1 = res1.with_context(|| format!("{}: klines fetch failed", self.venue1.exchange_code()))?;
        let mut klines2 = res2.with_context(|| format!("{}: klines fetch failed", self.venue2.exchange_code()))?;

        klines1.sort_by_key(|k| k.open_time);
        klines2.sort_by_key(|k| k.open_time);

        let times1: BTreeSet<i64> = klines1.iter().map(|k| k.open_time).collect();
        let times2: BTreeSet<i64> = klines2.iter().map(|k| k.open_time).collect();
        let common: BTreeSet<i64> = times1.intersection(&times2).copied().collect();

        if common.len() < klines1.len().min(klines2.len()) {
            warn!(
                pair = %self.pair_label,
                symbol,
                aligned = common.len(),
                "K-line alignment dropped records"
            );
        }

        klines1.retain(|k| common.contains(&k.open_time));
        klines2.retain(|k| common.contains(&k.open_time));
        Ok((klines1, klines2))
    }
}

/// Per-bar spread `(close1 - close2) / close2`, skipping zero denominators.
pub fn price_spreads(klines1: &[Kline], klines2: &[Kline]) -> Vec<f64> {
    klines1
        .iter()
        .zip(klines2.iter())
        .filter(|(_, k2)| k2.close != 0.0)
        .map(|(k1, k2)| (k1.close - k2.close) / k2.close)
        .collect()
}

/// Distribution summary of a spread series.
pub fn spread_statistics(spreads: &[f64]) -> Result<SpreadStatistics> {
    if spreads.is_empty() {
        bail!("empty spread series");
    }

    let mean = Statistics::mean(spreads.iter());
    let std = if spreads.len() > 1 {
        Statistics::std_dev(spreads.iter())
    } else {
        0.0
    };
    let min = Statistics::min(spreads.iter());
    let max = Statistics::max(spreads.iter());

    let mut sorted = spreads.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    let margin = 1.96 * std / (spreads.len() as f64).sqrt();

    Ok(SpreadStatistics {
        mean_spread: mean,
        std_spread: std,
        min_spread: min,
        max_spread: max,
        median_spread: percentile(&sorted, 50.0),
        percentile_25: percentile(&sorted, 25.0),
        percentile_75: percentile(&sorted, 75.0),
        sample_count: spreads.len(),
        confidence_interval_95: (mean - margin, mean + margin),
    })
}

/// Linear-interpolation percentile over an ascending-sorted slice.
fn percentile(sorted: &[f64], pct: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    if sorted.len() == 1 {
        return sorted[0];
    }
    let rank = pct / 100.0 * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    if lo == hi {
        sorted[lo]
    } else {
        let frac = rank - lo as f64;
        sorted[lo] + (sorted[hi] - sorted[lo]) * frac
    }
}

/// Minimum profitable spread threshold for a given confidence level.
///
/// The side of the distribution is chosen by the sign of the mean: a
/// positive mean spread is harvested by selling venue 1, so the lower
/// statistics bound applies, and vice versa.
pub fn minimum_profit_threshold(stats: &SpreadStatistics, confidence_level: f64) -> f64 {
    if confidence_level <= 0.5 {
        stats.median_spread
    } else if confidence_level <= 0.8 {
        if stats.mean_spread > 0.0 {
            stats.percentile_25
        } else {
            stats.percentile_75
        }
    } else if confidence_level <= 0.95 {
        if stats.mean_spread > 0.0 {
            stats.confidence_interval_95.0
        } else {
            stats.confidence_interval_95.1
        }
    } else if stats.mean_spread > 0.0 {
        stats.min_spread
    } else {
        stats.max_spread
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::venue::PaperVenue;
    use std::sync::Arc;

    fn kline(open_time: i64, close: f64) -> Kline {
        Kline {
            open_time,
            open: close,
            high: close,
            low: close,
            close,
        }
    }

    #[test]
    fn spread_series_matches_hand_computed_values() {
        // closes1 = [100.0, 101.0, 99.5], closes2 = [99.5, 100.5, 99.0]
        let k1: Vec<Kline> = [100.0, 101.0, 99.5]
            .iter()
            .enumerate()
            .map(|(i, c)| kline(i as i64, *c))
            .collect();
        let k2: Vec<Kline> = [99.5, 100.5, 99.0]
            .iter()
            .enumerate()
            .map(|(i, c)| kline(i as i64, *c))
            .collect();

        let spreads = price_spreads(&k1, &k2);
        assert_eq!(spreads.len(), 3);
        assert!((spreads[0] - 0.005025).abs() < 1e-5);
        assert!((spreads[1] - 0.004975).abs() < 1e-5);
        assert!((spreads[2] - 0.005051).abs() < 1e-5);

        let stats = spread_statistics(&spreads).unwrap();
        assert_eq!(stats.sample_count, 3);
        assert!((stats.mean_spread - 0.005017).abs() < 1e-5);
        assert!(stats.mean_spread >= stats.min_spread && stats.mean_spread <= stats.max_spread);
    }

    #[test]
    fn confidence_interval_width_law() {
        let spreads: Vec<f64> = (0..100).map(|i| (i as f64) / 10_000.0).collect();
        let stats = spread_statistics(&spreads).unwrap();
        let width = stats.confidence_interval_95.1 - stats.confidence_interval_95.0;
        let expected = 2.0 * 1.96 * stats.std_spread / (spreads.len() as f64).sqrt();
        assert!((width - expected).abs() < 1e-12);
        assert!(stats.std_spread >= 0.0);
    }

    #[test]
    fn degenerate_series_has_zero_std() {
        let spreads = vec![0.001; 60];
        let stats = spread_statistics(&spreads).unwrap();
        assert!(stats.std_spread.abs() < 1e-15);
        assert!((stats.median_spread - 0.001).abs() < 1e-15);
    }

    #[tokio::test]
    async fn analyzer_rejects_thin_overlap() {
        let series1: Vec<Kline> = (0..3).map(|i| kline(i, 100.0)).collect();
        let series2: Vec<Kline> = (0..3).map(|i| kline(i, 99.5)).collect();
        let v1 = Arc::new(PaperVenue::new("paper1").with_klines("BTC", "1m", series1));
        let v2 = Arc::new(PaperVenue::new("paper2").with_klines("BTC", "1m", series2));

        let analyzer = SpreadAnalyzer::new(v1, v2);
        let err = analyzer.analyze_spread("BTC", "1m", 1000).await.unwrap_err();
        assert!(err.to_string().contains("too few samples"));
    }

    #[tokio::test]
    async fn analyzer_aligns_on_open_time_intersection() {
        // Venue 2 is missing the first 10 bars; only the overlap counts.
        let series1: Vec<Kline> = (0..80).map(|i| kline(i, 100.0 + (i % 5) as f64 * 0.01)).collect();
        let series2: Vec<Kline> = (10..80).map(|i| kline(i, 99.5)).collect();
        let v1 = Arc::new(PaperVenue::new("paper1").with_klines("BTC", "1m", series1));
        let v2 = Arc::new(PaperVenue::new("paper2").with_klines("BTC", "1m", series2));

        let analyzer = SpreadAnalyzer::new(v1, v2);
        let stats = analyzer.analyze_spread("BTC", "1m", 1000).await.unwrap();
        assert_eq!(stats.sample_count, 70);
    }

    #[test]
    fn threshold_picks_distribution_side_by_mean_sign() {
        let spreads: Vec<f64> = (0..60).map(|i| 0.001 + (i as f64) * 1e-6).collect();
        let stats = spread_statistics(&spreads).unwrap();
        assert_eq!(minimum_profit_threshold(&stats, 0.5), stats.median_spread);
        assert_eq!(minimum_profit_threshold(&stats, 0.8), stats.percentile_25);
        assert_eq!(minimum_profit_threshold(&stats, 0.95), stats.confidence_interval_95.0);
        assert_eq!(minimum_profit_threshold(&stats, 0.99), stats.min_spread);

        let negated: Vec<f64> = spreads.iter().map(|s| -s).collect();
        let stats = spread_statistics(&negated).unwrap();
        assert_eq!(minimum_profit_threshold(&stats, 0.8), stats.percentile_75);
    }
}
