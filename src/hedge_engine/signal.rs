// =============================================================================
// Trade signal — per-tick snapshot of spread, z-score and intended sides
// =============================================================================

use std::time::Instant;

use crate::spread_analyzer::SpreadStatistics;
use crate::strategy_math::{calculate_zscore, infer_optimal_spread_by_zscore};
use crate::types::Side;

/// 1-hour-cached market context for one venue pair.
#[derive(Debug, Clone, Default)]
pub struct MarketInfo {
    pub spread_stats: Option<SpreadStatistics>,
    /// Annualised funding rates for each leg.
    pub funding_rate1: f64,
    pub funding_rate2: f64,
}

/// Transient signal produced on every order-book tick.
///
/// A signal is only valid close to its generation time: trading on a stale
/// one means trading at stale prices, so the engine enforces a hard latency
/// cap before execution.
#[derive(Debug, Clone)]
pub struct TradeSignal {
    pub pair1: String,
    pub pair2: String,
    pub side1: Side,
    pub side2: Side,
    /// Reference crossing prices, not executed prices.
    pub price1: f64,
    pub price2: f64,
    pub spread: f64,
    /// Spread profit rate in the direction of the intended sides.
    pub spread_rate: f64,
    pub ma_spread: f64,
    pub std_spread: f64,
    pub optimal_spread: f64,
    pub z_score: f64,
    pub z_score_after_fee: f64,
    pub zscore_threshold: f64,
    pub funding_rate_diff_apy: f64,
    /// True when the trade opens or grows the hedge; false when it reduces.
    pub is_add_position: bool,
    pub generated_at: Instant,
}

impl TradeSignal {
    pub fn delay_ms(&self) -> f64 {
        self.generated_at.elapsed().as_secs_f64() * 1000.0
    }

    /// Whether the fee-adjusted z-score supports the chosen side1.
    ///
    /// A score at or beyond -threshold calls for BUY (spread undervalued),
    /// at or beyond +threshold for SELL; inside the band no side is
    /// supported.
    pub fn is_zscore_triggered(&self) -> bool {
        let optimal_side1 = if self.z_score_after_fee <= -self.zscore_threshold {
            Some(Side::Buy)
        } else if self.z_score_after_fee >= self.zscore_threshold {
            Some(Side::Sell)
        } else {
            None
        };
        optimal_side1 == Some(self.side1)
    }
}

impl std::fmt::Display for TradeSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "signal {} {}@{:.6}/{:.6} spread_rate={:.4}% z={:.2}/{:.2}({:.2}) funding_diff={:.2}%/y add={} delay={:.2}ms",
            self.pair1,
            self.side1,
            self.price1,
            self.price2,
            self.spread_rate * 100.0,
            self.z_score,
            self.z_score_after_fee,
            self.zscore_threshold,
            self.funding_rate_diff_apy * 100.0,
            self.is_add_position,
            self.delay_ms()
        )
    }
}

/// Spread profit rate for crossing at `price1`/`price2` with leg-1 `side1`.
///
/// BUY leg 1 earns when venue 1 is cheaper; SELL leg 1 earns when venue 1
/// is richer.
pub fn spread_rate_for(side1: Side, price1: f64, price2: f64) -> f64 {
    let spread = price1 - price2;
    match side1 {
        Side::Buy => -spread / price1,
        Side::Sell => spread / price1,
    }
}

/// Assemble a signal from crossing prices and cached market context.
#[allow(clippy::too_many_arguments)]
pub fn build_signal(
    pair1: &str,
    pair2: &str,
    sides: (Side, Side),
    prices: (f64, f64),
    current_spread: f64,
    info: &MarketInfo,
    zscore_threshold: f64,
    taker_fee_rate: f64,
    is_add_position: bool,
    generated_at: Instant,
) -> TradeSignal {
    let (side1, side2) = sides;
    let (price1, price2) = prices;
    let stats = info.spread_stats.as_ref();

    let z_score = calculate_zscore(current_spread, stats, info.funding_rate1, info.funding_rate2, None, 0.0);
    let z_score_after_fee = calculate_zscore(
        current_spread,
        stats,
        info.funding_rate1,
        info.funding_rate2,
        Some(side1),
        taker_fee_rate,
    );
    let optimal_spread =
        infer_optimal_spread_by_zscore(zscore_threshold, stats, info.funding_rate1, info.funding_rate2);

    TradeSignal {
        pair1: pair1.to_string(),
        pair2: pair2.to_string(),
        side1,
        side2,
        price1,
        price2,
        spread: price1 - price2,
        spread_rate: spread_rate_for(side1, price1, price2),
        ma_spread: stats.map(|s| s.mean_spread).unwrap_or(0.0),
        std_spread: stats.map(|s| s.std_spread).unwrap_or(0.0),
        optimal_spread,
        z_score,
        z_score_after_fee,
        zscore_threshold,
        funding_rate_diff_apy: info.funding_rate1 - info.funding_rate2,
        is_add_position,
        generated_at,
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::spread_analyzer::spread_statistics;

    fn info() -> MarketInfo {
        let series: Vec<f64> = (0..60).map(|i| if i % 2 == 0 { 0.001 } else { -0.001 }).collect();
        MarketInfo {
            spread_stats: Some(spread_statistics(&series).unwrap()),
            funding_rate1: 0.0,
            funding_rate2: 0.0,
        }
    }

    fn signal_with(side1: Side, current_spread: f64, threshold: f64) -> TradeSignal {
        build_signal(
            "BTCUSDT",
            "BTCUSDT",
            (side1, side1.opposite()),
            (100.0, 100.1),
            current_spread,
            &info(),
            threshold,
            0.0,
            true,
            Instant::now(),
        )
    }

    #[test]
    fn spread_rate_sign_convention() {
        // BUY leg 1 cheap at 100, SELL leg 2 at 100.2 -> positive rate.
        assert!(spread_rate_for(Side::Buy, 100.0, 100.2) > 0.0);
        // SELL leg 1 rich at 100.2 against 100 -> positive rate.
        assert!(spread_rate_for(Side::Sell, 100.2, 100.0) > 0.0);
        // Wrong direction loses.
        assert!(spread_rate_for(Side::Buy, 100.2, 100.0) < 0.0);
    }

    #[test]
    fn zscore_trigger_matches_side_and_band() {
        // Strongly negative score supports BUY, rejects SELL.
        let buy = signal_with(Side::Buy, -0.003, 2.0);
        assert!(buy.z_score_after_fee <= -2.0);
        assert!(buy.is_zscore_triggered());

        let sell = signal_with(Side::Sell, -0.003, 2.0);
        assert!(!sell.is_zscore_triggered());

        // Inside the band neither side triggers.
        let flat = signal_with(Side::Buy, 0.0, 2.0);
        assert!(!flat.is_zscore_triggered());
    }

    #[test]
    fn funding_diff_carried_in_apy_form() {
        let market = MarketInfo {
            spread_stats: None,
            funding_rate1: 0.20,
            funding_rate2: 0.05,
        };
        let signal = build_signal(
            "BTCUSDT",
            "BTCUSDT",
            (Side::Sell, Side::Buy),
            (100.0, 100.0),
            0.0,
            &market,
            2.0,
            0.0,
            true,
            Instant::now(),
        );
        assert!((signal.funding_rate_diff_apy - 0.15).abs() < 1e-12);
        // No stats -> degenerate z-score.
        assert_eq!(signal.z_score, 0.0);
    }
}
