// =============================================================================
// Strategy math — z-score and optimal-spread derivation
// =============================================================================

use crate::spread_analyzer::SpreadStatistics;
use crate::types::Side;

/// One 8-hour funding period of an annualised rate.
pub fn funding_period_rate(apy: f64) -> f64 {
    apy / 365.0 / 3.0
}

/// Standardised distance of the current spread from its historical mean,
/// adjusted by one funding-period differential.
///
/// With `side1` set, the score is biased by the round-trip fee in the
/// direction of the intended leg-1 side (BUY pushes the score up, SELL
/// down), so a triggered score already clears costs.
///
/// Degenerate history (`std == 0`) yields 0 by convention.
pub fn calculate_zscore(
    current_spread: f64,
    stats: Option<&SpreadStatistics>,
    funding_rate1_apy: f64,
    funding_rate2_apy: f64,
    side1: Option<Side>,
    fee_rate: f64,
) -> f64 {
    let mean = stats.map(|s| s.mean_spread).unwrap_or(0.0);
    let std = stats.map(|s| s.std_spread).unwrap_or(0.0);

    let adjusted = current_spread + funding_period_rate(funding_rate1_apy) - funding_period_rate(funding_rate2_apy);

    if std <= 0.0 {
        return 0.0;
    }
    match side1 {
        Some(side) => (adjusted - mean + side.sign() * fee_rate) / std,
        None => (adjusted - mean) / std,
    }
}

/// The spread level at which the z-score threshold would trigger,
/// net of the funding differential.
pub fn infer_optimal_spread_by_zscore(
    zscore_threshold: f64,
    stats: Option<&SpreadStatistics>,
    funding_rate1_apy: f64,
    funding_rate2_apy: f64,
) -> f64 {
    let mean = stats.map(|s| s.mean_spread).unwrap_or(0.0);
    let std = stats.map(|s| s.std_spread).unwrap_or(0.0);
    mean + zscore_threshold * std
        - (funding_period_rate(funding_rate1_apy) - funding_period_rate(funding_rate2_apy))
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::spread_analyzer::spread_statistics;

    fn stats(mean: f64, wiggle: f64) -> SpreadStatistics {
        // Build a series with the requested mean and a non-zero std.
        let series: Vec<f64> = (0..60)
            .map(|i| mean + if i % 2 == 0 { wiggle } else { -wiggle })
            .collect();
        spread_statistics(&series).unwrap()
    }

    #[test]
    fn zero_std_maps_to_zero_zscore() {
        let flat = spread_statistics(&vec![0.001; 60]).unwrap();
        assert_eq!(calculate_zscore(0.05, Some(&flat), 0.0, 0.0, None, 0.0), 0.0);
        assert_eq!(calculate_zscore(0.05, None, 0.0, 0.0, None, 0.0), 0.0);
    }

    #[test]
    fn funding_differential_shifts_the_spread() {
        let s = stats(0.0, 0.001);
        // APY difference of +10.95% is exactly +0.0001 per 8h period.
        let with_funding = calculate_zscore(0.0, Some(&s), 0.1095, 0.0, None, 0.0);
        let without = calculate_zscore(0.0001, Some(&s), 0.0, 0.0, None, 0.0);
        assert!((with_funding - without).abs() < 1e-9);
    }

    #[test]
    fn fee_bias_follows_side_sign() {
        let s = stats(0.0, 0.001);
        let buy = calculate_zscore(0.0, Some(&s), 0.0, 0.0, Some(Side::Buy), 0.0008);
        let sell = calculate_zscore(0.0, Some(&s), 0.0, 0.0, Some(Side::Sell), 0.0008);
        assert!(buy > 0.0);
        assert!(sell < 0.0);
        assert!((buy + sell).abs() < 1e-12);
    }

    #[test]
    fn optimal_spread_inverts_the_zscore() {
        let s = stats(0.002, 0.001);
        let optimal = infer_optimal_spread_by_zscore(2.0, Some(&s), 0.0, 0.0);
        // Plugging the optimal spread back in yields exactly the threshold.
        let z = calculate_zscore(optimal, Some(&s), 0.0, 0.0, None, 0.0);
        assert!((z - 2.0).abs() < 1e-9);
    }
}
