// =============================================================================
// Trade sizing — depth-aware amount selection for one dual-leg trade
// =============================================================================
//
// Pipeline: base amount (random window in fixed-side mode, first-level cap
// in daemon mode) -> order-value floor (double until above the minimum) ->
// order-value / headroom ceiling (halve until below) -> remaining-total
// clamp -> venue precision snap (tighter of the two venues wins).
// =============================================================================

use anyhow::Result;
use rand::Rng;
use tracing::{debug, warn};

use crate::config::TradeConfig;
use crate::market_data::OrderBook;
use crate::venue::VenueRef;

use super::signal::TradeSignal;

/// Halving iterations before the sizing attempt is abandoned.
const MAX_HALVING_STEPS: usize = 64;

/// Random multiple of `step` in `[min, max]`.
pub fn random_amount(min: f64, max: f64, step: f64) -> f64 {
    if step <= 0.0 || max <= min {
        return min.max(0.0);
    }
    let possible = ((max - min) / step) as u64 + 1;
    let index = rand::thread_rng().gen_range(0..possible);
    min + index as f64 * step
}

/// Snap `amount` down to a multiple of `step` (no-op for step <= 0).
pub fn align_to_step(amount: f64, step: f64) -> f64 {
    if step <= 0.0 {
        return amount;
    }
    let steps = (amount / step + 1e-9).floor();
    let decimals = (-step.log10()).ceil().max(0.0) as i32;
    let factor = 10f64.powi(decimals);
    (steps * step * factor).round() / factor
}

/// Compute this trade's amount.
///
/// Returns 0 when no tradeable size exists (thin first level, exhausted
/// total); the caller skips the tick.
pub async fn calc_trade_amount(
    venue1: &VenueRef,
    venue2: &VenueRef,
    config: &TradeConfig,
    signal: &TradeSignal,
    book1: &OrderBook,
    book2: &OrderBook,
    remaining_amount: f64,
    max_open_notional: f64,
) -> Result<f64> {
    let mut base = if config.daemon_mode {
        None
    } else {
        Some(random_amount(config.amount_min, config.amount_max, config.amount_step))
    };

    if config.use_dynamic_amount {
        let first1 = book1.first_level_qty(signal.side1);
        let first2 = book2.first_level_qty(signal.side2);
        let max_allowed = first1.min(first2) * config.max_first_level_ratio;

        if base.map(|b| b > max_allowed).unwrap_or(true) {
            debug!(
                max_allowed,
                first1, first2, "first-level liquidity caps the trade amount"
            );
            base = Some(max_allowed);
        }
    }

    let Some(mut amount) = base else {
        warn!("no base amount available — daemon mode requires dynamic sizing");
        return Ok(0.0);
    };
    if amount <= 0.0 {
        return Ok(0.0);
    }

    // Both legs should land near the same order value.
    let avg_price = (signal.price1 + signal.price2) / 2.0;
    if avg_price <= 0.0 {
        return Ok(0.0);
    }

    // Too small to be worth the fees: double up to the floor.
    while amount * avg_price < config.min_order_value_usd {
        amount *= 2.0;
        debug!(amount, value = amount * avg_price, "order value below floor — doubled");
    }

    // Too large for the per-order cap or the opening headroom: halve down.
    let ceiling = config.max_order_value_usd.min(max_open_notional);
    let mut halvings = 0;
    while amount * avg_price > ceiling {
        let halved = align_to_step(amount / 2.0, config.amount_step);
        // A step coarser than the halved amount aligns to zero; keep halving raw.
        amount = if halved > 0.0 { halved } else { amount / 2.0 };
        halvings += 1;
        if amount <= 0.0 || halvings >= MAX_HALVING_STEPS {
            warn!(ceiling, "could not size the order under the value ceiling");
            return Ok(0.0);
        }
        debug!(amount, value = amount * avg_price, "order value above ceiling — halved");
    }

    if !config.daemon_mode {
        amount = amount.min(remaining_amount);
    }

    // The coarser venue precision binds both legs.
    let snapped1 = venue1.convert_size(&config.pair1, amount).await?;
    let snapped2 = venue2.convert_size(&config.pair2, amount).await?;
    Ok(snapped1.min(snapped2))
}
