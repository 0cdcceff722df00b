// =============================================================================
// Dual-leg execution — simultaneous market legs and fill reconciliation
// =============================================================================
//
// The two legs MUST launch concurrently: sequential placement widens the
// one-sided exposure window to a full venue round-trip.  Reconciliation is
// joined before the engine advances, so there is never more than one trade
// in flight.
// =============================================================================

use anyhow::{bail, Result};
use tracing::warn;

use crate::types::{OrderReceipt, OrderType, Side};
use crate::venue::VenueRef;

/// Fill-poll attempts before reconciliation gives up.
const FILL_POLL_RETRIES: usize = 30;
/// Delay between fill polls.
const FILL_POLL_INTERVAL_MS: u64 = 100;

/// Place both market legs concurrently.
///
/// Returns the raw per-leg results; the caller decides how to treat a
/// one-sided failure (alert + auto-balance, never auto-cancel).
#[allow(clippy::too_many_arguments)]
pub async fn place_dual_market_orders(
    venue1: &VenueRef,
    pair1: &str,
    side1: Side,
    venue2: &VenueRef,
    pair2: &str,
    side2: Side,
    amount: f64,
    price1: f64,
    price2: f64,
    reduce_only: bool,
) -> (Result<OrderReceipt>, Result<OrderReceipt>) {
    tokio::join!(
        venue1.make_new_order(pair1, side1, OrderType::Market, amount, Some(price1), reduce_only),
        venue2.make_new_order(pair2, side2, OrderType::Market, amount, Some(price2), reduce_only),
    )
}

/// Resolve the average executed price for one leg.
///
/// Venues that report the fill inline short-circuit; the rest are polled
/// through `get_recent_order` until the fill shows up.
pub async fn resolve_avg_price(venue: &VenueRef, pair: &str, receipt: &OrderReceipt) -> Result<f64> {
    if let Some(avg_price) = receipt.avg_price {
        return Ok(avg_price);
    }

    for _ in 0..FILL_POLL_RETRIES {
        match venue.get_recent_order(pair, Some(&receipt.order_id)).await {
            Ok(Some(order)) if order.avg_price > 0.0 && order.executed_qty > 0.0 => {
                return Ok(order.avg_price);
            }
            Ok(_) => {
                tokio::time::sleep(std::time::Duration::from_millis(FILL_POLL_INTERVAL_MS)).await;
            }
            Err(e) => {
                warn!(
                    venue = %venue.exchange_code(),
                    pair,
                    order_id = %receipt.order_id,
                    error = %e,
                    "fill lookup failed — retrying"
                );
                tokio::time::sleep(std::time::Duration::from_millis(3 * FILL_POLL_INTERVAL_MS)).await;
            }
        }
    }

    bail!(
        "{}: could not resolve avg price for order {} on {pair}",
        venue.exchange_code(),
        receipt.order_id
    )
}

/// Realised spread profit for one completed dual-leg trade.
///
/// Buying leg 1 cheap and selling leg 2 rich earns `(avg2 - avg1) · amount`;
/// the SELL-leg-1 direction mirrors it.
pub fn spread_profit(side1: Side, avg_price1: f64, avg_price2: f64, amount: f64) -> f64 {
    let realised_spread = avg_price1 - avg_price2;
    match side1 {
        Side::Buy => -realised_spread * amount,
        Side::Sell => realised_spread * amount,
    }
}
