// =============================================================================
// Position balance — imbalance repair and forced risk unwinding
// =============================================================================
//
// Auto-balance direction table (net amount across both venues):
//
//   imbalance > 0 (net long)  -> order side SELL -> reduce-only on the LONG leg
//   imbalance < 0 (net short) -> order side BUY  -> reduce-only on the SHORT leg
//
// The primary order is reduce-only on the leg whose held side opposes the
// order side, which strictly shrinks |imbalance|.  The fallback places the
// same order on the other leg WITHOUT reduce-only: net imbalance still
// shrinks, but gross exposure grows — the engine alerts and stops itself
// rather than keep trading on a venue that just rejected a reduce.
// =============================================================================

use std::time::Duration;

use tracing::{error, warn};

use crate::notify::Channel;
use crate::types::{OrderType, Side};

use super::execution::{place_dual_market_orders, resolve_avg_price, spread_profit};
use super::RealtimeHedgeEngine;

/// Imbalances below this are left alone (USD).
const AUTO_BALANCE_MIN_USD: f64 = 50.0;

impl RealtimeHedgeEngine {
    /// Repair a hedge imbalance with one reduce-only market order.
    pub(crate) async fn auto_balance_position(&mut self) {
        let Some(snapshot) = self.snapshot_slot.read() else {
            return;
        };
        let imbalance_value = snapshot.imbalance_value(&self.symbol, &self.venue_codes);
        if imbalance_value.abs() < AUTO_BALANCE_MIN_USD {
            return;
        }
        let imbalance_amt = snapshot.imbalance_amount(&self.symbol, &self.venue_codes);
        if imbalance_amt == 0.0 {
            return;
        }

        let side = if imbalance_amt > 0.0 { Side::Sell } else { Side::Buy };

        // Reduce the leg whose held side opposes the order side.
        let p1_side = self.position1.as_ref().and_then(|p| p.position_side());
        let (use_venue, use_pair, other_venue, other_pair) = if p1_side != Some(side) {
            (
                self.venue1.clone(),
                self.trade_config.pair1.clone(),
                self.venue2.clone(),
                self.trade_config.pair2.clone(),
            )
        } else {
            (
                self.venue2.clone(),
                self.trade_config.pair2.clone(),
                self.venue1.clone(),
                self.trade_config.pair1.clone(),
            )
        };

        if imbalance_value.abs() >= self.risk_config.auto_pos_balance_usd_value_limit {
            let msg = format!(
                "{} ({}): imbalance ${imbalance_value:.2} exceeds the auto-balance limit — manual reduction required",
                self.symbol,
                use_venue.exchange_code()
            );
            warn!("{msg}");
            self.notifier.notify(&msg, Channel::Risk).await;
            return;
        }

        let mid_price = match use_venue.get_tick_price(&self.symbol).await {
            Ok(price) => price,
            Err(e) => {
                warn!(symbol = %self.symbol, error = %e, "auto-balance skipped: no reference price");
                return;
            }
        };
        let trade_amt = match use_venue.convert_size(&use_pair, imbalance_amt.abs()).await {
            Ok(amt) if amt > 0.0 => amt,
            _ => {
                warn!(symbol = %self.symbol, "auto-balance skipped: imbalance below venue precision");
                return;
            }
        };

        match use_venue
            .make_new_order(&use_pair, side, OrderType::Market, trade_amt, Some(mid_price), true)
            .await
        {
            Ok(_) => {
                let msg = format!(
                    "{} ({}) {side}: auto-balance reduced {trade_amt} (${imbalance_value:.2})",
                    self.symbol,
                    use_venue.exchange_code()
                );
                warn!("{msg}");
                self.notifier.notify(&msg, Channel::Risk).await;
            }
            Err(primary_err) => {
                // Fallback leg: net imbalance shrinks, gross exposure grows.
                match other_venue
                    .make_new_order(&other_pair, side, OrderType::Market, trade_amt, Some(mid_price), false)
                    .await
                {
                    Ok(_) => {
                        let msg = format!(
                            "{} ({}): auto-balance fallback ADDED {trade_amt} {side} \
                             (${imbalance_value:.2}) after {} rejected the reduce: {primary_err} — \
                             gross exposure grew, stopping engine",
                            self.symbol,
                            other_venue.exchange_code(),
                            use_venue.exchange_code()
                        );
                        warn!("{msg}");
                        self.notifier.notify(&msg, Channel::Risk).await;
                        self.running = false;
                    }
                    Err(fallback_err) => {
                        let msg = format!(
                            "{}: auto-balance failed on both legs ({primary_err}; {fallback_err})",
                            self.symbol
                        );
                        error!("{msg}");
                        self.notifier.notify(&msg, Channel::Risk).await;
                    }
                }
            }
        }
    }

    /// Unwind the hedge in bounded chunks while the snapshot demands it.
    ///
    /// Each chunk reduces both legs by the same amount, so the hedge stays
    /// balanced while the gross notional walks down.  The loop terminates
    /// when the snapshot clears, the position is gone, or a leg fails.
    pub(crate) async fn auto_force_reduce_to_safe(&mut self) {
        let mut reduced_value = 0.0;
        let mut total_profit = 0.0;

        loop {
            if self.stop.is_stopped() {
                break;
            }
            let Some(snapshot) = self.snapshot_slot.read_checked(&self.exchange_pair) else {
                break;
            };
            if !snapshot.should_force_reduce() {
                break;
            }

            let (held_side1, held_side2, held_amount) = match (&self.position1, &self.position2) {
                (Some(p1), Some(p2)) => match (p1.position_side(), p2.position_side()) {
                    (Some(s1), Some(s2)) => (s1, s2, p1.amount.abs()),
                    _ => break,
                },
                _ => {
                    warn!(symbol = %self.symbol, "force-reduce requested but no hedged position held");
                    break;
                }
            };
            // Each leg reduces toward the other's held side.
            let reduce_side1 = held_side2;
            let reduce_side2 = held_side1;

            let mid_price = match self.venue1.get_tick_price(&self.symbol).await {
                Ok(price) => price,
                Err(e) => {
                    warn!(symbol = %self.symbol, error = %e, "force-reduce: no reference price");
                    break;
                }
            };

            let mut amount = held_amount;
            while amount * mid_price > self.trade_config.max_order_value_usd {
                amount /= 2.0;
            }
            let amount = match self.venue1.convert_size(&self.trade_config.pair1, amount).await {
                Ok(amt) if amt > 0.0 => amt,
                _ => {
                    warn!(symbol = %self.symbol, "force-reduce: residual below venue precision");
                    break;
                }
            };

            let (result1, result2) = place_dual_market_orders(
                &self.venue1,
                &self.trade_config.pair1,
                reduce_side1,
                &self.venue2,
                &self.trade_config.pair2,
                reduce_side2,
                amount,
                mid_price,
                mid_price,
                true,
            )
            .await;
            let (receipt1, receipt2) = match (result1, result2) {
                (Ok(r1), Ok(r2)) => (r1, r2),
                (r1, r2) => {
                    error!(
                        symbol = %self.symbol,
                        ok1 = r1.is_ok(),
                        ok2 = r2.is_ok(),
                        "force-reduce chunk failed — aborting unwind"
                    );
                    break;
                }
            };

            tokio::time::sleep(Duration::from_millis(100)).await;

            let avg1 = match resolve_avg_price(&self.venue1, &self.trade_config.pair1, &receipt1).await {
                Ok(price) => price,
                Err(e) => {
                    warn!(error = %e, "force-reduce: fill reconcile failed");
                    break;
                }
            };
            let avg2 = match resolve_avg_price(&self.venue2, &self.trade_config.pair2, &receipt2).await {
                Ok(price) => price,
                Err(e) => {
                    warn!(error = %e, "force-reduce: fill reconcile failed");
                    break;
                }
            };

            let profit = spread_profit(reduce_side1, avg1, avg2, amount);
            let chunk_value = amount * mid_price;
            reduced_value += chunk_value;
            total_profit += profit;

            let msg = format!(
                "{} {}: force-reduce chunk ${chunk_value:.2}, spread profit ${profit:.2}",
                self.symbol, self.exchange_pair
            );
            warn!("{msg}");
            self.notifier.notify(&msg, Channel::Risk).await;

            if let Err(e) = self.update_exchange_info().await {
                warn!(error = %e, "force-reduce: snapshot refresh failed");
                break;
            }
        }

        if reduced_value > 0.0 {
            let rate = total_profit / reduced_value;
            self.notifier
                .notify(
                    &format!(
                        "{} {}: force-reduce complete: ${reduced_value:.2} unwound, \
                         spread profit ${total_profit:.2} ({:.3}%)",
                        self.symbol,
                        self.exchange_pair,
                        rate * 100.0
                    ),
                    Channel::Risk,
                )
                .await;
        }
    }
}
