// =============================================================================
// Paper venue — in-memory reference implementation of the venue contract
// =============================================================================
//
// Fills are deterministic: market orders execute at the caller's reference
// price (or the configured mark price) shifted by the configured slippage.
// Position and margin bookkeeping follows the exchange convention:
// sign(amount) == sign(notional), reduce-only orders clamp to the open
// position and are rejected when they would increase it.
// =============================================================================

use std::collections::HashMap;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use uuid::Uuid;

use crate::types::{base_symbol, Kline, Order, OrderReceipt, OrderStatus, OrderType, Position, Side, TickPrice};

use super::VenueAdapter;

/// Initial-margin fraction used for the available-margin estimate.
const INITIAL_MARGIN_RATE: f64 = 0.1;

#[derive(Debug, Clone)]
struct PaperPosition {
    amount: f64,
    entry_price: f64,
    funding_fee: f64,
}

#[derive(Default)]
struct PaperState {
    total_margin: f64,
    maintenance_margin_ratio: f64,
    positions: HashMap<String, PaperPosition>,
    orders: HashMap<String, Order>,
    /// Base-symbol keyed mark prices.
    mark_prices: HashMap<String, f64>,
    /// Base-symbol keyed funding rates (APY).
    funding_rates: HashMap<String, f64>,
    /// (symbol, interval) keyed candle fixtures.
    klines: HashMap<(String, String), Vec<Kline>>,
    /// When set, every subsequent order placement fails.
    fail_orders: bool,
    /// When set, account queries (margin, positions) fail.
    fail_account: bool,
}

/// Credential-less venue backed by in-memory state.
pub struct PaperVenue {
    code: String,
    taker_fee_rate: f64,
    maker_fee_rate: f64,
    size_step: f64,
    /// Fractional price shift applied against the taker on each fill.
    slippage_pct: f64,
    /// Whether receipts carry the fill average inline.
    inline_fills: bool,
    state: RwLock<PaperState>,
}

impl PaperVenue {
    pub fn new(code: &str) -> Self {
        Self {
            code: code.to_lowercase(),
            taker_fee_rate: 0.0004,
            maker_fee_rate: 0.0002,
            size_step: 0.001,
            slippage_pct: 0.0,
            inline_fills: false,
            state: RwLock::new(PaperState {
                total_margin: 10_000.0,
                maintenance_margin_ratio: 0.05,
                ..PaperState::default()
            }),
        }
    }

    // -------------------------------------------------------------------------
    // Builders (used by tests and demo wiring)
    // -------------------------------------------------------------------------

    pub fn with_fees(mut self, taker: f64, maker: f64) -> Self {
        self.taker_fee_rate = taker;
        self.maker_fee_rate = maker;
        self
    }

    pub fn with_size_step(mut self, step: f64) -> Self {
        self.size_step = step;
        self
    }

    pub fn with_slippage(mut self, pct: f64) -> Self {
        self.slippage_pct = pct;
        self
    }

    pub fn with_inline_fills(mut self) -> Self {
        self.inline_fills = true;
        self
    }

    pub fn with_margin(self, total: f64) -> Self {
        self.state.write().total_margin = total;
        self
    }

    pub fn with_mark_price(self, symbol: &str, price: f64) -> Self {
        self.set_mark_price(symbol, price);
        self
    }

    pub fn with_funding_rate(self, symbol: &str, apy: f64) -> Self {
        self.state.write().funding_rates.insert(base_symbol(symbol), apy);
        self
    }

    pub fn with_position(self, pair: &str, amount: f64, entry_price: f64) -> Self {
        self.set_position(pair, amount, entry_price);
        self
    }

    pub fn with_klines(self, symbol: &str, interval: &str, klines: Vec<Kline>) -> Self {
        self.state
            .write()
            .klines
            .insert((base_symbol(symbol), interval.to_string()), klines);
        self
    }

    // -------------------------------------------------------------------------
    // Mutators
    // -------------------------------------------------------------------------

    pub fn set_mark_price(&self, symbol: &str, price: f64) {
        self.state.write().mark_prices.insert(base_symbol(symbol), price);
    }

    pub fn set_position(&self, pair: &str, amount: f64, entry_price: f64) {
        let mut state = self.state.write();
        if amount == 0.0 {
            state.positions.remove(pair);
        } else {
            state.positions.insert(
                pair.to_string(),
                PaperPosition {
                    amount,
                    entry_price,
                    funding_fee: 0.0,
                },
            );
        }
    }

    pub fn set_maintenance_margin_ratio(&self, ratio: f64) {
        self.state.write().maintenance_margin_ratio = ratio;
    }

    pub fn set_fail_orders(&self, fail: bool) {
        self.state.write().fail_orders = fail;
    }

    pub fn set_fail_account(&self, fail: bool) {
        self.state.write().fail_account = fail;
    }

    fn check_account_ok(&self) -> Result<()> {
        if self.state.read().fail_account {
            bail!("{}: account endpoint unavailable (simulated venue fault)", self.code);
        }
        Ok(())
    }

    /// Signed position amount currently held for `pair` (0 when flat).
    pub fn position_amount(&self, pair: &str) -> f64 {
        self.state.read().positions.get(pair).map(|p| p.amount).unwrap_or(0.0)
    }

    fn mark_price_of(&self, symbol: &str) -> Result<f64> {
        let key = base_symbol(symbol);
        self.state
            .read()
            .mark_prices
            .get(&key)
            .copied()
            .with_context(|| format!("{}: no mark price for {key}", self.code))
    }

    fn snap(&self, qty: f64) -> f64 {
        if self.size_step <= 0.0 {
            return qty;
        }
        let steps = (qty / self.size_step + 1e-9).floor();
        // Re-quantise to kill float dust from the division.
        let snapped = steps * self.size_step;
        let decimals = (-self.size_step.log10()).ceil().max(0.0) as u32;
        let factor = 10f64.powi(decimals as i32);
        (snapped * factor).round() / factor
    }
}

#[async_trait]
impl VenueAdapter for PaperVenue {
    fn exchange_code(&self) -> &str {
        &self.code
    }

    fn taker_fee_rate(&self) -> f64 {
        self.taker_fee_rate
    }

    fn maker_fee_rate(&self) -> f64 {
        self.maker_fee_rate
    }

    async fn get_all_tick_price(&self) -> Result<Vec<TickPrice>> {
        Ok(self
            .state
            .read()
            .mark_prices
            .iter()
            .map(|(name, price)| TickPrice {
                name: name.clone(),
                mid_price: *price,
            })
            .collect())
    }

    async fn get_tick_price(&self, symbol: &str) -> Result<f64> {
        self.mark_price_of(symbol)
    }

    async fn get_klines(&self, symbol: &str, interval: &str, limit: usize) -> Result<Vec<Kline>> {
        let key = (base_symbol(symbol), interval.to_string());
        let state = self.state.read();
        let series = state.klines.get(&key).cloned().unwrap_or_default();
        let start = series.len().saturating_sub(limit);
        Ok(series[start..].to_vec())
    }

    async fn get_all_cur_positions(&self) -> Result<Vec<Position>> {
        self.check_account_ok()?;
        let state = self.state.read();
        let mut positions = Vec::new();
        for (pair, pos) in &state.positions {
            if pos.amount == 0.0 {
                continue;
            }
            let symbol = base_symbol(pair);
            let mark = state.mark_prices.get(&symbol).copied().unwrap_or(pos.entry_price);
            positions.push(Position {
                venue_code: self.code.clone(),
                pair: pair.clone(),
                symbol: symbol.clone(),
                amount: pos.amount,
                entry_price: pos.entry_price,
                notional: pos.amount * mark,
                unrealized_pnl: (mark - pos.entry_price) * pos.amount,
                funding_fee: pos.funding_fee,
                mark_price: mark,
                adl: 0,
                liquidation_price: 0.0,
                funding_rate: None,
            });
        }
        Ok(positions)
    }

    async fn get_funding_rate(&self, symbol: &str) -> Result<f64> {
        Ok(self
            .state
            .read()
            .funding_rates
            .get(&base_symbol(symbol))
            .copied()
            .unwrap_or(0.0))
    }

    async fn get_total_margin(&self) -> Result<f64> {
        self.check_account_ok()?;
        Ok(self.state.read().total_margin)
    }

    async fn get_available_margin(&self) -> Result<f64> {
        self.check_account_ok()?;
        let state = self.state.read();
        let used: f64 = state
            .positions
            .iter()
            .map(|(pair, pos)| {
                let mark = state
                    .mark_prices
                    .get(&base_symbol(pair))
                    .copied()
                    .unwrap_or(pos.entry_price);
                (pos.amount * mark).abs() * INITIAL_MARGIN_RATE
            })
            .sum();
        Ok((state.total_margin - used).max(0.0))
    }

    async fn get_cross_margin_ratio(&self) -> Result<f64> {
        Ok(self.state.read().maintenance_margin_ratio)
    }

    async fn make_new_order(
        &self,
        pair: &str,
        side: Side,
        _order_type: OrderType,
        amount: f64,
        price: Option<f64>,
        reduce_only: bool,
    ) -> Result<OrderReceipt> {
        if amount <= 0.0 {
            bail!("{}: order amount must be positive", self.code);
        }

        let reference = match price {
            Some(p) => p,
            None => self.mark_price_of(pair)?,
        };
        // Slippage always works against the taker.
        let fill_price = match side {
            Side::Buy => reference * (1.0 + self.slippage_pct),
            Side::Sell => reference * (1.0 - self.slippage_pct),
        };

        let mut state = self.state.write();
        if state.fail_orders {
            bail!("{}: order rejected (simulated venue fault)", self.code);
        }

        let held = state.positions.get(pair).map(|p| p.amount).unwrap_or(0.0);
        let delta = side.sign() * amount;

        let executed = if reduce_only {
            let held_side = Side::from_amount(held);
            if held_side.is_none() || held_side == Some(side) {
                bail!(
                    "{}: reduce-only {side} order on {pair} would increase the position (held {held})",
                    self.code
                );
            }
            amount.min(held.abs())
        } else {
            amount
        };
        let delta = delta.signum() * executed;

        let new_amount = held + delta;
        if new_amount == 0.0 {
            state.positions.remove(pair);
        } else if let Some(pos) = state.positions.get_mut(pair) {
            if held.signum() == delta.signum() {
                // Increasing: volume-weighted entry.
                pos.entry_price =
                    (pos.entry_price * held.abs() + fill_price * executed) / new_amount.abs();
            } else if held.signum() != new_amount.signum() {
                // Flipped through zero: the residual was opened at this fill.
                pos.entry_price = fill_price;
            }
            pos.amount = new_amount;
        } else {
            state.positions.insert(
                pair.to_string(),
                PaperPosition {
                    amount: delta,
                    entry_price: fill_price,
                    funding_fee: 0.0,
                },
            );
        }

        let order_id = Uuid::new_v4().to_string();
        state.orders.insert(
            order_id.clone(),
            Order {
                order_id: order_id.clone(),
                pair: pair.to_string(),
                side,
                status: OrderStatus::Filled,
                avg_price: fill_price,
                executed_qty: executed,
                orig_qty: amount,
            },
        );

        Ok(OrderReceipt {
            order_id,
            avg_price: self.inline_fills.then_some(fill_price),
        })
    }

    async fn cancel_all_orders(&self, pair: &str) -> Result<()> {
        let mut state = self.state.write();
        state.orders.retain(|_, order| {
            !(order.pair == pair && !order.status.is_terminal())
        });
        Ok(())
    }

    async fn get_recent_order(&self, pair: &str, order_id: Option<&str>) -> Result<Option<Order>> {
        let state = self.state.read();
        let order = match order_id {
            Some(id) => state.orders.get(id).cloned(),
            None => state
                .orders
                .values()
                .filter(|o| o.pair == pair)
                .last()
                .cloned(),
        };
        Ok(order)
    }

    async fn convert_size(&self, _pair: &str, qty: f64) -> Result<f64> {
        Ok(self.snap(qty))
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn venue() -> PaperVenue {
        PaperVenue::new("paper1")
            .with_mark_price("BTC", 100.0)
            .with_size_step(0.001)
    }

    #[tokio::test]
    async fn market_order_opens_and_closes_position() {
        let v = venue();
        let receipt = v
            .make_new_order("BTCUSDT", Side::Buy, OrderType::Market, 0.5, Some(100.0), false)
            .await
            .unwrap();
        assert!((v.position_amount("BTCUSDT") - 0.5).abs() < 1e-12);

        let order = v.get_recent_order("BTCUSDT", Some(&receipt.order_id)).await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Filled);
        assert!((order.avg_price - 100.0).abs() < 1e-12);

        v.make_new_order("BTCUSDT", Side::Sell, OrderType::Market, 0.5, Some(101.0), true)
            .await
            .unwrap();
        assert_eq!(v.position_amount("BTCUSDT"), 0.0);
        assert!(v.get_all_cur_positions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn reduce_only_rejects_increase_and_clamps() {
        let v = venue().with_position("BTCUSDT", 0.3, 100.0);

        // Same-side reduce-only must be rejected.
        assert!(v
            .make_new_order("BTCUSDT", Side::Buy, OrderType::Market, 0.1, Some(100.0), true)
            .await
            .is_err());

        // Oversized reduce clamps to the open amount, never flips.
        v.make_new_order("BTCUSDT", Side::Sell, OrderType::Market, 1.0, Some(100.0), true)
            .await
            .unwrap();
        assert_eq!(v.position_amount("BTCUSDT"), 0.0);
    }

    #[tokio::test]
    async fn convert_size_snaps_down_to_step() {
        let v = venue();
        assert!((v.convert_size("BTCUSDT", 0.12345).await.unwrap() - 0.123).abs() < 1e-12);
        assert!((v.convert_size("BTCUSDT", 0.2).await.unwrap() - 0.2).abs() < 1e-12);
    }

    #[tokio::test]
    async fn positions_report_sign_consistent_notional() {
        let v = venue().with_position("BTCUSDT", -0.4, 100.0);
        let positions = v.get_all_cur_positions().await.unwrap();
        assert_eq!(positions.len(), 1);
        let pos = &positions[0];
        assert!(pos.amount < 0.0);
        assert!(pos.notional < 0.0);
        assert_eq!(pos.position_side(), Some(Side::Sell));
    }

    #[tokio::test]
    async fn simulated_fault_fails_order() {
        let v = venue();
        v.set_fail_orders(true);
        assert!(v
            .make_new_order("BTCUSDT", Side::Buy, OrderType::Market, 0.1, Some(100.0), false)
            .await
            .is_err());
        assert_eq!(v.position_amount("BTCUSDT"), 0.0);
    }

    #[tokio::test]
    async fn available_margin_shrinks_with_exposure() {
        let v = venue().with_margin(1_000.0);
        let before = v.get_available_margin().await.unwrap();
        v.make_new_order("BTCUSDT", Side::Buy, OrderType::Market, 1.0, Some(100.0), false)
            .await
            .unwrap();
        let after = v.get_available_margin().await.unwrap();
        assert!(after < before);
    }
}
