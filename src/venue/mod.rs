// =============================================================================
// Venue adapter contract — the uniform async surface every exchange exposes
// =============================================================================
//
// Live adapters (REST/WS clients with signing, rate limiting and per-venue
// funding-period scaling) live outside this crate; everything here consumes
// only this trait.  Funding rates cross this boundary already annualised:
// a venue with a 1 h or 4 h funding schedule must scale inside its adapter,
// never in the cache or the engine.
// =============================================================================

pub mod paper;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::types::{Kline, Order, OrderReceipt, OrderType, Position, Side, TickPrice};

pub use paper::PaperVenue;

/// Uniform async venue surface consumed by the aggregator, the hedge
/// engines and the supervisor.
#[async_trait]
pub trait VenueAdapter: Send + Sync {
    /// Stable lowercase venue identifier, e.g. "binance".
    fn exchange_code(&self) -> &str;

    fn taker_fee_rate(&self) -> f64;
    fn maker_fee_rate(&self) -> f64;

    /// Mid prices for every listed instrument, base-symbol keyed.
    async fn get_all_tick_price(&self) -> Result<Vec<TickPrice>>;

    async fn get_tick_price(&self, symbol: &str) -> Result<f64>;

    async fn get_klines(&self, symbol: &str, interval: &str, limit: usize) -> Result<Vec<Kline>>;

    /// Only non-zero positions are returned.
    async fn get_all_cur_positions(&self) -> Result<Vec<Position>>;

    /// Current funding rate in APY form.
    async fn get_funding_rate(&self, symbol: &str) -> Result<f64>;

    async fn get_total_margin(&self) -> Result<f64>;
    async fn get_available_margin(&self) -> Result<f64>;
    /// Maintenance-margin ratio in [0, 1].
    async fn get_cross_margin_ratio(&self) -> Result<f64>;

    /// Place an order. `price` is the reference price for MARKET orders and
    /// the limit price for LIMIT orders.
    async fn make_new_order(
        &self,
        pair: &str,
        side: Side,
        order_type: OrderType,
        amount: f64,
        price: Option<f64>,
        reduce_only: bool,
    ) -> Result<OrderReceipt>;

    async fn cancel_all_orders(&self, pair: &str) -> Result<()>;

    /// Look up a recently placed order; `None` while the venue has not yet
    /// indexed it.
    async fn get_recent_order(&self, pair: &str, order_id: Option<&str>) -> Result<Option<Order>>;

    /// Snap a quantity down to the venue's size step.
    async fn convert_size(&self, pair: &str, qty: f64) -> Result<f64>;
}

pub type VenueRef = Arc<dyn VenueAdapter>;

/// Reference price paper venues quote for every seeded symbol.
const PAPER_SEED_PRICE: f64 = 100.0;

/// Build adapters for the configured venue codes.
///
/// Only the in-crate paper venue is constructed here; live adapters are
/// registered by linking them in and extending this function.  Paper venues
/// are seeded with a flat mark for each configured symbol so the synthetic
/// depth streams have something to quote.
pub fn build_venues(codes: &[String], symbols: &[String]) -> Vec<VenueRef> {
    codes
        .iter()
        .map(|code| {
            let mut venue = PaperVenue::new(code);
            for symbol in symbols {
                venue = venue.with_mark_price(symbol, PAPER_SEED_PRICE);
            }
            Arc::new(venue) as VenueRef
        })
        .collect()
}
