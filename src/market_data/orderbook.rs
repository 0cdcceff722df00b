// =============================================================================
// Order book model — L2 depth with receipt-time freshness
// =============================================================================

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::types::Side;

/// One price level of the book.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BookLevel {
    pub price: f64,
    pub size: f64,
}

impl BookLevel {
    pub fn usd_value(&self) -> f64 {
        self.price * self.size
    }
}

/// A point-in-time L2 order book for one pair.
///
/// `timestamp` is the local wall clock at receipt, not the venue's event
/// time; staleness checks therefore measure our own pipeline latency.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderBook {
    pub pair: String,
    /// Bids, best (highest) first.
    pub bids: Vec<BookLevel>,
    /// Asks, best (lowest) first.
    pub asks: Vec<BookLevel>,
    pub timestamp: SystemTime,
    /// Venue sequence number, when the feed provides one.
    pub last_update_id: u64,
}

impl OrderBook {
    /// Build a book from raw levels, restoring the ordering invariant.
    pub fn new(pair: &str, mut bids: Vec<BookLevel>, mut asks: Vec<BookLevel>, last_update_id: u64) -> Self {
        bids.sort_by(|a, b| b.price.partial_cmp(&a.price).unwrap_or(std::cmp::Ordering::Equal));
        asks.sort_by(|a, b| a.price.partial_cmp(&b.price).unwrap_or(std::cmp::Ordering::Equal));
        Self {
            pair: pair.to_string(),
            bids,
            asks,
            timestamp: SystemTime::now(),
            last_update_id,
        }
    }

    pub fn best_bid(&self) -> Option<f64> {
        self.bids.first().map(|l| l.price)
    }

    pub fn best_ask(&self) -> Option<f64> {
        self.asks.first().map(|l| l.price)
    }

    pub fn mid_price(&self) -> Option<f64> {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => Some((bid + ask) / 2.0),
            _ => None,
        }
    }

    /// Bid/ask spread as a fraction of mid.
    pub fn spread_pct(&self) -> Option<f64> {
        let bid = self.best_bid()?;
        let ask = self.best_ask()?;
        let mid = (bid + ask) / 2.0;
        if mid > 0.0 {
            Some((ask - bid) / mid)
        } else {
            None
        }
    }

    /// USD depth available to a taker on `side`, summed over the first
    /// `levels` levels (BUY consumes asks, SELL consumes bids).
    pub fn taking_liquidity_usd(&self, side: Side, levels: usize) -> f64 {
        let book_side = match side {
            Side::Buy => &self.asks,
            Side::Sell => &self.bids,
        };
        book_side.iter().take(levels).map(BookLevel::usd_value).sum()
    }

    /// Size available at the first level a taker on `side` would hit.
    pub fn first_level_qty(&self, side: Side) -> f64 {
        let book_side = match side {
            Side::Buy => &self.asks,
            Side::Sell => &self.bids,
        };
        book_side.first().map(|l| l.size).unwrap_or(0.0)
    }

    /// Reference price a taker on `side` would cross at.
    pub fn taking_price(&self, side: Side) -> Option<f64> {
        match side {
            Side::Buy => self.best_ask(),
            Side::Sell => self.best_bid(),
        }
    }

    pub fn age(&self) -> Duration {
        self.timestamp.elapsed().unwrap_or(Duration::ZERO)
    }

    pub fn is_stale(&self, max_age_sec: f64) -> bool {
        self.age().as_secs_f64() > max_age_sec
    }
}

// -----------------------------------------------------------------------------
// Book cell — single-producer / single-consumer latest-value slot
// -----------------------------------------------------------------------------

/// Latest-value holder: the depth stream writes, the engine reads.
#[derive(Clone, Default)]
pub struct BookCell {
    inner: Arc<RwLock<Option<Arc<OrderBook>>>>,
}

impl BookCell {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the held book, dropping out-of-order frames: a frame with an
    /// older sequence number than the current one is discarded.
    pub fn store(&self, book: Arc<OrderBook>) {
        let mut slot = self.inner.write();
        if let Some(cur) = slot.as_ref() {
            if book.last_update_id > 0 && book.last_update_id < cur.last_update_id {
                return;
            }
        }
        *slot = Some(book);
    }

    pub fn load(&self) -> Option<Arc<OrderBook>> {
        self.inner.read().clone()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn level(price: f64, size: f64) -> BookLevel {
        BookLevel { price, size }
    }

    fn sample_book() -> OrderBook {
        OrderBook::new(
            "BTCUSDT",
            vec![level(99.0, 1.0), level(98.0, 2.0), level(100.0, 0.5)],
            vec![level(101.0, 1.5), level(102.0, 3.0), level(100.5, 0.2)],
            7,
        )
    }

    #[test]
    fn ordering_invariant_restored() {
        let book = sample_book();
        assert_eq!(book.best_bid(), Some(100.0));
        assert_eq!(book.best_ask(), Some(100.5));
    }

    #[test]
    fn mid_sits_between_bid_and_ask() {
        let book = sample_book();
        let mid = book.mid_price().unwrap();
        assert!(book.best_bid().unwrap() <= mid);
        assert!(mid <= book.best_ask().unwrap());
        assert!(book.spread_pct().unwrap() >= 0.0);
    }

    #[test]
    fn taking_liquidity_sums_price_times_size() {
        let book = sample_book();
        // BUY takes asks: 100.5*0.2 + 101*1.5 = 171.6
        let liq = book.taking_liquidity_usd(Side::Buy, 2);
        assert!((liq - (100.5 * 0.2 + 101.0 * 1.5)).abs() < 1e-9);
        // SELL takes bids: first level only.
        let liq = book.taking_liquidity_usd(Side::Sell, 1);
        assert!((liq - 100.0 * 0.5).abs() < 1e-9);
    }

    #[test]
    fn staleness_tracks_receipt_clock() {
        let mut book = sample_book();
        assert!(!book.is_stale(1.0));
        book.timestamp = SystemTime::now() - Duration::from_secs(2);
        assert!(book.is_stale(1.0));
    }

    #[test]
    fn cell_drops_out_of_order_frames() {
        let cell = BookCell::new();
        let newer = Arc::new(sample_book());
        cell.store(newer.clone());

        let mut older = sample_book();
        older.last_update_id = 3;
        older.bids = vec![level(1.0, 1.0)];
        cell.store(Arc::new(older));

        assert_eq!(cell.load().unwrap().last_update_id, 7);
    }

    #[test]
    fn first_level_qty_by_side() {
        let book = sample_book();
        assert!((book.first_level_qty(Side::Buy) - 0.2).abs() < 1e-12);
        assert!((book.first_level_qty(Side::Sell) - 0.5).abs() < 1e-12);
    }
}
