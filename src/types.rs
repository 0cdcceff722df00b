// =============================================================================
// Shared types used across the Meridian hedging engine
// =============================================================================

use serde::{Deserialize, Serialize};

/// Order / position direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// The opposite direction (used for hedge legs and reduce orders).
    pub fn opposite(self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }

    /// Sign convention: BUY = +1, SELL = -1.
    pub fn sign(self) -> f64 {
        match self {
            Self::Buy => 1.0,
            Self::Sell => -1.0,
        }
    }

    /// Position side implied by a signed position amount.
    ///
    /// Returns `None` for a flat (zero) position.
    pub fn from_amount(amount: f64) -> Option<Self> {
        if amount > 0.0 {
            Some(Self::Buy)
        } else if amount < 0.0 {
            Some(Self::Sell)
        } else {
            None
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
        }
    }
}

/// Venue-side order status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
    Expired,
    Rejected,
}

impl OrderStatus {
    /// Whether the order will never fill further.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Filled | Self::Canceled | Self::Expired | Self::Rejected
        )
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::New => "NEW",
            Self::PartiallyFilled => "PARTIALLY_FILLED",
            Self::Filled => "FILLED",
            Self::Canceled => "CANCELED",
            Self::Expired => "EXPIRED",
            Self::Rejected => "REJECTED",
        };
        write!(f, "{s}")
    }
}

/// Order type accepted by the venue contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    Market,
    Limit,
}

impl std::fmt::Display for OrderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Market => write!(f, "MARKET"),
            Self::Limit => write!(f, "LIMIT"),
        }
    }
}

/// Acknowledgement returned by `make_new_order`.
///
/// Some venues report the fill average inline; the engine skips fill
/// polling for those.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderReceipt {
    pub order_id: String,
    /// Average fill price, when the venue reports it synchronously.
    pub avg_price: Option<f64>,
}

/// Order detail returned by `get_recent_order`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub order_id: String,
    pub pair: String,
    pub side: Side,
    pub status: OrderStatus,
    pub avg_price: f64,
    pub executed_qty: f64,
    pub orig_qty: f64,
}

/// One K-line bar (open-time keyed).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Kline {
    pub open_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
}

/// Mid price for one instrument, base-symbol keyed (no USDT/USDC suffix).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TickPrice {
    pub name: String,
    pub mid_price: f64,
}

/// A single perpetual-futures position as reported by a venue.
///
/// Invariant: `sign(amount) == sign(notional)`; `position_side()` derives
/// from the amount sign.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub venue_code: String,
    /// Full trading pair, e.g. "BTCUSDT".
    pub pair: String,
    /// Base symbol without the quote suffix, e.g. "BTC".
    pub symbol: String,
    /// Signed position size (positive = long).
    pub amount: f64,
    pub entry_price: f64,
    /// Signed notional value in USD.
    pub notional: f64,
    pub unrealized_pnl: f64,
    /// Funding fees accrued while the position was open.
    pub funding_fee: f64,
    pub mark_price: f64,
    /// Auto-deleverage rank (0-5); high values mean elevated liquidation risk.
    pub adl: u8,
    pub liquidation_price: f64,
    /// Current funding rate (APY), attached by the aggregator.
    pub funding_rate: Option<f64>,
}

impl Position {
    pub fn position_side(&self) -> Option<Side> {
        Side::from_amount(self.amount)
    }

    /// Unrealized PnL as a fraction of the position notional.
    pub fn profit_rate(&self) -> f64 {
        if self.notional != 0.0 {
            self.unrealized_pnl / self.notional.abs()
        } else {
            0.0
        }
    }
}

/// Strip the quote suffix from a pair name: "BTCUSDT" -> "BTC".
pub fn base_symbol(pair: &str) -> String {
    pair.to_uppercase().replace("USDT", "").replace("USDC", "")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn side_from_amount_sign() {
        assert_eq!(Side::from_amount(0.5), Some(Side::Buy));
        assert_eq!(Side::from_amount(-0.5), Some(Side::Sell));
        assert_eq!(Side::from_amount(0.0), None);
    }

    #[test]
    fn side_opposite_roundtrip() {
        assert_eq!(Side::Buy.opposite(), Side::Sell);
        assert_eq!(Side::Sell.opposite().opposite(), Side::Sell);
    }

    #[test]
    fn base_symbol_strips_quote() {
        assert_eq!(base_symbol("BTCUSDT"), "BTC");
        assert_eq!(base_symbol("ethusdc"), "ETH");
        assert_eq!(base_symbol("SOL"), "SOL");
    }

    #[test]
    fn terminal_statuses() {
        assert!(OrderStatus::Filled.is_terminal());
        assert!(OrderStatus::Rejected.is_terminal());
        assert!(!OrderStatus::New.is_terminal());
        assert!(!OrderStatus::PartiallyFilled.is_terminal());
    }
}
