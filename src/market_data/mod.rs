// =============================================================================
// Market data — live order books and the depth stream contract
// =============================================================================

pub mod depth_stream;
pub mod orderbook;

pub use depth_stream::{BookCallback, OrderBookStream, SyntheticBookStream, WsDepthStream};
pub use orderbook::{BookCell, BookLevel, OrderBook};
