// =============================================================================
// Depth stream — push-model live L2 order books over WebSocket
// =============================================================================
//
// The stream owns the connection; consumers receive books through a callback
// registered per pair.  Books are stamped with the local receipt wall clock,
// and frame ordering is enforced downstream by `BookCell` (older sequence
// numbers are dropped, never delivered as fresher data).
//
// Runs until `stop()`; connection drops reconnect after a 5 s delay.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tracing::{error, info, warn};

use super::orderbook::{BookLevel, OrderBook};

/// Callback invoked with every parsed book.
pub type BookCallback = Arc<dyn Fn(Arc<OrderBook>) + Send + Sync>;

/// Push-model depth stream: one callback per subscribed pair.
#[async_trait]
pub trait OrderBookStream: Send + Sync {
    /// Register a callback for `pair`. Must be called before `start`.
    fn subscribe(&self, pair: &str, callback: BookCallback);

    /// Open the connections and begin delivering books.
    async fn start(&self) -> Result<()>;

    /// Tear down all connections. Idempotent.
    async fn stop(&self);
}

// -----------------------------------------------------------------------------
// WebSocket implementation
// -----------------------------------------------------------------------------

/// Depth stream over a partial-depth WebSocket feed.
///
/// `url_template` contains a `{pair}` placeholder substituted with the
/// lower-cased pair, e.g.
/// `wss://fstream.example.com/ws/{pair}@depth20@100ms`.
pub struct WsDepthStream {
    url_template: String,
    subscriptions: RwLock<HashMap<String, BookCallback>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    running: Arc<AtomicBool>,
}

impl WsDepthStream {
    pub fn new(url_template: impl Into<String>) -> Self {
        Self {
            url_template: url_template.into(),
            subscriptions: RwLock::new(HashMap::new()),
            tasks: Mutex::new(Vec::new()),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    fn url_for(&self, pair: &str) -> String {
        self.url_template.replace("{pair}", &pair.to_lowercase())
    }
}

#[async_trait]
impl OrderBookStream for WsDepthStream {
    fn subscribe(&self, pair: &str, callback: BookCallback) {
        self.subscriptions.write().insert(pair.to_string(), callback);
    }

    async fn start(&self) -> Result<()> {
        self.running.store(true, Ordering::SeqCst);

        let subs: Vec<(String, BookCallback)> = self
            .subscriptions
            .read()
            .iter()
            .map(|(pair, cb)| (pair.clone(), cb.clone()))
            .collect();

        anyhow::ensure!(!subs.is_empty(), "depth stream started with no subscriptions");

        let mut tasks = self.tasks.lock();
        for (pair, callback) in subs {
            let url = self.url_for(&pair);
            let running = self.running.clone();
            tasks.push(tokio::spawn(async move {
                while running.load(Ordering::SeqCst) {
                    if let Err(e) = run_depth_connection(&pair, &url, &callback, &running).await {
                        error!(pair = %pair, error = %e, "depth stream error — reconnecting in 5s");
                    }
                    if !running.load(Ordering::SeqCst) {
                        break;
                    }
                    tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                }
            }));
        }
        Ok(())
    }

    async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            task.abort();
        }
    }
}

/// One connection lifetime: connect, read frames, deliver books.
async fn run_depth_connection(
    pair: &str,
    url: &str,
    callback: &BookCallback,
    running: &AtomicBool,
) -> Result<()> {
    info!(url = %url, pair = %pair, "connecting to depth WebSocket");

    let (ws_stream, _response) = connect_async(url)
        .await
        .context("failed to connect to depth WebSocket")?;

    info!(pair = %pair, "depth WebSocket connected");
    let (_write, mut read) = ws_stream.split();

    loop {
        if !running.load(Ordering::SeqCst) {
            return Ok(());
        }
        match read.next().await {
            Some(Ok(msg)) => {
                if let tokio_tungstenite::tungstenite::Message::Text(text) = msg {
                    match parse_depth_message(pair, &text) {
                        Ok(book) => callback(Arc::new(book)),
                        Err(e) => warn!(pair = %pair, error = %e, "failed to parse depth message"),
                    }
                }
            }
            Some(Err(e)) => {
                error!(pair = %pair, error = %e, "depth WebSocket read error");
                return Err(e.into());
            }
            None => {
                warn!(pair = %pair, "depth WebSocket stream ended");
                return Ok(());
            }
        }
    }
}

/// Parse a partial-depth message.
///
/// Expected shape:
/// ```json
/// {
///   "lastUpdateId": 12345,
///   "bids": [["37000.00", "1.5"], ...],
///   "asks": [["37001.00", "1.2"], ...]
/// }
/// ```
fn parse_depth_message(pair: &str, text: &str) -> Result<OrderBook> {
    let root: serde_json::Value = serde_json::from_str(text).context("failed to parse depth JSON")?;

    let last_update_id = root["lastUpdateId"].as_u64().unwrap_or(0);

    let bids = parse_levels(root["bids"].as_array().context("missing field bids")?)?;
    let asks = parse_levels(root["asks"].as_array().context("missing field asks")?)?;

    Ok(OrderBook::new(pair, bids, asks, last_update_id))
}

fn parse_levels(raw: &[serde_json::Value]) -> Result<Vec<BookLevel>> {
    let mut levels = Vec::with_capacity(raw.len());
    for entry in raw {
        let price = parse_number(entry.get(0).context("level missing price")?)?;
        let size = parse_number(entry.get(1).context("level missing size")?)?;
        levels.push(BookLevel { price, size });
    }
    Ok(levels)
}

/// Depth feeds encode numbers as strings; tolerate both.
fn parse_number(val: &serde_json::Value) -> Result<f64> {
    if let Some(s) = val.as_str() {
        s.parse::<f64>()
            .with_context(|| format!("failed to parse '{s}' as f64"))
    } else if let Some(n) = val.as_f64() {
        Ok(n)
    } else {
        anyhow::bail!("expected string or number, got: {val}")
    }
}

// -----------------------------------------------------------------------------
// Synthetic stream
// -----------------------------------------------------------------------------

/// Depth stream synthesised from a venue's tick price.
///
/// Stands in for venues without a public depth feed (the paper venue, thin
/// test deployments): polls the mid price on a short interval and emits a
/// narrow ten-level book around it.
pub struct SyntheticBookStream {
    venue: crate::venue::VenueRef,
    subscriptions: RwLock<HashMap<String, BookCallback>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    running: Arc<AtomicBool>,
    sequence: Arc<std::sync::atomic::AtomicU64>,
}

/// Half-spread of the synthesised book.
const SYNTHETIC_HALF_SPREAD: f64 = 0.0001;
/// USD value placed on each synthesised level.
const SYNTHETIC_LEVEL_USD: f64 = 5_000.0;
const SYNTHETIC_LEVELS: usize = 10;

impl SyntheticBookStream {
    pub fn new(venue: crate::venue::VenueRef) -> Self {
        Self {
            venue,
            subscriptions: RwLock::new(HashMap::new()),
            tasks: Mutex::new(Vec::new()),
            running: Arc::new(AtomicBool::new(false)),
            sequence: Arc::new(std::sync::atomic::AtomicU64::new(1)),
        }
    }

    fn build_book(pair: &str, mid: f64, sequence: u64) -> OrderBook {
        let size = SYNTHETIC_LEVEL_USD / mid;
        let mut bids = Vec::with_capacity(SYNTHETIC_LEVELS);
        let mut asks = Vec::with_capacity(SYNTHETIC_LEVELS);
        for level in 0..SYNTHETIC_LEVELS {
            let offset = SYNTHETIC_HALF_SPREAD * (level + 1) as f64;
            bids.push(BookLevel {
                price: mid * (1.0 - offset),
                size,
            });
            asks.push(BookLevel {
                price: mid * (1.0 + offset),
                size,
            });
        }
        OrderBook::new(pair, bids, asks, sequence)
    }
}

#[async_trait]
impl OrderBookStream for SyntheticBookStream {
    fn subscribe(&self, pair: &str, callback: BookCallback) {
        self.subscriptions.write().insert(pair.to_string(), callback);
    }

    async fn start(&self) -> Result<()> {
        self.running.store(true, Ordering::SeqCst);

        let subs: Vec<(String, BookCallback)> = self
            .subscriptions
            .read()
            .iter()
            .map(|(pair, cb)| (pair.clone(), cb.clone()))
            .collect();
        anyhow::ensure!(!subs.is_empty(), "synthetic stream started with no subscriptions");

        let mut tasks = self.tasks.lock();
        for (pair, callback) in subs {
            let venue = self.venue.clone();
            let running = self.running.clone();
            let sequence = self.sequence.clone();
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(std::time::Duration::from_millis(100));
                while running.load(Ordering::SeqCst) {
                    ticker.tick().await;
                    match venue.get_tick_price(&pair).await {
                        Ok(mid) if mid > 0.0 => {
                            let seq = sequence.fetch_add(1, Ordering::Relaxed);
                            callback(Arc::new(SyntheticBookStream::build_book(&pair, mid, seq)));
                        }
                        Ok(_) => {}
                        Err(e) => {
                            warn!(pair = %pair, error = %e, "synthetic book: no tick price");
                            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                        }
                    }
                }
            }));
        }
        Ok(())
    }

    async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            task.abort();
        }
    }
}

// -----------------------------------------------------------------------------
// Test double
// -----------------------------------------------------------------------------

/// Stream stub for engine tests: books are injected directly into cells.
#[cfg(test)]
pub struct NullStream;

#[cfg(test)]
#[async_trait]
impl OrderBookStream for NullStream {
    fn subscribe(&self, _pair: &str, _callback: BookCallback) {}

    async fn start(&self) -> Result<()> {
        Ok(())
    }

    async fn stop(&self) {}
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_string_encoded_levels() {
        let text = r#"{
            "lastUpdateId": 42,
            "bids": [["37000.00", "1.5"], ["36999.50", "2.0"]],
            "asks": [["37001.00", "1.2"]]
        }"#;
        let book = parse_depth_message("BTCUSDT", text).unwrap();
        assert_eq!(book.last_update_id, 42);
        assert_eq!(book.best_bid(), Some(37000.0));
        assert_eq!(book.best_ask(), Some(37001.0));
        assert!((book.bids[1].size - 2.0).abs() < 1e-12);
    }

    #[test]
    fn rejects_levels_without_size() {
        let text = r#"{"lastUpdateId": 1, "bids": [["37000.00"]], "asks": []}"#;
        assert!(parse_depth_message("BTCUSDT", text).is_err());
    }

    #[test]
    fn url_template_substitution() {
        let stream = WsDepthStream::new("wss://x.test/ws/{pair}@depth20@100ms");
        assert_eq!(stream.url_for("BTCUSDT"), "wss://x.test/ws/btcusdt@depth20@100ms");
    }

    #[test]
    fn synthetic_book_brackets_the_mid() {
        let book = SyntheticBookStream::build_book("BTCUSDT", 100.0, 3);
        assert_eq!(book.bids.len(), 10);
        assert_eq!(book.asks.len(), 10);
        let mid = book.mid_price().unwrap();
        assert!((mid - 100.0).abs() < 1e-9);
        assert!(book.best_bid().unwrap() < book.best_ask().unwrap());
        assert_eq!(book.last_update_id, 3);
    }
}
