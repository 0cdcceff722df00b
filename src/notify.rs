// =============================================================================
// Notifier contract — alert fan-out for risk events and trade reports
// =============================================================================
//
// Delivery sinks (messaging services) live outside this crate; the engine and
// supervisor only depend on this trait.  The default sink writes through
// tracing so a bare deployment still records every alert.
// =============================================================================

use async_trait::async_trait;
use tracing::{info, warn};

/// Alert routing channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    /// Trade confirmations and routine digests.
    Trade,
    /// Low-priority chatter (signal echoes, periodic summaries).
    Quiet,
    /// Risk alerts that demand operator attention.
    Risk,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, message: &str, channel: Channel);
}

/// Notifier that forwards everything to the tracing pipeline.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, message: &str, channel: Channel) {
        match channel {
            Channel::Risk => warn!(channel = "risk", "{message}"),
            Channel::Trade => info!(channel = "trade", "{message}"),
            Channel::Quiet => info!(channel = "quiet", "{message}"),
        }
    }
}

/// Test sink that records every message for later assertions.
#[cfg(test)]
pub struct RecordingNotifier {
    pub messages: parking_lot::Mutex<Vec<(Channel, String)>>,
}

#[cfg(test)]
impl RecordingNotifier {
    pub fn new() -> Self {
        Self {
            messages: parking_lot::Mutex::new(Vec::new()),
        }
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.messages.lock().iter().any(|(_, m)| m.contains(needle))
    }
}

#[cfg(test)]
#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, message: &str, channel: Channel) {
        self.messages.lock().push((channel, message.to_string()));
    }
}
