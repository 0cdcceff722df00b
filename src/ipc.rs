// =============================================================================
// Shared IPC — one snapshot slot and one stop flag per engine child
// =============================================================================
//
// Strict one-writer / one-reader discipline: the supervisor publishes into a
// child's slot, the child only reads (plus its own post-trade refresh).  A
// stale slot degrades gracefully — the reader warns and continues, it never
// fails open.  There is no cross-child communication.
// =============================================================================

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::sync::Notify;
use tracing::warn;

use crate::exchange_info::CombinedSnapshot;

/// A snapshot older than this is risk-unknown territory.
pub const SNAPSHOT_STALE_AFTER: Duration = Duration::from_secs(31 * 60);

struct SlotEntry {
    snapshot: Arc<CombinedSnapshot>,
    published_at: Instant,
}

/// Latest-value snapshot slot.
#[derive(Clone, Default)]
pub struct SnapshotSlot {
    inner: Arc<RwLock<Option<SlotEntry>>>,
}

impl SnapshotSlot {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(None)),
        }
    }

    /// Atomically replace the held snapshot (pointer swap).
    pub fn publish(&self, snapshot: Arc<CombinedSnapshot>) {
        *self.inner.write() = Some(SlotEntry {
            snapshot,
            published_at: Instant::now(),
        });
    }

    pub fn read(&self) -> Option<Arc<CombinedSnapshot>> {
        self.inner.read().as_ref().map(|e| e.snapshot.clone())
    }

    pub fn age(&self) -> Option<Duration> {
        self.inner.read().as_ref().map(|e| e.published_at.elapsed())
    }

    /// Read with the staleness bound applied: a snapshot past the 31-minute
    /// bound is still returned, but the caller is warned that risk state is
    /// unknown.
    pub fn read_checked(&self, label: &str) -> Option<Arc<CombinedSnapshot>> {
        let guard = self.inner.read();
        let entry = guard.as_ref()?;
        if entry.published_at.elapsed() > SNAPSHOT_STALE_AFTER {
            warn!(
                label,
                age_sec = entry.published_at.elapsed().as_secs(),
                "risk snapshot stale — risk unknown, continuing"
            );
        }
        Some(entry.snapshot.clone())
    }
}

// -----------------------------------------------------------------------------
// Stop flag
// -----------------------------------------------------------------------------

/// Cooperative stop signal with a single consumer per flag.
///
/// `trigger` is idempotent; `sleep` returns early when the flag fires so
/// long back-offs never delay shutdown.
#[derive(Clone, Default)]
pub struct StopFlag {
    stopped: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl StopFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        // Single consumer: the stored permit catches a not-yet-parked reader.
        self.notify.notify_one();
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Sleep for `duration` or until the flag fires.
    ///
    /// Returns `true` when the flag is set (before or during the sleep).
    pub async fn sleep(&self, duration: Duration) -> bool {
        if self.is_stopped() {
            return true;
        }
        tokio::select! {
            _ = self.notify.notified() => true,
            _ = tokio::time::sleep(duration) => self.is_stopped(),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange_info::CombinedSnapshot;

    fn empty_snapshot() -> Arc<CombinedSnapshot> {
        Arc::new(CombinedSnapshot::build(vec![], vec![], 0.0))
    }

    #[test]
    fn slot_swaps_atomically() {
        let slot = SnapshotSlot::new();
        assert!(slot.read().is_none());
        slot.publish(empty_snapshot());
        assert!(slot.read().is_some());
        assert!(slot.age().unwrap() < Duration::from_secs(1));
        assert!(slot.read_checked("test").is_some());
    }

    #[tokio::test]
    async fn stop_flag_cuts_sleep_short() {
        let flag = StopFlag::new();
        let waiter = flag.clone();
        let handle = tokio::spawn(async move { waiter.sleep(Duration::from_secs(30)).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        flag.trigger();
        let stopped = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("sleep did not return after trigger")
            .unwrap();
        assert!(stopped);
    }

    #[tokio::test]
    async fn trigger_before_sleep_returns_immediately() {
        let flag = StopFlag::new();
        flag.trigger();
        flag.trigger(); // idempotent
        assert!(flag.sleep(Duration::from_secs(30)).await);
        assert!(flag.is_stopped());
    }
}
