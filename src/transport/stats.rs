//! Byte-level I/O statistics with a forwardable tap.
//!
//! Every transport owns a [`StatsTracker`]. The authoritative-client
//! election installs a forward target on exactly one client tracker per
//! session, so the app-side tracker sees the bytes of the peer whose
//! view of the world is canonical.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Counts the bytes crossing one transport, mirrored to an optional
/// forward target.
#[derive(Debug, Default)]
pub struct StatsTracker {
    incoming: AtomicU64,
    outgoing: AtomicU64,
    // Forward targets never chain in practice; the app tracker has none.
    forward: Mutex<Option<Arc<StatsTracker>>>,
}

impl StatsTracker {
    /// Record bytes received from the peer.
    pub fn record_incoming(&self, bytes: u64) {
        self.incoming.fetch_add(bytes, Ordering::Relaxed);
        if let Some(target) = self.forward_target() {
            target.record_incoming(bytes);
        }
    }

    /// Record bytes sent to the peer.
    pub fn record_outgoing(&self, bytes: u64) {
        self.outgoing.fetch_add(bytes, Ordering::Relaxed);
        if let Some(target) = self.forward_target() {
            target.record_outgoing(bytes);
        }
    }

    /// Total bytes received so far.
    pub fn incoming_bytes(&self) -> u64 {
        self.incoming.load(Ordering::Relaxed)
    }

    /// Total bytes sent so far.
    pub fn outgoing_bytes(&self) -> u64 {
        self.outgoing.load(Ordering::Relaxed)
    }

    /// Install (or with `None`, remove) the tracker that mirrors every
    /// byte recorded here from now on.
    pub fn forward_to(&self, target: Option<Arc<StatsTracker>>) {
        if let Ok(mut slot) = self.forward.lock() {
            *slot = target;
        }
    }

    fn forward_target(&self) -> Option<Arc<StatsTracker>> {
        self.forward.lock().ok().and_then(|slot| slot.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let stats = StatsTracker::default();
        stats.record_incoming(10);
        stats.record_incoming(5);
        stats.record_outgoing(7);
        assert_eq!(stats.incoming_bytes(), 15);
        assert_eq!(stats.outgoing_bytes(), 7);
    }

    #[test]
    fn forwarding_mirrors_both_directions() {
        let upstream = Arc::new(StatsTracker::default());
        let local = StatsTracker::default();

        local.record_incoming(3);
        assert_eq!(upstream.incoming_bytes(), 0);

        local.forward_to(Some(upstream.clone()));
        local.record_incoming(4);
        local.record_outgoing(6);
        assert_eq!(upstream.incoming_bytes(), 4);
        assert_eq!(upstream.outgoing_bytes(), 6);

        local.forward_to(None);
        local.record_outgoing(100);
        assert_eq!(upstream.outgoing_bytes(), 6);
    }
}
