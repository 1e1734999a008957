//! Metrics for the want manager and the gossip handlers.

use iroh_metrics::{Counter, Gauge, MetricsGroup};

/// Metrics of the blob want manager.
#[derive(Debug, Default, MetricsGroup)]
#[metrics(name = "wants")]
pub struct WantMetrics {
    /// Wants currently outstanding, either waiting for a source or being fetched.
    pub outstanding: Gauge,
    /// Want manager events: wants issued, haves received, blobs resolved and blobs dropped.
    pub events: Counter,
    /// New wants registered.
    pub wants_issued: Counter,
    /// Have announcements received from peers.
    pub haves_received: Counter,
    /// Blobs verified and stored.
    pub blobs_resolved: Counter,
    /// Wants dropped because the blob exceeds the maximum size.
    pub blobs_dropped: Counter,
    /// Received content that did not match its hash.
    pub verification_failures: Counter,
    /// Wants given up on, after repeated verification failures or at shutdown.
    pub wants_expired: Counter,
}

/// Metrics of feed replication and the gossip calls.
#[derive(Debug, Default, MetricsGroup)]
#[metrics(name = "gossip")]
pub struct GossipMetrics {
    /// Cascade steps that completed.
    pub feeds_fetched: Counter,
    /// Cascade steps the remote refused.
    pub feeds_skipped: Counter,
    /// Cascades stopped by a failing step.
    pub cascade_failures: Counter,
    /// Feed entries appended to the local store.
    pub messages_appended: Counter,
    /// Inbound calls handled.
    pub calls_handled: Counter,
    /// Inbound calls that ended with a failure.
    pub calls_failed: Counter,
    /// Inbound calls to unknown methods.
    pub unknown_calls: Counter,
}
