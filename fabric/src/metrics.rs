//! Metrics support for the node.

use iroh_metrics::{Counter, MetricsGroup};

/// Metrics tracked by a fabric node.
#[derive(Debug, Default, MetricsGroup)]
#[metrics(name = "fabric")]
pub struct Metrics {
    /*
     * Inbound writes
     */
    /// Zone records accepted into the local store.
    #[metrics(help = "Number of zone puts accepted.")]
    pub zone_puts_accepted: Counter,
    /// Zone records rejected by verification or conflict resolution.
    #[metrics(help = "Number of zone puts rejected.")]
    pub zone_puts_rejected: Counter,
    /// Event records accepted into the local store.
    #[metrics(help = "Number of event puts accepted.")]
    pub event_puts_accepted: Counter,
    /// Event records rejected by verification or conflict resolution.
    #[metrics(help = "Number of event puts rejected.")]
    pub event_puts_rejected: Counter,
    /// Requests dropped without a reply because they could not be decoded.
    #[metrics(help = "Number of inbound requests ignored as malformed.")]
    pub requests_ignored: Counter,

    /*
     * Inbound reads
     */
    /// GET requests answered with a record.
    pub gets_served: Counter,
    /// GET requests answered with nothing.
    pub gets_empty: Counter,

    /*
     * Store
     */
    /// Records dropped by the age or size bound.
    #[metrics(help = "Number of records evicted from the stores.")]
    pub records_evicted: Counter,

    /*
     * Anchors
     */
    /// Successful anchor set replacements.
    pub anchor_refreshes: Counter,
    /// Failed anchor loads, including retries.
    pub anchor_refresh_failures: Counter,

    /*
     * Client side
     */
    /// Query replies that did not decode.
    pub replies_malformed: Counter,
    /// Query replies that decoded but did not verify.
    pub replies_unverified: Counter,
    /// Records written back to outdated peers.
    pub repairs_sent: Counter,
    /// Peers that acknowledged a put.
    pub put_acks: Counter,
    /// Peers that rejected a put or failed to answer.
    pub put_rejections: Counter,
}

#[cfg(all(test, feature = "metrics"))]
mod tests {
    use super::*;

    #[test]
    fn counters_count() {
        let metrics = Metrics::default();
        metrics.put_acks.inc();
        metrics.put_acks.inc_by(2);
        metrics.anchor_refresh_failures.inc();
        assert_eq!(metrics.put_acks.get(), 3);
        assert_eq!(metrics.anchor_refresh_failures.get(), 1);
        assert_eq!(metrics.put_rejections.get(), 0);
    }
}
