//! Default values used by the node.

use std::time::Duration;

/// Bootstrap nodes of the public network, as `host:port` with an optional `ip@` hint.
pub const BOOTSTRAP_NODES: [&str; 3] = [
    "107.152.45.120@fabric.buffrr.dev:22253",
    "100.28.101.97:22253",
    "44.208.222.14:22253",
];

/// Anchor source used when nothing else is configured.
pub const DEFAULT_REMOTE_ANCHORS: &str = "http://127.0.0.1:7225/root-anchors.json";

/// Environment variable naming a local anchor file.
pub const ENV_LOCAL_ANCHORS: &str = "FABRIC_LOCAL_ANCHORS";
/// Environment variable with comma separated anchor URLs.
pub const ENV_REMOTE_ANCHORS: &str = "FABRIC_REMOTE_ANCHORS";

/// How often anchors are re-fetched or re-read.
pub const ANCHOR_CHECK_INTERVAL: Duration = Duration::from_secs(10 * 60);
/// Delay between failed remote anchor fetches.
pub const ANCHOR_RETRY_DELAY: Duration = Duration::from_secs(5);
/// How often a local anchor file is polled for changes.
pub const ANCHOR_WATCH_INTERVAL: Duration = Duration::from_secs(1);

/// Position, counted from the oldest anchor, of the anchor whose height is the
/// staleness threshold. Applies once more anchors than this are retained.
pub const STALENESS_DEPTH: usize = 9;

/// Maximum number of records per store.
pub const STORE_MAX_SIZE: usize = 32768;
/// Age after which a record is dropped unless re-put.
pub const STORE_MAX_AGE: Duration = Duration::from_secs(48 * 60 * 60);
/// How often expired records are evicted.
pub const STORE_EVICTION_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// How far in the future an event's `created_at` may be.
pub const EVENT_MAX_FUTURE: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Number of closest nodes a put is sent to.
pub const MAX_CLOSEST_NODES: usize = 20;
