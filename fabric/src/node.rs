//! A fabric node: anchors, stores and overlay wired together.

use std::sync::Arc;

use n0_future::task::{self, AbortOnDropHandle};
use nested_enum_utils::common_fields;
use snafu::{Backtrace, ResultExt, Snafu};
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error_span, info};

use crate::{
    anchor::{AnchorError, AnchorSync},
    config::{Config, ConfigError},
    metrics::Metrics,
    overlay::{Overlay, handler::HandlerMap, substrate::Substrate},
    store::RecordStore,
    veritas::Veritas,
};

/// Errors starting a [`Node`].
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
#[snafu(visibility(pub(crate)))]
pub enum NodeError {
    #[snafu(display("invalid config"))]
    Config { source: ConfigError },
    #[snafu(display("failed to load trust anchors"))]
    Anchors { source: AnchorError },
}

/// A running node.
///
/// The substrate must route inbound requests to [`Node::handlers`]. Dropping the last
/// clone stops all background tasks, as does [`Node::shutdown`].
#[derive(Debug, Clone)]
pub struct Node {
    overlay: Overlay,
    anchors: AnchorSync,
    zone_store: Arc<RecordStore>,
    event_store: Arc<RecordStore>,
    metrics: Arc<Metrics>,
    cancel: CancellationToken,
    _eviction: Arc<AbortOnDropHandle<()>>,
}

impl Node {
    /// Loads the anchors and starts serving.
    ///
    /// Fails if the config is invalid or if the initial anchor load fails.
    pub async fn spawn(
        config: Config,
        substrate: Arc<dyn Substrate>,
        veritas: Arc<dyn Veritas>,
    ) -> Result<Self, NodeError> {
        config.validate().context(ConfigSnafu)?;
        let metrics = Arc::new(Metrics::default());
        let anchors = AnchorSync::create(config.anchors.clone(), veritas, metrics.clone())
            .await
            .context(AnchorsSnafu)?;

        let store = &config.store;
        let zone_store = Arc::new(RecordStore::new(
            "zones",
            store.max_size,
            store.max_age,
            metrics.clone(),
        ));
        let event_store = Arc::new(RecordStore::new(
            "events",
            store.max_size,
            store.max_age,
            metrics.clone(),
        ));

        let overlay = Overlay::new(
            substrate,
            anchors.clone(),
            zone_store.clone(),
            event_store.clone(),
            metrics.clone(),
        )
        .with_max_closest_nodes(config.put.max_closest_nodes);

        let cancel = CancellationToken::new();
        let eviction = task::spawn(
            run_eviction(
                [zone_store.clone(), event_store.clone()],
                store.eviction_interval,
                cancel.clone(),
            )
            .instrument(error_span!("store_eviction")),
        );

        if let Some(latest) = anchors.snapshot().latest() {
            info!(trust_point = latest.block.height, "node started");
        }

        Ok(Self {
            overlay,
            anchors,
            zone_store,
            event_store,
            metrics,
            cancel,
            _eviction: Arc::new(AbortOnDropHandle::new(eviction)),
        })
    }

    /// The client side of the protocol.
    pub fn overlay(&self) -> &Overlay {
        &self.overlay
    }

    /// Handlers for inbound requests.
    pub fn handlers(&self) -> Arc<HandlerMap> {
        self.overlay.handlers()
    }

    /// The trust anchors.
    pub fn anchors(&self) -> &AnchorSync {
        &self.anchors
    }

    /// Locally stored zone records.
    pub fn zone_store(&self) -> &Arc<RecordStore> {
        &self.zone_store
    }

    /// Locally stored events.
    pub fn event_store(&self) -> &Arc<RecordStore> {
        &self.event_store
    }

    /// Node metrics.
    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Stops background tasks. Calling this more than once is a no-op.
    pub fn shutdown(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        debug!("shutting down node");
        self.cancel.cancel();
        self.anchors.shutdown();
    }

    /// Whether [`Self::shutdown`] was called.
    pub fn is_shutdown(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

async fn run_eviction(
    stores: [Arc<RecordStore>; 2],
    interval: time::Duration,
    cancel: CancellationToken,
) {
    let mut tick = time::interval_at(time::Instant::now() + interval, interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = tick.tick() => {
                for store in &stores {
                    store.evict();
                }
            }
        }
    }
    debug!("eviction stopped");
}
