//! The distributed store protocol.
//!
//! The [`Overlay`] composes a [`Substrate`] with the two record families. As a client it
//! runs GET (fan-out query, per-reply verification, best-of selection), PUT (local
//! verification, closest-node lookup, one request per node) and explicit repair of
//! outdated peers. As a server it exposes a [`HandlerMap`] that the substrate feeds
//! inbound requests into.

use std::sync::Arc;

use bytes::Bytes;
use fabric_base::{
    Command, ErrorCode, Target, TargetError,
    codec::{self, PutRequest, StoredRecord},
    event::{Event, KindClass},
};
use n0_future::{StreamExt, join_all};
use nested_enum_utils::common_fields;
use snafu::{Backtrace, ResultExt, Snafu};
use tracing::{debug, trace};

pub mod handler;
pub mod substrate;

use self::{
    handler::{HandlerMap, StoreHandler},
    substrate::{PeerAddr, Query, Request, RequestError, Substrate, Token},
};
use crate::{
    anchor::AnchorSync,
    defaults,
    metrics::Metrics,
    store::RecordStore,
    verify::{Events, RecordFamily, Verified, VerifyError, Zones},
};

/// Options for a GET.
#[derive(Debug, Clone, Copy)]
pub struct GetOptions {
    /// Ignore records with a lower sequence number.
    pub seq: u64,
    /// Drain the whole query for the best record instead of returning the first valid one.
    pub latest: bool,
}

impl Default for GetOptions {
    fn default() -> Self {
        Self {
            seq: 0,
            latest: true,
        }
    }
}

/// A node that answered a query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryPeer {
    /// The node.
    pub from: PeerAddr,
    /// Token for writing to the node.
    pub token: Option<Token>,
    /// Sequence of the record the node returned, if any.
    pub seq: Option<u64>,
}

/// Result of a successful GET.
#[derive(Debug, Clone)]
pub struct Found {
    /// The queried target.
    pub target: Target,
    /// The best verified record.
    pub verified: Verified,
    /// The node that returned it.
    pub from: QueryPeer,
    /// Every other node that answered.
    pub closest_nodes: Vec<QueryPeer>,
    put_command: Command,
}

impl Found {
    /// The best verified record.
    pub fn record(&self) -> &StoredRecord {
        &self.verified.record
    }

    /// Nodes that returned nothing or an older record, and can be written to.
    pub fn outdated_peers(&self) -> impl Iterator<Item = &QueryPeer> {
        let seq = self.record().seq;
        self.closest_nodes
            .iter()
            .filter(move |peer| peer.token.is_some() && peer.seq.is_none_or(|s| s < seq))
    }
}

/// A node refused or failed to take a record.
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
#[snafu(visibility(pub(crate)))]
pub enum PeerError {
    #[snafu(display("peer handed out no token"))]
    NoToken {},
    #[snafu(transparent)]
    Request { source: RequestError },
    #[snafu(display("peer refused the record: {code}"))]
    Refused { code: ErrorCode },
    #[snafu(display("peer replied with unknown error code {code}"))]
    UnknownCode { code: u64 },
}

impl PeerError {
    /// The error code the peer replied with, if it replied with a known one.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            Self::Refused { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// A PUT failed as a whole.
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
#[snafu(visibility(pub(crate)))]
pub enum PutError {
    #[snafu(transparent)]
    Target { source: TargetError },
    #[snafu(display("record failed local verification"))]
    Invalid { source: VerifyError },
    #[snafu(display("no nodes close to the target were found"))]
    NoPeers {},
    #[snafu(display("all {} contacted nodes rejected the record", rejected.len()))]
    Rejected { rejected: Vec<(PeerAddr, PeerError)> },
}

/// Result of a successful PUT.
#[derive(Debug)]
pub struct PutOutcome {
    /// Where the record was stored.
    pub target: Target,
    /// Sequence number, or `created_at` for events.
    pub seq: u64,
    /// The record's signature.
    pub signature: [u8; 64],
    /// Trust point the proof verified at, for zone records.
    pub trust_point: Option<u32>,
    /// Nodes that stored the record.
    pub acked: Vec<PeerAddr>,
    /// Nodes that refused it or did not answer.
    pub rejected: Vec<(PeerAddr, PeerError)>,
}

/// Client and server of the record store protocol.
#[derive(Debug, Clone)]
pub struct Overlay {
    substrate: Arc<dyn Substrate>,
    zones: Zones,
    events: Events,
    handlers: Arc<HandlerMap>,
    metrics: Arc<Metrics>,
    max_closest_nodes: usize,
}

impl Overlay {
    /// Creates an overlay serving `zone_store` and `event_store`.
    pub fn new(
        substrate: Arc<dyn Substrate>,
        anchors: AnchorSync,
        zone_store: Arc<RecordStore>,
        event_store: Arc<RecordStore>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let zones = Zones::new(anchors.clone());
        let events = Events::new(anchors);

        let mut handlers = HandlerMap::default();
        let zone_handler = Arc::new(StoreHandler::new(
            zones.clone(),
            zone_store,
            metrics.clone(),
        ));
        handlers.insert(Zones::PUT, zone_handler.clone());
        handlers.insert(Zones::GET, zone_handler);
        let event_handler = Arc::new(StoreHandler::new(
            events.clone(),
            event_store,
            metrics.clone(),
        ));
        handlers.insert(Events::PUT, event_handler.clone());
        handlers.insert(Events::GET, event_handler);

        Self {
            substrate,
            zones,
            events,
            handlers: Arc::new(handlers),
            metrics,
            max_closest_nodes: defaults::MAX_CLOSEST_NODES,
        }
    }

    /// Sets how many of the closest nodes a PUT is sent to.
    pub fn with_max_closest_nodes(mut self, max: usize) -> Self {
        self.max_closest_nodes = max;
        self
    }

    /// Handlers for inbound requests, to be registered with the substrate.
    pub fn handlers(&self) -> Arc<HandlerMap> {
        self.handlers.clone()
    }

    /// Fetches the zone of `space`, e.g. `@example`.
    pub async fn zone_get(
        &self,
        space: &str,
        opts: GetOptions,
    ) -> Result<Option<Found>, TargetError> {
        let target = Target::for_space(space)?;
        Ok(self.zone_get_target(target, opts).await)
    }

    /// Fetches the zone record stored under `target`.
    pub async fn zone_get_target(&self, target: Target, opts: GetOptions) -> Option<Found> {
        self.get_in(&self.zones, target, opts).await
    }

    /// Publishes a signed zone record for `space`.
    pub async fn zone_put(&self, space: &str, req: PutRequest) -> Result<PutOutcome, PutError> {
        let target = Target::for_space(space)?;
        self.zone_put_target(target, req).await
    }

    /// Publishes a signed zone record under `target`.
    pub async fn zone_put_target(
        &self,
        target: Target,
        req: PutRequest,
    ) -> Result<PutOutcome, PutError> {
        self.put_in(&self.zones, target, req).await
    }

    /// Fetches the event in the slot `(public_key, kind, d)`.
    ///
    /// `d` is ignored for replaceable kinds.
    pub async fn event_get(
        &self,
        public_key: &[u8; 32],
        kind: u32,
        d: &str,
        opts: GetOptions,
    ) -> Option<Found> {
        let d = match KindClass::of(kind) {
            KindClass::Addressable | KindClass::Dns => d,
            _ => "",
        };
        let target = Target::for_event(public_key, kind, d);
        self.event_get_target(target, opts).await
    }

    /// Fetches the event record stored under `target`.
    pub async fn event_get_target(&self, target: Target, opts: GetOptions) -> Option<Found> {
        self.get_in(&self.events, target, opts).await
    }

    /// Publishes a signed event.
    ///
    /// `signature` must cover the SHA-256 of [`Event::signable`].
    pub async fn event_put(
        &self,
        event: &Event,
        signature: [u8; 64],
    ) -> Result<PutOutcome, PutError> {
        let target = event
            .target()
            .map_err(VerifyError::from)
            .context(InvalidSnafu)?;
        let req = PutRequest {
            seq: event.created_at,
            value: Bytes::from(event.signable()),
            signature,
            proof: None,
        };
        self.event_put_target(target, req).await
    }

    /// Publishes a signed event record under `target`.
    pub async fn event_put_target(
        &self,
        target: Target,
        req: PutRequest,
    ) -> Result<PutOutcome, PutError> {
        self.put_in(&self.events, target, req).await
    }

    /// Writes the record of `found` to `peer`, using the token from the query.
    pub async fn repair(&self, found: &Found, peer: &QueryPeer) -> Result<(), PeerError> {
        let token = peer.token.ok_or_else(|| NoTokenSnafu.build())?;
        let value = found.record().to_put_request().encode();
        debug!(target = %found.target, peer = %peer.from.id.fmt_short(), "repairing peer");
        self.metrics.repairs_sent.inc();
        self.send_put(found.put_command, found.target, value, peer.from, token)
            .await
    }

    async fn get_in<F: RecordFamily>(
        &self,
        family: &F,
        target: Target,
        opts: GetOptions,
    ) -> Option<Found> {
        let mut replies = self.substrate.query(Query {
            target,
            command: F::GET,
            value: Some(codec::encode_uint(opts.seq)),
        });

        let mut peers: Vec<QueryPeer> = Vec::new();
        let mut best: Option<(Verified, QueryPeer)> = None;
        while let Some(reply) = replies.next().await {
            let mut peer = QueryPeer {
                from: reply.from,
                token: reply.token,
                seq: None,
            };
            let Some(value) = reply.value else {
                peers.push(peer);
                continue;
            };
            let record = match StoredRecord::decode(value) {
                Ok(record) => record,
                Err(err) => {
                    debug!(family = F::NAME, peer = %peer.from.id.fmt_short(), "malformed reply: {err}");
                    self.metrics.replies_malformed.inc();
                    peers.push(peer);
                    continue;
                }
            };
            peer.seq = Some(record.seq);
            peers.push(peer.clone());

            if record.seq < opts.seq {
                continue;
            }
            if best.as_ref().is_some_and(|(b, _)| record.seq < b.record.seq) {
                continue;
            }
            let verified = match family.verify(&target, &record.to_put_request()) {
                Ok(verified) => verified,
                Err(err) => {
                    debug!(family = F::NAME, peer = %peer.from.id.fmt_short(), "unverified reply: {err}");
                    self.metrics.replies_unverified.inc();
                    continue;
                }
            };
            let better = match &best {
                None => true,
                Some((b, _)) => family.prefer(&verified.record, &b.record),
            };
            if better {
                trace!(family = F::NAME, seq = verified.record.seq, "new best record");
                best = Some((verified, peer));
                if !opts.latest {
                    break;
                }
            }
        }

        let (verified, from) = best?;
        peers.retain(|peer| peer.from != from.from);
        Some(Found {
            target,
            verified,
            from,
            closest_nodes: peers,
            put_command: F::PUT,
        })
    }

    async fn put_in<F: RecordFamily>(
        &self,
        family: &F,
        target: Target,
        req: PutRequest,
    ) -> Result<PutOutcome, PutError> {
        let verified = family.verify(&target, &req).context(InvalidSnafu)?;

        let mut replies = self.substrate.query(Query {
            target,
            command: F::GET,
            value: Some(codec::encode_uint(0)),
        });
        let mut closest: Vec<(PeerAddr, Token)> = Vec::new();
        while let Some(reply) = replies.next().await {
            if let Some(token) = reply.token {
                if !closest.iter().any(|(peer, _)| *peer == reply.from) {
                    closest.push((reply.from, token));
                }
            }
        }
        closest.sort_by_key(|(peer, _)| peer.id.distance(&target));
        closest.truncate(self.max_closest_nodes);
        snafu::ensure!(!closest.is_empty(), NoPeersSnafu);

        let value = req.encode();
        let results = join_all(
            closest
                .iter()
                .map(|(peer, token)| self.send_put(F::PUT, target, value.clone(), *peer, *token)),
        )
        .await;

        let mut acked = Vec::new();
        let mut rejected = Vec::new();
        for ((peer, _), res) in closest.into_iter().zip(results) {
            match res {
                Ok(()) => {
                    self.metrics.put_acks.inc();
                    acked.push(peer);
                }
                Err(err) => {
                    debug!(family = F::NAME, peer = %peer.id.fmt_short(), "put failed: {err}");
                    self.metrics.put_rejections.inc();
                    rejected.push((peer, err));
                }
            }
        }
        snafu::ensure!(!acked.is_empty(), RejectedSnafu { rejected });

        debug!(family = F::NAME, %target, seq = req.seq, acked = acked.len(), "put complete");
        Ok(PutOutcome {
            target,
            seq: req.seq,
            signature: req.signature,
            trust_point: verified.receipt.map(|r| r.trust_point),
            acked,
            rejected,
        })
    }

    async fn send_put(
        &self,
        command: Command,
        target: Target,
        value: Bytes,
        peer: PeerAddr,
        token: Token,
    ) -> Result<(), PeerError> {
        let reply = self
            .substrate
            .request(
                Request {
                    token,
                    target,
                    command,
                    value: Some(value),
                },
                peer,
            )
            .await?;
        match ErrorCode::from_wire(reply.error) {
            Ok(None) => Ok(()),
            Ok(Some(code)) => Err(RefusedSnafu { code }.build()),
            Err(code) => Err(UnknownCodeSnafu { code }.build()),
        }
    }
}
