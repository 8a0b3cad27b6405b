//! Server side of the overlay: a map from command to handler.

use std::{collections::BTreeMap, fmt, sync::Arc};

use fabric_base::{
    Command,
    codec::{self, PutRequest},
};
use iroh_metrics::Counter;
use n0_future::boxed::BoxFuture;
use tracing::{debug, trace};

use super::substrate::{InboundRequest, Response};
use crate::{metrics::Metrics, store::RecordStore, verify::RecordFamily};

/// Handles requests for one or more commands.
pub trait RequestHandler: Send + Sync + fmt::Debug + 'static {
    /// Answers an inbound request.
    fn handle(&self, req: InboundRequest) -> BoxFuture<Response>;
}

impl<T: RequestHandler> RequestHandler for Arc<T> {
    fn handle(&self, req: InboundRequest) -> BoxFuture<Response> {
        self.as_ref().handle(req)
    }
}

/// Handlers keyed by the command they serve.
#[derive(Debug, Default, Clone)]
pub struct HandlerMap(BTreeMap<Command, Arc<dyn RequestHandler>>);

impl HandlerMap {
    /// Registers `handler` for `command`, replacing any previous one.
    pub fn insert(&mut self, command: Command, handler: Arc<dyn RequestHandler>) {
        self.0.insert(command, handler);
    }

    /// The handler for `command`.
    pub fn get(&self, command: Command) -> Option<&dyn RequestHandler> {
        self.0.get(&command).map(|h| &**h)
    }

    /// Registered commands, in ascending order.
    pub fn commands(&self) -> impl Iterator<Item = &Command> {
        self.0.keys()
    }

    /// Routes `req` to the handler of its command.
    ///
    /// Unknown commands yield [`Response::Unhandled`], leaving them to the DHT.
    pub async fn dispatch(&self, req: InboundRequest) -> Response {
        let Ok(command) = Command::try_from(req.command) else {
            return Response::Unhandled;
        };
        match self.get(command) {
            Some(handler) => handler.handle(req).await,
            None => Response::Unhandled,
        }
    }
}

/// Serves the put and get commands of one record family from a [`RecordStore`].
#[derive(Debug)]
pub struct StoreHandler<F> {
    family: F,
    store: Arc<RecordStore>,
    metrics: Arc<Metrics>,
}

impl<F: RecordFamily> StoreHandler<F> {
    /// Creates a handler serving `store`.
    pub fn new(family: F, store: Arc<RecordStore>, metrics: Arc<Metrics>) -> Self {
        Self {
            family,
            store,
            metrics,
        }
    }

    fn counters(&self) -> (&Counter, &Counter) {
        match F::PUT {
            Command::ZonePut => (
                &self.metrics.zone_puts_accepted,
                &self.metrics.zone_puts_rejected,
            ),
            _ => (
                &self.metrics.event_puts_accepted,
                &self.metrics.event_puts_rejected,
            ),
        }
    }

    fn ignore(&self, reason: &str) -> Response {
        trace!(family = F::NAME, "ignoring request: {reason}");
        self.metrics.requests_ignored.inc();
        Response::Ignore
    }

    /// Verifies a put and applies it to the store.
    pub fn on_put(&self, req: InboundRequest) -> Response {
        let (Some(target), Some(_token), Some(value)) = (req.target, req.token, req.value) else {
            return self.ignore("missing target, token or value");
        };
        let put = match PutRequest::decode(value) {
            Ok(put) => put,
            Err(err) => {
                debug!(family = F::NAME, from = %req.from.id.fmt_short(), "malformed put: {err}");
                return self.ignore("malformed put");
            }
        };
        if put.value.is_empty() {
            return self.ignore("empty value");
        }

        let (accepted, rejected) = self.counters();
        let verified = match self.family.verify(&target, &put) {
            Ok(verified) => verified,
            Err(err) => {
                debug!(family = F::NAME, %target, seq = put.seq, "rejecting put: {err}");
                rejected.inc();
                return Response::Error(err.code());
            }
        };
        let res = self
            .store
            .upsert_with(target, verified.record, |existing, cand| {
                self.family.resolve(existing, cand)
            });
        match res {
            Ok(accept) => {
                debug!(family = F::NAME, %target, seq = put.seq, ?accept, "put accepted");
                accepted.inc();
                Response::Reply(None)
            }
            Err(code) => {
                debug!(family = F::NAME, %target, seq = put.seq, ?code, "put rejected");
                rejected.inc();
                Response::Error(code)
            }
        }
    }

    /// Returns the stored record if it is at least as recent as the requested floor.
    pub fn on_get(&self, req: InboundRequest) -> Response {
        let (Some(target), Some(value)) = (req.target, req.value) else {
            return self.ignore("missing target or value");
        };
        let Ok(floor) = codec::decode_uint(value) else {
            return self.ignore("malformed get");
        };
        match self.store.get(&target) {
            Some(record) if record.seq >= floor => {
                self.metrics.gets_served.inc();
                Response::Reply(Some(record.encode()))
            }
            _ => {
                self.metrics.gets_empty.inc();
                Response::Reply(None)
            }
        }
    }
}

impl<F: RecordFamily> RequestHandler for StoreHandler<F> {
    fn handle(&self, req: InboundRequest) -> BoxFuture<Response> {
        let response = if req.command == u8::from(F::PUT) {
            self.on_put(req)
        } else if req.command == u8::from(F::GET) {
            self.on_get(req)
        } else {
            Response::Unhandled
        };
        Box::pin(async move { response })
    }
}
