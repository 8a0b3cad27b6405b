//! The interface of the underlying DHT.
//!
//! Routing, transport encryption and NAT traversal live below this interface. The
//! overlay only needs two operations: an iterative `query` that streams replies from the
//! nodes closest to a target, and a direct `request` to one of those nodes, authorized
//! by the token it handed out while answering the query.

use std::{fmt, net::SocketAddr};

use bytes::Bytes;
use data_encoding::HEXLOWER;
use fabric_base::{Command, ErrorCode, Target};
use n0_future::boxed::{BoxFuture, BoxStream};
use nested_enum_utils::common_fields;
use snafu::{Backtrace, Snafu};

/// Identifier of a DHT node, in the same keyspace as [`Target`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, derive_more::From)]
pub struct NodeId([u8; 32]);

impl NodeId {
    /// Creates an id from raw bytes.
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Returns the raw bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// XOR distance to `target`, comparable as big-endian bytes.
    pub fn distance(&self, target: &Target) -> [u8; 32] {
        let mut out = [0u8; 32];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ target.as_bytes()[i];
        }
        out
    }

    /// Short representation, for logging.
    pub fn fmt_short(&self) -> String {
        HEXLOWER.encode(&self.0[..5])
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", HEXLOWER.encode(&self.0))
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.fmt_short())
    }
}

/// Address of a remote node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerAddr {
    /// The node's id.
    pub id: NodeId,
    /// Where the node was reached.
    pub addr: SocketAddr,
}

/// Write token a node hands out in query replies.
#[derive(Clone, Copy, PartialEq, Eq, Hash, derive_more::From)]
pub struct Token([u8; 32]);

impl Token {
    /// Creates a token from raw bytes.
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Returns the raw bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Token({})", HEXLOWER.encode(&self.0[..5]))
    }
}

/// An iterative query towards `target`.
#[derive(Debug, Clone)]
pub struct Query {
    /// Target to converge on.
    pub target: Target,
    /// Command every visited node answers.
    pub command: Command,
    /// Command payload.
    pub value: Option<Bytes>,
}

/// A reply received from a remote node.
#[derive(Debug, Clone)]
pub struct Reply {
    /// Responding node.
    pub from: PeerAddr,
    /// Token for a subsequent [`Request`] to this node.
    pub token: Option<Token>,
    /// Reply payload.
    pub value: Option<Bytes>,
    /// Error code, `0` on success.
    pub error: u64,
}

/// A direct request to a node found by a query.
#[derive(Debug, Clone)]
pub struct Request {
    /// Token the node handed out.
    pub token: Token,
    /// Target the request is about.
    pub target: Target,
    /// Command to run.
    pub command: Command,
    /// Command payload.
    pub value: Option<Bytes>,
}

/// A request received from a remote node, as seen by the handlers.
#[derive(Debug, Clone)]
pub struct InboundRequest {
    /// Requesting node.
    pub from: PeerAddr,
    /// Set if the requester presented a valid token.
    pub token: Option<Token>,
    /// Target the request is about.
    pub target: Option<Target>,
    /// Raw command id.
    pub command: u8,
    /// Command payload.
    pub value: Option<Bytes>,
}

/// How a handler answers an [`InboundRequest`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// Reply with an optional payload and no error.
    Reply(Option<Bytes>),
    /// Reply with an error code.
    Error(ErrorCode),
    /// Do not reply. The requester will time out.
    Ignore,
    /// No handler for this command. The DHT may handle it itself.
    Unhandled,
}

/// A direct request failed before a reply arrived.
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
#[snafu(visibility(pub))]
pub enum RequestError {
    #[snafu(display("request timed out"))]
    Timeout {},
    #[snafu(display("peer is unreachable"))]
    Unreachable {},
}

/// The DHT the overlay runs on.
pub trait Substrate: Send + Sync + fmt::Debug + 'static {
    /// Runs an iterative query, streaming replies as they arrive.
    fn query(&self, query: Query) -> BoxStream<Reply>;

    /// Sends a request to a single node.
    fn request(&self, request: Request, to: PeerAddr) -> BoxFuture<Result<Reply, RequestError>>;
}
