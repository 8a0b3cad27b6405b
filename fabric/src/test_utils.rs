//! Internal utilities to support testing.
//!
//! [`TestVeritas`] stands in for the real proof and signature verifier, using ed25519
//! keys with the same 32 byte key and 64 byte signature shapes. [`Testnet`] runs several
//! nodes in process on a simulated DHT.

use std::{
    collections::{BTreeMap, BTreeSet},
    net::{Ipv4Addr, SocketAddr},
    sync::Arc,
};

use bytes::{BufMut, Bytes, BytesMut};
use ed25519_dalek::{Signer, SigningKey, VerifyingKey};
use fabric_base::{
    Target,
    codec::{PutRequest, signable},
    event::Event,
    sha256,
};
use n0_future::{
    StreamExt,
    boxed::{BoxFuture, BoxStream},
    stream,
};
use parking_lot::Mutex;

use crate::{
    anchor::{Anchor, AnchorOptions, Block},
    config::Config,
    defaults,
    node::{Node, NodeError},
    overlay::{
        handler::HandlerMap,
        substrate::{
            InboundRequest, NodeId, PeerAddr, Query, Reply, Request, RequestError, Response,
            Substrate, TimeoutSnafu, Token, UnreachableSnafu,
        },
    },
    veritas::{ProofError, SignatureError, SpaceOut, SpaceProof, Veritas},
};

/// A [`Veritas`] verifying ed25519 signatures and a trivial proof format.
///
/// A proof is `root (32) | count (1) | (target (32) | key (32))*`. An all-zero key marks
/// an output that is not pay-to-taproot.
#[derive(Debug, Clone, Copy, Default)]
pub struct TestVeritas;

impl TestVeritas {
    /// The root anchored at `height` by [`anchors`].
    pub fn root_at(height: u32) -> [u8; 32] {
        sha256(format!("root {height}"))
    }

    /// Encodes a proof with root [`Self::root_at`] `height`.
    pub fn proof(height: u32, spaces: &[(Target, Option<&TestKey>)]) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_slice(&Self::root_at(height));
        buf.put_u8(spaces.len() as u8);
        for (target, key) in spaces {
            buf.put_slice(target.as_bytes());
            buf.put_slice(&key.map(TestKey::public).unwrap_or_default());
        }
        buf.freeze()
    }
}

#[derive(Debug)]
struct TestProof {
    root: [u8; 32],
    spaces: Vec<(Target, [u8; 32])>,
}

impl SpaceProof for TestProof {
    fn root(&self) -> [u8; 32] {
        self.root
    }

    fn find_space(&self, space: &Target) -> Option<SpaceOut> {
        let (_, key) = self.spaces.iter().find(|(target, _)| target == space)?;
        Some(SpaceOut {
            public_key: (*key != [0; 32]).then_some(*key),
        })
    }
}

impl Veritas for TestVeritas {
    fn verify_schnorr(
        &self,
        public_key: &[u8; 32],
        digest: &[u8; 32],
        signature: &[u8; 64],
    ) -> Result<(), SignatureError> {
        let key = VerifyingKey::from_bytes(public_key).map_err(|_| SignatureError::new())?;
        let signature = ed25519_dalek::Signature::from_bytes(signature);
        key.verify_strict(digest, &signature)
            .map_err(|_| SignatureError::new())
    }

    fn verify_proof(&self, proof: &[u8]) -> Result<Box<dyn SpaceProof>, ProofError> {
        let (root, rest) = split32(proof).ok_or_else(|| ProofError::new("truncated"))?;
        let (&count, mut rest) = rest
            .split_first()
            .ok_or_else(|| ProofError::new("truncated"))?;
        let mut spaces = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let (target, tail) = split32(rest).ok_or_else(|| ProofError::new("truncated"))?;
            let (key, tail) = split32(tail).ok_or_else(|| ProofError::new("truncated"))?;
            spaces.push((Target::from_bytes(target), key));
            rest = tail;
        }
        if !rest.is_empty() {
            return Err(ProofError::new("trailing bytes"));
        }
        Ok(Box::new(TestProof { root, spaces }))
    }
}

fn split32(buf: &[u8]) -> Option<([u8; 32], &[u8])> {
    let (head, tail) = buf.split_first_chunk::<32>()?;
    Some((*head, tail))
}

/// Anchors at the given heights, with roots from [`TestVeritas::root_at`].
pub fn anchors(heights: &[u32]) -> Vec<Anchor> {
    heights
        .iter()
        .map(|height| Anchor {
            root: TestVeritas::root_at(*height),
            block: Block {
                hash: sha256(format!("block {height}")),
                height: *height,
            },
        })
        .collect()
}

/// A deterministic signing key.
#[derive(Debug, Clone)]
pub struct TestKey(SigningKey);

impl TestKey {
    /// Creates the key derived from `seed`.
    pub fn new(seed: u8) -> Self {
        Self(SigningKey::from_bytes(&[seed; 32]))
    }

    /// The public key.
    pub fn public(&self) -> [u8; 32] {
        self.0.verifying_key().to_bytes()
    }

    /// Signs a 32 byte digest.
    pub fn sign_digest(&self, digest: &[u8; 32]) -> [u8; 64] {
        self.0.sign(digest).to_bytes()
    }

    /// A signed zone record.
    pub fn sign_zone(&self, seq: u64, value: &[u8], proof: Bytes) -> PutRequest {
        let signature = self.sign_digest(&sha256(signable(seq, value)));
        PutRequest {
            seq,
            value: Bytes::copy_from_slice(value),
            signature,
            proof: Some(proof),
        }
    }

    /// An unsigned event authored by this key.
    pub fn event(&self, created_at: u64, kind: u32, tags: Vec<Vec<String>>) -> Event {
        Event {
            pubkey: self.public(),
            created_at,
            kind,
            tags,
            content: format!("event {kind} at {created_at}"),
        }
    }

    /// Signs an event, returning the signature over its canonical form.
    pub fn sign(&self, event: &Event) -> [u8; 64] {
        self.sign_digest(&sha256(event.signable()))
    }

    /// A signed event record and its target.
    ///
    /// The target of events that have none falls back to an empty `d`.
    pub fn sign_event(
        &self,
        created_at: u64,
        kind: u32,
        tags: Vec<Vec<String>>,
    ) -> (Target, PutRequest) {
        let event = self.event(created_at, kind, tags);
        let target = event
            .target()
            .unwrap_or_else(|_| Target::for_event(&event.pubkey, kind, ""));
        let req = PutRequest {
            seq: created_at,
            value: Bytes::from(event.signable()),
            signature: self.sign(&event),
            proof: None,
        };
        (target, req)
    }
}

/// Token `responder` hands out to `requester`.
fn token(responder: &NodeId, requester: &NodeId) -> Token {
    let mut buf = [0u8; 64];
    buf[..32].copy_from_slice(responder.as_bytes());
    buf[32..].copy_from_slice(requester.as_bytes());
    Token::from_bytes(sha256(buf))
}

#[derive(Debug, Default)]
struct Network {
    nodes: BTreeMap<NodeId, (PeerAddr, Arc<HandlerMap>)>,
    offline: BTreeSet<NodeId>,
}

impl Network {
    fn online(&self, id: &NodeId) -> Option<(PeerAddr, Arc<HandlerMap>)> {
        if self.offline.contains(id) {
            return None;
        }
        self.nodes.get(id).cloned()
    }
}

/// A node's view of the simulated DHT.
///
/// Queries visit every other online node, closest to the target first.
#[derive(Debug, Clone)]
pub struct TestSubstrate {
    me: PeerAddr,
    net: Arc<Mutex<Network>>,
}

impl Substrate for TestSubstrate {
    fn query(&self, query: Query) -> BoxStream<Reply> {
        let peers = {
            let net = self.net.lock();
            let mut peers: Vec<_> = net
                .nodes
                .keys()
                .filter(|id| **id != self.me.id)
                .filter_map(|id| net.online(id))
                .collect();
            peers.sort_by_key(|(peer, _)| peer.id.distance(&query.target));
            peers.truncate(defaults::MAX_CLOSEST_NODES);
            peers
        };
        let me = self.me;
        let replies = stream::iter(peers)
            .then(move |(peer, handlers)| {
                let query = query.clone();
                async move {
                    let req = InboundRequest {
                        from: me,
                        token: None,
                        target: Some(query.target),
                        command: query.command.into(),
                        value: query.value,
                    };
                    let (value, error) = match handlers.dispatch(req).await {
                        Response::Reply(value) => (value, 0),
                        Response::Error(code) => (None, u8::from(code).into()),
                        Response::Ignore | Response::Unhandled => return None,
                    };
                    Some(Reply {
                        from: peer,
                        token: Some(token(&peer.id, &me.id)),
                        value,
                        error,
                    })
                }
            })
            .filter_map(|reply| reply);
        Box::pin(replies)
    }

    fn request(&self, request: Request, to: PeerAddr) -> BoxFuture<Result<Reply, RequestError>> {
        let found = self.net.lock().online(&to.id);
        let me = self.me;
        Box::pin(async move {
            let Some((peer, handlers)) = found else {
                return Err(UnreachableSnafu.build());
            };
            let valid = request.token == token(&peer.id, &me.id);
            let req = InboundRequest {
                from: me,
                token: valid.then_some(request.token),
                target: Some(request.target),
                command: request.command.into(),
                value: request.value,
            };
            let (value, error) = match handlers.dispatch(req).await {
                Response::Reply(value) => (value, 0),
                Response::Error(code) => (None, u8::from(code).into()),
                Response::Ignore | Response::Unhandled => return Err(TimeoutSnafu.build()),
            };
            Ok(Reply {
                from: peer,
                token: None,
                value,
                error,
            })
        })
    }
}

/// Several nodes on one simulated DHT.
#[derive(Debug)]
pub struct Testnet {
    nodes: Vec<Node>,
    addrs: Vec<PeerAddr>,
    net: Arc<Mutex<Network>>,
}

impl Testnet {
    /// Starts `n` nodes trusting `anchors`.
    pub async fn new(n: usize, anchors: Vec<Anchor>) -> Result<Self, NodeError> {
        let config = Config {
            anchors: AnchorOptions::fixed(anchors),
            bootstrap: Vec::new(),
            ..Default::default()
        };
        Self::with_config(n, config).await
    }

    /// Starts `n` nodes sharing `config`.
    pub async fn with_config(n: usize, config: Config) -> Result<Self, NodeError> {
        let net = Arc::new(Mutex::new(Network::default()));
        let mut nodes = Vec::with_capacity(n);
        let mut addrs = Vec::with_capacity(n);
        for i in 0..n {
            let addr = PeerAddr {
                id: NodeId::from_bytes(sha256(format!("node {i}"))),
                addr: SocketAddr::from((Ipv4Addr::LOCALHOST, 20_000 + i as u16)),
            };
            let substrate = TestSubstrate {
                me: addr,
                net: net.clone(),
            };
            let node =
                Node::spawn(config.clone(), Arc::new(substrate), Arc::new(TestVeritas)).await?;
            net.lock().nodes.insert(addr.id, (addr, node.handlers()));
            nodes.push(node);
            addrs.push(addr);
        }
        Ok(Self { nodes, addrs, net })
    }

    /// The `i`th node.
    pub fn node(&self, i: usize) -> &Node {
        &self.nodes[i]
    }

    /// All nodes.
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Address of the `i`th node.
    pub fn addr(&self, i: usize) -> PeerAddr {
        self.addrs[i]
    }

    /// Index of the node with `id`.
    pub fn index_of(&self, id: &NodeId) -> Option<usize> {
        self.addrs.iter().position(|addr| addr.id == *id)
    }

    /// Indices of all nodes, closest to `target` first.
    pub fn closest(&self, target: &Target) -> Vec<usize> {
        let mut indices: Vec<usize> = (0..self.nodes.len()).collect();
        indices.sort_by_key(|i| self.addrs[*i].id.distance(target));
        indices
    }

    /// Takes the `i`th node off the network, or brings it back.
    pub fn set_online(&self, i: usize, online: bool) {
        let id = self.addrs[i].id;
        let mut net = self.net.lock();
        if online {
            net.offline.remove(&id);
        } else {
            net.offline.insert(id);
        }
    }

    /// Shuts down every node.
    pub fn shutdown(&self) {
        for node in &self.nodes {
            node.shutdown();
        }
    }
}
