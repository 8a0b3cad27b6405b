//! Fabric is a distributed record store on top of a Kademlia-style DHT.
//!
//! It stores two families of records:
//!
//! - **Zone records** addressed by a space name such as `@example`. A zone record is only
//!   accepted with a proof that the space lives in a pay-to-taproot output signed by the
//!   record key, checked against a rotating set of trusted chain anchors.
//! - **Events** addressed by author key, kind and `d` tag. Events are replaceable or
//!   addressable Nostr events, authorized by their author's signature.
//!
//! Every node runs an [`Overlay`](overlay::Overlay) that verifies records on the way in
//! and on the way out, resolves conflicts between competing records, and keeps a bounded
//! local [`RecordStore`](store::RecordStore) per family. A [`Node`] wires these together
//! with an [`AnchorSync`](anchor::AnchorSync) keeping the anchors fresh.
//!
//! The DHT itself is abstracted as a [`Substrate`](overlay::substrate::Substrate), and
//! proof and signature verification as a [`Veritas`](veritas::Veritas).

#![deny(missing_docs, rustdoc::broken_intra_doc_links)]
#![cfg_attr(fabric_docsrs, feature(doc_auto_cfg))]

pub mod anchor;
pub mod config;
pub mod defaults;
pub mod metrics;
pub mod node;
pub mod overlay;
pub mod policy;
pub mod store;
pub mod verify;
pub mod veritas;

#[cfg(any(test, feature = "test-utils"))]
#[cfg_attr(fabric_docsrs, doc(cfg(any(test, feature = "test-utils"))))]
pub mod test_utils;

pub use fabric_base::{Command, ErrorCode, Target, TargetError, codec, event};

pub use self::{
    config::Config,
    node::{Node, NodeError},
    overlay::{Found, GetOptions, Overlay, PutError, PutOutcome},
};
