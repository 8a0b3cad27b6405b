//! Base types for fabric: record targets, wire codec, error codes and events.
//!
//! Everything in this crate is pure and synchronous. It is shared between the node-side
//! handlers and the client side of the overlay, which must agree byte-for-byte on the
//! encodings defined here.

#![deny(missing_docs, rustdoc::broken_intra_doc_links)]
#![cfg_attr(fabric_docsrs, feature(doc_auto_cfg))]

pub mod codec;
mod codes;
pub mod event;
mod target;

pub use self::{
    codes::{Command, ErrorCode},
    target::{Target, TargetError},
};

/// Length of an owner public key (x-only), in bytes.
pub const PUBLIC_KEY_LENGTH: usize = 32;
/// Length of a record signature, in bytes.
pub const SIGNATURE_LENGTH: usize = 64;

/// Computes the SHA-256 digest of `data`.
///
/// This is the domain hash used for targets and for signing digests.
pub fn sha256(data: impl AsRef<[u8]>) -> [u8; 32] {
    use sha2::Digest;
    sha2::Sha256::digest(data.as_ref()).into()
}
