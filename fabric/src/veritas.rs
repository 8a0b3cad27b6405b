//! The cryptographic collaborator.
//!
//! Fabric does not implement UTXO proof or BIP-340 verification itself. A [`Veritas`]
//! implementation supplies them, and everything else in this crate only consumes the
//! results.

use std::fmt;

use fabric_base::{PUBLIC_KEY_LENGTH, SIGNATURE_LENGTH, Target};
use snafu::{Backtrace, Snafu};

/// A signature did not verify.
#[derive(Debug, Snafu)]
#[snafu(display("invalid signature"))]
pub struct SignatureError {
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
}

impl SignatureError {
    /// Creates a new error.
    #[track_caller]
    pub fn new() -> Self {
        SignatureSnafu.build()
    }
}

impl Default for SignatureError {
    fn default() -> Self {
        Self::new()
    }
}

/// A proof could not be parsed or does not hash to a known root.
#[derive(Debug, Snafu)]
#[snafu(display("invalid proof: {reason}"))]
pub struct ProofError {
    reason: String,
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
}

impl ProofError {
    /// Creates a new error.
    #[track_caller]
    pub fn new(reason: impl Into<String>) -> Self {
        ProofSnafu {
            reason: reason.into(),
        }
        .build()
    }
}

/// The output a space currently lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpaceOut {
    /// Taproot output key, `None` if the output is not pay-to-taproot.
    pub public_key: Option<[u8; PUBLIC_KEY_LENGTH]>,
}

/// A verified UTXO inclusion proof.
pub trait SpaceProof: Send + Sync + fmt::Debug {
    /// The merkle root the proof commits to.
    fn root(&self) -> [u8; 32];

    /// Looks up the output holding `space`.
    fn find_space(&self, space: &Target) -> Option<SpaceOut>;
}

/// Signature and proof verification.
pub trait Veritas: Send + Sync + fmt::Debug + 'static {
    /// Verifies a BIP-340 signature over a 32-byte digest.
    fn verify_schnorr(
        &self,
        public_key: &[u8; PUBLIC_KEY_LENGTH],
        digest: &[u8; 32],
        signature: &[u8; SIGNATURE_LENGTH],
    ) -> Result<(), SignatureError>;

    /// Parses and verifies a UTXO proof.
    ///
    /// This only checks the proof's internal consistency. Whether its root is trusted is
    /// decided by the anchor set.
    fn verify_proof(&self, proof: &[u8]) -> Result<Box<dyn SpaceProof>, ProofError>;
}
