//! Authenticity checks for the two record families.
//!
//! Zone records are authorized by a UTXO proof: the proof must place the target space in
//! a taproot output, the record must be signed by that output's key, and the proof root
//! must be one of the current anchors. Event records are authorized by their author's
//! signature alone.

use std::{
    fmt,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use fabric_base::{
    Command, ErrorCode, Target,
    codec::{PutRequest, StoredRecord},
    event::{Event, EventError},
    sha256,
};
use nested_enum_utils::common_fields;
use snafu::{Backtrace, OptionExt, Snafu};

use crate::{
    anchor::AnchorSync,
    defaults,
    policy::{self, Accept},
    veritas::{ProofError, SignatureError},
};

/// Why a record failed verification.
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
#[snafu(visibility(pub(crate)))]
pub enum VerifyError {
    #[snafu(display("zone records require a proof"))]
    MissingProof {},
    #[snafu(transparent)]
    Proof { source: ProofError },
    #[snafu(display("no utxo for {target} in proof"))]
    NoUtxo { target: Target },
    #[snafu(display("space utxo is not pay-to-taproot"))]
    NotTaproot {},
    #[snafu(transparent)]
    Signature { source: SignatureError },
    #[snafu(display("proof root is not a trusted anchor"))]
    UnknownRoot {},
    #[snafu(transparent)]
    Event { source: EventError },
    #[snafu(display("event belongs to {actual}, not {expected}"))]
    TargetMismatch { expected: Target, actual: Target },
    #[snafu(display("sequence {seq} does not match created_at {created_at}"))]
    SeqMismatch { seq: u64, created_at: u64 },
    #[snafu(display("events do not carry proofs"))]
    UnexpectedProof {},
    #[snafu(display("created_at {created_at} is too far in the future"))]
    TooNew { created_at: u64 },
}

impl VerifyError {
    /// The code sent to a peer whose record failed verification.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::MissingProof { .. }
            | Self::Proof { .. }
            | Self::NoUtxo { .. }
            | Self::NotTaproot { .. }
            | Self::Signature { .. } => ErrorCode::InvalidSignature,
            Self::UnknownRoot { .. } => ErrorCode::NoMatchingTrustAnchor,
            Self::Event { source, .. } => source.code(),
            Self::TargetMismatch { .. } | Self::SeqMismatch { .. } | Self::UnexpectedProof { .. } => {
                ErrorCode::EventMalformed
            }
            Self::TooNew { .. } => ErrorCode::EventTooNew,
        }
    }
}

/// What a successful proof verification establishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Receipt {
    /// Height of the anchor the proof root belongs to.
    pub trust_point: u32,
    /// The proof root.
    pub root: [u8; 32],
    /// Key controlling the space.
    pub public_key: [u8; 32],
}

/// A record that passed verification, in its stored form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verified {
    /// The record to store or return.
    pub record: StoredRecord,
    /// Proof receipt, for zone records.
    pub receipt: Option<Receipt>,
}

/// A family of records sharing commands, verification and conflict resolution.
pub trait RecordFamily: Clone + Send + Sync + fmt::Debug + 'static {
    /// Name used in logs.
    const NAME: &'static str;
    /// Command storing a record.
    const PUT: Command;
    /// Command fetching a record.
    const GET: Command;

    /// Verifies that `req` may be stored under `target`.
    fn verify(&self, target: &Target, req: &PutRequest) -> Result<Verified, VerifyError>;

    /// Decides whether `cand` may replace `existing`.
    fn resolve(
        &self,
        existing: Option<&StoredRecord>,
        cand: &StoredRecord,
    ) -> Result<Accept, ErrorCode>;

    /// Whether `cand` should be preferred over `best` when both were returned by peers.
    fn prefer(&self, cand: &StoredRecord, best: &StoredRecord) -> bool {
        matches!(self.resolve(Some(best), cand), Ok(Accept::Replace))
    }
}

/// Space-addressed zone records.
#[derive(Debug, Clone)]
pub struct Zones {
    anchors: AnchorSync,
}

impl Zones {
    /// Creates the family, verifying against `anchors`.
    pub fn new(anchors: AnchorSync) -> Self {
        Self { anchors }
    }

    /// Checks that `proof` authorizes `signature` over `signable` for `target`.
    pub fn verify_proof(
        &self,
        target: &Target,
        signable: &[u8],
        signature: &[u8; 64],
        proof: &[u8],
    ) -> Result<Receipt, VerifyError> {
        let proof = self.anchors.verify_proof(proof)?;
        let out = proof
            .find_space(target)
            .context(NoUtxoSnafu { target: *target })?;
        let public_key = out.public_key.context(NotTaprootSnafu)?;
        self.anchors
            .verify_signature(&public_key, &sha256(signable), signature)?;
        let root = proof.root();
        let trust_point = self.anchors.trust_point(&root).context(UnknownRootSnafu)?;
        Ok(Receipt {
            trust_point,
            root,
            public_key,
        })
    }
}

impl RecordFamily for Zones {
    const NAME: &'static str = "zone";
    const PUT: Command = Command::ZonePut;
    const GET: Command = Command::ZoneGet;

    fn verify(&self, target: &Target, req: &PutRequest) -> Result<Verified, VerifyError> {
        let proof = req.proof.as_ref().context(MissingProofSnafu)?;
        let receipt = self.verify_proof(target, &req.signable(), &req.signature, proof)?;
        Ok(Verified {
            record: StoredRecord::from_request(
                req.clone(),
                Some(receipt.root),
                receipt.public_key,
            ),
            receipt: Some(receipt),
        })
    }

    fn resolve(
        &self,
        existing: Option<&StoredRecord>,
        cand: &StoredRecord,
    ) -> Result<Accept, ErrorCode> {
        policy::resolve_zone(existing, cand, &self.anchors.snapshot())
    }
}

/// Pubkey-addressed replaceable, addressable and DNS record events.
#[derive(Debug, Clone)]
pub struct Events {
    anchors: AnchorSync,
    max_future: Duration,
}

impl Events {
    /// Creates the family, checking signatures through `anchors`.
    pub fn new(anchors: AnchorSync) -> Self {
        Self {
            anchors,
            max_future: defaults::EVENT_MAX_FUTURE,
        }
    }

    /// Parses and checks an event value without verifying its signature.
    ///
    /// Unsupported kinds and addressable events without a `d` tag are rejected here.
    pub fn check(&self, target: &Target, req: &PutRequest) -> Result<Event, VerifyError> {
        let event = Event::from_signable(&req.value)?;
        let actual = event.target()?;
        snafu::ensure!(
            actual == *target,
            TargetMismatchSnafu {
                expected: *target,
                actual
            }
        );
        snafu::ensure!(
            req.seq == event.created_at,
            SeqMismatchSnafu {
                seq: req.seq,
                created_at: event.created_at
            }
        );
        snafu::ensure!(req.proof.is_none(), UnexpectedProofSnafu);
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let max_created_at = (now + self.max_future).as_secs();
        snafu::ensure!(
            event.created_at <= max_created_at,
            TooNewSnafu {
                created_at: event.created_at
            }
        );
        Ok(event)
    }
}

impl RecordFamily for Events {
    const NAME: &'static str = "event";
    const PUT: Command = Command::EventPut;
    const GET: Command = Command::EventGet;

    fn verify(&self, target: &Target, req: &PutRequest) -> Result<Verified, VerifyError> {
        let event = self.check(target, req)?;
        self.anchors
            .verify_signature(&event.pubkey, &sha256(&req.value), &req.signature)?;
        Ok(Verified {
            record: StoredRecord::from_request(req.clone(), None, event.pubkey),
            receipt: None,
        })
    }

    fn resolve(
        &self,
        existing: Option<&StoredRecord>,
        cand: &StoredRecord,
    ) -> Result<Accept, ErrorCode> {
        policy::resolve_event(existing, cand)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use bytes::Bytes;
    use n0_snafu::{Result, ResultExt};

    use super::*;
    use crate::{
        anchor::{Anchor, AnchorOptions, Block},
        test_utils::{TestKey, TestVeritas},
    };

    async fn anchors(heights: &[u32]) -> Result<AnchorSync> {
        let anchors = heights
            .iter()
            .map(|h| Anchor {
                root: TestVeritas::root_at(*h),
                block: Block {
                    hash: [0; 32],
                    height: *h,
                },
            })
            .collect();
        AnchorSync::create(
            AnchorOptions::fixed(anchors),
            Arc::new(TestVeritas),
            Default::default(),
        )
        .await
        .e()
    }

    fn now() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs()
    }

    #[tokio::test]
    async fn zone_record_verifies() -> Result {
        let zones = Zones::new(anchors(&[100, 90]).await?);
        let owner = TestKey::new(1);
        let target = Target::for_space("@example").e()?;
        let req = owner.sign_zone(1, b"zone", TestVeritas::proof(90, &[(target, Some(&owner))]));

        let verified = zones.verify(&target, &req).e()?;
        let receipt = verified.receipt.unwrap();
        assert_eq!(receipt.trust_point, 90);
        assert_eq!(receipt.public_key, owner.public());
        assert_eq!(verified.record.root, Some(TestVeritas::root_at(90)));
        assert_eq!(verified.record.public_key, owner.public());
        Ok(())
    }

    #[tokio::test]
    async fn zone_rejections() -> Result {
        let zones = Zones::new(anchors(&[100, 90]).await?);
        let owner = TestKey::new(1);
        let thief = TestKey::new(2);
        let target = Target::for_space("@example").e()?;
        let other = Target::for_space("@other").e()?;

        let cases = [
            (
                "signed by someone else",
                thief.sign_zone(1, b"zone", TestVeritas::proof(90, &[(target, Some(&owner))])),
                ErrorCode::InvalidSignature,
            ),
            (
                "space not in proof",
                owner.sign_zone(1, b"zone", TestVeritas::proof(90, &[(other, Some(&owner))])),
                ErrorCode::InvalidSignature,
            ),
            (
                "not taproot",
                owner.sign_zone(1, b"zone", TestVeritas::proof(90, &[(target, None)])),
                ErrorCode::InvalidSignature,
            ),
            (
                "unknown root",
                owner.sign_zone(1, b"zone", TestVeritas::proof(80, &[(target, Some(&owner))])),
                ErrorCode::NoMatchingTrustAnchor,
            ),
        ];
        for (name, req, code) in cases {
            let err = zones.verify(&target, &req).unwrap_err();
            assert_eq!(err.code(), code, "{name}: {err}");
        }

        let mut req = owner.sign_zone(1, b"zone", TestVeritas::proof(90, &[(target, Some(&owner))]));
        req.proof = None;
        assert!(matches!(
            zones.verify(&target, &req),
            Err(VerifyError::MissingProof { .. })
        ));
        req.proof = Some(Bytes::from_static(b"garbage"));
        assert_eq!(
            zones.verify(&target, &req).unwrap_err().code(),
            ErrorCode::InvalidSignature
        );
        Ok(())
    }

    #[tokio::test]
    async fn event_checks() -> Result {
        let events = Events::new(anchors(&[100]).await?);
        let author = TestKey::new(7);

        let (target, req) = author.sign_event(now(), 10_002, vec![]);
        let verified = events.verify(&target, &req).e()?;
        assert_eq!(verified.record.public_key, author.public());
        assert_eq!(verified.record.root, None);

        // too far in the future
        let (target, req) = author.sign_event(now() + 31 * 24 * 60 * 60, 10_002, vec![]);
        let err = events.verify(&target, &req).unwrap_err();
        assert_eq!(err.code(), ErrorCode::EventTooNew);

        // wrong target
        let (_, req) = author.sign_event(now(), 0, vec![]);
        let err = events.verify(&target, &req).unwrap_err();
        assert_eq!(err.code(), ErrorCode::EventMalformed);

        // sequence must be created_at
        let (target, mut req) = author.sign_event(now(), 0, vec![]);
        req.seq += 1;
        let err = events.verify(&target, &req).unwrap_err();
        assert!(matches!(err, VerifyError::SeqMismatch { .. }));

        // unsupported kind
        let (target, req) = author.sign_event(now(), 1, vec![]);
        let err = events.verify(&target, &req).unwrap_err();
        assert_eq!(err.code(), ErrorCode::EventUnsupported);

        // tampered value
        let (target, mut req) = author.sign_event(now(), 0, vec![]);
        req.signature[0] ^= 1;
        let err = events.verify(&target, &req).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidSignature);
        Ok(())
    }

    #[tokio::test]
    async fn missing_d_tag_is_rejected_before_signature_check() -> Result {
        let events = Events::new(anchors(&[100]).await?);
        let author = TestKey::new(7);
        let (_, mut req) = author.sign_event(now(), 35_000, vec![]);
        // a broken signature must not change the outcome
        req.signature = [0; 64];
        let target = Target::for_event(&author.public(), 35_000, "");
        let err = events.verify(&target, &req).unwrap_err();
        assert!(matches!(
            err,
            VerifyError::Event {
                source: EventError::MissingDTag { .. },
                ..
            }
        ));
        assert_eq!(err.code(), ErrorCode::EventMalformed);
        Ok(())
    }
}
