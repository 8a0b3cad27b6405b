//! Conflict resolution between a stored record and a verified candidate.
//!
//! These functions are pure. Callers run them inside the store's read-decide-write
//! section so that a decision and the write it leads to are atomic per target.

use fabric_base::{ErrorCode, codec::StoredRecord};

use crate::anchor::AnchorSet;

/// Outcome of an accepted candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Accept {
    /// Nothing was stored yet.
    First,
    /// Same sequence and value as the stored record. Nothing changes.
    Identical,
    /// The candidate replaces the stored record.
    Replace,
}

impl Accept {
    /// Whether the candidate must be written.
    pub fn writes(&self) -> bool {
        !matches!(self, Self::Identical)
    }
}

/// Decides whether a verified zone record may replace the stored one.
///
/// Sequence numbers are checked first: an identical re-put is accepted, a different value
/// under the same sequence is [`ErrorCode::SeqReused`] and a lower sequence is
/// [`ErrorCode::SeqTooLow`]. Trust points are then compared under `anchors`:
///
/// * on an owner change the candidate must be proven against a strictly more recent
///   anchor, else [`ErrorCode::StaleProof`].
/// * for the same owner, a stale candidate older than the stored proof is
///   [`ErrorCode::StaleProof`], and a newer candidate while the stored proof is not yet
///   stale is [`ErrorCode::NonStaleAncestorExists`]. Anything else is accepted.
///
/// A stored record whose root is no longer anchored cannot be ranked and is replaced.
pub fn resolve_zone(
    existing: Option<&StoredRecord>,
    cand: &StoredRecord,
    anchors: &AnchorSet,
) -> Result<Accept, ErrorCode> {
    let Some(existing) = existing else {
        return Ok(Accept::First);
    };
    if let Some(accept) = check_sequence(existing, cand)? {
        return Ok(accept);
    }

    let cand_point = cand
        .root
        .and_then(|root| anchors.trust_point(&root))
        .ok_or(ErrorCode::NoMatchingTrustAnchor)?;
    let Some(local_point) = existing.root.and_then(|root| anchors.trust_point(&root)) else {
        return Ok(Accept::Replace);
    };

    if cand.public_key != existing.public_key {
        return if cand_point > local_point {
            Ok(Accept::Replace)
        } else {
            Err(ErrorCode::StaleProof)
        };
    }

    if cand_point == local_point {
        return Ok(Accept::Replace);
    }
    if anchors.is_stale(cand_point) && cand_point < local_point {
        return Err(ErrorCode::StaleProof);
    }
    if !anchors.is_stale(local_point) && cand_point > local_point {
        return Err(ErrorCode::NonStaleAncestorExists);
    }
    Ok(Accept::Replace)
}

/// Decides whether a verified event may replace the stored one.
///
/// Once an event is stored, only a strictly newer `created_at` is accepted.
pub fn resolve_event(
    existing: Option<&StoredRecord>,
    cand: &StoredRecord,
) -> Result<Accept, ErrorCode> {
    match existing {
        None => Ok(Accept::First),
        Some(existing) if cand.seq > existing.seq => Ok(Accept::Replace),
        Some(_) => Err(ErrorCode::EventTooOld),
    }
}

fn check_sequence(
    existing: &StoredRecord,
    cand: &StoredRecord,
) -> Result<Option<Accept>, ErrorCode> {
    if cand.seq == existing.seq {
        return if cand.value == existing.value {
            Ok(Some(Accept::Identical))
        } else {
            Err(ErrorCode::SeqReused)
        };
    }
    if cand.seq < existing.seq {
        return Err(ErrorCode::SeqTooLow);
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::anchor::{Anchor, Block};

    const HEIGHTS: [u32; 20] = [
        100, 95, 90, 85, 80, 75, 70, 65, 60, 55, 50, 45, 40, 35, 30, 25, 20, 15, 10, 5,
    ];

    /// Anchor set where root `[h; 32]` has trust point `h` for each of [`HEIGHTS`].
    fn anchors() -> AnchorSet {
        AnchorSet::new(
            HEIGHTS
                .iter()
                .map(|h| Anchor {
                    root: [*h as u8; 32],
                    block: Block {
                        hash: [0; 32],
                        height: *h,
                    },
                })
                .collect(),
        )
    }

    fn record(seq: u64, value: &'static str, owner: u8, point: u32) -> StoredRecord {
        StoredRecord {
            seq,
            value: Bytes::from_static(value.as_bytes()),
            signature: [seq as u8; 64],
            root: Some([point as u8; 32]),
            public_key: [owner; 32],
            proof: Some(Bytes::from_static(b"proof")),
        }
    }

    #[test]
    fn threshold_of_fixture() {
        let anchors = anchors();
        assert_eq!(anchors.stale_threshold(), 45);
        assert!(anchors.is_stale(40));
        assert!(!anchors.is_stale(45));
    }

    #[test]
    fn first_write() {
        let cand = record(1, "a", 1, 90);
        assert_eq!(resolve_zone(None, &cand, &anchors()), Ok(Accept::First));
    }

    #[test]
    fn identical_reput_is_accepted_without_write() {
        let stored = record(3, "a", 1, 90);
        let accept = resolve_zone(Some(&stored), &stored.clone(), &anchors()).unwrap();
        assert_eq!(accept, Accept::Identical);
        assert!(!accept.writes());
    }

    #[test]
    fn sequence_rules() {
        let anchors = anchors();
        let stored = record(3, "a", 1, 90);
        assert_eq!(
            resolve_zone(Some(&stored), &record(3, "b", 1, 90), &anchors),
            Err(ErrorCode::SeqReused)
        );
        assert_eq!(
            resolve_zone(Some(&stored), &record(2, "b", 1, 90), &anchors),
            Err(ErrorCode::SeqTooLow)
        );
        assert_eq!(
            resolve_zone(Some(&stored), &record(4, "b", 1, 90), &anchors),
            Ok(Accept::Replace)
        );
    }

    #[test]
    fn ownership_transfer_requires_more_recent_proof() {
        let anchors = anchors();
        let stored = record(3, "a", 1, 80);
        assert_eq!(
            resolve_zone(Some(&stored), &record(4, "b", 2, 85), &anchors),
            Ok(Accept::Replace)
        );
        assert_eq!(
            resolve_zone(Some(&stored), &record(4, "b", 2, 80), &anchors),
            Err(ErrorCode::StaleProof)
        );
        assert_eq!(
            resolve_zone(Some(&stored), &record(4, "b", 2, 75), &anchors),
            Err(ErrorCode::StaleProof)
        );
    }

    #[test]
    fn same_owner_prefers_older_non_stale_proof() {
        let anchors = anchors();

        // a fresher proof cannot displace one that is not stale yet
        let stored = record(3, "a", 1, 70);
        assert_eq!(
            resolve_zone(Some(&stored), &record(4, "b", 1, 100), &anchors),
            Err(ErrorCode::NonStaleAncestorExists)
        );
        // an older but non-stale proof overrides a newer one
        let stored = record(3, "a", 1, 100);
        assert_eq!(
            resolve_zone(Some(&stored), &record(4, "b", 1, 70), &anchors),
            Ok(Accept::Replace)
        );
        // a stale proof never overrides a newer one
        assert_eq!(
            resolve_zone(Some(&stored), &record(4, "b", 1, 40), &anchors),
            Err(ErrorCode::StaleProof)
        );
        // once the stored proof is stale, a fresher one gets through
        let stored = record(3, "a", 1, 30);
        assert_eq!(
            resolve_zone(Some(&stored), &record(4, "b", 1, 95), &anchors),
            Ok(Accept::Replace)
        );
        // same chain state
        let stored = record(3, "a", 1, 80);
        assert_eq!(
            resolve_zone(Some(&stored), &record(4, "b", 1, 80), &anchors),
            Ok(Accept::Replace)
        );
    }

    #[test]
    fn unanchored_roots() {
        let anchors = anchors();
        let mut stored = record(3, "a", 1, 90);
        stored.root = Some([0xee; 32]);
        assert_eq!(
            resolve_zone(Some(&stored), &record(4, "b", 2, 50), &anchors),
            Ok(Accept::Replace)
        );

        let mut cand = record(4, "b", 1, 90);
        cand.root = Some([0xee; 32]);
        assert_eq!(
            resolve_zone(Some(&record(3, "a", 1, 90)), &cand, &anchors),
            Err(ErrorCode::NoMatchingTrustAnchor)
        );
    }

    #[test]
    fn events_must_strictly_increase() {
        let stored = record(1_700_000_000, "a", 1, 0);
        assert_eq!(
            resolve_event(None, &stored),
            Ok(Accept::First)
        );
        assert_eq!(
            resolve_event(Some(&stored), &stored.clone()),
            Err(ErrorCode::EventTooOld)
        );
        assert_eq!(
            resolve_event(Some(&stored), &record(1_699_999_999, "b", 1, 0)),
            Err(ErrorCode::EventTooOld)
        );
        assert_eq!(
            resolve_event(Some(&stored), &record(1_700_000_001, "b", 1, 0)),
            Ok(Accept::Replace)
        );
    }
}
