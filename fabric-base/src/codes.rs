//! Numeric codes shared with every other implementation of the protocol.

/// Error code carried in a DHT reply.
///
/// The numeric values are part of the wire protocol and must never change. The first
/// block mirrors the transport-level codes of the underlying DHT, the rest are
/// produced by record verification and conflict resolution.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    num_enum::IntoPrimitive,
    num_enum::TryFromPrimitive,
    strum::Display,
)]
#[repr(u8)]
pub enum ErrorCode {
    /// No error.
    #[strum(serialize = "none")]
    None = 0,
    /// The request was aborted.
    #[strum(serialize = "aborted")]
    Aborted = 1,
    /// Protocol version mismatch.
    #[strum(serialize = "version mismatch")]
    VersionMismatch = 2,
    /// The node is busy.
    #[strum(serialize = "try later")]
    TryLater = 3,
    /// The sequence number is already bound to different content.
    #[strum(serialize = "sequence reused")]
    SeqReused = 16,
    /// The sequence number is lower than the stored one.
    #[strum(serialize = "sequence too low")]
    SeqTooLow = 17,
    /// Signature or proof did not verify.
    #[strum(serialize = "invalid signature")]
    InvalidSignature = 25,
    /// The proof root is not one of the trusted anchors.
    #[strum(serialize = "no matching trust anchor")]
    NoMatchingTrustAnchor = 26,
    /// A non-stale proof for the same owner is already stored.
    #[strum(serialize = "non-stale ancestor exists")]
    NonStaleAncestorExists = 27,
    /// The proof is older than the stored one.
    #[strum(serialize = "stale proof")]
    StaleProof = 28,
    /// The event does not have the expected shape.
    #[strum(serialize = "malformed event")]
    EventMalformed = 40,
    /// The event kind is not stored by this network.
    #[strum(serialize = "unsupported event")]
    EventUnsupported = 41,
    /// The event timestamp is too far in the future.
    #[strum(serialize = "event too far in the future")]
    EventTooNew = 42,
    /// The event is not newer than the stored one.
    #[strum(serialize = "event too old")]
    EventTooOld = 43,
}

impl ErrorCode {
    /// Parses a raw code received from a peer.
    ///
    /// Returns `None` for `0`, which signals success.
    pub fn from_wire(code: u64) -> Result<Option<Self>, u64> {
        let small = u8::try_from(code).map_err(|_| code)?;
        match Self::try_from(small) {
            Ok(Self::None) => Ok(None),
            Ok(code) => Ok(Some(code)),
            Err(_) => Err(code),
        }
    }
}

/// DHT command identifiers used by the overlay.
///
/// Commands below 20 belong to the underlying DHT.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    num_enum::IntoPrimitive,
    num_enum::TryFromPrimitive,
    strum::Display,
)]
#[repr(u8)]
pub enum Command {
    /// Store a space-addressed zone record.
    ZonePut = 20,
    /// Fetch a space-addressed zone record.
    ZoneGet = 21,
    /// Store a pubkey-addressed event record.
    EventPut = 22,
    /// Fetch a pubkey-addressed event record.
    EventGet = 24,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_values_are_stable() {
        let expected: [(ErrorCode, u8); 14] = [
            (ErrorCode::None, 0),
            (ErrorCode::Aborted, 1),
            (ErrorCode::VersionMismatch, 2),
            (ErrorCode::TryLater, 3),
            (ErrorCode::SeqReused, 16),
            (ErrorCode::SeqTooLow, 17),
            (ErrorCode::InvalidSignature, 25),
            (ErrorCode::NoMatchingTrustAnchor, 26),
            (ErrorCode::NonStaleAncestorExists, 27),
            (ErrorCode::StaleProof, 28),
            (ErrorCode::EventMalformed, 40),
            (ErrorCode::EventUnsupported, 41),
            (ErrorCode::EventTooNew, 42),
            (ErrorCode::EventTooOld, 43),
        ];
        for (code, value) in expected {
            assert_eq!(u8::from(code), value, "{code}");
        }
    }

    #[test]
    fn from_wire() {
        assert_eq!(ErrorCode::from_wire(0), Ok(None));
        assert_eq!(ErrorCode::from_wire(28), Ok(Some(ErrorCode::StaleProof)));
        assert_eq!(ErrorCode::from_wire(99), Err(99));
        assert_eq!(ErrorCode::from_wire(1 << 40), Err(1 << 40));
    }

    #[test]
    fn display() {
        assert_eq!(ErrorCode::SeqReused.to_string(), "sequence reused");
        assert_eq!(Command::ZonePut.to_string(), "ZonePut");
    }
}
