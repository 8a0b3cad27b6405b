use std::{fmt, str::FromStr};

use data_encoding::HEXLOWER;
use nested_enum_utils::common_fields;
use snafu::{Backtrace, Snafu};

use crate::sha256;

/// The 32-byte key a record is stored under.
///
/// Targets are derived with a fixed domain hash, either from a space name (records
/// that are authorized by a UTXO proof) or from a `(public key, kind, d-tag)` triple
/// (records that are authorized by a plain signature).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, derive_more::From, derive_more::Into)]
pub struct Target([u8; 32]);

#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum TargetError {
    #[snafu(display("space names must start with @, got {name:?}"))]
    InvalidSpaceName { name: String },
    #[snafu(display("target must be 32 hex encoded bytes"))]
    InvalidHex {},
}

impl Target {
    /// The length of a target, in bytes.
    pub const LENGTH: usize = 32;

    /// Creates a target from raw bytes.
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Returns the raw bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Target of the zone of a space, e.g. `@example`.
    ///
    /// This is also the key under which the space UTXO is found in a proof.
    pub fn for_space(space: &str) -> Result<Self, TargetError> {
        snafu::ensure!(
            space.len() > 1 && space.starts_with('@'),
            InvalidSpaceNameSnafu { name: space }
        );
        Ok(Self(sha256(space.as_bytes())))
    }

    /// Target of a replaceable or addressable event slot.
    ///
    /// `d` is empty for replaceable events.
    pub fn for_event(public_key: &[u8; 32], kind: u32, d: &str) -> Self {
        let slot = format!("{}.{kind}.{d}", HEXLOWER.encode(public_key));
        Self(sha256(slot.as_bytes()))
    }

    /// Short representation, for logging.
    pub fn fmt_short(&self) -> String {
        HEXLOWER.encode(&self.0[..5])
    }
}

impl AsRef<[u8]> for Target {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", HEXLOWER.encode(&self.0))
    }
}

impl fmt::Debug for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Target({})", self.fmt_short())
    }
}

impl FromStr for Target {
    type Err = TargetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = HEXLOWER
            .decode(s.as_bytes())
            .map_err(|_| InvalidHexSnafu.build())?;
        let bytes: [u8; 32] = bytes.try_into().map_err(|_| InvalidHexSnafu.build())?;
        Ok(Self(bytes))
    }
}
