//! Nostr events stored under pubkey-addressed targets.
//!
//! An event record carries the canonical serialization
//! `[0, <pubkey hex>, <created_at>, <kind>, <tags>, <content>]` as its value. The
//! signature covers the SHA-256 of exactly those bytes, so nodes re-parse the value
//! rather than re-serializing the event.

use data_encoding::HEXLOWER;
use nested_enum_utils::common_fields;
use serde_json::Value;
use snafu::{Backtrace, OptionExt, ResultExt, Snafu};

use crate::{ErrorCode, PUBLIC_KEY_LENGTH, Target};

/// Kind of the append-only DNS record event.
pub const DNS_EVENT_KIND: u32 = 871_222;

/// How updates to an event kind are handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum KindClass {
    /// One slot per public key.
    #[display("replaceable")]
    Replaceable,
    /// One slot per public key and `d` tag.
    #[display("addressable")]
    Addressable,
    /// DNS records, one slot per public key and optional `d` tag.
    #[display("dns")]
    Dns,
    /// Not stored.
    #[display("unsupported")]
    Unsupported,
}

impl KindClass {
    /// Classifies an event kind.
    pub fn of(kind: u32) -> Self {
        match kind {
            0 | 3 | 10_000..20_000 => Self::Replaceable,
            30_000..40_000 => Self::Addressable,
            DNS_EVENT_KIND => Self::Dns,
            _ => Self::Unsupported,
        }
    }
}

/// Rejection of an event value.
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
#[snafu(visibility(pub(crate)))]
pub enum EventError {
    #[snafu(display("event is not valid json"))]
    Json { source: serde_json::Error },
    #[snafu(display("malformed event: {reason}"))]
    Shape { reason: &'static str },
    #[snafu(display("unsupported event kind {kind}"))]
    UnsupportedKind { kind: u32 },
    #[snafu(display("addressable event is missing its d tag"))]
    MissingDTag {},
}

impl EventError {
    /// The code sent to a peer that submitted the event.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::UnsupportedKind { .. } => ErrorCode::EventUnsupported,
            _ => ErrorCode::EventMalformed,
        }
    }
}

/// A parsed, not yet verified, event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    /// Author key, x-only.
    pub pubkey: [u8; PUBLIC_KEY_LENGTH],
    /// Unix timestamp in seconds.
    pub created_at: u64,
    /// Event kind.
    pub kind: u32,
    /// Tags, each a list of strings.
    pub tags: Vec<Vec<String>>,
    /// Free-form content.
    pub content: String,
}

impl Event {
    /// The canonical serialization that is hashed and signed.
    pub fn signable(&self) -> Vec<u8> {
        let tuple = (
            0u8,
            HEXLOWER.encode(&self.pubkey),
            self.created_at,
            self.kind,
            &self.tags,
            &self.content,
        );
        // serializing a tuple of strings and integers cannot fail
        serde_json::to_vec(&tuple).unwrap_or_default()
    }

    /// Parses the canonical serialization.
    pub fn from_signable(bytes: &[u8]) -> Result<Self, EventError> {
        let items: Vec<Value> = serde_json::from_slice(bytes).context(JsonSnafu)?;
        snafu::ensure!(
            items.len() == 5 || items.len() == 6,
            ShapeSnafu {
                reason: "expected 5 or 6 items"
            }
        );
        snafu::ensure!(
            items[0].as_u64() == Some(0),
            ShapeSnafu {
                reason: "unknown version"
            }
        );
        let pubkey = items[1]
            .as_str()
            .and_then(parse_key)
            .context(ShapeSnafu {
                reason: "pubkey must be 64 lowercase hex characters",
            })?;
        let created_at = items[2].as_u64().context(ShapeSnafu {
            reason: "created_at must be an unsigned integer",
        })?;
        let kind = items[3]
            .as_u64()
            .and_then(|kind| u32::try_from(kind).ok())
            .context(ShapeSnafu {
                reason: "kind must be an unsigned integer",
            })?;
        let tags = serde_json::from_value(items[4].clone()).map_err(|_| {
            ShapeSnafu {
                reason: "tags must be lists of strings",
            }
            .build()
        })?;
        let content = match items.get(5) {
            None => String::new(),
            Some(Value::String(content)) => content.clone(),
            Some(_) => {
                return Err(ShapeSnafu {
                    reason: "content must be a string",
                }
                .build());
            }
        };
        Ok(Self {
            pubkey,
            created_at,
            kind,
            tags,
            content,
        })
    }

    /// Update semantics of this event's kind.
    pub fn class(&self) -> KindClass {
        KindClass::of(self.kind)
    }

    /// Value of the first `d` tag.
    pub fn d_tag(&self) -> Option<&str> {
        self.tags
            .iter()
            .find(|tag| tag.len() >= 2 && tag[0] == "d")
            .map(|tag| tag[1].as_str())
    }

    /// The slot this event is stored under.
    ///
    /// Fails for unsupported kinds and for addressable events without a `d` tag.
    pub fn target(&self) -> Result<Target, EventError> {
        let d = match self.class() {
            KindClass::Replaceable => "",
            KindClass::Addressable => self.d_tag().context(MissingDTagSnafu)?,
            KindClass::Dns => self.d_tag().unwrap_or_default(),
            KindClass::Unsupported => {
                return Err(UnsupportedKindSnafu { kind: self.kind }.build());
            }
        };
        Ok(Target::for_event(&self.pubkey, self.kind, d))
    }
}

fn parse_key(s: &str) -> Option<[u8; 32]> {
    if s.len() != 64 {
        return None;
    }
    HEXLOWER.decode(s.as_bytes()).ok()?.try_into().ok()
}
