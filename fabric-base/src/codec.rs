//! Binary layouts exchanged between nodes.
//!
//! The encoding is the compact-encoding scheme used by the rest of the DHT:
//!
//!  * `uint`: `0..=0xfc` as one byte, otherwise a marker byte (`0xfd`, `0xfe`, `0xff`)
//!    followed by a little-endian `u16`, `u32` or `u64`.
//!  * `buffer`: a `uint` length followed by the bytes. A zero length is "absent".
//!  * `fixed32` / `fixed64`: raw bytes without a length prefix.
//!
//! Decoding is strict: every layout must consume the whole input, and any truncation
//! or trailing data is a [`DecodeError`], never an absent value.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use nested_enum_utils::common_fields;
use snafu::{Backtrace, Snafu};

use crate::{PUBLIC_KEY_LENGTH, SIGNATURE_LENGTH};

const U16_MARKER: u8 = 0xfd;
const U32_MARKER: u8 = 0xfe;
const U64_MARKER: u8 = 0xff;

/// Failure to decode a wire message.
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
#[snafu(visibility(pub(crate)))]
pub enum DecodeError {
    #[snafu(display("unexpected end of input, needed {needed} more bytes"))]
    UnexpectedEnd { needed: usize },
    #[snafu(display("{len} trailing bytes after message"))]
    TrailingBytes { len: usize },
    #[snafu(display("length prefix does not fit in memory"))]
    Overflow {},
}

/// Cursor over an encoded message.
#[derive(Debug, Clone)]
pub struct Reader {
    buf: Bytes,
}

impl Reader {
    /// Starts reading `buf`.
    pub fn new(buf: Bytes) -> Self {
        Self { buf }
    }

    fn need(&self, n: usize) -> Result<(), DecodeError> {
        snafu::ensure!(
            self.buf.remaining() >= n,
            UnexpectedEndSnafu {
                needed: n - self.buf.remaining()
            }
        );
        Ok(())
    }

    /// Reads a variable-length unsigned integer.
    pub fn uint(&mut self) -> Result<u64, DecodeError> {
        self.need(1)?;
        let n = match self.buf.get_u8() {
            U16_MARKER => {
                self.need(2)?;
                self.buf.get_u16_le() as u64
            }
            U32_MARKER => {
                self.need(4)?;
                self.buf.get_u32_le() as u64
            }
            U64_MARKER => {
                self.need(8)?;
                self.buf.get_u64_le()
            }
            small => small as u64,
        };
        Ok(n)
    }

    /// Reads a length-prefixed buffer, `None` if the length is zero.
    pub fn buffer(&mut self) -> Result<Option<Bytes>, DecodeError> {
        let len = self.uint()?;
        let len = usize::try_from(len).map_err(|_| OverflowSnafu.build())?;
        if len == 0 {
            return Ok(None);
        }
        self.need(len)?;
        Ok(Some(self.buf.split_to(len)))
    }

    /// Reads `N` raw bytes.
    pub fn fixed<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        self.need(N)?;
        let mut out = [0u8; N];
        self.buf.copy_to_slice(&mut out);
        Ok(out)
    }

    /// Ensures the whole input was consumed.
    pub fn finish(self) -> Result<(), DecodeError> {
        snafu::ensure!(
            self.buf.is_empty(),
            TrailingBytesSnafu {
                len: self.buf.len()
            }
        );
        Ok(())
    }
}

/// Writes a variable-length unsigned integer.
pub fn put_uint<B: BufMut>(dst: &mut B, n: u64) {
    if n <= 0xfc {
        dst.put_u8(n as u8);
    } else if n <= 0xffff {
        dst.put_u8(U16_MARKER);
        dst.put_u16_le(n as u16);
    } else if n <= 0xffff_ffff {
        dst.put_u8(U32_MARKER);
        dst.put_u32_le(n as u32);
    } else {
        dst.put_u8(U64_MARKER);
        dst.put_u64_le(n);
    }
}

/// Writes a length-prefixed buffer. `None` and empty buffers encode identically.
pub fn put_buffer<B: BufMut>(dst: &mut B, buf: Option<&[u8]>) {
    let buf = buf.unwrap_or_default();
    put_uint(dst, buf.len() as u64);
    dst.put_slice(buf);
}

/// Encodes a single `uint`, the value of GET requests.
pub fn encode_uint(n: u64) -> Bytes {
    let mut out = BytesMut::with_capacity(9);
    put_uint(&mut out, n);
    out.freeze()
}

/// Decodes a message consisting of a single `uint`.
pub fn decode_uint(buf: Bytes) -> Result<u64, DecodeError> {
    let mut reader = Reader::new(buf);
    let n = reader.uint()?;
    reader.finish()?;
    Ok(n)
}

/// The bytes that are hashed and signed for a record with sequence `seq`.
///
/// Layout: `uint seq, buffer value`.
pub fn signable(seq: u64, value: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(value.len() + 18);
    put_uint(&mut out, seq);
    put_buffer(&mut out, Some(value));
    out
}

/// A signed record as sent by a writer.
///
/// Layout: `uint seq, buffer value, fixed64 signature, buffer proof`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutRequest {
    /// Sequence number, or creation time for events.
    pub seq: u64,
    /// Opaque record value.
    pub value: Bytes,
    /// Signature over [`signable`].
    pub signature: [u8; SIGNATURE_LENGTH],
    /// UTXO proof, only for space-addressed records.
    pub proof: Option<Bytes>,
}

impl PutRequest {
    /// The bytes the signature covers.
    pub fn signable(&self) -> Vec<u8> {
        signable(self.seq, &self.value)
    }

    /// Serializes into a freshly allocated buffer.
    pub fn encode(&self) -> Bytes {
        let mut out = BytesMut::new();
        self.write_to(&mut out);
        out.freeze()
    }

    /// Writes the encoded request into `dst`.
    pub fn write_to<B: BufMut>(&self, dst: &mut B) {
        put_uint(dst, self.seq);
        put_buffer(dst, Some(self.value.as_ref()));
        dst.put_slice(&self.signature);
        put_buffer(dst, self.proof.as_deref());
    }

    /// Parses a request. Absent values decode as empty.
    pub fn decode(buf: Bytes) -> Result<Self, DecodeError> {
        let mut reader = Reader::new(buf);
        let seq = reader.uint()?;
        let value = reader.buffer()?.unwrap_or_default();
        let signature = reader.fixed()?;
        let proof = reader.buffer()?;
        reader.finish()?;
        Ok(Self {
            seq,
            value,
            signature,
            proof,
        })
    }
}

/// A record as held by a node and returned from GET.
///
/// Layout: `uint seq, buffer value, fixed64 signature, fixed32 root, fixed32 public_key,
/// buffer proof`. A root of all zeros means the record was not proven against an anchor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRecord {
    /// Sequence number, or creation time for events.
    pub seq: u64,
    /// Opaque record value.
    pub value: Bytes,
    /// Signature over [`signable`].
    pub signature: [u8; SIGNATURE_LENGTH],
    /// Root of the anchor the proof verified against.
    pub root: Option<[u8; 32]>,
    /// Owner key the signature verified under.
    pub public_key: [u8; PUBLIC_KEY_LENGTH],
    /// UTXO proof, only for space-addressed records.
    pub proof: Option<Bytes>,
}

impl StoredRecord {
    /// Builds the stored form of an already verified request.
    pub fn from_request(
        req: PutRequest,
        root: Option<[u8; 32]>,
        public_key: [u8; PUBLIC_KEY_LENGTH],
    ) -> Self {
        Self {
            seq: req.seq,
            value: req.value,
            signature: req.signature,
            root,
            public_key,
            proof: req.proof,
        }
    }

    /// The request that re-publishes this record, used to repair peers.
    pub fn to_put_request(&self) -> PutRequest {
        PutRequest {
            seq: self.seq,
            value: self.value.clone(),
            signature: self.signature,
            proof: self.proof.clone(),
        }
    }

    /// The bytes the signature covers.
    pub fn signable(&self) -> Vec<u8> {
        signable(self.seq, &self.value)
    }

    /// Serializes into a freshly allocated buffer.
    pub fn encode(&self) -> Bytes {
        let mut out = BytesMut::new();
        put_uint(&mut out, self.seq);
        put_buffer(&mut out, Some(self.value.as_ref()));
        out.put_slice(&self.signature);
        out.put_slice(&self.root.unwrap_or_default());
        out.put_slice(&self.public_key);
        put_buffer(&mut out, self.proof.as_deref());
        out.freeze()
    }

    /// Parses a stored record.
    pub fn decode(buf: Bytes) -> Result<Self, DecodeError> {
        let mut reader = Reader::new(buf);
        let seq = reader.uint()?;
        let value = reader.buffer()?.unwrap_or_default();
        let signature = reader.fixed()?;
        let root: [u8; 32] = reader.fixed()?;
        let public_key = reader.fixed()?;
        let proof = reader.buffer()?;
        reader.finish()?;
        Ok(Self {
            seq,
            value,
            signature,
            root: (root != [0u8; 32]).then_some(root),
            public_key,
            proof,
        })
    }
}

#[cfg(test)]
mod tests {
    use data_encoding::HEXLOWER;

    use super::*;

    fn from_hexdump(dump: &str) -> Vec<u8> {
        let stripped: String = dump.chars().filter(|c| !c.is_ascii_whitespace()).collect();
        HEXLOWER.decode(stripped.as_bytes()).unwrap()
    }

    #[test]
    fn uint_snapshot() {
        let cases: [(u64, &str); 6] = [
            (0, "00"),
            (0xfc, "fc"),
            (0xfd, "fd fd 00"),
            (0xffff, "fd ff ff"),
            (0x1_0000, "fe 00 00 01 00"),
            (1 << 32, "ff 00 00 00 00 01 00 00 00"),
        ];
        for (n, dump) in cases {
            let expected = from_hexdump(dump);
            assert_eq!(encode_uint(n).as_ref(), &expected[..], "{n}");
            assert_eq!(decode_uint(Bytes::from(expected)).unwrap(), n);
        }
    }

    #[test]
    fn signable_snapshot() {
        assert_eq!(signable(7, b"hi"), from_hexdump("07 02 68 69"));
        assert_eq!(signable(300, b""), from_hexdump("fd 2c 01 00"));
    }

    #[test]
    fn put_request_snapshot() {
        let req = PutRequest {
            seq: 1,
            value: Bytes::from_static(b"zone"),
            signature: [0xaa; 64],
            proof: Some(Bytes::from_static(&[1, 2, 3])),
        };
        let mut dump = String::from("01 04 7a 6f 6e 65");
        dump.push_str(&" aa".repeat(64));
        dump.push_str(" 03 01 02 03");
        let encoded = req.encode();
        assert_eq!(encoded.as_ref(), &from_hexdump(&dump)[..]);
        assert_eq!(PutRequest::decode(encoded).unwrap(), req);
    }

    #[test]
    fn stored_record_without_root_or_proof() {
        let record = StoredRecord {
            seq: 1_700_000_000,
            value: Bytes::from_static(b"{}"),
            signature: [3; 64],
            root: None,
            public_key: [9; 32],
            proof: None,
        };
        let encoded = record.encode();
        // uint (5) + buffer (3) + sig + root + key + empty proof (1)
        assert_eq!(encoded.len(), 5 + 3 + 64 + 32 + 32 + 1);
        assert_eq!(&encoded[8 + 64..8 + 64 + 32], &[0u8; 32]);
        assert_eq!(StoredRecord::decode(encoded).unwrap(), record);
    }

    #[test]
    fn corrupted_buffers_are_errors() {
        let record = StoredRecord {
            seq: 5,
            value: Bytes::from_static(b"value"),
            signature: [1; 64],
            root: Some([2; 32]),
            public_key: [3; 32],
            proof: Some(Bytes::from_static(b"proof")),
        };
        let encoded = record.encode();

        for len in 0..encoded.len() {
            let truncated = encoded.slice(..len);
            assert!(
                matches!(
                    StoredRecord::decode(truncated),
                    Err(DecodeError::UnexpectedEnd { .. })
                ),
                "truncated at {len}"
            );
        }

        let mut extended = encoded.to_vec();
        extended.push(0);
        assert!(matches!(
            StoredRecord::decode(extended.into()),
            Err(DecodeError::TrailingBytes { len: 1, .. })
        ));

        // a buffer claiming more bytes than the message holds
        assert!(matches!(
            PutRequest::decode(Bytes::from_static(&[0x01, 0xfe, 0xff, 0xff, 0xff, 0x00])),
            Err(DecodeError::UnexpectedEnd { .. })
        ));
    }

    #[test]
    fn empty_get_value_is_malformed() {
        assert!(decode_uint(Bytes::new()).is_err());
        assert!(decode_uint(Bytes::from_static(&[0xfd, 0x01])).is_err());
    }
}
