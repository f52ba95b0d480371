use std::fmt;
use std::str::FromStr;

use serde::de::{self, SeqAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::TypeError;
use crate::varint::{decode_varint, encode_varint};

/// CID version written and accepted by this crate.
pub const CID_VERSION: u64 = 1;

/// Multihash code for BLAKE3-256.
pub const BLAKE3_MULTIHASH: u64 = 0x1e;

/// Digest length in bytes.
pub const DIGEST_LEN: usize = 32;

/// Length of the binary form: version, codec, hash code, digest length, digest.
pub const CID_BYTES_LEN: usize = 4 + DIGEST_LEN;

/// Multicodec describing how a block's bytes are interpreted.
///
/// Declared in multicodec-code order so the derived ordering matches the
/// ordering of the binary form.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Codec {
    /// Opaque bytes (blobs).
    Raw,
    /// CBOR-encoded structured data (commits, tree nodes, records).
    DagCbor,
}

impl Codec {
    /// The multicodec code.
    pub const fn code(self) -> u64 {
        match self {
            Self::Raw => 0x55,
            Self::DagCbor => 0x71,
        }
    }

    /// Parse from a multicodec code.
    pub fn from_code(code: u64) -> Result<Self, TypeError> {
        match code {
            0x55 => Ok(Self::Raw),
            0x71 => Ok(Self::DagCbor),
            other => Err(TypeError::UnsupportedCodec(other)),
        }
    }
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Raw => write!(f, "raw"),
            Self::DagCbor => write!(f, "dag-cbor"),
        }
    }
}

/// Content identifier for a block.
///
/// A `Cid` is a codec tag plus the BLAKE3 digest of the block bytes. Identical
/// bytes under the same codec always produce the same `Cid`, so a block can be
/// verified against its identifier and deduplicated on write.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Cid {
    codec: Codec,
    digest: [u8; DIGEST_LEN],
}

impl Cid {
    /// Compute the CID of `data` under `codec`.
    pub fn compute(codec: Codec, data: &[u8]) -> Self {
        Self {
            codec,
            digest: *blake3::hash(data).as_bytes(),
        }
    }

    /// CID of a CBOR-encoded block.
    pub fn cbor(data: &[u8]) -> Self {
        Self::compute(Codec::DagCbor, data)
    }

    /// CID of a raw block.
    pub fn raw(data: &[u8]) -> Self {
        Self::compute(Codec::Raw, data)
    }

    /// Build a CID from a pre-computed digest.
    pub const fn from_digest(codec: Codec, digest: [u8; DIGEST_LEN]) -> Self {
        Self { codec, digest }
    }

    pub fn codec(&self) -> Codec {
        self.codec
    }

    pub fn digest(&self) -> &[u8; DIGEST_LEN] {
        &self.digest
    }

    /// Returns `true` if `data` hashes to this CID.
    pub fn verify(&self, data: &[u8]) -> bool {
        Self::compute(self.codec, data) == *self
    }

    /// Binary form.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(CID_BYTES_LEN);
        self.write_bytes(&mut buf);
        buf
    }

    /// Append the binary form to `buf`.
    pub fn write_bytes(&self, buf: &mut Vec<u8>) {
        encode_varint(buf, CID_VERSION);
        encode_varint(buf, self.codec.code());
        encode_varint(buf, BLAKE3_MULTIHASH);
        encode_varint(buf, DIGEST_LEN as u64);
        buf.extend_from_slice(&self.digest);
    }

    /// Decode a CID from the front of `data`. Returns (cid, bytes_consumed).
    pub fn read_bytes(data: &[u8]) -> Result<(Self, usize), TypeError> {
        let mut pos = 0;

        let (version, n) = decode_varint(&data[pos..])?;
        pos += n;
        if version != CID_VERSION {
            return Err(TypeError::InvalidCid(format!("unsupported version {version}")));
        }

        let (codec, n) = decode_varint(&data[pos..])?;
        pos += n;
        let codec = Codec::from_code(codec)?;

        let (hash_code, n) = decode_varint(&data[pos..])?;
        pos += n;
        if hash_code != BLAKE3_MULTIHASH {
            return Err(TypeError::InvalidCid(format!(
                "unsupported multihash 0x{hash_code:x}"
            )));
        }

        let (len, n) = decode_varint(&data[pos..])?;
        pos += n;
        if len != DIGEST_LEN as u64 {
            return Err(TypeError::InvalidLength {
                expected: DIGEST_LEN,
                actual: len as usize,
            });
        }

        let end = pos + DIGEST_LEN;
        if data.len() < end {
            return Err(TypeError::InvalidLength {
                expected: end,
                actual: data.len(),
            });
        }
        let mut digest = [0u8; DIGEST_LEN];
        digest.copy_from_slice(&data[pos..end]);
        Ok((Self { codec, digest }, end))
    }

    /// Decode a CID that must span all of `data`.
    pub fn from_bytes(data: &[u8]) -> Result<Self, TypeError> {
        let (cid, consumed) = Self::read_bytes(data)?;
        if consumed != data.len() {
            return Err(TypeError::InvalidCid(format!(
                "{} trailing bytes",
                data.len() - consumed
            )));
        }
        Ok(cid)
    }

    /// Short digest prefix for logs.
    pub fn short_hex(&self) -> String {
        hex::encode(&self.digest[..4])
    }
}

impl fmt::Debug for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Cid({}:{})", self.codec, self.short_hex())
    }
}

/// Multibase base16 text form: `f` followed by the lowercase hex binary form.
impl fmt::Display for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "f{}", hex::encode(self.to_bytes()))
    }
}

impl FromStr for Cid {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut chars = s.chars();
        match chars.next() {
            Some('f') => {}
            other => return Err(TypeError::UnsupportedMultibase(other)),
        }
        let bytes = hex::decode(chars.as_str()).map_err(|e| TypeError::InvalidHex(e.to_string()))?;
        Self::from_bytes(&bytes)
    }
}

impl Serialize for Cid {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            serializer.collect_str(self)
        } else {
            serializer.serialize_bytes(&self.to_bytes())
        }
    }
}

impl<'de> Deserialize<'de> for Cid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        if deserializer.is_human_readable() {
            deserializer.deserialize_str(CidVisitor)
        } else {
            deserializer.deserialize_bytes(CidVisitor)
        }
    }
}

struct CidVisitor;

impl<'de> Visitor<'de> for CidVisitor {
    type Value = Cid;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a CID as multibase text or binary bytes")
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<Cid, E> {
        v.parse().map_err(E::custom)
    }

    fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<Cid, E> {
        Cid::from_bytes(v).map_err(E::custom)
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Cid, A::Error> {
        let mut bytes = Vec::with_capacity(CID_BYTES_LEN);
        while let Some(byte) = seq.next_element::<u8>()? {
            bytes.push(byte);
        }
        Cid::from_bytes(&bytes).map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compute_is_deterministic() {
        assert_eq!(Cid::cbor(b"node"), Cid::cbor(b"node"));
        assert_ne!(Cid::cbor(b"node"), Cid::cbor(b"other"));
    }

    #[test]
    fn codec_separates_identical_bytes() {
        assert_ne!(Cid::cbor(b"same"), Cid::raw(b"same"));
        assert_eq!(Cid::raw(b"same").digest(), Cid::cbor(b"same").digest());
    }

    #[test]
    fn binary_form_layout() {
        let cid = Cid::cbor(b"layout");
        let bytes = cid.to_bytes();
        assert_eq!(bytes.len(), CID_BYTES_LEN);
        assert_eq!(&bytes[..4], &[0x01, 0x71, 0x1e, 0x20]);
        assert_eq!(&bytes[4..], cid.digest());
    }

    #[test]
    fn read_bytes_reports_consumed_length() {
        let cid = Cid::raw(b"prefix");
        let mut buf = cid.to_bytes();
        buf.extend_from_slice(b"block payload");
        let (parsed, consumed) = Cid::read_bytes(&buf).unwrap();
        assert_eq!(parsed, cid);
        assert_eq!(consumed, CID_BYTES_LEN);
    }

    #[test]
    fn from_bytes_rejects_trailing_data() {
        let mut buf = Cid::raw(b"x").to_bytes();
        buf.push(0);
        assert!(matches!(Cid::from_bytes(&buf), Err(TypeError::InvalidCid(_))));
    }

    #[test]
    fn rejects_unknown_codec_and_hash() {
        let mut buf = Cid::raw(b"x").to_bytes();
        buf[1] = 0x70;
        assert_eq!(Cid::from_bytes(&buf), Err(TypeError::UnsupportedCodec(0x70)));

        let mut buf = Cid::raw(b"x").to_bytes();
        buf[2] = 0x12;
        assert!(matches!(Cid::from_bytes(&buf), Err(TypeError::InvalidCid(_))));
    }

    #[test]
    fn rejects_truncated_digest() {
        let buf = Cid::raw(b"x").to_bytes();
        assert!(matches!(
            Cid::from_bytes(&buf[..20]),
            Err(TypeError::InvalidLength { .. })
        ));
    }

    #[test]
    fn text_form_parses_back() {
        let cid = Cid::cbor(b"text");
        let text = cid.to_string();
        assert!(text.starts_with("f01711e20"));
        assert_eq!(text.parse::<Cid>().unwrap(), cid);
    }

    #[test]
    fn text_form_requires_base16_prefix() {
        let text = Cid::cbor(b"text").to_string();
        assert_eq!(
            text[1..].parse::<Cid>().unwrap_err(),
            TypeError::UnsupportedMultibase(Some('0'))
        );
        assert_eq!(
            "".parse::<Cid>().unwrap_err(),
            TypeError::UnsupportedMultibase(None)
        );
    }

    #[test]
    fn verify_detects_tampering() {
        let cid = Cid::cbor(b"original");
        assert!(cid.verify(b"original"));
        assert!(!cid.verify(b"tampered"));
    }

    #[test]
    fn json_uses_text_form() {
        let cid = Cid::raw(b"json");
        let json = serde_json::to_string(&cid).unwrap();
        assert_eq!(json, format!("\"{cid}\""));
        let parsed: Cid = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, cid);
    }

    #[test]
    fn bincode_uses_binary_form() {
        let cid = Cid::cbor(b"bincode");
        let encoded = bincode::serialize(&cid).unwrap();
        // u64 length prefix plus the binary form.
        assert_eq!(encoded.len(), 8 + CID_BYTES_LEN);
        let decoded: Cid = bincode::deserialize(&encoded).unwrap();
        assert_eq!(decoded, cid);
    }

    #[test]
    fn debug_is_short() {
        let cid = Cid::cbor(b"dbg");
        let debug = format!("{cid:?}");
        assert!(debug.starts_with("Cid(dag-cbor:"));
        assert_eq!(debug.len(), "Cid(dag-cbor:)".len() + 8);
    }
}
