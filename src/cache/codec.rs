//! Binary layout of a persisted score cache.
//!
//! All integers and floats are little-endian:
//!
//! ```text
//! [magic "PSCA": 4][version: 1]
//! [sentinel unknown: f32][sentinel forced match: f32][sentinel forced no-match: f32]
//! [slots n: u32][map length m: u32]
//! m x [tag: u16][value: u64][record: u64][index: u32]     sorted by key
//! n(n+1)/2 x [score: f32]
//! [crc32 of everything after the magic: u32]
//! ```
//!
//! The sentinel encoding is stored so a future version can change it without
//! misreading old files.

use std::collections::{HashMap, HashSet};
use std::io::{Error as IoError, ErrorKind, Result as IoResult};

use crc32fast::Hasher;

use super::{packed_len, PairwiseScores, FORCED_MATCH, FORCED_NO_MATCH, UNKNOWN};
use crate::signature::{FieldRef, SignatureKey};

/// Current layout version.
pub const CACHE_VERSION: u8 = 1;

/// Magic bytes identifying a score cache file.
pub const MAGIC: [u8; 4] = *b"PSCA";

const MAP_ENTRY_LEN: usize = 2 + 8 + 8 + 4;

fn invalid(message: impl Into<String>) -> IoError {
    IoError::new(ErrorKind::InvalidData, message.into())
}

/// Serializes a cluster.
///
/// # Errors
/// Fails if the cluster is too large for the 32-bit header fields.
pub fn encode(scores: &PairwiseScores) -> IoResult<Vec<u8>> {
    let slots = u32::try_from(scores.slots).map_err(|_| invalid("too many cache slots"))?;
    let map_len = u32::try_from(scores.index.len()).map_err(|_| invalid("too many cache members"))?;

    let mut entries: Vec<(&SignatureKey, &usize)> = scores.index.iter().collect();
    entries.sort_by_key(|(k, _)| **k);

    let mut out = Vec::with_capacity(
        4 + 1 + 12 + 8 + entries.len() * MAP_ENTRY_LEN + scores.packed.len() * 4 + 4,
    );
    out.extend_from_slice(&MAGIC);
    out.push(CACHE_VERSION);
    out.extend_from_slice(&UNKNOWN.to_le_bytes());
    out.extend_from_slice(&FORCED_MATCH.to_le_bytes());
    out.extend_from_slice(&FORCED_NO_MATCH.to_le_bytes());
    out.extend_from_slice(&slots.to_le_bytes());
    out.extend_from_slice(&map_len.to_le_bytes());

    for (key, idx) in entries {
        let idx = u32::try_from(*idx).map_err(|_| invalid("cache index overflow"))?;
        out.extend_from_slice(&key.field.tag.to_le_bytes());
        out.extend_from_slice(&key.field.value.to_le_bytes());
        out.extend_from_slice(&key.record.to_le_bytes());
        out.extend_from_slice(&idx.to_le_bytes());
    }

    for value in &scores.packed {
        out.extend_from_slice(&value.to_le_bytes());
    }

    let mut hasher = Hasher::new();
    hasher.update(&out[MAGIC.len()..]);
    out.extend_from_slice(&hasher.finalize().to_le_bytes());

    Ok(out)
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> IoResult<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| IoError::new(ErrorKind::UnexpectedEof, "truncated score cache"))?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> IoResult<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u16(&mut self) -> IoResult<u16> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    fn u32(&mut self) -> IoResult<u32> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    fn u64(&mut self) -> IoResult<u64> {
        Ok(u64::from_le_bytes(self.array()?))
    }

    fn f32(&mut self) -> IoResult<f32> {
        Ok(f32::from_le_bytes(self.array()?))
    }
}

/// Deserializes a cluster, verifying magic, version, sentinels, checksum and
/// index map consistency.
///
/// # Errors
/// Returns `InvalidData` or `UnexpectedEof` on any corruption.
pub fn decode(bytes: &[u8]) -> IoResult<PairwiseScores> {
    if bytes.len() < MAGIC.len() + 4 {
        return Err(IoError::new(ErrorKind::UnexpectedEof, "truncated score cache"));
    }
    if bytes[..MAGIC.len()] != MAGIC {
        return Err(invalid(format!(
            "invalid magic bytes: expected {:?}, got {:?}",
            MAGIC,
            &bytes[..MAGIC.len()]
        )));
    }

    let (body, crc_bytes) = bytes.split_at(bytes.len() - 4);
    let stored_crc = u32::from_le_bytes([crc_bytes[0], crc_bytes[1], crc_bytes[2], crc_bytes[3]]);
    let mut hasher = Hasher::new();
    hasher.update(&body[MAGIC.len()..]);
    let computed_crc = hasher.finalize();
    if stored_crc != computed_crc {
        return Err(invalid(format!(
            "CRC mismatch: stored={stored_crc:08x}, computed={computed_crc:08x} (data corrupted)"
        )));
    }

    let mut r = Reader {
        buf: body,
        pos: MAGIC.len(),
    };

    let version = r.array::<1>()?[0];
    if version != CACHE_VERSION {
        return Err(invalid(format!(
            "unsupported cache version: {version} (expected {CACHE_VERSION})"
        )));
    }

    let sentinels = [r.f32()?, r.f32()?, r.f32()?];
    if sentinels != [UNKNOWN, FORCED_MATCH, FORCED_NO_MATCH] {
        return Err(invalid(format!("unsupported sentinel encoding: {sentinels:?}")));
    }

    let slots = r.u32()? as usize;
    let map_len = r.u32()? as usize;
    if map_len > slots {
        return Err(invalid(format!("index map has {map_len} entries for {slots} slots")));
    }

    let expected = map_len
        .checked_mul(MAP_ENTRY_LEN)
        .and_then(|m| packed_len_checked(slots).and_then(|p| p.checked_mul(4)).and_then(|p| p.checked_add(m)))
        .ok_or_else(|| invalid("score cache dimensions overflow"))?;
    if body.len() - r.pos != expected {
        return Err(invalid(format!(
            "score cache body is {} bytes, expected {expected}",
            body.len() - r.pos
        )));
    }

    let mut index = HashMap::with_capacity(map_len);
    let mut used = HashSet::with_capacity(map_len);
    let mut previous: Option<SignatureKey> = None;
    for _ in 0..map_len {
        let tag = r.u16()?;
        let value = r.u64()?;
        let record = r.u64()?;
        let idx = r.u32()? as usize;
        let key = SignatureKey::new(FieldRef::new(tag, value), record);

        if idx >= slots || !used.insert(idx) {
            return Err(invalid(format!("invalid dense index {idx} for {key}")));
        }
        if previous.is_some_and(|p| p >= key) {
            return Err(invalid("index map is not strictly sorted"));
        }
        previous = Some(key);
        index.insert(key, idx);
    }

    let mut packed = Vec::with_capacity(packed_len(slots));
    for _ in 0..packed_len(slots) {
        packed.push(r.f32()?);
    }

    Ok(PairwiseScores {
        index,
        packed,
        slots,
    })
}

fn packed_len_checked(n: usize) -> Option<usize> {
    n.checked_mul(n.checked_add(1)?).map(|v| v / 2)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::PairScore;

    fn sample() -> PairwiseScores {
        let a = SignatureKey::new(FieldRef::new(100, 1), 10);
        let b = SignatureKey::new(FieldRef::new(700, 2), 10);
        let c = SignatureKey::new(FieldRef::new(700, 5), 11);
        let mut scores = PairwiseScores::open([a, b, c]);
        scores.set(&a, &b, PairScore::Value(0.25)).unwrap();
        scores.set(&a, &c, PairScore::ForcedMatch).unwrap();
        scores.set(&b, &c, PairScore::ForcedNoMatch).unwrap();
        scores
    }

    #[test]
    fn test_roundtrip() {
        let scores = sample();
        let bytes = encode(&scores).unwrap();
        assert_eq!(&bytes[..4], b"PSCA");
        let decoded = decode(&bytes).unwrap();
        assert_eq!(decoded, scores);
    }

    #[test]
    fn test_detects_corruption() {
        let mut bytes = encode(&sample()).unwrap();
        let mid = bytes.len() / 2;
        bytes[mid] ^= 0xFF;
        let err = decode(&bytes).unwrap_err();
        assert!(err.to_string().contains("CRC"));
    }

    #[test]
    fn test_detects_truncation() {
        let bytes = encode(&sample()).unwrap();
        assert!(decode(&bytes[..bytes.len() - 7]).is_err());
        assert!(decode(&bytes[..3]).is_err());
    }

    #[test]
    fn test_rejects_bad_magic() {
        let mut bytes = encode(&sample()).unwrap();
        bytes[0] = b'X';
        assert!(decode(&bytes).unwrap_err().to_string().contains("magic"));
    }

    #[test]
    fn test_rejects_unknown_version() {
        let mut bytes = encode(&sample()).unwrap();
        bytes[4] = CACHE_VERSION + 1;
        // Re-seal so only the version check can fail.
        let body_end = bytes.len() - 4;
        let mut hasher = Hasher::new();
        hasher.update(&bytes[4..body_end]);
        let crc = hasher.finalize().to_le_bytes();
        bytes[body_end..].copy_from_slice(&crc);
        assert!(decode(&bytes).unwrap_err().to_string().contains("version"));
    }

    #[test]
    fn test_rejects_oversized_header() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&MAGIC);
        bytes.push(CACHE_VERSION);
        bytes.extend_from_slice(&UNKNOWN.to_le_bytes());
        bytes.extend_from_slice(&FORCED_MATCH.to_le_bytes());
        bytes.extend_from_slice(&FORCED_NO_MATCH.to_le_bytes());
        bytes.extend_from_slice(&u32::MAX.to_le_bytes());
        bytes.extend_from_slice(&0u32.to_le_bytes());
        let mut hasher = Hasher::new();
        hasher.update(&bytes[4..]);
        let crc = hasher.finalize();
        bytes.extend_from_slice(&crc.to_le_bytes());

        assert!(decode(&bytes).is_err());
    }

    #[test]
    fn test_empty_cluster_roundtrip() {
        let scores = PairwiseScores::new();
        let decoded = decode(&encode(&scores).unwrap()).unwrap();
        assert!(decoded.is_empty());
        assert_eq!(decoded.slots(), 0);
    }
}
