//! Byte-string keyspace arithmetic
//!
//! Target strings are ordered lexicographically by bytes and the keyspace
//! is cut into half-open ranges `[start, end)`. The empty string is the
//! lowest key and `FF FF` is used as the end sentinel of the last range.
//!
//! ```text
//!   ""                  7F                      FF FF
//!   |--------------------|-----------------------|
//!        leaf_1                  leaf_2
//! ```

use std::cmp::Reverse;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Exclusive upper bound of the keyspace
pub const KEYSPACE_END: [u8; 2] = [0xFF, 0xFF];

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        hex::decode(text).map_err(serde::de::Error::custom)
    }
}

/// Half-open key range; bounds travel as hex strings
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct KeyRange {
    #[serde(with = "hex_bytes")]
    pub start: Vec<u8>,
    #[serde(with = "hex_bytes")]
    pub end: Vec<u8>,
}

impl fmt::Debug for KeyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", hex::encode(&self.start), hex::encode(&self.end))
    }
}

impl fmt::Display for KeyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl KeyRange {
    pub fn new(start: impl Into<Vec<u8>>, end: impl Into<Vec<u8>>) -> Result<Self> {
        let range = Self {
            start: start.into(),
            end: end.into(),
        };
        if range.start >= range.end {
            return Err(Error::InvalidInput(format!("empty key range {range}")));
        }
        Ok(range)
    }

    /// The whole keyspace
    pub fn full() -> Self {
        Self {
            start: Vec::new(),
            end: KEYSPACE_END.to_vec(),
        }
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        self.start.as_slice() <= key && key < self.end.as_slice()
    }

    pub fn overlaps(&self, other: &KeyRange) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// A key strictly inside the range, if one exists
    pub fn midpoint(&self) -> Option<Vec<u8>> {
        midpoint(&self.start, &self.end)
    }

    /// Split at the midpoint into lower and upper halves
    pub fn split(&self) -> Option<(KeyRange, KeyRange)> {
        let mid = self.midpoint()?;
        Some((
            KeyRange {
                start: self.start.clone(),
                end: mid.clone(),
            },
            KeyRange {
                start: mid,
                end: self.end.clone(),
            },
        ))
    }

    /// Ordering key for "how wide is this range"
    ///
    /// Ranges diverging at an earlier byte are wider; at the same position
    /// the larger byte gap wins.
    pub fn width(&self) -> (Reverse<usize>, u16) {
        let mut i = 0;
        loop {
            let b1 = self.start.get(i).copied();
            let b2 = self.end.get(i).copied().unwrap_or(0);
            match b1 {
                Some(b1) if b1 == b2 => i += 1,
                Some(b1) => return (Reverse(i), u16::from(b2).saturating_sub(u16::from(b1))),
                None => return (Reverse(i), u16::from(b2)),
            }
            if i > self.end.len() {
                return (Reverse(i), 0);
            }
        }
    }
}

/// Shortest convenient key strictly between `start` and `end`
///
/// Walks to the first byte where the bounds differ. A gap of two or more
/// takes the average byte; a gap of exactly one keeps the lower byte and
/// appends a suffix that lands above the rest of `start`. Returns `None`
/// when no key lies strictly inside, e.g. `[41, 41 00)`.
pub fn midpoint(start: &[u8], end: &[u8]) -> Option<Vec<u8>> {
    if start >= end {
        return None;
    }
    let mut prefix = Vec::with_capacity(end.len() + 2);
    for (i, &b2) in end.iter().enumerate() {
        let Some(&b1) = start.get(i) else {
            // start is a proper prefix of end
            if b2 == 0x00 {
                prefix.push(0x00);
                if i + 1 < end.len() {
                    return Some(prefix);
                }
                continue;
            }
            if b2 >= 2 {
                prefix.push(b2 / 2);
            } else {
                prefix.extend_from_slice(&[0x00, 0x80]);
            }
            return Some(prefix);
        };
        if b1 == b2 {
            prefix.push(b1);
            continue;
        }
        if b2 - b1 >= 2 {
            prefix.push(((u16::from(b1) + u16::from(b2)) / 2) as u8);
            return Some(prefix);
        }
        prefix.push(b1);
        prefix.extend(above(&start[i + 1..]));
        return Some(prefix);
    }
    None
}

/// A suffix strictly greater than `tail`
fn above(tail: &[u8]) -> Vec<u8> {
    if tail.first().map_or(true, |&b| b < 0x80) {
        return vec![0x80];
    }
    let mut out = Vec::with_capacity(tail.len() + 1);
    for &b in tail {
        if b == 0xFF {
            out.push(0xFF);
            continue;
        }
        out.push(((u16::from(b) + 0x100) / 2) as u8);
        return out;
    }
    out.push(0x80);
    out
}

// ============================================================================
// Range sets
// ============================================================================

/// Sort and merge overlapping or touching ranges
pub fn normalize(mut ranges: Vec<KeyRange>) -> Vec<KeyRange> {
    ranges.sort();
    let mut out: Vec<KeyRange> = Vec::with_capacity(ranges.len());
    for range in ranges {
        match out.last_mut() {
            Some(last) if range.start <= last.end => {
                if range.end > last.end {
                    last.end = range.end;
                }
            }
            _ => out.push(range),
        }
    }
    out
}

/// Keys covered by `a` but not by `b`
pub fn subtract(a: &[KeyRange], b: &[KeyRange]) -> Vec<KeyRange> {
    let mut out = Vec::new();
    for range in a {
        let mut pieces = vec![range.clone()];
        for cut in b.iter().filter(|cut| cut.overlaps(range)) {
            let mut next = Vec::with_capacity(pieces.len() + 1);
            for piece in pieces {
                if !piece.overlaps(cut) {
                    next.push(piece);
                    continue;
                }
                if piece.start < cut.start {
                    next.push(KeyRange {
                        start: piece.start.clone(),
                        end: cut.start.clone(),
                    });
                }
                if cut.end < piece.end {
                    next.push(KeyRange {
                        start: cut.end.clone(),
                        end: piece.end.clone(),
                    });
                }
            }
            pieces = next;
        }
        out.extend(pieces);
    }
    normalize(out)
}

/// Keys covered by both `a` and `b`
pub fn intersect(a: &[KeyRange], b: &[KeyRange]) -> Vec<KeyRange> {
    subtract(a, &subtract(a, b))
}

/// Whether any range in the set contains `key`
pub fn covers(ranges: &[KeyRange], key: &[u8]) -> bool {
    ranges.iter().any(|r| r.contains(key))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(start: &[u8], end: &[u8]) -> KeyRange {
        KeyRange::new(start.to_vec(), end.to_vec()).unwrap()
    }

    #[test]
    fn test_midpoint_of_full_keyspace() {
        assert_eq!(midpoint(b"", &KEYSPACE_END), Some(vec![0x7F]));
    }

    #[test]
    fn test_midpoint_of_adjacent_bytes() {
        let mid = midpoint(&[0x41], &[0x42]).unwrap();
        assert_eq!(mid, vec![0x41, 0x80]);
        let mid = midpoint(&[0x41, 0x90], &[0x42]).unwrap();
        assert!(mid.as_slice() > [0x41, 0x90].as_slice() && mid.as_slice() < [0x42].as_slice());
    }

    #[test]
    fn test_midpoint_when_start_is_prefix() {
        let mid = midpoint(&[0x41], &[0x41, 0x00, 0x01]).unwrap();
        assert!(mid.as_slice() > [0x41].as_slice());
        assert!(mid.as_slice() < [0x41, 0x00, 0x01].as_slice());
    }

    #[test]
    fn test_unsplittable_range() {
        assert_eq!(midpoint(&[0x41], &[0x41, 0x00]), None);
        assert_eq!(midpoint(&[0x42], &[0x41]), None);
    }

    #[test]
    fn test_midpoint_of_saturated_tail() {
        let start = [0x10, 0xFF, 0xFF];
        let end = [0x11];
        let mid = midpoint(&start, &end).unwrap();
        assert!(mid.as_slice() > start.as_slice() && mid.as_slice() < end.as_slice());
    }

    #[test]
    fn test_width_prefers_earlier_divergence() {
        let wide = KeyRange::full();
        let narrow = range(&[0x41, 0x00], &[0x41, 0x10]);
        assert!(wide.width() > narrow.width());
    }

    #[test]
    fn test_subtract_and_intersect() {
        let whole = vec![KeyRange::full()];
        let middle = vec![range(&[0x40], &[0x50])];
        let rest = subtract(&whole, &middle);
        assert_eq!(rest.len(), 2);
        assert!(!covers(&rest, &[0x45]));
        assert!(covers(&rest, &[0x30]));
        assert!(covers(&rest, &[0x60]));
        assert_eq!(intersect(&whole, &middle), middle);
    }

    #[test]
    fn test_normalize_merges_touching() {
        let merged = normalize(vec![range(&[0x50], &[0x60]), range(&[], &[0x50])]);
        assert_eq!(merged, vec![range(&[], &[0x60])]);
    }

    #[test]
    fn test_hex_wire_format() {
        let json = serde_json::to_string(&KeyRange::full()).unwrap();
        assert_eq!(json, r#"{"start":"","end":"ffff"}"#);
        let back: KeyRange = serde_json::from_str(&json).unwrap();
        assert_eq!(back, KeyRange::full());
    }
}
