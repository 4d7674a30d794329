// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Order-preserving composite key encoding.
//!
//! A composite key is the byte string a sorted structure (index tree,
//! result set, reactive tree) orders by. Keys are built by concatenating,
//! per field:
//!
//! - a single type-tag byte (tags ascend in the fixed cross-tag value
//!   order: null < bool < int < number < string),
//! - a fixed-width, order-preserving encoding of the value:
//!   - bool: one byte,
//!   - int: sign-bit-complemented 64-bit big-endian (preserves
//!     two's-complement order),
//!   - number: IEEE-754 bits with a sign-flip rewrite (preserves
//!     totally-ordered IEEE-754),
//!   - string: raw bytes terminated by two zero bytes, with any
//!     intra-string zero escaped as `0x00 0x01`,
//!   - edge ref: the parent's node id as 64-bit big-endian.
//!
//! For descending fields every emitted byte is bit-inverted, tag included.
//! The string terminator `0x00 0x00` becomes `0xFF 0xFF` under inversion
//! and still sorts strings correctly; this property is load-bearing and
//! tested explicitly below.
//!
//! Field appends past the writer's length bound silently truncate: a
//! truncated key is still a valid inequality prefix. The trailing node-id
//! tiebreaker is exempt from the bound so distinct nodes never collide.

use bytes::{BufMut, Bytes, BytesMut};

use crate::ident::NodeId;
use crate::value::Value;

/// Sort direction of one key component.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum Direction {
    /// Ascending (the default).
    #[default]
    Asc,
    /// Descending.
    Desc,
}

impl Direction {
    /// Applies the direction to one emitted byte.
    #[inline]
    pub(crate) const fn apply(self, byte: u8) -> u8 {
        match self {
            Self::Asc => byte,
            Self::Desc => !byte,
        }
    }

    /// Returns the opposite direction.
    #[must_use]
    pub const fn reversed(self) -> Self {
        match self {
            Self::Asc => Self::Desc,
            Self::Desc => Self::Asc,
        }
    }
}

/// Default bound on the encoded length of one key, excluding the node-id
/// tail. Appends past the bound are silently dropped.
pub const DEFAULT_MAX_KEY_LEN: usize = 512;

const TAG_NULL: u8 = 0x01;
const TAG_BOOL: u8 = 0x02;
const TAG_INT: u8 = 0x03;
const TAG_NUMBER: u8 = 0x04;
const TAG_STRING: u8 = 0x05;
const TAG_EDGE: u8 = 0x06;

const SIGN_BIT: u64 = 1 << 63;

/// An order-preserving byte-encoded composite key.
///
/// Comparison is plain byte-lexicographic comparison; the encoding
/// guarantees that agrees with the source values' order. Cloning is cheap
/// (`Bytes` is reference-counted).
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct CompoundKey(Bytes);

impl CompoundKey {
    /// The empty key (sorts before every non-empty key).
    #[must_use]
    pub const fn empty() -> Self {
        Self(Bytes::new())
    }

    /// Returns the raw encoded bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Encoded length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` if the key is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub(crate) fn into_bytes(self) -> Bytes {
        self.0
    }
}

impl std::fmt::Debug for CompoundKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CompoundKey(")?;
        for b in &self.0 {
            write!(f, "{b:02x}")?;
        }
        write!(f, ")")
    }
}

impl From<Bytes> for CompoundKey {
    fn from(bytes: Bytes) -> Self {
        Self(bytes)
    }
}

/// Incremental writer for composite keys.
///
/// One writer builds one key: push fields in order, then [`KeyWriter::finish`].
/// A writer may also be seeded from an existing key prefix (ancestry-prefixed
/// keys in nested results).
#[derive(Debug)]
pub struct KeyWriter {
    buf: BytesMut,
    max_len: usize,
}

impl KeyWriter {
    /// Creates a writer with the default length bound.
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_len(DEFAULT_MAX_KEY_LEN)
    }

    /// Creates a writer with an explicit length bound.
    #[must_use]
    pub fn with_max_len(max_len: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            max_len,
        }
    }

    /// Creates a writer seeded with an existing key prefix.
    ///
    /// The prefix counts against the length bound.
    #[must_use]
    pub fn with_prefix(prefix: &CompoundKey, max_len: usize) -> Self {
        let mut buf = BytesMut::with_capacity(prefix.len() + 16);
        buf.put_slice(prefix.as_bytes());
        Self { buf, max_len }
    }

    #[inline]
    fn put(&mut self, byte: u8, dir: Direction) {
        if self.buf.len() < self.max_len {
            self.buf.put_u8(dir.apply(byte));
        }
    }

    fn put_u64(&mut self, v: u64, dir: Direction) {
        for byte in v.to_be_bytes() {
            self.put(byte, dir);
        }
    }

    /// Appends one scalar value with the field's direction.
    pub fn push_value(&mut self, value: &Value, dir: Direction) {
        match value {
            Value::Null => self.put(TAG_NULL, dir),
            Value::Bool(b) => {
                self.put(TAG_BOOL, dir);
                self.put(u8::from(*b), dir);
            }
            Value::Int(i) => {
                self.put(TAG_INT, dir);
                #[allow(clippy::cast_sign_loss)]
                self.put_u64((*i as u64) ^ SIGN_BIT, dir);
            }
            Value::Number(n) => {
                self.put(TAG_NUMBER, dir);
                let bits = n.to_bits();
                let rewritten = if bits & SIGN_BIT != 0 { !bits } else { bits | SIGN_BIT };
                self.put_u64(rewritten, dir);
            }
            Value::String(s) => {
                self.put(TAG_STRING, dir);
                for &b in s.as_bytes() {
                    if b == 0x00 {
                        self.put(0x00, dir);
                        self.put(0x01, dir);
                    } else {
                        self.put(b, dir);
                    }
                }
                self.put(0x00, dir);
                self.put(0x00, dir);
            }
        }
    }

    /// Appends a cross-entity edge reference: the parent's node id, or the
    /// null tag when the edge has no target.
    pub fn push_edge_ref(&mut self, parent: Option<NodeId>, dir: Direction) {
        match parent {
            None => self.put(TAG_NULL, dir),
            Some(id) => {
                self.put(TAG_EDGE, dir);
                self.put_u64(id.get(), dir);
            }
        }
    }

    /// Appends the trailing node-id tiebreaker.
    ///
    /// Always ascending and exempt from the length bound, so two distinct
    /// nodes never produce equal keys.
    pub fn push_node_id(&mut self, id: NodeId) {
        self.buf.put_u64(id.get());
    }

    /// Freezes the writer into a key.
    #[must_use]
    pub fn finish(self) -> CompoundKey {
        CompoundKey(self.buf.freeze())
    }
}

impl Default for KeyWriter {
    fn default() -> Self {
        Self::new()
    }
}

/// Smallest byte string strictly greater than every string with `prefix` as
/// a prefix, or `None` when no such bound exists (all-`0xFF` prefix).
///
/// Used to turn an equality prefix into a half-open scan range.
pub(crate) fn prefix_successor(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut out = prefix.to_vec();
    while let Some(last) = out.last_mut() {
        if *last == 0xFF {
            out.pop();
        } else {
            *last += 1;
            return Some(out);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    fn key_of(value: &Value, dir: Direction) -> CompoundKey {
        let mut w = KeyWriter::new();
        w.push_value(value, dir);
        w.finish()
    }

    fn assert_order_preserved(values: &[Value], dir: Direction) {
        for (i, a) in values.iter().enumerate() {
            for b in &values[i + 1..] {
                let (ka, kb) = (key_of(a, dir), key_of(b, dir));
                match dir {
                    Direction::Asc => assert!(ka < kb, "{a} should encode below {b}"),
                    Direction::Desc => assert!(ka > kb, "{a} should encode above {b} descending"),
                }
            }
        }
    }

    fn ladder() -> Vec<Value> {
        vec![
            Value::Null,
            Value::Bool(false),
            Value::Bool(true),
            Value::Int(i64::MIN),
            Value::Int(-1),
            Value::Int(0),
            Value::Int(1),
            Value::Int(i64::MAX),
            Value::Number(f64::NEG_INFINITY),
            Value::Number(-1.5),
            Value::Number(-0.0),
            Value::Number(0.0),
            Value::Number(2.5),
            Value::Number(f64::INFINITY),
            Value::from(""),
            Value::from("a"),
            Value::from("a\u{0}b"),
            Value::from("ab"),
            Value::from("b"),
        ]
    }

    #[test]
    fn ascending_encoding_preserves_value_order() {
        assert_order_preserved(&ladder(), Direction::Asc);
    }

    #[test]
    fn descending_encoding_inverts_value_order() {
        assert_order_preserved(&ladder(), Direction::Desc);
    }

    #[test]
    fn intra_string_zero_bytes_sort_correctly() {
        // "a\0" < "a\0\0" < "a\x01": escaping must not reorder.
        let v1 = Value::from("a\u{0}");
        let v2 = Value::from("a\u{0}\u{0}");
        let v3 = Value::from("a\u{1}");
        assert_order_preserved(&[v1, v2, v3], Direction::Asc);
    }

    #[test]
    fn descending_string_terminator_is_ff_ff() {
        let key = key_of(&Value::from("hi"), Direction::Desc);
        let bytes = key.as_bytes();
        assert_eq!(&bytes[bytes.len() - 2..], &[0xFF, 0xFF]);
        // Prefix relationships still invert correctly: "h" > "hi" descending.
        let shorter = key_of(&Value::from("h"), Direction::Desc);
        assert!(shorter > key);
    }

    #[test]
    fn node_id_tail_breaks_ties_ascending_regardless_of_direction() {
        for dir in [Direction::Asc, Direction::Desc] {
            let mut a = KeyWriter::new();
            a.push_value(&Value::Int(7), dir);
            a.push_node_id(NodeId::from_raw(1));
            let mut b = KeyWriter::new();
            b.push_value(&Value::Int(7), dir);
            b.push_node_id(NodeId::from_raw(2));
            assert!(a.finish() < b.finish());
        }
    }

    #[test]
    fn appends_past_the_bound_truncate_silently() {
        let mut w = KeyWriter::with_max_len(4);
        w.push_value(&Value::from("a very long string"), Direction::Asc);
        let key = w.finish();
        assert_eq!(key.len(), 4);
    }

    #[test]
    fn truncated_keys_are_valid_inequality_prefixes() {
        let mut a = KeyWriter::with_max_len(6);
        a.push_value(&Value::from("abcdefgh"), Direction::Asc);
        let mut b = KeyWriter::with_max_len(6);
        b.push_value(&Value::from("abzzzzzz"), Direction::Asc);
        assert!(a.finish() < b.finish());
    }

    #[test]
    fn node_id_tail_is_exempt_from_the_bound() {
        let mut w = KeyWriter::with_max_len(2);
        w.push_value(&Value::from("long enough to truncate"), Direction::Asc);
        w.push_node_id(NodeId::from_raw(42));
        let key = w.finish();
        assert_eq!(key.len(), 2 + 8);
        assert_eq!(&key.as_bytes()[2..], &42_u64.to_be_bytes());
    }

    #[test]
    fn edge_refs_group_by_parent() {
        let mut a = KeyWriter::new();
        a.push_edge_ref(Some(NodeId::from_raw(3)), Direction::Asc);
        a.push_value(&Value::Int(9), Direction::Asc);
        let ka = a.finish();
        let mut b = KeyWriter::new();
        b.push_edge_ref(Some(NodeId::from_raw(4)), Direction::Asc);
        b.push_value(&Value::Int(0), Direction::Asc);
        // Parent id dominates the later sort field.
        assert!(ka < b.finish());
        // Unlinked (null) refs sort before any parent.
        let mut c = KeyWriter::new();
        c.push_edge_ref(None, Direction::Asc);
        assert!(c.finish() < ka);
    }

    #[test]
    fn prefix_successor_handles_ff_runs() {
        assert_eq!(prefix_successor(&[1, 2, 3]), Some(vec![1, 2, 4]));
        assert_eq!(prefix_successor(&[1, 0xFF, 0xFF]), Some(vec![2]));
        assert_eq!(prefix_successor(&[0xFF, 0xFF]), None);
    }
}
