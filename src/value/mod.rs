//! Value containers backed by node-local memory.
//!
//! [`Value`] is the closed set of encodings the store keeps. Each one knows
//! how to walk its buffers, which is all migration needs. [`PlainValue`] is
//! the heap-independent form used to build values and to compare content.

pub mod compact;
pub mod compression;
pub mod list;
pub mod ordered;
pub mod table;

pub use compact::{CompactBlob, CompactKind};
pub use list::{ListOptions, Segment, SegmentEncoding, SegmentedList};
pub use ordered::{Member, OrderedSet};
pub use table::{HashTable, SetTable};

use crate::alloc::{NodeAllocator, NodeBuf};
use crate::error::{Error, Result};
use crate::numa::NodeId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Logical type of a value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueKind {
    String,
    Hash,
    Set,
    List,
    Zset,
    Stream,
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueKind::String => "string",
            ValueKind::Hash => "hash",
            ValueKind::Set => "set",
            ValueKind::List => "list",
            ValueKind::Zset => "zset",
            ValueKind::Stream => "stream",
        };
        f.write_str(name)
    }
}

/// Physical encoding of a value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    Int,
    Raw,
    Compact,
    Table,
    Segmented,
    Skiplist,
    Stream,
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Encoding::Int => "int",
            Encoding::Raw => "raw",
            Encoding::Compact => "compact",
            Encoding::Table => "table",
            Encoding::Segmented => "segmented",
            Encoding::Skiplist => "skiplist",
            Encoding::Stream => "stream",
        };
        f.write_str(name)
    }
}

/// Append-only log of entries. No migration adapter exists for it.
#[derive(Debug)]
pub struct StreamLog {
    pub(crate) entries: Vec<(u64, NodeBuf)>,
    pub(crate) node: NodeId,
}

impl StreamLog {
    pub fn build(alloc: &NodeAllocator, node: NodeId, entries: &[(u64, Vec<u8>)]) -> Result<Self> {
        let entries = entries
            .iter()
            .map(|(id, data)| Ok((*id, alloc.allocate_copy(data, node)?)))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { entries, node })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug)]
pub enum Value {
    /// Integer stored inline, no backing memory
    Int(i64),
    Scalar(NodeBuf),
    Compact(CompactBlob),
    Hash(HashTable),
    Set(SetTable),
    List(SegmentedList),
    Ordered(OrderedSet),
    Stream(StreamLog),
}

/// Heap-independent content of a value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum PlainValue {
    Bytes(Vec<u8>),
    Hash(BTreeMap<Vec<u8>, Vec<u8>>),
    Set(BTreeSet<Vec<u8>>),
    List(Vec<Vec<u8>>),
    /// Members with scores, ascending by (score, member)
    Zset(Vec<(Vec<u8>, f64)>),
    Stream(Vec<(u64, Vec<u8>)>),
}

impl PlainValue {
    /// Content bytes, used to size placement decisions.
    pub fn byte_size(&self) -> usize {
        match self {
            PlainValue::Bytes(b) => b.len(),
            PlainValue::Hash(map) => map.iter().map(|(k, v)| k.len() + v.len()).sum(),
            PlainValue::Set(members) => members.iter().map(Vec::len).sum(),
            PlainValue::List(items) => items.iter().map(Vec::len).sum(),
            PlainValue::Zset(members) => members.iter().map(|(m, _)| m.len() + 8).sum(),
            PlainValue::Stream(entries) => entries.iter().map(|(_, b)| b.len() + 8).sum(),
        }
    }
}

/// Thresholds deciding between compact and expanded encodings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodingHints {
    pub compact_max_entries: usize,
    pub compact_max_value: usize,
    pub intset_max_entries: usize,
    pub list: ListOptions,
}

impl Default for EncodingHints {
    fn default() -> Self {
        Self {
            compact_max_entries: 128,
            compact_max_value: 64,
            intset_max_entries: 512,
            list: ListOptions::default(),
        }
    }
}

/// Parses bytes that are the canonical decimal form of an i64.
fn canonical_int(bytes: &[u8]) -> Option<i64> {
    if bytes.is_empty() || bytes.len() > 20 {
        return None;
    }
    let text = std::str::from_utf8(bytes).ok()?;
    let n: i64 = text.parse().ok()?;
    (n.to_string().as_bytes() == bytes).then_some(n)
}

impl Value {
    /// Encodes `plain` on `node`, choosing the encoding from `hints`.
    pub fn build(alloc: &NodeAllocator, node: NodeId, plain: &PlainValue, hints: &EncodingHints) -> Result<Self> {
        let fits = |len: usize, mut sizes: std::slice::Iter<'_, usize>| {
            len <= hints.compact_max_entries && sizes.all(|s| *s <= hints.compact_max_value)
        };

        let value = match plain {
            PlainValue::Bytes(bytes) => match canonical_int(bytes) {
                Some(n) => Value::Int(n),
                None => Value::Scalar(alloc.allocate_copy(bytes, node)?),
            },
            PlainValue::Hash(map) => {
                let sizes: Vec<usize> = map.iter().flat_map(|(k, v)| [k.len(), v.len()]).collect();
                if fits(map.len(), sizes.iter()) {
                    let records: Vec<&[u8]> = map
                        .iter()
                        .flat_map(|(k, v)| [k.as_slice(), v.as_slice()])
                        .collect();
                    Value::Compact(CompactBlob::encode_records(alloc, node, CompactKind::HashPairs, &records)?)
                } else {
                    Value::Hash(HashTable::build(alloc, node, map.iter())?)
                }
            }
            PlainValue::Set(members) => {
                let ints: Option<Vec<i64>> = members.iter().map(|m| canonical_int(m)).collect();
                match ints {
                    Some(ints) if !ints.is_empty() && ints.len() <= hints.intset_max_entries => {
                        Value::Compact(CompactBlob::encode_ints(alloc, node, &ints)?)
                    }
                    _ => Value::Set(SetTable::build(alloc, node, members.iter())?),
                }
            }
            PlainValue::List(items) => Value::List(SegmentedList::build(alloc, node, items, hints.list)?),
            PlainValue::Zset(members) => {
                if members.iter().any(|(_, s)| s.is_nan()) {
                    return Err(Error::InvalidArgument("score is not a number".to_string()));
                }
                let sizes: Vec<usize> = members.iter().map(|(m, _)| m.len()).collect();
                if fits(members.len(), sizes.iter()) {
                    // A repeated member keeps its last score, as in the ordered set
                    let unique: BTreeMap<&[u8], f64> =
                        members.iter().map(|(m, score)| (m.as_slice(), *score)).collect();
                    let mut sorted: Vec<(&[u8], f64)> = unique.into_iter().collect();
                    sorted.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(b.0)));
                    let scores: Vec<[u8; 8]> = sorted.iter().map(|(_, s)| s.to_le_bytes()).collect();
                    let records: Vec<&[u8]> = sorted
                        .iter()
                        .zip(&scores)
                        .flat_map(|((m, _), s)| [*m, s.as_slice()])
                        .collect();
                    Value::Compact(CompactBlob::encode_records(alloc, node, CompactKind::SortedPairs, &records)?)
                } else {
                    Value::Ordered(OrderedSet::build(alloc, node, members)?)
                }
            }
            PlainValue::Stream(entries) => Value::Stream(StreamLog::build(alloc, node, entries)?),
        };
        Ok(value)
    }

    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Int(_) | Value::Scalar(_) => ValueKind::String,
            Value::Compact(blob) => match blob.kind() {
                CompactKind::HashPairs => ValueKind::Hash,
                CompactKind::IntSet => ValueKind::Set,
                CompactKind::SortedPairs => ValueKind::Zset,
            },
            Value::Hash(_) => ValueKind::Hash,
            Value::Set(_) => ValueKind::Set,
            Value::List(_) => ValueKind::List,
            Value::Ordered(_) => ValueKind::Zset,
            Value::Stream(_) => ValueKind::Stream,
        }
    }

    pub fn encoding(&self) -> Encoding {
        match self {
            Value::Int(_) => Encoding::Int,
            Value::Scalar(_) => Encoding::Raw,
            Value::Compact(_) => Encoding::Compact,
            Value::Hash(_) | Value::Set(_) => Encoding::Table,
            Value::List(_) => Encoding::Segmented,
            Value::Ordered(_) => Encoding::Skiplist,
            Value::Stream(_) => Encoding::Stream,
        }
    }

    /// Node holding the value's memory; `None` for inline integers.
    pub fn node(&self) -> Option<NodeId> {
        match self {
            Value::Int(_) => None,
            Value::Scalar(buf) => Some(buf.node()),
            Value::Compact(blob) => Some(blob.node()),
            Value::Hash(table) => Some(table.node()),
            Value::Set(table) => Some(table.node()),
            Value::List(list) => Some(list.node()),
            Value::Ordered(set) => Some(set.node()),
            Value::Stream(log) => Some(log.node),
        }
    }

    /// Bytes of node memory the value's buffers occupy.
    pub fn payload_bytes(&self) -> usize {
        match self {
            Value::Int(_) => 0,
            Value::Scalar(buf) => buf.len(),
            Value::Compact(blob) => blob.byte_len(),
            Value::Hash(table) => table.map.iter().map(|(k, v)| k.len() + v.len()).sum(),
            Value::Set(table) => table.set.iter().map(|m| m.len()).sum(),
            Value::List(list) => list.segments().map(|s| s.buf.len()).sum(),
            Value::Ordered(set) => set.entries.iter().map(|(_, m)| m.as_slice().len()).sum(),
            Value::Stream(log) => log.entries.iter().map(|(_, b)| b.len()).sum(),
        }
    }

    /// Number of logical elements (bytes for strings)
    pub fn len(&self) -> usize {
        match self {
            Value::Int(n) => n.to_string().len(),
            Value::Scalar(buf) => buf.len(),
            Value::Compact(blob) => blob.len(),
            Value::Hash(table) => table.len(),
            Value::Set(table) => table.len(),
            Value::List(list) => list.len(),
            Value::Ordered(set) => set.len(),
            Value::Stream(log) => log.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Decodes the value into its plain form.
    pub fn to_plain(&self) -> Result<PlainValue> {
        let plain = match self {
            Value::Int(n) => PlainValue::Bytes(n.to_string().into_bytes()),
            Value::Scalar(buf) => PlainValue::Bytes(buf.to_vec()),
            Value::Compact(blob) => match blob.kind() {
                CompactKind::HashPairs => PlainValue::Hash(
                    blob.pairs().map(|(k, v)| (k.to_vec(), v.to_vec())).collect(),
                ),
                CompactKind::IntSet => PlainValue::Set(
                    blob.ints().map(|n| n.to_string().into_bytes()).collect(),
                ),
                CompactKind::SortedPairs => PlainValue::Zset(
                    blob.pairs()
                        .map(|(m, s)| {
                            let raw: [u8; 8] = s.try_into().map_err(|_| {
                                Error::Internal(format!("score record of {} bytes", s.len()))
                            })?;
                            Ok((m.to_vec(), f64::from_le_bytes(raw)))
                        })
                        .collect::<Result<_>>()?,
                ),
            },
            Value::Hash(table) => PlainValue::Hash(
                table.iter().map(|(k, v)| (k.to_vec(), v.to_vec())).collect(),
            ),
            Value::Set(table) => PlainValue::Set(table.iter().map(|m| m.to_vec()).collect()),
            Value::List(list) => PlainValue::List(list.to_vec()?),
            Value::Ordered(set) => PlainValue::Zset(set.iter().map(|(m, s)| (m.to_vec(), s)).collect()),
            Value::Stream(log) => PlainValue::Stream(
                log.entries.iter().map(|(id, b)| (*id, b.to_vec())).collect(),
            ),
        };
        Ok(plain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AllocatorConfig;
    use crate::numa::SimulatedTopology;
    use std::sync::Arc;

    fn alloc() -> NodeAllocator {
        NodeAllocator::new(
            Arc::new(SimulatedTopology::new(2, 1 << 24)),
            &AllocatorConfig::default(),
        )
    }

    #[test]
    fn test_integer_strings_are_inline() {
        let alloc = alloc();
        let hints = EncodingHints::default();
        let v = Value::build(&alloc, 1, &PlainValue::Bytes(b"-42".to_vec()), &hints).unwrap();
        assert_eq!(v.encoding(), Encoding::Int);
        assert_eq!(v.node(), None);
        assert_eq!(v.payload_bytes(), 0);

        // leading zero is not canonical
        let v = Value::build(&alloc, 1, &PlainValue::Bytes(b"007".to_vec()), &hints).unwrap();
        assert_eq!(v.encoding(), Encoding::Raw);
        assert_eq!(v.node(), Some(1));
    }

    #[test]
    fn test_small_hash_is_compact_large_is_table() {
        let alloc = alloc();
        let hints = EncodingHints::default();
        let small: BTreeMap<_, _> = (0..4).map(|i| (vec![i], vec![i; 3])).collect();
        let v = Value::build(&alloc, 0, &PlainValue::Hash(small.clone()), &hints).unwrap();
        assert_eq!(v.encoding(), Encoding::Compact);
        assert_eq!(v.kind(), ValueKind::Hash);
        assert_eq!(v.to_plain().unwrap(), PlainValue::Hash(small));

        let large: BTreeMap<_, _> = (0..200u32)
            .map(|i| (i.to_be_bytes().to_vec(), vec![0u8; 8]))
            .collect();
        let v = Value::build(&alloc, 0, &PlainValue::Hash(large.clone()), &hints).unwrap();
        assert_eq!(v.encoding(), Encoding::Table);
        assert_eq!(v.to_plain().unwrap(), PlainValue::Hash(large));
    }

    #[test]
    fn test_set_encodings() {
        let alloc = alloc();
        let hints = EncodingHints::default();
        let ints: BTreeSet<_> = [b"3".to_vec(), b"-1".to_vec()].into_iter().collect();
        let v = Value::build(&alloc, 0, &PlainValue::Set(ints.clone()), &hints).unwrap();
        assert_eq!(v.encoding(), Encoding::Compact);
        assert_eq!(v.to_plain().unwrap(), PlainValue::Set(ints));

        let words: BTreeSet<_> = [b"a".to_vec(), b"b".to_vec()].into_iter().collect();
        let v = Value::build(&alloc, 0, &PlainValue::Set(words), &hints).unwrap();
        assert_eq!(v.encoding(), Encoding::Table);
    }

    #[test]
    fn test_zset_compact_roundtrip_sorted() {
        let alloc = alloc();
        let members = vec![(b"b".to_vec(), 2.0), (b"a".to_vec(), 1.5)];
        let v = Value::build(&alloc, 0, &PlainValue::Zset(members), &EncodingHints::default()).unwrap();
        assert_eq!(v.kind(), ValueKind::Zset);
        assert_eq!(
            v.to_plain().unwrap(),
            PlainValue::Zset(vec![(b"a".to_vec(), 1.5), (b"b".to_vec(), 2.0)])
        );
    }

    #[test]
    fn test_zset_repeated_member_keeps_last_score() {
        let alloc = alloc();
        let members = vec![(b"a".to_vec(), 9.0), (b"b".to_vec(), 2.0), (b"a".to_vec(), 1.0)];
        let expected = PlainValue::Zset(vec![(b"a".to_vec(), 1.0), (b"b".to_vec(), 2.0)]);

        let compact = Value::build(&alloc, 0, &PlainValue::Zset(members.clone()), &EncodingHints::default()).unwrap();
        assert_eq!(compact.encoding(), Encoding::Compact);
        assert_eq!(compact.to_plain().unwrap(), expected);

        let hints = EncodingHints {
            compact_max_entries: 0,
            ..EncodingHints::default()
        };
        let ordered = Value::build(&alloc, 0, &PlainValue::Zset(members), &hints).unwrap();
        assert_eq!(ordered.encoding(), Encoding::Skiplist);
        assert_eq!(ordered.to_plain().unwrap(), expected);
    }

    #[test]
    fn test_plain_value_json() {
        let plain = PlainValue::List(vec![b"x".to_vec()]);
        let json = serde_json::to_string(&plain).unwrap();
        let back: PlainValue = serde_json::from_str(&json).unwrap();
        assert_eq!(back, plain);
    }
}
