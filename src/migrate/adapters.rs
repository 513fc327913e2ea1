//! Per-encoding copy routines.
//!
//! Each adapter builds a complete replacement on the target node and never
//! touches the source. Dropping a partially built replacement releases
//! whatever it already allocated, so a failure leaves no trace.

use crate::alloc::NodeAllocator;
use crate::error::{Error, Result};
use crate::numa::NodeId;
use crate::value::{
    CompactBlob, HashTable, Member, OrderedSet, Segment, SegmentedList, SetTable, Value,
};
use std::collections::VecDeque;

/// A copy of a value living on the target node.
pub(crate) struct Relocated {
    pub value: Value,
    pub bytes: usize,
}

pub(crate) fn relocate(value: &Value, alloc: &NodeAllocator, target: NodeId) -> Result<Relocated> {
    let relocated = match value {
        Value::Int(n) => Relocated {
            value: Value::Int(*n),
            bytes: 0,
        },
        Value::Scalar(buf) => Relocated {
            value: Value::Scalar(alloc.allocate_copy(buf, target)?),
            bytes: buf.len(),
        },
        Value::Compact(blob) => {
            let copy = copy_compact(blob, alloc, target)?;
            let bytes = copy.byte_len();
            Relocated {
                value: Value::Compact(copy),
                bytes,
            }
        }
        Value::Hash(table) => copy_hash(table, alloc, target)?,
        Value::Set(table) => copy_set(table, alloc, target)?,
        Value::List(list) => copy_list(list, alloc, target)?,
        Value::Ordered(set) => copy_ordered(set, alloc, target)?,
        Value::Stream(_) => {
            return Err(Error::UnsupportedType(format!(
                "no migration adapter for {} values",
                value.kind()
            )))
        }
    };
    Ok(relocated)
}

fn copy_compact(blob: &CompactBlob, alloc: &NodeAllocator, target: NodeId) -> Result<CompactBlob> {
    Ok(CompactBlob {
        buf: alloc.allocate_copy(&blob.buf, target)?,
        kind: blob.kind,
        entries: blob.entries,
    })
}

fn copy_hash(table: &HashTable, alloc: &NodeAllocator, target: NodeId) -> Result<Relocated> {
    let mut copy = HashTable::with_capacity(target, table.len());
    let mut bytes = 0;
    for (field, value) in &table.map {
        let field = alloc.allocate_copy(field, target)?;
        let value = alloc.allocate_copy(value, target)?;
        bytes += field.len() + value.len();
        copy.map.insert(field, value);
    }
    Ok(Relocated {
        value: Value::Hash(copy),
        bytes,
    })
}

fn copy_set(table: &SetTable, alloc: &NodeAllocator, target: NodeId) -> Result<Relocated> {
    let mut copy = SetTable::with_capacity(target, table.len());
    let mut bytes = 0;
    for member in &table.set {
        let member = alloc.allocate_copy(member, target)?;
        bytes += member.len();
        copy.set.insert(member);
    }
    Ok(Relocated {
        value: Value::Set(copy),
        bytes,
    })
}

/// Copies segments head to tail. Compressed payloads move verbatim along
/// with their encoding header.
fn copy_list(list: &SegmentedList, alloc: &NodeAllocator, target: NodeId) -> Result<Relocated> {
    let mut segments = VecDeque::with_capacity(list.segments.len());
    let mut bytes = 0;
    for segment in &list.segments {
        bytes += segment.buf.len();
        segments.push_back(Segment {
            buf: alloc.allocate_copy(&segment.buf, target)?,
            count: segment.count,
            encoding: segment.encoding,
        });
    }
    Ok(Relocated {
        value: Value::List(SegmentedList {
            segments,
            len: list.len,
            node: target,
        }),
        bytes,
    })
}

/// Rebuilds the ordering tail to head so every insertion is a prepend.
fn copy_ordered(set: &OrderedSet, alloc: &NodeAllocator, target: NodeId) -> Result<Relocated> {
    let mut copy = OrderedSet::with_capacity(target, set.len());
    let mut bytes = 0;
    for (score, member) in set.entries.iter().rev() {
        let buf = alloc.allocate_copy(member.as_slice(), target)?;
        bytes += buf.len();
        copy.push_front_sorted(Member::new(buf), *score);
    }
    Ok(Relocated {
        value: Value::Ordered(copy),
        bytes,
    })
}
