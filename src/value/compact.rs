//! Compact blobs: small containers packed into one buffer.
//!
//! Pair encodings store `[u32 len][bytes]` records back to back; integer
//! sets store sorted little-endian `i64`s.

use crate::alloc::{NodeAllocator, NodeBuf};
use crate::error::{Error, Result};
use crate::numa::NodeId;

const LEN_PREFIX: usize = 4;

/// What a compact blob holds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactKind {
    /// field, value, field, value, ...
    HashPairs,
    /// sorted i64 members
    IntSet,
    /// member, score (f64 LE), ... ordered by score
    SortedPairs,
}

#[derive(Debug)]
pub struct CompactBlob {
    pub(crate) buf: NodeBuf,
    pub(crate) kind: CompactKind,
    /// Number of logical entries (pairs count as one)
    pub(crate) entries: usize,
}

impl CompactBlob {
    /// Packs length-prefixed records.
    pub fn encode_records(
        alloc: &NodeAllocator,
        node: NodeId,
        kind: CompactKind,
        records: &[&[u8]],
    ) -> Result<Self> {
        if kind == CompactKind::IntSet {
            return Err(Error::InvalidArgument(
                "integer sets are packed with encode_ints".to_string(),
            ));
        }
        if records.len() % 2 != 0 {
            return Err(Error::InvalidArgument(format!(
                "{} records do not form pairs",
                records.len()
            )));
        }

        let total: usize = records.iter().map(|r| LEN_PREFIX + r.len()).sum();
        let mut buf = alloc.try_allocate(total, node)?;
        let mut offset = 0;
        for record in records {
            let len = u32::try_from(record.len()).map_err(|_| {
                Error::InvalidArgument(format!("record of {} bytes too large", record.len()))
            })?;
            buf[offset..offset + LEN_PREFIX].copy_from_slice(&len.to_le_bytes());
            offset += LEN_PREFIX;
            buf[offset..offset + record.len()].copy_from_slice(record);
            offset += record.len();
        }

        Ok(Self {
            buf,
            kind,
            entries: records.len() / 2,
        })
    }

    /// Packs a sorted integer set.
    pub fn encode_ints(alloc: &NodeAllocator, node: NodeId, members: &[i64]) -> Result<Self> {
        let mut sorted = members.to_vec();
        sorted.sort_unstable();
        sorted.dedup();

        let mut buf = alloc.try_allocate(sorted.len() * 8, node)?;
        for (chunk, v) in buf.chunks_exact_mut(8).zip(&sorted) {
            chunk.copy_from_slice(&v.to_le_bytes());
        }
        Ok(Self {
            buf,
            kind: CompactKind::IntSet,
            entries: sorted.len(),
        })
    }

    pub fn kind(&self) -> CompactKind {
        self.kind
    }

    pub fn len(&self) -> usize {
        self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries == 0
    }

    pub fn byte_len(&self) -> usize {
        self.buf.len()
    }

    pub fn node(&self) -> NodeId {
        self.buf.node()
    }

    /// Raw records of a pair encoding.
    pub fn records(&self) -> Records<'_> {
        Records {
            data: if self.kind == CompactKind::IntSet {
                &[]
            } else {
                self.buf.as_slice()
            },
        }
    }

    /// Members of an integer set.
    pub fn ints(&self) -> impl Iterator<Item = i64> + '_ {
        let data: &[u8] = if self.kind == CompactKind::IntSet {
            self.buf.as_slice()
        } else {
            &[]
        };
        data.chunks_exact(8).map(|c| {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(c);
            i64::from_le_bytes(raw)
        })
    }

    /// Pairs of a pair encoding.
    pub fn pairs(&self) -> impl Iterator<Item = (&[u8], &[u8])> + '_ {
        let mut records = self.records();
        std::iter::from_fn(move || Some((records.next()?, records.next()?)))
    }
}

/// Iterator over length-prefixed records
pub struct Records<'a> {
    data: &'a [u8],
}

impl<'a> Iterator for Records<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<&'a [u8]> {
        if self.data.len() < LEN_PREFIX {
            return None;
        }
        let mut raw = [0u8; LEN_PREFIX];
        raw.copy_from_slice(&self.data[..LEN_PREFIX]);
        let len = u32::from_le_bytes(raw) as usize;
        let end = (LEN_PREFIX + len).min(self.data.len());
        let record = &self.data[LEN_PREFIX..end];
        self.data = &self.data[end..];
        Some(record)
    }
}
