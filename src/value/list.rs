//! Segmented lists.
//!
//! A list is a deque of segments, each a packed run of length-prefixed
//! entries in one node-local buffer. Segments may be stored zstd-compressed;
//! the header fields (`count`, `raw_len`) stay outside the payload so they
//! can be copied without decompressing.

use super::compression::{compress_if_smaller, decompress};
use crate::alloc::{NodeAllocator, NodeBuf};
use crate::error::{Error, Result};
use crate::numa::NodeId;
use std::collections::VecDeque;

/// Default number of entries per segment.
pub const DEFAULT_SEGMENT_ENTRIES: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentEncoding {
    Raw,
    Compressed { raw_len: usize },
}

#[derive(Debug)]
pub struct Segment {
    pub(crate) buf: NodeBuf,
    pub(crate) count: usize,
    pub(crate) encoding: SegmentEncoding,
}

fn pack(items: &[&[u8]]) -> Result<Vec<u8>> {
    let mut packed = Vec::with_capacity(items.iter().map(|i| 4 + i.len()).sum());
    for item in items {
        let len = u32::try_from(item.len())
            .map_err(|_| Error::InvalidArgument(format!("list entry of {} bytes too large", item.len())))?;
        packed.extend_from_slice(&len.to_le_bytes());
        packed.extend_from_slice(item);
    }
    Ok(packed)
}

fn unpack(mut data: &[u8]) -> Result<Vec<Vec<u8>>> {
    let mut items = Vec::new();
    while !data.is_empty() {
        if data.len() < 4 {
            return Err(Error::Internal("truncated list segment".to_string()));
        }
        let len = u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as usize;
        let end = 4 + len;
        if data.len() < end {
            return Err(Error::Internal("truncated list segment".to_string()));
        }
        items.push(data[4..end].to_vec());
        data = &data[end..];
    }
    Ok(items)
}

impl Segment {
    pub fn build(alloc: &NodeAllocator, node: NodeId, items: &[&[u8]], compress: bool) -> Result<Self> {
        let packed = pack(items)?;
        let (payload, encoding) = match compress.then(|| compress_if_smaller(&packed)).transpose()? {
            Some(Some(compressed)) => (
                compressed,
                SegmentEncoding::Compressed {
                    raw_len: packed.len(),
                },
            ),
            _ => (packed, SegmentEncoding::Raw),
        };

        Ok(Self {
            buf: alloc.allocate_copy(&payload, node)?,
            count: items.len(),
            encoding,
        })
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn encoding(&self) -> SegmentEncoding {
        self.encoding
    }

    pub fn is_compressed(&self) -> bool {
        matches!(self.encoding, SegmentEncoding::Compressed { .. })
    }

    pub fn node(&self) -> NodeId {
        self.buf.node()
    }

    /// Decoded entries
    pub fn entries(&self) -> Result<Vec<Vec<u8>>> {
        match self.encoding {
            SegmentEncoding::Raw => unpack(&self.buf),
            SegmentEncoding::Compressed { raw_len } => {
                let raw = decompress(&self.buf)?;
                if raw.len() != raw_len {
                    return Err(Error::Internal(format!(
                        "segment decompressed to {} bytes, expected {}",
                        raw.len(),
                        raw_len
                    )));
                }
                unpack(&raw)
            }
        }
    }
}

/// Segment sizing and compression
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListOptions {
    pub segment_entries: usize,
    pub compress: bool,
}

impl Default for ListOptions {
    fn default() -> Self {
        Self {
            segment_entries: DEFAULT_SEGMENT_ENTRIES,
            compress: false,
        }
    }
}

#[derive(Debug)]
pub struct SegmentedList {
    pub(crate) segments: VecDeque<Segment>,
    pub(crate) len: usize,
    pub(crate) node: NodeId,
}

impl SegmentedList {
    pub fn new(node: NodeId) -> Self {
        Self {
            segments: VecDeque::new(),
            len: 0,
            node,
        }
    }

    pub fn build<T: AsRef<[u8]>>(
        alloc: &NodeAllocator,
        node: NodeId,
        items: &[T],
        options: ListOptions,
    ) -> Result<Self> {
        let per_segment = options.segment_entries.max(1);
        let refs: Vec<&[u8]> = items.iter().map(|i| i.as_ref()).collect();
        let segments = refs
            .chunks(per_segment)
            .map(|chunk| Segment::build(alloc, node, chunk, options.compress))
            .collect::<Result<VecDeque<_>>>()?;

        Ok(Self {
            segments,
            len: items.len(),
            node,
        })
    }

    /// Appends one entry, starting a new segment when the tail is full.
    pub fn push_back(&mut self, alloc: &NodeAllocator, item: &[u8], options: ListOptions) -> Result<()> {
        let per_segment = options.segment_entries.max(1);
        match self.segments.back_mut() {
            Some(tail) if tail.count < per_segment => {
                let mut entries = tail.entries()?;
                entries.push(item.to_vec());
                let refs: Vec<&[u8]> = entries.iter().map(|e| e.as_slice()).collect();
                *tail = Segment::build(alloc, self.node, &refs, tail.is_compressed() || options.compress)?;
            }
            _ => {
                self.segments
                    .push_back(Segment::build(alloc, self.node, &[item], options.compress)?);
            }
        }
        self.len += 1;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn segments(&self) -> impl Iterator<Item = &Segment> {
        self.segments.iter()
    }

    /// All entries, head to tail
    pub fn to_vec(&self) -> Result<Vec<Vec<u8>>> {
        let mut out = Vec::with_capacity(self.len);
        for segment in &self.segments {
            out.extend(segment.entries()?);
        }
        Ok(out)
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
    fn test_build_splits_segments() {
        let alloc = alloc();
        let items: Vec<Vec<u8>> = (0..10).map(|i| format!("item-{}", i).into_bytes()).collect();
        let list = SegmentedList::build(
            &alloc,
            1,
            &items,
            ListOptions {
                segment_entries: 4,
                compress: false,
            },
        )
        .unwrap();

        assert_eq!(list.len(), 10);
        assert_eq!(list.segments().map(|s| s.len()).collect::<Vec<_>>(), vec![4, 4, 2]);
        assert!(list.segments().all(|s| s.node() == 1));
        assert_eq!(list.to_vec().unwrap(), items);
    }

    #[test]
    fn test_compressed_segments_decode() {
        let alloc = alloc();
        let items = vec![b"repetitive payload ".repeat(20); 8];
        let list = SegmentedList::build(
            &alloc,
            0,
            &items,
            ListOptions {
                segment_entries: 8,
                compress: true,
            },
        )
        .unwrap();

        let segment = list.segments().next().unwrap();
        assert!(segment.is_compressed());
        assert!(segment.buf.len() < items.iter().map(|i| i.len() + 4).sum::<usize>());
        assert_eq!(list.to_vec().unwrap(), items);
    }

    #[test]
    fn test_push_back_fills_tail_then_grows() {
        let alloc = alloc();
        let options = ListOptions {
            segment_entries: 2,
            compress: false,
        };
        let mut list = SegmentedList::new(0);
        for item in [&b"a"[..], b"b", b"c"] {
            list.push_back(&alloc, item, options).unwrap();
        }
        assert_eq!(list.segments().count(), 2);
        assert_eq!(list.to_vec().unwrap(), vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
    }
}
