//! Owned node-local buffers.

use super::header::{AllocationHeader, Tier};
use super::slab::SlabArena;
use super::{AllocatorInner, NodeAllocator};
use crate::numa::NodeId;
use std::borrow::Borrow;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;
use std::sync::Arc;

/// A block of node-local memory, returned to its allocator on drop.
///
/// Equality and hashing look at the bytes only, so buffers can key hash
/// maps and be looked up by `&[u8]`.
pub struct NodeBuf {
    ptr: NonNull<u8>,
    len: usize,
    tier: Tier,
    owner: Arc<AllocatorInner>,
}

// SAFETY: NodeBuf owns its block exclusively; shared access is read-only.
unsafe impl Send for NodeBuf {}
unsafe impl Sync for NodeBuf {}

impl NodeBuf {
    pub(crate) fn from_raw(
        ptr: NonNull<u8>,
        len: usize,
        tier: Tier,
        owner: Arc<AllocatorInner>,
    ) -> Self {
        Self {
            ptr,
            len,
            tier,
            owner,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn tier(&self) -> Tier {
        self.tier
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    /// Metadata header of the block
    pub fn header(&self) -> AllocationHeader {
        // SAFETY: the block is live for as long as self.
        unsafe {
            match self.tier {
                Tier::Slab => SlabArena::header_of(self.ptr),
                Tier::Pool | Tier::Direct => AllocationHeader::read_before(self.ptr.as_ptr()),
            }
        }
    }

    /// Node that owns the memory
    pub fn node(&self) -> NodeId {
        self.header().owner_node
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr is valid for len initialized bytes.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: ptr is valid for len bytes and uniquely owned.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }

    /// Allocator this buffer returns to
    pub fn allocator(&self) -> NodeAllocator {
        NodeAllocator::from_inner(self.owner.clone())
    }
}

impl Drop for NodeBuf {
    fn drop(&mut self) {
        // SAFETY: the block came from this allocator and is released once.
        unsafe { self.owner.free_raw(self.ptr, self.len, self.tier) };
    }
}

impl Deref for NodeBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl DerefMut for NodeBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.as_mut_slice()
    }
}

impl AsRef<[u8]> for NodeBuf {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl Borrow<[u8]> for NodeBuf {
    fn borrow(&self) -> &[u8] {
        self.as_slice()
    }
}

impl PartialEq for NodeBuf {
    fn eq(&self, other: &Self) -> bool {
        self.as_slice() == other.as_slice()
    }
}

impl Eq for NodeBuf {}

impl Hash for NodeBuf {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.as_slice().hash(state);
    }
}

impl fmt::Debug for NodeBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeBuf")
            .field("len", &self.len)
            .field("tier", &self.tier)
            .field("node", &self.node())
            .finish()
    }
}
