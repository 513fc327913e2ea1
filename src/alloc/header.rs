//! Allocation metadata header.
//!
//! Pool and direct blocks carry the header in front of the payload:
//!
//! ```text
//! +----------------------+----------------------------+
//! | AllocationHeader 16B | payload (returned pointer) |
//! +----------------------+----------------------------+
//! ```
//!
//! Slab objects carry none; their header is synthesized from the in-slab
//! header found by masking the pointer down to the slab alignment.

use crate::numa::NodeId;
use std::fmt;

pub const HEADER_MAGIC: u32 = 0x4E55_4D41;

/// Size of [`AllocationHeader`] in bytes.
pub const HEADER_SIZE: usize = std::mem::size_of::<AllocationHeader>();

/// Allocation tier that served a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum Tier {
    Direct = 0,
    Pool = 1,
    Slab = 2,
}

impl Tier {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Tier::Direct),
            1 => Some(Tier::Pool),
            2 => Some(Tier::Slab),
            _ => None,
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Tier::Direct => "direct",
            Tier::Pool => "pool",
            Tier::Slab => "slab",
        };
        f.write_str(name)
    }
}

/// Per-allocation metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct AllocationHeader {
    /// Requested payload size
    pub size: u64,
    pub owner_node: NodeId,
    /// Size class index, `u8::MAX` for direct blocks
    pub class_index: u8,
    tier: u8,
    magic: u32,
}

const _: () = assert!(std::mem::size_of::<AllocationHeader>() == 16);

impl AllocationHeader {
    pub fn new(size: usize, tier: Tier, owner_node: NodeId, class_index: u8) -> Self {
        Self {
            size: size as u64,
            owner_node,
            class_index,
            tier: tier as u8,
            magic: HEADER_MAGIC,
        }
    }

    pub fn tier(&self) -> Tier {
        Tier::from_u8(self.tier).unwrap_or(Tier::Direct)
    }

    /// Whether the header was written by this allocator
    pub fn is_valid(&self) -> bool {
        self.magic == HEADER_MAGIC && Tier::from_u8(self.tier).is_some()
    }

    /// Writes the header at `block` and returns the payload pointer.
    ///
    /// # Safety
    ///
    /// `block` must be valid for writes of `HEADER_SIZE` bytes and aligned to 8.
    pub(crate) unsafe fn write_to(self, block: *mut u8) -> *mut u8 {
        // SAFETY: guaranteed by the caller.
        unsafe {
            (block as *mut AllocationHeader).write(self);
            block.add(HEADER_SIZE)
        }
    }

    /// Reads the header in front of a payload pointer.
    ///
    /// # Safety
    ///
    /// `payload` must have been returned by [`AllocationHeader::write_to`]
    /// and its block must still be live.
    pub(crate) unsafe fn read_before(payload: *const u8) -> Self {
        // SAFETY: guaranteed by the caller.
        unsafe { (payload.sub(HEADER_SIZE) as *const AllocationHeader).read() }
    }

    /// Block start for a payload pointer.
    pub(crate) fn block_of(payload: *mut u8) -> *mut u8 {
        payload.wrapping_sub(HEADER_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        assert_eq!(HEADER_SIZE, 16);
    }

    #[test]
    fn test_write_read_header() {
        let mut block = [0u64; 8];
        let base = block.as_mut_ptr() as *mut u8;
        let header = AllocationHeader::new(40, Tier::Pool, 3, 4);

        let payload = unsafe { header.write_to(base) };
        assert_eq!(payload as usize - base as usize, HEADER_SIZE);

        let read = unsafe { AllocationHeader::read_before(payload) };
        assert!(read.is_valid());
        assert_eq!(read, header);
        assert_eq!(read.tier(), Tier::Pool);
        assert_eq!(read.owner_node, 3);
        assert_eq!(AllocationHeader::block_of(payload), base);
    }
}
