//! Size class tables shared by the slab and pool tiers

/// Block sizes served by node pools, header included.
pub const POOL_SIZE_CLASSES: [usize; 16] = [
    16, 32, 48, 64, 96, 128, 192, 256, 384, 512, 768, 1024, 1536, 2048, 3072, 4096,
];

/// Object sizes served by slab arenas (the pool classes up to 512).
pub const SLAB_SIZE_CLASSES: [usize; 10] = [16, 32, 48, 64, 96, 128, 192, 256, 384, 512];

/// Largest request served from a slab.
pub const SLAB_MAX_OBJECT_SIZE: usize = 512;

/// Largest block (request plus header) served from a pool.
pub const POOL_MAX_ALLOC_SIZE: usize = 4096;

/// Alignment of every pool block and direct allocation.
pub const BLOCK_ALIGN: usize = 16;

/// A size class: a fixed slot size and its position in the table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeClass {
    /// Size of slots in this class (bytes)
    pub slot_size: usize,
    /// Index of this size class
    pub index: u8,
}

impl SizeClass {
    /// Smallest pool class that fits `size` bytes
    pub fn for_pool(size: usize) -> Option<Self> {
        Self::lookup(&POOL_SIZE_CLASSES, size)
    }

    /// Smallest slab class that fits `size` bytes
    pub fn for_slab(size: usize) -> Option<Self> {
        Self::lookup(&SLAB_SIZE_CLASSES, size)
    }

    fn lookup(table: &[usize], size: usize) -> Option<Self> {
        let index = table.partition_point(|&slot| slot < size);
        table.get(index).map(|&slot_size| Self {
            slot_size,
            index: index as u8,
        })
    }

    /// Check if a given size fits in this size class
    pub fn can_fit(&self, size: usize) -> bool {
        size <= self.slot_size
    }

    /// Chunk capacity used when a pool of this class grows
    pub fn chunk_size(&self) -> usize {
        match self.slot_size {
            0..=256 => 16 * 1024,
            257..=1024 => 64 * 1024,
            _ => 256 * 1024,
        }
    }
}

/// Rounds `size` up to a multiple of `align` (a power of two).
#[inline]
pub const fn align_up(size: usize, align: usize) -> usize {
    (size + align - 1) & !(align - 1)
}
