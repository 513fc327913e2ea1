//! Node pools for mid-size blocks.
//!
//! One pool per (node, size class). A pool owns a list of chunks that are
//! carved with a bump pointer, and a LIFO free list of returned blocks.
//! Every free-list entry carries the class size, so reusing the head never
//! hands out a block that is too small.

use super::size_class::{align_up, SizeClass, BLOCK_ALIGN, POOL_SIZE_CLASSES};
use crate::config::AllocatorConfig;
use crate::numa::{NodeId, NodeMemory};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

struct Chunk {
    base: NonNull<u8>,
    capacity: usize,
    bump: usize,
    /// Bytes handed out and not yet returned
    used: usize,
}

impl Chunk {
    fn contains(&self, ptr: NonNull<u8>) -> bool {
        let start = self.base.as_ptr() as usize;
        let addr = ptr.as_ptr() as usize;
        addr >= start && addr < start + self.capacity
    }
}

struct FreeBlock {
    ptr: NonNull<u8>,
    size: usize,
}

#[derive(Default)]
struct ClassPool {
    /// Chunks keyed by base address
    chunks: BTreeMap<usize, Chunk>,
    /// Base of the chunk currently carved by the bump pointer
    newest: Option<usize>,
    free: Vec<FreeBlock>,
}

// SAFETY: chunk memory is only reached through the owning pool's mutex or by
// the holder of a block carved from it.
unsafe impl Send for ClassPool {}

impl ClassPool {
    fn chunk_containing(&mut self, ptr: NonNull<u8>) -> Option<&mut Chunk> {
        self.chunks
            .range_mut(..=ptr.as_ptr() as usize)
            .next_back()
            .map(|(_, chunk)| chunk)
            .filter(|chunk| chunk.contains(ptr))
    }
}

#[derive(Default)]
struct NodeCounters {
    reuse_hits: AtomicU64,
    bump_hits: AtomicU64,
    chunks_allocated: AtomicU64,
    chunks_released: AtomicU64,
    bytes_allocated: AtomicU64,
    free_lists_dropped: AtomicU64,
}

/// Pool statistics for one node
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PoolStats {
    pub reuse_hits: u64,
    pub bump_hits: u64,
    pub chunks_allocated: u64,
    pub chunks_released: u64,
    pub bytes_allocated: u64,
    pub free_lists_dropped: u64,
    pub live_chunks: usize,
    pub chunk_bytes: usize,
    pub used_bytes: usize,
    pub free_blocks: usize,
}

/// Result of one compaction pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CompactionReport {
    pub chunks_released: usize,
    pub bytes_released: usize,
    pub free_lists_dropped: usize,
}

/// Per-node, per-class chunk pools.
pub struct NodePool {
    memory: Arc<dyn NodeMemory>,
    pools: Vec<Mutex<ClassPool>>,
    counters: Vec<NodeCounters>,
    free_list_max: usize,
    utilization_threshold: f64,
    min_free_ratio: f64,
}

impl NodePool {
    pub fn new(memory: Arc<dyn NodeMemory>, config: &AllocatorConfig) -> Self {
        let nodes = memory.node_count();
        Self {
            pools: (0..nodes * POOL_SIZE_CLASSES.len())
                .map(|_| Mutex::new(ClassPool::default()))
                .collect(),
            counters: (0..nodes).map(|_| NodeCounters::default()).collect(),
            memory,
            free_list_max: config.compact_free_list_max,
            utilization_threshold: config.compact_utilization_threshold,
            min_free_ratio: config.compact_min_free_ratio,
        }
    }

    fn pool(&self, node: NodeId, class_index: u8) -> &Mutex<ClassPool> {
        &self.pools[node as usize * POOL_SIZE_CLASSES.len() + class_index as usize]
    }

    /// Allocates a block of at least `block_size` bytes on `node`.
    ///
    /// Returns the block start and its class.
    pub fn allocate(&self, block_size: usize, node: NodeId) -> Option<(NonNull<u8>, SizeClass)> {
        let class = SizeClass::for_pool(align_up(block_size, BLOCK_ALIGN))?;
        let size = class.slot_size;
        let counters = &self.counters[node as usize];
        let mut pool = self.pool(node, class.index).lock();

        // Free-list head
        if pool.free.last().is_some_and(|head| head.size >= size) {
            if let Some(block) = pool.free.pop() {
                if let Some(chunk) = pool.chunk_containing(block.ptr) {
                    chunk.used += block.size;
                }
                counters.reuse_hits.fetch_add(1, Ordering::Relaxed);
                counters.bytes_allocated.fetch_add(size as u64, Ordering::Relaxed);
                return Some((block.ptr, class));
            }
        }

        // Bump the most recent chunk
        let newest = pool.newest;
        if let Some(chunk) = newest.and_then(|base| pool.chunks.get_mut(&base)) {
            if chunk.bump + size <= chunk.capacity {
                // SAFETY: bump + size stays within the chunk.
                let ptr = unsafe { NonNull::new_unchecked(chunk.base.as_ptr().add(chunk.bump)) };
                chunk.bump += size;
                chunk.used += size;
                counters.bump_hits.fetch_add(1, Ordering::Relaxed);
                counters.bytes_allocated.fetch_add(size as u64, Ordering::Relaxed);
                return Some((ptr, class));
            }
        }

        let capacity = class.chunk_size().max(size);
        let base = self.memory.alloc_region(capacity, BLOCK_ALIGN, node)?;
        debug!(
            "New {}-byte chunk on node {} for {}-byte blocks",
            capacity, node, size
        );
        pool.chunks.insert(
            base.as_ptr() as usize,
            Chunk {
                base,
                capacity,
                bump: size,
                used: size,
            },
        );
        pool.newest = Some(base.as_ptr() as usize);
        counters.chunks_allocated.fetch_add(1, Ordering::Relaxed);
        counters.bump_hits.fetch_add(1, Ordering::Relaxed);
        counters.bytes_allocated.fetch_add(size as u64, Ordering::Relaxed);
        Some((base, class))
    }

    /// Returns a block to the free list of its (node, class).
    ///
    /// # Safety
    ///
    /// `block` must come from [`NodePool::allocate`] on this pool with the
    /// same node and class, and must not be used afterwards.
    pub unsafe fn free(&self, block: NonNull<u8>, node: NodeId, class_index: u8) {
        let size = POOL_SIZE_CLASSES[class_index as usize];
        let mut pool = self.pool(node, class_index).lock();
        if let Some(chunk) = pool.chunk_containing(block) {
            chunk.used = chunk.used.saturating_sub(size);
        }
        pool.free.push(FreeBlock { ptr: block, size });
    }

    /// used/capacity over the chunks of one (node, class) pool
    pub fn utilization(&self, node: NodeId, class_index: u8) -> f64 {
        if node as usize >= self.counters.len() || class_index as usize >= POOL_SIZE_CLASSES.len() {
            return 0.0;
        }
        let pool = self.pool(node, class_index).lock();
        let (used, capacity) = pool
            .chunks
            .values()
            .fold((0usize, 0usize), |(u, c), chunk| (u + chunk.used, c + chunk.capacity));
        if capacity == 0 {
            0.0
        } else {
            used as f64 / capacity as f64
        }
    }

    /// Drops oversized free lists and releases idle chunks.
    ///
    /// A chunk is released only when it is under the utilization threshold,
    /// has at least the minimum free fraction, and holds no live block.
    pub fn compact(&self) -> CompactionReport {
        let mut report = CompactionReport::default();
        let classes = POOL_SIZE_CLASSES.len();

        for (i, pool) in self.pools.iter().enumerate() {
            let node = (i / classes) as NodeId;
            let counters = &self.counters[node as usize];
            let mut pool = pool.lock();

            if pool.free.len() > self.free_list_max {
                pool.free.clear();
                report.free_lists_dropped += 1;
                counters.free_lists_dropped.fetch_add(1, Ordering::Relaxed);
            }

            let idle: Vec<usize> = pool
                .chunks
                .iter()
                .filter(|(_, chunk)| {
                    let utilization = chunk.used as f64 / chunk.capacity as f64;
                    let free_ratio = (chunk.capacity - chunk.used) as f64 / chunk.capacity as f64;
                    chunk.used == 0
                        && utilization < self.utilization_threshold
                        && free_ratio >= self.min_free_ratio
                })
                .map(|(&base, _)| base)
                .collect();

            for base in idle {
                if let Some(chunk) = pool.chunks.remove(&base) {
                    if pool.newest == Some(base) {
                        pool.newest = None;
                    }
                    pool.free.retain(|b| !chunk.contains(b.ptr));
                    // SAFETY: no live block and no free-list entry points into the chunk.
                    unsafe {
                        self.memory
                            .free_region(chunk.base, chunk.capacity, BLOCK_ALIGN, node)
                    };
                    report.chunks_released += 1;
                    report.bytes_released += chunk.capacity;
                    counters.chunks_released.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        if report.chunks_released > 0 || report.free_lists_dropped > 0 {
            debug!(
                "Pool compaction released {} chunk(s) ({} bytes), dropped {} free list(s)",
                report.chunks_released, report.bytes_released, report.free_lists_dropped
            );
        }
        report
    }

    /// Statistics for `node`
    pub fn stats(&self, node: NodeId) -> PoolStats {
        let Some(counters) = self.counters.get(node as usize) else {
            return PoolStats::default();
        };
        let mut stats = PoolStats {
            reuse_hits: counters.reuse_hits.load(Ordering::Relaxed),
            bump_hits: counters.bump_hits.load(Ordering::Relaxed),
            chunks_allocated: counters.chunks_allocated.load(Ordering::Relaxed),
            chunks_released: counters.chunks_released.load(Ordering::Relaxed),
            bytes_allocated: counters.bytes_allocated.load(Ordering::Relaxed),
            free_lists_dropped: counters.free_lists_dropped.load(Ordering::Relaxed),
            ..Default::default()
        };
        for class_index in 0..POOL_SIZE_CLASSES.len() {
            let pool = self.pool(node, class_index as u8).lock();
            stats.live_chunks += pool.chunks.len();
            stats.chunk_bytes += pool.chunks.values().map(|c| c.capacity).sum::<usize>();
            stats.used_bytes += pool.chunks.values().map(|c| c.used).sum::<usize>();
            stats.free_blocks += pool.free.len();
        }
        stats
    }

    pub fn reset_stats(&self) {
        for counters in &self.counters {
            counters.reuse_hits.store(0, Ordering::Relaxed);
            counters.bump_hits.store(0, Ordering::Relaxed);
            counters.chunks_allocated.store(0, Ordering::Relaxed);
            counters.chunks_released.store(0, Ordering::Relaxed);
            counters.bytes_allocated.store(0, Ordering::Relaxed);
            counters.free_lists_dropped.store(0, Ordering::Relaxed);
        }
    }
}

impl Drop for NodePool {
    fn drop(&mut self) {
        let classes = POOL_SIZE_CLASSES.len();
        let memory = &self.memory;
        for (i, pool) in self.pools.iter_mut().enumerate() {
            let node = (i / classes) as NodeId;
            for chunk in std::mem::take(&mut pool.get_mut().chunks).into_values() {
                // SAFETY: pool teardown; no blocks outlive the pool.
                unsafe { memory.free_region(chunk.base, chunk.capacity, BLOCK_ALIGN, node) };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::numa::SimulatedTopology;

    fn pool() -> (Arc<SimulatedTopology>, NodePool) {
        let topo = Arc::new(SimulatedTopology::new(2, 1 << 30));
        let pool = NodePool::new(topo.clone(), &AllocatorConfig::default());
        (topo, pool)
    }

    #[test]
    fn test_bump_then_reuse_lifo() {
        let (topo, pool) = pool();

        let (a, class) = pool.allocate(600, 0).unwrap();
        let (b, _) = pool.allocate(600, 0).unwrap();
        assert_eq!(class.slot_size, 768);
        assert_eq!(b.as_ptr() as usize - a.as_ptr() as usize, 768);
        assert_eq!(topo.live_regions(0), 1);

        unsafe {
            pool.free(a, 0, class.index);
            pool.free(b, 0, class.index);
        }
        // LIFO: last freed comes back first
        assert_eq!(pool.allocate(700, 0).unwrap().0, b);
        assert_eq!(pool.allocate(700, 0).unwrap().0, a);

        let stats = pool.stats(0);
        assert_eq!(stats.reuse_hits, 2);
        assert_eq!(stats.chunks_allocated, 1);
    }

    #[test]
    fn test_chunk_growth_by_class() {
        let (topo, pool) = pool();
        // 16 KiB chunk of 256-byte blocks holds 64
        for _ in 0..65 {
            pool.allocate(256, 1).unwrap();
        }
        assert_eq!(topo.live_regions(1), 2);
        assert_eq!(topo.region_bytes(1), 2 * 16 * 1024);
        assert!((pool.utilization(1, SizeClass::for_pool(256).unwrap().index) - 65.0 / 128.0).abs() < 1e-9);
    }

    #[test]
    fn test_compaction_keeps_live_chunks() {
        let (topo, pool) = pool();
        let (live, class) = pool.allocate(1000, 0).unwrap();
        let (dead, _) = pool.allocate(1000, 0).unwrap();
        unsafe { pool.free(dead, 0, class.index) };

        // 1 KiB used out of 64 KiB, but a block is still live
        let report = pool.compact();
        assert_eq!(report.chunks_released, 0);
        assert_eq!(topo.live_regions(0), 1);

        unsafe { pool.free(live, 0, class.index) };
        let report = pool.compact();
        assert_eq!(report.chunks_released, 1);
        assert_eq!(topo.live_regions(0), 0);
        // Entries inside the released chunk were purged
        assert_eq!(pool.stats(0).free_blocks, 0);
    }

    #[test]
    fn test_frees_are_charged_to_their_own_chunk() {
        let (topo, pool) = pool();
        // Four 16 KiB chunks of 256-byte blocks
        let blocks: Vec<_> = (0..256).map(|_| pool.allocate(256, 0).unwrap()).collect();
        assert_eq!(topo.live_regions(0), 4);
        let class = blocks[0].1;

        // The first 64 blocks were carved from the first chunk
        for (ptr, _) in &blocks[..64] {
            unsafe { pool.free(*ptr, 0, class.index) };
        }
        assert_eq!(pool.stats(0).used_bytes, 192 * 256);

        let report = pool.compact();
        assert_eq!(report.chunks_released, 1);
        assert_eq!(topo.live_regions(0), 3);

        // The surviving chunks stay full; the next block needs a fresh chunk
        pool.allocate(256, 0).unwrap();
        assert_eq!(topo.live_regions(0), 4);
        assert_eq!(pool.stats(0).used_bytes, 193 * 256);
    }

    #[test]
    fn test_compaction_drops_long_free_lists() {
        let (_topo, pool) = pool();
        let blocks: Vec<_> = (0..12).map(|_| pool.allocate(100, 0).unwrap()).collect();
        // Keep one live block so the chunk survives
        for (ptr, class) in &blocks[1..] {
            unsafe { pool.free(*ptr, 0, class.index) };
        }
        assert_eq!(pool.stats(0).free_blocks, 11);

        let report = pool.compact();
        assert_eq!(report.free_lists_dropped, 1);
        assert_eq!(report.chunks_released, 0);
        assert_eq!(pool.stats(0).free_blocks, 0);
    }
}
