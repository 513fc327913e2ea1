//! Node-local allocator.
//!
//! ```text
//!                    NodeAllocator::try_allocate(size, node)
//!                                   |
//!        +--------------------------+---------------------------+
//!        | size <= 512              | size + header <= 4096     | larger
//!        v                          v                           v
//!   +-----------+             +-----------+              +-------------+
//!   | SlabArena |             | NodePool  |              | direct      |
//!   | (bitmap)  |             | (chunks + |              | node region |
//!   |           |             |  freelist)|              |             |
//!   +-----------+             +-----------+              +-------------+
//!        \__________________________|___________________________/
//!                                   |
//!                         NodeMemory (topology)
//! ```
//!
//! Every allocation is charged to its node, and every free is routed by
//! the owner node recorded in the block's header.

mod handle;
mod header;
mod pool;
mod size_class;
mod slab;

pub use handle::NodeBuf;
pub use header::{AllocationHeader, Tier, HEADER_SIZE};
pub use pool::{CompactionReport, NodePool, PoolStats};
pub use size_class::{
    align_up, SizeClass, BLOCK_ALIGN, POOL_MAX_ALLOC_SIZE, POOL_SIZE_CLASSES, SLAB_MAX_OBJECT_SIZE,
    SLAB_SIZE_CLASSES,
};
pub use slab::{objects_per_slab, SlabArena, SlabStats, SLAB_SIZE};

use crate::config::AllocatorConfig;
use crate::error::{Error, Result};
use crate::numa::{NodeId, NodeMemory, NodeUsage};
use parking_lot::RwLock;
use serde::Serialize;
use std::alloc::Layout;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info};

/// Largest payload a single allocation may request.
///
/// Header and alignment padding must still fit in an `isize`-sized layout.
pub const MAX_ALLOC_SIZE: usize = isize::MAX as usize - HEADER_SIZE - BLOCK_ALIGN;

/// Handler invoked when a primary-path allocation cannot be served.
pub type OomHandler = fn(usize, NodeId) -> !;

/// Logs and aborts through the standard allocation error hook.
pub fn default_oom_handler(size: usize, node: NodeId) -> ! {
    error!(size, node, "Out of memory on node");
    let layout =
        Layout::from_size_align(size.max(1), BLOCK_ALIGN).unwrap_or_else(|_| Layout::new::<u8>());
    std::alloc::handle_alloc_error(layout)
}

#[derive(Default)]
struct TierCounters {
    slab: AtomicU64,
    pool: AtomicU64,
    direct: AtomicU64,
    direct_bytes: AtomicU64,
    frees: AtomicU64,
    failures: AtomicU64,
}

/// Allocator statistics for one node
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct NodeAllocStats {
    pub node: NodeId,
    pub slab_allocations: u64,
    pub pool_allocations: u64,
    pub direct_allocations: u64,
    pub direct_bytes: u64,
    pub frees: u64,
    pub failures: u64,
    pub usage: NodeUsage,
    pub slab: SlabStats,
    pub pool: PoolStats,
}

/// Allocator statistics for all nodes
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AllocatorStats {
    pub nodes: Vec<NodeAllocStats>,
}

impl AllocatorStats {
    pub fn node(&self, node: NodeId) -> Option<&NodeAllocStats> {
        self.nodes.get(node as usize)
    }
}

pub(crate) struct AllocatorInner {
    memory: Arc<dyn NodeMemory>,
    slab: SlabArena,
    pool: NodePool,
    counters: Vec<TierCounters>,
    oom_handler: RwLock<OomHandler>,
}

impl AllocatorInner {
    fn allocate_block(&self, size: usize, node: NodeId) -> Option<(NonNull<u8>, Tier)> {
        let counters = &self.counters[node as usize];

        if size <= SLAB_MAX_OBJECT_SIZE {
            let (ptr, _) = self.slab.allocate(size, node)?;
            counters.slab.fetch_add(1, Ordering::Relaxed);
            return Some((ptr, Tier::Slab));
        }

        let block_size = size.checked_add(HEADER_SIZE)?;
        if block_size <= POOL_MAX_ALLOC_SIZE {
            let (block, class) = self.pool.allocate(block_size, node)?;
            let header = AllocationHeader::new(size, Tier::Pool, node, class.index);
            // SAFETY: pool blocks are 16-byte aligned and hold size + header.
            let payload = unsafe { header.write_to(block.as_ptr()) };
            counters.pool.fetch_add(1, Ordering::Relaxed);
            return NonNull::new(payload).map(|p| (p, Tier::Pool));
        }

        let total = block_size.checked_add(BLOCK_ALIGN - 1)? & !(BLOCK_ALIGN - 1);
        let block = self.memory.alloc_region(total, BLOCK_ALIGN, node)?;
        let header = AllocationHeader::new(size, Tier::Direct, node, u8::MAX);
        // SAFETY: the region holds total >= size + header bytes.
        let payload = unsafe { header.write_to(block.as_ptr()) };
        counters.direct.fetch_add(1, Ordering::Relaxed);
        counters.direct_bytes.fetch_add(total as u64, Ordering::Relaxed);
        NonNull::new(payload).map(|p| (p, Tier::Direct))
    }

    /// Releases a block; the owner node comes from its header.
    ///
    /// # Safety
    ///
    /// `ptr` must be a live payload of `len` bytes from this allocator's `tier`.
    pub(crate) unsafe fn free_raw(&self, ptr: NonNull<u8>, len: usize, tier: Tier) {
        // SAFETY: guaranteed by the caller.
        let owner = unsafe {
            match tier {
                Tier::Slab => {
                    let header = SlabArena::header_of(ptr);
                    self.slab.free(ptr);
                    header.owner_node
                }
                Tier::Pool => {
                    let header = AllocationHeader::read_before(ptr.as_ptr());
                    debug_assert!(header.is_valid());
                    let block = NonNull::new_unchecked(AllocationHeader::block_of(ptr.as_ptr()));
                    self.pool.free(block, header.owner_node, header.class_index);
                    header.owner_node
                }
                Tier::Direct => {
                    let header = AllocationHeader::read_before(ptr.as_ptr());
                    debug_assert!(header.is_valid());
                    let total = align_up(header.size as usize + HEADER_SIZE, BLOCK_ALIGN);
                    let block = NonNull::new_unchecked(AllocationHeader::block_of(ptr.as_ptr()));
                    self.memory
                        .free_region(block, total, BLOCK_ALIGN, header.owner_node);
                    header.owner_node
                }
            }
        };

        self.memory.uncharge(owner, len);
        if let Some(counters) = self.counters.get(owner as usize) {
            counters.frees.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Node-local allocator façade over slab, pool and direct tiers.
///
/// Cheap to clone; clones share the same arenas.
#[derive(Clone)]
pub struct NodeAllocator {
    inner: Arc<AllocatorInner>,
}

impl NodeAllocator {
    pub fn new(memory: Arc<dyn NodeMemory>, config: &AllocatorConfig) -> Self {
        info!(
            "Initializing node allocator: {} node(s), slab <= {} B, pool <= {} B",
            memory.node_count(),
            SLAB_MAX_OBJECT_SIZE,
            POOL_MAX_ALLOC_SIZE
        );

        let inner = AllocatorInner {
            slab: SlabArena::new(memory.clone(), config.empty_slab_cache),
            pool: NodePool::new(memory.clone(), config),
            counters: (0..memory.node_count())
                .map(|_| TierCounters::default())
                .collect(),
            memory,
            oom_handler: RwLock::new(default_oom_handler),
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    pub(crate) fn from_inner(inner: Arc<AllocatorInner>) -> Self {
        Self { inner }
    }

    pub fn memory(&self) -> &Arc<dyn NodeMemory> {
        &self.inner.memory
    }

    pub fn node_count(&self) -> usize {
        self.inner.memory.node_count()
    }

    /// Installs the handler used by [`NodeAllocator::allocate`] on exhaustion.
    pub fn set_oom_handler(&self, handler: OomHandler) {
        *self.inner.oom_handler.write() = handler;
    }

    /// Allocates `size` zeroed bytes on `node`.
    ///
    /// An out-of-range node is clamped to the caller's current node.
    /// Exhaustion is reported as [`Error::OutOfMemory`]; a size above
    /// [`MAX_ALLOC_SIZE`] is an [`Error::InvalidArgument`].
    pub fn try_allocate(&self, size: usize, node: NodeId) -> Result<NodeBuf> {
        if size > MAX_ALLOC_SIZE {
            return Err(Error::InvalidArgument(format!(
                "allocation of {} bytes exceeds the {} byte limit",
                size, MAX_ALLOC_SIZE
            )));
        }
        let memory = &self.inner.memory;
        let node = memory.resolve_node(node);

        if !memory.charge(node, size) {
            self.inner.counters[node as usize]
                .failures
                .fetch_add(1, Ordering::Relaxed);
            return Err(Error::OutOfMemory(format!(
                "node {} cannot hold {} more bytes",
                node, size
            )));
        }

        match self.inner.allocate_block(size, node) {
            Some((ptr, tier)) => {
                // SAFETY: the block holds at least size bytes.
                unsafe { ptr.as_ptr().write_bytes(0, size) };
                Ok(NodeBuf::from_raw(ptr, size, tier, self.inner.clone()))
            }
            None => {
                memory.uncharge(node, size);
                self.inner.counters[node as usize]
                    .failures
                    .fetch_add(1, Ordering::Relaxed);
                Err(Error::OutOfMemory(format!(
                    "no memory for {} bytes on node {}",
                    size, node
                )))
            }
        }
    }

    /// Primary-path allocation: exhaustion invokes the OOM handler.
    pub fn allocate(&self, size: usize, node: NodeId) -> NodeBuf {
        match self.try_allocate(size, node) {
            Ok(buf) => buf,
            Err(_) => self.out_of_memory(size, node),
        }
    }

    /// Hands a failed primary-path request of `size` bytes to the OOM handler.
    pub fn out_of_memory(&self, size: usize, node: NodeId) -> ! {
        let handler = *self.inner.oom_handler.read();
        handler(size, self.inner.memory.resolve_node(node))
    }

    /// Allocates on `node` and copies `bytes` in.
    pub fn allocate_copy(&self, bytes: &[u8], node: NodeId) -> Result<NodeBuf> {
        let mut buf = self.try_allocate(bytes.len(), node)?;
        buf.copy_from_slice(bytes);
        Ok(buf)
    }

    /// Resizes `buf`, possibly onto another node.
    ///
    /// The new block is allocated before the old one is released, so on
    /// failure `buf` is unchanged.
    pub fn reallocate(&self, buf: &mut NodeBuf, new_size: usize, node: NodeId) -> Result<()> {
        let mut fresh = self.try_allocate(new_size, node)?;
        let keep = buf.len().min(new_size);
        fresh[..keep].copy_from_slice(&buf[..keep]);
        *buf = fresh;
        Ok(())
    }

    /// Runs pool compaction on every node.
    pub fn compact(&self) -> CompactionReport {
        self.inner.pool.compact()
    }

    /// Pool utilization of one (node, class)
    pub fn pool_utilization(&self, node: NodeId, class_index: u8) -> f64 {
        self.inner.pool.utilization(node, class_index)
    }

    pub fn stats(&self) -> AllocatorStats {
        let nodes = (0..self.node_count())
            .map(|n| {
                let node = n as NodeId;
                let c = &self.inner.counters[n];
                NodeAllocStats {
                    node,
                    slab_allocations: c.slab.load(Ordering::Relaxed),
                    pool_allocations: c.pool.load(Ordering::Relaxed),
                    direct_allocations: c.direct.load(Ordering::Relaxed),
                    direct_bytes: c.direct_bytes.load(Ordering::Relaxed),
                    frees: c.frees.load(Ordering::Relaxed),
                    failures: c.failures.load(Ordering::Relaxed),
                    usage: self.inner.memory.usage(node),
                    slab: self.inner.slab.stats(node),
                    pool: self.inner.pool.stats(node),
                }
            })
            .collect();
        AllocatorStats { nodes }
    }

    pub fn reset_stats(&self) {
        for c in &self.inner.counters {
            c.slab.store(0, Ordering::Relaxed);
            c.pool.store(0, Ordering::Relaxed);
            c.direct.store(0, Ordering::Relaxed);
            c.direct_bytes.store(0, Ordering::Relaxed);
            c.frees.store(0, Ordering::Relaxed);
            c.failures.store(0, Ordering::Relaxed);
        }
        self.inner.slab.reset_stats();
        self.inner.pool.reset_stats();
        debug!("Allocator statistics reset");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::numa::{with_current_node, SimulatedTopology};

    fn allocator(nodes: usize) -> (Arc<SimulatedTopology>, NodeAllocator) {
        let topo = Arc::new(SimulatedTopology::new(nodes, 1 << 30));
        let alloc = NodeAllocator::new(topo.clone(), &AllocatorConfig::default());
        (topo, alloc)
    }

    #[test]
    fn test_tier_selection() {
        let (_topo, alloc) = allocator(1);

        assert_eq!(alloc.try_allocate(0, 0).unwrap().tier(), Tier::Slab);
        assert_eq!(alloc.try_allocate(512, 0).unwrap().tier(), Tier::Slab);
        assert_eq!(alloc.try_allocate(513, 0).unwrap().tier(), Tier::Pool);
        assert_eq!(
            alloc.try_allocate(POOL_MAX_ALLOC_SIZE - HEADER_SIZE, 0).unwrap().tier(),
            Tier::Pool
        );
        assert_eq!(
            alloc.try_allocate(POOL_MAX_ALLOC_SIZE - HEADER_SIZE + 1, 0).unwrap().tier(),
            Tier::Direct
        );
    }

    #[test]
    fn test_header_records_owner_and_size() {
        let (_topo, alloc) = allocator(2);

        let buf = alloc.try_allocate(1000, 1).unwrap();
        let header = buf.header();
        assert!(header.is_valid());
        assert_eq!(header.size, 1000);
        assert_eq!(header.owner_node, 1);
        assert_eq!(header.tier(), Tier::Pool);
        assert_eq!(POOL_SIZE_CLASSES[header.class_index as usize], 1024);

        let big = alloc.try_allocate(10_000, 1).unwrap();
        assert_eq!(big.node(), 1);
        assert_eq!(big.header().class_index, u8::MAX);
    }

    #[test]
    fn test_out_of_range_node_clamps_to_current() {
        let (_topo, alloc) = allocator(2);
        let buf = with_current_node(1, || alloc.try_allocate(64, 9).unwrap());
        assert_eq!(buf.node(), 1);
    }

    #[test]
    fn test_free_routes_by_owner_node() {
        let (topo, alloc) = allocator(2);

        let buf = alloc.try_allocate(2000, 1).unwrap();
        assert_eq!(topo.usage(1).used, 2000);

        // Released from a thread that believes it runs on node 0
        with_current_node(0, || drop(buf));
        assert_eq!(topo.usage(1).used, 0);
        assert_eq!(alloc.stats().node(1).unwrap().frees, 1);
        assert_eq!(alloc.stats().node(1).unwrap().pool.free_blocks, 1);
    }

    #[test]
    fn test_exhaustion_is_recoverable() {
        let topo = Arc::new(SimulatedTopology::new(1, 1000));
        let alloc = NodeAllocator::new(topo.clone(), &AllocatorConfig::default());

        let _a = alloc.try_allocate(900, 0).unwrap();
        let err = alloc.try_allocate(200, 0).unwrap_err();
        assert!(matches!(err, Error::OutOfMemory(_)));
        assert_eq!(topo.usage(0).used, 900);
        assert_eq!(alloc.stats().node(0).unwrap().failures, 1);
    }

    #[test]
    fn test_oversized_request_is_rejected() {
        let (topo, alloc) = allocator(1);
        for size in [usize::MAX, usize::MAX - 4, MAX_ALLOC_SIZE + 1] {
            let err = alloc.try_allocate(size, 0).unwrap_err();
            assert!(matches!(err, Error::InvalidArgument(_)), "size {}", size);
        }
        assert_eq!(topo.usage(0).used, 0);

        let system = NodeAllocator::new(
            Arc::new(crate::numa::SystemTopology::detect()),
            &AllocatorConfig::default(),
        );
        assert!(matches!(
            system.try_allocate(usize::MAX - 4, 0),
            Err(Error::InvalidArgument(_))
        ));
    }

    fn panicking_oom(size: usize, node: NodeId) -> ! {
        panic!("oom: {} bytes on node {}", size, node)
    }

    #[test]
    #[should_panic(expected = "oom: 200 bytes on node 0")]
    fn test_primary_path_invokes_oom_handler() {
        let topo = Arc::new(SimulatedTopology::new(1, 100));
        let alloc = NodeAllocator::new(topo, &AllocatorConfig::default());
        alloc.set_oom_handler(panicking_oom);
        let _ = alloc.allocate(200, 0);
    }

    #[test]
    fn test_reallocate_moves_and_keeps_prefix() {
        let (topo, alloc) = allocator(2);

        let mut buf = alloc.allocate_copy(b"hello world", 0).unwrap();
        alloc.reallocate(&mut buf, 2000, 1).unwrap();
        assert_eq!(buf.node(), 1);
        assert_eq!(buf.tier(), Tier::Pool);
        assert_eq!(&buf[..11], b"hello world");
        assert!(buf[11..].iter().all(|&b| b == 0));
        assert_eq!(topo.usage(0).used, 0);

        alloc.reallocate(&mut buf, 5, 0).unwrap();
        assert_eq!(buf.as_slice(), b"hello");
    }

    #[test]
    fn test_reallocate_failure_leaves_buffer() {
        let topo = Arc::new(SimulatedTopology::new(2, 4096));
        let alloc = NodeAllocator::new(topo, &AllocatorConfig::default());

        let mut buf = alloc.allocate_copy(b"keep", 0).unwrap();
        assert!(alloc.reallocate(&mut buf, 8192, 1).is_err());
        assert_eq!(buf.as_slice(), b"keep");
        assert_eq!(buf.node(), 0);
    }
}
