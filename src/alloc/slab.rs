//! Slab arenas for small objects.
//!
//! One arena per (node, size class). A slab is a `SLAB_SIZE`-aligned region:
//!
//! ```text
//! +-----------------+----------+----------+-----+----------+
//! | in-slab header  | object 0 | object 1 | ... | object n |
//! | (64B, magic,    |          |          |     |          |
//! |  slab, node)    |          |          |     |          |
//! +-----------------+----------+----------+-----+----------+
//! ```
//!
//! Objects are claimed and released with atomic operations on the slab's
//! bitmap; only moving a slab between the partial, full and empty lists
//! takes the class lock. Claims reserve a slot by decrementing `free_count`
//! before searching the bitmap, so a reserved claim always finds a zero bit.

use super::header::{AllocationHeader, Tier};
use super::size_class::{SizeClass, SLAB_SIZE_CLASSES};
use crate::numa::{NodeId, NodeMemory};
use parking_lot::RwLock;
use serde::Serialize;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Size and alignment of one slab.
pub const SLAB_SIZE: usize = 64 * 1024;

const SLAB_HEADER_SIZE: usize = 64;
const BITMAP_WORDS: usize = 16;
const MAX_OBJECTS: usize = BITMAP_WORDS * 64;
const SLAB_MAGIC: u64 = 0x534C_4142_4E55_4D41;

/// Header stored at the start of every slab region.
#[repr(C)]
struct InSlabHeader {
    magic: u64,
    slab: *const Slab,
    object_size: u32,
    node: NodeId,
    class_index: u8,
}

const _: () = assert!(std::mem::size_of::<InSlabHeader>() <= SLAB_HEADER_SIZE);

/// Objects that fit one slab of `object_size`.
pub fn objects_per_slab(object_size: usize) -> usize {
    ((SLAB_SIZE - SLAB_HEADER_SIZE) / object_size).min(MAX_OBJECTS)
}

pub(crate) struct Slab {
    base: NonNull<u8>,
    /// 1 = claimed; bits past `objects` are permanently set
    bitmap: [AtomicU64; BITMAP_WORDS],
    free_count: AtomicUsize,
    objects: usize,
    object_size: usize,
}

// SAFETY: the region behind `base` is owned by the slab and only touched
// through atomics or by the holder of a claimed object.
unsafe impl Send for Slab {}
unsafe impl Sync for Slab {}

impl Slab {
    fn new(base: NonNull<u8>, object_size: usize, node: NodeId, class_index: u8) -> Box<Self> {
        let objects = objects_per_slab(object_size);
        let bitmap = std::array::from_fn(|word| {
            let valid = objects.saturating_sub(word * 64).min(64);
            if valid == 64 {
                AtomicU64::new(0)
            } else {
                AtomicU64::new(!0u64 << valid)
            }
        });

        let slab = Box::new(Self {
            base,
            bitmap,
            free_count: AtomicUsize::new(objects),
            objects,
            object_size,
        });

        let header = InSlabHeader {
            magic: SLAB_MAGIC,
            slab: &*slab as *const Slab,
            object_size: object_size as u32,
            node,
            class_index,
        };
        // SAFETY: base is a fresh SLAB_SIZE-aligned region of SLAB_SIZE bytes.
        unsafe { (base.as_ptr() as *mut InSlabHeader).write(header) };

        slab
    }

    /// Reserves one free object. Returns the free count before the reservation.
    fn try_reserve(&self) -> Option<usize> {
        self.free_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |free| free.checked_sub(1))
            .ok()
    }

    /// Claims a zero bit after a successful reservation.
    fn claim_reserved(&self) -> usize {
        loop {
            for (w, word) in self.bitmap.iter().enumerate() {
                let mut current = word.load(Ordering::Acquire);
                while current != u64::MAX {
                    let bit = (!current).trailing_zeros();
                    match word.compare_exchange_weak(
                        current,
                        current | (1u64 << bit),
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => return w * 64 + bit as usize,
                        Err(actual) => current = actual,
                    }
                }
            }
            // A concurrent free has cleared its bit but not yet counted it.
            std::hint::spin_loop();
        }
    }

    /// Clears the bit for `index`. Returns the new free count, or `None`
    /// when the object was not claimed.
    fn release(&self, index: usize) -> Option<usize> {
        let mask = 1u64 << (index % 64);
        let previous = self.bitmap[index / 64].fetch_and(!mask, Ordering::AcqRel);
        if previous & mask == 0 {
            return None;
        }
        Some(self.free_count.fetch_add(1, Ordering::AcqRel) + 1)
    }

    fn object_ptr(&self, index: usize) -> NonNull<u8> {
        // SAFETY: index < objects keeps the pointer inside the region.
        unsafe {
            NonNull::new_unchecked(
                self.base
                    .as_ptr()
                    .add(SLAB_HEADER_SIZE + index * self.object_size),
            )
        }
    }

    fn index_of(&self, ptr: NonNull<u8>) -> usize {
        (ptr.as_ptr() as usize - self.base.as_ptr() as usize - SLAB_HEADER_SIZE) / self.object_size
    }

    fn free_count(&self) -> usize {
        self.free_count.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ListKind {
    Partial,
    Full,
    Empty,
}

#[derive(Default)]
struct SlabLists {
    partial: Vec<Box<Slab>>,
    full: Vec<Box<Slab>>,
    empty: Vec<Box<Slab>>,
}

impl SlabLists {
    fn list_mut(&mut self, kind: ListKind) -> &mut Vec<Box<Slab>> {
        match kind {
            ListKind::Partial => &mut self.partial,
            ListKind::Full => &mut self.full,
            ListKind::Empty => &mut self.empty,
        }
    }

    fn locate(&self, slab: *const Slab) -> Option<(ListKind, usize)> {
        [
            (ListKind::Partial, &self.partial),
            (ListKind::Full, &self.full),
            (ListKind::Empty, &self.empty),
        ]
        .into_iter()
        .find_map(|(kind, list)| {
            list.iter()
                .position(|s| std::ptr::eq(&**s, slab))
                .map(|pos| (kind, pos))
        })
    }
}

struct SlabClass {
    node: NodeId,
    class: SizeClass,
    lists: RwLock<SlabLists>,
}

#[derive(Default)]
struct NodeCounters {
    slabs_created: AtomicU64,
    slabs_released: AtomicU64,
    allocations: AtomicU64,
    frees: AtomicU64,
}

/// Slab statistics for one node
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SlabStats {
    pub slabs_created: u64,
    pub slabs_released: u64,
    pub allocations: u64,
    pub frees: u64,
    pub partial_slabs: usize,
    pub full_slabs: usize,
    pub empty_slabs: usize,
    pub free_objects: usize,
}

/// Per-node, per-class slab arenas.
pub struct SlabArena {
    memory: Arc<dyn NodeMemory>,
    classes: Vec<SlabClass>,
    counters: Vec<NodeCounters>,
    empty_cache_max: usize,
}

impl SlabArena {
    pub fn new(memory: Arc<dyn NodeMemory>, empty_cache_max: usize) -> Self {
        let nodes = memory.node_count();
        let classes = (0..nodes)
            .flat_map(|node| {
                SLAB_SIZE_CLASSES.iter().enumerate().map(move |(index, &slot_size)| SlabClass {
                    node: node as NodeId,
                    class: SizeClass {
                        slot_size,
                        index: index as u8,
                    },
                    lists: RwLock::new(SlabLists::default()),
                })
            })
            .collect();

        debug!(
            "Initializing slab arenas for {} node(s), {} classes each: {:?}",
            nodes,
            SLAB_SIZE_CLASSES.len(),
            SLAB_SIZE_CLASSES
        );

        Self {
            memory,
            counters: (0..nodes).map(|_| NodeCounters::default()).collect(),
            classes,
            empty_cache_max,
        }
    }

    fn class(&self, node: NodeId, index: u8) -> &SlabClass {
        &self.classes[node as usize * SLAB_SIZE_CLASSES.len() + index as usize]
    }

    /// Allocates one object of at least `size` bytes on `node`.
    pub fn allocate(&self, size: usize, node: NodeId) -> Option<(NonNull<u8>, SizeClass)> {
        let class = SizeClass::for_slab(size)?;
        let sc = self.class(node, class.index);

        // Fast path: shared scan of partial slabs
        let claimed = {
            let lists = sc.lists.read();
            lists.partial.iter().find_map(|slab| {
                slab.try_reserve().map(|before| {
                    let ptr = slab.object_ptr(slab.claim_reserved());
                    (ptr, &**slab as *const Slab, before)
                })
            })
        };
        if let Some((ptr, slab_ptr, before)) = claimed {
            if before == 1 {
                self.reconcile(sc, slab_ptr);
            }
            self.counters[node as usize].allocations.fetch_add(1, Ordering::Relaxed);
            return Some((ptr, class));
        }

        let mut lists = sc.lists.write();

        // Another thread may have added a slab while we waited
        for pos in 0..lists.partial.len() {
            if let Some(before) = lists.partial[pos].try_reserve() {
                let slab = &lists.partial[pos];
                let ptr = slab.object_ptr(slab.claim_reserved());
                if before == 1 {
                    let full = lists.partial.remove(pos);
                    lists.full.push(full);
                }
                self.counters[node as usize].allocations.fetch_add(1, Ordering::Relaxed);
                return Some((ptr, class));
            }
        }

        let slab = match lists.empty.pop() {
            Some(slab) => slab,
            None => self.create_slab(sc)?,
        };
        let Some(before) = slab.try_reserve() else {
            lists.empty.push(slab);
            return None;
        };
        let ptr = slab.object_ptr(slab.claim_reserved());
        if before == 1 {
            lists.full.push(slab);
        } else {
            lists.partial.push(slab);
        }
        self.counters[node as usize].allocations.fetch_add(1, Ordering::Relaxed);
        Some((ptr, class))
    }

    fn create_slab(&self, sc: &SlabClass) -> Option<Box<Slab>> {
        let base = self.memory.alloc_region(SLAB_SIZE, SLAB_SIZE, sc.node)?;
        self.counters[sc.node as usize]
            .slabs_created
            .fetch_add(1, Ordering::Relaxed);
        debug!(
            "New slab on node {} for {}-byte objects",
            sc.node, sc.class.slot_size
        );
        Some(Slab::new(base, sc.class.slot_size, sc.node, sc.class.index))
    }

    fn release_slab(&self, node: NodeId, slab: Box<Slab>) {
        let base = slab.base;
        drop(slab);
        // SAFETY: the slab held the only reference to its region.
        unsafe { self.memory.free_region(base, SLAB_SIZE, SLAB_SIZE, node) };
        self.counters[node as usize]
            .slabs_released
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Moves `slab` to the list matching its free count.
    ///
    /// Idempotent; a slab that is no longer listed is ignored.
    fn reconcile(&self, sc: &SlabClass, slab: *const Slab) {
        let mut lists = sc.lists.write();
        let Some((kind, pos)) = lists.locate(slab) else {
            return;
        };

        let listed = &lists.list_mut(kind)[pos];
        let free = listed.free_count();
        let target = if free == 0 {
            ListKind::Full
        } else if free == listed.objects {
            ListKind::Empty
        } else {
            ListKind::Partial
        };
        if target == kind {
            return;
        }

        let slab = lists.list_mut(kind).remove(pos);
        match target {
            ListKind::Empty if lists.empty.len() >= self.empty_cache_max => {
                self.release_slab(sc.node, slab);
            }
            target => lists.list_mut(target).push(slab),
        }
    }

    /// Synthesizes the allocation header of a slab object.
    ///
    /// # Safety
    ///
    /// `ptr` must be a live object returned by [`SlabArena::allocate`].
    pub unsafe fn header_of(ptr: NonNull<u8>) -> AllocationHeader {
        // SAFETY: guaranteed by the caller.
        let header = unsafe { Self::in_slab_header(ptr) };
        AllocationHeader::new(
            header.object_size as usize,
            Tier::Slab,
            header.node,
            header.class_index,
        )
    }

    unsafe fn in_slab_header<'a>(ptr: NonNull<u8>) -> &'a InSlabHeader {
        let base = ptr.as_ptr() as usize & !(SLAB_SIZE - 1);
        // SAFETY: a live object keeps its slab region mapped.
        let header = unsafe { &*(base as *const InSlabHeader) };
        debug_assert_eq!(header.magic, SLAB_MAGIC);
        header
    }

    /// Returns an object to its slab. The owning node comes from the slab.
    ///
    /// # Safety
    ///
    /// `ptr` must be a live object returned by [`SlabArena::allocate`] on
    /// this arena and must not be used afterwards.
    pub unsafe fn free(&self, ptr: NonNull<u8>) {
        // SAFETY: guaranteed by the caller.
        let header = unsafe { Self::in_slab_header(ptr) };
        let (node, class_index, slab_ptr) = (header.node, header.class_index, header.slab);
        // SAFETY: the object is live, so its slab has not been released.
        let slab = unsafe { &*slab_ptr };
        let objects = slab.objects;
        let index = slab.index_of(ptr);

        // The slab may be released by another thread once the count is
        // bumped; nothing below dereferences it.
        match slab.release(index) {
            Some(free) => {
                self.counters[node as usize].frees.fetch_add(1, Ordering::Relaxed);
                if free == 1 || free == objects {
                    self.reconcile(self.class(node, class_index), slab_ptr);
                }
            }
            None => warn!("Ignoring free of unclaimed slab object {:p}", ptr),
        }
    }

    /// Statistics for `node`
    pub fn stats(&self, node: NodeId) -> SlabStats {
        let Some(counters) = self.counters.get(node as usize) else {
            return SlabStats::default();
        };
        let mut stats = SlabStats {
            slabs_created: counters.slabs_created.load(Ordering::Relaxed),
            slabs_released: counters.slabs_released.load(Ordering::Relaxed),
            allocations: counters.allocations.load(Ordering::Relaxed),
            frees: counters.frees.load(Ordering::Relaxed),
            ..Default::default()
        };

        for index in 0..SLAB_SIZE_CLASSES.len() {
            let lists = self.class(node, index as u8).lists.read();
            stats.partial_slabs += lists.partial.len();
            stats.full_slabs += lists.full.len();
            stats.empty_slabs += lists.empty.len();
            stats.free_objects += lists
                .partial
                .iter()
                .chain(lists.empty.iter())
                .map(|s| s.free_count())
                .sum::<usize>();
        }
        stats
    }

    pub fn reset_stats(&self) {
        for counters in &self.counters {
            counters.slabs_created.store(0, Ordering::Relaxed);
            counters.slabs_released.store(0, Ordering::Relaxed);
            counters.allocations.store(0, Ordering::Relaxed);
            counters.frees.store(0, Ordering::Relaxed);
        }
    }
}

impl Drop for SlabArena {
    fn drop(&mut self) {
        let memory = &self.memory;
        for sc in self.classes.iter_mut() {
            let lists = std::mem::take(sc.lists.get_mut());
            let slabs = lists
                .partial
                .into_iter()
                .chain(lists.full)
                .chain(lists.empty);
            for slab in slabs {
                let base = slab.base;
                drop(slab);
                // SAFETY: arena teardown; no objects can outlive the arena.
                unsafe { memory.free_region(base, SLAB_SIZE, SLAB_SIZE, sc.node) };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::numa::SimulatedTopology;

    fn arena(empty_cache: usize) -> (Arc<SimulatedTopology>, SlabArena) {
        let topo = Arc::new(SimulatedTopology::new(2, 1 << 30));
        let arena = SlabArena::new(topo.clone(), empty_cache);
        (topo, arena)
    }

    #[test]
    fn test_objects_per_slab() {
        assert_eq!(objects_per_slab(16), MAX_OBJECTS);
        assert_eq!(objects_per_slab(64), 1023);
        assert_eq!(objects_per_slab(512), 127);
    }

    #[test]
    fn test_allocate_and_free_updates_lists() {
        let (topo, arena) = arena(2);

        let (ptr, class) = arena.allocate(60, 1).unwrap();
        assert_eq!(class.slot_size, 64);
        assert_eq!(topo.live_regions(1), 1);

        let header = unsafe { SlabArena::header_of(ptr) };
        assert_eq!(header.owner_node, 1);
        assert_eq!(header.tier(), Tier::Slab);
        assert_eq!(header.size, 64);

        let stats = arena.stats(1);
        assert_eq!(stats.partial_slabs, 1);
        assert_eq!(stats.free_objects, 1022);

        unsafe { arena.free(ptr) };
        let stats = arena.stats(1);
        assert_eq!(stats.partial_slabs, 0);
        assert_eq!(stats.empty_slabs, 1);
        // Cached, not released
        assert_eq!(topo.live_regions(1), 1);
    }

    #[test]
    fn test_full_slab_moves_and_returns() {
        let (_topo, arena) = arena(2);
        let objects = objects_per_slab(512);

        let ptrs: Vec<_> = (0..objects).map(|_| arena.allocate(512, 0).unwrap().0).collect();
        let stats = arena.stats(0);
        assert_eq!(stats.full_slabs, 1);
        assert_eq!(stats.partial_slabs, 0);

        unsafe { arena.free(ptrs[3]) };
        let stats = arena.stats(0);
        assert_eq!(stats.full_slabs, 0);
        assert_eq!(stats.partial_slabs, 1);

        // The freed slot is claimed again before a new slab is made
        let (again, _) = arena.allocate(500, 0).unwrap();
        assert_eq!(again, ptrs[3]);
        assert_eq!(arena.stats(0).slabs_created, 1);
    }

    #[test]
    fn test_empty_cache_bound_releases_memory() {
        let (topo, arena) = arena(1);
        let objects = objects_per_slab(256);

        // Two slabs worth of objects
        let ptrs: Vec<_> = (0..objects * 2).map(|_| arena.allocate(256, 0).unwrap().0).collect();
        assert_eq!(topo.live_regions(0), 2);

        for ptr in ptrs {
            unsafe { arena.free(ptr) };
        }
        let stats = arena.stats(0);
        assert_eq!(stats.empty_slabs, 1);
        assert_eq!(stats.slabs_released, 1);
        assert_eq!(topo.live_regions(0), 1);
    }

    #[test]
    fn test_double_free_is_ignored() {
        let (_topo, arena) = arena(2);
        let (a, _) = arena.allocate(32, 0).unwrap();
        let (_b, _) = arena.allocate(32, 0).unwrap();

        unsafe { arena.free(a) };
        let free_before = arena.stats(0).free_objects;
        unsafe { arena.free(a) };
        assert_eq!(arena.stats(0).free_objects, free_before);
    }

    #[test]
    fn test_concurrent_claims_are_unique() {
        let (_topo, arena) = arena(2);
        let per_thread = 2000;

        let mut all: Vec<usize> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..4)
                .map(|_| {
                    s.spawn(|| {
                        (0..per_thread)
                            .map(|_| arena.allocate(48, 0).unwrap().0.as_ptr() as usize)
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            handles.into_iter().flat_map(|h| h.join().unwrap()).collect()
        });

        let total = all.len();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), total);

        let stats = arena.stats(0);
        let capacity = (stats.partial_slabs + stats.full_slabs) * objects_per_slab(48);
        assert_eq!(capacity - stats.free_objects, total);
    }
}
