//! Deterministic in-process topology.

use super::{NodeId, NodeMemory, NodeUsage, LOCAL_DISTANCE, REMOTE_DISTANCE};
use parking_lot::Mutex;
use std::alloc::{alloc, dealloc, Layout};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Pending injected failure.
#[derive(Debug, Clone, Copy)]
struct Fault {
    node: Option<NodeId>,
    remaining: usize,
}

/// Simulated memory nodes backed by the process heap.
///
/// Each node has a fixed logical capacity. Charges beyond it fail, which is
/// how allocation exhaustion is reproduced. [`SimulatedTopology::fail_after`]
/// injects a single failure after a number of successful charges.
#[derive(Debug)]
pub struct SimulatedTopology {
    capacity: u64,
    used: Vec<AtomicU64>,
    live_regions: Vec<AtomicUsize>,
    region_bytes: Vec<AtomicU64>,
    distances: Vec<Vec<u32>>,
    fault: Mutex<Option<Fault>>,
}

impl SimulatedTopology {
    /// Creates `nodes` nodes of `capacity` bytes each.
    pub fn new(nodes: usize, capacity: u64) -> Self {
        let nodes = nodes.max(1);
        let distances = (0..nodes)
            .map(|from| {
                (0..nodes)
                    .map(|to| if from == to { LOCAL_DISTANCE } else { REMOTE_DISTANCE })
                    .collect()
            })
            .collect();

        Self {
            capacity,
            used: (0..nodes).map(|_| AtomicU64::new(0)).collect(),
            live_regions: (0..nodes).map(|_| AtomicUsize::new(0)).collect(),
            region_bytes: (0..nodes).map(|_| AtomicU64::new(0)).collect(),
            distances,
            fault: Mutex::new(None),
        }
    }

    /// Replaces the distance matrix. Rows shorter than the node count keep defaults.
    pub fn with_distances(mut self, matrix: Vec<Vec<u32>>) -> Self {
        for (from, row) in matrix.into_iter().enumerate().take(self.distances.len()) {
            for (to, distance) in row.into_iter().enumerate().take(self.distances.len()) {
                self.distances[from][to] = distance;
            }
        }
        self
    }

    /// Makes the charge after `successes` successful ones fail.
    ///
    /// With `node` set only charges against that node count.
    pub fn fail_after(&self, node: Option<NodeId>, successes: usize) {
        *self.fault.lock() = Some(Fault {
            node,
            remaining: successes,
        });
    }

    /// Removes any pending injected failure.
    pub fn clear_faults(&self) {
        *self.fault.lock() = None;
    }

    /// Regions currently held on `node`.
    pub fn live_regions(&self, node: NodeId) -> usize {
        self.live_regions
            .get(node as usize)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Bytes of region memory currently held on `node`.
    pub fn region_bytes(&self, node: NodeId) -> u64 {
        self.region_bytes
            .get(node as usize)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    fn injected_failure(&self, node: NodeId) -> bool {
        let mut fault = self.fault.lock();
        match fault.as_mut() {
            Some(f) if f.node.map_or(true, |n| n == node) => {
                if f.remaining == 0 {
                    *fault = None;
                    true
                } else {
                    f.remaining -= 1;
                    false
                }
            }
            _ => false,
        }
    }
}

impl NodeMemory for SimulatedTopology {
    fn node_count(&self) -> usize {
        self.used.len()
    }

    fn distance(&self, from: NodeId, to: NodeId) -> u32 {
        self.distances
            .get(from as usize)
            .and_then(|row| row.get(to as usize))
            .copied()
            .unwrap_or(REMOTE_DISTANCE)
    }

    fn alloc_region(&self, size: usize, align: usize, node: NodeId) -> Option<NonNull<u8>> {
        let idx = node as usize;
        if idx >= self.node_count() || size == 0 {
            return None;
        }
        let layout = Layout::from_size_align(size, align).ok()?;
        // SAFETY: layout has non-zero size.
        let ptr = NonNull::new(unsafe { alloc(layout) })?;
        self.live_regions[idx].fetch_add(1, Ordering::Relaxed);
        self.region_bytes[idx].fetch_add(size as u64, Ordering::Relaxed);
        Some(ptr)
    }

    unsafe fn free_region(&self, ptr: NonNull<u8>, size: usize, align: usize, node: NodeId) {
        let idx = node as usize;
        // SAFETY: the caller guarantees the region came from alloc_region with this layout.
        unsafe { dealloc(ptr.as_ptr(), Layout::from_size_align_unchecked(size, align)) };
        if let Some(count) = self.live_regions.get(idx) {
            count.fetch_sub(1, Ordering::Relaxed);
            self.region_bytes[idx].fetch_sub(size as u64, Ordering::Relaxed);
        }
    }

    fn charge(&self, node: NodeId, bytes: usize) -> bool {
        let Some(used) = self.used.get(node as usize) else {
            return false;
        };
        if self.injected_failure(node) {
            return false;
        }
        let capacity = self.capacity;
        used.fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
            let next = current.checked_add(bytes as u64)?;
            (next <= capacity).then_some(next)
        })
        .is_ok()
    }

    fn uncharge(&self, node: NodeId, bytes: usize) {
        if let Some(used) = self.used.get(node as usize) {
            let _ = used.fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(current.saturating_sub(bytes as u64))
            });
        }
    }

    fn usage(&self, node: NodeId) -> NodeUsage {
        NodeUsage {
            used: self
                .used
                .get(node as usize)
                .map(|u| u.load(Ordering::Acquire))
                .unwrap_or(0),
            capacity: self.capacity,
        }
    }
}
