//! Memory node topology.
//!
//! Everything above this module talks to memory nodes through the
//! [`NodeMemory`] trait: raw node-pinned regions for allocator backing
//! memory, logical byte accounting per node, and topology queries.
//!
//! # Backends
//!
//! - [`SystemTopology`]: nodes and distances from sysfs, regions bound with
//!   `mbind` on Linux; a single node elsewhere.
//! - [`SimulatedTopology`]: deterministic nodes with fixed capacity and
//!   fault injection, used by tests and the bench command.

mod simulated;
mod system;

pub use simulated::SimulatedTopology;
pub use system::SystemTopology;

use serde::Serialize;
use std::cell::Cell;
use std::ptr::NonNull;

/// Memory node identifier.
pub type NodeId = u16;

/// Distance reported for a node to itself (ACPI SLIT convention).
pub const LOCAL_DISTANCE: u32 = 10;

/// Distance reported between distinct nodes when the platform gives none.
pub const REMOTE_DISTANCE: u32 = 20;

/// Logical usage of one node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct NodeUsage {
    pub used: u64,
    pub capacity: u64,
}

impl NodeUsage {
    /// Fraction of capacity in use, 0.0 when capacity is unknown.
    pub fn utilization(&self) -> f64 {
        if self.capacity == 0 {
            0.0
        } else {
            self.used as f64 / self.capacity as f64
        }
    }
}

/// Node memory primitive.
///
/// Implementations must be usable from any thread.
pub trait NodeMemory: Send + Sync {
    /// Number of memory nodes, at least one.
    fn node_count(&self) -> usize;

    /// Relative access distance between two nodes.
    fn distance(&self, from: NodeId, to: NodeId) -> u32;

    /// Node the calling thread executes on.
    ///
    /// A per-thread override installed with [`set_current_node`] wins.
    fn current_node(&self) -> NodeId {
        current_node_override().unwrap_or(0)
    }

    /// Allocates `size` bytes aligned to `align` backed by `node`.
    ///
    /// Returns `None` when the node cannot supply the memory.
    fn alloc_region(&self, size: usize, align: usize, node: NodeId) -> Option<NonNull<u8>>;

    /// Returns a region to the node it came from.
    ///
    /// # Safety
    ///
    /// `ptr` must come from [`NodeMemory::alloc_region`] on this instance
    /// with the same `size`, `align` and `node`, and must not be used again.
    unsafe fn free_region(&self, ptr: NonNull<u8>, size: usize, align: usize, node: NodeId);

    /// Accounts `bytes` of live data against `node`.
    ///
    /// Returns `false` when the node has no room left.
    fn charge(&self, node: NodeId, bytes: usize) -> bool;

    /// Reverses a previous [`NodeMemory::charge`].
    fn uncharge(&self, node: NodeId, bytes: usize);

    /// Current logical usage of `node`.
    fn usage(&self, node: NodeId) -> NodeUsage;

    /// Clamps an out-of-range node to the caller's current node.
    fn resolve_node(&self, node: NodeId) -> NodeId {
        if (node as usize) < self.node_count() {
            node
        } else {
            let current = self.current_node();
            if (current as usize) < self.node_count() {
                current
            } else {
                0
            }
        }
    }
}

thread_local! {
    static CURRENT_NODE: Cell<Option<NodeId>> = const { Cell::new(None) };
}

/// Pins the calling thread's notion of its current node.
///
/// `None` restores detection by the topology backend.
pub fn set_current_node(node: Option<NodeId>) {
    CURRENT_NODE.with(|c| c.set(node));
}

/// Returns the per-thread current node override, if any.
pub fn current_node_override() -> Option<NodeId> {
    CURRENT_NODE.with(|c| c.get())
}

/// Runs `f` with the calling thread pinned to `node`.
pub fn with_current_node<R>(node: NodeId, f: impl FnOnce() -> R) -> R {
    let previous = current_node_override();
    set_current_node(Some(node));
    let result = f();
    set_current_node(previous);
    result
}
