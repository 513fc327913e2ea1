//! Host topology from sysfs.

use super::{current_node_override, NodeId, NodeMemory, NodeUsage, LOCAL_DISTANCE, REMOTE_DISTANCE};
use std::path::Path;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{debug, info, warn};

const SYSFS_NODE_ROOT: &str = "/sys/devices/system/node";
const PAGE_SIZE: usize = 4096;

#[cfg(target_os = "linux")]
const MPOL_PREFERRED: libc::c_long = 1;
#[cfg(target_os = "linux")]
const MPOL_MF_MOVE: libc::c_uint = 1 << 1;

/// Per-node facts read at startup.
#[derive(Debug, Clone, Default)]
struct NodeInfo {
    cpus: Vec<usize>,
    distances: Vec<u32>,
    mem_total: u64,
    mem_free: u64,
}

impl NodeInfo {
    /// Byte budget for charges, 0 when unknown.
    fn limit(&self) -> u64 {
        if self.mem_free > 0 {
            self.mem_free
        } else {
            self.mem_total
        }
    }
}

/// Topology of the running host.
///
/// Regions are fresh anonymous mappings; on multi-node Linux hosts each
/// region gets a preferred-node memory policy through `mbind` before its
/// first touch. Binding failures are logged once and otherwise ignored.
/// Charges are bounded by each node's free memory at detection time.
#[derive(Debug)]
pub struct SystemTopology {
    nodes: Vec<NodeInfo>,
    used: Vec<AtomicU64>,
    bind_warned: AtomicBool,
}

impl SystemTopology {
    /// Detects the host topology, falling back to a single node.
    pub fn detect() -> Self {
        let nodes = read_sysfs_nodes(Path::new(SYSFS_NODE_ROOT)).unwrap_or_default();
        let nodes = if nodes.is_empty() {
            vec![NodeInfo::default()]
        } else {
            nodes
        };
        info!("Detected {} memory node(s)", nodes.len());

        Self {
            used: (0..nodes.len()).map(|_| AtomicU64::new(0)).collect(),
            nodes,
            bind_warned: AtomicBool::new(false),
        }
    }

    /// Whether the host exposes more than one node.
    pub fn is_numa(&self) -> bool {
        self.nodes.len() > 1
    }

    /// CPUs attached to `node`.
    pub fn cpus(&self, node: NodeId) -> &[usize] {
        self.nodes
            .get(node as usize)
            .map(|n| n.cpus.as_slice())
            .unwrap_or(&[])
    }

    fn region_len(size: usize) -> Option<usize> {
        Some(size.checked_add(PAGE_SIZE - 1)? & !(PAGE_SIZE - 1))
    }

    /// Maps `len` fresh anonymous bytes aligned to `align`.
    ///
    /// Over-maps by `align` and unmaps the unaligned head and tail.
    #[cfg(unix)]
    fn map_region(len: usize, align: usize) -> Option<NonNull<u8>> {
        let align = align.max(PAGE_SIZE);
        let padded = len.checked_add(align - PAGE_SIZE)?;
        // SAFETY: anonymous private mapping with no address hint.
        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                padded,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return None;
        }

        let start = addr as usize;
        let aligned = (start + align - 1) & !(align - 1);
        let head = aligned - start;
        let tail = padded - head - len;
        // SAFETY: head and tail lie inside the mapping created above.
        unsafe {
            if head > 0 {
                libc::munmap(addr, head);
            }
            if tail > 0 {
                libc::munmap((aligned + len) as *mut libc::c_void, tail);
            }
        }
        NonNull::new(aligned as *mut u8)
    }

    #[cfg(unix)]
    unsafe fn unmap_region(ptr: NonNull<u8>, len: usize, _align: usize) {
        // SAFETY: the caller passes a range produced by map_region.
        if unsafe { libc::munmap(ptr.as_ptr() as *mut libc::c_void, len) } != 0 {
            warn!("munmap of {} bytes failed: {}", len, std::io::Error::last_os_error());
        }
    }

    #[cfg(not(unix))]
    fn map_region(len: usize, align: usize) -> Option<NonNull<u8>> {
        let layout = std::alloc::Layout::from_size_align(len, align.max(PAGE_SIZE)).ok()?;
        // SAFETY: layout has non-zero size.
        NonNull::new(unsafe { std::alloc::alloc_zeroed(layout) })
    }

    #[cfg(not(unix))]
    unsafe fn unmap_region(ptr: NonNull<u8>, len: usize, align: usize) {
        if let Ok(layout) = std::alloc::Layout::from_size_align(len, align.max(PAGE_SIZE)) {
            // SAFETY: map_region used the same layout.
            unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) };
        }
    }

    #[cfg(target_os = "linux")]
    fn bind(&self, ptr: NonNull<u8>, len: usize, node: NodeId) {
        if !self.is_numa() {
            return;
        }
        let mask: libc::c_ulong = 1 << (node as u32 % libc::c_ulong::BITS);
        let max_node = (self.nodes.len() + 1) as libc::c_ulong;
        // SAFETY: the range is a live page-aligned mapping owned by the caller.
        let rc = unsafe {
            libc::syscall(
                libc::SYS_mbind,
                ptr.as_ptr() as *mut libc::c_void,
                len as libc::c_ulong,
                MPOL_PREFERRED,
                &mask as *const libc::c_ulong,
                max_node,
                MPOL_MF_MOVE,
            )
        };
        if rc != 0 && !self.bind_warned.swap(true, Ordering::Relaxed) {
            warn!(
                "mbind to node {} failed ({}), regions fall back to default placement",
                node,
                std::io::Error::last_os_error()
            );
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn bind(&self, _ptr: NonNull<u8>, _len: usize, _node: NodeId) {}
}

impl NodeMemory for SystemTopology {
    fn node_count(&self) -> usize {
        self.nodes.len()
    }

    fn distance(&self, from: NodeId, to: NodeId) -> u32 {
        self.nodes
            .get(from as usize)
            .and_then(|n| n.distances.get(to as usize))
            .copied()
            .unwrap_or(if from == to { LOCAL_DISTANCE } else { REMOTE_DISTANCE })
    }

    fn current_node(&self) -> NodeId {
        if let Some(node) = current_node_override() {
            return node;
        }

        #[cfg(target_os = "linux")]
        {
            // SAFETY: sched_getcpu has no preconditions.
            let cpu = unsafe { libc::sched_getcpu() };
            if cpu >= 0 {
                let cpu = cpu as usize;
                if let Some(node) = self.nodes.iter().position(|n| n.cpus.contains(&cpu)) {
                    return node as NodeId;
                }
            }
        }

        0
    }

    fn alloc_region(&self, size: usize, align: usize, node: NodeId) -> Option<NonNull<u8>> {
        if node as usize >= self.nodes.len() || size == 0 {
            return None;
        }
        let len = Self::region_len(size)?;
        let ptr = Self::map_region(len, align)?;
        // Binding precedes first touch, so every page faults in on `node`.
        self.bind(ptr, len, node);
        Some(ptr)
    }

    unsafe fn free_region(&self, ptr: NonNull<u8>, size: usize, align: usize, _node: NodeId) {
        if let Some(len) = Self::region_len(size) {
            // SAFETY: alloc_region mapped the same rounded length.
            unsafe { Self::unmap_region(ptr, len, align) };
        }
    }

    /// Charges against the free memory sysfs reported at startup.
    ///
    /// A node whose free memory is unknown accepts every charge.
    fn charge(&self, node: NodeId, bytes: usize) -> bool {
        let (Some(used), Some(info)) = (self.used.get(node as usize), self.nodes.get(node as usize)) else {
            return false;
        };
        let limit = info.limit();
        used.fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
            let next = current.checked_add(bytes as u64)?;
            (limit == 0 || next <= limit).then_some(next)
        })
        .is_ok()
    }

    fn uncharge(&self, node: NodeId, bytes: usize) {
        if let Some(used) = self.used.get(node as usize) {
            let _ = used.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                Some(current.saturating_sub(bytes as u64))
            });
        }
    }

    fn usage(&self, node: NodeId) -> NodeUsage {
        NodeUsage {
            used: self
                .used
                .get(node as usize)
                .map(|u| u.load(Ordering::Relaxed))
                .unwrap_or(0),
            capacity: self
                .nodes
                .get(node as usize)
                .map(|n| n.mem_total)
                .unwrap_or(0),
        }
    }
}

/// Reads `nodeN` directories under `root`, ordered by node id.
fn read_sysfs_nodes(root: &Path) -> Option<Vec<NodeInfo>> {
    let mut ids: Vec<usize> = std::fs::read_dir(root)
        .ok()?
        .filter_map(|e| e.ok())
        .filter_map(|e| {
            e.file_name()
                .to_string_lossy()
                .strip_prefix("node")
                .and_then(|id| id.parse().ok())
        })
        .collect();
    ids.sort_unstable();

    // Node ids may be sparse; only a dense 0..n numbering maps onto NodeId.
    if ids.iter().enumerate().any(|(i, &id)| i != id) {
        debug!("Sparse node numbering {:?}, using a single node", ids);
        return None;
    }

    let nodes = ids
        .iter()
        .map(|id| {
            let dir = root.join(format!("node{}", id));
            let meminfo = std::fs::read_to_string(dir.join("meminfo")).unwrap_or_default();
            NodeInfo {
                cpus: std::fs::read_to_string(dir.join("cpulist"))
                    .map(|s| parse_cpu_list(&s))
                    .unwrap_or_default(),
                distances: std::fs::read_to_string(dir.join("distance"))
                    .map(|s| s.split_whitespace().filter_map(|d| d.parse().ok()).collect())
                    .unwrap_or_default(),
                mem_total: parse_meminfo(&meminfo, "MemTotal:").unwrap_or(0),
                mem_free: parse_meminfo(&meminfo, "MemFree:").unwrap_or(0),
            }
        })
        .collect();

    Some(nodes)
}

/// Parses a sysfs cpu list such as `0-3,8,10-11`.
fn parse_cpu_list(s: &str) -> Vec<usize> {
    let mut cpus = Vec::new();
    for part in s.trim().split(',').filter(|p| !p.is_empty()) {
        match part.split_once('-') {
            Some((lo, hi)) => {
                if let (Ok(lo), Ok(hi)) = (lo.parse::<usize>(), hi.parse::<usize>()) {
                    cpus.extend(lo..=hi);
                }
            }
            None => {
                if let Ok(cpu) = part.parse() {
                    cpus.push(cpu);
                }
            }
        }
    }
    cpus
}

/// Extracts a field such as `MemTotal:` in bytes from a per-node meminfo file.
fn parse_meminfo(s: &str, field: &str) -> Option<u64> {
    s.lines()
        .find(|l| l.contains(field))
        .and_then(|l| l.split_whitespace().rev().nth(1))
        .and_then(|kb| kb.parse::<u64>().ok())
        .map(|kb| kb * 1024)
}
