//! Ordered sets: members sorted by (score, bytes) with a member -> score
//! index. Both structures share each member buffer.

use crate::alloc::{NodeAllocator, NodeBuf};
use crate::error::{Error, Result};
use crate::numa::NodeId;
use std::borrow::Borrow;
use std::cmp::Ordering;
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// A member buffer shared by the ordering and the index.
#[derive(Debug, Clone)]
pub struct Member(Arc<NodeBuf>);

impl Member {
    pub fn new(buf: NodeBuf) -> Self {
        Self(Arc::new(buf))
    }

    pub fn as_slice(&self) -> &[u8] {
        self.0.as_slice()
    }

    pub fn node(&self) -> NodeId {
        self.0.node()
    }
}

impl Borrow<[u8]> for Member {
    fn borrow(&self) -> &[u8] {
        self.as_slice()
    }
}

impl PartialEq for Member {
    fn eq(&self, other: &Self) -> bool {
        self.as_slice() == other.as_slice()
    }
}

impl Eq for Member {}

impl Hash for Member {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.as_slice().hash(state)
    }
}

fn order(a: (f64, &[u8]), b: (f64, &[u8])) -> Ordering {
    a.0.total_cmp(&b.0).then_with(|| a.1.cmp(b.1))
}

#[derive(Debug)]
pub struct OrderedSet {
    pub(crate) entries: VecDeque<(f64, Member)>,
    pub(crate) index: HashMap<Member, f64>,
    pub(crate) node: NodeId,
}

impl OrderedSet {
    pub fn new(node: NodeId) -> Self {
        Self::with_capacity(node, 0)
    }

    pub fn with_capacity(node: NodeId, capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            index: HashMap::with_capacity(capacity),
            node,
        }
    }

    pub fn build(alloc: &NodeAllocator, node: NodeId, members: &[(Vec<u8>, f64)]) -> Result<Self> {
        let mut set = Self::with_capacity(node, members.len());
        for (member, score) in members {
            set.insert(alloc, member, *score)?;
        }
        Ok(set)
    }

    fn position(&self, score: f64, member: &[u8]) -> usize {
        self.entries
            .partition_point(|(s, m)| order((*s, m.as_slice()), (score, member)) == Ordering::Less)
    }

    /// Adds `member` or updates its score. Returns `true` if it was new.
    pub fn insert(&mut self, alloc: &NodeAllocator, member: &[u8], score: f64) -> Result<bool> {
        if score.is_nan() {
            return Err(Error::InvalidArgument("score is not a number".to_string()));
        }

        let existing = self.index.get_key_value(member).map(|(m, s)| (m.clone(), *s));
        let (shared, added) = match existing {
            Some((shared, old)) => {
                let at = self.position(old, member);
                self.entries.remove(at);
                (shared, false)
            }
            None => (Member::new(alloc.allocate_copy(member, self.node)?), true),
        };

        let at = self.position(score, member);
        self.entries.insert(at, (score, shared.clone()));
        self.index.insert(shared, score);
        Ok(added)
    }

    pub fn remove(&mut self, member: &[u8]) -> bool {
        match self.index.remove(member) {
            Some(score) => {
                let at = self.position(score, member);
                self.entries.remove(at);
                true
            }
            None => false,
        }
    }

    /// Prepends a member known to order before every current entry.
    pub(crate) fn push_front_sorted(&mut self, member: Member, score: f64) {
        debug_assert!(self
            .entries
            .front()
            .map_or(true, |(s, m)| order((score, member.as_slice()), (*s, m.as_slice())) == Ordering::Less));
        self.index.insert(member.clone(), score);
        self.entries.push_front((score, member));
    }

    pub fn score(&self, member: &[u8]) -> Option<f64> {
        self.index.get(member).copied()
    }

    /// Zero-based rank in ascending order.
    pub fn rank(&self, member: &[u8]) -> Option<usize> {
        let score = self.score(member)?;
        Some(self.position(score, member))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    /// Members in ascending order
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = (&[u8], f64)> + '_ {
        self.entries.iter().map(|(s, m)| (m.as_slice(), *s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AllocatorConfig;
    use crate::numa::SimulatedTopology;

    fn alloc() -> NodeAllocator {
        NodeAllocator::new(
            Arc::new(SimulatedTopology::new(2, 1 << 20)),
            &AllocatorConfig::default(),
        )
    }

    #[test]
    fn test_orders_by_score_then_member() {
        let alloc = alloc();
        let set = OrderedSet::build(
            &alloc,
            0,
            &[
                (b"b".to_vec(), 1.0),
                (b"a".to_vec(), 1.0),
                (b"z".to_vec(), -3.5),
            ],
        )
        .unwrap();

        let order: Vec<_> = set.iter().map(|(m, _)| m.to_vec()).collect();
        assert_eq!(order, vec![b"z".to_vec(), b"a".to_vec(), b"b".to_vec()]);
        assert_eq!(set.rank(b"b"), Some(2));
    }

    #[test]
    fn test_update_score_moves_member() {
        let alloc = alloc();
        let mut set = OrderedSet::new(1);
        assert!(set.insert(&alloc, b"x", 5.0).unwrap());
        assert!(set.insert(&alloc, b"y", 1.0).unwrap());
        assert!(!set.insert(&alloc, b"x", 0.5).unwrap());

        assert_eq!(set.len(), 2);
        assert_eq!(set.score(b"x"), Some(0.5));
        assert_eq!(set.rank(b"x"), Some(0));
        assert!(set.remove(b"y"));
        assert!(!set.remove(b"y"));
    }

    #[test]
    fn test_nan_rejected() {
        let alloc = alloc();
        let mut set = OrderedSet::new(0);
        assert!(set.insert(&alloc, b"x", f64::NAN).is_err());
        assert!(set.is_empty());
    }
}
