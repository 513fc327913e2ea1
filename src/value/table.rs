//! Hash-table encoded containers. Every field, value and member lives in
//! its own node-local buffer.

use crate::alloc::{NodeAllocator, NodeBuf};
use crate::error::Result;
use crate::numa::NodeId;
use std::collections::{HashMap, HashSet};

#[derive(Debug)]
pub struct HashTable {
    pub(crate) map: HashMap<NodeBuf, NodeBuf>,
    pub(crate) node: NodeId,
}

impl HashTable {
    pub fn with_capacity(node: NodeId, capacity: usize) -> Self {
        Self {
            map: HashMap::with_capacity(capacity),
            node,
        }
    }

    pub fn build<K, V>(alloc: &NodeAllocator, node: NodeId, pairs: impl IntoIterator<Item = (K, V)>) -> Result<Self>
    where
        K: AsRef<[u8]>,
        V: AsRef<[u8]>,
    {
        let mut table = Self::with_capacity(node, 0);
        for (field, value) in pairs {
            table.insert(alloc, field.as_ref(), value.as_ref())?;
        }
        Ok(table)
    }

    /// Sets `field`; returns `true` if it was new.
    pub fn insert(&mut self, alloc: &NodeAllocator, field: &[u8], value: &[u8]) -> Result<bool> {
        let value = alloc.allocate_copy(value, self.node)?;
        if let Some(slot) = self.map.get_mut(field) {
            *slot = value;
            return Ok(false);
        }
        let field = alloc.allocate_copy(field, self.node)?;
        self.map.insert(field, value);
        Ok(true)
    }

    pub fn get(&self, field: &[u8]) -> Option<&[u8]> {
        self.map.get(field).map(|v| v.as_slice())
    }

    pub fn remove(&mut self, field: &[u8]) -> bool {
        self.map.remove(field).is_some()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn iter(&self) -> impl Iterator<Item = (&[u8], &[u8])> + '_ {
        self.map.iter().map(|(k, v)| (k.as_slice(), v.as_slice()))
    }
}

#[derive(Debug)]
pub struct SetTable {
    pub(crate) set: HashSet<NodeBuf>,
    pub(crate) node: NodeId,
}

impl SetTable {
    pub fn with_capacity(node: NodeId, capacity: usize) -> Self {
        Self {
            set: HashSet::with_capacity(capacity),
            node,
        }
    }

    pub fn build<M: AsRef<[u8]>>(alloc: &NodeAllocator, node: NodeId, members: impl IntoIterator<Item = M>) -> Result<Self> {
        let mut table = Self::with_capacity(node, 0);
        for member in members {
            table.insert(alloc, member.as_ref())?;
        }
        Ok(table)
    }

    pub fn insert(&mut self, alloc: &NodeAllocator, member: &[u8]) -> Result<bool> {
        if self.set.contains(member) {
            return Ok(false);
        }
        self.set.insert(alloc.allocate_copy(member, self.node)?);
        Ok(true)
    }

    pub fn contains(&self, member: &[u8]) -> bool {
        self.set.contains(member)
    }

    pub fn remove(&mut self, member: &[u8]) -> bool {
        self.set.remove(member)
    }

    pub fn len(&self) -> usize {
        self.set.len()
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn iter(&self) -> impl Iterator<Item = &[u8]> + '_ {
        self.set.iter().map(|m| m.as_slice())
    }
}
