//! Keyspace: the store's key -> value map.
//!
//! Each value sits behind its own mutex. Migration holds that lock for the
//! swap, which is the per-value lock the allocator side relies on.

use crate::value::Value;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;

pub type SharedValue = Arc<Mutex<Value>>;

#[derive(Default)]
pub struct Keyspace {
    entries: DashMap<Vec<u8>, SharedValue>,
}

impl Keyspace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `value`, returning the previous one.
    pub fn insert(&self, key: &[u8], value: Value) -> Option<SharedValue> {
        self.entries
            .insert(key.to_vec(), Arc::new(Mutex::new(value)))
    }

    pub fn get(&self, key: &[u8]) -> Option<SharedValue> {
        self.entries.get(key).map(|v| v.value().clone())
    }

    pub fn remove(&self, key: &[u8]) -> Option<SharedValue> {
        self.entries.remove(key).map(|(_, v)| v)
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        self.entries.contains_key(key)
    }

    /// Snapshot of all keys, in no particular order
    pub fn keys(&self) -> Vec<Vec<u8>> {
        self.entries.iter().map(|e| e.key().clone()).collect()
    }

    /// Keys matching a glob with `*` and `?` wildcards.
    pub fn keys_matching(&self, pattern: &[u8]) -> Vec<Vec<u8>> {
        self.entries
            .iter()
            .filter(|e| glob_match(pattern, e.key()))
            .map(|e| e.key().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }
}

/// Matches `text` against `pattern`, where `*` is any run and `?` any byte.
pub fn glob_match(pattern: &[u8], text: &[u8]) -> bool {
    let (mut p, mut t) = (0, 0);
    // Position after the last `*` and the text index it was tried at
    let mut backtrack: Option<(usize, usize)> = None;

    while t < text.len() {
        match pattern.get(p) {
            Some(b'*') => {
                p += 1;
                backtrack = Some((p, t));
            }
            Some(&c) if c == b'?' || c == text[t] => {
                p += 1;
                t += 1;
            }
            _ => match backtrack {
                Some((star_p, star_t)) => {
                    p = star_p;
                    t = star_t + 1;
                    backtrack = Some((star_p, star_t + 1));
                }
                None => return false,
            },
        }
    }
    pattern[p..].iter().all(|&c| c == b'*')
}
