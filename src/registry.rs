//! Sparse id→object registries.
//!
//! Ids come from a per-registry monotonic counter and are never reused
//! within the process lifetime. Lookups hand out stable shared handles; the
//! wire truncates ids to u32.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug)]
pub struct Registry<T> {
    entries: HashMap<u64, Arc<T>>,
    next_id: AtomicU64,
}

impl<T> Registry<T> {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            next_id: AtomicU64::new(0),
        }
    }

    /// Insert `value` under a freshly generated id and return the id.
    pub fn add(&mut self, value: Arc<T>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries.insert(id, value);
        id
    }

    pub fn get(&self, id: u64) -> Option<Arc<T>> {
        self.entries.get(&id).cloned()
    }

    /// Remove and return the entry; the id is retired forever.
    pub fn remove(&mut self, id: u64) -> Option<Arc<T>> {
        self.entries.remove(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u64, &Arc<T>)> {
        self.entries.iter().map(|(id, v)| (*id, v))
    }
}

impl<T> Default for Registry<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_start_at_zero_and_increase() {
        let mut r = Registry::new();
        assert_eq!(r.add(Arc::new("a")), 0);
        assert_eq!(r.add(Arc::new("b")), 1);
        assert_eq!(r.add(Arc::new("c")), 2);
        assert_eq!(*r.get(1).unwrap(), "b");
    }

    #[test]
    fn removed_ids_are_never_reissued() {
        let mut r = Registry::new();
        let a = r.add(Arc::new(1u32));
        r.remove(a).unwrap();
        let b = r.add(Arc::new(2u32));
        assert_ne!(a, b);
        assert!(r.get(a).is_none());
    }

    #[test]
    fn handles_are_stable_across_mutation() {
        let mut r = Registry::new();
        let id = r.add(Arc::new(String::from("keep")));
        let handle = r.get(id).unwrap();
        for i in 0..100 {
            r.add(Arc::new(format!("filler-{i}")));
        }
        assert_eq!(*handle, "keep");
    }
}
