// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Compress wide values into small ids which fit a hardware register.
//!
//! Identical values share one id. Each holder owns a [`MappedId`];
//! the id returns to the free pool when the last holder drops it.

use super::Result;
use crate::ddi::sync::KMutex;
use ctoff_api::OffloadError;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

struct Mapped<V> {
    value: V,
    refcnt: u32,
}

struct MappingInner<V> {
    by_value: BTreeMap<V, u32>,
    by_id: BTreeMap<u32, Mapped<V>>,
    // Ids released and available for reuse.
    free: BTreeSet<u32>,
    // The next never-used id.
    next: u32,
}

/// A table of value-to-id mappings. Ids start at 1 and never exceed
/// `max_id`; 0 is left for callers to use as a sentinel.
pub struct IdMapping<V> {
    name: &'static str,
    max_id: u32,
    inner: KMutex<MappingInner<V>>,
}

impl<V: Clone + Ord> IdMapping<V> {
    pub fn new(name: &'static str, max_id: u32) -> Arc<Self> {
        Arc::new(Self {
            name,
            max_id,
            inner: KMutex::new(MappingInner {
                by_value: BTreeMap::new(),
                by_id: BTreeMap::new(),
                free: BTreeSet::new(),
                next: 1,
            }),
        })
    }

    /// Map `value`, sharing the existing id if one exists.
    pub fn acquire(self: &Arc<Self>, value: V) -> Result<MappedId<V>> {
        let mut inner = self.inner.lock();

        if let Some(&id) = inner.by_value.get(&value) {
            if let Some(m) = inner.by_id.get_mut(&id) {
                m.refcnt += 1;
                return Ok(MappedId { map: self.clone(), id });
            }
        }

        let id = match inner.free.pop_first() {
            Some(id) => id,
            None if inner.next <= self.max_id => {
                let id = inner.next;
                inner.next += 1;
                id
            }
            None => {
                return Err(OffloadError::exhausted(
                    self.name,
                    u64::from(self.max_id),
                ));
            }
        };

        inner.by_value.insert(value.clone(), id);
        inner.by_id.insert(id, Mapped { value, refcnt: 1 });
        Ok(MappedId { map: self.clone(), id })
    }

    fn release(&self, id: u32) {
        let mut inner = self.inner.lock();
        let Some(m) = inner.by_id.get_mut(&id) else {
            return;
        };

        m.refcnt -= 1;
        if m.refcnt == 0 {
            if let Some(m) = inner.by_id.remove(&id) {
                inner.by_value.remove(&m.value);
            }
            inner.free.insert(id);
        }
    }

    /// Reverse lookup.
    pub fn find_value(&self, id: u32) -> Option<V> {
        self.inner.lock().by_id.get(&id).map(|m| m.value.clone())
    }

    /// The number of holders of `value`'s id.
    pub fn refcnt(&self, value: &V) -> u32 {
        let inner = self.inner.lock();
        inner
            .by_value
            .get(value)
            .and_then(|id| inner.by_id.get(id))
            .map(|m| m.refcnt)
            .unwrap_or(0)
    }

    /// The number of distinct values mapped.
    pub fn len(&self) -> usize {
        self.inner.lock().by_id.len()
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

/// A held mapping. Dropping it releases one reference on the id.
pub struct MappedId<V: Clone + Ord> {
    map: Arc<IdMapping<V>>,
    id: u32,
}

impl<V: Clone + Ord> MappedId<V> {
    pub fn id(&self) -> u32 {
        self.id
    }
}

impl<V: Clone + Ord> fmt::Debug for MappedId<V> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "MappedId({}:{})", self.map.name, self.id)
    }
}

impl<V: Clone + Ord> Drop for MappedId<V> {
    fn drop(&mut self) {
        self.map.release(self.id);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::thread;

    #[test]
    fn same_value_shares_id() {
        let map = IdMapping::<u16>::new("zone ids", 8);
        let a = map.acquire(10).unwrap();
        let b = map.acquire(10).unwrap();
        let c = map.acquire(11).unwrap();
        assert_eq!(a.id(), b.id());
        assert_ne!(a.id(), c.id());
        assert_eq!(map.refcnt(&10), 2);
        assert_eq!(map.find_value(a.id()), Some(10));

        drop(a);
        assert_eq!(map.refcnt(&10), 1);
        assert_eq!(map.find_value(b.id()), Some(10));
        let id = b.id();
        drop(b);
        assert_eq!(map.find_value(id), None);
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn exhaustion_and_reuse() {
        let map = IdMapping::<u16>::new("zone ids", 2);
        let a = map.acquire(1).unwrap();
        let _b = map.acquire(2).unwrap();
        assert_eq!(
            map.acquire(3).err(),
            Some(OffloadError::exhausted("zone ids", 2))
        );

        // An existing value still maps while full.
        assert!(map.acquire(2).is_ok());

        let freed = a.id();
        drop(a);
        let c = map.acquire(3).unwrap();
        assert_eq!(c.id(), freed);
    }

    #[test]
    fn concurrent_acquire_release() {
        let map = IdMapping::<u32>::new("labels", 64);
        let workers: Vec<_> = (0..8)
            .map(|t| {
                let map = map.clone();
                thread::spawn(move || {
                    for i in 0..500u32 {
                        let m = map.acquire((i + t) % 16).unwrap();
                        assert_eq!(map.find_value(m.id()), Some((i + t) % 16));
                    }
                })
            })
            .collect();

        for w in workers {
            w.join().unwrap();
        }
        assert_eq!(map.len(), 0);
    }
}
