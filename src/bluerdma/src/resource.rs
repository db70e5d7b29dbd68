use std::hash::Hash;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry;
use dashmap::DashMap;
use fnv::FnvBuildHasher;

use thiserror::Error;

use bluerdma_api::Handle;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("Resource not found in the table")]
    NotFound,
    #[error("Resource exists in the table")]
    Exists,
    #[error("Resource is still referenced by {0} object(s)")]
    InUse(usize),
    #[error("Handle space of the owner is exhausted")]
    HandleExhausted,
}

impl From<Error> for bluerdma_api::Error {
    fn from(e: Error) -> Self {
        let msg = e.to_string();
        match e {
            Error::NotFound => bluerdma_api::Error::NotFound(msg),
            Error::Exists => bluerdma_api::Error::InvalidArgument(msg),
            Error::InUse(_) => bluerdma_api::Error::Busy(msg),
            Error::HandleExhausted => bluerdma_api::Error::ResourceExhausted(msg),
        }
    }
}

#[derive(Debug)]
pub struct ResourceTableGeneric<K: Eq + Hash, R> {
    table: DashMap<K, Entry<R>, FnvBuildHasher>,
}

pub type ResourceTable<R> = ResourceTableGeneric<Handle, R>;

impl<K: Eq + Hash, R> Default for ResourceTableGeneric<K, R> {
    fn default() -> Self {
        ResourceTableGeneric {
            table: DashMap::default(),
        }
    }
}

#[derive(Debug)]
pub struct Entry<R> {
    // number of live objects that depend on this one
    usecnt: AtomicUsize,
    data: Arc<R>,
}

impl<R> Entry<R> {
    fn new(data: Arc<R>) -> Self {
        Entry {
            usecnt: AtomicUsize::new(0),
            data,
        }
    }

    #[inline]
    pub fn data(&self) -> Arc<R> {
        Arc::clone(&self.data)
    }

    #[inline]
    pub fn usecnt(&self) -> usize {
        self.usecnt.load(Ordering::Acquire)
    }

    #[inline]
    fn acquire(&self) {
        self.usecnt.fetch_add(1, Ordering::AcqRel);
    }

    #[inline]
    fn release(&self) {
        let prev = self.usecnt.fetch_sub(1, Ordering::AcqRel);
        assert!(prev > 0, "unbalanced release of a resource table entry");
    }
}

impl<K: Eq + Hash + Clone, R> ResourceTableGeneric<K, R> {
    pub fn inner(&self) -> &DashMap<K, Entry<R>, FnvBuildHasher> {
        &self.table
    }

    pub fn insert(&self, h: K, r: R) -> Result<Arc<R>, Error> {
        match self.table.entry(h) {
            entry::Entry::Occupied(_) => Err(Error::Exists),
            entry::Entry::Vacant(e) => {
                let data = Arc::new(r);
                e.insert(Entry::new(Arc::clone(&data)));
                Ok(data)
            }
        }
    }

    pub fn get(&self, h: &K) -> Result<Arc<R>, Error> {
        self.table.get(h).map(|r| r.data()).ok_or(Error::NotFound)
    }

    /// Looks up the resource and records one more dependent on it. Every `acquire` must be
    /// paired with a [`release`](Self::release).
    pub fn acquire(&self, h: &K) -> Result<Arc<R>, Error> {
        self.table
            .get(h)
            .map(|r| {
                r.acquire();
                r.data()
            })
            .ok_or(Error::NotFound)
    }

    pub fn release(&self, h: &K) -> Result<(), Error> {
        self.table.get(h).map(|r| r.release()).ok_or(Error::NotFound)
    }

    /// Removes the resource unless other objects still depend on it.
    pub fn remove(&self, h: &K) -> Result<Arc<R>, Error> {
        match self.table.remove_if(h, |_, e| e.usecnt() == 0) {
            Some((_, e)) => Ok(e.data),
            None => match self.table.get(h) {
                Some(e) => Err(Error::InUse(e.usecnt())),
                None => Err(Error::NotFound),
            },
        }
    }

    pub fn keys(&self) -> Vec<K> {
        self.table.iter().map(|e| e.key().clone()).collect()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.table.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

/// Hands out the handles of the objects one owner creates. Handles are never reused.
#[derive(Debug)]
pub struct HandleAllocator {
    owner: u32,
    next: AtomicU32,
}

impl HandleAllocator {
    pub fn new(owner: u32) -> Self {
        HandleAllocator {
            owner,
            next: AtomicU32::new(1),
        }
    }

    #[inline]
    pub fn owner(&self) -> Handle {
        Handle::compose(self.owner, 0)
    }

    pub fn alloc(&self) -> Result<Handle, Error> {
        self.next
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_add(1))
            .map(|seq| Handle::compose(self.owner, seq))
            .map_err(|_| Error::HandleExhausted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_get_remove() {
        let table: ResourceTable<u32> = ResourceTable::default();
        let h = Handle(1);
        assert_eq!(*table.insert(h, 7).unwrap(), 7);
        assert_eq!(table.insert(h, 8).unwrap_err(), Error::Exists);
        assert_eq!(*table.get(&h).unwrap(), 7);
        assert_eq!(*table.remove(&h).unwrap(), 7);
        assert_eq!(table.get(&h).unwrap_err(), Error::NotFound);
        assert_eq!(table.remove(&h).unwrap_err(), Error::NotFound);
    }

    #[test]
    fn dependents_block_removal() {
        let table: ResourceTable<&'static str> = ResourceTable::default();
        let h = Handle(2);
        table.insert(h, "pd").unwrap();
        table.acquire(&h).unwrap();
        table.acquire(&h).unwrap();
        assert_eq!(table.remove(&h).unwrap_err(), Error::InUse(2));
        table.release(&h).unwrap();
        assert_eq!(table.remove(&h).unwrap_err(), Error::InUse(1));
        table.release(&h).unwrap();
        assert!(table.remove(&h).is_ok());
        assert!(table.is_empty());
    }

    #[test]
    #[should_panic(expected = "unbalanced release")]
    fn unbalanced_release_is_fatal() {
        let table: ResourceTable<()> = ResourceTable::default();
        table.insert(Handle(3), ()).unwrap();
        let _ = table.release(&Handle(3));
    }

    #[test]
    fn handles_are_unique_and_owned() {
        let alloc = HandleAllocator::new(9);
        let a = alloc.alloc().unwrap();
        let b = alloc.alloc().unwrap();
        assert_ne!(a, b);
        assert_eq!(a.owner(), alloc.owner());
        assert_eq!(b.owner_id(), 9);
        assert_ne!(a, alloc.owner());
    }

    #[test]
    fn in_use_maps_to_busy() {
        let e: bluerdma_api::Error = Error::InUse(1).into();
        assert!(matches!(e, bluerdma_api::Error::Busy(_)));
        let e: bluerdma_api::Error = Error::HandleExhausted.into();
        assert!(matches!(e, bluerdma_api::Error::ResourceExhausted(_)));
    }
}
