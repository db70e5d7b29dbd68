//! Memory regions and the device-wide key table.
//!
//! A key is `index << MR_TAG_BITS | tag`. The local key's tag is a generation counter of the
//! slot, bumped on every registration. A stale local key stays dead until the same slot has been
//! registered `2^MR_TAG_BITS - 1` more times and the generation wraps; with FIFO recycling over
//! the whole table that takes at least `capacity * (2^MR_TAG_BITS - 1)` registrations. The
//! remote key's tag is random. Both keys die together when the slot is cleared under the
//! table's write lock.
use std::collections::VecDeque;

use rand::Rng;
use spin::RwLock;

use bluerdma_api::net::{AccessFlags, Sge};
use bluerdma_api::Handle;

use crate::log;
use crate::{Error, Result};

pub const MR_INDEX_BITS: u32 = 12;
pub const MR_TAG_BITS: u32 = 32 - MR_INDEX_BITS;
pub const MAX_MR_CNT: usize = 1 << MR_INDEX_BITS;
const MR_TAG_MASK: u32 = (1 << MR_TAG_BITS) - 1;

#[inline]
fn compose_key(index: u32, tag: u32) -> u32 {
    (index << MR_TAG_BITS) | (tag & MR_TAG_MASK)
}

#[inline]
fn split_key(key: u32) -> (usize, u32) {
    ((key >> MR_TAG_BITS) as usize, key & MR_TAG_MASK)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MrKeys {
    pub lkey: u32,
    pub rkey: u32,
}

/// What a live key resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MrBinding {
    pub pd: Handle,
    pub addr: u64,
    pub length: u64,
    pub access: AccessFlags,
}

impl MrBinding {
    #[inline]
    pub fn contains(&self, addr: u64, length: u64) -> bool {
        match (addr.checked_sub(self.addr), addr.checked_add(length)) {
            (Some(offset), Some(_)) => offset
                .checked_add(length)
                .map_or(false, |end| end <= self.length),
            _ => false,
        }
    }
}

#[derive(Debug, Default)]
struct Slot {
    generation: u32,
    rtag: u32,
    binding: Option<MrBinding>,
}

#[derive(Debug)]
struct Slots {
    slots: Vec<Slot>,
    free: VecDeque<u32>,
}

#[derive(Debug)]
pub struct MrTable {
    inner: RwLock<Slots>,
}

impl MrTable {
    pub fn new(max_mr: usize) -> Self {
        assert!(
            max_mr > 0 && max_mr <= MAX_MR_CNT,
            "MR table length {} out of range",
            max_mr
        );
        MrTable {
            inner: RwLock::new(Slots {
                slots: (0..max_mr).map(|_| Slot::default()).collect(),
                free: (0..max_mr as u32).collect(),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.read().slots.len()
    }

    /// Number of registered regions.
    pub fn live(&self) -> usize {
        let inner = self.inner.read();
        inner.slots.len() - inner.free.len()
    }

    pub(crate) fn register(&self, binding: MrBinding) -> Result<MrKeys> {
        let mut inner = self.inner.write();
        let capacity = inner.slots.len();
        let index = inner.free.pop_front().ok_or_else(|| {
            Error::ResourceExhausted(format!("all {} MR keys are in use", capacity))
        })?;
        let slot = &mut inner.slots[index as usize];
        assert!(slot.binding.is_none(), "free MR slot {} is bound", index);
        // tag 0 is skipped so that key 0 (reserved DMA lkey) is never issued
        slot.generation = match (slot.generation + 1) & MR_TAG_MASK {
            0 => 1,
            g => g,
        };
        slot.rtag = rand::thread_rng().gen_range(1..=MR_TAG_MASK);
        slot.binding = Some(binding);
        Ok(MrKeys {
            lkey: compose_key(index, slot.generation),
            rkey: compose_key(index, slot.rtag),
        })
    }

    pub(crate) fn deregister(&self, lkey: u32) -> Result<MrBinding> {
        let (index, tag) = split_key(lkey);
        let mut inner = self.inner.write();
        let slot = inner
            .slots
            .get_mut(index)
            .filter(|s| s.binding.is_some() && s.generation == tag)
            .ok_or_else(|| Error::NotFound(format!("lkey {:#x} is not registered", lkey)))?;
        let binding = slot.binding.take();
        inner.free.push_back(index as u32);
        log::trace!("MR slot {} released", index);
        binding.ok_or_else(|| Error::NotFound(format!("lkey {:#x} is not registered", lkey)))
    }

    pub fn resolve_lkey(&self, lkey: u32) -> Option<MrBinding> {
        let (index, tag) = split_key(lkey);
        let inner = self.inner.read();
        inner
            .slots
            .get(index)
            .filter(|s| s.generation == tag)
            .and_then(|s| s.binding)
    }

    pub fn resolve_rkey(&self, rkey: u32) -> Option<MrBinding> {
        let (index, tag) = split_key(rkey);
        let inner = self.inner.read();
        inner
            .slots
            .get(index)
            .filter(|s| s.rtag == tag)
            .and_then(|s| s.binding)
    }

    /// Checks that `sge` lies in a live region of `pd` granting `access`.
    pub fn check_sge(&self, pd: Handle, sge: &Sge, access: AccessFlags) -> Result<()> {
        let binding = self.resolve_lkey(sge.lkey).ok_or_else(|| {
            Error::InvalidArgument(format!("lkey {:#x} is not registered", sge.lkey))
        })?;
        if binding.pd != pd {
            return Err(Error::InvalidArgument(format!(
                "lkey {:#x} belongs to another protection domain",
                sge.lkey
            )));
        }
        if !binding.contains(sge.addr, sge.length as u64) {
            return Err(Error::InvalidArgument(format!(
                "sge [{:#x}, +{}) is outside the region of lkey {:#x}",
                sge.addr, sge.length, sge.lkey
            )));
        }
        if !binding.access.contains(access) {
            return Err(Error::InvalidArgument(format!(
                "lkey {:#x} lacks {:?}",
                sge.lkey, access
            )));
        }
        Ok(())
    }
}

/// A registered region as seen by its owning context.
#[derive(Debug)]
pub struct MemoryRegion {
    handle: Handle,
    binding: MrBinding,
    keys: MrKeys,
}

impl MemoryRegion {
    pub(crate) fn new(handle: Handle, binding: MrBinding, keys: MrKeys) -> Self {
        MemoryRegion {
            handle,
            binding,
            keys,
        }
    }

    #[inline]
    pub fn handle(&self) -> Handle {
        self.handle
    }

    #[inline]
    pub fn pd(&self) -> Handle {
        self.binding.pd
    }

    #[inline]
    pub fn addr(&self) -> u64 {
        self.binding.addr
    }

    #[inline]
    pub fn len(&self) -> u64 {
        self.binding.length
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.binding.length == 0
    }

    #[inline]
    pub fn access(&self) -> AccessFlags {
        self.binding.access
    }

    #[inline]
    pub fn lkey(&self) -> u32 {
        self.keys.lkey
    }

    #[inline]
    pub fn rkey(&self) -> u32 {
        self.keys.rkey
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    use super::*;

    fn binding(pd: u64) -> MrBinding {
        MrBinding {
            pd: Handle(pd),
            addr: 0x1000,
            length: 0x1000,
            access: AccessFlags::LOCAL_WRITE,
        }
    }

    #[test]
    fn lkeys_unique_across_reuse() {
        let table = MrTable::new(64);
        let mut rng = StdRng::seed_from_u64(0xb1ed);
        let mut seen = HashSet::new();
        let mut live: Vec<u32> = Vec::new();
        for _ in 0..10_000 {
            if live.len() == table.capacity() || (!live.is_empty() && rng.gen_bool(0.5)) {
                let victim = live.swap_remove(rng.gen_range(0..live.len()));
                table.deregister(victim).unwrap();
                assert!(table.resolve_lkey(victim).is_none());
            }
            let keys = table.register(binding(1)).unwrap();
            assert!(seen.insert(keys.lkey), "lkey {:#x} issued twice", keys.lkey);
            assert_ne!(keys.lkey, 0);
            live.push(keys.lkey);
        }
        assert_eq!(table.live(), live.len());
    }

    #[test]
    fn stale_keys_do_not_resolve() {
        let table = MrTable::new(1);
        let old = table.register(binding(1)).unwrap();
        table.deregister(old.lkey).unwrap();
        assert!(table.resolve_rkey(old.rkey).is_none());
        let new = table.register(binding(2)).unwrap();
        assert_ne!(old.lkey, new.lkey);
        assert!(table.resolve_lkey(old.lkey).is_none());
        assert_eq!(table.resolve_lkey(new.lkey).unwrap().pd, Handle(2));
        assert!(matches!(table.deregister(old.lkey), Err(Error::NotFound(_))));
    }

    #[test]
    fn generation_wraps_after_full_cycle() {
        let table = MrTable::new(1);
        let old = table.register(binding(1)).unwrap();
        table.deregister(old.lkey).unwrap();
        for _ in 1..MR_TAG_MASK {
            let keys = table.register(binding(1)).unwrap();
            assert_ne!(keys.lkey, old.lkey);
            assert!(table.resolve_lkey(old.lkey).is_none());
            table.deregister(keys.lkey).unwrap();
        }
        let wrapped = table.register(binding(1)).unwrap();
        assert_eq!(wrapped.lkey, old.lkey);
    }

    #[test]
    fn exhaustion() {
        let table = MrTable::new(2);
        table.register(binding(1)).unwrap();
        table.register(binding(1)).unwrap();
        assert!(matches!(
            table.register(binding(1)),
            Err(Error::ResourceExhausted(_))
        ));
    }

    #[test]
    fn sge_checks() {
        let table = MrTable::new(4);
        let keys = table.register(binding(1)).unwrap();
        let sge = |addr, length| Sge {
            addr,
            length,
            lkey: keys.lkey,
        };
        table
            .check_sge(Handle(1), &sge(0x1000, 0x1000), AccessFlags::LOCAL_WRITE)
            .unwrap();
        table
            .check_sge(Handle(1), &sge(0x1800, 0x10), AccessFlags::empty())
            .unwrap();
        assert!(table
            .check_sge(Handle(2), &sge(0x1000, 8), AccessFlags::empty())
            .is_err());
        assert!(table
            .check_sge(Handle(1), &sge(0x1ff8, 16), AccessFlags::empty())
            .is_err());
        assert!(table
            .check_sge(Handle(1), &sge(0xff8, 16), AccessFlags::empty())
            .is_err());
        assert!(table
            .check_sge(Handle(1), &sge(0x1000, 8), AccessFlags::REMOTE_READ)
            .is_err());
    }

    #[test]
    fn bounds_do_not_overflow() {
        let b = MrBinding {
            pd: Handle(1),
            addr: u64::MAX - 31,
            length: 16,
            access: AccessFlags::empty(),
        };
        assert!(b.contains(u64::MAX - 31, 16));
        assert!(!b.contains(u64::MAX - 31, 17));
        assert!(!b.contains(u64::MAX, 2));
        assert!(!b.contains(u64::MAX - 40, 4));
    }
}
