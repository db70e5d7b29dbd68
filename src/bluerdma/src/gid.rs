//! Per-device GID table.
//!
//! Every entry sits behind its own lock. Writers fill in the address and attributes and set
//! the valid bit while holding it, so readers copy out either the old or the new entry, never a
//! mix of both.
use spin::Mutex;

use bluerdma_api::gid::{Gid, GidAttr, GidType, MacAddr};

use crate::log;
use crate::{Error, Result};

pub const DEFAULT_GID_TABLE_LEN: usize = 16;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GidEntry {
    pub gid: Gid,
    pub attr: GidAttr,
    pub valid: bool,
}

#[derive(Debug)]
pub struct GidTable {
    entries: Box<[Mutex<GidEntry>]>,
}

impl GidTable {
    pub fn new(len: usize) -> Self {
        assert!(len > 0, "a GID table needs at least one entry");
        GidTable {
            entries: (0..len).map(|_| Mutex::new(GidEntry::default())).collect(),
        }
    }

    /// A table whose entry 0 holds the link-local GID of `hw_addr`.
    pub fn with_default(len: usize, hw_addr: MacAddr, port_num: u8, ndev: &str) -> Self {
        let table = Self::new(len);
        let attr = GidAttr {
            gid_type: GidType::RoceV2,
            port_num,
            index: 0,
            ndev: Some(ndev.to_owned()),
        };
        let mut entry = table.entries[0].lock();
        entry.gid = Gid::from_mac(hw_addr);
        entry.attr = attr;
        entry.valid = true;
        drop(entry);
        table
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn slot(&self, index: usize) -> Result<&Mutex<GidEntry>> {
        self.entries.get(index).ok_or_else(|| {
            Error::InvalidArgument(format!(
                "GID index {} out of range [0, {})",
                index,
                self.entries.len()
            ))
        })
    }

    pub fn add(&self, index: usize, gid: Gid, attr: GidAttr) -> Result<()> {
        let slot = self.slot(index)?;
        let mut entry = slot.lock();
        entry.gid = gid;
        entry.attr = GidAttr {
            index: index as u32,
            ..attr
        };
        entry.valid = true;
        drop(entry);
        log::debug!("AddGid, index: {}, gid: {}", index, gid);
        Ok(())
    }

    /// Marks the entry invalid. Deleting an unset entry is a no-op.
    pub fn del(&self, index: usize) -> Result<()> {
        let slot = self.slot(index)?;
        slot.lock().valid = false;
        log::debug!("DelGid, index: {}", index);
        Ok(())
    }

    pub fn query(&self, index: usize) -> Result<Gid> {
        self.query_entry(index).map(|e| e.gid)
    }

    pub fn query_entry(&self, index: usize) -> Result<GidEntry> {
        let entry = self.slot(index)?.lock().clone();
        if entry.valid {
            Ok(entry)
        } else {
            Err(Error::NotFound(format!("GID index {} is not set", index)))
        }
    }

    pub fn find(&self, gid: &Gid) -> Option<usize> {
        self.entries.iter().position(|slot| {
            let entry = slot.lock();
            entry.valid && entry.gid == *gid
        })
    }

    /// All valid entries in index order.
    pub fn valid_entries(&self) -> Vec<(usize, Gid)> {
        self.entries
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| {
                let entry = slot.lock();
                entry.valid.then(|| (i, entry.gid))
            })
            .collect()
    }
}
