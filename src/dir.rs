//! Directory-entry tables.
//!
//! A directory is an ordinary cluster chain whose data is a run of 32-byte
//! entries. Slots are addressed by index across the whole chain, in
//! on-disk order, so the slot for index `i` lives `i / entries_per_cluster`
//! clusters down the chain at offset `(i % entries_per_cluster) * 32`.
//!
//! Enumeration stops at the first slot whose `name[0]` is `0x00` (nothing
//! after it is allocated) and skips tombstoned (`0xE5`) and long-name
//! slots. Deleting rewrites only the matched slot; the `0x00` terminator
//! stays where it is so later slots keep reading as unallocated.

use crate::entry::DirEntry;
use crate::volume::Volume;
use crate::{short_name_format, Result, DIRENT_SIZE};

pub struct DirTable<'v> {
    vol: &'v Volume,
    first_cluster: u32,
}

impl<'v> DirTable<'v> {
    pub(crate) fn new(vol: &'v Volume, first_cluster: u32) -> Self {
        Self { vol, first_cluster }
    }

    fn entries_per_cluster(&self) -> usize {
        self.vol.cluster_size() / DIRENT_SIZE
    }

    fn read_slot_raw(&self, cluster: u32, slot: usize) -> Result<DirEntry> {
        let mut raw = [0u8; DIRENT_SIZE];
        self.vol.cache.read_at(
            self.vol.bpb.cluster_offset(cluster) + slot * DIRENT_SIZE,
            &mut raw,
        )?;
        Ok(DirEntry::from_bytes(&raw))
    }

    /// Live entries with their slot indices, in on-disk order.
    pub fn iter(&self) -> DirIter<'_, 'v> {
        DirIter {
            table: self,
            cluster: self.first_cluster,
            slot: 0,
            index: 0,
            finished: false,
        }
    }

    /// Locate `name` (formatted to its short form) among the live entries.
    pub fn find(&self, name: &str) -> Result<Option<(usize, DirEntry)>> {
        let key = short_name_format(name);
        for item in self.iter() {
            let (index, entry) = item?;
            if entry.name_bytes() == key {
                return Ok(Some((index, entry)));
            }
        }
        Ok(None)
    }

    /// Index of the first reusable slot: a tombstone or the terminator.
    /// When the chain holds no such slot, a fresh cluster is linked on and
    /// its first slot returned. `None` means the volume is out of space.
    pub fn free_slot(&self) -> Result<Option<usize>> {
        let epc = self.entries_per_cluster();
        let mut cluster = self.first_cluster;
        let mut index = 0;

        while self.vol.fat.is_valid_cluster(cluster) {
            for slot in 0..epc {
                let entry = self.read_slot_raw(cluster, slot)?;
                if entry.is_end() || entry.is_deleted() {
                    return Ok(Some(index + slot));
                }
            }
            index += epc;

            let next = self.vol.fat.entry(cluster)?;
            if !self.vol.fat.is_valid_cluster(next) {
                // Every slot in the chain is live; grow the directory.
                return match self.vol.extend_chain(cluster)? {
                    Some(_) => Ok(Some(index)),
                    None => Ok(None),
                };
            }
            cluster = next;
        }
        Ok(None)
    }

    /// Store `entry` in the slot at `index` and flush.
    pub fn write_slot(&self, index: usize, entry: &DirEntry) -> Result<()> {
        let epc = self.entries_per_cluster();
        let cluster = self.vol.fat.walk(self.first_cluster, index / epc)?;
        if !self.vol.fat.is_valid_cluster(cluster) {
            return Ok(());
        }
        self.vol.cache.write_at(
            self.vol.bpb.cluster_offset(cluster) + (index % epc) * DIRENT_SIZE,
            &entry.to_bytes(),
        )?;
        self.vol.cache.sync()?;
        Ok(())
    }

    /// Tombstone the entry named `name`. Returns whether a slot matched.
    pub fn remove(&self, name: &str) -> Result<bool> {
        let key = short_name_format(name);
        let epc = self.entries_per_cluster();
        let mut cluster = self.first_cluster;
        let mut index = 0;

        while self.vol.fat.is_valid_cluster(cluster) {
            for slot in 0..epc {
                let mut entry = self.read_slot_raw(cluster, slot)?;
                if entry.is_end() {
                    return Ok(false);
                }
                if !entry.is_deleted() && entry.name_bytes() == key {
                    entry.delete();
                    self.write_slot(index + slot, &entry)?;
                    return Ok(true);
                }
            }
            index += epc;
            cluster = self.vol.fat.entry(cluster)?;
        }
        Ok(false)
    }

    /// A directory is empty when nothing but `.` and `..` survives
    /// enumeration.
    pub fn is_empty(&self) -> Result<bool> {
        for item in self.iter() {
            let (_, entry) = item?;
            if !entry.is_dot() {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

pub struct DirIter<'t, 'v> {
    table: &'t DirTable<'v>,
    cluster: u32,
    slot: usize,
    index: usize,
    finished: bool,
}

impl Iterator for DirIter<'_, '_> {
    type Item = Result<(usize, DirEntry)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        let epc = self.table.entries_per_cluster();
        loop {
            if !self.table.vol.fat.is_valid_cluster(self.cluster) {
                self.finished = true;
                return None;
            }
            if self.slot == epc {
                match self.table.vol.fat.entry(self.cluster) {
                    Ok(next) => {
                        self.cluster = next;
                        self.slot = 0;
                        continue;
                    }
                    Err(e) => {
                        self.finished = true;
                        return Some(Err(e));
                    }
                }
            }

            let entry = match self.table.read_slot_raw(self.cluster, self.slot) {
                Ok(entry) => entry,
                Err(e) => {
                    self.finished = true;
                    return Some(Err(e));
                }
            };
            let index = self.index;
            self.slot += 1;
            self.index += 1;

            if entry.is_end() {
                self.finished = true;
                return None;
            }
            if entry.is_deleted() || entry.is_long_name() {
                continue;
            }
            return Some(Ok((index, entry)));
        }
    }
}
