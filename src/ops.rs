//! Verb-level operations.
//!
//! One method per shell verb, `cmd_<verb>`. The shell owns tokenizing,
//! argument counting and all printing; these methods return structured
//! values and [`FsError`] kinds. Every precondition fails before any
//! mutation, so a rejected verb leaves the volume untouched. The one
//! rollback: `mkdir` frees its freshly allocated cluster when the parent
//! directory cannot take another entry.

use log::debug;

use crate::entry::DirEntry;
use crate::file::{parse_mode, OpenFile};
use crate::volume::Volume;
use crate::{
    short_name_format, short_name_parse, FsError, Result, ATTR_ARCHIVE, ATTR_DIRECTORY,
};

/// What `info` reports about the mounted volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolumeInfo {
    pub root_cluster: u32,
    pub bytes_per_sector: usize,
    pub sectors_per_cluster: usize,
    pub total_clusters: usize,
    pub fat_entry_count: usize,
    pub image_size: usize,
}

/// One `lsof` row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenFileInfo {
    pub index: usize,
    pub name: String,
    pub mode: String,
    pub offset: usize,
    pub path: String,
}

impl Volume {
    pub fn cmd_info(&self) -> Result<VolumeInfo> {
        Ok(VolumeInfo {
            root_cluster: self.bpb.root_cluster(),
            bytes_per_sector: self.bpb.bytes_per_sector(),
            sectors_per_cluster: self.bpb.sectors_per_cluster(),
            total_clusters: self.bpb.total_clusters(),
            fat_entry_count: self.bpb.fat_entry_count(),
            image_size: self.device.size()?,
        })
    }

    /// Names in the current directory, in on-disk order.
    pub fn cmd_ls(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for item in self.dir(self.current_cluster).iter() {
            let (_, entry) = item?;
            names.push(entry.name());
        }
        Ok(names)
    }

    pub fn cmd_cd(&mut self, name: &str) -> Result<()> {
        if name == "." {
            return Ok(());
        }

        let (_, entry) = self
            .dir(self.current_cluster)
            .find(name)?
            .ok_or(FsError::NotFound)?;
        if !entry.is_dir() {
            return Err(FsError::NotADirectory);
        }

        let cluster = entry.first_cluster();
        if name == ".." {
            if self.current_path != "/" {
                let cut = self.current_path.rfind('/').unwrap();
                if cut == 0 {
                    self.current_path.truncate(1);
                } else {
                    self.current_path.truncate(cut);
                }
            }
            // `..` of a directory right under the root stores 0.
            self.current_cluster = if cluster == 0 {
                self.bpb.root_cluster()
            } else {
                cluster
            };
        } else {
            self.current_path = self.child_path(name);
            self.current_cluster = cluster;
        }
        Ok(())
    }

    pub fn cmd_mkdir(&mut self, name: &str) -> Result<()> {
        let parent = self.current_cluster;
        if self.dir(parent).find(name)?.is_some() {
            return Err(FsError::AlreadyExists);
        }

        let new_cluster = self
            .allocate_cluster()?
            .ok_or(FsError::NoFreeClusters)?;

        // Slot 0 points at the directory itself, slot 1 at its parent,
        // with the root spelled as 0 per the dotdot convention.
        let table = self.dir(new_cluster);
        table.write_slot(
            0,
            &DirEntry::new(short_name_format("."), ATTR_DIRECTORY, new_cluster, 0),
        )?;
        let parent_link = if parent == self.bpb.root_cluster() {
            0
        } else {
            parent
        };
        table.write_slot(
            1,
            &DirEntry::new(short_name_format(".."), ATTR_DIRECTORY, parent_link, 0),
        )?;

        if !self.create_entry(parent, name, ATTR_DIRECTORY, new_cluster, 0)? {
            self.free_cluster_chain(new_cluster)?;
            return Err(FsError::NoFreeClusters);
        }
        debug!("mkdir {} -> cluster {}", name, new_cluster);
        Ok(())
    }

    pub fn cmd_creat(&mut self, name: &str) -> Result<()> {
        if self.dir(self.current_cluster).find(name)?.is_some() {
            return Err(FsError::AlreadyExists);
        }
        // No clusters yet; the first write allocates.
        if !self.create_entry(self.current_cluster, name, ATTR_ARCHIVE, 0, 0)? {
            return Err(FsError::NoFreeClusters);
        }
        Ok(())
    }

    pub fn cmd_open(&mut self, name: &str, mode_flag: &str) -> Result<()> {
        let mode = parse_mode(mode_flag).ok_or(FsError::InvalidMode)?;

        let (_, entry) = self
            .dir(self.current_cluster)
            .find(name)?
            .ok_or(FsError::NotFound)?;
        if entry.is_dir() {
            return Err(FsError::IsADirectory);
        }
        if self.open_files.find(&self.current_path, name).is_some() {
            return Err(FsError::AlreadyOpen);
        }

        let short_name = short_name_format(name);
        self.open_files.add(OpenFile {
            name: short_name_parse(&short_name),
            short_name,
            mode: mode.to_string(),
            offset: 0,
            dir_path: self.current_path.clone(),
            first_cluster: entry.first_cluster(),
            size: entry.file_size() as usize,
        })?;
        Ok(())
    }

    pub fn cmd_close(&mut self, name: &str) -> Result<()> {
        if self.dir(self.current_cluster).find(name)?.is_none() {
            return Err(FsError::NotFound);
        }
        let path = self.current_path.clone();
        if !self.open_files.remove(&path, name) {
            return Err(FsError::NotOpen);
        }
        Ok(())
    }

    pub fn cmd_lsof(&self) -> Vec<OpenFileInfo> {
        self.open_files
            .iter()
            .map(|(index, f)| OpenFileInfo {
                index,
                name: f.name.clone(),
                mode: f.mode.clone(),
                offset: f.offset,
                path: f.dir_path.clone(),
            })
            .collect()
    }

    pub fn cmd_lseek(&mut self, name: &str, offset: usize) -> Result<()> {
        let (_, entry) = self
            .dir(self.current_cluster)
            .find(name)?
            .ok_or(FsError::NotFound)?;
        let path = self.current_path.clone();
        let file = self
            .open_files
            .find_mut(&path, name)
            .ok_or(FsError::NotOpen)?;
        if offset > entry.file_size() as usize {
            return Err(FsError::OffsetOutOfRange);
        }
        file.offset = offset;
        Ok(())
    }

    /// Read up to `count` bytes at the handle's offset. Short only at end
    /// of file; the handle advances by what was read.
    pub fn cmd_read(&mut self, name: &str, count: usize) -> Result<Vec<u8>> {
        let (_, entry) = self
            .dir(self.current_cluster)
            .find(name)?
            .ok_or(FsError::NotFound)?;
        if entry.is_dir() {
            return Err(FsError::IsADirectory);
        }

        let path = self.current_path.clone();
        let offset = {
            let file = self
                .open_files
                .find(&path, name)
                .ok_or(FsError::NotOpen)?;
            if !file.readable() {
                return Err(FsError::NotReadable);
            }
            file.offset
        };

        let size = entry.file_size() as usize;
        let to_read = count.min(size.saturating_sub(offset));
        if to_read == 0 || entry.first_cluster() == 0 {
            return Ok(Vec::new());
        }

        let mut buf = vec![0u8; to_read];
        let n = self.read_chain(entry.first_cluster(), offset, &mut buf)?;
        buf.truncate(n);

        if let Some(file) = self.open_files.find_mut(&path, name) {
            file.offset += n;
        }
        Ok(buf)
    }

    /// Write `data` at the handle's offset, growing the chain as needed.
    /// Offsets inside the current size overwrite in place.
    pub fn cmd_write(&mut self, name: &str, data: &[u8]) -> Result<()> {
        let dir_cluster = self.current_cluster;
        let (slot_index, mut entry) = self
            .dir(dir_cluster)
            .find(name)?
            .ok_or(FsError::NotFound)?;
        if entry.is_dir() {
            return Err(FsError::IsADirectory);
        }

        let path = self.current_path.clone();
        let offset = {
            let file = self
                .open_files
                .find(&path, name)
                .ok_or(FsError::NotOpen)?;
            if !file.writable() {
                return Err(FsError::NotWritable);
            }
            file.offset
        };

        let len = data.len();
        let new_size = offset + len;
        let bpc = self.cluster_size();

        let mut first_cluster = entry.first_cluster();
        if first_cluster == 0 && len > 0 {
            first_cluster = self
                .allocate_cluster()?
                .ok_or(FsError::NoFreeClusters)?;
            entry.set_first_cluster(first_cluster);
        }

        if first_cluster != 0 {
            let have = self.fat.chain_len(first_cluster)?;
            let need = (new_size + bpc - 1) / bpc;
            if need > have {
                let mut last = self.fat.tail(first_cluster)?;
                for _ in have..need {
                    last = self
                        .extend_chain(last)?
                        .ok_or(FsError::NoFreeClusters)?;
                }
                debug!("{}: chain grown from {} to {} clusters", name, have, need);
            }
            if len > 0 {
                self.write_chain(first_cluster, offset, data)?;
            }
        }

        if new_size > entry.file_size() as usize {
            entry.set_file_size(new_size as u32);
            self.dir(dir_cluster).write_slot(slot_index, &entry)?;
            if let Some(file) = self.open_files.find_mut(&path, name) {
                file.size = new_size;
            }
        }
        if let Some(file) = self.open_files.find_mut(&path, name) {
            file.offset += len;
        }
        Ok(())
    }

    /// Rename `source`, or move it into `dest` when `dest` names an
    /// existing directory. The cluster chain never moves; only directory
    /// entries change.
    pub fn cmd_mv(&mut self, source: &str, dest: &str) -> Result<()> {
        let cur = self.current_cluster;
        let (src_index, src_entry) = self.dir(cur).find(source)?.ok_or(FsError::NotFound)?;

        if !src_entry.is_dir() && self.open_files.find(&self.current_path, source).is_some() {
            return Err(FsError::SourceOpen);
        }

        match self.dir(cur).find(dest)? {
            Some((_, dest_entry)) => {
                if !dest_entry.is_dir() {
                    return Err(FsError::AlreadyExists);
                }
                let dest_cluster = dest_entry.first_cluster();
                if self.dir(dest_cluster).find(source)?.is_some() {
                    return Err(FsError::AlreadyExists);
                }
                if !self.create_entry(
                    dest_cluster,
                    source,
                    src_entry.attr(),
                    src_entry.first_cluster(),
                    src_entry.file_size(),
                )? {
                    return Err(FsError::NoFreeClusters);
                }
                self.dir(cur).remove(source)?;
                debug!("mv {} into directory {}", source, dest);
            }
            None => {
                let mut entry = src_entry;
                entry.set_name_bytes(short_name_format(dest));
                self.dir(cur).write_slot(src_index, &entry)?;
                debug!("mv {} renamed to {}", source, dest);
            }
        }
        Ok(())
    }

    pub fn cmd_rm(&mut self, name: &str) -> Result<()> {
        let (_, entry) = self
            .dir(self.current_cluster)
            .find(name)?
            .ok_or(FsError::NotFound)?;
        if entry.is_dir() {
            return Err(FsError::IsADirectory);
        }
        if self.open_files.find(&self.current_path, name).is_some() {
            return Err(FsError::SourceOpen);
        }

        if entry.first_cluster() != 0 {
            self.free_cluster_chain(entry.first_cluster())?;
        }
        self.dir(self.current_cluster).remove(name)?;
        debug!("rm {}", name);
        Ok(())
    }

    pub fn cmd_rmdir(&mut self, name: &str) -> Result<()> {
        let (_, entry) = self
            .dir(self.current_cluster)
            .find(name)?
            .ok_or(FsError::NotFound)?;
        if !entry.is_dir() {
            return Err(FsError::NotADirectory);
        }

        let dir_cluster = entry.first_cluster();
        if !self.dir(dir_cluster).is_empty()? {
            return Err(FsError::DirectoryNotEmpty);
        }
        if self.open_files.any_under(&self.child_path(name)) {
            return Err(FsError::FileOpenInSubtree);
        }

        if dir_cluster != 0 {
            self.free_cluster_chain(dir_cluster)?;
        }
        self.dir(self.current_cluster).remove(name)?;
        debug!("rmdir {}", name);
        Ok(())
    }

    /// Put a fresh entry into the first reusable slot of `dir_cluster`.
    /// `false` when neither a slot nor a new cluster could be found.
    fn create_entry(
        &self,
        dir_cluster: u32,
        name: &str,
        attr: u8,
        first_cluster: u32,
        size: u32,
    ) -> Result<bool> {
        let table = self.dir(dir_cluster);
        let index = match table.free_slot()? {
            Some(index) => index,
            None => return Ok(false),
        };
        table.write_slot(
            index,
            &DirEntry::new(short_name_format(name), attr, first_cluster, size),
        )?;
        Ok(true)
    }
}
