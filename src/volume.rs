//! A mounted FAT32 volume.
//!
//! [`Volume`] owns the image device, the sector cache, the parsed
//! boot-sector geometry and the open-file table, plus the shell-visible
//! cursor: current cluster and current absolute path. The verb-level
//! operations in [`crate::ops`] are implemented on top of the allocator
//! and chain I/O provided here.

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Arc;

use log::{debug, warn};

use crate::bpb::BootSector;
use crate::cache::CacheManager;
use crate::device::{ImageDevice, ImageFile};
use crate::dir::DirTable;
use crate::fat::FatTable;
use crate::file::OpenFileTable;
use crate::{
    short_name_format, short_name_parse, FsError, Result, BOOT_SECTOR_SIZE, END_OF_CLUSTER,
    FREE_CLUSTER,
};

pub struct Volume {
    pub(crate) device: Arc<dyn ImageDevice>,
    pub(crate) cache: Arc<CacheManager>,
    pub(crate) bpb: BootSector,
    pub(crate) fat: FatTable,
    pub(crate) current_cluster: u32,
    pub(crate) current_path: String,
    pub(crate) image_name: String,
    pub(crate) open_files: OpenFileTable,
}

impl Volume {
    /// Mount the FAT32 image at `path`, opened read-write. The cursor
    /// starts at the root directory and the open-file table is empty.
    pub fn mount<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| {
                warn!("cannot open image {}: {}", path.display(), e);
                FsError::MountFailed
            })?;
        let image_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self::from_device(Arc::new(ImageFile::new(file)), &image_name)
    }

    /// Mount an already-open image device. `image_name` is the display
    /// name a shell shows in its prompt.
    pub fn from_device(device: Arc<dyn ImageDevice>, image_name: &str) -> Result<Self> {
        let cache = Arc::new(CacheManager::new(Arc::clone(&device)));

        let mut raw = [0u8; BOOT_SECTOR_SIZE];
        cache.read_at(0, &mut raw).map_err(|e| {
            warn!("cannot read boot sector of {}: {}", image_name, e);
            FsError::MountFailed
        })?;
        let bpb = BootSector::from_bytes(&raw);

        let fat = FatTable::new(Arc::clone(&cache), &bpb);
        debug!(
            "mounted {}: {} bytes/sector, {} sectors/cluster, {} FATs of {} sectors, \
             {} data clusters, root at cluster {}",
            image_name,
            bpb.bytes_per_sector(),
            bpb.sectors_per_cluster(),
            bpb.fat_count(),
            bpb.fat_size_sectors(),
            bpb.total_clusters(),
            bpb.root_cluster()
        );

        Ok(Self {
            device,
            cache,
            current_cluster: bpb.root_cluster(),
            current_path: String::from("/"),
            image_name: String::from(image_name),
            open_files: OpenFileTable::new(),
            bpb,
            fat,
        })
    }

    /// Flush everything and release the image.
    pub fn unmount(self) -> Result<()> {
        self.cache.sync()?;
        Ok(())
    }

    pub fn image_name(&self) -> &str {
        &self.image_name
    }

    /// Absolute `/`-rooted path of the current directory.
    pub fn current_path(&self) -> &str {
        &self.current_path
    }

    pub fn current_cluster(&self) -> u32 {
        self.current_cluster
    }

    pub(crate) fn cluster_size(&self) -> usize {
        self.bpb.cluster_size()
    }

    /// Directory-table view of the chain rooted at `cluster`.
    pub(crate) fn dir(&self, cluster: u32) -> DirTable<'_> {
        DirTable::new(self, cluster)
    }

    /// Absolute path of `name` inside the current directory, with the name
    /// folded to its canonical short form.
    pub(crate) fn child_path(&self, name: &str) -> String {
        let canon = short_name_parse(&short_name_format(name));
        if self.current_path == "/" {
            format!("/{}", canon)
        } else {
            format!("{}/{}", self.current_path, canon)
        }
    }

    /// Claim the lowest-numbered free cluster: mark it end-of-chain in
    /// every FAT copy and zero its data region. `None` when the scan finds
    /// no free entry.
    pub(crate) fn allocate_cluster(&self) -> Result<Option<u32>> {
        for cluster in 2..(self.bpb.total_clusters() as u32 + 2) {
            if self.fat.entry(cluster)? == FREE_CLUSTER {
                self.fat.set_entry(cluster, END_OF_CLUSTER)?;
                self.zero_cluster(cluster)?;
                debug!("allocated cluster {}", cluster);
                return Ok(Some(cluster));
            }
        }
        warn!("no free clusters left");
        Ok(None)
    }

    /// Allocate a cluster and hang it off `last`, the current chain tail.
    pub(crate) fn extend_chain(&self, last: u32) -> Result<Option<u32>> {
        match self.allocate_cluster()? {
            Some(next) => {
                self.fat.set_entry(last, next)?;
                Ok(Some(next))
            }
            None => Ok(None),
        }
    }

    /// Return a file's clusters to the free pool.
    pub(crate) fn free_cluster_chain(&self, start: u32) -> Result<()> {
        debug!("freeing cluster chain from {}", start);
        self.fat.free_chain(start)
    }

    fn zero_cluster(&self, cluster: u32) -> Result<()> {
        let zeroes = vec![0u8; self.cluster_size()];
        self.cache
            .write_at(self.bpb.cluster_offset(cluster), &zeroes)?;
        self.cache.sync()?;
        Ok(())
    }

    /// Read `buf.len()` bytes from the chain rooted at `first_cluster`,
    /// starting `offset` bytes in. Returns the bytes actually read, which
    /// falls short only if the chain ends early.
    pub(crate) fn read_chain(
        &self,
        first_cluster: u32,
        offset: usize,
        buf: &mut [u8],
    ) -> Result<usize> {
        let bpc = self.cluster_size();
        let mut cluster = self.fat.walk(first_cluster, offset / bpc)?;
        let mut in_cluster = offset % bpc;

        let mut done = 0;
        while done < buf.len() && self.fat.is_valid_cluster(cluster) {
            let len = (bpc - in_cluster).min(buf.len() - done);
            self.cache.read_at(
                self.bpb.cluster_offset(cluster) + in_cluster,
                &mut buf[done..done + len],
            )?;
            done += len;
            in_cluster = 0;
            cluster = self.fat.entry(cluster)?;
        }
        Ok(done)
    }

    /// Write `buf` into the chain rooted at `first_cluster`, starting
    /// `offset` bytes in. The chain must already be long enough; the
    /// caller extends it first. Flushes when the data is down.
    pub(crate) fn write_chain(
        &self,
        first_cluster: u32,
        offset: usize,
        buf: &[u8],
    ) -> Result<usize> {
        let bpc = self.cluster_size();
        let mut cluster = self.fat.walk(first_cluster, offset / bpc)?;
        let mut in_cluster = offset % bpc;

        let mut done = 0;
        while done < buf.len() && self.fat.is_valid_cluster(cluster) {
            let len = (bpc - in_cluster).min(buf.len() - done);
            self.cache.write_at(
                self.bpb.cluster_offset(cluster) + in_cluster,
                &buf[done..done + len],
            )?;
            done += len;
            in_cluster = 0;
            cluster = self.fat.entry(cluster)?;
        }
        self.cache.sync()?;
        Ok(done)
    }
}

impl Drop for Volume {
    fn drop(&mut self) {
        if let Err(e) = self.cache.sync() {
            warn!("flush of {} failed on drop: {}", self.image_name, e);
        }
    }
}
