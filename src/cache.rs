//! Write-back sector cache between the engine and the image device.
//!
//! Blocks are fixed [`CACHE_BLOCK_SIZE`] granules of the image, independent
//! of the volume's bytes-per-sector; byte ranges are split across granules.
//! The cache is owned by the volume it serves; keying a shared cache by
//! block id would alias blocks across volumes. Dirty blocks are written
//! back on [`CacheManager::sync`] and when a block falls out of the LRU.

use std::io;
use std::sync::Arc;

use log::warn;
use lru::LruCache;
use spin::{Mutex, RwLock};

use crate::device::ImageDevice;
use crate::{CACHE_BLOCK_LIMIT, CACHE_BLOCK_SIZE};

pub trait Cache {
    /// The read-only mapper to the cached block.
    ///
    /// - `offset`: offset in the block
    /// - `f`: a closure over the value at that offset
    fn read<T, V>(&self, offset: usize, f: impl FnOnce(&T) -> V) -> V;
    /// The mutable mapper to the cached block; marks the block dirty.
    fn modify<T, V>(&mut self, offset: usize, f: impl FnOnce(&mut T) -> V) -> V;
    /// Write the block back if it is dirty.
    fn sync(&mut self) -> io::Result<()>;
}

pub struct BlockCache {
    cache: Vec<u8>,
    // block id on the image, not within any cluster
    block_id: usize,
    device: Arc<dyn ImageDevice>,
    modified: bool,
}

impl BlockCache {
    /// Load one block from the image.
    pub fn new(block_id: usize, device: Arc<dyn ImageDevice>) -> io::Result<Self> {
        let mut cache = vec![0u8; CACHE_BLOCK_SIZE];
        device.read_at(&mut cache, block_id * CACHE_BLOCK_SIZE)?;
        Ok(Self {
            cache,
            block_id,
            device,
            modified: false,
        })
    }

    fn addr_of_offset(&self, offset: usize) -> usize {
        &self.cache[offset] as *const _ as usize
    }

    fn get_ref<T>(&self, offset: usize) -> &T
    where
        T: Sized,
    {
        let type_size = core::mem::size_of::<T>();
        assert!(offset + type_size <= CACHE_BLOCK_SIZE);
        let addr = self.addr_of_offset(offset);
        unsafe { &*(addr as *const T) }
    }

    fn get_mut<T>(&mut self, offset: usize) -> &mut T
    where
        T: Sized,
    {
        let type_size = core::mem::size_of::<T>();
        assert!(offset + type_size <= CACHE_BLOCK_SIZE);
        self.modified = true;
        let addr = self.addr_of_offset(offset);
        unsafe { &mut *(addr as *mut T) }
    }
}

impl Cache for BlockCache {
    fn read<T, V>(&self, offset: usize, f: impl FnOnce(&T) -> V) -> V {
        f(self.get_ref(offset))
    }

    fn modify<T, V>(&mut self, offset: usize, f: impl FnOnce(&mut T) -> V) -> V {
        f(self.get_mut(offset))
    }

    fn sync(&mut self) -> io::Result<()> {
        if self.modified {
            self.modified = false;
            self.device
                .write_at(&self.cache, self.block_id * CACHE_BLOCK_SIZE)?;
        }
        Ok(())
    }
}

impl Drop for BlockCache {
    fn drop(&mut self) {
        if let Err(e) = self.sync() {
            warn!("block {} lost on write-back: {}", self.block_id, e);
        }
    }
}

pub struct CacheManager {
    device: Arc<dyn ImageDevice>,
    lru: Mutex<LruCache<usize, Arc<RwLock<BlockCache>>>>,
}

impl CacheManager {
    pub fn new(device: Arc<dyn ImageDevice>) -> Self {
        Self {
            device,
            lru: Mutex::new(LruCache::unbounded()),
        }
    }

    /// Get the cached copy of a block, loading it on a miss.
    fn get_block(&self, block_id: usize) -> io::Result<Arc<RwLock<BlockCache>>> {
        let mut lru = self.lru.lock();
        if let Some(pair) = lru.get(&block_id) {
            return Ok(Arc::clone(pair));
        }

        let block = Arc::new(RwLock::new(BlockCache::new(
            block_id,
            Arc::clone(&self.device),
        )?));

        if lru.len() == CACHE_BLOCK_LIMIT {
            // Evict the coldest block nobody still holds; write-back happens
            // when its last Arc drops.
            let (_, peek) = lru.peek_lru().unwrap();
            if Arc::strong_count(peek) == 1 {
                lru.pop_lru();
                lru.put(block_id, Arc::clone(&block));
            }
        } else {
            lru.put(block_id, Arc::clone(&block));
        }
        Ok(block)
    }

    /// Read `buf.len()` bytes starting at the absolute image offset.
    pub fn read_at(&self, offset: usize, buf: &mut [u8]) -> io::Result<()> {
        let mut pos = offset;
        let mut done = 0;
        while done < buf.len() {
            let block_id = pos / CACHE_BLOCK_SIZE;
            let off = pos % CACHE_BLOCK_SIZE;
            let len = (CACHE_BLOCK_SIZE - off).min(buf.len() - done);
            let block = self.get_block(block_id)?;
            block.read().read(0, |data: &[u8; CACHE_BLOCK_SIZE]| {
                buf[done..done + len].copy_from_slice(&data[off..off + len]);
            });
            pos += len;
            done += len;
        }
        Ok(())
    }

    /// Write `buf` starting at the absolute image offset.
    pub fn write_at(&self, offset: usize, buf: &[u8]) -> io::Result<()> {
        let mut pos = offset;
        let mut done = 0;
        while done < buf.len() {
            let block_id = pos / CACHE_BLOCK_SIZE;
            let off = pos % CACHE_BLOCK_SIZE;
            let len = (CACHE_BLOCK_SIZE - off).min(buf.len() - done);
            let block = self.get_block(block_id)?;
            block.write().modify(0, |data: &mut [u8; CACHE_BLOCK_SIZE]| {
                data[off..off + len].copy_from_slice(&buf[done..done + len]);
            });
            pos += len;
            done += len;
        }
        Ok(())
    }

    /// Write every dirty block back and flush the device.
    pub fn sync(&self) -> io::Result<()> {
        let lru = self.lru.lock();
        for (_, block) in lru.iter() {
            block.write().sync()?;
        }
        self.device.flush()
    }
}
