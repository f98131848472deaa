//! Shared fixtures: a freshly formatted single-sector-per-cluster volume
//! held in memory, plus raw accessors for checking what actually landed on
//! the image.
#![allow(dead_code)]

use std::convert::TryInto;
use std::sync::Arc;

use fat32_vol::device::MemImage;
use fat32_vol::Volume;

pub const BYTES_PER_SECTOR: usize = 512;
pub const SECTORS_PER_CLUSTER: usize = 1;
pub const RESERVED_SECTORS: usize = 32;
pub const NUM_FATS: usize = 2;
pub const FAT_SIZE_SECTORS: usize = 16;
pub const TOTAL_SECTORS: usize = 2048;
pub const DATA_START_SECTOR: usize = RESERVED_SECTORS + NUM_FATS * FAT_SIZE_SECTORS;
pub const TOTAL_CLUSTERS: usize = (TOTAL_SECTORS - DATA_START_SECTOR) / SECTORS_PER_CLUSTER;

/// A blank, valid FAT32 image: boot sector, two empty FATs with the
/// reserved entries seeded, root directory at cluster 2 with an empty
/// chain of exactly one cluster.
pub fn blank_image() -> Vec<u8> {
    let mut img = vec![0u8; TOTAL_SECTORS * BYTES_PER_SECTOR];

    img[0] = 0xEB;
    img[1] = 0x58;
    img[2] = 0x90;
    img[3..11].copy_from_slice(b"mkfs.fat");
    img[11..13].copy_from_slice(&(BYTES_PER_SECTOR as u16).to_le_bytes());
    img[13] = SECTORS_PER_CLUSTER as u8;
    img[14..16].copy_from_slice(&(RESERVED_SECTORS as u16).to_le_bytes());
    img[16] = NUM_FATS as u8;
    img[21] = 0xF8;
    img[32..36].copy_from_slice(&(TOTAL_SECTORS as u32).to_le_bytes());
    img[36..40].copy_from_slice(&(FAT_SIZE_SECTORS as u32).to_le_bytes());
    img[44..48].copy_from_slice(&2u32.to_le_bytes());
    img[48..50].copy_from_slice(&1u16.to_le_bytes());
    img[50..52].copy_from_slice(&6u16.to_le_bytes());
    img[66] = 0x29;
    img[510] = 0x55;
    img[511] = 0xAA;

    for k in 0..NUM_FATS {
        let base = (RESERVED_SECTORS + k * FAT_SIZE_SECTORS) * BYTES_PER_SECTOR;
        // FAT[0] carries the media byte, FAT[1] the end mark, and the root
        // directory cluster is a one-cluster chain.
        img[base..base + 4].copy_from_slice(&0x0FFF_FFF8u32.to_le_bytes());
        img[base + 4..base + 8].copy_from_slice(&0xFFFF_FFFFu32.to_le_bytes());
        img[base + 8..base + 12].copy_from_slice(&0x0FFF_FFFFu32.to_le_bytes());
    }
    img
}

pub fn fresh() -> (Arc<MemImage>, Volume) {
    let dev = Arc::new(MemImage::new(blank_image()));
    let vol = Volume::from_device(dev.clone(), "test.img").expect("mount blank image");
    (dev, vol)
}

/// Masked FAT entry for `cluster` straight off the image.
pub fn fat_entry(dev: &MemImage, copy: usize, cluster: u32) -> u32 {
    let data = dev.0.read();
    let off = (RESERVED_SECTORS + copy * FAT_SIZE_SECTORS) * BYTES_PER_SECTOR
        + cluster as usize * 4;
    u32::from_le_bytes(data[off..off + 4].try_into().unwrap()) & 0x0FFF_FFFF
}

/// Raw bytes of one FAT copy.
pub fn fat_copy(dev: &MemImage, copy: usize) -> Vec<u8> {
    let data = dev.0.read();
    let start = (RESERVED_SECTORS + copy * FAT_SIZE_SECTORS) * BYTES_PER_SECTOR;
    data[start..start + FAT_SIZE_SECTORS * BYTES_PER_SECTOR].to_vec()
}

/// Raw data bytes of `cluster`.
pub fn cluster_bytes(dev: &MemImage, cluster: u32) -> Vec<u8> {
    let data = dev.0.read();
    let start =
        (DATA_START_SECTOR + (cluster as usize - 2) * SECTORS_PER_CLUSTER) * BYTES_PER_SECTOR;
    data[start..start + SECTORS_PER_CLUSTER * BYTES_PER_SECTOR].to_vec()
}

/// Count of free FAT entries across the data-cluster range.
pub fn free_cluster_count(dev: &MemImage) -> usize {
    (2..(TOTAL_CLUSTERS as u32 + 2))
        .filter(|&c| fat_entry(dev, 0, c) == 0)
        .count()
}
