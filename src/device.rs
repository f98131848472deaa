//! Image device interface.
//!
//! Every byte the engine reads or writes goes through [`ImageDevice`]. The
//! production backend is [`ImageFile`], a host file opened read-write in
//! binary mode; [`MemImage`] keeps the whole image in memory and backs the
//! test suite.

use std::any::Any;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};

use spin::RwLock;

pub trait ImageDevice: Send + Sync + Any {
    /// Fill `buf` from the image starting at `offset`. Short reads are
    /// errors; the caller always knows how many bytes it wants.
    fn read_at(&self, buf: &mut [u8], offset: usize) -> io::Result<()>;

    /// Write all of `buf` to the image starting at `offset`.
    fn write_at(&self, buf: &[u8], offset: usize) -> io::Result<()>;

    /// Push buffered writes down to durable storage.
    fn flush(&self) -> io::Result<()>;

    /// Total size of the image in bytes.
    fn size(&self) -> io::Result<usize>;
}

/// A FAT32 image stored in a regular host file.
pub struct ImageFile(pub RwLock<File>);

impl ImageFile {
    pub fn new(file: File) -> Self {
        Self(RwLock::new(file))
    }
}

impl ImageDevice for ImageFile {
    fn read_at(&self, buf: &mut [u8], offset: usize) -> io::Result<()> {
        let mut file = self.0.write();
        file.seek(SeekFrom::Start(offset as u64))?;
        file.read_exact(buf)
    }

    fn write_at(&self, buf: &[u8], offset: usize) -> io::Result<()> {
        let mut file = self.0.write();
        file.seek(SeekFrom::Start(offset as u64))?;
        file.write_all(buf)
    }

    fn flush(&self) -> io::Result<()> {
        self.0.write().sync_data()
    }

    fn size(&self) -> io::Result<usize> {
        Ok(self.0.read().metadata()?.len() as usize)
    }
}

/// A FAT32 image held entirely in memory. Reads and writes past the end of
/// the buffer fail the way a short host file would.
pub struct MemImage(pub RwLock<Vec<u8>>);

impl MemImage {
    pub fn new(data: Vec<u8>) -> Self {
        Self(RwLock::new(data))
    }
}

impl ImageDevice for MemImage {
    fn read_at(&self, buf: &mut [u8], offset: usize) -> io::Result<()> {
        let data = self.0.read();
        let end = offset
            .checked_add(buf.len())
            .filter(|&end| end <= data.len())
            .ok_or_else(|| io::Error::from(io::ErrorKind::UnexpectedEof))?;
        buf.copy_from_slice(&data[offset..end]);
        Ok(())
    }

    fn write_at(&self, buf: &[u8], offset: usize) -> io::Result<()> {
        let mut data = self.0.write();
        let end = offset
            .checked_add(buf.len())
            .filter(|&end| end <= data.len())
            .ok_or_else(|| io::Error::from(io::ErrorKind::WriteZero))?;
        data[offset..end].copy_from_slice(buf);
        Ok(())
    }

    fn flush(&self) -> io::Result<()> {
        Ok(())
    }

    fn size(&self) -> io::Result<usize> {
        Ok(self.0.read().len())
    }
}
