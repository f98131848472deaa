//! Open-file handles.
//!
//! A handle pairs a file with a byte offset and an access mode while a
//! shell works on it. Identity is the (containing-directory absolute path,
//! formatted short name) pair; the table holds at most one live handle per
//! identity and at most [`MAX_OPEN_FILES`] handles overall.

use crate::{short_name_format, FsError, Result, MAX_OPEN_FILES, SHORT_NAME_LEN};

/// Accepted open flags, with the leading dash: `-r`, `-w`, `-rw`, `-wr`.
/// Returns the canonical stored form, the substring after the dash.
pub fn parse_mode(flag: &str) -> Option<&str> {
    match flag {
        "-r" | "-w" | "-rw" | "-wr" => Some(&flag[1..]),
        _ => None,
    }
}

#[derive(Debug, Clone)]
pub struct OpenFile {
    /// Canonical display name, the parsed short form.
    pub name: String,
    /// Formatted 11-byte name, the comparison key.
    pub short_name: [u8; SHORT_NAME_LEN],
    /// `r`, `w`, `rw` or `wr`.
    pub mode: String,
    /// Current byte offset for read and write.
    pub offset: usize,
    /// Absolute path of the containing directory.
    pub dir_path: String,
    /// First cluster recorded when the file was opened.
    pub first_cluster: u32,
    /// File size recorded at open, refreshed by writes.
    pub size: usize,
}

impl OpenFile {
    pub fn readable(&self) -> bool {
        self.mode.contains('r')
    }

    pub fn writable(&self) -> bool {
        self.mode.contains('w')
    }
}

pub struct OpenFileTable {
    slots: [Option<OpenFile>; MAX_OPEN_FILES],
}

impl OpenFileTable {
    pub fn new() -> Self {
        Self {
            slots: core::array::from_fn(|_| None),
        }
    }

    pub fn find(&self, dir_path: &str, name: &str) -> Option<&OpenFile> {
        let key = short_name_format(name);
        self.slots
            .iter()
            .flatten()
            .find(|f| f.short_name == key && f.dir_path == dir_path)
    }

    pub fn find_mut(&mut self, dir_path: &str, name: &str) -> Option<&mut OpenFile> {
        let key = short_name_format(name);
        self.slots
            .iter_mut()
            .flatten()
            .find(|f| f.short_name == key && f.dir_path == dir_path)
    }

    /// Claim the first free slot. The caller has already ruled out a live
    /// handle with the same identity.
    pub fn add(&mut self, file: OpenFile) -> Result<usize> {
        for (i, slot) in self.slots.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(file);
                return Ok(i);
            }
        }
        Err(FsError::TooManyOpenFiles)
    }

    pub fn remove(&mut self, dir_path: &str, name: &str) -> bool {
        let key = short_name_format(name);
        for slot in self.slots.iter_mut() {
            if let Some(f) = slot {
                if f.short_name == key && f.dir_path == dir_path {
                    *slot = None;
                    return true;
                }
            }
        }
        false
    }

    /// Live handles with their table indices, in slot order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &OpenFile)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|f| (i, f)))
    }

    /// True when some live handle sits in `dir_path` or anywhere below it.
    /// The separator check keeps `/FOOBAR` from matching a `/FOO` target.
    pub fn any_under(&self, dir_path: &str) -> bool {
        let prefix = format!("{}/", dir_path);
        self.slots
            .iter()
            .flatten()
            .any(|f| f.dir_path == dir_path || f.dir_path.starts_with(&prefix))
    }
}

impl Default for OpenFileTable {
    fn default() -> Self {
        Self::new()
    }
}
