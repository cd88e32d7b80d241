//! Descriptor table of backing files.

use crate::Result;
use log::debug;
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

/// Lowest descriptor handed out; 0-2 stay reserved for stdio.
pub const FIRST_FD: i32 = 3;

/// Open backing files keyed by descriptor.
#[derive(Debug, Default)]
pub struct FdTable {
    files: BTreeMap<i32, File>,
}

impl FdTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open `path` read-write, creating it if missing.
    pub fn open(&mut self, path: &Path) -> Result<i32> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let fd = self.insert(file);
        debug!("fd {} -> {}", fd, path.display());
        Ok(fd)
    }

    /// Register an already open file under the lowest free descriptor.
    pub fn insert(&mut self, file: File) -> i32 {
        let mut fd = FIRST_FD;
        while self.files.contains_key(&fd) {
            fd += 1;
        }
        self.files.insert(fd, file);
        fd
    }

    pub fn close(&mut self, fd: i32) -> bool {
        self.files.remove(&fd).is_some()
    }

    pub fn contains(&self, fd: i32) -> bool {
        self.files.contains_key(&fd)
    }

    /// Read up to `buf.len()` bytes at `offset`; short at end of file.
    pub fn read_at(&mut self, fd: i32, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        let file = self.file(fd)?;
        file.seek(SeekFrom::Start(offset))?;
        let mut filled = 0;
        while filled < buf.len() {
            match file.read(&mut buf[filled..])? {
                0 => break,
                n => filled += n,
            }
        }
        Ok(filled)
    }

    /// Write all of `data` at `offset`, extending the file if needed.
    pub fn write_at(&mut self, fd: i32, offset: u64, data: &[u8]) -> io::Result<()> {
        let file = self.file(fd)?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        file.flush()
    }

    fn file(&mut self, fd: i32) -> io::Result<&mut File> {
        self.files.get_mut(&fd).ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("bad file descriptor {}", fd))
        })
    }
}
