use crate::{Error, Result};
use std::ops::Range;

/// Byte-addressable view of the sandbox's linear memory.
///
/// Addresses are sandbox-native 32-bit offsets.
pub trait LinearMemory {
    /// Current size in bytes.
    fn size(&self) -> u32;

    /// Copy `buf.len()` bytes starting at `addr` into `buf`.
    fn read(&self, addr: u32, buf: &mut [u8]) -> Result<()>;

    /// Copy `data` into memory starting at `addr`.
    fn write(&mut self, addr: u32, data: &[u8]) -> Result<()>;
}

/// Resolve `[addr, addr + len)` against a memory of `size` bytes.
pub fn checked_range(size: u32, addr: u32, len: usize) -> Result<Range<usize>> {
    let start = addr as usize;
    let end = start
        .checked_add(len)
        .filter(|end| *end <= size as usize)
        .ok_or_else(|| {
            Error::InvalidArgument(format!(
                "range {:#x}+{} outside linear memory of {} bytes",
                addr, len, size
            ))
        })?;
    Ok(start..end)
}

/// Owned linear memory.
#[derive(Debug, Clone, Default)]
pub struct VecMemory {
    bytes: Vec<u8>,
}

impl VecMemory {
    pub fn new(size: u32) -> Self {
        Self {
            bytes: vec![0; size as usize],
        }
    }

    /// Grow to at least `size` bytes; never shrinks.
    pub fn grow_to(&mut self, size: u32) {
        if size as usize > self.bytes.len() {
            self.bytes.resize(size as usize, 0);
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }
}

impl LinearMemory for VecMemory {
    fn size(&self) -> u32 {
        self.bytes.len() as u32
    }

    fn read(&self, addr: u32, buf: &mut [u8]) -> Result<()> {
        let range = checked_range(self.size(), addr, buf.len())?;
        buf.copy_from_slice(&self.bytes[range]);
        Ok(())
    }

    fn write(&mut self, addr: u32, data: &[u8]) -> Result<()> {
        let range = checked_range(self.size(), addr, data.len())?;
        self.bytes[range].copy_from_slice(data);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_of_bounds_access_is_rejected() {
        let mut memory = VecMemory::new(16);
        assert!(memory.write(12, &[1, 2, 3, 4]).is_ok());
        assert!(matches!(
            memory.write(14, &[1, 2, 3]),
            Err(Error::InvalidArgument(_))
        ));
        let mut buf = [0u8; 4];
        assert!(memory.read(u32::MAX, &mut buf).is_err());
    }

    #[test]
    fn grow_preserves_contents() {
        let mut memory = VecMemory::new(4);
        memory.write(0, b"abcd").unwrap();
        memory.grow_to(8);
        assert_eq!(memory.size(), 8);
        assert_eq!(&memory.as_slice()[..4], b"abcd");
    }
}
