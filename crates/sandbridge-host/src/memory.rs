use sandbridge_core::{checked_range, Error as CoreError, LinearMemory, Result as CoreResult};
use std::sync::{Arc, Mutex, MutexGuard};

/// Linear memory as the host sees it: readable, writable and growable.
pub trait HostMemory: LinearMemory {
    /// Grow to at least `size` bytes. Fails with `OutOfMemory` past the limit.
    fn grow_to(&mut self, size: u32) -> CoreResult<()>;
}

/// Linear memory shared between an in-process bridge and the host.
///
/// Clones refer to the same bytes.
#[derive(Debug, Clone)]
pub struct SharedMemory {
    bytes: Arc<Mutex<Vec<u8>>>,
    limit: u32,
}

impl SharedMemory {
    pub fn new(initial: u32, limit: u32) -> Self {
        Self {
            bytes: Arc::new(Mutex::new(vec![0; initial as usize])),
            limit,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<u8>> {
        self.bytes.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Copy out `[addr, addr + len)`.
    pub fn snapshot(&self, addr: u32, len: usize) -> CoreResult<Vec<u8>> {
        let mut buf = vec![0; len];
        self.read(addr, &mut buf)?;
        Ok(buf)
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }
}

impl LinearMemory for SharedMemory {
    fn size(&self) -> u32 {
        self.lock().len() as u32
    }

    fn read(&self, addr: u32, buf: &mut [u8]) -> CoreResult<()> {
        let bytes = self.lock();
        let range = checked_range(bytes.len() as u32, addr, buf.len())?;
        buf.copy_from_slice(&bytes[range]);
        Ok(())
    }

    fn write(&mut self, addr: u32, data: &[u8]) -> CoreResult<()> {
        let mut bytes = self.lock();
        let range = checked_range(bytes.len() as u32, addr, data.len())?;
        bytes[range].copy_from_slice(data);
        Ok(())
    }
}

impl HostMemory for SharedMemory {
    fn grow_to(&mut self, size: u32) -> CoreResult<()> {
        if size > self.limit {
            return Err(CoreError::OutOfMemory);
        }
        let mut bytes = self.lock();
        if size as usize > bytes.len() {
            bytes.resize(size as usize, 0);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_bytes() {
        let mut memory = SharedMemory::new(4096, 8192);
        let view = memory.clone();
        memory.write(10, b"shared").unwrap();
        assert_eq!(view.snapshot(10, 6).unwrap(), b"shared");
    }

    #[test]
    fn growth_stops_at_limit() {
        let mut memory = SharedMemory::new(4096, 8192);
        memory.grow_to(8192).unwrap();
        assert_eq!(memory.size(), 8192);
        assert!(matches!(memory.grow_to(8193), Err(CoreError::OutOfMemory)));
    }
}
