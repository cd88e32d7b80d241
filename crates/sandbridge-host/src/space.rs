//! Host-side address-space decisions for emulated mappings.

use crate::memory::HostMemory;
use log::trace;
use sandbridge_core::{Error as CoreError, Result as CoreResult};

/// First-fit allocator over page runs in `[base, limit)`.
///
/// One bit per page; set bits are in use.
#[derive(Debug)]
pub struct AddressSpace {
    base: u32,
    page_size: u32,
    pages: u32,
    bitmap: Vec<u64>,
}

impl AddressSpace {
    pub fn new(base: u32, limit: u32, page_size: u32) -> Self {
        let pages = limit.saturating_sub(base) / page_size;
        Self {
            base,
            page_size,
            pages,
            bitmap: vec![0; pages.div_ceil(64) as usize],
        }
    }

    /// Round `length` up to whole pages.
    pub fn round_up(&self, length: u32) -> Option<u32> {
        let pages = length.div_ceil(self.page_size);
        pages.checked_mul(self.page_size)
    }

    /// Reserve a run covering `length` bytes and make sure memory backs it.
    ///
    /// Returns the base address and the reserved length.
    pub fn allocate(&mut self, memory: &mut dyn HostMemory, length: u32) -> CoreResult<(u32, u32)> {
        let wanted = length.div_ceil(self.page_size);
        if wanted == 0 {
            return Err(CoreError::InvalidArgument("zero-length reservation".to_string()));
        }

        let mut run_start = 0u32;
        let mut run_len = 0u32;
        for page in 0..self.pages {
            if self.is_page_used(page) {
                run_len = 0;
                continue;
            }
            if run_len == 0 {
                run_start = page;
            }
            run_len += 1;
            if run_len == wanted {
                let addr = self.base + run_start * self.page_size;
                let reserved = wanted * self.page_size;
                memory.grow_to(addr + reserved)?;
                self.mark_pages(run_start, wanted, true);
                trace!("reserved {:#x}+{:#x}", addr, reserved);
                return Ok((addr, reserved));
            }
        }
        Err(CoreError::OutOfMemory)
    }

    /// Return the pages covering `[addr, addr + length)`.
    pub fn free(&mut self, addr: u32, length: u32) -> CoreResult<()> {
        let (first, count) = self.page_span(addr, length)?;
        if (first..first + count).any(|page| !self.is_page_used(page)) {
            return Err(CoreError::InvalidArgument(format!(
                "{:#x}+{:#x} is not reserved",
                addr, length
            )));
        }
        self.mark_pages(first, count, false);
        trace!("released {:#x}+{:#x}", addr, length);
        Ok(())
    }

    /// Whether every page of `[addr, addr + length)` is reserved.
    pub fn is_reserved(&self, addr: u32, length: u32) -> bool {
        self.page_span(addr, length)
            .map(|(first, count)| (first..first + count).all(|page| self.is_page_used(page)))
            .unwrap_or(false)
    }

    /// Reserved bytes.
    pub fn used(&self) -> u64 {
        let pages: u32 = self.bitmap.iter().map(|word| word.count_ones()).sum();
        u64::from(pages) * u64::from(self.page_size)
    }

    fn page_span(&self, addr: u32, length: u32) -> CoreResult<(u32, u32)> {
        if addr < self.base || (addr - self.base) % self.page_size != 0 || length == 0 {
            return Err(CoreError::InvalidArgument(format!(
                "{:#x}+{:#x} is not a page run",
                addr, length
            )));
        }
        let first = (addr - self.base) / self.page_size;
        let count = length.div_ceil(self.page_size);
        if first.checked_add(count).map_or(true, |end| end > self.pages) {
            return Err(CoreError::InvalidArgument(format!(
                "{:#x}+{:#x} is outside the heap",
                addr, length
            )));
        }
        Ok((first, count))
    }

    fn is_page_used(&self, page: u32) -> bool {
        let word = (page / 64) as usize;
        let bit = page % 64;
        (self.bitmap[word] & (1 << bit)) != 0
    }

    fn mark_pages(&mut self, start: u32, count: u32, used: bool) {
        for page in start..start + count {
            let word = (page / 64) as usize;
            let bit = page % 64;
            if used {
                self.bitmap[word] |= 1 << bit;
            } else {
                self.bitmap[word] &= !(1 << bit);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::SharedMemory;
    use sandbridge_core::LinearMemory;

    #[test]
    fn first_fit_reuses_freed_run() {
        let mut memory = SharedMemory::new(0x10000, 0x100000);
        let mut space = AddressSpace::new(0x10000, 0x100000, 4096);

        let (a, len_a) = space.allocate(&mut memory, 100).unwrap();
        let (b, _) = space.allocate(&mut memory, 4096).unwrap();
        assert_eq!(a, 0x10000);
        assert_eq!(len_a, 4096);
        assert_eq!(b, 0x11000);

        space.free(a, len_a).unwrap();
        let (c, _) = space.allocate(&mut memory, 10).unwrap();
        assert_eq!(c, a);
    }

    #[test]
    fn allocation_grows_memory() {
        let mut memory = SharedMemory::new(0x10000, 0x100000);
        let mut space = AddressSpace::new(0x10000, 0x100000, 4096);
        let (addr, len) = space.allocate(&mut memory, 0x3000).unwrap();
        assert!(memory.size() >= addr + len);
    }

    #[test]
    fn exhaustion_is_out_of_memory() {
        let mut memory = SharedMemory::new(0x10000, 0x14000);
        let mut space = AddressSpace::new(0x10000, 0x14000, 4096);
        space.allocate(&mut memory, 0x3000).unwrap();
        assert!(matches!(
            space.allocate(&mut memory, 0x2000),
            Err(CoreError::OutOfMemory)
        ));
    }

    #[test]
    fn double_free_is_rejected() {
        let mut memory = SharedMemory::new(0x10000, 0x100000);
        let mut space = AddressSpace::new(0x10000, 0x100000, 4096);
        let (addr, len) = space.allocate(&mut memory, 4096).unwrap();
        space.free(addr, len).unwrap();
        assert!(space.free(addr, len).is_err());
        assert_eq!(space.used(), 0);
    }
}
