//! Emulated `mmap`/`munmap`/`msync`.
//!
//! The host has no mapped-memory primitive, so a mapping is bookkeeping over
//! ordinary reads and writes: the host picks an address and fills it, the
//! bridge records what was mapped and which bytes the program has written
//! since, and writes those bytes back for `Shared` file mappings on `sync`
//! and before the mapping disappears on `unmap`.

use crate::config::BridgeConfig;
use crate::handle::{HandleId, HandleTable, Record};
use crate::memory::LinearMemory;
use crate::transport::{unexpected, Request, Response, Transport};
use crate::{Error, Result};
use bitflags::bitflags;
use log::{debug, trace, warn};
use std::collections::BTreeMap;
use std::ops::Range;

bitflags! {
    /// Page protection (`PROT_*`).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Prot: u32 {
        const READ = 0x1;
        const WRITE = 0x2;
        const EXEC = 0x4;
    }
}

bitflags! {
    /// Mapping flags (`MAP_*`).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MapFlags: u32 {
        const SHARED = 0x01;
        const PRIVATE = 0x02;
        const FIXED = 0x10;
        const ANONYMOUS = 0x20;
    }
}

bitflags! {
    /// `msync` flags (`MS_*`).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SyncFlags: u32 {
        const ASYNC = 0x1;
        const INVALIDATE = 0x2;
        const SYNC = 0x4;
    }
}

/// Whether writes reach the backing store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sharing {
    /// Copy-on-write; never written back.
    Private,
    Shared,
}

/// Where the mapped bytes come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backing {
    Anonymous,
    File { fd: i32, offset: u32 },
}

/// Written-but-unflushed byte ranges, relative to the mapping base.
///
/// Kept sorted, disjoint and with touching ranges merged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirtyRanges {
    ranges: Vec<Range<u32>>,
}

impl DirtyRanges {
    pub fn insert(&mut self, range: Range<u32>) {
        if range.is_empty() {
            return;
        }
        let mut merged = range;
        self.ranges.retain(|r| {
            if r.start <= merged.end && merged.start <= r.end {
                merged.start = merged.start.min(r.start);
                merged.end = merged.end.max(r.end);
                false
            } else {
                true
            }
        });
        let at = self
            .ranges
            .iter()
            .position(|r| r.start > merged.start)
            .unwrap_or(self.ranges.len());
        self.ranges.insert(at, merged);
    }

    /// Smallest range covering every dirty byte inside `window`.
    pub fn extent_within(&self, window: &Range<u32>) -> Option<Range<u32>> {
        let mut clipped = self
            .ranges
            .iter()
            .map(|r| r.start.max(window.start)..r.end.min(window.end))
            .filter(|r| !r.is_empty());
        let first = clipped.next()?;
        let last_end = clipped.last().map_or(first.end, |r| r.end);
        Some(first.start..last_end)
    }

    /// Forget every dirty byte inside `window`.
    pub fn clear_within(&mut self, window: &Range<u32>) {
        let mut kept = Vec::with_capacity(self.ranges.len() + 1);
        for r in self.ranges.drain(..) {
            if r.end <= window.start || r.start >= window.end {
                kept.push(r);
                continue;
            }
            if r.start < window.start {
                kept.push(r.start..window.start);
            }
            if r.end > window.end {
                kept.push(window.end..r.end);
            }
        }
        self.ranges = kept;
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Total dirty bytes.
    pub fn bytes(&self) -> u64 {
        self.ranges.iter().map(|r| u64::from(r.end - r.start)).sum()
    }

    pub fn ranges(&self) -> &[Range<u32>] {
        &self.ranges
    }
}

/// One live mapped region.
#[derive(Debug, Clone)]
pub struct Mapping {
    base: u32,
    length: u32,
    requested: u32,
    prot: Prot,
    flags: MapFlags,
    sharing: Sharing,
    backing: Backing,
    dirty: DirtyRanges,
}

impl Mapping {
    pub fn base(&self) -> u32 {
        self.base
    }

    /// Length the host actually reserved.
    pub fn length(&self) -> u32 {
        self.length
    }

    /// Length the program asked for.
    pub fn requested_length(&self) -> u32 {
        self.requested
    }

    /// One past the last reserved byte.
    pub fn end(&self) -> u32 {
        self.base + self.length
    }

    pub fn prot(&self) -> Prot {
        self.prot
    }

    pub fn flags(&self) -> MapFlags {
        self.flags
    }

    pub fn sharing(&self) -> Sharing {
        self.sharing
    }

    pub fn backing(&self) -> Backing {
        self.backing
    }

    pub fn contains(&self, addr: u32) -> bool {
        addr >= self.base && addr < self.end()
    }

    pub fn is_dirty(&self) -> bool {
        !self.dirty.is_empty()
    }

    pub fn dirty(&self) -> &DirtyRanges {
        &self.dirty
    }

    /// Whether writes to this mapping must reach a backing file.
    pub fn writes_back(&self) -> bool {
        self.sharing == Sharing::Shared && matches!(self.backing, Backing::File { .. })
    }

    /// Bytes past the requested length share the last page but never reach
    /// the file, so they are not tracked.
    fn note_write(&mut self, addr: u32, len: u32) {
        if self.writes_back() {
            let start = addr - self.base;
            let stop = (start + len).min(self.requested);
            if start < stop {
                self.dirty.insert(start..stop);
            }
        }
    }

    fn backing_fields(&self) -> (i32, u32) {
        match self.backing {
            Backing::Anonymous => (-1, 0),
            Backing::File { fd, offset } => (fd, offset),
        }
    }

    fn release_request(&self) -> Request {
        let (fd, offset) = self.backing_fields();
        Request::Unmap {
            addr: self.base,
            length: self.length,
            prot: self.prot.bits(),
            flags: self.flags.bits(),
            fd,
            offset,
        }
    }
}

/// Result of a successful map request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mapped {
    pub handle: HandleId,
    pub addr: u32,
    pub allocated_length: u32,
}

/// What an unmap removed and what went wrong on the way.
///
/// Flush and release failures never stop the removal; they are reported here.
#[derive(Debug, Default)]
pub struct UnmapReport {
    pub unmapped: Vec<Range<u32>>,
    pub flush_errors: Vec<(u32, Error)>,
    pub release_errors: Vec<(u32, Error)>,
}

impl UnmapReport {
    pub fn is_clean(&self) -> bool {
        self.flush_errors.is_empty() && self.release_errors.is_empty()
    }
}

/// Tracks live mappings by base address.
///
/// The records themselves live in the [`HandleTable`]; this index only maps
/// base addresses to their handles.
#[derive(Debug)]
pub struct MappingManager {
    page_size: u32,
    allow_exec: bool,
    max_mapping_len: u32,
    by_base: BTreeMap<u32, HandleId>,
}

impl MappingManager {
    pub fn new(config: &BridgeConfig) -> Self {
        Self {
            page_size: config.page_size,
            allow_exec: config.allow_exec,
            max_mapping_len: config.max_mapping_len,
            by_base: BTreeMap::new(),
        }
    }

    /// Ask the host for a new mapping and register it.
    #[allow(clippy::too_many_arguments)]
    pub fn map<T: Transport + ?Sized>(
        &mut self,
        table: &mut HandleTable,
        transport: &mut T,
        length: u32,
        prot: Prot,
        flags: MapFlags,
        fd: i32,
        offset: u32,
    ) -> Result<Mapped> {
        let sharing = self.validate(length, prot, flags, fd, offset)?;
        if table.is_full() {
            return Err(Error::OutOfHandles);
        }

        let backing = if flags.contains(MapFlags::ANONYMOUS) {
            Backing::Anonymous
        } else {
            Backing::File { fd, offset }
        };
        let mut mapping = Mapping {
            base: 0,
            length: 0,
            requested: length,
            prot,
            flags,
            sharing,
            backing,
            dirty: DirtyRanges::default(),
        };

        let (host_fd, host_offset) = mapping.backing_fields();
        let request = Request::Map {
            length,
            prot: prot.bits(),
            flags: flags.bits(),
            fd: host_fd,
            offset: host_offset,
        };
        let (addr, allocated_length) = match transport.call(&request)? {
            Response::Mapped {
                addr,
                allocated_length,
            } => (addr, allocated_length),
            other => return Err(unexpected("map", &other)),
        };
        mapping.base = addr;
        mapping.length = allocated_length;

        let registered = self
            .check_placement(table, addr, length, allocated_length)
            .and_then(|()| table.allocate(Record::Mapping(mapping.clone())));
        let handle = match registered {
            Ok(handle) => handle,
            Err(err) => {
                warn!(
                    "Rejecting host mapping {:#x}+{}: {}",
                    addr, allocated_length, err
                );
                if let Err(release_err) = transport.call(&mapping.release_request()) {
                    warn!("Failed to hand back {:#x}: {}", addr, release_err);
                }
                return Err(err);
            }
        };

        self.by_base.insert(addr, handle);
        debug!(
            "Mapped {:#x}+{} ({:?}, {:?}, {:?}) as {}",
            addr, allocated_length, prot, sharing, backing, handle
        );

        Ok(Mapped {
            handle,
            addr,
            allocated_length,
        })
    }

    fn validate(
        &self,
        length: u32,
        prot: Prot,
        flags: MapFlags,
        fd: i32,
        offset: u32,
    ) -> Result<Sharing> {
        if length == 0 {
            return Err(Error::InvalidArgument("zero-length mapping".to_string()));
        }
        if length > self.max_mapping_len {
            return Err(Error::OutOfMemory);
        }

        let sharing = match (
            flags.contains(MapFlags::SHARED),
            flags.contains(MapFlags::PRIVATE),
        ) {
            (true, false) => Sharing::Shared,
            (false, true) => Sharing::Private,
            _ => {
                return Err(Error::InvalidArgument(
                    "exactly one of MAP_SHARED and MAP_PRIVATE is required".to_string(),
                ))
            }
        };

        if flags.contains(MapFlags::FIXED) {
            return Err(Error::InvalidArgument(
                "MAP_FIXED is not supported; the host chooses addresses".to_string(),
            ));
        }
        if prot.contains(Prot::EXEC) && !self.allow_exec {
            return Err(Error::InvalidArgument(
                "executable mappings are disabled".to_string(),
            ));
        }
        if offset & (self.page_size - 1) != 0 {
            return Err(Error::InvalidArgument(format!(
                "offset {} is not a multiple of the page size",
                offset
            )));
        }
        if !flags.contains(MapFlags::ANONYMOUS) && fd < 0 {
            return Err(Error::InvalidArgument(format!(
                "invalid backing descriptor {}",
                fd
            )));
        }

        Ok(sharing)
    }

    fn check_placement(
        &self,
        table: &HandleTable,
        addr: u32,
        length: u32,
        allocated_length: u32,
    ) -> Result<()> {
        if allocated_length < length {
            return Err(Error::Transport(format!(
                "host reserved {} bytes for a {} byte request",
                allocated_length, length
            )));
        }
        if addr & (self.page_size - 1) != 0 {
            return Err(Error::Transport(format!(
                "host returned unaligned address {:#x}",
                addr
            )));
        }
        let end = addr
            .checked_add(allocated_length)
            .ok_or_else(|| Error::Transport("host region wraps the address space".to_string()))?;

        if let Some((_, id)) = self.by_base.range(..end).next_back() {
            let neighbour = table.mapping(*id)?;
            if neighbour.end() > addr {
                return Err(Error::Transport(format!(
                    "host placed {:#x}+{} over live mapping {:#x}",
                    addr,
                    allocated_length,
                    neighbour.base()
                )));
            }
        }
        Ok(())
    }

    /// Release whole mappings covering `[addr, addr + length)`.
    ///
    /// The range must start at a mapping base and end at a mapping end
    /// (either its requested or its reserved length), with no gaps between
    /// the mappings it spans. Dirty `Shared` mappings get one flush attempt
    /// each before removal.
    pub fn unmap<T: Transport + ?Sized>(
        &mut self,
        table: &mut HandleTable,
        transport: &mut T,
        addr: u32,
        length: u32,
    ) -> Result<UnmapReport> {
        if length == 0 {
            return Err(Error::InvalidArgument("zero-length unmap".to_string()));
        }
        let ids = self.whole_mappings(table, addr, length)?;

        let mut report = UnmapReport::default();
        for id in ids {
            let mapping = table.mapping_mut(id)?;
            let base = mapping.base();
            if mapping.writes_back() && mapping.is_dirty() {
                let window = 0..mapping.requested_length();
                if let Err(err) = flush(transport, mapping, window) {
                    warn!("Flush before unmap of {:#x} failed: {}", base, err);
                    report.flush_errors.push((base, err));
                }
            }
            let release = mapping.release_request();
            let region = base..mapping.end();

            table.release(id)?;
            self.by_base.remove(&base);

            if let Err(err) = transport.call(&release) {
                warn!("Host failed to release {:#x}: {}", base, err);
                report.release_errors.push((base, err.into()));
            }
            debug!("Unmapped {:#x}..{:#x}", region.start, region.end);
            report.unmapped.push(region);
        }

        Ok(report)
    }

    /// Flush dirty bytes of `Shared` file mappings in `[addr, addr + length)`.
    ///
    /// `Private` and anonymous mappings in range succeed without a host call.
    pub fn sync<T: Transport + ?Sized>(
        &mut self,
        table: &mut HandleTable,
        transport: &mut T,
        addr: u32,
        length: u32,
        flags: SyncFlags,
    ) -> Result<()> {
        if flags.contains(SyncFlags::ASYNC | SyncFlags::SYNC) {
            return Err(Error::InvalidArgument(
                "MS_ASYNC and MS_SYNC are mutually exclusive".to_string(),
            ));
        }
        let ids = self.covering_mappings(table, addr, length)?;
        let end = u64::from(addr) + u64::from(length);

        for id in ids {
            let mapping = table.mapping_mut(id)?;
            if !mapping.writes_back() {
                trace!("sync: {:#x} does not write back", mapping.base());
                continue;
            }
            let start = addr.max(mapping.base()) - mapping.base();
            let stop = (end.min(u64::from(mapping.end())) as u32) - mapping.base();
            let stop = stop.min(mapping.requested_length());
            flush(transport, mapping, start..stop)?;
        }
        Ok(())
    }

    /// Write application data into a mapping, recording it as dirty.
    pub fn write<M: LinearMemory + ?Sized>(
        &mut self,
        table: &mut HandleTable,
        memory: &mut M,
        addr: u32,
        data: &[u8],
    ) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let id = self.containing(table, addr, data.len())?;
        let mapping = table.mapping_mut(id)?;
        if !mapping.prot().contains(Prot::WRITE) {
            return Err(Error::InvalidArgument(format!(
                "mapping at {:#x} is not writable",
                mapping.base()
            )));
        }
        memory.write(addr, data)?;
        mapping.note_write(addr, data.len() as u32);
        Ok(())
    }

    /// Read mapped bytes.
    pub fn read<M: LinearMemory + ?Sized>(
        &self,
        table: &HandleTable,
        memory: &M,
        addr: u32,
        buf: &mut [u8],
    ) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        let id = self.containing(table, addr, buf.len())?;
        if !table.mapping(id)?.prot().contains(Prot::READ) {
            return Err(Error::InvalidArgument(format!(
                "mapping at {:#x} is not readable",
                addr
            )));
        }
        memory.read(addr, buf)
    }

    /// Record writes the program made to linear memory directly.
    pub fn mark_dirty(&mut self, table: &mut HandleTable, addr: u32, length: u32) -> Result<()> {
        if length == 0 {
            return Ok(());
        }
        let id = self.containing(table, addr, length as usize)?;
        table.mapping_mut(id)?.note_write(addr, length);
        Ok(())
    }

    /// The mapping containing `addr`, if any.
    pub fn mapping_at<'t>(
        &self,
        table: &'t HandleTable,
        addr: u32,
    ) -> Option<(HandleId, &'t Mapping)> {
        let (_, id) = self.by_base.range(..=addr).next_back()?;
        let mapping = table.mapping(*id).ok()?;
        mapping.contains(addr).then_some((*id, mapping))
    }

    /// Live mappings in address order.
    pub fn mappings<'t>(
        &'t self,
        table: &'t HandleTable,
    ) -> impl Iterator<Item = (HandleId, &'t Mapping)> + 't {
        self.by_base
            .values()
            .filter_map(move |id| table.mapping(*id).ok().map(|m| (*id, m)))
    }

    /// Base address of a mapping handle, for releasing by handle.
    pub(crate) fn base_of(&self, table: &HandleTable, id: HandleId) -> Result<(u32, u32)> {
        let mapping = table.mapping(id)?;
        Ok((mapping.base(), mapping.length()))
    }

    pub fn len(&self) -> usize {
        self.by_base.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_base.is_empty()
    }

    fn containing(&self, table: &HandleTable, addr: u32, len: usize) -> Result<HandleId> {
        let (id, mapping) = self
            .mapping_at(table, addr)
            .ok_or_else(|| Error::InvalidArgument(format!("no mapping at {:#x}", addr)))?;
        if u64::from(addr) + len as u64 > u64::from(mapping.end()) {
            return Err(Error::InvalidArgument(format!(
                "access {:#x}+{} crosses the end of mapping {:#x}",
                addr,
                len,
                mapping.base()
            )));
        }
        Ok(id)
    }

    fn whole_mappings(&self, table: &HandleTable, addr: u32, length: u32) -> Result<Vec<HandleId>> {
        let end = u64::from(addr) + u64::from(length);
        let mut cursor = u64::from(addr);
        let mut ids = Vec::new();

        loop {
            let id = u32::try_from(cursor)
                .ok()
                .and_then(|base| self.by_base.get(&base))
                .copied()
                .ok_or_else(|| {
                    Error::InvalidArgument(format!("no mapping begins at {:#x}", cursor))
                })?;
            let mapping = table.mapping(id)?;
            let requested_end = u64::from(mapping.base()) + u64::from(mapping.requested_length());
            let reserved_end = u64::from(mapping.end());

            if end < requested_end {
                return Err(Error::InvalidArgument(format!(
                    "range {:#x}+{} ends inside mapping {:#x}",
                    addr,
                    length,
                    mapping.base()
                )));
            }
            ids.push(id);
            if end <= reserved_end {
                return Ok(ids);
            }
            cursor = reserved_end;
        }
    }

    fn covering_mappings(
        &self,
        table: &HandleTable,
        addr: u32,
        length: u32,
    ) -> Result<Vec<HandleId>> {
        let end = u64::from(addr) + u64::from(length);
        let (first, mapping) = self
            .mapping_at(table, addr)
            .ok_or_else(|| Error::InvalidArgument(format!("no mapping at {:#x}", addr)))?;

        let mut ids = vec![first];
        let mut reach = u64::from(mapping.end());
        while reach < end {
            let id = u32::try_from(reach)
                .ok()
                .and_then(|base| self.by_base.get(&base))
                .copied()
                .ok_or_else(|| {
                    Error::InvalidArgument(format!("unmapped gap at {:#x}", reach))
                })?;
            reach = u64::from(table.mapping(id)?.end());
            ids.push(id);
        }
        Ok(ids)
    }
}

/// Write the dirty bytes of `mapping` inside `window` back to its file.
///
/// Issues at most one host call, covering the dirty extent. Dirty state is
/// cleared only when the host confirms.
fn flush<T: Transport + ?Sized>(
    transport: &mut T,
    mapping: &mut Mapping,
    window: Range<u32>,
) -> Result<bool> {
    let Some(extent) = mapping.dirty.extent_within(&window) else {
        return Ok(false);
    };
    let Backing::File { fd, offset } = mapping.backing else {
        return Ok(false);
    };
    let file_offset = offset.checked_add(extent.start).ok_or_else(|| {
        Error::InvalidArgument("backing offset exceeds 32 bits".to_string())
    })?;

    let request = Request::Sync {
        addr: mapping.base + extent.start,
        length: extent.end - extent.start,
        prot: mapping.prot.bits(),
        flags: mapping.flags.bits(),
        fd,
        offset: file_offset,
    };
    trace!(
        "flush {:#x}+{} -> fd {} @ {}",
        mapping.base + extent.start,
        extent.end - extent.start,
        fd,
        file_offset
    );

    match transport.call(&request)? {
        Response::Done => {}
        other => return Err(unexpected("sync", &other)),
    }
    mapping.dirty.clear_within(&extent);
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::errno;
    use crate::memory::VecMemory;
    use crate::testing::FakeTransport;
    use crate::transport::HostError;

    struct Fixture {
        table: HandleTable,
        manager: MappingManager,
        host: FakeTransport,
        memory: VecMemory,
    }

    impl Fixture {
        fn new() -> Self {
            let config = BridgeConfig::default();
            Self {
                table: HandleTable::new(config.max_handles),
                manager: MappingManager::new(&config),
                host: FakeTransport::new(),
                memory: VecMemory::new(0x100000),
            }
        }

        fn map(&mut self, length: u32, prot: Prot, flags: MapFlags, fd: i32, offset: u32) -> Result<Mapped> {
            self.manager
                .map(&mut self.table, &mut self.host, length, prot, flags, fd, offset)
        }

        fn map_shared_file(&mut self, length: u32) -> Mapped {
            self.map(length, Prot::READ | Prot::WRITE, MapFlags::SHARED, 3, 0)
                .unwrap()
        }

        fn write(&mut self, addr: u32, data: &[u8]) -> Result<()> {
            self.manager
                .write(&mut self.table, &mut self.memory, addr, data)
        }

        fn unmap(&mut self, addr: u32, length: u32) -> Result<UnmapReport> {
            self.manager
                .unmap(&mut self.table, &mut self.host, addr, length)
        }

        fn sync(&mut self, addr: u32, length: u32, flags: SyncFlags) -> Result<()> {
            self.manager
                .sync(&mut self.table, &mut self.host, addr, length, flags)
        }
    }

    #[test]
    fn dirty_ranges_merge_touching_writes() {
        let mut dirty = DirtyRanges::default();
        dirty.insert(10..20);
        dirty.insert(30..40);
        dirty.insert(20..30);
        assert_eq!(dirty.ranges(), &[10..40]);

        dirty.clear_within(&(15..25));
        assert_eq!(dirty.ranges(), &[10..15, 25..40]);
        assert_eq!(dirty.extent_within(&(0..100)), Some(10..40));
        assert_eq!(dirty.extent_within(&(16..24)), None);
        assert_eq!(dirty.bytes(), 20);
    }

    #[test]
    fn zero_length_is_rejected_without_host_call() {
        let mut fx = Fixture::new();
        let err = fx.map(0, Prot::READ, MapFlags::PRIVATE, 3, 0).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        assert!(fx.host.calls.is_empty());
    }

    #[test]
    fn unsupported_flag_combinations_are_rejected() {
        let mut fx = Fixture::new();
        let both = MapFlags::SHARED | MapFlags::PRIVATE;
        assert!(fx.map(4096, Prot::READ, both, 3, 0).is_err());
        assert!(fx
            .map(4096, Prot::READ, MapFlags::PRIVATE | MapFlags::FIXED, 3, 0)
            .is_err());
        assert!(fx
            .map(4096, Prot::READ | Prot::EXEC, MapFlags::PRIVATE, 3, 0)
            .is_err());
        assert!(fx.map(4096, Prot::READ, MapFlags::PRIVATE, -1, 0).is_err());
        assert!(fx.map(4096, Prot::READ, MapFlags::PRIVATE, 3, 100).is_err());
        assert!(fx.host.calls.is_empty());
    }

    #[test]
    fn anonymous_mapping_ignores_descriptor() {
        let mut fx = Fixture::new();
        let mapped = fx
            .map(100, Prot::READ, MapFlags::PRIVATE | MapFlags::ANONYMOUS, -1, 0)
            .unwrap();
        assert_eq!(mapped.allocated_length, 4096);
        assert!(matches!(
            fx.host.calls[0],
            Request::Map { fd: -1, offset: 0, .. }
        ));
    }

    #[test]
    fn host_out_of_memory_surfaces() {
        let mut fx = Fixture::new();
        fx.host
            .map_replies
            .push_back(Err(HostError::new(errno::ENOMEM, "exhausted")));
        let err = fx
            .map(4096, Prot::READ, MapFlags::PRIVATE, 3, 0)
            .unwrap_err();
        assert_eq!(err, Error::OutOfMemory);
        assert!(fx.manager.is_empty());
    }

    #[test]
    fn overlapping_host_answer_is_handed_back() {
        let mut fx = Fixture::new();
        let first = fx.map_shared_file(8192);
        fx.host.map_replies.push_back(Ok(Response::Mapped {
            addr: first.addr + 4096,
            allocated_length: 4096,
        }));

        let err = fx
            .map(4096, Prot::READ, MapFlags::PRIVATE, 3, 0)
            .unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
        assert_eq!(fx.manager.len(), 1);
        assert_eq!(fx.host.calls_of("unmap").len(), 1);
    }

    #[test]
    fn mappings_never_overlap_under_churn() {
        let mut fx = Fixture::new();
        let mut live: Vec<Mapped> = Vec::new();
        let mut seed = 0x2545_f491u32;

        for _ in 0..200 {
            seed = seed.wrapping_mul(1_103_515_245).wrapping_add(12_345);
            if live.is_empty() || seed % 3 != 0 {
                let length = 1 + (seed >> 8) % 20_000;
                live.push(
                    fx.map(length, Prot::READ, MapFlags::PRIVATE | MapFlags::ANONYMOUS, -1, 0)
                        .unwrap(),
                );
            } else {
                let victim = live.remove((seed as usize >> 4) % live.len());
                fx.unmap(victim.addr, victim.allocated_length).unwrap();
            }

            let regions: Vec<(u32, u32)> = fx
                .manager
                .mappings(&fx.table)
                .map(|(_, m)| (m.base(), m.end()))
                .collect();
            for pair in regions.windows(2) {
                assert!(pair[0].1 <= pair[1].0, "overlap: {:?}", pair);
            }
            assert_eq!(regions.len(), live.len());
        }
    }

    #[test]
    fn partial_unmap_is_rejected() {
        let mut fx = Fixture::new();
        let mapped = fx.map_shared_file(4096);

        let err = fx.unmap(mapped.addr + 10, 100).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        let err = fx.unmap(mapped.addr, 100).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        assert_eq!(fx.manager.len(), 1);
    }

    #[test]
    fn unmap_spans_adjacent_whole_mappings() {
        let mut fx = Fixture::new();
        let first = fx.map_shared_file(4096);
        let second = fx.map_shared_file(4096);
        assert_eq!(second.addr, first.addr + 4096);

        let err = fx.unmap(first.addr, 6000).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));

        let report = fx.unmap(first.addr, 8192).unwrap();
        assert_eq!(report.unmapped.len(), 2);
        assert!(fx.manager.is_empty());
        assert!(fx.table.is_empty());
    }

    #[test]
    fn unmap_accepts_requested_length() {
        let mut fx = Fixture::new();
        let mapped = fx.map(5000, Prot::READ, MapFlags::PRIVATE, 3, 0).unwrap();
        assert_eq!(mapped.allocated_length, 8192);
        fx.unmap(mapped.addr, 5000).unwrap();
        assert!(fx.manager.is_empty());
    }

    #[test]
    fn dirty_shared_unmap_flushes_exactly_once() {
        let mut fx = Fixture::new();
        let mapped = fx.map_shared_file(8192);
        fx.write(mapped.addr + 16, b"head").unwrap();
        fx.write(mapped.addr + 5000, b"tail").unwrap();

        let report = fx.unmap(mapped.addr, 8192).unwrap();
        assert!(report.is_clean());

        let ops: Vec<&str> = fx.host.calls.iter().map(|r| r.op_name()).collect();
        assert_eq!(ops, vec!["map", "sync", "unmap"]);
        assert!(matches!(
            fx.host.calls[1],
            Request::Sync { offset: 16, length: 4988, fd: 3, .. }
        ));
    }

    #[test]
    fn clean_or_private_unmap_does_not_flush() {
        let mut fx = Fixture::new();
        let clean = fx.map_shared_file(4096);
        let private = fx
            .map(4096, Prot::READ | Prot::WRITE, MapFlags::PRIVATE, 3, 0)
            .unwrap();
        fx.write(private.addr, b"scratch").unwrap();

        fx.unmap(clean.addr, 4096).unwrap();
        fx.unmap(private.addr, 4096).unwrap();
        assert!(fx.host.calls_of("sync").is_empty());
    }

    #[test]
    fn failed_flush_does_not_block_removal() {
        let mut fx = Fixture::new();
        let mapped = fx.map_shared_file(4096);
        fx.write(mapped.addr, b"lost?").unwrap();
        fx.host
            .sync_failures
            .push_back(HostError::new(errno::EIO, "disk unplugged"));

        let report = fx.unmap(mapped.addr, 4096).unwrap();
        assert_eq!(report.flush_errors.len(), 1);
        assert_eq!(report.flush_errors[0].0, mapped.addr);
        assert!(fx.manager.is_empty());
        assert_eq!(fx.host.calls_of("unmap").len(), 1);
    }

    #[test]
    fn sync_flushes_written_bytes_and_clears_dirty() {
        let mut fx = Fixture::new();
        let mapped = fx.map_shared_file(4096);
        fx.write(mapped.addr, b"0123456789").unwrap();

        fx.sync(mapped.addr, 4096, SyncFlags::empty()).unwrap();
        let syncs = fx.host.calls_of("sync");
        assert_eq!(syncs.len(), 1);
        assert_eq!(
            syncs[0],
            &Request::Sync {
                addr: mapped.addr,
                length: 10,
                prot: (Prot::READ | Prot::WRITE).bits(),
                flags: MapFlags::SHARED.bits(),
                fd: 3,
                offset: 0,
            }
        );

        let (_, mapping) = fx.manager.mapping_at(&fx.table, mapped.addr).unwrap();
        assert!(!mapping.is_dirty());

        fx.sync(mapped.addr, 4096, SyncFlags::empty()).unwrap();
        assert_eq!(fx.host.calls_of("sync").len(), 1);
    }

    #[test]
    fn sync_translates_backing_offset() {
        let mut fx = Fixture::new();
        let mapped = fx
            .map(4096, Prot::READ | Prot::WRITE, MapFlags::SHARED, 5, 8192)
            .unwrap();
        fx.write(mapped.addr + 100, b"xy").unwrap();
        fx.sync(mapped.addr, 4096, SyncFlags::SYNC).unwrap();
        assert!(matches!(
            fx.host.calls_of("sync")[0],
            Request::Sync { fd: 5, offset: 8292, length: 2, .. }
        ));
    }

    #[test]
    fn failed_sync_keeps_bytes_dirty() {
        let mut fx = Fixture::new();
        let mapped = fx.map_shared_file(4096);
        fx.write(mapped.addr, b"abc").unwrap();
        fx.host
            .sync_failures
            .push_back(HostError::new(errno::EIO, "busy disk"));

        assert!(fx.sync(mapped.addr, 4096, SyncFlags::empty()).is_err());
        let (_, mapping) = fx.manager.mapping_at(&fx.table, mapped.addr).unwrap();
        assert!(mapping.is_dirty());
    }

    #[test]
    fn private_sync_is_a_successful_no_op() {
        let mut fx = Fixture::new();
        let mapped = fx
            .map(4096, Prot::READ | Prot::WRITE, MapFlags::PRIVATE, 3, 0)
            .unwrap();
        fx.write(mapped.addr, b"cow").unwrap();
        fx.sync(mapped.addr, 4096, SyncFlags::empty()).unwrap();
        assert!(fx.host.calls_of("sync").is_empty());
    }

    #[test]
    fn sync_rejects_bad_ranges_and_flags() {
        let mut fx = Fixture::new();
        let mapped = fx.map_shared_file(4096);
        assert!(matches!(
            fx.sync(mapped.addr, 4096, SyncFlags::ASYNC | SyncFlags::SYNC),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            fx.sync(mapped.addr, 8192, SyncFlags::empty()),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            fx.sync(mapped.addr + 0x10000, 16, SyncFlags::empty()),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn writes_respect_protection_and_bounds() {
        let mut fx = Fixture::new();
        let ro = fx.map(4096, Prot::READ, MapFlags::SHARED, 3, 0).unwrap();
        assert!(fx.write(ro.addr, b"nope").is_err());

        let rw = fx.map_shared_file(4096);
        assert!(fx.write(rw.addr + 4090, b"too long").is_err());

        fx.write(rw.addr + 8, b"ok").unwrap();
        let mut buf = [0u8; 2];
        fx.manager
            .read(&fx.table, &fx.memory, rw.addr + 8, &mut buf)
            .unwrap();
        assert_eq!(&buf, b"ok");
    }

    #[test]
    fn writes_past_requested_length_stay_out_of_the_file() {
        let mut fx = Fixture::new();
        let mapped = fx
            .map(5000, Prot::READ | Prot::WRITE, MapFlags::SHARED, 3, 0)
            .unwrap();
        assert_eq!(mapped.allocated_length, 8192);

        fx.write(mapped.addr + 4995, b"0123456789").unwrap();
        fx.write(mapped.addr + 6000, b"slack").unwrap();
        let (_, mapping) = fx.manager.mapping_at(&fx.table, mapped.addr).unwrap();
        assert_eq!(mapping.dirty().ranges(), &[4995..5000]);

        fx.unmap(mapped.addr, 5000).unwrap();
        let syncs = fx.host.calls_of("sync");
        assert_eq!(syncs.len(), 1);
        assert!(matches!(
            syncs[0],
            Request::Sync { offset: 4995, length: 5, .. }
        ));
    }

    #[test]
    fn slack_only_writes_never_flush() {
        let mut fx = Fixture::new();
        let mapped = fx
            .map(100, Prot::READ | Prot::WRITE, MapFlags::SHARED, 3, 0)
            .unwrap();
        fx.write(mapped.addr + 200, b"beyond").unwrap();
        fx.sync(mapped.addr, 4096, SyncFlags::SYNC).unwrap();
        fx.unmap(mapped.addr, 4096).unwrap();
        assert!(fx.host.calls_of("sync").is_empty());
    }

    #[test]
    fn mark_dirty_tracks_direct_writes() {
        let mut fx = Fixture::new();
        let mapped = fx.map_shared_file(4096);
        fx.manager
            .mark_dirty(&mut fx.table, mapped.addr + 64, 32)
            .unwrap();
        fx.sync(mapped.addr, 4096, SyncFlags::empty()).unwrap();
        assert!(matches!(
            fx.host.calls_of("sync")[0],
            Request::Sync { offset: 64, length: 32, .. }
        ));
    }
}
