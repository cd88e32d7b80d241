//! Host-side execution of bridge requests.

use crate::clock;
use crate::config::HostConfig;
use crate::fds::FdTable;
use crate::memory::HostMemory;
use crate::modules::ModuleRegistry;
use crate::space::AddressSpace;
use log::{debug, trace, warn};
use sandbridge_core::{errno, Error as CoreError, HostError, MapFlags, Request, Response};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use wasmtime::Engine;

/// Per-operation call counts and byte totals.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HostStats {
    /// Synchronous requests by operation name.
    pub calls: BTreeMap<String, u64>,
    /// Asynchronous requests by operation name.
    pub async_calls: BTreeMap<String, u64>,
    /// Bytes written back to backing files.
    pub bytes_flushed: u64,
    /// Bytes read from backing files into new mappings.
    pub bytes_populated: u64,
    /// Memory growth notifications received.
    pub growth_notifications: u64,
}

impl HostStats {
    pub fn count(&self, op: &str) -> u64 {
        self.calls.get(op).copied().unwrap_or(0)
    }

    pub fn async_count(&self, op: &str) -> u64 {
        self.async_calls.get(op).copied().unwrap_or(0)
    }
}

/// What the host remembers about a region it handed out.
#[derive(Debug, Clone, Copy)]
struct Region {
    reserved: u32,
    prot: u32,
    flags: u32,
    fd: i32,
    offset: u32,
}

fn core_err(err: CoreError) -> HostError {
    HostError::new(err.errno(), err.to_string())
}

fn io_err(fd: i32, err: std::io::Error) -> HostError {
    let code = if err.kind() == std::io::ErrorKind::NotFound {
        errno::EBADF
    } else {
        errno::EIO
    };
    HostError::new(code, format!("fd {}: {}", fd, err))
}

/// Everything the host knows, independent of which memory it is serving.
pub struct HostServices {
    config: HostConfig,
    space: AddressSpace,
    regions: HashMap<u32, Region>,
    fds: FdTable,
    modules: ModuleRegistry,
    stats: HostStats,
}

impl HostServices {
    pub fn new(config: HostConfig, engine: Engine) -> Self {
        Self {
            space: AddressSpace::new(config.heap_base, config.memory_limit, config.page_size),
            regions: HashMap::new(),
            fds: FdTable::new(),
            modules: ModuleRegistry::new(engine, config.module_search_path.clone()),
            stats: HostStats::default(),
            config,
        }
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn fds(&mut self) -> &mut FdTable {
        &mut self.fds
    }

    pub fn modules(&mut self) -> &mut ModuleRegistry {
        &mut self.modules
    }

    pub fn stats(&self) -> &HostStats {
        &self.stats
    }

    pub fn space(&self) -> &AddressSpace {
        &self.space
    }

    pub(crate) fn note_async(&mut self, request: &Request) {
        *self
            .stats
            .async_calls
            .entry(request.op_name().to_string())
            .or_default() += 1;
    }

    pub(crate) fn note_call(&mut self, request: &Request) {
        *self
            .stats
            .calls
            .entry(request.op_name().to_string())
            .or_default() += 1;
    }

    /// Count and execute one synchronous request.
    pub fn call(
        &mut self,
        memory: &mut dyn HostMemory,
        request: &Request,
    ) -> Result<Response, HostError> {
        self.note_call(request);
        self.handle(memory, request)
    }

    /// Execute one request against `memory`.
    pub fn handle(
        &mut self,
        memory: &mut dyn HostMemory,
        request: &Request,
    ) -> Result<Response, HostError> {
        trace!("host <- {:?}", request);

        match request {
            Request::Map {
                length,
                prot,
                flags,
                fd,
                offset,
            } => self.map(memory, *length, *prot, *flags, *fd, *offset),
            Request::Unmap {
                addr,
                length,
                prot,
                flags,
                fd,
                offset,
            } => {
                self.check_tuple("munmap", *addr, *prot, *flags, *fd, *offset);
                self.unmap(*addr, *length)
            }
            Request::Sync {
                addr,
                length,
                prot,
                flags,
                fd,
                offset,
            } => {
                self.check_tuple("msync", *addr, *prot, *flags, *fd, *offset);
                self.sync(memory, *addr, *length, *fd, *offset)
            }
            Request::Dlopen { handle, identity } => {
                self.modules.open(*handle, identity)?;
                Ok(Response::Loaded)
            }
            Request::Dlsym {
                handle,
                symbol,
                slot,
            } => {
                let (address, index) = self.modules.symbol(*handle, symbol, *slot)?;
                Ok(Response::Symbol { address, index })
            }
            Request::DlsymCatchup { handle, index } => Ok(Response::Address {
                address: self.modules.catchup(*handle, *index)?,
            }),
            Request::Dlclose { handle } => {
                self.modules.close(*handle)?;
                Ok(Response::Done)
            }
            Request::MemcpyBig { dest, src, length } => {
                let mut buf = vec![0u8; *length as usize];
                memory.read(*src, &mut buf).map_err(core_err)?;
                memory.write(*dest, &buf).map_err(core_err)?;
                Ok(Response::Done)
            }
            Request::NotifyMemoryGrowth { memory_index } => {
                self.stats.growth_notifications += 1;
                debug!(
                    "memory {} grew to {} bytes",
                    memory_index,
                    memory.size()
                );
                Ok(Response::Done)
            }
            Request::Timegm { tm } => {
                let (time, tm) = clock::timegm(tm)?;
                Ok(Response::Time { time, tm })
            }
            Request::Mktime { tm } => {
                let (time, tm) = clock::mktime(tm, self.config.timezone_offset_secs)?;
                Ok(Response::Time { time, tm })
            }
            Request::Gmtime { time } => Ok(Response::Calendar {
                tm: clock::gmtime(*time)?,
            }),
            Request::Localtime { time } => Ok(Response::Calendar {
                tm: clock::localtime(*time, self.config.timezone_offset_secs)?,
            }),
            Request::Tzset => Ok(Response::Timezone {
                info: clock::tzset(self.config.timezone_offset_secs),
            }),
            Request::GetProgname => Ok(Response::Text {
                value: self.config.program_name.clone(),
            }),
            Request::GetNowIsMonotonic => Ok(Response::Flag { value: true }),
        }
    }

    fn map(
        &mut self,
        memory: &mut dyn HostMemory,
        length: u32,
        prot: u32,
        flags: u32,
        fd: i32,
        offset: u32,
    ) -> Result<Response, HostError> {
        let anonymous = MapFlags::from_bits_truncate(flags).contains(MapFlags::ANONYMOUS);
        if !anonymous && !self.fds.contains(fd) {
            return Err(HostError::new(errno::EBADF, format!("fd {} is not open", fd)));
        }

        let (addr, reserved) = self.space.allocate(memory, length).map_err(core_err)?;
        // The tail of the last page shows the file too, zero only past EOF.
        let mut contents = vec![0u8; reserved as usize];
        let populated = if anonymous {
            Ok(0)
        } else {
            self.fds
                .read_at(fd, u64::from(offset), &mut contents)
                .map_err(|e| io_err(fd, e))
        };
        let populated = populated.and_then(|read| {
            memory.write(addr, &contents).map_err(core_err)?;
            Ok(read)
        });
        let read = match populated {
            Ok(read) => read,
            Err(err) => {
                self.space.free(addr, reserved).map_err(core_err)?;
                return Err(err);
            }
        };
        self.stats.bytes_populated += read as u64;

        self.regions.insert(
            addr,
            Region {
                reserved,
                prot,
                flags,
                fd,
                offset,
            },
        );
        debug!("mmap {:#x}+{:#x} (fd {}, offset {})", addr, reserved, fd, offset);
        Ok(Response::Mapped {
            addr,
            allocated_length: reserved,
        })
    }

    fn unmap(&mut self, addr: u32, length: u32) -> Result<Response, HostError> {
        let region = self.regions.remove(&addr).ok_or_else(|| {
            HostError::new(errno::EINVAL, format!("{:#x} was not handed out", addr))
        })?;
        if length > region.reserved {
            warn!(
                "munmap {:#x}: length {:#x} exceeds reservation {:#x}",
                addr, length, region.reserved
            );
        }
        self.space.free(addr, region.reserved).map_err(core_err)?;
        debug!("munmap {:#x}+{:#x}", addr, region.reserved);
        Ok(Response::Done)
    }

    fn sync(
        &mut self,
        memory: &mut dyn HostMemory,
        addr: u32,
        length: u32,
        fd: i32,
        offset: u32,
    ) -> Result<Response, HostError> {
        let not_mapped = || {
            HostError::new(
                errno::EINVAL,
                format!("{:#x}+{:#x} is not mapped", addr, length),
            )
        };
        let end = addr.checked_add(length.max(1)).ok_or_else(not_mapped)?;
        let start = addr - addr % self.config.page_size;
        if !self.space.is_reserved(start, end - start) {
            return Err(not_mapped());
        }
        let mut data = vec![0u8; length as usize];
        memory.read(addr, &mut data).map_err(core_err)?;
        self.fds
            .write_at(fd, u64::from(offset), &data)
            .map_err(|e| io_err(fd, e))?;
        self.stats.bytes_flushed += u64::from(length);
        debug!("msync {:#x}+{:#x} -> fd {} @ {}", addr, length, fd, offset);
        Ok(Response::Done)
    }

    /// Compare a release/flush tuple against what the region was mapped with.
    ///
    /// Mismatches are logged, never enforced.
    fn check_tuple(&self, op: &str, addr: u32, prot: u32, flags: u32, fd: i32, offset: u32) {
        let Some((base, region)) = self
            .regions
            .iter()
            .find(|(base, region)| addr >= **base && addr - **base < region.reserved)
        else {
            return;
        };
        let expected_offset = region.offset.wrapping_add(addr - base);
        if region.prot != prot
            || region.flags != flags
            || region.fd != fd
            || (region.fd >= 0 && expected_offset != offset)
        {
            warn!(
                "{} {:#x}: tuple (prot {}, flags {:#x}, fd {}, offset {}) differs from mapping",
                op, addr, prot, flags, fd, offset
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::SharedMemory;
    use sandbridge_core::{LinearMemory, Prot, Result as CoreResult};
    use tempfile::NamedTempFile;

    /// Memory that can grow but refuses every write.
    struct ReadOnlyMemory(SharedMemory);

    impl LinearMemory for ReadOnlyMemory {
        fn size(&self) -> u32 {
            self.0.size()
        }

        fn read(&self, addr: u32, buf: &mut [u8]) -> CoreResult<()> {
            self.0.read(addr, buf)
        }

        fn write(&mut self, _addr: u32, _data: &[u8]) -> CoreResult<()> {
            Err(CoreError::InvalidArgument("read-only".to_string()))
        }
    }

    impl HostMemory for ReadOnlyMemory {
        fn grow_to(&mut self, size: u32) -> CoreResult<()> {
            self.0.grow_to(size)
        }
    }

    fn services() -> (HostServices, SharedMemory) {
        let config = HostConfig::default();
        let memory = SharedMemory::new(config.initial_memory, config.memory_limit);
        (HostServices::new(config, Engine::default()), memory)
    }

    fn map_request(length: u32, flags: MapFlags, fd: i32) -> Request {
        Request::Map {
            length,
            prot: (Prot::READ | Prot::WRITE).bits(),
            flags: flags.bits(),
            fd,
            offset: 0,
        }
    }

    fn sync_request(addr: u32, length: u32, fd: i32) -> Request {
        Request::Sync {
            addr,
            length,
            prot: (Prot::READ | Prot::WRITE).bits(),
            flags: MapFlags::SHARED.bits(),
            fd,
            offset: 0,
        }
    }

    #[test]
    fn tail_page_mirrors_file_contents() {
        let file = NamedTempFile::new().unwrap();
        std::fs::write(file.path(), vec![b'.'; 20_000]).unwrap();
        let (mut services, mut memory) = services();
        let fd = services.fds().open(file.path()).unwrap();

        let Response::Mapped { addr, allocated_length } = services
            .handle(&mut memory, &map_request(10_000, MapFlags::SHARED, fd))
            .unwrap()
        else {
            panic!("expected a mapping");
        };
        assert_eq!(allocated_length, 12_288);
        assert_eq!(memory.snapshot(addr + 12_284, 4).unwrap(), b"....");
        assert_eq!(services.stats().bytes_populated, 12_288);
    }

    #[test]
    fn sync_past_reservation_is_refused() {
        let file = NamedTempFile::new().unwrap();
        std::fs::write(file.path(), vec![b'.'; 4096]).unwrap();
        let (mut services, mut memory) = services();
        let fd = services.fds().open(file.path()).unwrap();

        let Response::Mapped { addr, .. } = services
            .handle(&mut memory, &map_request(4096, MapFlags::SHARED, fd))
            .unwrap()
        else {
            panic!("expected a mapping");
        };

        let err = services
            .handle(&mut memory, &sync_request(addr + 2048, 4096, fd))
            .unwrap_err();
        assert_eq!(err.errno, errno::EINVAL);
        let err = services
            .handle(&mut memory, &sync_request(u32::MAX - 1, 16, fd))
            .unwrap_err();
        assert_eq!(err.errno, errno::EINVAL);

        services
            .handle(&mut memory, &sync_request(addr + 2048, 2048, fd))
            .unwrap();
        assert_eq!(std::fs::read(file.path()).unwrap().len(), 4096);
    }

    #[test]
    fn failed_population_releases_reservation() {
        let (mut services, memory) = services();
        let mut refusing = ReadOnlyMemory(memory);
        let anon = MapFlags::PRIVATE | MapFlags::ANONYMOUS;

        assert!(services
            .handle(&mut refusing, &map_request(4096, anon, -1))
            .is_err());
        assert_eq!(services.space().used(), 0);
    }
}
