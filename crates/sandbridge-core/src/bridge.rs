//! The sandboxed-side façade tying the table, managers and transport together.

use crate::calendar::{TimezoneInfo, Tm};
use crate::config::BridgeConfig;
use crate::handle::{HandleId, HandleKind, HandleTable};
use crate::loader::{
    LoadState, Loader, LookupStatus, LookupToken, OnLoadError, OnLoaded, SymbolResolution,
};
use crate::mapping::{MapFlags, Mapped, Mapping, MappingManager, Prot, SyncFlags, UnmapReport};
use crate::memory::{checked_range, LinearMemory};
use crate::transport::{unexpected, Completion, Request, Response, Transport};
use crate::{Error, Result};
use log::{debug, warn};

/// Owns every piece of bridge state for one sandbox.
///
/// All operations run on the caller's thread. Host completions are only
/// observed when the embedder calls [`pump`](Bridge::pump) or
/// [`deliver`](Bridge::deliver).
pub struct Bridge<T: Transport, M: LinearMemory> {
    config: BridgeConfig,
    table: HandleTable,
    mappings: MappingManager,
    loader: Loader,
    transport: T,
    memory: M,
}

impl<T: Transport, M: LinearMemory> Bridge<T, M> {
    pub fn new(config: BridgeConfig, transport: T, memory: M) -> Result<Self> {
        config.validate()?;
        debug!(
            "Bridge ready: page_size={} max_handles={} allow_exec={}",
            config.page_size, config.max_handles, config.allow_exec
        );
        Ok(Self {
            table: HandleTable::new(config.max_handles),
            mappings: MappingManager::new(&config),
            loader: Loader::new(),
            config,
            transport,
            memory,
        })
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn table(&self) -> &HandleTable {
        &self.table
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn memory(&self) -> &M {
        &self.memory
    }

    pub fn memory_mut(&mut self) -> &mut M {
        &mut self.memory
    }

    // Mappings

    pub fn map(
        &mut self,
        length: u32,
        prot: Prot,
        flags: MapFlags,
        fd: i32,
        offset: u32,
    ) -> Result<Mapped> {
        self.mappings.map(
            &mut self.table,
            &mut self.transport,
            length,
            prot,
            flags,
            fd,
            offset,
        )
    }

    pub fn unmap(&mut self, addr: u32, length: u32) -> Result<UnmapReport> {
        self.mappings
            .unmap(&mut self.table, &mut self.transport, addr, length)
    }

    pub fn sync(&mut self, addr: u32, length: u32, flags: SyncFlags) -> Result<()> {
        self.mappings
            .sync(&mut self.table, &mut self.transport, addr, length, flags)
    }

    pub fn write(&mut self, addr: u32, data: &[u8]) -> Result<()> {
        self.mappings
            .write(&mut self.table, &mut self.memory, addr, data)
    }

    pub fn read(&self, addr: u32, buf: &mut [u8]) -> Result<()> {
        self.mappings.read(&self.table, &self.memory, addr, buf)
    }

    pub fn mark_dirty(&mut self, addr: u32, length: u32) -> Result<()> {
        self.mappings.mark_dirty(&mut self.table, addr, length)
    }

    pub fn mapping_at(&self, addr: u32) -> Option<(HandleId, &Mapping)> {
        self.mappings.mapping_at(&self.table, addr)
    }

    pub fn mappings(&self) -> impl Iterator<Item = (HandleId, &Mapping)> + '_ {
        self.mappings.mappings(&self.table)
    }

    // Modules

    pub fn load(&mut self, identity: &str) -> Result<HandleId> {
        self.loader
            .load(&mut self.table, &mut self.transport, identity)
    }

    pub fn load_with(
        &mut self,
        identity: &str,
        on_success: OnLoaded,
        on_error: OnLoadError,
    ) -> Result<HandleId> {
        self.loader.load_with(
            &mut self.table,
            &mut self.transport,
            identity,
            on_success,
            on_error,
        )
    }

    pub fn load_sync(&mut self, identity: &str) -> Result<HandleId> {
        self.loader
            .load_sync(&mut self.table, &mut self.transport, identity)
    }

    pub fn resolve_symbol(&mut self, handle: HandleId, name: &str) -> Result<SymbolResolution> {
        self.loader
            .resolve_symbol(&mut self.table, &mut self.transport, handle, name, None)
    }

    pub fn resolve_symbol_in_slot(
        &mut self,
        handle: HandleId,
        name: &str,
        slot: u32,
    ) -> Result<SymbolResolution> {
        self.loader.resolve_symbol(
            &mut self.table,
            &mut self.transport,
            handle,
            name,
            Some(slot),
        )
    }

    pub fn resolve_catchup(&mut self, handle: HandleId, index: u32) -> Result<u32> {
        self.loader
            .resolve_catchup(&mut self.table, &mut self.transport, handle, index)
    }

    pub fn poll_lookup(&mut self, token: LookupToken) -> Result<LookupStatus> {
        self.loader.poll_lookup(token)
    }

    pub fn unload(&mut self, handle: HandleId) -> Result<()> {
        self.loader
            .unload(&mut self.table, &mut self.transport, handle)
    }

    pub fn module_state(&self, handle: HandleId) -> Result<LoadState> {
        Ok(self.table.module(handle)?.state())
    }

    pub fn failure_reason(&self, handle: HandleId) -> Result<Option<&str>> {
        Ok(self.table.module(handle)?.failure_reason())
    }

    pub fn handle_for(&self, identity: &str) -> Option<HandleId> {
        self.loader.handle_for(identity)
    }

    /// Release any handle, whatever it stands for.
    pub fn release(&mut self, handle: HandleId) -> Result<()> {
        match self.table.lookup(handle)?.kind() {
            HandleKind::Module => self.unload(handle),
            HandleKind::Mapping => {
                let (base, length) = self.mappings.base_of(&self.table, handle)?;
                self.unmap(base, length).map(|_| ())
            }
        }
    }

    // Completions

    /// Deliver every completion the host has produced so far.
    ///
    /// Completions for unknown requests are logged and skipped. Any other
    /// failure is returned after the remaining completions were delivered.
    /// Returns the number of completions dispatched.
    pub fn pump(&mut self) -> Result<usize> {
        let mut delivered = 0;
        let mut first_error = None;
        for completion in self.transport.drain_completions() {
            match self.deliver(completion) {
                Ok(()) => delivered += 1,
                Err(Error::UnknownRequest(id)) => {
                    warn!("Ignoring completion for request {}", id)
                }
                Err(err) => {
                    warn!("Completion failed: {}", err);
                    first_error.get_or_insert(err);
                }
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(delivered),
        }
    }

    pub fn deliver(&mut self, completion: Completion) -> Result<()> {
        self.loader
            .deliver(&mut self.table, &mut self.transport, completion)
    }

    // Synchronous helpers

    /// Have the host copy `length` bytes from `src` to `dest`.
    pub fn memcpy_big(&mut self, dest: u32, src: u32, length: u32) -> Result<()> {
        let size = self.memory.size();
        checked_range(size, src, length as usize)?;
        checked_range(size, dest, length as usize)?;
        self.expect_done(Request::MemcpyBig { dest, src, length })
    }

    /// Tell the host linear memory `memory_index` has grown.
    pub fn notify_memory_growth(&mut self, memory_index: u32) -> Result<()> {
        self.expect_done(Request::NotifyMemoryGrowth { memory_index })
    }

    /// UTC calendar time to epoch seconds, with the normalised fields.
    pub fn timegm(&mut self, tm: &Tm) -> Result<(i32, Tm)> {
        self.expect_time("timegm", Request::Timegm { tm: *tm })
    }

    /// Local calendar time to epoch seconds, with the normalised fields.
    pub fn mktime(&mut self, tm: &Tm) -> Result<(i32, Tm)> {
        self.expect_time("mktime", Request::Mktime { tm: *tm })
    }

    pub fn gmtime(&mut self, time: i32) -> Result<Tm> {
        self.expect_calendar("gmtime", Request::Gmtime { time })
    }

    pub fn localtime(&mut self, time: i32) -> Result<Tm> {
        self.expect_calendar("localtime", Request::Localtime { time })
    }

    pub fn tzset(&mut self) -> Result<TimezoneInfo> {
        match self.transport.call(&Request::Tzset)? {
            Response::Timezone { info } => Ok(info),
            other => Err(unexpected("tzset", &other)),
        }
    }

    pub fn progname(&mut self) -> Result<String> {
        match self.transport.call(&Request::GetProgname)? {
            Response::Text { value } => Ok(value),
            other => Err(unexpected("get_progname", &other)),
        }
    }

    pub fn now_is_monotonic(&mut self) -> Result<bool> {
        match self.transport.call(&Request::GetNowIsMonotonic)? {
            Response::Flag { value } => Ok(value),
            other => Err(unexpected("get_now_is_monotonic", &other)),
        }
    }

    fn expect_done(&mut self, request: Request) -> Result<()> {
        match self.transport.call(&request)? {
            Response::Done => Ok(()),
            other => Err(unexpected(request.op_name(), &other)),
        }
    }

    fn expect_time(&mut self, op: &str, request: Request) -> Result<(i32, Tm)> {
        match self.transport.call(&request)? {
            Response::Time { time, tm } => Ok((time, tm)),
            other => Err(unexpected(op, &other)),
        }
    }

    fn expect_calendar(&mut self, op: &str, request: Request) -> Result<Tm> {
        match self.transport.call(&request)? {
            Response::Calendar { tm } => Ok(tm),
            other => Err(unexpected(op, &other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::ModuleHandle;
    use crate::memory::VecMemory;
    use crate::testing::FakeTransport;

    fn bridge() -> Bridge<FakeTransport, VecMemory> {
        Bridge::new(
            BridgeConfig::default(),
            FakeTransport::new().with_symbol("entry", 0x20, 3),
            VecMemory::new(0x100000),
        )
        .unwrap()
    }

    #[test]
    fn invalid_config_is_rejected() {
        let config = BridgeConfig {
            page_size: 1000,
            ..BridgeConfig::default()
        };
        let result = Bridge::new(config, FakeTransport::new(), VecMemory::new(4096));
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn release_dispatches_on_kind() {
        let mut bridge = bridge();
        let mapped = bridge
            .map(4096, Prot::READ, MapFlags::PRIVATE | MapFlags::ANONYMOUS, -1, 0)
            .unwrap();
        let module = bridge.load_sync("libentry").unwrap();
        assert_eq!(bridge.table().len(), 2);

        bridge.release(mapped.handle).unwrap();
        bridge.release(module).unwrap();
        assert!(bridge.table().is_empty());
        assert_eq!(bridge.transport().calls_of("unmap").len(), 1);
        assert_eq!(bridge.transport().calls_of("dlclose").len(), 1);
    }

    #[test]
    fn pump_skips_unknown_completions() {
        let mut bridge = bridge();
        let handle = bridge.load("libentry").unwrap();
        let id = bridge.transport().async_of("dlopen")[0];
        bridge.transport_mut().complete(id);
        bridge.transport_mut().complete(id);

        assert_eq!(bridge.pump().unwrap(), 1);
        assert_eq!(bridge.module_state(handle).unwrap(), LoadState::Loaded);
    }

    #[test]
    fn pump_delivers_the_rest_after_a_failed_completion() {
        let mut bridge = bridge();
        let stale = bridge.load("libstale").unwrap();
        let fresh = bridge.load("libfresh").unwrap();
        *bridge.table.module_mut(stale).unwrap() = ModuleHandle::new("libstale");
        for id in bridge.transport().async_of("dlopen") {
            bridge.transport_mut().complete(id);
        }

        assert!(matches!(bridge.pump(), Err(Error::InvalidHandle)));
        assert_eq!(bridge.module_state(fresh).unwrap(), LoadState::Loaded);
        assert_eq!(bridge.pump().unwrap(), 0);
    }

    #[test]
    fn slot_is_forwarded_to_host() {
        let mut bridge = bridge();
        let handle = bridge.load_sync("libentry").unwrap();
        bridge.resolve_symbol_in_slot(handle, "entry", 9).unwrap();

        let calls = bridge.transport().calls_of("dlsym");
        assert!(matches!(calls[0], Request::Dlsym { slot: Some(9), .. }));
    }

    #[test]
    fn memcpy_big_checks_both_ranges() {
        let mut bridge = bridge();
        assert!(matches!(
            bridge.memcpy_big(0x10, 0xFFFF0, 0x100),
            Err(Error::InvalidArgument(_))
        ));
        assert!(bridge.transport().calls_of("memcpy_big").is_empty());

        bridge.memcpy_big(0x10, 0x1000, 0x100).unwrap();
        assert_eq!(bridge.transport().calls_of("memcpy_big").len(), 1);
    }

    #[test]
    fn helper_with_wrong_reply_shape_is_transport_error() {
        let mut bridge = bridge();
        assert!(matches!(bridge.progname(), Err(Error::Transport(_))));
    }
}
