use sandbridge_core::{
    errno, Bridge, BridgeConfig, Completion, Error, HostError, LinearMemory, LoadState,
    LookupStatus, MapFlags, Prot, Request, RequestId, Response, SymbolResolution, SyncFlags,
    Transport,
};
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

/// Linear memory the test host can see too.
#[derive(Clone)]
struct SharedBytes(Rc<RefCell<Vec<u8>>>);

impl LinearMemory for SharedBytes {
    fn size(&self) -> u32 {
        self.0.borrow().len() as u32
    }

    fn read(&self, addr: u32, buf: &mut [u8]) -> sandbridge_core::Result<()> {
        let range = sandbridge_core::checked_range(self.size(), addr, buf.len())?;
        buf.copy_from_slice(&self.0.borrow()[range]);
        Ok(())
    }

    fn write(&mut self, addr: u32, data: &[u8]) -> sandbridge_core::Result<()> {
        let range = sandbridge_core::checked_range(self.size(), addr, data.len())?;
        self.0.borrow_mut()[range].copy_from_slice(data);
        Ok(())
    }
}

/// Minimal host: bump allocator, in-memory backing files, deferred loads.
struct TestHost {
    memory: SharedBytes,
    files: HashMap<i32, Vec<u8>>,
    next_addr: u32,
    requests: Vec<Request>,
    async_requests: Vec<(RequestId, Request)>,
    ready: Vec<Completion>,
    broken: Vec<String>,
}

impl TestHost {
    fn new(memory: SharedBytes) -> Self {
        Self {
            memory,
            files: HashMap::new(),
            next_addr: 0x10000,
            requests: Vec::new(),
            async_requests: Vec::new(),
            ready: Vec::new(),
            broken: Vec::new(),
        }
    }

    fn count(&self, op: &str) -> usize {
        self.requests.iter().filter(|r| r.op_name() == op).count()
    }

    fn async_count(&self, op: &str) -> usize {
        self.async_requests
            .iter()
            .filter(|(_, r)| r.op_name() == op)
            .count()
    }

    /// Finish every outstanding async request.
    fn finish_all(&mut self) {
        for (id, request) in std::mem::take(&mut self.async_requests) {
            let outcome = match &request {
                Request::Dlopen { identity, .. } if self.broken.contains(identity) => Err(
                    HostError::new(errno::ENOEXEC, format!("{}: bad magic", identity)),
                ),
                Request::Dlopen { .. } => Ok(Response::Loaded),
                Request::Dlsym { symbol, .. } => Self::symbol(symbol),
                other => panic!("unexpected async request {:?}", other),
            };
            self.ready.push(Completion { id, outcome });
        }
    }

    fn symbol(name: &str) -> Result<Response, HostError> {
        match name {
            "foo" => Ok(Response::Symbol {
                address: 0x100,
                index: 0,
            }),
            _ => Err(HostError::new(errno::ENOENT, name)),
        }
    }
}

impl Transport for TestHost {
    fn call(&mut self, request: &Request) -> Result<Response, HostError> {
        self.requests.push(request.clone());
        match request {
            Request::Map { length, .. } => {
                let addr = self.next_addr;
                let allocated_length = (length + 4095) & !4095;
                self.next_addr += allocated_length;
                Ok(Response::Mapped {
                    addr,
                    allocated_length,
                })
            }
            Request::Sync {
                addr,
                length,
                fd,
                offset,
                ..
            } => {
                let mut data = vec![0u8; *length as usize];
                self.memory
                    .read(*addr, &mut data)
                    .map_err(|e| HostError::new(errno::EINVAL, e.to_string()))?;
                let file = self.files.entry(*fd).or_default();
                let end = *offset as usize + data.len();
                if file.len() < end {
                    file.resize(end, 0);
                }
                file[*offset as usize..end].copy_from_slice(&data);
                Ok(Response::Done)
            }
            Request::Dlsym { symbol, .. } => Self::symbol(symbol),
            _ => Ok(Response::Done),
        }
    }

    fn call_async(&mut self, id: RequestId, request: Request) -> Result<(), HostError> {
        self.async_requests.push((id, request));
        Ok(())
    }

    fn drain_completions(&mut self) -> Vec<Completion> {
        std::mem::take(&mut self.ready)
    }
}

fn bridge() -> Bridge<TestHost, SharedBytes> {
    let memory = SharedBytes(Rc::new(RefCell::new(vec![0; 0x100000])));
    Bridge::new(
        BridgeConfig::default(),
        TestHost::new(memory.clone()),
        memory,
    )
    .unwrap()
}

#[test]
fn shared_write_reaches_backing_store_on_sync() {
    let mut bridge = bridge();
    let mapped = bridge
        .map(4096, Prot::READ | Prot::WRITE, MapFlags::SHARED, 3, 0)
        .unwrap();
    assert_eq!(mapped.allocated_length, 4096);

    bridge.write(mapped.addr, b"0123456789").unwrap();
    bridge
        .sync(mapped.addr, 4096, SyncFlags::empty())
        .unwrap();

    let file = &bridge.transport().files[&3];
    assert_eq!(&file[..10], b"0123456789");
    let (_, mapping) = bridge.mapping_at(mapped.addr).unwrap();
    assert!(!mapping.is_dirty());
}

#[test]
fn clean_sync_costs_no_host_call() {
    let mut bridge = bridge();
    let mapped = bridge
        .map(4096, Prot::READ | Prot::WRITE, MapFlags::SHARED, 3, 0)
        .unwrap();
    bridge.sync(mapped.addr, 4096, SyncFlags::SYNC).unwrap();
    assert_eq!(bridge.transport().count("sync"), 0);
}

#[test]
fn dirty_shared_unmap_flushes_once() {
    let mut bridge = bridge();
    let mapped = bridge
        .map(4096, Prot::READ | Prot::WRITE, MapFlags::SHARED, 5, 0)
        .unwrap();
    bridge.write(mapped.addr + 100, b"abc").unwrap();

    let report = bridge.unmap(mapped.addr, 4096).unwrap();
    assert!(report.is_clean());
    assert_eq!(bridge.transport().count("sync"), 1);
    assert_eq!(&bridge.transport().files[&5][100..103], b"abc");
    assert!(bridge.mapping_at(mapped.addr).is_none());
}

#[test]
fn unmap_inside_a_mapping_is_rejected() {
    let mut bridge = bridge();
    let mapped = bridge
        .map(4096, Prot::READ, MapFlags::PRIVATE | MapFlags::ANONYMOUS, -1, 0)
        .unwrap();
    assert!(matches!(
        bridge.unmap(mapped.addr + 10, 100),
        Err(Error::InvalidArgument(_))
    ));
    assert_eq!(bridge.mappings().count(), 1);
}

#[test]
fn mappings_never_overlap() {
    let mut bridge = bridge();
    let mut live = Vec::new();
    for round in 0..40u32 {
        let length = 1000 + round * 700;
        let mapped = bridge
            .map(
                length,
                Prot::READ | Prot::WRITE,
                MapFlags::PRIVATE | MapFlags::ANONYMOUS,
                -1,
                0,
            )
            .unwrap();
        live.push(mapped);
        if round % 3 == 0 {
            let victim = live.remove(0);
            bridge.unmap(victim.addr, victim.allocated_length).unwrap();
        }

        let ranges: Vec<_> = bridge
            .mappings()
            .map(|(_, m)| m.base()..m.end())
            .collect();
        for pair in ranges.windows(2) {
            assert!(pair[0].end <= pair[1].start);
        }
    }
}

#[test]
fn concurrent_loads_share_one_host_request() {
    let mut bridge = bridge();
    let first = bridge.load("libfoo").unwrap();
    let second = bridge.load("libfoo").unwrap();
    assert_eq!(first, second);
    assert_eq!(bridge.transport().async_count("dlopen"), 1);
}

#[test]
fn lookups_queued_during_load_complete_after_pump() {
    let mut bridge = bridge();
    let handle = bridge.load("libfoo").unwrap();
    let SymbolResolution::Pending(foo) = bridge.resolve_symbol(handle, "foo").unwrap() else {
        panic!("module is still loading");
    };
    let SymbolResolution::Pending(missing) = bridge.resolve_symbol(handle, "bar").unwrap() else {
        panic!("module is still loading");
    };

    bridge.transport_mut().finish_all();
    assert_eq!(bridge.pump().unwrap(), 1);
    assert_eq!(bridge.module_state(handle).unwrap(), LoadState::Loaded);

    bridge.transport_mut().finish_all();
    assert_eq!(bridge.pump().unwrap(), 2);

    let LookupStatus::Ready(symbol) = bridge.poll_lookup(foo).unwrap() else {
        panic!("foo should be resolved");
    };
    assert_eq!(symbol.address, 0x100);
    assert!(matches!(bridge.poll_lookup(missing), Err(Error::NotFound(_))));
}

#[test]
fn failed_module_fails_lookups_without_transport_traffic() {
    let mut bridge = bridge();
    bridge.transport_mut().broken.push("libbad".to_string());
    let handle = bridge.load("libbad").unwrap();
    bridge.transport_mut().finish_all();
    bridge.pump().unwrap();

    assert_eq!(bridge.module_state(handle).unwrap(), LoadState::Failed);
    assert_eq!(
        bridge.failure_reason(handle).unwrap(),
        Some("libbad: bad magic")
    );

    let sync_calls = bridge.transport().requests.len();
    let async_calls = bridge.transport().async_requests.len();
    assert!(matches!(
        bridge.resolve_symbol(handle, "foo"),
        Err(Error::LoadFailed(_))
    ));
    assert_eq!(bridge.transport().requests.len(), sync_calls);
    assert_eq!(bridge.transport().async_requests.len(), async_calls);
}

#[test]
fn release_waits_for_load_to_settle() {
    let mut bridge = bridge();
    let handle = bridge.load("libfoo").unwrap();
    assert!(matches!(bridge.release(handle), Err(Error::Busy)));

    bridge.transport_mut().finish_all();
    bridge.pump().unwrap();
    bridge.release(handle).unwrap();
    assert!(matches!(
        bridge.module_state(handle),
        Err(Error::InvalidHandle)
    ));
    assert!(matches!(bridge.release(handle), Err(Error::InvalidHandle)));
}

#[test]
fn release_after_failed_load_sends_no_close() {
    let mut bridge = bridge();
    bridge.transport_mut().broken.push("libbad".to_string());
    let handle = bridge.load("libbad").unwrap();
    bridge.resolve_symbol(handle, "foo").unwrap();
    assert!(matches!(bridge.release(handle), Err(Error::Busy)));

    bridge.transport_mut().finish_all();
    bridge.pump().unwrap();
    assert_eq!(bridge.module_state(handle).unwrap(), LoadState::Failed);

    bridge.release(handle).unwrap();
    assert_eq!(bridge.transport().count("dlclose"), 0);
    assert!(matches!(
        bridge.module_state(handle),
        Err(Error::InvalidHandle)
    ));
    assert!(bridge.handle_for("libbad").is_none());
}

#[test]
fn continuations_fire_once_on_failure() {
    let mut bridge = bridge();
    bridge.transport_mut().broken.push("libbad".to_string());
    let errors = Rc::new(RefCell::new(Vec::new()));
    let sink = errors.clone();

    bridge
        .load_with(
            "libbad",
            Box::new(|_| panic!("load must not succeed")),
            Box::new(move |_, reason| sink.borrow_mut().push(reason.to_string())),
        )
        .unwrap();
    bridge.transport_mut().finish_all();
    bridge.pump().unwrap();
    bridge.pump().unwrap();

    assert_eq!(*errors.borrow(), vec!["libbad: bad magic".to_string()]);
}
