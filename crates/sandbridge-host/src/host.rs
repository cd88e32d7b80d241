//! In-process host environment implementing the bridge transport.

use crate::config::HostConfig;
use crate::memory::SharedMemory;
use crate::services::{HostServices, HostStats};
use crate::Result;
use log::debug;
use sandbridge_core::{errno, Completion, HostError, Request, RequestId, Response, Transport};
use std::path::Path;
use wasmtime::Engine;

/// Reference host for a bridge running in the same process.
///
/// Shares linear memory with the bridge through [`SharedMemory`]. With
/// `deferred_completions` set, asynchronous requests wait in a queue until
/// the test or embedder releases them, in any order.
pub struct ReferenceHost {
    services: HostServices,
    memory: SharedMemory,
    deferred: bool,
    pending: Vec<(RequestId, Request)>,
    ready: Vec<Completion>,
    fail_next_load: Option<String>,
    fail_next_sync: Option<HostError>,
}

impl ReferenceHost {
    pub fn new(config: HostConfig) -> Result<Self> {
        Self::with_engine(config, Engine::default())
    }

    pub fn with_engine(config: HostConfig, engine: Engine) -> Result<Self> {
        config.validate()?;
        let memory = SharedMemory::new(config.initial_memory, config.memory_limit);
        Ok(Self {
            deferred: config.deferred_completions,
            services: HostServices::new(config, engine),
            memory,
            pending: Vec::new(),
            ready: Vec::new(),
            fail_next_load: None,
            fail_next_sync: None,
        })
    }

    /// Handle onto the linear memory the bridge must use.
    pub fn memory(&self) -> SharedMemory {
        self.memory.clone()
    }

    pub fn services(&mut self) -> &mut HostServices {
        &mut self.services
    }

    pub fn stats(&self) -> &HostStats {
        self.services.stats()
    }

    /// Make `bytes` loadable under `identity`.
    pub fn register_module(&mut self, identity: &str, bytes: impl Into<Vec<u8>>) {
        self.services.modules().register(identity, bytes);
    }

    /// Open a backing file and return its descriptor.
    pub fn open_file(&mut self, path: &Path) -> Result<i32> {
        self.services.fds().open(path)
    }

    /// Fail the next module load with `reason`, however it was requested.
    pub fn fail_next_load(&mut self, reason: &str) {
        self.fail_next_load = Some(reason.to_string());
    }

    /// Fail the next `Sync` request with `err`.
    pub fn fail_next_sync(&mut self, err: HostError) {
        self.fail_next_sync = Some(err);
    }

    /// Ids of async requests still waiting to run.
    pub fn pending(&self) -> Vec<RequestId> {
        self.pending.iter().map(|(id, _)| *id).collect()
    }

    /// Run one queued request now. Returns false if `id` is not queued.
    pub fn complete(&mut self, id: RequestId) -> bool {
        let Some(at) = self.pending.iter().position(|(pid, _)| *pid == id) else {
            return false;
        };
        let (id, request) = self.pending.remove(at);
        let outcome = self.execute(&request);
        self.ready.push(Completion { id, outcome });
        true
    }

    /// Run every queued request, newest first.
    pub fn complete_all(&mut self) -> usize {
        let ids: Vec<RequestId> = self.pending.iter().rev().map(|(id, _)| *id).collect();
        ids.into_iter().filter(|id| self.complete(*id)).count()
    }

    fn execute(&mut self, request: &Request) -> std::result::Result<Response, HostError> {
        match request {
            Request::Dlopen { identity, .. } => {
                if let Some(reason) = self.fail_next_load.take() {
                    debug!("failing load of {} on request: {}", identity, reason);
                    return Err(HostError::new(errno::ENOEXEC, reason));
                }
            }
            Request::Sync { .. } => {
                if let Some(err) = self.fail_next_sync.take() {
                    return Err(err);
                }
            }
            _ => {}
        }
        self.services.handle(&mut self.memory, request)
    }
}

impl Transport for ReferenceHost {
    fn call(&mut self, request: &Request) -> std::result::Result<Response, HostError> {
        self.services.note_call(request);
        self.execute(request)
    }

    fn call_async(
        &mut self,
        id: RequestId,
        request: Request,
    ) -> std::result::Result<(), HostError> {
        self.services.note_async(&request);
        if self.deferred {
            self.pending.push((id, request));
        } else {
            let outcome = self.execute(&request);
            self.ready.push(Completion { id, outcome });
        }
        Ok(())
    }

    fn drain_completions(&mut self) -> Vec<Completion> {
        std::mem::take(&mut self.ready)
    }
}
