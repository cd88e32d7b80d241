//! Asynchronous module loading and symbol resolution.
//!
//! A module handle moves `Unloaded -> Loading -> Loaded | Failed` once per
//! load attempt. The host performs the load and reports back through a
//! completion; the handle's state, not the order completions arrive in,
//! decides what a completion means.

use crate::handle::{HandleId, HandleTable, Record};
use crate::transport::{unexpected, Completion, Request, RequestId, Response, Transport};
use crate::{Error, Result};
use log::{debug, trace, warn};
use std::collections::HashMap;

/// Load state of a module handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadState {
    Unloaded,
    Loading,
    Loaded,
    Failed,
}

/// A resolved symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SymbolAddress {
    pub address: u32,
    /// Ordinal the host assigned, usable for catch-up resolution.
    pub index: u32,
}

/// Caller-side token for a lookup that could not complete synchronously.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LookupToken(u64);

/// Outcome of a symbol request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolResolution {
    Ready(SymbolAddress),
    Pending(LookupToken),
}

/// State of a pending lookup, as seen by [`Loader::poll_lookup`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupStatus {
    Pending,
    Ready(SymbolAddress),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LookupPhase {
    /// Waiting for the module load to finish.
    Queued,
    /// Symbol request issued to the host.
    InFlight(RequestId),
}

/// A symbol requested while its module was still loading.
#[derive(Debug)]
pub struct SymbolLookup {
    token: LookupToken,
    owner: HandleId,
    name: String,
    slot: Option<u32>,
    phase: LookupPhase,
}

impl SymbolLookup {
    pub fn token(&self) -> LookupToken {
        self.token
    }

    /// Handle this lookup belongs to. The handle outlives the lookup.
    pub fn owner(&self) -> HandleId {
        self.owner
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Index slot the caller asked for, if any.
    pub fn slot(&self) -> Option<u32> {
        self.slot
    }

    /// Host request carrying this lookup, once the module has loaded.
    pub fn request(&self) -> Option<RequestId> {
        match self.phase {
            LookupPhase::Queued => None,
            LookupPhase::InFlight(id) => Some(id),
        }
    }
}

/// One loadable module.
#[derive(Debug)]
pub struct ModuleHandle {
    identity: String,
    state: LoadState,
    attempt: u32,
    pending: Vec<SymbolLookup>,
    symbols: HashMap<String, SymbolAddress>,
    by_index: HashMap<u32, u32>,
    failure: Option<String>,
}

impl ModuleHandle {
    pub fn new(identity: &str) -> Self {
        Self {
            identity: identity.to_string(),
            state: LoadState::Unloaded,
            attempt: 0,
            pending: Vec::new(),
            symbols: HashMap::new(),
            by_index: HashMap::new(),
            failure: None,
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn state(&self) -> LoadState {
        self.state
    }

    /// Diagnostic captured when the last attempt failed.
    pub fn failure_reason(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    pub fn pending_lookups(&self) -> &[SymbolLookup] {
        &self.pending
    }

    pub fn cached_symbol(&self, name: &str) -> Option<SymbolAddress> {
        self.symbols.get(name).copied()
    }

    pub fn is_busy(&self) -> bool {
        self.state == LoadState::Loading || !self.pending.is_empty()
    }

    /// Enter `Loading` for a fresh attempt and return its number.
    pub(crate) fn begin_attempt(&mut self) -> u32 {
        self.state = LoadState::Loading;
        self.attempt += 1;
        self.failure = None;
        self.attempt
    }

    fn cache(&mut self, name: &str, symbol: SymbolAddress) {
        self.symbols.insert(name.to_string(), symbol);
        self.by_index.insert(symbol.index, symbol.address);
    }

    fn take_lookup(&mut self, token: LookupToken) -> Option<SymbolLookup> {
        let at = self.pending.iter().position(|l| l.token == token)?;
        Some(self.pending.remove(at))
    }
}

/// Continuation invoked when a load succeeds.
pub type OnLoaded = Box<dyn FnOnce(HandleId)>;

/// Continuation invoked when a load fails, with the host's diagnostic.
pub type OnLoadError = Box<dyn FnOnce(HandleId, &str)>;

struct Waiter {
    on_success: OnLoaded,
    on_error: OnLoadError,
}

#[derive(Debug, Clone, Copy)]
enum Continuation {
    Load { handle: HandleId, attempt: u32 },
    Symbol { handle: HandleId, token: LookupToken },
}

/// Drives module handles through their load lifecycle.
#[derive(Default)]
pub struct Loader {
    by_identity: HashMap<String, HandleId>,
    in_flight: HashMap<RequestId, Continuation>,
    waiters: HashMap<HandleId, Vec<Waiter>>,
    outstanding: HashMap<LookupToken, HandleId>,
    results: HashMap<LookupToken, Result<SymbolAddress>>,
    next_request: u64,
    next_token: u64,
}

impl Loader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start loading `identity`, or join a load already in progress.
    ///
    /// A `Loading` or `Loaded` handle for the same identity is returned as is
    /// and no second host request is made. A `Failed` handle starts a new
    /// attempt.
    pub fn load<T: Transport + ?Sized>(
        &mut self,
        table: &mut HandleTable,
        transport: &mut T,
        identity: &str,
    ) -> Result<HandleId> {
        let handle = match self.by_identity.get(identity) {
            Some(&handle) => {
                let state = table.module(handle)?.state();
                if matches!(state, LoadState::Loading | LoadState::Loaded) {
                    debug!("load({}): joining {} in state {:?}", identity, handle, state);
                    return Ok(handle);
                }
                handle
            }
            None => {
                let handle = table.allocate(Record::Module(ModuleHandle::new(identity)))?;
                self.by_identity.insert(identity.to_string(), handle);
                handle
            }
        };

        self.begin_load(table, transport, handle)?;
        Ok(handle)
    }

    /// Like [`load`](Self::load), with continuations for the outcome.
    ///
    /// Exactly one of the two continuations runs, once. If the module is
    /// already loaded, `on_success` runs before this returns. If the request
    /// cannot even be issued the error is returned and neither runs.
    pub fn load_with<T: Transport + ?Sized>(
        &mut self,
        table: &mut HandleTable,
        transport: &mut T,
        identity: &str,
        on_success: OnLoaded,
        on_error: OnLoadError,
    ) -> Result<HandleId> {
        let handle = self.load(table, transport, identity)?;
        match table.module(handle)?.state() {
            LoadState::Loaded => on_success(handle),
            _ => self.waiters.entry(handle).or_default().push(Waiter {
                on_success,
                on_error,
            }),
        }
        Ok(handle)
    }

    /// Blocking load through a single synchronous host call.
    pub fn load_sync<T: Transport + ?Sized>(
        &mut self,
        table: &mut HandleTable,
        transport: &mut T,
        identity: &str,
    ) -> Result<HandleId> {
        let handle = match self.by_identity.get(identity) {
            Some(&handle) => match table.module(handle)?.state() {
                LoadState::Loaded => return Ok(handle),
                LoadState::Loading => return Err(Error::Busy),
                LoadState::Unloaded | LoadState::Failed => handle,
            },
            None => {
                let handle = table.allocate(Record::Module(ModuleHandle::new(identity)))?;
                self.by_identity.insert(identity.to_string(), handle);
                handle
            }
        };

        let module = table.module_mut(handle)?;
        module.begin_attempt();
        let request = Request::Dlopen {
            handle: handle.to_raw(),
            identity: identity.to_string(),
        };
        let outcome = match transport.call(&request) {
            Ok(Response::Loaded) => Ok(()),
            Ok(other) => Err(unexpected("dlopen", &other).to_string()),
            Err(err) => Err(err.message),
        };
        match outcome {
            Ok(()) => {
                module.state = LoadState::Loaded;
                debug!("load_sync({}): loaded as {}", identity, handle);
                Ok(handle)
            }
            Err(reason) => {
                module.state = LoadState::Failed;
                module.failure = Some(reason.clone());
                Err(Error::LoadFailed(reason))
            }
        }
    }

    fn begin_load<T: Transport + ?Sized>(
        &mut self,
        table: &mut HandleTable,
        transport: &mut T,
        handle: HandleId,
    ) -> Result<()> {
        let module = table.module_mut(handle)?;
        let attempt = module.begin_attempt();
        let request = Request::Dlopen {
            handle: handle.to_raw(),
            identity: module.identity.clone(),
        };

        let id = self.next_request_id();
        self.in_flight
            .insert(id, Continuation::Load { handle, attempt });
        debug!(
            "load({}): attempt {} as {} (request {})",
            module.identity, attempt, handle, id.0
        );

        if let Err(err) = transport.call_async(id, request) {
            self.in_flight.remove(&id);
            let reason = err.message;
            self.fail_module(table, handle, &reason)?;
            return Err(Error::LoadFailed(reason));
        }
        Ok(())
    }

    /// Dispatch one host completion to its continuation.
    pub fn deliver<T: Transport + ?Sized>(
        &mut self,
        table: &mut HandleTable,
        transport: &mut T,
        completion: Completion,
    ) -> Result<()> {
        let Some(continuation) = self.in_flight.remove(&completion.id) else {
            warn!("Dropping completion for unknown request {}", completion.id.0);
            return Err(Error::UnknownRequest(completion.id.0));
        };
        trace!("completion {} -> {:?}", completion.id.0, continuation);

        match continuation {
            Continuation::Load { handle, attempt } => {
                self.finish_load(table, transport, handle, attempt, completion.outcome)
            }
            Continuation::Symbol { handle, token } => {
                self.finish_symbol(table, handle, token, completion.outcome)
            }
        }
    }

    fn finish_load<T: Transport + ?Sized>(
        &mut self,
        table: &mut HandleTable,
        transport: &mut T,
        handle: HandleId,
        attempt: u32,
        outcome: std::result::Result<Response, crate::transport::HostError>,
    ) -> Result<()> {
        let module = table.module_mut(handle)?;
        if module.state != LoadState::Loading || module.attempt != attempt {
            warn!("Stale load completion for {} (attempt {})", handle, attempt);
            return Err(Error::InvalidHandle);
        }

        let failure = match outcome {
            Ok(Response::Loaded) => None,
            Ok(other) => Some(unexpected("dlopen", &other).to_string()),
            Err(err) => Some(err.message),
        };
        if let Some(reason) = failure {
            return self.fail_module(table, handle, &reason);
        }

        module.state = LoadState::Loaded;
        debug!("{} ({}) loaded", handle, module.identity);

        let mut issued = Vec::new();
        let mut rejected = Vec::new();
        for lookup in module.pending.iter_mut() {
            let id = RequestId(self.next_request);
            self.next_request += 1;
            let request = Request::Dlsym {
                handle: handle.to_raw(),
                symbol: lookup.name.clone(),
                slot: lookup.slot,
            };
            match transport.call_async(id, request) {
                Ok(()) => {
                    lookup.phase = LookupPhase::InFlight(id);
                    issued.push((id, lookup.token));
                }
                Err(err) => rejected.push((lookup.token, Error::from(err))),
            }
        }
        for (token, err) in rejected {
            module.take_lookup(token);
            self.settle(token, Err(err));
        }
        for (id, token) in issued {
            self.in_flight
                .insert(id, Continuation::Symbol { handle, token });
        }

        for waiter in self.waiters.remove(&handle).unwrap_or_default() {
            (waiter.on_success)(handle);
        }
        Ok(())
    }

    fn fail_module(&mut self, table: &mut HandleTable, handle: HandleId, reason: &str) -> Result<()> {
        let module = table.module_mut(handle)?;
        module.state = LoadState::Failed;
        module.failure = Some(reason.to_string());
        debug!("{} ({}) failed: {}", handle, module.identity, reason);

        let lookups: Vec<SymbolLookup> = module.pending.drain(..).collect();
        for lookup in lookups {
            self.settle(lookup.token, Err(Error::LoadFailed(reason.to_string())));
        }
        for waiter in self.waiters.remove(&handle).unwrap_or_default() {
            (waiter.on_error)(handle, reason);
        }
        Ok(())
    }

    fn finish_symbol(
        &mut self,
        table: &mut HandleTable,
        handle: HandleId,
        token: LookupToken,
        outcome: std::result::Result<Response, crate::transport::HostError>,
    ) -> Result<()> {
        let module = table.module_mut(handle)?;
        let lookup = module.take_lookup(token).ok_or(Error::InvalidHandle)?;

        let result = match outcome {
            Ok(Response::Symbol { address, index }) => {
                let symbol = SymbolAddress { address, index };
                module.cache(&lookup.name, symbol);
                Ok(symbol)
            }
            Ok(other) => Err(unexpected("dlsym", &other)),
            Err(err) => Err(Error::from(err)),
        };
        trace!("lookup {} in {}: {:?}", lookup.name, handle, result);
        self.settle(token, result);
        Ok(())
    }

    /// Resolve `name` in `handle`.
    ///
    /// Cached symbols of a loaded module return immediately; uncached ones
    /// cost one synchronous host call. While the module is loading the lookup
    /// is queued and a token returned. A failed module fails immediately
    /// without contacting the host.
    pub fn resolve_symbol<T: Transport + ?Sized>(
        &mut self,
        table: &mut HandleTable,
        transport: &mut T,
        handle: HandleId,
        name: &str,
        slot: Option<u32>,
    ) -> Result<SymbolResolution> {
        let module = table.module_mut(handle)?;
        match module.state {
            LoadState::Failed => Err(Error::LoadFailed(
                module.failure.clone().unwrap_or_default(),
            )),
            LoadState::Unloaded => Err(Error::LoadFailed(format!(
                "{} has not been loaded",
                module.identity
            ))),
            LoadState::Loaded => {
                if let Some(symbol) = module.cached_symbol(name) {
                    return Ok(SymbolResolution::Ready(symbol));
                }
                let request = Request::Dlsym {
                    handle: handle.to_raw(),
                    symbol: name.to_string(),
                    slot,
                };
                match transport.call(&request)? {
                    Response::Symbol { address, index } => {
                        let symbol = SymbolAddress { address, index };
                        module.cache(name, symbol);
                        Ok(SymbolResolution::Ready(symbol))
                    }
                    other => Err(unexpected("dlsym", &other)),
                }
            }
            LoadState::Loading => {
                let token = LookupToken(self.next_token);
                self.next_token += 1;
                module.pending.push(SymbolLookup {
                    token,
                    owner: handle,
                    name: name.to_string(),
                    slot,
                    phase: LookupPhase::Queued,
                });
                self.outstanding.insert(token, handle);
                trace!("queued lookup {} in {} as {:?}", name, handle, token);
                Ok(SymbolResolution::Pending(token))
            }
        }
    }

    /// Resolve a symbol by an ordinal negotiated earlier.
    pub fn resolve_catchup<T: Transport + ?Sized>(
        &mut self,
        table: &mut HandleTable,
        transport: &mut T,
        handle: HandleId,
        index: u32,
    ) -> Result<u32> {
        let module = table.module_mut(handle)?;
        match module.state {
            LoadState::Loading => return Err(Error::Busy),
            LoadState::Failed | LoadState::Unloaded => {
                return Err(Error::LoadFailed(
                    module.failure.clone().unwrap_or_default(),
                ))
            }
            LoadState::Loaded => {}
        }
        if let Some(address) = module.by_index.get(&index) {
            return Ok(*address);
        }

        let request = Request::DlsymCatchup {
            handle: handle.to_raw(),
            index,
        };
        match transport.call(&request)? {
            Response::Address { address } => {
                module.by_index.insert(index, address);
                Ok(address)
            }
            other => Err(unexpected("dlsym_catchup", &other)),
        }
    }

    /// Check on a queued lookup. A final result is handed out once.
    pub fn poll_lookup(&mut self, token: LookupToken) -> Result<LookupStatus> {
        if let Some(result) = self.results.remove(&token) {
            self.outstanding.remove(&token);
            return result.map(LookupStatus::Ready);
        }
        if self.outstanding.contains_key(&token) {
            Ok(LookupStatus::Pending)
        } else {
            Err(Error::InvalidHandle)
        }
    }

    /// Explicitly unload a module.
    pub fn unload<T: Transport + ?Sized>(
        &mut self,
        table: &mut HandleTable,
        transport: &mut T,
        handle: HandleId,
    ) -> Result<()> {
        let module = table.module(handle)?;
        let was_loaded = module.state == LoadState::Loaded;
        let identity = module.identity.clone();

        table.release(handle)?;
        if self.by_identity.get(&identity) == Some(&handle) {
            self.by_identity.remove(&identity);
        }
        self.waiters.remove(&handle);
        self.forget_lookups(handle);
        debug!("unloaded {} ({})", handle, identity);

        if was_loaded {
            let request = Request::Dlclose {
                handle: handle.to_raw(),
            };
            if let Err(err) = transport.call(&request) {
                warn!("Host failed to close {}: {}", identity, err);
            }
        }
        Ok(())
    }

    /// Handle currently registered for `identity`.
    pub fn handle_for(&self, identity: &str) -> Option<HandleId> {
        self.by_identity.get(identity).copied()
    }

    /// Number of requests awaiting a completion.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    fn settle(&mut self, token: LookupToken, result: Result<SymbolAddress>) {
        self.results.insert(token, result);
    }

    /// Drop lookups of a released module, settled or not.
    fn forget_lookups(&mut self, handle: HandleId) {
        let results = &mut self.results;
        self.outstanding.retain(|token, owner| {
            if *owner == handle {
                results.remove(token);
                false
            } else {
                true
            }
        });
    }

    fn next_request_id(&mut self) -> RequestId {
        let id = RequestId(self.next_request);
        self.next_request += 1;
        id
    }
}
