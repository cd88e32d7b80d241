//! In-crate fake host used by unit tests.

use crate::error::errno;
use crate::transport::{Completion, HostError, Request, RequestId, Response, Transport};
use std::collections::{HashMap, VecDeque};

pub(crate) struct FakeTransport {
    pub calls: Vec<Request>,
    pub async_calls: Vec<(RequestId, Request)>,
    pub completions: Vec<Completion>,
    pub symbols: HashMap<String, (u32, u32)>,
    pub map_replies: VecDeque<std::result::Result<Response, HostError>>,
    pub sync_failures: VecDeque<HostError>,
    pub refuse_async: bool,
    next_addr: u32,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self {
            calls: Vec::new(),
            async_calls: Vec::new(),
            completions: Vec::new(),
            symbols: HashMap::new(),
            map_replies: VecDeque::new(),
            sync_failures: VecDeque::new(),
            refuse_async: false,
            next_addr: 0x10000,
        }
    }

    pub fn with_symbol(mut self, name: &str, address: u32, index: u32) -> Self {
        self.symbols.insert(name.to_string(), (address, index));
        self
    }

    pub fn calls_of(&self, op: &str) -> Vec<&Request> {
        self.calls.iter().filter(|r| r.op_name() == op).collect()
    }

    pub fn async_of(&self, op: &str) -> Vec<RequestId> {
        self.async_calls
            .iter()
            .filter(|(_, r)| r.op_name() == op)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Complete an outstanding async request the way a healthy host would.
    pub fn complete(&mut self, id: RequestId) {
        let request = self
            .async_calls
            .iter()
            .find(|(rid, _)| *rid == id)
            .map(|(_, r)| r.clone())
            .expect("unknown request id");
        let outcome = match request {
            Request::Dlopen { .. } => Ok(Response::Loaded),
            Request::Dlsym { symbol, .. } => self.lookup(&symbol),
            other => panic!("unexpected async request {:?}", other),
        };
        self.completions.push(Completion { id, outcome });
    }

    pub fn fail(&mut self, id: RequestId, message: &str) {
        self.completions.push(Completion {
            id,
            outcome: Err(HostError::new(errno::ENOEXEC, message)),
        });
    }

    fn lookup(&self, symbol: &str) -> std::result::Result<Response, HostError> {
        self.symbols
            .get(symbol)
            .map(|(address, index)| Response::Symbol {
                address: *address,
                index: *index,
            })
            .ok_or_else(|| HostError::new(errno::ENOENT, symbol))
    }
}

impl Transport for FakeTransport {
    fn call(&mut self, request: &Request) -> std::result::Result<Response, HostError> {
        self.calls.push(request.clone());
        match request {
            Request::Map { length, .. } => {
                if let Some(reply) = self.map_replies.pop_front() {
                    return reply;
                }
                let addr = self.next_addr;
                let allocated_length = (length + 4095) & !4095;
                self.next_addr += allocated_length;
                Ok(Response::Mapped {
                    addr,
                    allocated_length,
                })
            }
            Request::Sync { .. } => match self.sync_failures.pop_front() {
                Some(err) => Err(err),
                None => Ok(Response::Done),
            },
            Request::Dlopen { .. } => Ok(Response::Loaded),
            Request::Dlsym { symbol, .. } => self.lookup(symbol),
            Request::DlsymCatchup { index, .. } => self
                .symbols
                .values()
                .find(|(_, i)| i == index)
                .map(|(address, _)| Response::Address { address: *address })
                .ok_or_else(|| HostError::new(errno::ENOENT, "no such index")),
            _ => Ok(Response::Done),
        }
    }

    fn call_async(
        &mut self,
        id: RequestId,
        request: Request,
    ) -> std::result::Result<(), HostError> {
        if self.refuse_async {
            return Err(HostError::new(errno::EIO, "host unavailable"));
        }
        self.async_calls.push((id, request));
        Ok(())
    }

    fn drain_completions(&mut self) -> Vec<Completion> {
        std::mem::take(&mut self.completions)
    }
}
