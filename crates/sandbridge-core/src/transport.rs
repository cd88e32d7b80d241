//! Call/return and completion contract with the host environment.
//!
//! The bridge never talks to the host any other way. Synchronous primitives go
//! through [`Transport::call`]; operations the host finishes later go through
//! [`Transport::call_async`] and come back as [`Completion`]s, each exactly
//! once and in no particular order relative to one another.

use crate::calendar::{TimezoneInfo, Tm};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Protocol version for the JSON wire frame.
pub const PROTOCOL_VERSION: &str = "sandbridge.v1";

/// Correlates an asynchronous request with its completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestId(pub u64);

/// A request issued to the host. All integers are fixed width.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    Map {
        length: u32,
        prot: u32,
        flags: u32,
        fd: i32,
        offset: u32,
    },
    Unmap {
        addr: u32,
        length: u32,
        prot: u32,
        flags: u32,
        fd: i32,
        offset: u32,
    },
    Sync {
        addr: u32,
        length: u32,
        prot: u32,
        flags: u32,
        fd: i32,
        offset: u32,
    },
    Dlopen {
        handle: u32,
        identity: String,
    },
    Dlsym {
        handle: u32,
        symbol: String,
        slot: Option<u32>,
    },
    DlsymCatchup {
        handle: u32,
        index: u32,
    },
    Dlclose {
        handle: u32,
    },
    MemcpyBig {
        dest: u32,
        src: u32,
        length: u32,
    },
    NotifyMemoryGrowth {
        memory_index: u32,
    },
    Timegm {
        tm: Tm,
    },
    Mktime {
        tm: Tm,
    },
    Gmtime {
        time: i32,
    },
    Localtime {
        time: i32,
    },
    Tzset,
    GetProgname,
    GetNowIsMonotonic,
}

impl Request {
    /// Stable operation name, used for logging and call accounting.
    pub fn op_name(&self) -> &'static str {
        match self {
            Request::Map { .. } => "map",
            Request::Unmap { .. } => "unmap",
            Request::Sync { .. } => "sync",
            Request::Dlopen { .. } => "dlopen",
            Request::Dlsym { .. } => "dlsym",
            Request::DlsymCatchup { .. } => "dlsym_catchup",
            Request::Dlclose { .. } => "dlclose",
            Request::MemcpyBig { .. } => "memcpy_big",
            Request::NotifyMemoryGrowth { .. } => "notify_memory_growth",
            Request::Timegm { .. } => "timegm",
            Request::Mktime { .. } => "mktime",
            Request::Gmtime { .. } => "gmtime",
            Request::Localtime { .. } => "localtime",
            Request::Tzset => "tzset",
            Request::GetProgname => "get_progname",
            Request::GetNowIsMonotonic => "get_now_is_monotonic",
        }
    }
}

/// A successful host answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Response {
    Done,
    Mapped { addr: u32, allocated_length: u32 },
    Loaded,
    Symbol { address: u32, index: u32 },
    Address { address: u32 },
    /// Epoch seconds plus the normalised calendar fields.
    Time { time: i32, tm: Tm },
    Calendar { tm: Tm },
    Timezone { info: TimezoneInfo },
    Text { value: String },
    Flag { value: bool },
}

/// Failure reported by the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("host error (errno {errno}): {message}")]
pub struct HostError {
    pub errno: i32,
    pub message: String,
}

impl HostError {
    pub fn new(errno: i32, message: impl Into<String>) -> Self {
        Self {
            errno,
            message: message.into(),
        }
    }
}

/// The single delivery for an asynchronous request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Completion {
    pub id: RequestId,
    pub outcome: std::result::Result<Response, HostError>,
}

/// Channel to the host environment.
pub trait Transport {
    /// Perform a request inline and return its answer.
    fn call(&mut self, request: &Request) -> std::result::Result<Response, HostError>;

    /// Start a request the host completes later. An `Err` means the request
    /// was never accepted and no completion will follow.
    fn call_async(&mut self, id: RequestId, request: Request)
        -> std::result::Result<(), HostError>;

    /// Hand over completions that arrived since the last drain.
    fn drain_completions(&mut self) -> Vec<Completion>;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn call(&mut self, request: &Request) -> std::result::Result<Response, HostError> {
        (**self).call(request)
    }

    fn call_async(
        &mut self,
        id: RequestId,
        request: Request,
    ) -> std::result::Result<(), HostError> {
        (**self).call_async(id, request)
    }

    fn drain_completions(&mut self) -> Vec<Completion> {
        (**self).drain_completions()
    }
}

/// Build the error for a response of the wrong shape.
pub(crate) fn unexpected(op: &str, response: &Response) -> Error {
    Error::Transport(format!("unexpected response to {}: {:?}", op, response))
}

/// Payload of a wire frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeBody {
    Call(Request),
    CallAsync(Request),
    Reply(std::result::Result<Response, HostError>),
    Completion(std::result::Result<Response, HostError>),
}

/// Versioned JSON frame for transports that cross a byte channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub version: String,
    pub request_id: RequestId,
    pub body: EnvelopeBody,
}

impl Envelope {
    pub fn new(request_id: RequestId, body: EnvelopeBody) -> Self {
        Self {
            version: PROTOCOL_VERSION.to_string(),
            request_id,
            body,
        }
    }

    /// Frame a completion for delivery.
    pub fn completion(completion: Completion) -> Self {
        Self::new(completion.id, EnvelopeBody::Completion(completion.outcome))
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::Transport(e.to_string()))
    }

    /// Parse a frame, rejecting other protocol versions.
    pub fn from_json(text: &str) -> Result<Self> {
        let envelope: Self =
            serde_json::from_str(text).map_err(|e| Error::Transport(e.to_string()))?;
        if envelope.version != PROTOCOL_VERSION {
            return Err(Error::Transport(format!(
                "unsupported protocol version: {}",
                envelope.version
            )));
        }
        Ok(envelope)
    }

    /// Convert a completion frame back into a [`Completion`].
    pub fn into_completion(self) -> Result<Completion> {
        match self.body {
            EnvelopeBody::Completion(outcome) => Ok(Completion {
                id: self.request_id,
                outcome,
            }),
            other => Err(Error::Transport(format!(
                "expected completion frame, got {:?}",
                other
            ))),
        }
    }
}
