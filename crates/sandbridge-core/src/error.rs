use crate::transport::HostError;
use thiserror::Error;

/// POSIX errno values used at the host boundary.
///
/// These are the Linux numbers; both sides of the transport agree on them
/// regardless of the target the sandboxed program was built for.
pub mod errno {
    pub const ENOENT: i32 = 2;
    pub const EIO: i32 = 5;
    pub const ENOEXEC: i32 = 8;
    pub const EBADF: i32 = 9;
    pub const ENOMEM: i32 = 12;
    pub const EBUSY: i32 = 16;
    pub const EINVAL: i32 = 22;
    pub const EMFILE: i32 = 24;
    pub const EOVERFLOW: i32 = 75;
}

/// Errors surfaced by the bridge to its immediate caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// Malformed range, zero length or unsupported flag combination.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The host could not satisfy a memory request.
    #[error("out of memory")]
    OutOfMemory,

    /// The handle table is full.
    #[error("out of handles")]
    OutOfHandles,

    /// The host failed to load or link a module.
    #[error("load failed: {0}")]
    LoadFailed(String),

    /// Symbol absent from a successfully loaded module.
    #[error("symbol not found: {0}")]
    NotFound(String),

    /// The handle still has asynchronous work in flight.
    #[error("handle has pending asynchronous work")]
    Busy,

    /// Stale, released or foreign identifier.
    #[error("invalid handle")]
    InvalidHandle,

    /// A completion arrived for a request that is not outstanding.
    #[error("no outstanding request with id {0}")]
    UnknownRequest(u64),

    /// The host answered with something the bridge cannot interpret.
    #[error("transport error: {0}")]
    Transport(String),

    /// Invalid configuration.
    #[error("config error: {0}")]
    Config(String),
}

impl Error {
    /// Positive errno for this error, for shims that return `-errno`.
    pub fn errno(&self) -> i32 {
        match self {
            Error::InvalidArgument(_) | Error::Config(_) => errno::EINVAL,
            Error::OutOfMemory => errno::ENOMEM,
            Error::OutOfHandles => errno::EMFILE,
            Error::LoadFailed(_) => errno::ENOEXEC,
            Error::NotFound(_) => errno::ENOENT,
            Error::Busy => errno::EBUSY,
            Error::InvalidHandle => errno::EBADF,
            Error::UnknownRequest(_) | Error::Transport(_) => errno::EIO,
        }
    }
}

impl From<HostError> for Error {
    fn from(err: HostError) -> Self {
        match err.errno {
            errno::ENOMEM => Error::OutOfMemory,
            errno::EMFILE => Error::OutOfHandles,
            errno::EBUSY => Error::Busy,
            errno::EINVAL | errno::EBADF => Error::InvalidArgument(err.message),
            errno::ENOENT => Error::NotFound(err.message),
            errno::ENOEXEC => Error::LoadFailed(err.message),
            _ => Error::Transport(err.message),
        }
    }
}

/// Result type for sandbridge-core operations.
pub type Result<T> = std::result::Result<T, Error>;
