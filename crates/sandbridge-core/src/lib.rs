//! # sandbridge-core
//!
//! Sandboxed-side bridge for dynamic module loading and emulated memory
//! mappings.
//!
//! This crate provides:
//! - A generation-checked handle table owning every module and mapping record
//! - `mmap`/`munmap`/`msync` emulation with byte-granular dirty tracking
//! - An asynchronous module loader with coalesced loads and queued lookups
//! - The transport contract with the host environment
//! - Synchronous host helpers (large copies, calendar conversions, program name)
//!
//! ## Example
//!
//! ```ignore
//! use sandbridge_core::{
//!     Bridge, BridgeConfig, MapFlags, Prot, SymbolResolution, SyncFlags, VecMemory,
//! };
//!
//! let mut bridge = Bridge::new(BridgeConfig::default(), transport, VecMemory::new(1 << 20))?;
//!
//! let mapped = bridge.map(8192, Prot::READ | Prot::WRITE, MapFlags::SHARED, fd, 0)?;
//! bridge.write(mapped.addr, b"hello")?;
//! bridge.sync(mapped.addr, 8192, SyncFlags::SYNC)?;
//!
//! let lib = bridge.load("libfoo.wasm")?;
//! if let SymbolResolution::Pending(token) = bridge.resolve_symbol(lib, "foo")? {
//!     bridge.pump()?;
//!     let status = bridge.poll_lookup(token)?;
//! }
//! ```

pub mod abi;
pub mod bridge;
pub mod calendar;
pub mod config;
pub mod error;
pub mod handle;
pub mod loader;
pub mod mapping;
pub mod memory;
pub mod transport;

#[cfg(target_arch = "wasm32")]
pub mod wasm_imports;

#[cfg(test)]
mod testing;

pub use bridge::Bridge;
pub use calendar::{TimezoneInfo, Tm};
pub use config::BridgeConfig;
pub use error::{errno, Error, Result};
pub use handle::{HandleId, HandleKind, HandleTable, Record};
pub use loader::{
    LoadState, Loader, LookupStatus, LookupToken, ModuleHandle, OnLoadError, OnLoaded,
    SymbolAddress, SymbolLookup, SymbolResolution,
};
pub use mapping::{
    Backing, DirtyRanges, MapFlags, Mapped, Mapping, MappingManager, Prot, Sharing, SyncFlags,
    UnmapReport,
};
pub use memory::{checked_range, LinearMemory, VecMemory};
pub use transport::{
    Completion, Envelope, EnvelopeBody, HostError, Request, RequestId, Response, Transport,
    PROTOCOL_VERSION,
};

#[cfg(target_arch = "wasm32")]
pub use wasm_imports::{ImportTransport, OwnMemory};
