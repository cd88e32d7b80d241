//! # sandbridge-host
//!
//! Reference host environment for the sandbridge transport.
//!
//! This crate answers the requests a [`sandbridge_core::Bridge`] sends across
//! the sandbox boundary: it chooses addresses for mappings, reads and writes
//! backing files, compiles side modules with [wasmtime](https://wasmtime.dev/)
//! and serves calendar conversions through [chrono].
//!
//! ## Two ways in
//!
//! - **[`ReferenceHost`]**: an in-process [`Transport`](sandbridge_core::Transport)
//!   sharing a byte buffer with the bridge. Deferred completions can be
//!   released in any order, which is what the tests and the replay tool use.
//! - **[`WasmRunner`]**: instantiates a guest module and links the `env`
//!   imports (`_mmap_js`, `_dlopen_js`, ...) plus WASI preview1 into it.
//!
//! ## Example
//!
//! ```ignore
//! use sandbridge_core::{Bridge, BridgeConfig, MapFlags, Prot};
//! use sandbridge_host::{HostConfig, ReferenceHost};
//!
//! let mut host = ReferenceHost::new(HostConfig::default())?;
//! let fd = host.open_file("data.bin".as_ref())?;
//! let memory = host.memory();
//!
//! let mut bridge = Bridge::new(BridgeConfig::default(), host, memory)?;
//! let mapped = bridge.map(4096, Prot::READ | Prot::WRITE, MapFlags::SHARED, fd, 0)?;
//! ```

pub mod clock;
pub mod config;
pub mod error;
pub mod fds;
pub mod host;
pub mod linker;
pub mod memory;
pub mod modules;
pub mod replay;
pub mod runner;
pub mod services;
pub mod space;

pub use config::{HostConfig, WASM_PAGE};
pub use error::{Error, Result};
pub use fds::FdTable;
pub use host::ReferenceHost;
pub use linker::{HostFunctions, HostState};
pub use memory::{HostMemory, SharedMemory};
pub use modules::ModuleRegistry;
pub use replay::{Replay, ReplayReport, Script, Step, StepOutcome};
pub use runner::{RunOutcome, WasmRunner};
pub use services::{HostServices, HostStats};
pub use space::AddressSpace;
