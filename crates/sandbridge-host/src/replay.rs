//! Scripted bridge sessions against the reference host.
//!
//! A script names backing files and side modules, then lists steps:
//!
//! ```toml
//! [host]
//! deferred_completions = true
//!
//! [[files]]
//! name = "data"
//! path = "data.bin"
//!
//! [[steps]]
//! op = "map"
//! label = "m"
//! length = 8192
//! prot = ["read", "write"]
//! flags = ["shared"]
//! file = "data"
//!
//! [[steps]]
//! op = "write"
//! mapping = "m"
//! data = "hello"
//!
//! [[steps]]
//! op = "unmap"
//! mapping = "m"
//! ```

use crate::config::HostConfig;
use crate::host::ReferenceHost;
use crate::memory::SharedMemory;
use crate::services::HostStats;
use crate::{Error, Result};
use log::{debug, info};
use sandbridge_core::{
    Bridge, BridgeConfig, HandleId, LookupStatus, LookupToken, MapFlags, Prot, SymbolAddress,
    SymbolResolution, SyncFlags,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// A backing file opened before the first step.
#[derive(Debug, Clone, Deserialize)]
pub struct FileSource {
    pub name: String,
    pub path: PathBuf,
}

/// A side module registered with the host before the first step.
#[derive(Debug, Clone, Deserialize)]
pub struct ModuleSource {
    pub identity: String,
    /// Compiled module or `.wat` file.
    pub path: Option<PathBuf>,
    /// Inline module text.
    pub wat: Option<String>,
}

/// One scripted operation.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Step {
    Map {
        label: String,
        length: u32,
        #[serde(default)]
        prot: Vec<String>,
        #[serde(default)]
        flags: Vec<String>,
        /// Backing file name; anonymous when absent.
        file: Option<String>,
        #[serde(default)]
        offset: u32,
    },
    Write {
        mapping: String,
        #[serde(default)]
        offset: u32,
        data: String,
    },
    Read {
        mapping: String,
        #[serde(default)]
        offset: u32,
        length: u32,
    },
    Sync {
        mapping: String,
        #[serde(default)]
        flags: Vec<String>,
    },
    Unmap {
        mapping: String,
    },
    Load {
        identity: String,
        #[serde(default)]
        sync: bool,
    },
    Resolve {
        identity: String,
        symbol: String,
        slot: Option<u32>,
    },
    /// Release every deferred host completion and deliver them.
    Pump,
    Unload {
        identity: String,
    },
}

impl Step {
    fn name(&self) -> &'static str {
        match self {
            Step::Map { .. } => "map",
            Step::Write { .. } => "write",
            Step::Read { .. } => "read",
            Step::Sync { .. } => "sync",
            Step::Unmap { .. } => "unmap",
            Step::Load { .. } => "load",
            Step::Resolve { .. } => "resolve",
            Step::Pump => "pump",
            Step::Unload { .. } => "unload",
        }
    }
}

/// A complete replay script.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Script {
    pub bridge: BridgeConfig,
    pub host: HostConfig,
    pub files: Vec<FileSource>,
    pub modules: Vec<ModuleSource>,
    pub steps: Vec<Step>,
}

impl Script {
    pub fn from_toml(data: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(data)
            .map_err(|e| Error::Toml(format!("Invalid UTF-8: {}", e)))?;
        toml::from_str(text).map_err(|e| Error::Toml(e.to_string()))
    }

    pub fn load(path: &Path) -> Result<Self> {
        Self::from_toml(&std::fs::read(path)?)
    }
}

/// What one step did.
#[derive(Debug, Clone, Serialize)]
pub struct StepOutcome {
    pub step: usize,
    pub op: &'static str,
    pub ok: bool,
    pub detail: Value,
}

/// Every step outcome plus the host's counters at the end.
#[derive(Debug, Clone, Serialize)]
pub struct ReplayReport {
    pub steps: Vec<StepOutcome>,
    pub stats: HostStats,
}

impl ReplayReport {
    pub fn failures(&self) -> usize {
        self.steps.iter().filter(|s| !s.ok).count()
    }
}

fn parse_flags<F>(names: &[String], prefix: &str, from_name: F) -> Result<u32>
where
    F: Fn(&str) -> Option<u32>,
{
    names.iter().try_fold(0, |acc, name| {
        let upper = name.to_uppercase();
        let bare = upper.strip_prefix(prefix).unwrap_or(&upper);
        from_name(bare)
            .map(|bits| acc | bits)
            .ok_or_else(|| Error::InvalidInput(format!("unknown flag: {}", name)))
    })
}

fn symbol_json(symbol: SymbolAddress) -> Value {
    json!({ "address": symbol.address, "index": symbol.index })
}

/// A bridge wired to a reference host, driven by a [`Script`].
pub struct Replay {
    bridge: Bridge<ReferenceHost, SharedMemory>,
    files: HashMap<String, i32>,
    mappings: HashMap<String, u32>,
    lookups: Vec<(String, String, LookupToken)>,
}

impl Replay {
    /// Set up host, files and modules. Relative paths resolve against `base_dir`.
    pub fn new(script: &Script, base_dir: &Path) -> Result<Self> {
        let mut host = ReferenceHost::new(script.host.clone())?;

        let mut files = HashMap::new();
        for file in &script.files {
            let fd = host.open_file(&base_dir.join(&file.path))?;
            debug!("opened {} as fd {}", file.name, fd);
            files.insert(file.name.clone(), fd);
        }

        for module in &script.modules {
            let bytes = match (&module.path, &module.wat) {
                (Some(path), _) => std::fs::read(base_dir.join(path))?,
                (None, Some(wat)) => wat.clone().into_bytes(),
                (None, None) => {
                    return Err(Error::InvalidInput(format!(
                        "module {} has neither path nor wat",
                        module.identity
                    )))
                }
            };
            host.register_module(&module.identity, bytes);
        }

        let memory = host.memory();
        let bridge = Bridge::new(script.bridge.clone(), host, memory)?;
        Ok(Self {
            bridge,
            files,
            mappings: HashMap::new(),
            lookups: Vec::new(),
        })
    }

    pub fn bridge(&self) -> &Bridge<ReferenceHost, SharedMemory> {
        &self.bridge
    }

    /// Run every step. Step failures are recorded, not fatal.
    pub fn run(&mut self, steps: &[Step]) -> ReplayReport {
        let outcomes = steps
            .iter()
            .enumerate()
            .map(|(index, step)| {
                let result = self.step(step);
                match result {
                    Ok(detail) => StepOutcome {
                        step: index,
                        op: step.name(),
                        ok: true,
                        detail,
                    },
                    Err(e) => {
                        info!("step {} ({}) failed: {}", index, step.name(), e);
                        StepOutcome {
                            step: index,
                            op: step.name(),
                            ok: false,
                            detail: json!({ "error": e.to_string() }),
                        }
                    }
                }
            })
            .collect();

        ReplayReport {
            steps: outcomes,
            stats: self.bridge.transport().stats().clone(),
        }
    }

    fn mapping(&self, label: &str) -> Result<u32> {
        self.mappings
            .get(label)
            .copied()
            .ok_or_else(|| Error::InvalidInput(format!("unknown mapping: {}", label)))
    }

    /// Address of `length` bytes at `offset` into a mapping, which must hold them.
    fn address(&self, label: &str, offset: u32, length: usize) -> Result<u32> {
        let base = self.mapping(label)?;
        let size = self
            .bridge
            .mapping_at(base)
            .map(|(_, m)| m.length())
            .ok_or_else(|| Error::InvalidInput(format!("{} is unmapped", label)))?;
        let end = u32::try_from(length)
            .ok()
            .and_then(|length| offset.checked_add(length));
        match end {
            Some(end) if end <= size => Ok(base + offset),
            _ => Err(Error::InvalidInput(format!(
                "{} bytes at +{} overrun {} ({} bytes)",
                length, offset, label, size
            ))),
        }
    }

    fn module(&self, identity: &str) -> Result<HandleId> {
        self.bridge
            .handle_for(identity)
            .ok_or_else(|| Error::InvalidInput(format!("module never loaded: {}", identity)))
    }

    fn step(&mut self, step: &Step) -> Result<Value> {
        match step {
            Step::Map {
                label,
                length,
                prot,
                flags,
                file,
                offset,
            } => {
                let prot = parse_flags(prot, "PROT_", |n| Prot::from_name(n).map(|f| f.bits()))?;
                let flags =
                    parse_flags(flags, "MAP_", |n| MapFlags::from_name(n).map(|f| f.bits()))?;
                let fd = match file {
                    Some(name) => *self
                        .files
                        .get(name)
                        .ok_or_else(|| Error::InvalidInput(format!("unknown file: {}", name)))?,
                    None => -1,
                };
                let mapped = self.bridge.map(
                    *length,
                    Prot::from_bits_retain(prot),
                    MapFlags::from_bits_retain(flags),
                    fd,
                    *offset,
                )?;
                self.mappings.insert(label.clone(), mapped.addr);
                Ok(json!({
                    "addr": mapped.addr,
                    "allocated_length": mapped.allocated_length,
                    "handle": mapped.handle.to_raw(),
                }))
            }
            Step::Write {
                mapping,
                offset,
                data,
            } => {
                let addr = self.address(mapping, *offset, data.len())?;
                self.bridge.write(addr, data.as_bytes())?;
                Ok(json!({ "written": data.len() }))
            }
            Step::Read {
                mapping,
                offset,
                length,
            } => {
                let addr = self.address(mapping, *offset, *length as usize)?;
                let mut buf = vec![0u8; *length as usize];
                self.bridge.read(addr, &mut buf)?;
                Ok(json!({ "data": String::from_utf8_lossy(&buf) }))
            }
            Step::Sync { mapping, flags } => {
                let base = self.mapping(mapping)?;
                let flags =
                    parse_flags(flags, "MS_", |n| SyncFlags::from_name(n).map(|f| f.bits()))?;
                let length = self
                    .bridge
                    .mapping_at(base)
                    .map(|(_, m)| m.length())
                    .ok_or_else(|| Error::InvalidInput(format!("{} is unmapped", mapping)))?;
                let before = self.bridge.transport().stats().bytes_flushed;
                self.bridge
                    .sync(base, length, SyncFlags::from_bits_retain(flags))?;
                let after = self.bridge.transport().stats().bytes_flushed;
                Ok(json!({ "flushed": after - before }))
            }
            Step::Unmap { mapping } => {
                let base = self.mapping(mapping)?;
                let length = self
                    .bridge
                    .mapping_at(base)
                    .map(|(_, m)| m.length())
                    .ok_or_else(|| Error::InvalidInput(format!("{} is unmapped", mapping)))?;
                let report = self.bridge.unmap(base, length)?;
                self.mappings.remove(mapping);
                let errors: Vec<String> = report
                    .flush_errors
                    .iter()
                    .chain(report.release_errors.iter())
                    .map(|(addr, e)| format!("{:#x}: {}", addr, e))
                    .collect();
                Ok(json!({ "unmapped": report.unmapped.len(), "errors": errors }))
            }
            Step::Load { identity, sync } => {
                let handle = if *sync {
                    self.bridge.load_sync(identity)?
                } else {
                    self.bridge.load(identity)?
                };
                let state = self.bridge.module_state(handle)?;
                Ok(json!({ "handle": handle.to_raw(), "state": format!("{:?}", state) }))
            }
            Step::Resolve {
                identity,
                symbol,
                slot,
            } => {
                let handle = self.module(identity)?;
                let resolution = match slot {
                    Some(slot) => self.bridge.resolve_symbol_in_slot(handle, symbol, *slot)?,
                    None => self.bridge.resolve_symbol(handle, symbol)?,
                };
                match resolution {
                    SymbolResolution::Ready(found) => Ok(symbol_json(found)),
                    SymbolResolution::Pending(token) => {
                        self.lookups
                            .push((identity.clone(), symbol.clone(), token));
                        Ok(json!({ "pending": true }))
                    }
                }
            }
            Step::Pump => {
                // Delivering a load queues its symbol requests, so drain until quiet.
                let (mut released, mut delivered) = (0, 0);
                loop {
                    let ran = self.bridge.transport_mut().complete_all();
                    let settled = self.bridge.pump()?;
                    if ran == 0 && settled == 0 {
                        break;
                    }
                    released += ran;
                    delivered += settled;
                }

                let mut resolved = Vec::new();
                let mut still_pending = Vec::new();
                for (identity, symbol, token) in std::mem::take(&mut self.lookups) {
                    match self.bridge.poll_lookup(token) {
                        Ok(LookupStatus::Pending) => still_pending.push((identity, symbol, token)),
                        Ok(LookupStatus::Ready(found)) => resolved.push(json!({
                            "module": identity,
                            "symbol": symbol,
                            "result": symbol_json(found),
                        })),
                        Err(e) => resolved.push(json!({
                            "module": identity,
                            "symbol": symbol,
                            "error": e.to_string(),
                        })),
                    }
                }
                self.lookups = still_pending;

                Ok(json!({
                    "released": released,
                    "delivered": delivered,
                    "lookups": resolved,
                }))
            }
            Step::Unload { identity } => {
                let handle = self.module(identity)?;
                self.bridge.unload(handle)?;
                Ok(json!({ "handle": handle.to_raw() }))
            }
        }
    }
}
