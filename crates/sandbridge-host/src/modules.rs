//! Side-module registry: compiles modules on `dlopen` and serves their symbols.

use log::{debug, warn};
use sandbridge_core::errno;
use sandbridge_core::HostError;
use std::collections::HashMap;
use std::path::PathBuf;
use wasmtime::{Engine, Module};

/// Symbol table of one loaded module.
#[derive(Debug)]
struct LoadedModule {
    identity: String,
    symbols: HashMap<String, (u32, u32)>,
    by_index: HashMap<u32, u32>,
}

/// Known side modules and the ones currently loaded.
pub struct ModuleRegistry {
    engine: Engine,
    sources: HashMap<String, Vec<u8>>,
    search_path: Option<PathBuf>,
    loaded: HashMap<u32, LoadedModule>,
    next_slot: u32,
}

impl ModuleRegistry {
    pub fn new(engine: Engine, search_path: Option<PathBuf>) -> Self {
        Self {
            engine,
            sources: HashMap::new(),
            search_path,
            loaded: HashMap::new(),
            next_slot: 1,
        }
    }

    /// Make `bytes` (binary or text format) loadable as `identity`.
    pub fn register(&mut self, identity: &str, bytes: impl Into<Vec<u8>>) {
        self.sources.insert(identity.to_string(), bytes.into());
    }

    pub fn is_loaded(&self, handle: u32) -> bool {
        self.loaded.contains_key(&handle)
    }

    /// Compile `identity` and bind it to `handle`.
    ///
    /// Exports become the symbol table; each gets a fresh table slot as its
    /// address and its export ordinal as its index.
    pub fn open(&mut self, handle: u32, identity: &str) -> Result<(), HostError> {
        let bytes = self.source(identity)?;
        let module = Module::new(&self.engine, &bytes).map_err(|e| {
            warn!("Failed to compile {}: {}", identity, e);
            HostError::new(errno::ENOEXEC, format!("{}: {}", identity, e))
        })?;

        let mut loaded = LoadedModule {
            identity: identity.to_string(),
            symbols: HashMap::new(),
            by_index: HashMap::new(),
        };
        for (ordinal, export) in module.exports().enumerate() {
            let address = self.next_slot;
            self.next_slot += 1;
            loaded
                .symbols
                .insert(export.name().to_string(), (address, ordinal as u32));
            loaded.by_index.insert(ordinal as u32, address);
        }
        debug!(
            "dlopen {} as {:#x}: {} symbols",
            identity,
            handle,
            loaded.symbols.len()
        );
        self.loaded.insert(handle, loaded);
        Ok(())
    }

    /// Look up `symbol`, optionally pinning it to index `slot` for catch-up.
    pub fn symbol(
        &mut self,
        handle: u32,
        symbol: &str,
        slot: Option<u32>,
    ) -> Result<(u32, u32), HostError> {
        let module = self.module_mut(handle)?;
        let (address, ordinal) = module
            .symbols
            .get(symbol)
            .copied()
            .ok_or_else(|| HostError::new(errno::ENOENT, symbol))?;
        let index = match slot {
            Some(slot) => {
                module.by_index.insert(slot, address);
                slot
            }
            None => ordinal,
        };
        Ok((address, index))
    }

    /// Resolve a previously negotiated index.
    pub fn catchup(&mut self, handle: u32, index: u32) -> Result<u32, HostError> {
        let module = self.module_mut(handle)?;
        module.by_index.get(&index).copied().ok_or_else(|| {
            HostError::new(
                errno::ENOENT,
                format!("{} has no symbol at index {}", module.identity, index),
            )
        })
    }

    pub fn close(&mut self, handle: u32) -> Result<(), HostError> {
        let module = self
            .loaded
            .remove(&handle)
            .ok_or_else(|| HostError::new(errno::EBADF, format!("{:#x} is not loaded", handle)))?;
        debug!("dlclose {} ({:#x})", module.identity, handle);
        Ok(())
    }

    fn module_mut(&mut self, handle: u32) -> Result<&mut LoadedModule, HostError> {
        self.loaded
            .get_mut(&handle)
            .ok_or_else(|| HostError::new(errno::EBADF, format!("{:#x} is not loaded", handle)))
    }

    fn source(&self, identity: &str) -> Result<Vec<u8>, HostError> {
        if let Some(bytes) = self.sources.get(identity) {
            return Ok(bytes.clone());
        }
        let path = self
            .search_path
            .as_ref()
            .map(|dir| dir.join(identity))
            .ok_or_else(|| HostError::new(errno::ENOENT, format!("{}: not registered", identity)))?;
        std::fs::read(&path).map_err(|e| {
            HostError::new(errno::ENOENT, format!("{}: {}", path.display(), e))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIB: &str = r#"(module
        (func (export "foo") (result i32) i32.const 1)
        (func (export "bar") (result i32) i32.const 2))"#;

    fn registry() -> ModuleRegistry {
        let mut registry = ModuleRegistry::new(Engine::default(), None);
        registry.register("libfoo", LIB);
        registry
    }

    #[test]
    fn exports_become_symbols() {
        let mut registry = registry();
        registry.open(7, "libfoo").unwrap();

        let (foo, foo_index) = registry.symbol(7, "foo", None).unwrap();
        let (bar, bar_index) = registry.symbol(7, "bar", None).unwrap();
        assert_eq!((foo_index, bar_index), (0, 1));
        assert_ne!(foo, bar);
        assert_eq!(registry.catchup(7, 1).unwrap(), bar);

        let err = registry.symbol(7, "baz", None).unwrap_err();
        assert_eq!(err.errno, errno::ENOENT);
    }

    #[test]
    fn slot_pins_catchup_index() {
        let mut registry = registry();
        registry.open(7, "libfoo").unwrap();
        let (address, index) = registry.symbol(7, "foo", Some(40)).unwrap();
        assert_eq!(index, 40);
        assert_eq!(registry.catchup(7, 40).unwrap(), address);
    }

    #[test]
    fn garbage_fails_to_compile() {
        let mut registry = ModuleRegistry::new(Engine::default(), None);
        registry.register("libbad", b"\0asm\x02garbage".to_vec());
        let err = registry.open(1, "libbad").unwrap_err();
        assert_eq!(err.errno, errno::ENOEXEC);
        assert!(!registry.is_loaded(1));
    }

    #[test]
    fn search_path_is_consulted() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("libdisk.wat"), LIB).unwrap();
        let mut registry = ModuleRegistry::new(Engine::default(), Some(dir.path().into()));

        registry.open(2, "libdisk.wat").unwrap();
        assert!(registry.is_loaded(2));
        assert_eq!(
            registry.open(3, "libmissing.wat").unwrap_err().errno,
            errno::ENOENT
        );
        registry.close(2).unwrap();
        assert!(registry.close(2).is_err());
    }
}
