use crate::config::HostConfig;
use crate::linker::{HostFunctions, HostState};
use crate::services::{HostServices, HostStats};
use crate::{Error, Result};
use log::debug;
use std::sync::{Arc, Mutex, MutexGuard};
use wasmtime::{Engine, Linker, Module, Store};

/// Outcome of running a guest program.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    /// Entry point that was called.
    pub entry: String,
    /// Value returned by `run`, if the guest exports it.
    pub result: Option<i32>,
    /// Host statistics after the run.
    pub stats: HostStats,
}

/// Runs guest programs against the bridge imports using wasmtime.
pub struct WasmRunner {
    engine: Engine,
    services: Arc<Mutex<HostServices>>,
}

impl WasmRunner {
    /// Create a runner with its own engine and host services.
    pub fn new(config: HostConfig) -> Result<Self> {
        config.validate()?;
        let engine = Engine::default();
        let services = HostServices::new(config, engine.clone());
        Ok(Self {
            engine,
            services: Arc::new(Mutex::new(services)),
        })
    }

    /// Lock the host services, e.g. to open backing files before a run.
    pub fn services(&self) -> Result<MutexGuard<'_, HostServices>> {
        self.services
            .lock()
            .map_err(|_| Error::Wasm("host services lock poisoned".to_string()))
    }

    /// Instantiate `wasm` (binary or text) and call its entry point.
    ///
    /// `run: () -> i32` is preferred; `_start` is the fallback.
    pub fn execute(&self, wasm: &[u8]) -> Result<RunOutcome> {
        let mut store = Store::new(&self.engine, HostState::new(self.services.clone()));
        let mut linker = Linker::new(&self.engine);

        HostFunctions::register(&mut linker)?;

        let module = Module::new(&self.engine, wasm).map_err(|e| Error::Wasm(e.to_string()))?;

        let instance = linker
            .instantiate(&mut store, &module)
            .map_err(|e| Error::Wasm(e.to_string()))?;

        let (entry, result) = if let Ok(run) = instance.get_typed_func::<(), i32>(&mut store, "run")
        {
            let value = run
                .call(&mut store, ())
                .map_err(|e| Error::Wasm(e.to_string()))?;
            ("run", Some(value))
        } else if let Ok(start) = instance.get_typed_func::<(), ()>(&mut store, "_start") {
            start
                .call(&mut store, ())
                .map_err(|e| Error::Wasm(e.to_string()))?;
            ("_start", None)
        } else {
            return Err(Error::Wasm("No entry point found".to_string()));
        };
        debug!("guest {} returned {:?}", entry, result);

        Ok(RunOutcome {
            entry: entry.to_string(),
            result,
            stats: self.services()?.stats().clone(),
        })
    }
}
