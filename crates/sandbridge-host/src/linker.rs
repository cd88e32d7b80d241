use crate::memory::HostMemory;
use crate::services::HostServices;
use crate::{Error, Result};
use sandbridge_core::abi::{self, SymbolOut};
use sandbridge_core::{
    errno, Error as CoreError, HostError, LinearMemory, Request, Response, Result as CoreResult,
    Tm,
};
use std::sync::{Arc, Mutex};
use wasmtime::{Caller, Linker, Memory};
use wasmtime_wasi::preview1::WasiP1Ctx;
use wasmtime_wasi::WasiCtxBuilder;

/// State shared between the host and a WASM guest.
pub struct HostState {
    /// Host services, shared with whoever drives the guest.
    pub services: Arc<Mutex<HostServices>>,
    /// WASI context.
    pub wasi: WasiP1Ctx,
}

impl HostState {
    pub fn new(services: Arc<Mutex<HostServices>>) -> Self {
        Self {
            services,
            wasi: WasiCtxBuilder::new().inherit_stdio().build_p1(),
        }
    }
}

/// The guest's exported memory viewed through the bridge traits.
struct GuestMemory<'a, 'c> {
    caller: &'a mut Caller<'c, HostState>,
    memory: Memory,
}

impl LinearMemory for GuestMemory<'_, '_> {
    fn size(&self) -> u32 {
        self.memory.data_size(&*self.caller).min(u32::MAX as usize) as u32
    }

    fn read(&self, addr: u32, buf: &mut [u8]) -> CoreResult<()> {
        self.memory
            .read(&*self.caller, addr as usize, buf)
            .map_err(|e| CoreError::InvalidArgument(e.to_string()))
    }

    fn write(&mut self, addr: u32, data: &[u8]) -> CoreResult<()> {
        self.memory
            .write(&mut *self.caller, addr as usize, data)
            .map_err(|e| CoreError::InvalidArgument(e.to_string()))
    }
}

impl HostMemory for GuestMemory<'_, '_> {
    fn grow_to(&mut self, size: u32) -> CoreResult<()> {
        let current = self.size();
        if size <= current {
            return Ok(());
        }
        let pages = (size - current).div_ceil(crate::config::WASM_PAGE);
        self.memory
            .grow(&mut *self.caller, u64::from(pages))
            .map(|_| ())
            .map_err(|_| CoreError::OutOfMemory)
    }
}

/// Host functions exposed to WASM guests under the `env` module.
pub struct HostFunctions;

impl HostFunctions {
    /// Register WASI and the bridge imports with the linker.
    pub fn register(linker: &mut Linker<HostState>) -> Result<()> {
        wasmtime_wasi::preview1::add_to_linker_sync(linker, |state| &mut state.wasi)
            .map_err(|e| Error::Wasm(e.to_string()))?;

        linker
            .func_wrap(
                abi::MODULE,
                abi::MMAP,
                |mut caller: Caller<'_, HostState>,
                 length: u32,
                 prot: u32,
                 flags: u32,
                 fd: i32,
                 offset: u32,
                 allocated_ptr: u32,
                 addr_ptr: u32|
                 -> i32 {
                    let request = Request::Map {
                        length,
                        prot,
                        flags,
                        fd,
                        offset,
                    };
                    Self::dispatch(&mut caller, &request, |memory, response| match response {
                        Response::Mapped {
                            addr,
                            allocated_length,
                        } => {
                            memory.write(allocated_ptr, &allocated_length.to_le_bytes())?;
                            memory.write(addr_ptr, &addr.to_le_bytes())
                        }
                        _ => Ok(()),
                    })
                },
            )
            .map_err(|e| Error::Wasm(e.to_string()))?;

        linker
            .func_wrap(
                abi::MODULE,
                abi::MUNMAP,
                |mut caller: Caller<'_, HostState>,
                 addr: u32,
                 length: u32,
                 prot: u32,
                 flags: u32,
                 fd: i32,
                 offset: u32|
                 -> i32 {
                    let request = Request::Unmap {
                        addr,
                        length,
                        prot,
                        flags,
                        fd,
                        offset,
                    };
                    Self::dispatch(&mut caller, &request, |_, _| Ok(()))
                },
            )
            .map_err(|e| Error::Wasm(e.to_string()))?;

        linker
            .func_wrap(
                abi::MODULE,
                abi::MSYNC,
                |mut caller: Caller<'_, HostState>,
                 addr: u32,
                 length: u32,
                 prot: u32,
                 flags: u32,
                 fd: i32,
                 offset: u32|
                 -> i32 {
                    let request = Request::Sync {
                        addr,
                        length,
                        prot,
                        flags,
                        fd,
                        offset,
                    };
                    Self::dispatch(&mut caller, &request, |_, _| Ok(()))
                },
            )
            .map_err(|e| Error::Wasm(e.to_string()))?;

        linker
            .func_wrap(
                abi::MODULE,
                abi::DLOPEN,
                |mut caller: Caller<'_, HostState>,
                 handle: u32,
                 name_ptr: u32,
                 name_len: u32|
                 -> i32 {
                    let identity = match Self::read_string(&mut caller, name_ptr, name_len) {
                        Ok(name) => name,
                        Err(code) => return code,
                    };
                    let request = Request::Dlopen { handle, identity };
                    Self::dispatch(&mut caller, &request, |_, _| Ok(()))
                },
            )
            .map_err(|e| Error::Wasm(e.to_string()))?;

        linker
            .func_wrap(
                abi::MODULE,
                abi::DLSYM,
                |mut caller: Caller<'_, HostState>,
                 handle: u32,
                 name_ptr: u32,
                 name_len: u32,
                 slot: i32,
                 out_ptr: u32|
                 -> i32 {
                    let symbol = match Self::read_string(&mut caller, name_ptr, name_len) {
                        Ok(name) => name,
                        Err(code) => return code,
                    };
                    let slot = (slot != abi::NO_SLOT).then_some(slot as u32);
                    let request = Request::Dlsym {
                        handle,
                        symbol,
                        slot,
                    };
                    Self::dispatch(&mut caller, &request, |memory, response| match response {
                        Response::Symbol { address, index } => {
                            memory.write(out_ptr, &SymbolOut { address, index }.to_le_bytes())
                        }
                        _ => Ok(()),
                    })
                },
            )
            .map_err(|e| Error::Wasm(e.to_string()))?;

        linker
            .func_wrap(
                abi::MODULE,
                abi::DLSYM_CATCHUP,
                |mut caller: Caller<'_, HostState>,
                 handle: u32,
                 index: u32,
                 out_ptr: u32|
                 -> i32 {
                    let request = Request::DlsymCatchup { handle, index };
                    Self::dispatch(&mut caller, &request, |memory, response| match response {
                        Response::Address { address } => {
                            memory.write(out_ptr, &address.to_le_bytes())
                        }
                        _ => Ok(()),
                    })
                },
            )
            .map_err(|e| Error::Wasm(e.to_string()))?;

        linker
            .func_wrap(
                abi::MODULE,
                abi::DLCLOSE,
                |mut caller: Caller<'_, HostState>, handle: u32| -> i32 {
                    Self::dispatch(&mut caller, &Request::Dlclose { handle }, |_, _| Ok(()))
                },
            )
            .map_err(|e| Error::Wasm(e.to_string()))?;

        linker
            .func_wrap(
                abi::MODULE,
                abi::MEMCPY_BIG,
                |mut caller: Caller<'_, HostState>, dest: u32, src: u32, length: u32| -> i32 {
                    let request = Request::MemcpyBig { dest, src, length };
                    Self::dispatch(&mut caller, &request, |_, _| Ok(()))
                },
            )
            .map_err(|e| Error::Wasm(e.to_string()))?;

        linker
            .func_wrap(
                abi::MODULE,
                abi::NOTIFY_MEMORY_GROWTH,
                |mut caller: Caller<'_, HostState>, memory_index: u32| {
                    let request = Request::NotifyMemoryGrowth { memory_index };
                    Self::dispatch(&mut caller, &request, |_, _| Ok(()));
                },
            )
            .map_err(|e| Error::Wasm(e.to_string()))?;

        for (name, local) in [(abi::TIMEGM, false), (abi::MKTIME, true)] {
            linker
                .func_wrap(
                    abi::MODULE,
                    name,
                    move |mut caller: Caller<'_, HostState>, tm_ptr: u32, time_ptr: u32| -> i32 {
                        let tm = match Self::read_tm(&mut caller, tm_ptr) {
                            Ok(tm) => tm,
                            Err(code) => return code,
                        };
                        let request = if local {
                            Request::Mktime { tm }
                        } else {
                            Request::Timegm { tm }
                        };
                        Self::dispatch(&mut caller, &request, |memory, response| match response {
                            Response::Time { time, tm } => {
                                memory.write(tm_ptr, &tm.to_le_bytes())?;
                                memory.write(time_ptr, &time.to_le_bytes())
                            }
                            _ => Ok(()),
                        })
                    },
                )
                .map_err(|e| Error::Wasm(e.to_string()))?;
        }

        for (name, local) in [(abi::GMTIME, false), (abi::LOCALTIME, true)] {
            linker
                .func_wrap(
                    abi::MODULE,
                    name,
                    move |mut caller: Caller<'_, HostState>, time: i32, tm_ptr: u32| -> i32 {
                        let request = if local {
                            Request::Localtime { time }
                        } else {
                            Request::Gmtime { time }
                        };
                        Self::dispatch(&mut caller, &request, |memory, response| match response {
                            Response::Calendar { tm } => memory.write(tm_ptr, &tm.to_le_bytes()),
                            _ => Ok(()),
                        })
                    },
                )
                .map_err(|e| Error::Wasm(e.to_string()))?;
        }

        linker
            .func_wrap(
                abi::MODULE,
                abi::TZSET,
                |mut caller: Caller<'_, HostState>,
                 timezone_ptr: u32,
                 daylight_ptr: u32,
                 std_name_ptr: u32,
                 dst_name_ptr: u32|
                 -> i32 {
                    Self::dispatch(&mut caller, &Request::Tzset, |memory, response| {
                        match response {
                            Response::Timezone { info } => {
                                memory.write(timezone_ptr, &info.timezone.to_le_bytes())?;
                                let daylight = i32::from(info.daylight);
                                memory.write(daylight_ptr, &daylight.to_le_bytes())?;
                                let std_name = abi::encode_tz_name(&info.std_name);
                                memory.write(std_name_ptr, &std_name)?;
                                let dst_name = abi::encode_tz_name(&info.dst_name);
                                memory.write(dst_name_ptr, &dst_name)
                            }
                            _ => Ok(()),
                        }
                    })
                },
            )
            .map_err(|e| Error::Wasm(e.to_string()))?;

        linker
            .func_wrap(
                abi::MODULE,
                abi::GET_PROGNAME,
                |mut caller: Caller<'_, HostState>, buf_ptr: u32, buf_len: u32| -> i32 {
                    Self::dispatch(&mut caller, &Request::GetProgname, |memory, response| {
                        match response {
                            Response::Text { value } if buf_len > 0 => {
                                let len = value.len().min(buf_len as usize - 1);
                                let mut bytes = value.as_bytes()[..len].to_vec();
                                bytes.push(0);
                                memory.write(buf_ptr, &bytes)
                            }
                            _ => Ok(()),
                        }
                    })
                },
            )
            .map_err(|e| Error::Wasm(e.to_string()))?;

        linker
            .func_wrap(
                abi::MODULE,
                abi::GET_NOW_IS_MONOTONIC,
                |mut caller: Caller<'_, HostState>| -> i32 {
                    let mut monotonic = 0;
                    let code = Self::dispatch(
                        &mut caller,
                        &Request::GetNowIsMonotonic,
                        |_, response| {
                            if let Response::Flag { value: true } = response {
                                monotonic = 1;
                            }
                            Ok(())
                        },
                    );
                    if code < 0 {
                        code
                    } else {
                        monotonic
                    }
                },
            )
            .map_err(|e| Error::Wasm(e.to_string()))?;

        Ok(())
    }

    /// Run `request` through the host services and write its outputs.
    ///
    /// Returns `0` or `-errno`.
    fn dispatch<F>(caller: &mut Caller<'_, HostState>, request: &Request, write_back: F) -> i32
    where
        F: FnOnce(&mut dyn HostMemory, Response) -> CoreResult<()>,
    {
        let memory = match Self::get_memory(caller) {
            Ok(memory) => memory,
            Err(e) => {
                tracing::warn!("{}: {}", request.op_name(), e);
                return -errno::EINVAL;
            }
        };
        let services = caller.data().services.clone();
        let mut services = match services.lock() {
            Ok(guard) => guard,
            Err(_) => return -errno::EIO,
        };

        let mut guest = GuestMemory { caller, memory };
        let outcome = services
            .call(&mut guest, request)
            .and_then(|response| {
                write_back(&mut guest, response)
                    .map_err(|e| HostError::new(e.errno(), e.to_string()))
            });
        match outcome {
            Ok(()) => 0,
            Err(err) => {
                tracing::debug!("{} failed: {}", request.op_name(), err);
                -err.errno
            }
        }
    }

    /// Helper: Read a UTF-8 string from WASM memory, or `-errno`.
    fn read_string(
        caller: &mut Caller<'_, HostState>,
        ptr: u32,
        len: u32,
    ) -> std::result::Result<String, i32> {
        let bytes = Self::read_bytes(caller, ptr, len as usize)?;
        String::from_utf8(bytes).map_err(|_| -errno::EINVAL)
    }

    /// Helper: Read a `struct tm` from WASM memory, or `-errno`.
    fn read_tm(caller: &mut Caller<'_, HostState>, ptr: u32) -> std::result::Result<Tm, i32> {
        let bytes = Self::read_bytes(caller, ptr, Tm::SIZE)?;
        let mut raw = [0u8; Tm::SIZE];
        raw.copy_from_slice(&bytes);
        Ok(Tm::from_le_bytes(&raw))
    }

    fn read_bytes(
        caller: &mut Caller<'_, HostState>,
        ptr: u32,
        len: usize,
    ) -> std::result::Result<Vec<u8>, i32> {
        let memory = Self::get_memory(caller).map_err(|_| -errno::EINVAL)?;
        let mut buffer = vec![0u8; len];
        memory
            .read(&*caller, ptr as usize, &mut buffer)
            .map_err(|_| -errno::EINVAL)?;
        Ok(buffer)
    }

    /// Helper: Get memory export from WASM instance.
    fn get_memory(caller: &mut Caller<'_, HostState>) -> Result<Memory> {
        caller
            .get_export("memory")
            .and_then(|ext| ext.into_memory())
            .ok_or_else(|| Error::Wasm("Memory export not found".to_string()))
    }
}
