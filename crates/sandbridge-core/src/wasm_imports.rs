//! Transport over the `env` imports, for programs running inside the sandbox.
//!
//! The imports are synchronous, so asynchronous requests are performed on
//! the spot and their completions queued until the next drain.

use crate::abi::{self, SymbolOut};
use crate::calendar::{TimezoneInfo, Tm};
use crate::error::errno;
use crate::memory::{checked_range, LinearMemory};
use crate::transport::{Completion, HostError, Request, RequestId, Response, Transport};
use crate::Result;

#[link(wasm_import_module = "env")]
extern "C" {
    fn _mmap_js(
        length: u32,
        prot: u32,
        flags: u32,
        fd: i32,
        offset: u32,
        allocated_ptr: *mut u32,
        addr_ptr: *mut u32,
    ) -> i32;
    fn _munmap_js(addr: u32, length: u32, prot: u32, flags: u32, fd: i32, offset: u32) -> i32;
    fn _msync_js(addr: u32, length: u32, prot: u32, flags: u32, fd: i32, offset: u32) -> i32;
    fn _dlopen_js(handle: u32, name_ptr: *const u8, name_len: u32) -> i32;
    fn _dlsym_js(
        handle: u32,
        name_ptr: *const u8,
        name_len: u32,
        slot: i32,
        out_ptr: *mut u8,
    ) -> i32;
    fn _dlsym_catchup_js(handle: u32, index: u32, out_ptr: *mut u32) -> i32;
    fn _dlclose_js(handle: u32) -> i32;
    fn emscripten_memcpy_big(dest: u32, src: u32, length: u32) -> i32;
    fn emscripten_notify_memory_growth(memory_index: u32);
    fn _timegm_js(tm_ptr: *mut u8, time_ptr: *mut i32) -> i32;
    fn _mktime_js(tm_ptr: *mut u8, time_ptr: *mut i32) -> i32;
    fn _gmtime_js(time: i32, tm_ptr: *mut u8) -> i32;
    fn _localtime_js(time: i32, tm_ptr: *mut u8) -> i32;
    fn _tzset_js(
        timezone_ptr: *mut i32,
        daylight_ptr: *mut i32,
        std_name_ptr: *mut u8,
        dst_name_ptr: *mut u8,
    ) -> i32;
    fn _emscripten_get_progname(buf_ptr: *mut u8, buf_len: u32) -> i32;
    fn _emscripten_get_now_is_monotonic() -> i32;
}

const PROGNAME_MAX: usize = 256;

fn status(op: &str, code: i32) -> std::result::Result<(), HostError> {
    if code < 0 {
        Err(HostError::new(-code, format!("{} failed", op)))
    } else {
        Ok(())
    }
}

/// [`Transport`] backed by the host's `env` imports.
#[derive(Debug, Default)]
pub struct ImportTransport {
    completions: Vec<Completion>,
}

impl ImportTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn time_call(
        op: &str,
        tm: &Tm,
        import: unsafe extern "C" fn(*mut u8, *mut i32) -> i32,
    ) -> std::result::Result<Response, HostError> {
        let mut buf = tm.to_le_bytes();
        let mut time = 0i32;
        // SAFETY: both pointers reference live locals of the sizes the import expects.
        status(op, unsafe { import(buf.as_mut_ptr(), &mut time) })?;
        Ok(Response::Time {
            time,
            tm: Tm::from_le_bytes(&buf),
        })
    }

    fn calendar_call(
        op: &str,
        time: i32,
        import: unsafe extern "C" fn(i32, *mut u8) -> i32,
    ) -> std::result::Result<Response, HostError> {
        let mut buf = [0u8; Tm::SIZE];
        // SAFETY: `buf` is a live `Tm::SIZE` byte buffer.
        status(op, unsafe { import(time, buf.as_mut_ptr()) })?;
        Ok(Response::Calendar {
            tm: Tm::from_le_bytes(&buf),
        })
    }
}

impl Transport for ImportTransport {
    fn call(&mut self, request: &Request) -> std::result::Result<Response, HostError> {
        // SAFETY (all blocks below): every pointer handed to an import refers
        // to a local buffer that outlives the call and has the size the
        // import contract in `abi` specifies.
        match request {
            Request::Map {
                length,
                prot,
                flags,
                fd,
                offset,
            } => {
                let mut allocated_length = 0u32;
                let mut addr = 0u32;
                let code = unsafe {
                    _mmap_js(
                        *length,
                        *prot,
                        *flags,
                        *fd,
                        *offset,
                        &mut allocated_length,
                        &mut addr,
                    )
                };
                status("mmap", code)?;
                Ok(Response::Mapped {
                    addr,
                    allocated_length,
                })
            }
            Request::Unmap {
                addr,
                length,
                prot,
                flags,
                fd,
                offset,
            } => {
                let code = unsafe { _munmap_js(*addr, *length, *prot, *flags, *fd, *offset) };
                status("munmap", code).map(|()| Response::Done)
            }
            Request::Sync {
                addr,
                length,
                prot,
                flags,
                fd,
                offset,
            } => {
                let code = unsafe { _msync_js(*addr, *length, *prot, *flags, *fd, *offset) };
                status("msync", code).map(|()| Response::Done)
            }
            Request::Dlopen { handle, identity } => {
                let code =
                    unsafe { _dlopen_js(*handle, identity.as_ptr(), identity.len() as u32) };
                status("dlopen", code).map(|()| Response::Loaded)
            }
            Request::Dlsym {
                handle,
                symbol,
                slot,
            } => {
                let mut out = [0u8; SymbolOut::SIZE];
                let slot = slot.map_or(abi::NO_SLOT, |s| s as i32);
                let code = unsafe {
                    _dlsym_js(
                        *handle,
                        symbol.as_ptr(),
                        symbol.len() as u32,
                        slot,
                        out.as_mut_ptr(),
                    )
                };
                if code == -errno::ENOENT {
                    return Err(HostError::new(errno::ENOENT, symbol.clone()));
                }
                status("dlsym", code)?;
                let out = SymbolOut::from_le_bytes(&out);
                Ok(Response::Symbol {
                    address: out.address,
                    index: out.index,
                })
            }
            Request::DlsymCatchup { handle, index } => {
                let mut address = 0u32;
                let code = unsafe { _dlsym_catchup_js(*handle, *index, &mut address) };
                status("dlsym_catchup", code)?;
                Ok(Response::Address { address })
            }
            Request::Dlclose { handle } => {
                let code = unsafe { _dlclose_js(*handle) };
                status("dlclose", code).map(|()| Response::Done)
            }
            Request::MemcpyBig { dest, src, length } => {
                let code = unsafe { emscripten_memcpy_big(*dest, *src, *length) };
                status("memcpy_big", code).map(|()| Response::Done)
            }
            Request::NotifyMemoryGrowth { memory_index } => {
                unsafe { emscripten_notify_memory_growth(*memory_index) };
                Ok(Response::Done)
            }
            Request::Timegm { tm } => Self::time_call("timegm", tm, _timegm_js),
            Request::Mktime { tm } => Self::time_call("mktime", tm, _mktime_js),
            Request::Gmtime { time } => Self::calendar_call("gmtime", *time, _gmtime_js),
            Request::Localtime { time } => {
                Self::calendar_call("localtime", *time, _localtime_js)
            }
            Request::Tzset => {
                let mut timezone = 0i32;
                let mut daylight = 0i32;
                let mut std_name = [0u8; abi::TZ_NAME_LEN];
                let mut dst_name = [0u8; abi::TZ_NAME_LEN];
                let code = unsafe {
                    _tzset_js(
                        &mut timezone,
                        &mut daylight,
                        std_name.as_mut_ptr(),
                        dst_name.as_mut_ptr(),
                    )
                };
                status("tzset", code)?;
                Ok(Response::Timezone {
                    info: TimezoneInfo {
                        timezone,
                        daylight: daylight != 0,
                        std_name: abi::decode_c_str(&std_name),
                        dst_name: abi::decode_c_str(&dst_name),
                    },
                })
            }
            Request::GetProgname => {
                let mut buf = [0u8; PROGNAME_MAX];
                let code =
                    unsafe { _emscripten_get_progname(buf.as_mut_ptr(), PROGNAME_MAX as u32) };
                status("get_progname", code)?;
                Ok(Response::Text {
                    value: abi::decode_c_str(&buf),
                })
            }
            Request::GetNowIsMonotonic => Ok(Response::Flag {
                value: unsafe { _emscripten_get_now_is_monotonic() } != 0,
            }),
        }
    }

    fn call_async(
        &mut self,
        id: RequestId,
        request: Request,
    ) -> std::result::Result<(), HostError> {
        let outcome = self.call(&request);
        self.completions.push(Completion { id, outcome });
        Ok(())
    }

    fn drain_completions(&mut self) -> Vec<Completion> {
        std::mem::take(&mut self.completions)
    }
}

/// The program's own linear memory (memory index 0).
#[derive(Debug, Default)]
pub struct OwnMemory;

impl LinearMemory for OwnMemory {
    fn size(&self) -> u32 {
        (core::arch::wasm32::memory_size(0) as u64 * 65536).min(u64::from(u32::MAX)) as u32
    }

    fn read(&self, addr: u32, buf: &mut [u8]) -> Result<()> {
        checked_range(self.size(), addr, buf.len())?;
        // SAFETY: the range lies inside linear memory, which is always mapped.
        unsafe {
            core::ptr::copy_nonoverlapping(addr as usize as *const u8, buf.as_mut_ptr(), buf.len())
        };
        Ok(())
    }

    fn write(&mut self, addr: u32, data: &[u8]) -> Result<()> {
        checked_range(self.size(), addr, data.len())?;
        // SAFETY: as for `read`; the caller owns the mapped range it writes.
        unsafe {
            core::ptr::copy_nonoverlapping(data.as_ptr(), addr as usize as *mut u8, data.len())
        };
        Ok(())
    }
}
