//! Raw import surface shared by the sandboxed program and the host linker.
//!
//! Every import returns `0` on success or `-errno` on failure unless noted.
//! Pointers are linear-memory offsets; multi-byte values are little endian.
//!
//! | import | parameters | result |
//! |---|---|---|
//! | `_mmap_js` | `length, prot, flags, fd, offset, allocated_ptr, addr_ptr` | status; writes `u32` allocated length and base |
//! | `_munmap_js` | `addr, length, prot, flags, fd, offset` | status |
//! | `_msync_js` | `addr, length, prot, flags, fd, offset` | status |
//! | `_dlopen_js` | `handle, name_ptr, name_len` | status |
//! | `_dlsym_js` | `handle, name_ptr, name_len, slot, out_ptr` | status; writes [`SymbolOut`] |
//! | `_dlsym_catchup_js` | `handle, index, out_ptr` | status; writes `u32` address |
//! | `_dlclose_js` | `handle` | status |
//! | `emscripten_memcpy_big` | `dest, src, length` | status |
//! | `emscripten_notify_memory_growth` | `memory_index` | none |
//! | `_timegm_js` / `_mktime_js` | `tm_ptr, time_ptr` | status; normalises `tm`, writes `i32` time |
//! | `_gmtime_js` / `_localtime_js` | `time, tm_ptr` | status |
//! | `_tzset_js` | `timezone_ptr, daylight_ptr, std_name_ptr, dst_name_ptr` | status |
//! | `_emscripten_get_progname` | `buf_ptr, buf_len` | status; NUL-terminated, truncated |
//! | `_emscripten_get_now_is_monotonic` | | `1` or `0` |

/// Import module every function lives in.
pub const MODULE: &str = "env";

pub const MMAP: &str = "_mmap_js";
pub const MUNMAP: &str = "_munmap_js";
pub const MSYNC: &str = "_msync_js";
pub const DLOPEN: &str = "_dlopen_js";
pub const DLSYM: &str = "_dlsym_js";
pub const DLSYM_CATCHUP: &str = "_dlsym_catchup_js";
pub const DLCLOSE: &str = "_dlclose_js";
pub const MEMCPY_BIG: &str = "emscripten_memcpy_big";
pub const NOTIFY_MEMORY_GROWTH: &str = "emscripten_notify_memory_growth";
pub const TIMEGM: &str = "_timegm_js";
pub const MKTIME: &str = "_mktime_js";
pub const GMTIME: &str = "_gmtime_js";
pub const LOCALTIME: &str = "_localtime_js";
pub const TZSET: &str = "_tzset_js";
pub const GET_PROGNAME: &str = "_emscripten_get_progname";
pub const GET_NOW_IS_MONOTONIC: &str = "_emscripten_get_now_is_monotonic";

/// `slot` value meaning "no slot requested".
pub const NO_SLOT: i32 = -1;

/// Size of each timezone name buffer, NUL included.
pub const TZ_NAME_LEN: usize = 16;

/// Out-parameter of `_dlsym_js`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SymbolOut {
    pub address: u32,
    pub index: u32,
}

impl SymbolOut {
    pub const SIZE: usize = 8;

    pub fn to_le_bytes(self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[..4].copy_from_slice(&self.address.to_le_bytes());
        out[4..].copy_from_slice(&self.index.to_le_bytes());
        out
    }

    pub fn from_le_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        Self {
            address: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            index: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
        }
    }
}

/// Encode a timezone name into its fixed buffer, truncating if needed.
pub fn encode_tz_name(name: &str) -> [u8; TZ_NAME_LEN] {
    let mut buf = [0u8; TZ_NAME_LEN];
    let len = name.len().min(TZ_NAME_LEN - 1);
    buf[..len].copy_from_slice(&name.as_bytes()[..len]);
    buf
}

/// Decode a NUL-terminated name buffer.
pub fn decode_c_str(buf: &[u8]) -> String {
    let end = buf.iter().position(|b| *b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}
