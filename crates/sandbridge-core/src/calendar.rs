use serde::{Deserialize, Serialize};

/// Broken-down calendar time, field for field as C's `struct tm`.
///
/// Calendar values cross the boundary in this form so that no 64-bit
/// timestamp has to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tm {
    pub sec: i32,
    pub min: i32,
    pub hour: i32,
    pub mday: i32,
    /// Months since January, 0..=11.
    pub mon: i32,
    /// Years since 1900.
    pub year: i32,
    /// Days since Sunday, 0..=6.
    pub wday: i32,
    /// Days since January 1st, 0..=365.
    pub yday: i32,
    pub isdst: i32,
    /// Seconds east of UTC.
    pub gmtoff: i32,
}

impl Tm {
    /// Size of the in-memory layout (ten little-endian `i32`s).
    pub const SIZE: usize = 40;

    pub fn to_le_bytes(&self) -> [u8; Self::SIZE] {
        let fields = [
            self.sec,
            self.min,
            self.hour,
            self.mday,
            self.mon,
            self.year,
            self.wday,
            self.yday,
            self.isdst,
            self.gmtoff,
        ];
        let mut out = [0u8; Self::SIZE];
        for (chunk, field) in out.chunks_exact_mut(4).zip(fields) {
            chunk.copy_from_slice(&field.to_le_bytes());
        }
        out
    }

    pub fn from_le_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        let mut fields = [0i32; 10];
        for (field, chunk) in fields.iter_mut().zip(bytes.chunks_exact(4)) {
            *field = i32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
        Self {
            sec: fields[0],
            min: fields[1],
            hour: fields[2],
            mday: fields[3],
            mon: fields[4],
            year: fields[5],
            wday: fields[6],
            yday: fields[7],
            isdst: fields[8],
            gmtoff: fields[9],
        }
    }
}

/// Result of a `tzset` query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimezoneInfo {
    /// Seconds west of UTC, as C's `timezone` global.
    pub timezone: i32,
    pub daylight: bool,
    pub std_name: String,
    pub dst_name: String,
}
