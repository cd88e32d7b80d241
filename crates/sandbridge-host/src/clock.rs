//! Calendar conversions behind the time imports.

use chrono::{
    DateTime, Datelike, FixedOffset, NaiveDate, NaiveDateTime, TimeDelta, TimeZone, Timelike, Utc,
};
use sandbridge_core::{errno, HostError, TimezoneInfo, Tm};

fn overflow(what: &str) -> HostError {
    HostError::new(errno::EOVERFLOW, format!("{} out of range", what))
}

/// Interpret `tm` as wall-clock fields, carrying out-of-range values over.
fn to_naive(tm: &Tm) -> Result<NaiveDateTime, HostError> {
    let months = i64::from(tm.year) * 12 + i64::from(tm.mon);
    let year = i32::try_from(months.div_euclid(12) + 1900).map_err(|_| overflow("year"))?;
    let month = months.rem_euclid(12) as u32 + 1;
    let start = NaiveDate::from_ymd_opt(year, month, 1)
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .ok_or_else(|| overflow("date"))?;
    let seconds = (i64::from(tm.mday) - 1) * 86400
        + i64::from(tm.hour) * 3600
        + i64::from(tm.min) * 60
        + i64::from(tm.sec);
    start
        .checked_add_signed(TimeDelta::seconds(seconds))
        .ok_or_else(|| overflow("date"))
}

fn to_epoch(seconds: i64) -> Result<i32, HostError> {
    i32::try_from(seconds).map_err(|_| overflow("time"))
}

fn fields<Tz: TimeZone>(time: &DateTime<Tz>, gmtoff: i32) -> Tm {
    Tm {
        sec: time.second() as i32,
        min: time.minute() as i32,
        hour: time.hour() as i32,
        mday: time.day() as i32,
        mon: time.month0() as i32,
        year: time.year() - 1900,
        wday: time.weekday().num_days_from_sunday() as i32,
        yday: time.ordinal0() as i32,
        isdst: 0,
        gmtoff,
    }
}

fn zone(offset_secs: i32) -> Result<FixedOffset, HostError> {
    FixedOffset::east_opt(offset_secs).ok_or_else(|| overflow("timezone offset"))
}

/// Broken-down UTC time to epoch seconds.
pub fn timegm(tm: &Tm) -> Result<(i32, Tm), HostError> {
    let naive = to_naive(tm)?;
    let time = to_epoch(Utc.from_utc_datetime(&naive).timestamp())?;
    Ok((time, gmtime(time)?))
}

/// Broken-down local time to epoch seconds.
pub fn mktime(tm: &Tm, offset_secs: i32) -> Result<(i32, Tm), HostError> {
    let naive = to_naive(tm)?;
    let utc = Utc.from_utc_datetime(&naive).timestamp() - i64::from(offset_secs);
    let time = to_epoch(utc)?;
    Ok((time, localtime(time, offset_secs)?))
}

pub fn gmtime(time: i32) -> Result<Tm, HostError> {
    let utc = Utc
        .timestamp_opt(i64::from(time), 0)
        .single()
        .ok_or_else(|| overflow("time"))?;
    Ok(fields(&utc, 0))
}

pub fn localtime(time: i32, offset_secs: i32) -> Result<Tm, HostError> {
    let local = zone(offset_secs)?
        .timestamp_opt(i64::from(time), 0)
        .single()
        .ok_or_else(|| overflow("time"))?;
    Ok(fields(&local, offset_secs))
}

/// Timezone description for a fixed offset east of UTC.
pub fn tzset(offset_secs: i32) -> TimezoneInfo {
    let name = if offset_secs == 0 {
        "UTC".to_string()
    } else {
        let sign = if offset_secs < 0 { '-' } else { '+' };
        let abs = offset_secs.unsigned_abs();
        format!("UTC{}{:02}{:02}", sign, abs / 3600, abs % 3600 / 60)
    };
    TimezoneInfo {
        timezone: -offset_secs,
        daylight: false,
        std_name: name.clone(),
        dst_name: name,
    }
}
