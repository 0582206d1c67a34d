//! Time bucket arithmetic.
//!
//! All aggregation windows are encoded as UTC integer buckets: minute
//! buckets are `yyyyMMddHHmm`, hour buckets `yyyyMMddHH`, day buckets
//! `yyyyMMdd`. Coarsening is integer division, so ordering comparisons
//! stay valid across granularities, but offset arithmetic has to round
//! trip through calendar time (minute 1700 - 1 is 1659, not 1699).

use chrono::{DateTime, Datelike, Days, Duration, NaiveDate, TimeZone, Timelike, Utc};

use super::Granularity;

/// Minute bucket for a unix-epoch millisecond timestamp.
///
/// Returns `None` when the timestamp is outside the representable
/// calendar range, which callers treat as a malformed event.
pub fn minute_of_ms(timestamp_ms: u64) -> Option<u64> {
    let ms = i64::try_from(timestamp_ms).ok()?;
    let at = Utc.timestamp_millis_opt(ms).single()?;
    Some(
        at.year() as u64 * 100_000_000
            + at.month() as u64 * 1_000_000
            + at.day() as u64 * 10_000
            + at.hour() as u64 * 100
            + at.minute() as u64,
    )
}

/// Truncates a bucket to a coarser granularity. Truncating to the same
/// granularity is the identity; finer targets are not meaningful and
/// return the input unchanged.
pub fn truncate(bucket: u64, from: Granularity, to: Granularity) -> u64 {
    match (from, to) {
        (Granularity::Minute, Granularity::Hour) => bucket / 100,
        (Granularity::Minute, Granularity::Day) => bucket / 10_000,
        (Granularity::Hour, Granularity::Day) => bucket / 100,
        _ => bucket,
    }
}

/// Day bucket (`yyyyMMdd`) containing the given bucket.
pub fn day_of(bucket: u64, granularity: Granularity) -> u64 {
    truncate(bucket, granularity, Granularity::Day)
}

/// Shifts a bucket by a signed number of its own granularity units,
/// carrying across hour/day/month boundaries.
pub fn bucket_add(bucket: u64, granularity: Granularity, delta: i64) -> Option<u64> {
    match granularity {
        Granularity::Minute => {
            let at = minute_to_datetime(bucket)?.checked_add_signed(Duration::minutes(delta))?;
            minute_of_ms(u64::try_from(at.timestamp_millis()).ok()?)
        }
        Granularity::Hour => {
            let at = minute_to_datetime(bucket * 100)?.checked_add_signed(Duration::hours(delta))?;
            Some(minute_of_ms(u64::try_from(at.timestamp_millis()).ok()?)? / 100)
        }
        Granularity::Day => day_add(bucket, delta),
    }
}

/// Shifts a day bucket by a signed number of days.
pub fn day_add(day: u64, delta: i64) -> Option<u64> {
    let date = day_to_date(day)?;
    let shifted = if delta >= 0 {
        date.checked_add_days(Days::new(delta as u64))?
    } else {
        date.checked_sub_days(Days::new(delta.unsigned_abs()))?
    };
    Some(date_to_day(shifted))
}

/// Calendar date for a `yyyyMMdd` day bucket.
pub fn day_to_date(day: u64) -> Option<NaiveDate> {
    NaiveDate::from_ymd_opt((day / 10_000) as i32, (day / 100 % 100) as u32, (day % 100) as u32)
}

/// `yyyyMMdd` day bucket for a calendar date.
pub fn date_to_day(date: NaiveDate) -> u64 {
    date.year() as u64 * 10_000 + date.month() as u64 * 100 + date.day() as u64
}

/// Day bucket for the current UTC date.
pub fn today_utc() -> u64 {
    date_to_day(Utc::now().date_naive())
}

fn minute_to_datetime(minute: u64) -> Option<DateTime<Utc>> {
    let date = day_to_date(minute / 10_000)?;
    let time = date.and_hms_opt((minute / 100 % 100) as u32, (minute % 100) as u32, 0)?;
    Some(Utc.from_utc_datetime(&time))
}
