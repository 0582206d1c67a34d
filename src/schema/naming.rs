//! Physical unit naming.
//!
//! Unit names are pure functions of the logical table, the day bucket
//! and the rollover step. Nothing in here consults a clock or mutates
//! state, so writers and readers derive identical names for the same
//! bucket no matter when they run.
//!
//! Merged metric tables share one dated unit family
//! (`metrics-all-20240117`) and rows carry a `metric_table`
//! discriminator column; records and other dedicated tables get their
//! own family (`top_slow_request-20240117`).

use crate::metric::Granularity;

/// Unit family shared by merged metric tables.
pub const MERGED_UNIT_PREFIX: &str = "metrics-all";

/// Number of digits in an embedded day bucket.
const DAY_DIGITS: usize = 8;

/// Logical table name for a metric at a granularity. Minute is the
/// base name; hour and day get a suffix.
pub fn logical_table_name(metric: &str, granularity: Granularity) -> String {
    match granularity {
        Granularity::Minute => metric.to_string(),
        Granularity::Hour => format!("{metric}_hour"),
        Granularity::Day => format!("{metric}_day"),
    }
}

/// Collapses a day bucket onto its rollover boundary: with a step of N
/// days, days 1..=N of a month map to day 1, days N+1..=2N to day N+1,
/// and so on. A step of one (or zero) is the identity. The function is
/// idempotent, so re-compressing an already compressed bucket is a
/// no-op.
pub fn compress_day_bucket(day: u64, step_days: u32) -> u64 {
    if step_days <= 1 {
        return day;
    }
    let step = step_days as u64;
    let day_of_month = day % 100;
    let compressed = (day_of_month - 1) / step * step + 1;
    day - day_of_month + compressed
}

/// Physical unit name for a logical table and day bucket.
pub fn unit_name(logical: &str, day_bucket: u64, step_days: u32, merged: bool) -> String {
    let day = compress_day_bucket(day_bucket, step_days);
    if merged {
        format!("{MERGED_UNIT_PREFIX}-{day}")
    } else {
        format!("{logical}-{day}")
    }
}

/// Day bucket embedded in a unit name, `None` when the name does not
/// end in `-yyyyMMdd`.
pub fn unit_day(name: &str) -> Option<u64> {
    let (_, suffix) = name.rsplit_once('-')?;
    if suffix.len() != DAY_DIGITS || !suffix.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    suffix.parse().ok()
}

/// Unit family (everything before the embedded day), `None` when the
/// name carries no day.
pub fn unit_family(name: &str) -> Option<&str> {
    unit_day(name)?;
    name.rsplit_once('-').map(|(family, _)| family)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compression_maps_days_onto_step_boundaries() {
        assert_eq!(compress_day_bucket(20000105, 11), 20000101);
        assert_eq!(compress_day_bucket(20000111, 11), 20000101);
        assert_eq!(compress_day_bucket(20000112, 11), 20000112);
        assert_eq!(compress_day_bucket(20000122, 11), 20000112);
        assert_eq!(compress_day_bucket(20000123, 11), 20000123);
        assert_eq!(compress_day_bucket(20000131, 11), 20000123);
    }

    #[test]
    fn compression_is_idempotent() {
        for day in 20000101..=20000131 {
            let once = compress_day_bucket(day, 11);
            assert_eq!(compress_day_bucket(once, 11), once);
        }
    }

    #[test]
    fn step_of_one_is_identity() {
        assert_eq!(compress_day_bucket(20240117, 1), 20240117);
        assert_eq!(compress_day_bucket(20240117, 0), 20240117);
    }

    #[test]
    fn merged_and_dedicated_unit_names() {
        assert_eq!(unit_name("service_resp_time", 20240117, 1, true), "metrics-all-20240117");
        assert_eq!(
            unit_name("top_slow_request", 20240117, 1, false),
            "top_slow_request-20240117"
        );
        // Same inputs, same name: no hidden clock involved.
        assert_eq!(
            unit_name("service_resp_time", 20240117, 1, true),
            unit_name("service_resp_time", 20240117, 1, true)
        );
    }

    #[test]
    fn unit_names_apply_the_rollover_step() {
        assert_eq!(unit_name("x", 20000122, 11, false), "x-20000112");
    }

    #[test]
    fn logical_names_carry_granularity_suffixes() {
        assert_eq!(logical_table_name("service_cpm", Granularity::Minute), "service_cpm");
        assert_eq!(logical_table_name("service_cpm", Granularity::Hour), "service_cpm_hour");
        assert_eq!(logical_table_name("service_cpm", Granularity::Day), "service_cpm_day");
    }

    #[test]
    fn unit_day_parses_only_well_formed_names() {
        assert_eq!(unit_day("metrics-all-20240117"), Some(20240117));
        assert_eq!(unit_day("top_slow_request-20240117"), Some(20240117));
        assert_eq!(unit_day("metrics-all"), None);
        assert_eq!(unit_day("metrics-all-2024011"), None);
        assert_eq!(unit_day("metrics-all-2024011x"), None);
        assert_eq!(unit_family("metrics-all-20240117"), Some("metrics-all"));
        assert_eq!(unit_family("plain"), None);
    }
}
