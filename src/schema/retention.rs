//! Retention and compression planning.
//!
//! Pure planners over unit names: given the current day they decide
//! which units are past their TTL and which old per-day units should
//! collapse onto coarser boundaries. Execution stays in the schema
//! manager so the plans remain trivially testable.

use super::naming;
use crate::metric::bucket;

/// Latest day bucket that is already expired: `today - ttl_days`.
/// Units dated at or before the cutoff are eligible for deletion.
pub fn delete_cutoff(today: u64, ttl_days: u32) -> Option<u64> {
    bucket::day_add(today, -i64::from(ttl_days))
}

/// Unit names whose embedded day is at or before the TTL cutoff.
/// Names without an embedded day are never eligible.
pub fn expired_units<'a>(
    units: impl IntoIterator<Item = &'a str>,
    ttl_days: u32,
    today: u64,
) -> Vec<String> {
    let Some(cutoff) = delete_cutoff(today, ttl_days) else {
        return Vec::new();
    };
    units
        .into_iter()
        .filter(|name| naming::unit_day(name).is_some_and(|day| day <= cutoff))
        .map(str::to_string)
        .collect()
}

/// Planned collapse of one source unit onto its boundary target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompressionStep {
    pub source: String,
    pub target: String,
}

/// Plans boundary collapses for units older than
/// `compress_after_days`. Units already sitting on a boundary map to
/// themselves and are skipped, which is what makes replanning after a
/// partial run a no-op.
pub fn compression_plan<'a>(
    units: impl IntoIterator<Item = &'a str>,
    compress_after_days: u32,
    step_days: u32,
    today: u64,
) -> Vec<CompressionStep> {
    if step_days <= 1 {
        return Vec::new();
    }
    let Some(cutoff) = bucket::day_add(today, -i64::from(compress_after_days)) else {
        return Vec::new();
    };
    let mut plan = Vec::new();
    for name in units {
        let Some(day) = naming::unit_day(name) else {
            continue;
        };
        if day > cutoff {
            continue;
        }
        let boundary = naming::compress_day_bucket(day, step_days);
        if boundary == day {
            continue;
        }
        let Some(family) = naming::unit_family(name) else {
            continue;
        };
        plan.push(CompressionStep {
            source: name.to_string(),
            target: format!("{family}-{boundary}"),
        });
    }
    plan
}
