//! Metric identities and aggregate values.
//!
//! Everything flowing through the pipeline is keyed by a
//! [`MetricIdentity`]: which metric, which entity, which time bucket,
//! at which granularity. Two samples with equal identities merge; all
//! other pairs stay independent.

pub mod bucket;
pub mod catalog;
pub mod histogram;
pub mod recent;
pub mod table;
pub mod value;

use value::MetricValue;

/// Aggregation scope of a metric entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Scope {
    /// Whole-deployment rollup.
    All,
    Service,
    ServiceInstance,
    Endpoint,
}

impl Scope {
    pub const fn as_str(self) -> &'static str {
        match self {
            Scope::All => "all",
            Scope::Service => "service",
            Scope::ServiceInstance => "service_instance",
            Scope::Endpoint => "endpoint",
        }
    }
}

/// Time resolution of one aggregated value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Granularity {
    Minute,
    Hour,
    Day,
}

impl Granularity {
    pub const fn as_str(self) -> &'static str {
        match self {
            Granularity::Minute => "minute",
            Granularity::Hour => "hour",
            Granularity::Day => "day",
        }
    }
}

/// Identity of one aggregated value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MetricIdentity {
    /// Logical metric name from the catalog.
    pub metric: &'static str,
    pub scope: Scope,
    pub entity_id: String,
    /// Bucket encoded per [`bucket`] for this granularity.
    pub time_bucket: u64,
    pub granularity: Granularity,
}

impl MetricIdentity {
    /// Storage row id: `<time_bucket>_<entity_id>`.
    pub fn storage_id(&self) -> String {
        format!("{}_{}", self.time_bucket, self.entity_id)
    }

    /// The same identity coarsened to another granularity.
    pub fn at(&self, granularity: Granularity) -> MetricIdentity {
        MetricIdentity {
            metric: self.metric,
            scope: self.scope,
            entity_id: self.entity_id.clone(),
            time_bucket: bucket::truncate(self.time_bucket, self.granularity, granularity),
            granularity,
        }
    }
}

/// One identity/value pair produced by a metric definition.
#[derive(Debug, Clone)]
pub struct MetricSample {
    pub identity: MetricIdentity,
    pub value: MetricValue,
}

/// Service entity id: the name plus a trailing `.1`/`.0` flag marking
/// whether the service was directly observed or only conjectured from
/// peer traffic.
pub fn service_entity_id(name: &str, normal: bool) -> String {
    format!("{name}.{}", u8::from(normal))
}

/// Splits a service entity id back into name and flag. The flag is the
/// last dot-separated segment, so names containing dots survive.
pub fn parse_service_entity_id(id: &str) -> Option<(&str, bool)> {
    let (name, flag) = id.rsplit_once('.')?;
    if name.is_empty() {
        return None;
    }
    match flag {
        "1" => Some((name, true)),
        "0" => Some((name, false)),
        _ => None,
    }
}

/// Instance entity id, owned by a service.
pub fn instance_entity_id(service_id: &str, instance: &str) -> String {
    format!("{service_id}_{instance}")
}

/// Endpoint entity id, owned by a service.
pub fn endpoint_entity_id(service_id: &str, endpoint: &str) -> String {
    format!("{service_id}_{endpoint}")
}
