//! Built-in metric and record definitions.
//!
//! Each definition folds one [`TelemetryEvent`] into at most one
//! sample. Definitions are pure and independent; the dispatcher runs
//! every one of them against every event and isolates failures per
//! definition.

use std::collections::BTreeMap;

use anyhow::{bail, Context, Result};

use super::bucket;
use super::histogram::HistogramAggregate;
use super::recent::RecordEntry;
use super::table::DataTable;
use super::value::{FieldValue, MetricKind, MetricValue, ScalarAggregate};
use super::{service_entity_id, Granularity, MetricIdentity, MetricSample, Scope};
use crate::event::TelemetryEvent;
use crate::schema::model::{ColumnKind, Model};

/// Latency histogram bounds, in milliseconds.
pub const RESPONSE_TIME_STEPS: &[i64] = &[0, 10, 50, 100, 200, 500, 1000, 2000, 5000];

/// Record table keeping the slowest calls per service.
pub const TOP_SLOW_REQUEST: &str = "top_slow_request";
/// Metadata table registering entities on first sight.
pub const ENTITY_TRAFFIC: &str = "entity_traffic";

/// A metric derived from telemetry events.
pub struct MetricDef {
    pub name: &'static str,
    pub kind: MetricKind,
    pub scope: Scope,
    pub fold: fn(&TelemetryEvent) -> Result<Option<MetricSample>>,
}

/// One sample produced by a record definition.
#[derive(Debug, Clone)]
pub struct RecordSample {
    pub metric: &'static str,
    pub entity_id: String,
    pub entry: RecordEntry,
}

/// A record (individual sample) derived from telemetry events.
pub struct RecordDef {
    pub name: &'static str,
    pub scope: Scope,
    pub fold: fn(&TelemetryEvent) -> Result<Option<RecordSample>>,
}

/// All built-in metric definitions.
pub fn standard_metrics() -> &'static [MetricDef] {
    static DEFS: &[MetricDef] = &[
        MetricDef {
            name: "service_resp_time",
            kind: MetricKind::Scalar,
            scope: Scope::Service,
            fold: service_resp_time,
        },
        MetricDef {
            name: "service_cpm",
            kind: MetricKind::Scalar,
            scope: Scope::Service,
            fold: service_cpm,
        },
        MetricDef {
            name: "service_sla",
            kind: MetricKind::Scalar,
            scope: Scope::Service,
            fold: service_sla,
        },
        MetricDef {
            name: "service_percentile",
            kind: MetricKind::Histogram,
            scope: Scope::Service,
            fold: service_percentile,
        },
        MetricDef {
            name: "service_status_code",
            kind: MetricKind::Table,
            scope: Scope::Service,
            fold: service_status_code,
        },
        MetricDef {
            name: "endpoint_resp_time",
            kind: MetricKind::Scalar,
            scope: Scope::Endpoint,
            fold: endpoint_resp_time,
        },
        MetricDef {
            name: "endpoint_cpm",
            kind: MetricKind::Scalar,
            scope: Scope::Endpoint,
            fold: endpoint_cpm,
        },
        MetricDef {
            name: "all_percentile",
            kind: MetricKind::Histogram,
            scope: Scope::All,
            fold: all_percentile,
        },
    ];
    DEFS
}

/// All built-in record definitions.
pub fn standard_records() -> &'static [RecordDef] {
    static DEFS: &[RecordDef] =
        &[RecordDef { name: TOP_SLOW_REQUEST, scope: Scope::Service, fold: top_slow_request }];
    DEFS
}

/// Declared schemas for everything the catalog writes: each metric at
/// all three granularities, plus record and metadata tables.
pub fn standard_models() -> Vec<Model> {
    let mut models = Vec::new();
    for def in standard_metrics() {
        for granularity in [Granularity::Minute, Granularity::Hour, Granularity::Day] {
            models.push(Model::metric(def.name, def.kind, granularity));
        }
    }
    models.push(Model::record(
        TOP_SLOW_REQUEST,
        &[
            ("endpoint", ColumnKind::Text),
            ("latency", ColumnKind::Long),
            ("timestamp", ColumnKind::Long),
            ("status", ColumnKind::Long),
            ("success", ColumnKind::Long),
        ],
        true,
    ));
    models.push(Model::record(
        ENTITY_TRAFFIC,
        &[("name", ColumnKind::Text), ("normal", ColumnKind::Long), ("register_time", ColumnKind::Long)],
        false,
    ));
    models
}

/// Validates the identity-bearing fields and returns the event's
/// minute bucket.
fn event_bucket(event: &TelemetryEvent) -> Result<u64> {
    if event.service.is_empty() {
        bail!("event carries an empty service name");
    }
    bucket::minute_of_ms(event.timestamp_ms)
        .with_context(|| format!("event timestamp {} out of range", event.timestamp_ms))
}

fn service_identity(metric: &'static str, event: &TelemetryEvent) -> Result<MetricIdentity> {
    Ok(MetricIdentity {
        metric,
        scope: Scope::Service,
        entity_id: service_entity_id(&event.service, event.normal),
        time_bucket: event_bucket(event)?,
        granularity: Granularity::Minute,
    })
}

fn endpoint_identity(metric: &'static str, event: &TelemetryEvent) -> Result<Option<MetricIdentity>> {
    let Some(endpoint) = event.endpoint.as_deref() else {
        return Ok(None);
    };
    if endpoint.is_empty() {
        bail!("event carries an empty endpoint name");
    }
    let service = service_entity_id(&event.service, event.normal);
    Ok(Some(MetricIdentity {
        metric,
        scope: Scope::Endpoint,
        entity_id: super::endpoint_entity_id(&service, endpoint),
        time_bucket: event_bucket(event)?,
        granularity: Granularity::Minute,
    }))
}

fn service_resp_time(event: &TelemetryEvent) -> Result<Option<MetricSample>> {
    Ok(Some(MetricSample {
        identity: service_identity("service_resp_time", event)?,
        value: MetricValue::Scalar(ScalarAggregate::of(event.latency_ms)),
    }))
}

fn service_cpm(event: &TelemetryEvent) -> Result<Option<MetricSample>> {
    Ok(Some(MetricSample {
        identity: service_identity("service_cpm", event)?,
        value: MetricValue::Scalar(ScalarAggregate::of(1)),
    }))
}

fn service_sla(event: &TelemetryEvent) -> Result<Option<MetricSample>> {
    Ok(Some(MetricSample {
        identity: service_identity("service_sla", event)?,
        value: MetricValue::Scalar(ScalarAggregate::of(i64::from(event.success))),
    }))
}

fn service_percentile(event: &TelemetryEvent) -> Result<Option<MetricSample>> {
    Ok(Some(MetricSample {
        identity: service_identity("service_percentile", event)?,
        value: MetricValue::Histogram(HistogramAggregate::with_value(
            RESPONSE_TIME_STEPS.to_vec(),
            event.latency_ms,
        )?),
    }))
}

fn service_status_code(event: &TelemetryEvent) -> Result<Option<MetricSample>> {
    let mut table = DataTable::new();
    table.accumulate(&event.status.to_string(), 1);
    Ok(Some(MetricSample {
        identity: service_identity("service_status_code", event)?,
        value: MetricValue::Table(table),
    }))
}

fn endpoint_resp_time(event: &TelemetryEvent) -> Result<Option<MetricSample>> {
    Ok(endpoint_identity("endpoint_resp_time", event)?.map(|identity| MetricSample {
        identity,
        value: MetricValue::Scalar(ScalarAggregate::of(event.latency_ms)),
    }))
}

fn endpoint_cpm(event: &TelemetryEvent) -> Result<Option<MetricSample>> {
    Ok(endpoint_identity("endpoint_cpm", event)?.map(|identity| MetricSample {
        identity,
        value: MetricValue::Scalar(ScalarAggregate::of(1)),
    }))
}

fn all_percentile(event: &TelemetryEvent) -> Result<Option<MetricSample>> {
    Ok(Some(MetricSample {
        identity: MetricIdentity {
            metric: "all_percentile",
            scope: Scope::All,
            entity_id: "all".to_string(),
            time_bucket: event_bucket(event)?,
            granularity: Granularity::Minute,
        },
        value: MetricValue::Histogram(HistogramAggregate::with_value(
            RESPONSE_TIME_STEPS.to_vec(),
            event.latency_ms,
        )?),
    }))
}

fn top_slow_request(event: &TelemetryEvent) -> Result<Option<RecordSample>> {
    let time_bucket = event_bucket(event)?;
    let mut fields = BTreeMap::new();
    fields.insert(
        "endpoint".to_string(),
        FieldValue::Text(event.endpoint.clone().unwrap_or_default()),
    );
    fields.insert("latency".to_string(), FieldValue::Long(event.latency_ms));
    fields.insert("timestamp".to_string(), FieldValue::Long(event.timestamp_ms as i64));
    fields.insert("status".to_string(), FieldValue::Long(i64::from(event.status)));
    fields.insert("success".to_string(), FieldValue::Long(i64::from(event.success)));
    Ok(Some(RecordSample {
        metric: TOP_SLOW_REQUEST,
        entity_id: service_entity_id(&event.service, event.normal),
        entry: RecordEntry { time_bucket, rank: event.latency_ms, fields },
    }))
}
