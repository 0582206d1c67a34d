//! Metric value kinds and their merge/storage behavior.
//!
//! Every metric aggregates through [`MetricValue`]: scalars keep
//! sum/count/extremes, tables keep per-label sums, histograms keep
//! fixed-bound counts. Merge is commutative and associative for all
//! kinds, which is what lets hour and day values be folded
//! incrementally from minute increments instead of being recomputed
//! from raw events.

use std::collections::BTreeMap;

use anyhow::{bail, Context, Result};
use serde::Serialize;

use super::histogram::HistogramAggregate;
use super::table::DataTable;

/// Storage field names shared by every scalar metric row.
pub const FIELD_SUM: &str = "sum";
pub const FIELD_COUNT: &str = "count";
pub const FIELD_MAX: &str = "max";
pub const FIELD_MIN: &str = "min";
pub const FIELD_VALUE: &str = "value";
/// Storage field name for table and histogram payloads.
pub const FIELD_DATASET: &str = "dataset";

/// One primitive storage field.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    Long(i64),
    Double(f64),
    Text(String),
}

impl FieldValue {
    pub fn as_long(&self) -> Option<i64> {
        match self {
            FieldValue::Long(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_double(&self) -> Option<f64> {
        match self {
            FieldValue::Double(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(v) => Some(v),
            _ => None,
        }
    }
}

/// Scalar accumulator: running sum, observation count and extremes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScalarAggregate {
    pub sum: i64,
    pub count: i64,
    pub max: i64,
    pub min: i64,
}

impl ScalarAggregate {
    /// Aggregate of a single observation.
    pub fn of(value: i64) -> Self {
        Self { sum: value, count: 1, max: value, min: value }
    }

    pub fn merge(&mut self, other: &ScalarAggregate) {
        self.sum += other.sum;
        self.count += other.count;
        self.max = self.max.max(other.max);
        self.min = self.min.min(other.min);
    }

    /// Integer average, zero when nothing has been observed.
    pub fn avg(&self) -> i64 {
        if self.count == 0 {
            0
        } else {
            self.sum / self.count
        }
    }
}

/// The value kinds a metric definition can declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricKind {
    Scalar,
    Table,
    Histogram,
}

impl MetricKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            MetricKind::Scalar => "scalar",
            MetricKind::Table => "table",
            MetricKind::Histogram => "histogram",
        }
    }
}

/// A mergeable metric value of one of the supported kinds.
#[derive(Debug, Clone, PartialEq)]
pub enum MetricValue {
    Scalar(ScalarAggregate),
    Table(DataTable),
    Histogram(HistogramAggregate),
}

impl MetricValue {
    pub fn kind(&self) -> MetricKind {
        match self {
            MetricValue::Scalar(_) => MetricKind::Scalar,
            MetricValue::Table(_) => MetricKind::Table,
            MetricValue::Histogram(_) => MetricKind::Histogram,
        }
    }

    /// Merges another value of the same kind into this one. A kind
    /// mismatch means two definitions collided on one identity and is
    /// reported as an error rather than silently coerced.
    pub fn merge(&mut self, other: &MetricValue) -> Result<()> {
        match (self, other) {
            (MetricValue::Scalar(a), MetricValue::Scalar(b)) => {
                a.merge(b);
                Ok(())
            }
            (MetricValue::Table(a), MetricValue::Table(b)) => {
                a.merge(b);
                Ok(())
            }
            (MetricValue::Histogram(a), MetricValue::Histogram(b)) => a.merge(b),
            (a, b) => bail!("cannot merge {} into {}", b.kind().as_str(), a.kind().as_str()),
        }
    }

    /// Folds a set of finer-granularity values into one coarser value.
    /// Returns `None` for an empty input.
    pub fn downsample_of<'a>(
        values: impl IntoIterator<Item = &'a MetricValue>,
    ) -> Result<Option<MetricValue>> {
        let mut iter = values.into_iter();
        let Some(first) = iter.next() else {
            return Ok(None);
        };
        let mut folded = first.clone();
        for value in iter {
            folded.merge(value)?;
        }
        Ok(Some(folded))
    }

    /// Serializes to named storage fields. Scalars also emit the
    /// derived `value` column so dashboards can query the average
    /// without computing it.
    pub fn serialize(&self) -> BTreeMap<String, FieldValue> {
        let mut fields = BTreeMap::new();
        match self {
            MetricValue::Scalar(s) => {
                fields.insert(FIELD_SUM.to_string(), FieldValue::Long(s.sum));
                fields.insert(FIELD_COUNT.to_string(), FieldValue::Long(s.count));
                fields.insert(FIELD_MAX.to_string(), FieldValue::Long(s.max));
                fields.insert(FIELD_MIN.to_string(), FieldValue::Long(s.min));
                fields.insert(FIELD_VALUE.to_string(), FieldValue::Long(s.avg()));
            }
            MetricValue::Table(t) => {
                fields.insert(FIELD_DATASET.to_string(), FieldValue::Text(t.to_storage()));
            }
            MetricValue::Histogram(h) => {
                fields.insert(FIELD_DATASET.to_string(), FieldValue::Text(h.to_dataset()));
            }
        }
        fields
    }

    /// Rebuilds a value from storage fields. The kind comes from the
    /// owning metric definition since table and histogram rows share
    /// the dataset column.
    pub fn deserialize(kind: MetricKind, fields: &BTreeMap<String, FieldValue>) -> Result<MetricValue> {
        let long = |name: &str| -> Result<i64> {
            fields
                .get(name)
                .and_then(FieldValue::as_long)
                .with_context(|| format!("missing long field {name:?}"))
        };
        let text = |name: &str| -> Result<&str> {
            fields
                .get(name)
                .and_then(FieldValue::as_text)
                .with_context(|| format!("missing text field {name:?}"))
        };
        match kind {
            MetricKind::Scalar => Ok(MetricValue::Scalar(ScalarAggregate {
                sum: long(FIELD_SUM)?,
                count: long(FIELD_COUNT)?,
                max: long(FIELD_MAX)?,
                min: long(FIELD_MIN)?,
            })),
            MetricKind::Table => Ok(MetricValue::Table(DataTable::from_storage(text(
                FIELD_DATASET,
            )?)?)),
            MetricKind::Histogram => Ok(MetricValue::Histogram(HistogramAggregate::from_dataset(
                text(FIELD_DATASET)?,
            )?)),
        }
    }
}
