//! Declared table schemas.

use std::collections::BTreeMap;

use anyhow::{bail, Result};

use super::naming;
use crate::metric::value::{
    MetricKind, FIELD_COUNT, FIELD_DATASET, FIELD_MAX, FIELD_MIN, FIELD_SUM, FIELD_VALUE,
};
use crate::metric::Granularity;

/// Column shared by every row: owning entity.
pub const COLUMN_ENTITY_ID: &str = "entity_id";
/// Column shared by every row: time bucket at the table's granularity.
pub const COLUMN_TIME_BUCKET: &str = "time_bucket";
/// Discriminator column rows carry inside merged units.
pub const COLUMN_METRIC_TABLE: &str = "metric_table";

/// Storage column kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColumnKind {
    Long,
    Double,
    Text,
}

impl ColumnKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            ColumnKind::Long => "long",
            ColumnKind::Double => "double",
            ColumnKind::Text => "text",
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "long" => Ok(ColumnKind::Long),
            "double" => Ok(ColumnKind::Double),
            "text" => Ok(ColumnKind::Text),
            other => bail!("unknown column kind {other:?}"),
        }
    }
}

/// Set of named columns, sorted for stable diffing.
pub type ColumnSet = BTreeMap<String, ColumnKind>;

/// Declared schema of one logical table.
#[derive(Debug, Clone)]
pub struct Model {
    /// Logical table name, already granularity-suffixed.
    pub name: String,
    pub granularity: Granularity,
    /// Declared columns, shared ones included.
    pub columns: ColumnSet,
    /// Record tables keep individual samples instead of aggregates.
    pub record: bool,
    /// High-volume record tables exempt from unit merging and
    /// compression.
    pub super_dataset: bool,
}

impl Model {
    /// Schema of a metric table at one granularity. Columns follow the
    /// metric's value kind.
    pub fn metric(metric: &'static str, kind: MetricKind, granularity: Granularity) -> Model {
        let mut columns = shared_columns();
        match kind {
            MetricKind::Scalar => {
                for name in [FIELD_SUM, FIELD_COUNT, FIELD_MAX, FIELD_MIN, FIELD_VALUE] {
                    columns.insert(name.to_string(), ColumnKind::Long);
                }
            }
            MetricKind::Table | MetricKind::Histogram => {
                columns.insert(FIELD_DATASET.to_string(), ColumnKind::Text);
            }
        }
        Model {
            name: naming::logical_table_name(metric, granularity),
            granularity,
            columns,
            record: false,
            super_dataset: false,
        }
    }

    /// Schema of a record table. Records exist at minute granularity
    /// only and always get a dedicated unit family.
    pub fn record(name: &str, extra: &[(&str, ColumnKind)], super_dataset: bool) -> Model {
        let mut columns = shared_columns();
        for (column, kind) in extra {
            columns.insert((*column).to_string(), *kind);
        }
        Model {
            name: name.to_string(),
            granularity: Granularity::Minute,
            columns,
            record: true,
            super_dataset,
        }
    }

    /// Whether rows of this table share the merged unit family.
    pub fn merged(&self) -> bool {
        !self.record
    }

    /// Columns as they must exist on the physical unit. Merged tables
    /// additionally need the discriminator column.
    pub fn storage_columns(&self) -> ColumnSet {
        let mut columns = self.columns.clone();
        if self.merged() {
            columns.insert(COLUMN_METRIC_TABLE.to_string(), ColumnKind::Text);
        }
        columns
    }

    /// Physical unit name holding this table's rows for a day.
    pub fn unit_for_day(&self, day: u64, step_days: u32) -> String {
        naming::unit_name(&self.name, day, step_days, self.merged())
    }
}

fn shared_columns() -> ColumnSet {
    let mut columns = ColumnSet::new();
    columns.insert(COLUMN_ENTITY_ID.to_string(), ColumnKind::Text);
    columns.insert(COLUMN_TIME_BUCKET.to_string(), ColumnKind::Long);
    columns
}
