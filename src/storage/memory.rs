//! In-memory storage backend.
//!
//! Backs the `memory` storage mode and the test suites. Behaves like a
//! strict document store: writing to a unit that was never created is
//! an error, updates to unknown row ids are reported as per-row
//! failures rather than silently upserted.

use std::collections::BTreeMap;

use anyhow::{bail, Result};
use dashmap::DashMap;

use super::request::{WriteFailure, WriteOp, WriteOutcome, WriteRequest};
use crate::metric::value::FieldValue;
use crate::schema::model::ColumnSet;

type Row = BTreeMap<String, FieldValue>;

#[derive(Default)]
struct UnitState {
    schema: ColumnSet,
    rows: BTreeMap<String, Row>,
}

/// Thread-safe in-process unit store.
#[derive(Default)]
pub struct MemoryBackend {
    units: DashMap<String, UnitState>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn execute_write(&self, unit: &str, op: WriteOp, rows: &[WriteRequest]) -> Result<WriteOutcome> {
        let Some(mut state) = self.units.get_mut(unit) else {
            bail!("unknown unit {unit:?}");
        };
        let mut outcome = WriteOutcome::default();
        for row in rows {
            match op {
                WriteOp::Insert => {
                    state.rows.insert(row.id.clone(), row.fields.clone());
                    outcome.written += 1;
                }
                WriteOp::Update => match state.rows.get_mut(&row.id) {
                    Some(existing) => {
                        *existing = row.fields.clone();
                        outcome.written += 1;
                    }
                    None => outcome.failures.push(WriteFailure {
                        id: row.id.clone(),
                        reason: "row does not exist".to_string(),
                    }),
                },
            }
        }
        Ok(outcome)
    }

    pub fn query_schema(&self, unit: &str) -> Result<Option<ColumnSet>> {
        Ok(self.units.get(unit).map(|state| state.schema.clone()))
    }

    pub fn apply_schema_change(&self, unit: &str, added: &ColumnSet) -> Result<()> {
        let Some(mut state) = self.units.get_mut(unit) else {
            bail!("cannot alter unknown unit {unit:?}");
        };
        state.schema.extend(added.clone());
        Ok(())
    }

    pub fn create_or_roll_unit(&self, unit: &str, schema: &ColumnSet) -> Result<()> {
        let mut state = self.units.entry(unit.to_string()).or_default();
        state.schema.extend(schema.clone());
        Ok(())
    }

    pub fn delete_unit(&self, unit: &str) -> Result<()> {
        self.units.remove(unit);
        Ok(())
    }

    pub fn list_units(&self) -> Result<Vec<String>> {
        let mut names: Vec<_> = self.units.iter().map(|entry| entry.key().clone()).collect();
        names.sort();
        Ok(names)
    }

    /// Copy of one row, for inspection.
    pub fn row(&self, unit: &str, id: &str) -> Option<Row> {
        self.units.get(unit).and_then(|state| state.rows.get(id).cloned())
    }

    /// Sorted copy of a unit's rows, for inspection.
    pub fn unit_rows(&self, unit: &str) -> Option<Vec<(String, Row)>> {
        self.units
            .get(unit)
            .map(|state| state.rows.iter().map(|(id, row)| (id.clone(), row.clone())).collect())
    }

    pub fn row_count(&self, unit: &str) -> usize {
        self.units.get(unit).map(|state| state.rows.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::model::ColumnKind;

    fn schema() -> ColumnSet {
        let mut columns = ColumnSet::new();
        columns.insert("entity_id".to_string(), ColumnKind::Text);
        columns.insert("sum".to_string(), ColumnKind::Long);
        columns
    }

    fn row(id: &str, sum: i64) -> WriteRequest {
        let mut fields = BTreeMap::new();
        fields.insert("sum".to_string(), FieldValue::Long(sum));
        WriteRequest::insert("u-20240117".to_string(), id.to_string(), fields)
    }

    #[test]
    fn writes_require_an_existing_unit() {
        let backend = MemoryBackend::new();
        assert!(backend.execute_write("u-20240117", WriteOp::Insert, &[row("a", 1)]).is_err());

        backend.create_or_roll_unit("u-20240117", &schema()).unwrap();
        let outcome = backend.execute_write("u-20240117", WriteOp::Insert, &[row("a", 1)]).unwrap();
        assert_eq!(outcome.written, 1);
        assert!(outcome.failures.is_empty());
    }

    #[test]
    fn updates_of_missing_rows_fail_per_row() {
        let backend = MemoryBackend::new();
        backend.create_or_roll_unit("u-20240117", &schema()).unwrap();
        backend.execute_write("u-20240117", WriteOp::Insert, &[row("a", 1)]).unwrap();

        let outcome = backend
            .execute_write("u-20240117", WriteOp::Update, &[row("a", 5), row("ghost", 9)])
            .unwrap();
        assert_eq!(outcome.written, 1);
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].id, "ghost");
        assert_eq!(
            backend.row("u-20240117", "a").and_then(|r| r.get("sum").and_then(FieldValue::as_long)),
            Some(5)
        );
    }

    #[test]
    fn create_or_roll_is_idempotent_and_keeps_rows() {
        let backend = MemoryBackend::new();
        backend.create_or_roll_unit("u-20240117", &schema()).unwrap();
        backend.execute_write("u-20240117", WriteOp::Insert, &[row("a", 1)]).unwrap();
        backend.create_or_roll_unit("u-20240117", &schema()).unwrap();
        assert_eq!(backend.row_count("u-20240117"), 1);
    }

    #[test]
    fn schema_alter_extends_and_delete_is_idempotent() {
        let backend = MemoryBackend::new();
        backend.create_or_roll_unit("u-20240117", &schema()).unwrap();

        let mut added = ColumnSet::new();
        added.insert("dataset".to_string(), ColumnKind::Text);
        backend.apply_schema_change("u-20240117", &added).unwrap();
        let observed = backend.query_schema("u-20240117").unwrap().unwrap();
        assert!(observed.contains_key("dataset"));
        assert!(observed.contains_key("sum"));

        backend.delete_unit("u-20240117").unwrap();
        backend.delete_unit("u-20240117").unwrap();
        assert_eq!(backend.query_schema("u-20240117").unwrap(), None);
        assert!(backend.apply_schema_change("u-20240117", &added).is_err());
    }

    #[test]
    fn list_units_is_sorted() {
        let backend = MemoryBackend::new();
        backend.create_or_roll_unit("b-20240118", &schema()).unwrap();
        backend.create_or_roll_unit("a-20240117", &schema()).unwrap();
        assert_eq!(backend.list_units().unwrap(), vec!["a-20240117", "b-20240118"]);
    }
}
