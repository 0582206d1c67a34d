//! Backend-agnostic write requests.

use std::collections::BTreeMap;

use crate::metric::value::FieldValue;

/// Kind of write against a physical unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WriteOp {
    /// First persistence of a row id.
    Insert,
    /// Full-row overwrite of a previously inserted id.
    Update,
}

impl WriteOp {
    pub const fn as_str(self) -> &'static str {
        match self {
            WriteOp::Insert => "insert",
            WriteOp::Update => "update",
        }
    }
}

/// One prepared write. `additional` carries piggybacked rows (such as
/// first-sight entity registrations) that must travel through the
/// queue with their primary row; the queue flattens them into the
/// batch before grouping.
#[derive(Debug, Clone)]
pub struct WriteRequest {
    /// Physical unit the row belongs to.
    pub unit: String,
    pub op: WriteOp,
    /// Row id, unique within the unit.
    pub id: String,
    pub fields: BTreeMap<String, FieldValue>,
    pub additional: Vec<WriteRequest>,
}

impl WriteRequest {
    pub fn insert(unit: String, id: String, fields: BTreeMap<String, FieldValue>) -> Self {
        Self { unit, op: WriteOp::Insert, id, fields, additional: Vec::new() }
    }

    pub fn update(unit: String, id: String, fields: BTreeMap<String, FieldValue>) -> Self {
        Self { unit, op: WriteOp::Update, id, fields, additional: Vec::new() }
    }

    pub fn with_additional(mut self, request: WriteRequest) -> Self {
        self.additional.push(request);
        self
    }

    /// Splits the request into standalone rows: itself first, then every
    /// nested additional row. Each returned request has no additionals
    /// left.
    pub fn into_flattened(self) -> Vec<WriteRequest> {
        let mut out = Vec::with_capacity(1 + self.additional.len());
        flatten_into(self, &mut out);
        out
    }
}

fn flatten_into(mut request: WriteRequest, out: &mut Vec<WriteRequest>) {
    let additional = std::mem::take(&mut request.additional);
    out.push(request);
    for nested in additional {
        flatten_into(nested, out);
    }
}

/// Per-row failure inside an otherwise delivered group.
#[derive(Debug, Clone)]
pub struct WriteFailure {
    pub id: String,
    pub reason: String,
}

/// Result of one backend write call.
#[derive(Debug, Clone, Default)]
pub struct WriteOutcome {
    /// Rows the backend acknowledged.
    pub written: usize,
    pub failures: Vec<WriteFailure>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builders_set_the_operation() {
        let insert = WriteRequest::insert("metrics-all-20240117".into(), "b_e".into(), BTreeMap::new());
        assert_eq!(insert.op, WriteOp::Insert);
        let update = WriteRequest::update("metrics-all-20240117".into(), "b_e".into(), BTreeMap::new());
        assert_eq!(update.op, WriteOp::Update);
    }

    #[test]
    fn additional_rows_chain() {
        let request = WriteRequest::insert("metrics-all-20240117".into(), "a".into(), BTreeMap::new())
            .with_additional(WriteRequest::insert(
                "entity_traffic-20240117".into(),
                "shop.1".into(),
                BTreeMap::new(),
            ));
        assert_eq!(request.additional.len(), 1);
        assert_eq!(request.additional[0].unit, "entity_traffic-20240117");
    }

    #[test]
    fn flatten_keeps_primary_first_and_recurses() {
        let request = WriteRequest::insert("metrics-all-20240117".into(), "a".into(), BTreeMap::new())
            .with_additional(
                WriteRequest::insert("entity_traffic-20240117".into(), "shop.1".into(), BTreeMap::new())
                    .with_additional(WriteRequest::insert(
                        "entity_traffic-20240117".into(),
                        "shop.1_i1".into(),
                        BTreeMap::new(),
                    )),
            );

        let flat = request.into_flattened();
        let ids: Vec<&str> = flat.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "shop.1", "shop.1_i1"]);
        assert!(flat.iter().all(|r| r.additional.is_empty()));
    }
}
