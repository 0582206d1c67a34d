//! Storage backends.
//!
//! The rest of the pipeline only sees [`StorageBackend`]; concrete
//! adapters live in submodules. Backends are a closed set dispatched
//! through an enum rather than trait objects for zero-cost async
//! dispatch (avoids `Pin<Box<dyn Future>>` overhead on every write).

pub mod http;
pub mod memory;
pub mod request;

use anyhow::Result;

use crate::schema::model::ColumnSet;
use http::HttpBackend;
use memory::MemoryBackend;
pub use request::{WriteFailure, WriteOp, WriteOutcome, WriteRequest};

/// A storage backend the pipeline can write through.
pub enum StorageBackend {
    Memory(MemoryBackend),
    Http(HttpBackend),
}

impl StorageBackend {
    /// Backend name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Memory(_) => "memory",
            Self::Http(_) => "http",
        }
    }

    /// Writes one group of rows sharing a unit and operation.
    pub async fn execute_write(
        &self,
        unit: &str,
        op: WriteOp,
        rows: &[WriteRequest],
    ) -> Result<WriteOutcome> {
        match self {
            Self::Memory(b) => b.execute_write(unit, op, rows),
            Self::Http(b) => b.execute_write(unit, op, rows).await,
        }
    }

    /// Observed column set of a unit, `None` when it does not exist.
    pub async fn query_schema(&self, unit: &str) -> Result<Option<ColumnSet>> {
        match self {
            Self::Memory(b) => b.query_schema(unit),
            Self::Http(b) => b.query_schema(unit).await,
        }
    }

    /// Adds columns to an existing unit.
    pub async fn apply_schema_change(&self, unit: &str, added: &ColumnSet) -> Result<()> {
        match self {
            Self::Memory(b) => b.apply_schema_change(unit, added),
            Self::Http(b) => b.apply_schema_change(unit, added).await,
        }
    }

    /// Creates a unit with the given schema; rolling over an existing
    /// unit is a no-op.
    pub async fn create_or_roll_unit(&self, unit: &str, schema: &ColumnSet) -> Result<()> {
        match self {
            Self::Memory(b) => b.create_or_roll_unit(unit, schema),
            Self::Http(b) => b.create_or_roll_unit(unit, schema).await,
        }
    }

    /// Drops a unit and its rows. Deleting a missing unit succeeds.
    pub async fn delete_unit(&self, unit: &str) -> Result<()> {
        match self {
            Self::Memory(b) => b.delete_unit(unit),
            Self::Http(b) => b.delete_unit(unit).await,
        }
    }

    /// Names of all existing units.
    pub async fn list_units(&self) -> Result<Vec<String>> {
        match self {
            Self::Memory(b) => b.list_units(),
            Self::Http(b) => b.list_units().await,
        }
    }

    /// Direct handle to the in-memory store, for inspection in tests
    /// and the memory mode's admin surface.
    pub fn as_memory(&self) -> Option<&MemoryBackend> {
        match self {
            Self::Memory(b) => Some(b),
            Self::Http(_) => None,
        }
    }
}
