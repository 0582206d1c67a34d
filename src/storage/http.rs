//! HTTP document-store backend.
//!
//! Speaks a small REST dialect against a remote unit store: bulk NDJSON
//! writes to `POST /<unit>/_bulk`, mapping reads and changes under
//! `/<unit>/_mapping`, unit lifecycle via `PUT`/`DELETE /<unit>` and
//! `GET /_units`. Write bodies are optionally compressed, with the
//! codec advertised through `Content-Encoding`.

use std::collections::BTreeMap;
use std::io::Write;

use anyhow::{bail, Context, Result};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use super::request::{WriteOp, WriteOutcome, WriteRequest};
use crate::config::HttpStorageConfig;
use crate::schema::model::{ColumnKind, ColumnSet};

/// Remote unit store client.
pub struct HttpBackend {
    client: reqwest::Client,
    cfg: HttpStorageConfig,
}

#[derive(Debug, Deserialize)]
struct MappingResponse {
    columns: BTreeMap<String, String>,
}

impl HttpBackend {
    pub fn new(cfg: HttpStorageConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(cfg.request_timeout)
            .build()
            .context("building HTTP storage client")?;
        Ok(Self { client, cfg })
    }

    fn unit_url(&self, unit: &str) -> String {
        format!("{}/{unit}", self.cfg.endpoint.trim_end_matches('/'))
    }

    /// Delivers one write group as an NDJSON bulk body. The store
    /// acknowledges the group as a whole; a non-success status fails
    /// the entire group.
    pub async fn execute_write(
        &self,
        unit: &str,
        op: WriteOp,
        rows: &[WriteRequest],
    ) -> Result<WriteOutcome> {
        if rows.is_empty() {
            return Ok(WriteOutcome::default());
        }

        let body = bulk_body(op, rows)?;
        let raw_len = body.len();
        let compressed = compress(&body, &self.cfg.compression).context("compressing bulk body")?;

        let mut request = self
            .client
            .post(format!("{}/_bulk", self.unit_url(unit)))
            .header("Content-Type", "application/x-ndjson")
            .body(compressed);

        if let Some(encoding) = content_encoding(&self.cfg.compression) {
            request = request.header("Content-Encoding", encoding);
        }

        for (k, v) in &self.cfg.headers {
            request = request.header(k.as_str(), v.as_str());
        }

        let resp = request.send().await.context("sending bulk write")?;
        let status = resp.status();
        // Drain body for connection reuse.
        let _ = resp.bytes().await;

        if !status.is_success() {
            bail!("bulk write to {unit:?} returned {status}");
        }

        debug!(unit, op = op.as_str(), rows = rows.len(), bytes = raw_len, "bulk write delivered");
        Ok(WriteOutcome { written: rows.len(), failures: Vec::new() })
    }

    /// Observed column set of a unit, `None` when the unit does not
    /// exist.
    pub async fn query_schema(&self, unit: &str) -> Result<Option<ColumnSet>> {
        let resp = self
            .client
            .get(format!("{}/_mapping", self.unit_url(unit)))
            .send()
            .await
            .context("querying unit mapping")?;

        if resp.status() == StatusCode::NOT_FOUND {
            let _ = resp.bytes().await;
            return Ok(None);
        }
        if !resp.status().is_success() {
            bail!("mapping query for {unit:?} returned {}", resp.status());
        }

        let mapping: MappingResponse = resp.json().await.context("decoding mapping response")?;
        let mut columns = ColumnSet::new();
        for (name, kind) in mapping.columns {
            columns.insert(name, ColumnKind::parse(&kind)?);
        }
        Ok(Some(columns))
    }

    pub async fn apply_schema_change(&self, unit: &str, added: &ColumnSet) -> Result<()> {
        let resp = self
            .client
            .put(format!("{}/_mapping", self.unit_url(unit)))
            .json(&mapping_body(added))
            .send()
            .await
            .context("sending mapping change")?;
        let status = resp.status();
        let _ = resp.bytes().await;
        if !status.is_success() {
            bail!("mapping change for {unit:?} returned {status}");
        }
        Ok(())
    }

    pub async fn create_or_roll_unit(&self, unit: &str, schema: &ColumnSet) -> Result<()> {
        let resp = self
            .client
            .put(self.unit_url(unit))
            .json(&mapping_body(schema))
            .send()
            .await
            .context("creating unit")?;
        let status = resp.status();
        let _ = resp.bytes().await;
        // Conflict means the unit already exists; a roll treats that as
        // done.
        if status == StatusCode::CONFLICT {
            return Ok(());
        }
        if !status.is_success() {
            bail!("unit creation for {unit:?} returned {status}");
        }
        Ok(())
    }

    pub async fn delete_unit(&self, unit: &str) -> Result<()> {
        let resp = self
            .client
            .delete(self.unit_url(unit))
            .send()
            .await
            .context("deleting unit")?;
        let status = resp.status();
        let _ = resp.bytes().await;
        if status == StatusCode::NOT_FOUND || status.is_success() {
            return Ok(());
        }
        bail!("unit deletion for {unit:?} returned {status}");
    }

    pub async fn list_units(&self) -> Result<Vec<String>> {
        let resp = self
            .client
            .get(format!("{}/_units", self.cfg.endpoint.trim_end_matches('/')))
            .send()
            .await
            .context("listing units")?;
        if !resp.status().is_success() {
            bail!("unit listing returned {}", resp.status());
        }
        resp.json().await.context("decoding unit listing")
    }
}

/// Serializes one write group to NDJSON: an action line naming the row
/// id followed by the document line.
fn bulk_body(op: WriteOp, rows: &[WriteRequest]) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(rows.len() * 256);
    for row in rows {
        let action = match op {
            WriteOp::Insert => json!({"index": {"_id": row.id}}),
            WriteOp::Update => json!({"update": {"_id": row.id}}),
        };
        serde_json::to_writer(&mut buf, &action).context("serializing bulk action")?;
        buf.push(b'\n');
        serde_json::to_writer(&mut buf, &row.fields).context("serializing row fields")?;
        buf.push(b'\n');
    }
    Ok(buf)
}

fn mapping_body(columns: &ColumnSet) -> Value {
    let mut map = serde_json::Map::new();
    for (name, kind) in columns {
        map.insert(name.clone(), Value::String(kind.as_str().to_string()));
    }
    json!({ "columns": map })
}

// --- Compression ---

/// Compresses data using the configured algorithm.
fn compress(data: &[u8], algorithm: &str) -> Result<Vec<u8>> {
    match algorithm {
        "none" | "" => Ok(data.to_vec()),
        "gzip" => compress_gzip(data),
        "zstd" => compress_zstd(data),
        "zlib" => compress_zlib(data),
        "snappy" => compress_snappy(data),
        other => bail!("unsupported compression: {other}"),
    }
}

/// Content-Encoding header value for the algorithm.
fn content_encoding(algorithm: &str) -> Option<&'static str> {
    match algorithm {
        "gzip" => Some("gzip"),
        "zstd" => Some("zstd"),
        "zlib" => Some("deflate"),
        "snappy" => Some("snappy"),
        _ => None,
    }
}

fn compress_gzip(data: &[u8]) -> Result<Vec<u8>> {
    use flate2::write::GzEncoder;
    use flate2::Compression;

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).context("gzip write")?;
    encoder.finish().context("gzip finish")
}

fn compress_zstd(data: &[u8]) -> Result<Vec<u8>> {
    zstd::encode_all(data, 0).context("zstd encode")
}

fn compress_zlib(data: &[u8]) -> Result<Vec<u8>> {
    use flate2::write::ZlibEncoder;
    use flate2::Compression;

    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).context("zlib write")?;
    encoder.finish().context("zlib finish")
}

fn compress_snappy(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = snap::raw::Encoder::new();
    encoder.compress_vec(data).context("snappy encode")
}
