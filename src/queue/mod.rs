//! Batched storage write queue.
//!
//! Sits between the dispatcher and the storage backend. Requests are
//! buffered in a bounded channel and flushed when the pending row count
//! reaches the batch threshold or the flush interval elapses, whichever
//! comes first. Each flush groups rows by (physical unit, operation);
//! a group is one backend call with its own timeout, and a failing
//! group never takes its siblings down with it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::QueueConfig;
use crate::health::HealthMetrics;
use crate::storage::{StorageBackend, WriteOp, WriteRequest};

/// Asynchronous write buffer in front of a [`StorageBackend`].
///
/// `enqueue` never drops: a full channel blocks the producer until the
/// accumulator catches up. Flushed groups that fail or time out are
/// logged, counted and dropped; there is no retry at this layer.
pub struct BatchWriteQueue {
    backend: Arc<StorageBackend>,
    cfg: QueueConfig,
    health: Option<Arc<HealthMetrics>>,

    tx: mpsc::Sender<WriteRequest>,
    /// Receiver side, taken by `start`.
    rx: parking_lot::Mutex<Option<mpsc::Receiver<WriteRequest>>>,
    /// Handle for the accumulator task.
    run_task: tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl BatchWriteQueue {
    /// Creates a new write queue. The accumulator does not run until
    /// [`start`](Self::start) is called.
    pub fn new(
        backend: Arc<StorageBackend>,
        cfg: QueueConfig,
        health: Option<Arc<HealthMetrics>>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(cfg.capacity);

        Self {
            backend,
            cfg,
            health,
            tx,
            rx: parking_lot::Mutex::new(Some(rx)),
            run_task: tokio::sync::Mutex::new(None),
        }
    }

    /// Enqueues one write request, waiting while the queue is full.
    ///
    /// Additional rows attached to the request are flattened here so
    /// they occupy channel capacity and count toward the batch
    /// threshold like any other row.
    pub async fn enqueue(&self, request: WriteRequest) -> Result<()> {
        for row in request.into_flattened() {
            self.tx
                .send(row)
                .await
                .map_err(|_| anyhow!("write queue closed"))?;

            if let Some(health) = &self.health {
                health.write_requests_enqueued.inc();
            }
        }

        if let Some(health) = &self.health {
            let depth = self.cfg.capacity.saturating_sub(self.tx.capacity());
            health.queue_depth.set(depth as f64);
        }

        Ok(())
    }

    /// Starts the accumulator task that batches requests and dispatches
    /// grouped flushes.
    pub async fn start(&self, cancel: CancellationToken) -> Result<()> {
        let Some(mut rx) = self.rx.lock().take() else {
            bail!("write queue already started");
        };

        let backend = Arc::clone(&self.backend);
        let health = self.health.clone();
        let cfg = self.cfg.clone();
        let semaphore = Arc::new(Semaphore::new(cfg.max_concurrent_flushes));

        let handle = tokio::spawn(async move {
            let batch_threshold = cfg.batch_threshold;
            let mut pending: Vec<WriteRequest> = Vec::with_capacity(batch_threshold);
            let mut in_flight = JoinSet::new();
            let mut interval = tokio::time::interval(cfg.flush_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        // Drain the channel, flush everything, then wait
                        // for in-flight groups before returning.
                        while let Ok(request) = rx.try_recv() {
                            pending.push(request);
                            if pending.len() >= batch_threshold {
                                let rows = std::mem::replace(
                                    &mut pending,
                                    Vec::with_capacity(batch_threshold),
                                );
                                spawn_flush(
                                    &mut in_flight,
                                    Arc::clone(&backend),
                                    &cfg,
                                    Arc::clone(&semaphore),
                                    health.clone(),
                                    rows,
                                );
                            }
                        }

                        if !pending.is_empty() {
                            let rows = std::mem::take(&mut pending);
                            spawn_flush(
                                &mut in_flight,
                                Arc::clone(&backend),
                                &cfg,
                                Arc::clone(&semaphore),
                                health.clone(),
                                rows,
                            );
                        }

                        while let Some(joined) = in_flight.join_next().await {
                            if let Err(e) = joined {
                                debug!(error = %e, "write flush task join failed");
                            }
                        }
                        return;
                    }

                    request = rx.recv() => {
                        match request {
                            Some(request) => {
                                pending.push(request);

                                // Drain more requests without blocking.
                                while pending.len() < batch_threshold {
                                    match rx.try_recv() {
                                        Ok(request) => pending.push(request),
                                        Err(_) => break,
                                    }
                                }

                                if pending.len() >= batch_threshold {
                                    let rows = std::mem::replace(
                                        &mut pending,
                                        Vec::with_capacity(batch_threshold),
                                    );
                                    spawn_flush(
                                        &mut in_flight,
                                        Arc::clone(&backend),
                                        &cfg,
                                        Arc::clone(&semaphore),
                                        health.clone(),
                                        rows,
                                    );
                                }
                            }
                            None => {
                                if !pending.is_empty() {
                                    let rows = std::mem::take(&mut pending);
                                    spawn_flush(
                                        &mut in_flight,
                                        Arc::clone(&backend),
                                        &cfg,
                                        Arc::clone(&semaphore),
                                        health.clone(),
                                        rows,
                                    );
                                }

                                while let Some(joined) = in_flight.join_next().await {
                                    if let Err(e) = joined {
                                        debug!(error = %e, "write flush task join failed");
                                    }
                                }
                                return;
                            }
                        }
                    }

                    _ = interval.tick() => {
                        if !pending.is_empty() {
                            let rows = std::mem::replace(
                                &mut pending,
                                Vec::with_capacity(batch_threshold),
                            );
                            spawn_flush(
                                &mut in_flight,
                                Arc::clone(&backend),
                                &cfg,
                                Arc::clone(&semaphore),
                                health.clone(),
                                rows,
                            );
                        }
                    }

                    joined = in_flight.join_next(), if !in_flight.is_empty() => {
                        if let Some(Err(e)) = joined {
                            debug!(error = %e, "write flush task join failed");
                        }
                    }
                }
            }
        });

        *self.run_task.lock().await = Some(handle);

        info!(
            backend = self.backend.name(),
            capacity = self.cfg.capacity,
            batch_threshold = self.cfg.batch_threshold,
            flush_interval = ?self.cfg.flush_interval,
            max_concurrent_flushes = self.cfg.max_concurrent_flushes,
            "write queue started",
        );

        Ok(())
    }

    /// Waits for the accumulator task to finish. Call after cancelling
    /// the token handed to `start`; pending rows are flushed first.
    pub async fn wait_for_shutdown(&self) {
        let run_task = { self.run_task.lock().await.take() };
        if let Some(run_task) = run_task {
            if let Err(e) = run_task.await {
                warn!(error = %e, "write queue task join failed");
            }
        }
    }
}

fn spawn_flush(
    in_flight: &mut JoinSet<()>,
    backend: Arc<StorageBackend>,
    cfg: &QueueConfig,
    semaphore: Arc<Semaphore>,
    health: Option<Arc<HealthMetrics>>,
    rows: Vec<WriteRequest>,
) {
    if rows.is_empty() {
        return;
    }

    let flush_timeout = cfg.flush_timeout;

    in_flight.spawn(async move {
        let permit = match semaphore.acquire_owned().await {
            Ok(permit) => permit,
            Err(e) => {
                warn!(error = %e, "write queue semaphore closed");
                return;
            }
        };

        let _permit = permit;

        if let Some(health) = &health {
            health.flush_batch_size.observe(rows.len() as f64);
        }

        flush_groups(&backend, flush_timeout, health.as_deref(), rows).await;
    });
}

/// Flushes one batch: rows grouped by (unit, operation), one backend
/// call per group. Insert groups run first; an identity's first write
/// and its later full-value update can share a batch.
async fn flush_groups(
    backend: &StorageBackend,
    flush_timeout: Duration,
    health: Option<&HealthMetrics>,
    rows: Vec<WriteRequest>,
) {
    let mut groups: HashMap<(String, WriteOp), Vec<WriteRequest>> = HashMap::new();
    for row in rows {
        groups.entry((row.unit.clone(), row.op)).or_default().push(row);
    }

    let (inserts, updates): (Vec<_>, Vec<_>) =
        groups.into_iter().partition(|((_, op), _)| *op == WriteOp::Insert);

    for ((unit, op), group) in inserts.into_iter().chain(updates) {
        let row_count = group.len();
        let started = Instant::now();

        let outcome =
            tokio::time::timeout(flush_timeout, backend.execute_write(&unit, op, &group)).await;

        if let Some(health) = health {
            health.write_duration.observe(started.elapsed().as_secs_f64());
        }

        match outcome {
            Ok(Ok(outcome)) => {
                if let Some(health) = health {
                    health.write_groups_flushed.inc();
                    health.write_rows_written.inc_by(outcome.written as f64);
                    health.write_rows_rejected.inc_by(outcome.failures.len() as f64);
                }

                for failure in &outcome.failures {
                    warn!(
                        unit = %unit,
                        id = %failure.id,
                        reason = %failure.reason,
                        "storage rejected row",
                    );
                }

                debug!(
                    unit = %unit,
                    op = op.as_str(),
                    rows = row_count,
                    written = outcome.written,
                    "flushed write group",
                );
            }
            Ok(Err(e)) => {
                if let Some(health) = health {
                    health.write_group_errors.with_label_values(&["backend"]).inc();
                }
                error!(
                    unit = %unit,
                    op = op.as_str(),
                    rows = row_count,
                    error = %e,
                    "write group failed, dropping rows",
                );
            }
            Err(_) => {
                if let Some(health) = health {
                    health.write_group_errors.with_label_values(&["timeout"]).inc();
                }
                error!(
                    unit = %unit,
                    op = op.as_str(),
                    rows = row_count,
                    timeout = ?flush_timeout,
                    "write group timed out, dropping rows",
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use crate::metric::value::FieldValue;
    use crate::schema::model::{ColumnKind, ColumnSet};
    use crate::storage::memory::MemoryBackend;

    fn schema() -> ColumnSet {
        let mut columns = ColumnSet::new();
        columns.insert("count".to_string(), ColumnKind::Long);
        columns
    }

    fn backend_with_unit(unit: &str) -> Arc<StorageBackend> {
        let backend = MemoryBackend::new();
        backend.create_or_roll_unit(unit, &schema()).unwrap();
        Arc::new(StorageBackend::Memory(backend))
    }

    fn row(unit: &str, id: &str, count: i64) -> WriteRequest {
        let mut fields = BTreeMap::new();
        fields.insert("count".to_string(), FieldValue::Long(count));
        WriteRequest::insert(unit.to_string(), id.to_string(), fields)
    }

    fn cfg(batch_threshold: usize, flush_interval: Duration) -> QueueConfig {
        QueueConfig {
            capacity: 100,
            batch_threshold,
            flush_interval,
            max_concurrent_flushes: 2,
            flush_timeout: Duration::from_secs(5),
        }
    }

    async fn wait_for_rows(backend: &StorageBackend, unit: &str, want: usize) {
        let memory = backend.as_memory().unwrap();
        for _ in 0..500 {
            if memory.row_count(unit) == want {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("timed out waiting for {want} rows in {unit}, have {}", memory.row_count(unit));
    }

    #[tokio::test]
    async fn flushes_at_threshold_without_timer() {
        let backend = backend_with_unit("m-1");
        // Interval long enough that only the threshold can trigger.
        let queue = BatchWriteQueue::new(Arc::clone(&backend), cfg(4, Duration::from_secs(600)), None);
        let cancel = CancellationToken::new();
        queue.start(cancel.clone()).await.unwrap();

        for i in 0..4 {
            queue.enqueue(row("m-1", &format!("r{i}"), i)).await.unwrap();
        }

        wait_for_rows(&backend, "m-1", 4).await;
        cancel.cancel();
        queue.wait_for_shutdown().await;
    }

    #[tokio::test]
    async fn flushes_below_threshold_on_interval() {
        let backend = backend_with_unit("m-1");
        let queue = BatchWriteQueue::new(Arc::clone(&backend), cfg(100, Duration::from_millis(20)), None);
        let cancel = CancellationToken::new();
        queue.start(cancel.clone()).await.unwrap();

        queue.enqueue(row("m-1", "a", 1)).await.unwrap();
        queue.enqueue(row("m-1", "b", 2)).await.unwrap();

        wait_for_rows(&backend, "m-1", 2).await;
        cancel.cancel();
        queue.wait_for_shutdown().await;
    }

    #[tokio::test]
    async fn additional_rows_count_toward_the_threshold() {
        let backend = MemoryBackend::new();
        backend.create_or_roll_unit("m-1", &schema()).unwrap();
        backend.create_or_roll_unit("entity_traffic-1", &schema()).unwrap();
        let backend = Arc::new(StorageBackend::Memory(backend));

        let queue = BatchWriteQueue::new(Arc::clone(&backend), cfg(2, Duration::from_secs(600)), None);
        let cancel = CancellationToken::new();
        queue.start(cancel.clone()).await.unwrap();

        // One request with one additional row = two pending rows,
        // reaching the threshold with no timer help.
        let request = row("m-1", "a", 1).with_additional(row("entity_traffic-1", "shop.1", 1));
        queue.enqueue(request).await.unwrap();

        wait_for_rows(&backend, "m-1", 1).await;
        wait_for_rows(&backend, "entity_traffic-1", 1).await;
        cancel.cancel();
        queue.wait_for_shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_flushes_pending_rows() {
        let backend = backend_with_unit("m-1");
        let queue = BatchWriteQueue::new(Arc::clone(&backend), cfg(100, Duration::from_secs(600)), None);
        let cancel = CancellationToken::new();
        queue.start(cancel.clone()).await.unwrap();

        for i in 0..3 {
            queue.enqueue(row("m-1", &format!("r{i}"), i)).await.unwrap();
        }

        cancel.cancel();
        queue.wait_for_shutdown().await;

        assert_eq!(backend.as_memory().unwrap().row_count("m-1"), 3);
    }

    #[tokio::test]
    async fn failing_group_does_not_take_siblings_down() {
        // Only m-1 exists; rows for the ghost unit must fail alone.
        let backend = backend_with_unit("m-1");
        let queue = BatchWriteQueue::new(Arc::clone(&backend), cfg(100, Duration::from_secs(600)), None);
        let cancel = CancellationToken::new();
        queue.start(cancel.clone()).await.unwrap();

        queue.enqueue(row("ghost-1", "x", 1)).await.unwrap();
        queue.enqueue(row("m-1", "a", 1)).await.unwrap();
        queue.enqueue(row("ghost-1", "y", 2)).await.unwrap();
        queue.enqueue(row("m-1", "b", 2)).await.unwrap();

        cancel.cancel();
        queue.wait_for_shutdown().await;

        let memory = backend.as_memory().unwrap();
        assert_eq!(memory.row_count("m-1"), 2);
        assert_eq!(memory.row_count("ghost-1"), 0);
    }

    #[tokio::test]
    async fn inserts_run_before_updates_within_a_batch() {
        let backend = backend_with_unit("m-1");
        let queue = BatchWriteQueue::new(Arc::clone(&backend), cfg(100, Duration::from_secs(600)), None);
        let cancel = CancellationToken::new();
        queue.start(cancel.clone()).await.unwrap();

        // Same id inserted and then updated inside one batch: the
        // update must observe the inserted row.
        queue.enqueue(row("m-1", "a", 1)).await.unwrap();
        let mut fields = BTreeMap::new();
        fields.insert("count".to_string(), FieldValue::Long(7));
        queue
            .enqueue(WriteRequest::update("m-1".to_string(), "a".to_string(), fields))
            .await
            .unwrap();

        cancel.cancel();
        queue.wait_for_shutdown().await;

        let row = backend.as_memory().unwrap().row("m-1", "a").unwrap();
        assert_eq!(row.get("count").and_then(FieldValue::as_long), Some(7));
    }

    #[tokio::test]
    async fn start_twice_fails() {
        let backend = backend_with_unit("m-1");
        let queue = BatchWriteQueue::new(backend, cfg(10, Duration::from_millis(50)), None);
        let cancel = CancellationToken::new();
        queue.start(cancel.clone()).await.unwrap();
        assert!(queue.start(cancel.clone()).await.is_err());
        cancel.cancel();
        queue.wait_for_shutdown().await;
    }
}
