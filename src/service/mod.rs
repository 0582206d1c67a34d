//! Pipeline lifecycle orchestration.
//!
//! [`Service`] owns every component and brings them up in dependency
//! order: health endpoint, schema install and maintenance, write
//! queue, dispatcher. Shutdown walks the pipeline upstream-first so
//! each stage drains into a consumer that is still running.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::{Config, StorageMode};
use crate::dispatch::Dispatcher;
use crate::event::TelemetryEvent;
use crate::health::HealthMetrics;
use crate::metric::{bucket, catalog};
use crate::queue::BatchWriteQueue;
use crate::schema::SchemaManager;
use crate::storage::http::HttpBackend;
use crate::storage::memory::MemoryBackend;
use crate::storage::StorageBackend;

/// The assembled aggregation pipeline.
pub struct Service {
    cfg: Config,
    health: Option<Arc<HealthMetrics>>,
    backend: Arc<StorageBackend>,
    schema: Option<Arc<SchemaManager>>,
    queue: Option<Arc<BatchWriteQueue>>,
    dispatcher: Option<Arc<Dispatcher>>,
    schema_cancel: CancellationToken,
    queue_cancel: CancellationToken,
    dispatcher_cancel: CancellationToken,
}

impl Service {
    /// Builds the storage backend and health surface. Nothing runs
    /// until [`Service::start`].
    pub fn new(cfg: Config) -> Result<Self> {
        let health = if cfg.health.enabled {
            Some(Arc::new(
                HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?,
            ))
        } else {
            None
        };

        let backend = match cfg.storage.mode {
            StorageMode::Memory => StorageBackend::Memory(MemoryBackend::new()),
            StorageMode::Http => StorageBackend::Http(
                HttpBackend::new(cfg.storage.http.clone())
                    .context("creating HTTP storage backend")?,
            ),
        };

        Ok(Self {
            cfg,
            health,
            backend: Arc::new(backend),
            schema: None,
            queue: None,
            dispatcher: None,
            schema_cancel: CancellationToken::new(),
            queue_cancel: CancellationToken::new(),
            dispatcher_cancel: CancellationToken::new(),
        })
    }

    /// Starts every component in dependency order.
    pub async fn start(&mut self) -> Result<()> {
        info!(
            cluster = %self.cfg.meta_cluster_name,
            backend = self.backend.name(),
            "starting pipeline",
        );

        // 1. Health endpoint first so probes respond during install.
        if let Some(health) = &self.health {
            health.start().await.context("starting health endpoint")?;
            info!(addr = %self.cfg.health.addr, "health endpoint started");
        }

        // 2. Schema: install today's units, then run maintenance.
        let schema = Arc::new(SchemaManager::new(
            catalog::standard_models(),
            Arc::clone(&self.backend),
            self.cfg.schema.clone(),
            self.health.clone(),
        ));
        schema.install(bucket::today_utc()).await.context("installing schema")?;
        schema.start(self.schema_cancel.clone());

        // 3. Write queue.
        let queue = Arc::new(BatchWriteQueue::new(
            Arc::clone(&self.backend),
            self.cfg.queue.clone(),
            self.health.clone(),
        ));
        queue.start(self.queue_cancel.clone()).await.context("starting write queue")?;

        // 4. Dispatcher last, so everything it emits into is running.
        let dispatcher = Arc::new(Dispatcher::new(
            self.cfg.core.clone(),
            Arc::clone(&queue),
            Arc::clone(&schema),
            self.health.clone(),
        ));
        dispatcher
            .start(self.dispatcher_cancel.clone())
            .await
            .context("starting dispatcher")?;

        self.schema = Some(schema);
        self.queue = Some(queue);
        self.dispatcher = Some(dispatcher);

        info!("pipeline fully started");

        Ok(())
    }

    /// Offers one event to the pipeline. Drops the event when the
    /// intake is full or the pipeline has not been started.
    pub fn handle_event(&self, event: TelemetryEvent) {
        match &self.dispatcher {
            Some(dispatcher) => dispatcher.handle_event(event),
            None => debug!("pipeline not started, dropping event"),
        }
    }

    /// Gracefully stops the pipeline, upstream-first: the dispatcher's
    /// final flush lands in the queue, the queue drains into storage,
    /// then maintenance and the health endpoint stop.
    pub async fn stop(&mut self) -> Result<()> {
        self.dispatcher_cancel.cancel();
        if let Some(dispatcher) = &self.dispatcher {
            dispatcher.wait_for_shutdown().await;
        }

        self.queue_cancel.cancel();
        if let Some(queue) = &self.queue {
            queue.wait_for_shutdown().await;
        }

        self.schema_cancel.cancel();
        if let Some(schema) = &self.schema {
            schema.wait_for_shutdown().await;
        }

        if let Some(health) = &self.health {
            health.stop().await?;
        }

        info!("pipeline stopped");

        Ok(())
    }

    /// Storage handle, for the memory mode's inspection surface.
    pub fn backend(&self) -> &Arc<StorageBackend> {
        &self.backend
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Utc;

    use super::*;
    use crate::metric::value::FieldValue;
    use crate::metric::{Granularity, Scope};
    use crate::schema::naming;

    fn test_config() -> Config {
        let mut cfg = Config::default();
        cfg.meta_cluster_name = "test-cluster".to_string();
        cfg.health.enabled = false;
        cfg.core.flush_interval = Duration::from_millis(20);
        cfg.queue.flush_interval = Duration::from_millis(10);
        cfg
    }

    fn event_at(timestamp_ms: u64, latency_ms: i64) -> TelemetryEvent {
        TelemetryEvent {
            scope: Scope::Service,
            service: "shop".to_string(),
            normal: true,
            endpoint: None,
            timestamp_ms,
            latency_ms,
            status: 200,
            success: true,
        }
    }

    #[tokio::test]
    async fn pipeline_runs_end_to_end_in_memory() {
        let mut service = Service::new(test_config()).unwrap();
        service.start().await.unwrap();

        // One shared timestamp keeps both events in the same bucket.
        let now_ms = Utc::now().timestamp_millis() as u64;
        let minute = bucket::minute_of_ms(now_ms).unwrap();
        service.handle_event(event_at(now_ms, 100));
        service.handle_event(event_at(now_ms, 300));

        // A few flush intervals; stop() drains whatever remains.
        tokio::time::sleep(Duration::from_millis(120)).await;
        service.stop().await.unwrap();

        let memory = service.backend().as_memory().unwrap();
        let day = bucket::day_of(minute, Granularity::Minute);
        let unit = naming::unit_name("service_cpm", day, 1, true);
        let row = memory
            .row(&unit, &format!("service_cpm_{minute}_shop.1"))
            .expect("cpm minute row");
        assert_eq!(row.get("count").and_then(FieldValue::as_long), Some(2));
        assert_eq!(row.get("sum").and_then(FieldValue::as_long), Some(2));

        // The service registered itself in the traffic table.
        let traffic = naming::unit_name(catalog::ENTITY_TRAFFIC, day, 1, false);
        assert_eq!(memory.row_count(&traffic), 1);
    }

    #[tokio::test]
    async fn events_before_start_are_dropped_quietly() {
        let service = Service::new(test_config()).unwrap();
        service.handle_event(event_at(Utc::now().timestamp_millis() as u64, 10));
    }

    #[tokio::test]
    async fn stop_before_start_is_a_no_op() {
        let mut service = Service::new(test_config()).unwrap();
        service.stop().await.unwrap();
    }
}
