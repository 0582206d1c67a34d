//! Event intake and the periodic flush cycle.
//!
//! Producers hand events to [`Dispatcher::handle_event`], which never
//! blocks: a full intake channel drops the event and counts it. One
//! task owns everything downstream of the cache rotation, so persist
//! sessions, downsampling and write emission run without locks. Hour
//! and day values are built by re-merging the minute increments of each
//! cycle into coarser sessions, which is sound because every value kind
//! merges commutatively and associatively.

use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use anyhow::{bail, Result};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cache::{AggregationCache, RecordKey};
use crate::config::CoreConfig;
use crate::event::TelemetryEvent;
use crate::health::HealthMetrics;
use crate::metric::catalog;
use crate::metric::recent::RecordEntry;
use crate::metric::value::{FieldValue, MetricValue};
use crate::metric::{bucket, parse_service_entity_id, Granularity, MetricIdentity, Scope};
use crate::queue::BatchWriteQueue;
use crate::schema::model::{Model, COLUMN_ENTITY_ID, COLUMN_METRIC_TABLE, COLUMN_TIME_BUCKET};
use crate::schema::{naming, SchemaManager};
use crate::storage::WriteRequest;

/// Upper bound on events folded per channel wakeup, so a saturated
/// channel cannot starve the flush tick.
const EVENT_DRAIN_BURST: usize = 256;

/// Intake front and owner of the aggregation run loop.
pub struct Dispatcher {
    cfg: CoreConfig,
    cache: Arc<AggregationCache>,
    queue: Arc<BatchWriteQueue>,
    schema: Arc<SchemaManager>,
    health: Option<Arc<HealthMetrics>>,
    tx: mpsc::Sender<TelemetryEvent>,
    rx: parking_lot::Mutex<Option<mpsc::Receiver<TelemetryEvent>>>,
    run_task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Dispatcher {
    pub fn new(
        cfg: CoreConfig,
        queue: Arc<BatchWriteQueue>,
        schema: Arc<SchemaManager>,
        health: Option<Arc<HealthMetrics>>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(cfg.event_channel_capacity);
        let cache = Arc::new(AggregationCache::new(cfg.cache_shards, cfg.recent_buffer_capacity));
        Self {
            cfg,
            cache,
            queue,
            schema,
            health,
            tx,
            rx: parking_lot::Mutex::new(Some(rx)),
            run_task: tokio::sync::Mutex::new(None),
        }
    }

    /// Offers one event to the pipeline. Never blocks the caller: when
    /// the intake channel is full the event is dropped and counted.
    pub fn handle_event(&self, event: TelemetryEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {
                if let Some(health) = &self.health {
                    health.events_received.inc();
                }
            }
            Err(_) => {
                if let Some(health) = &self.health {
                    health.events_dropped.inc();
                }
                debug!("intake channel full, dropping event");
            }
        }
    }

    /// Spawns the run loop. Cancelling the token folds whatever is
    /// still queued and runs one final flush before the task exits.
    pub async fn start(&self, cancel: CancellationToken) -> Result<()> {
        let Some(mut rx) = self.rx.lock().take() else {
            bail!("dispatcher already started");
        };

        let cache = Arc::clone(&self.cache);
        let health = self.health.clone();
        let flush_interval = self.cfg.flush_interval;
        let mut persister = Persister::new(
            Arc::clone(&self.cache),
            Arc::clone(&self.queue),
            Arc::clone(&self.schema),
            self.cfg.session_slack_cycles,
            self.health.clone(),
        );

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(flush_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        while let Ok(event) = rx.try_recv() {
                            fold_event(&cache, health.as_deref(), &event);
                        }
                        persister.flush().await;
                        info!("dispatcher stopped");
                        return;
                    }

                    received = rx.recv() => {
                        match received {
                            Some(event) => {
                                fold_event(&cache, health.as_deref(), &event);
                                // Drain a bounded burst without waiting.
                                for _ in 1..EVENT_DRAIN_BURST {
                                    match rx.try_recv() {
                                        Ok(event) => fold_event(&cache, health.as_deref(), &event),
                                        Err(_) => break,
                                    }
                                }
                            }
                            None => {
                                persister.flush().await;
                                info!("intake channel closed, dispatcher stopped");
                                return;
                            }
                        }
                    }

                    _ = ticker.tick() => {
                        persister.flush().await;
                    }
                }
            }
        });

        *self.run_task.lock().await = Some(handle);

        info!(
            flush_interval = ?self.cfg.flush_interval,
            channel_capacity = self.cfg.event_channel_capacity,
            cache_shards = self.cfg.cache_shards,
            "dispatcher started",
        );

        Ok(())
    }

    pub async fn wait_for_shutdown(&self) {
        let handle = self.run_task.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(error = %e, "dispatcher task failed");
            }
        }
    }
}

/// Runs every catalog definition against one event. A failing
/// definition only loses its own sample; the others still fold.
fn fold_event(cache: &AggregationCache, health: Option<&HealthMetrics>, event: &TelemetryEvent) {
    for def in catalog::standard_metrics() {
        match (def.fold)(event) {
            Ok(Some(sample)) => {
                if let Err(e) = cache.accept(sample.identity, sample.value) {
                    drop_sample(health, def.name, &e);
                }
            }
            Ok(None) => {}
            Err(e) => drop_sample(health, def.name, &e),
        }
    }

    for def in catalog::standard_records() {
        match (def.fold)(event) {
            Ok(Some(sample)) => {
                let key = RecordKey { metric: sample.metric, entity_id: sample.entity_id };
                cache.accept_record(key, sample.entry);
            }
            Ok(None) => {}
            Err(e) => drop_sample(health, def.name, &e),
        }
    }
}

fn drop_sample(health: Option<&HealthMetrics>, metric: &str, error: &anyhow::Error) {
    if let Some(health) = health {
        health.samples_dropped.with_label_values(&[metric]).inc();
    }
    debug!(metric, error = %error, "dropping sample");
}

/// Write state of one storage row across flush cycles.
struct PersistSession {
    value: MetricValue,
    /// Flips after the first emission; later cycles update the row.
    inserted: bool,
    /// Changed since the last emission.
    dirty: bool,
    /// Cycle of the last merge into this session.
    last_touched: u64,
}

/// Session bookkeeping owned by the run loop.
///
/// A session holds the full running value of one storage row; the
/// first emission inserts it, every later one updates it with the
/// re-merged total. Sessions are the only write path, so storage is
/// never read back during aggregation.
struct Persister {
    cache: Arc<AggregationCache>,
    queue: Arc<BatchWriteQueue>,
    schema: Arc<SchemaManager>,
    health: Option<Arc<HealthMetrics>>,
    slack_cycles: u64,

    /// Declared models keyed by granularity-suffixed logical name.
    metric_models: HashMap<String, Model>,
    record_models: HashMap<String, Model>,

    sessions: HashMap<MetricIdentity, PersistSession>,
    /// Newest bucket seen per granularity; sessions behind it become
    /// eviction candidates once idle past the slack window.
    latest_bucket: HashMap<Granularity, u64>,
    /// Day each known entity last got a traffic registration row.
    registered: HashMap<String, u64>,
    cycle: u64,
    record_seq: u64,
}

impl Persister {
    fn new(
        cache: Arc<AggregationCache>,
        queue: Arc<BatchWriteQueue>,
        schema: Arc<SchemaManager>,
        slack_cycles: u64,
        health: Option<Arc<HealthMetrics>>,
    ) -> Self {
        let mut metric_models = HashMap::new();
        let mut record_models = HashMap::new();
        for model in catalog::standard_models() {
            if model.record {
                record_models.insert(model.name.clone(), model);
            } else {
                metric_models.insert(model.name.clone(), model);
            }
        }

        Self {
            cache,
            queue,
            schema,
            health,
            slack_cycles,
            metric_models,
            record_models,
            sessions: HashMap::new(),
            latest_bucket: HashMap::new(),
            registered: HashMap::new(),
            cycle: 0,
            // Wall-clock seed keeps record ids unique across restarts
            // that write into the same unit.
            record_seq: chrono::Utc::now().timestamp_millis() as u64,
        }
    }

    /// One flush cycle: rotate the cache, merge the detached increments
    /// into minute, hour and day sessions, emit every dirty session and
    /// drained record, then evict superseded idle sessions.
    async fn flush(&mut self) {
        self.cycle += 1;

        let (metrics, records) = self.cache.rotate().into_parts();
        if let Some(health) = &self.health {
            health.flush_cycles.inc();
            health.generation_size.observe(metrics.len() as f64);
        }

        for (identity, value) in metrics {
            let hour = identity.at(Granularity::Hour);
            let day = identity.at(Granularity::Day);
            self.merge_session(hour, value.clone());
            self.merge_session(day, value.clone());
            self.merge_session(identity, value);
        }

        self.emit_sessions().await;
        self.emit_records(records).await;
        self.evict_sessions();
    }

    /// Merges one increment into its session, creating it dirty and
    /// uninserted on first sight.
    fn merge_session(&mut self, identity: MetricIdentity, value: MetricValue) {
        let latest = self.latest_bucket.entry(identity.granularity).or_insert(0);
        if identity.time_bucket > *latest {
            *latest = identity.time_bucket;
        }

        match self.sessions.entry(identity) {
            Entry::Occupied(mut occupied) => {
                if let Err(e) = occupied.get_mut().value.merge(&value) {
                    drop_sample(self.health.as_deref(), occupied.key().metric, &e);
                    return;
                }
                let session = occupied.get_mut();
                session.dirty = true;
                session.last_touched = self.cycle;
            }
            Entry::Vacant(vacant) => {
                vacant.insert(PersistSession {
                    value,
                    inserted: false,
                    dirty: true,
                    last_touched: self.cycle,
                });
            }
        }
    }

    async fn emit_sessions(&mut self) {
        let mut pending = Vec::new();
        for (identity, session) in self.sessions.iter_mut() {
            if !session.dirty {
                continue;
            }
            session.dirty = false;
            let is_insert = !session.inserted;
            session.inserted = true;
            pending.push((identity.clone(), session.value.clone(), is_insert));
        }

        for (identity, value, is_insert) in pending {
            // First sight of a service today piggybacks a traffic
            // registration row on the minute insert.
            let register = is_insert
                && identity.granularity == Granularity::Minute
                && identity.scope == Scope::Service
                && self.mark_registered(&identity);
            self.emit_metric(identity, value, is_insert, register).await;
        }
    }

    /// Records that an entity has been registered for the day of the
    /// given identity. Returns whether a registration row is due.
    fn mark_registered(&mut self, identity: &MetricIdentity) -> bool {
        let day = bucket::day_of(identity.time_bucket, identity.granularity);
        match self.registered.get(&identity.entity_id) {
            Some(&registered_day) if registered_day == day => false,
            _ => {
                self.registered.insert(identity.entity_id.clone(), day);
                true
            }
        }
    }

    async fn emit_metric(
        &self,
        identity: MetricIdentity,
        value: MetricValue,
        is_insert: bool,
        register: bool,
    ) {
        let logical = naming::logical_table_name(identity.metric, identity.granularity);
        let Some(model) = self.metric_models.get(&logical) else {
            warn!(metric = identity.metric, "no declared model, dropping emission");
            return;
        };

        let day = bucket::day_of(identity.time_bucket, identity.granularity);
        if let Err(e) = self.schema.ensure_unit(model, day).await {
            // The write will surface the problem as a flush failure.
            warn!(table = %model.name, day, error = %e, "ensuring unit failed");
        }
        let unit = model.unit_for_day(day, self.schema.rollover_step_days());

        let mut fields = value.serialize();
        fields.insert(COLUMN_ENTITY_ID.to_string(), FieldValue::Text(identity.entity_id.clone()));
        fields.insert(COLUMN_TIME_BUCKET.to_string(), FieldValue::Long(identity.time_bucket as i64));
        if model.merged() {
            fields.insert(COLUMN_METRIC_TABLE.to_string(), FieldValue::Text(model.name.clone()));
        }

        // Merged units interleave rows of many logical tables, so the
        // row id carries the table name to keep equal bucket/entity
        // pairs of different metrics apart.
        let id = if model.merged() {
            format!("{}_{}", model.name, identity.storage_id())
        } else {
            identity.storage_id()
        };

        let mut request = if is_insert {
            WriteRequest::insert(unit, id, fields)
        } else {
            WriteRequest::update(unit, id, fields)
        };

        if register {
            if let Some(row) = self.registration_row(&identity, day).await {
                request = request.with_additional(row);
            }
        }

        if let Err(e) = self.queue.enqueue(request).await {
            warn!(error = %e, "enqueueing write failed");
        }
    }

    /// Builds the first-sight traffic row for a service entity.
    async fn registration_row(&self, identity: &MetricIdentity, day: u64) -> Option<WriteRequest> {
        let (name, normal) = parse_service_entity_id(&identity.entity_id)?;
        let model = self.record_models.get(catalog::ENTITY_TRAFFIC)?;

        if let Err(e) = self.schema.ensure_unit(model, day).await {
            warn!(table = %model.name, day, error = %e, "ensuring unit failed");
        }
        let unit = model.unit_for_day(day, self.schema.rollover_step_days());

        let mut fields = BTreeMap::new();
        fields.insert(COLUMN_ENTITY_ID.to_string(), FieldValue::Text(identity.entity_id.clone()));
        fields.insert(COLUMN_TIME_BUCKET.to_string(), FieldValue::Long(identity.time_bucket as i64));
        fields.insert("name".to_string(), FieldValue::Text(name.to_string()));
        fields.insert("normal".to_string(), FieldValue::Long(i64::from(normal)));
        fields.insert("register_time".to_string(), FieldValue::Long(identity.time_bucket as i64));

        Some(WriteRequest::insert(unit, identity.entity_id.clone(), fields))
    }

    async fn emit_records(&mut self, records: Vec<(RecordKey, Vec<RecordEntry>)>) {
        for (key, entries) in records {
            let Some(model) = self.record_models.get(key.metric) else {
                warn!(metric = key.metric, "no declared record model, dropping entries");
                continue;
            };

            for entry in entries {
                let day = bucket::day_of(entry.time_bucket, Granularity::Minute);
                if let Err(e) = self.schema.ensure_unit(model, day).await {
                    warn!(table = %model.name, day, error = %e, "ensuring unit failed");
                }
                let unit = model.unit_for_day(day, self.schema.rollover_step_days());

                let seq = self.record_seq;
                self.record_seq += 1;
                let id = format!("{}_{}_{}", entry.time_bucket, key.entity_id, seq);

                let mut fields = entry.fields;
                fields.insert(COLUMN_ENTITY_ID.to_string(), FieldValue::Text(key.entity_id.clone()));
                fields.insert(COLUMN_TIME_BUCKET.to_string(), FieldValue::Long(entry.time_bucket as i64));

                if let Err(e) = self.queue.enqueue(WriteRequest::insert(unit, id, fields)).await {
                    warn!(error = %e, "enqueueing record write failed");
                }
            }
        }
    }

    /// Drops sessions whose bucket has been superseded at their
    /// granularity and which nothing has touched for the slack window.
    /// A straggler for an evicted bucket starts over as a fresh insert,
    /// overwriting the row with partial data, so the slack must cover
    /// the realistic lateness of producers.
    fn evict_sessions(&mut self) {
        let cycle = self.cycle;
        let slack = self.slack_cycles;
        let latest = &self.latest_bucket;
        self.sessions.retain(|identity, session| {
            let superseded = latest
                .get(&identity.granularity)
                .is_some_and(|newest| identity.time_bucket < *newest);
            !(superseded && cycle.saturating_sub(session.last_touched) > slack)
        });

        if let Some(health) = &self.health {
            let mut counts: HashMap<Granularity, usize> = HashMap::new();
            for identity in self.sessions.keys() {
                *counts.entry(identity.granularity).or_insert(0) += 1;
            }
            for granularity in [Granularity::Minute, Granularity::Hour, Granularity::Day] {
                let count = counts.get(&granularity).copied().unwrap_or(0);
                health
                    .sessions_active
                    .with_label_values(&[granularity.as_str()])
                    .set(count as f64);
            }
        }

        // Registration memory only needs the current day window.
        if let Some(&latest_day) = self.latest_bucket.get(&Granularity::Day) {
            let keep_from = bucket::day_add(latest_day, -1).unwrap_or(latest_day);
            self.registered.retain(|_, day| *day >= keep_from);
        }
    }
}
