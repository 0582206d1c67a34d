//! Schema and physical-unit lifecycle.
//!
//! The [`SchemaManager`] reconciles declared models against the
//! backend: it creates or rolls dated units, adds missing columns,
//! deletes units past their TTL and plans boundary collapses for old
//! units. Install failures abort startup; periodic maintenance isolates
//! failures per unit so one bad unit cannot stall the rest.

pub mod model;
pub mod naming;
pub mod registry;
pub mod retention;

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::SchemaConfig;
use crate::health::HealthMetrics;
use crate::metric::bucket;
use crate::storage::StorageBackend;
use model::Model;
use registry::SchemaRegistry;

pub struct SchemaManager {
    backend: Arc<StorageBackend>,
    registry: SchemaRegistry,
    models: Vec<Model>,
    /// Unit families the manager owns and may delete or collapse.
    managed_families: HashSet<String>,
    /// Families exempt from compression.
    super_families: HashSet<String>,
    cfg: SchemaConfig,
    health: Option<Arc<HealthMetrics>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl SchemaManager {
    pub fn new(
        models: Vec<Model>,
        backend: Arc<StorageBackend>,
        cfg: SchemaConfig,
        health: Option<Arc<HealthMetrics>>,
    ) -> Self {
        let mut managed_families = HashSet::new();
        let mut super_families = HashSet::new();
        for model in &models {
            if model.merged() {
                managed_families.insert(naming::MERGED_UNIT_PREFIX.to_string());
            } else {
                managed_families.insert(model.name.clone());
            }
            if model.super_dataset {
                super_families.insert(model.name.clone());
            }
        }
        Self {
            backend,
            registry: SchemaRegistry::new(),
            models,
            managed_families,
            super_families,
            cfg,
            health,
            handle: Mutex::new(None),
        }
    }

    /// Ensures every model's unit exists for the given day with all
    /// declared columns. Unlike maintenance this propagates the first
    /// failure, so a cold start against an unreachable backend aborts.
    pub async fn install(&self, today: u64) -> Result<()> {
        for model in &self.models {
            self.ensure_unit(model, today)
                .await
                .with_context(|| format!("installing schema for {:?}", model.name))?;
        }
        info!(models = self.models.len(), units = self.registry.tracked_units(), "schema installed");
        Ok(())
    }

    /// Reconciles one model's unit for a day. Consults the registry
    /// first so repeated calls skip the backend round trip entirely.
    pub(crate) async fn ensure_unit(&self, model: &Model, day: u64) -> Result<()> {
        let unit = model.unit_for_day(day, self.cfg.rollover_step_days);
        let declared = model.storage_columns();
        if self.registry.contains(&unit, &declared) {
            return Ok(());
        }

        match self.backend.query_schema(&unit).await? {
            Some(observed) => {
                self.registry.merge(&unit, &observed);
                let missing = self.registry.diff(&unit, &declared);
                if !missing.is_empty() {
                    self.backend.apply_schema_change(&unit, &missing).await?;
                    self.observe_operation("alter");
                    info!(unit, added = missing.len(), "extended unit schema");
                }
                self.registry.merge(&unit, &declared);
            }
            None => {
                self.backend.create_or_roll_unit(&unit, &declared).await?;
                self.registry.merge(&unit, &declared);
                self.observe_operation("create");
                info!(unit, columns = declared.len(), "created unit");
            }
        }
        Ok(())
    }

    /// Spawns the periodic maintenance loop.
    pub fn start(self: &Arc<Self>, cancel: CancellationToken) {
        let manager = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(manager.cfg.maintenance_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The immediate first tick repeats install's work, which the
            // registry turns into no-ops.
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        manager.run_maintenance(bucket::today_utc()).await;
                    }
                }
            }
            debug!("schema maintenance loop stopped");
        });
        *self.handle.lock() = Some(handle);
    }

    pub async fn wait_for_shutdown(&self) {
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(error = %e, "schema maintenance task failed");
            }
        }
    }

    /// One maintenance pass: roll today's units, delete expired ones,
    /// plan compression targets. Every step is isolated per unit.
    pub async fn run_maintenance(&self, today: u64) {
        for model in &self.models {
            if let Err(e) = self.ensure_unit(model, today).await {
                self.observe_failure("roll");
                error!(model = %model.name, error = %e, "unit roll failed");
            }
        }

        let units = match self.backend.list_units().await {
            Ok(units) => units,
            Err(e) => {
                self.observe_failure("list");
                error!(error = %e, "listing units failed, skipping retention");
                return;
            }
        };
        let managed: Vec<&str> = units
            .iter()
            .map(String::as_str)
            .filter(|name| self.is_managed(name))
            .collect();

        // Collapse before deleting so sources that are both old enough
        // to compress and past TTL still contribute their targets.
        self.apply_compression(&managed, today).await;
        self.apply_retention(&managed, today).await;

        if let Some(health) = &self.health {
            health.units_tracked.set(self.registry.tracked_units() as f64);
        }
    }

    async fn apply_retention(&self, managed: &[&str], today: u64) {
        for unit in retention::expired_units(managed.iter().copied(), self.cfg.ttl_days, today) {
            match self.backend.delete_unit(&unit).await {
                Ok(()) => {
                    self.registry.forget(&unit);
                    self.observe_operation("delete");
                    info!(unit, ttl_days = self.cfg.ttl_days, "deleted expired unit");
                }
                Err(e) => {
                    self.observe_failure("delete");
                    error!(unit, error = %e, "deleting expired unit failed");
                }
            }
        }
    }

    /// Ensures boundary target units exist for old per-day units. Row
    /// movement itself is the store's reindex job; the manager's part
    /// is naming the targets and creating them with the source schema.
    async fn apply_compression(&self, managed: &[&str], today: u64) {
        let compressible: Vec<&str> = managed
            .iter()
            .copied()
            .filter(|name| {
                naming::unit_family(name)
                    .map(|family| !self.super_families.contains(family))
                    .unwrap_or(false)
            })
            .collect();

        let plan = retention::compression_plan(
            compressible.iter().copied(),
            self.cfg.compress_after_days,
            self.cfg.compress_step_days,
            today,
        );
        for step in plan {
            let schema = match self.backend.query_schema(&step.source).await {
                Ok(Some(schema)) => schema,
                Ok(None) => continue,
                Err(e) => {
                    self.observe_failure("compress");
                    error!(unit = %step.source, error = %e, "reading source schema failed");
                    continue;
                }
            };
            match self.backend.create_or_roll_unit(&step.target, &schema).await {
                Ok(()) => {
                    self.registry.merge(&step.target, &schema);
                    self.observe_operation("compress");
                    info!(source = %step.source, target = %step.target, "collapsed unit onto boundary");
                }
                Err(e) => {
                    self.observe_failure("compress");
                    error!(target = %step.target, error = %e, "creating compression target failed");
                }
            }
        }
    }

    fn is_managed(&self, unit: &str) -> bool {
        naming::unit_family(unit)
            .map(|family| self.managed_families.contains(family))
            .unwrap_or(false)
    }

    pub fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    /// Day step used for physical unit naming.
    pub fn rollover_step_days(&self) -> u32 {
        self.cfg.rollover_step_days
    }

    fn observe_operation(&self, operation: &str) {
        if let Some(health) = &self.health {
            health.schema_operations.with_label_values(&[operation]).inc();
        }
    }

    fn observe_failure(&self, operation: &str) {
        if let Some(health) = &self.health {
            health.schema_failures.with_label_values(&[operation]).inc();
        }
    }
}
