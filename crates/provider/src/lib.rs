//! Keel provider: entry points for source-object changes and the control loop
//! that runs full sync cycles and feeds their outcome back as status.
//!
//! One loop per process. It waits on cancellation, a capacity-1 notification
//! channel and a periodic timer, so cycles never overlap and a burst of
//! notifications costs at most one extra cycle.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use arc_swap::ArcSwap;
use keel_client::{ClientError, Executor, SyncClient};
use keel_core::{Config, ExecutionErrors, ResourceType, Resources, SourceKey, Task};
use keel_status::{diff, plan, resolve, FailureSnapshot, StatusUpdater};
use keel_store::ConfigManager;
use keel_translate::{HandlerRegistry, SourceObject, TranslateContext, TranslateError};
use metrics::counter;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub mod settings;

pub use settings::Settings;

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("translate: {0}")]
    Translate(#[from] TranslateError),
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error("provider loop is already running")]
    AlreadyRunning,
}

pub type ProviderResult<T> = Result<T, ProviderError>;

/// What one full cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub id: String,
    /// Config names whose push failed, sorted.
    pub failed_configs: Vec<String>,
    /// Unstructured executor errors, per config name.
    pub unknown: BTreeMap<String, Vec<String>>,
    /// Source objects failing after this cycle.
    pub failing_objects: usize,
    /// Status writes attempted.
    pub status_updates: usize,
}

pub struct Provider {
    settings: Settings,
    registry: HandlerRegistry,
    client: SyncClient,
    configs: RwLock<ConfigManager>,
    status: Arc<dyn StatusUpdater>,
    /// Failures of the last committed cycle.
    failures: ArcSwap<FailureSnapshot>,
    /// Serializes full cycles started outside the loop.
    cycle_lock: Mutex<()>,
    cycles: AtomicU64,
    notify_tx: mpsc::Sender<()>,
    notify_rx: Mutex<Option<mpsc::Receiver<()>>>,
}

impl Provider {
    pub fn new(settings: Settings, registry: HandlerRegistry, executor: Arc<dyn Executor>, status: Arc<dyn StatusUpdater>) -> Self {
        let (notify_tx, notify_rx) = mpsc::channel(1);
        let client = SyncClient::new(executor, settings.backend_mode.clone());
        Self {
            settings,
            registry,
            client,
            configs: RwLock::new(ConfigManager::new()),
            status,
            failures: ArcSwap::from_pointee(FailureSnapshot::new()),
            cycle_lock: Mutex::new(()),
            cycles: AtomicU64::new(0),
            notify_tx,
            notify_rx: Mutex::new(Some(notify_rx)),
        }
    }

    pub fn settings(&self) -> &Settings { &self.settings }

    pub fn client(&self) -> &SyncClient { &self.client }

    /// Full cycles completed so far.
    pub fn cycles(&self) -> u64 { self.cycles.load(Ordering::Relaxed) }

    /// Failure snapshot of the last completed cycle.
    pub fn failures(&self) -> Arc<FailureSnapshot> { self.failures.load_full() }

    /// Read access to the backend/config index.
    pub async fn with_configs<R>(&self, f: impl FnOnce(&ConfigManager) -> R) -> R {
        let cm = self.configs.read().await;
        f(&cm)
    }

    /// Request a full cycle. Never blocks; requests made while one is already
    /// pending collapse into it.
    pub fn notify_sync(&self) {
        match self.notify_tx.try_send(()) {
            Ok(()) => debug!("provider: sync requested"),
            Err(mpsc::error::TrySendError::Full(())) => debug!("provider: sync already pending"),
            Err(mpsc::error::TrySendError::Closed(())) => warn!("provider: notify channel closed"),
        }
    }

    /// Translate a changed object and push it to every backend in `ctx`.
    ///
    /// The task is written to the store first, then pushed directly. A push
    /// failure is returned and also schedules a full cycle, which owns status.
    pub async fn update(&self, ctx: &TranslateContext, obj: &SourceObject) -> ProviderResult<()> {
        let t0 = Instant::now();
        let key = obj.key();
        let result = self.registry.translate(ctx, obj)?;
        let stale: Vec<Config> = {
            let mut cm = self.configs.write().await;
            let previous = cm.get_configs_by_resource_key(&key);
            for (backend, config) in &ctx.backends {
                cm.update_config(backend.clone(), config.clone());
            }
            cm.set_config_refs(&key, ctx.backends.keys().cloned());
            previous.into_iter().filter(|c| !ctx.backends.values().any(|n| n.name == c.name)).collect()
        };
        let (resource_types, resources) = result.into_resources();
        if !stale.is_empty() {
            self.retract(&key, &resource_types, stale).await?;
        }
        let task = Task::for_object(key.clone(), &resource_types, resources).with_configs(ctx.backends.values().cloned().collect());
        self.client.insert(&task).await?;
        if let Err(e) = self.client.update(&task).await {
            warn!(%key, error = %e, "provider: update push failed");
            self.notify_sync();
            return Err(e.into());
        }
        info!(%key, configs = task.configs.len(), took_ms = %t0.elapsed().as_millis(), "provider: update ok");
        Ok(())
    }

    /// Drop what `key` contributed to configs it no longer targets and push
    /// their remaining state.
    async fn retract(&self, key: &SourceKey, resource_types: &[ResourceType], configs: Vec<Config>) -> ProviderResult<()> {
        let names: Vec<String> = configs.iter().map(|c| c.name.clone()).collect();
        let task = Task::for_object(key.clone(), resource_types, Resources::default()).with_configs(configs);
        self.client.remove(&task).await?;
        if let Err(e) = self.client.update(&task).await {
            warn!(%key, configs = ?names, error = %e, "provider: retract push failed");
            self.notify_sync();
        }
        info!(%key, configs = ?names, "provider: retracted from previous backends");
        Ok(())
    }

    /// Drop a deleted object's resources and push the remaining state.
    ///
    /// When the object is itself a backend (a Gateway), its config goes too.
    pub async fn delete(&self, obj: &SourceObject) -> ProviderResult<()> {
        let t0 = Instant::now();
        let key = obj.key();
        let resource_types = self.registry.resource_types(obj.kind())?;
        let configs = self.configs.read().await.get_configs_by_resource_key(&key);
        let task = Task::for_object(key.clone(), resource_types, Resources::default()).with_configs(configs);
        self.client.remove(&task).await?;
        let pushed = self.client.update(&task).await;
        {
            let mut cm = self.configs.write().await;
            cm.delete_config_refs(&key);
            if let Some(config) = cm.delete_config(&key) {
                info!(%key, config = %config.name, "provider: backend removed");
            }
        }
        if let Err(e) = pushed {
            warn!(%key, error = %e, "provider: delete push failed");
            self.notify_sync();
            return Err(e.into());
        }
        info!(%key, configs = task.configs.len(), took_ms = %t0.elapsed().as_millis(), "provider: delete ok");
        Ok(())
    }

    /// One full cycle: push every config from the store, resolve failures to
    /// owning objects, diff against the previous cycle, commit, write status.
    pub async fn sync_cycle(&self) -> CycleReport {
        let _guard = self.cycle_lock.lock().await;
        let t0 = Instant::now();
        let id = Uuid::new_v4().to_string();
        let configs = self.configs.read().await.configs_by_name();

        let errors: BTreeMap<String, ExecutionErrors> = match self.client.sync(&configs).await {
            Ok(()) => BTreeMap::new(),
            Err(e) => {
                warn!(cycle = %id, error = %e, "provider: sync failed");
                e.execution_errors()
            }
        };
        let current = self.client.with_store(|s| resolve(errors.values().flat_map(|e| e.errors.iter()), s)).await;
        let previous = self.failures.load_full();
        let updates = diff(&previous, &current);
        let failing_objects = current.len();
        self.failures.store(Arc::new(current));

        let planned: Vec<_> = {
            let cm = self.configs.read().await;
            updates.iter().filter_map(|u| plan(u, &cm, &self.settings.controller_name)).collect()
        };
        let status_updates = planned.len();
        for p in planned {
            if let Err(e) = self.status.update(p.kind, &p.key, p.mutate).await {
                warn!(cycle = %id, key = %p.key, error = %e, "provider: status update failed");
            }
        }

        self.cycles.fetch_add(1, Ordering::Relaxed);
        counter!("keel_sync_cycles_total", 1u64);
        let failed_configs: Vec<String> = errors.keys().cloned().collect();
        let unknown: BTreeMap<String, Vec<String>> =
            errors.iter().filter(|(_, e)| !e.unknown.is_empty()).map(|(n, e)| (n.clone(), e.unknown.clone())).collect();
        info!(
            cycle = %id,
            configs = configs.len(),
            failed = failed_configs.len(),
            failing_objects,
            status_updates,
            took_ms = %t0.elapsed().as_millis(),
            "provider: cycle done"
        );
        CycleReport { id, failed_configs, unknown, failing_objects, status_updates }
    }

    /// Run the control loop until `cancel` fires. A cycle already running is
    /// finished first; cancellation is only observed between cycles.
    pub async fn run(&self, cancel: CancellationToken) -> ProviderResult<()> {
        let mut rx = self.notify_rx.lock().await.take().ok_or(ProviderError::AlreadyRunning)?;
        let period = self.settings.sync_period;
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(period_secs = period.as_secs(), "provider: loop started");
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                Some(()) = rx.recv() => debug!("provider: notified"),
                _ = ticker.tick() => debug!("provider: tick"),
            }
            self.sync_cycle().await;
        }
        *self.notify_rx.lock().await = Some(rx);
        info!(cycles = self.cycles(), "provider: loop stopped");
        Ok(())
    }

    /// Objects currently failing, with their joined messages.
    pub fn failing(&self) -> Vec<(SourceKey, String)> {
        self.failures().iter().map(|(k, msgs)| (k.clone(), keel_status::join_messages(msgs))).collect()
    }
}
