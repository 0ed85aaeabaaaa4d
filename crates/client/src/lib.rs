//! Keel sync client: owns the resource store and pushes desired state to
//! backends through a pluggable [`Executor`].
//!
//! One async mutex serializes every store mutation and every backend
//! execution of a client. A full [`SyncClient::sync`] holds it for the whole
//! call, so store writes never interleave with a half-finished push.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::io::Write;
use std::path::PathBuf;
use std::time::Instant;

use keel_core::{Config, ExecutionError, ExecutionErrors, Labels, ResourceType, ResourceTypes, Resources, Task};
use keel_store::{Store, StoreError};
use metrics::{counter, histogram};
use tempfile::NamedTempFile;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub mod command;

pub use command::CommandExecutor;

/// Arguments for one backend execution.
#[derive(Debug, Clone)]
pub struct ExecArgs {
    /// JSON-serialized [`Resources`] snapshot.
    pub file_path: PathBuf,
    /// Scope of objects the backend should reconcile; empty = everything.
    pub labels: Labels,
    /// Categories present in the file; empty = all categories.
    pub resource_types: ResourceTypes,
}

#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    /// Structured failure that can be mapped back to source objects.
    #[error(transparent)]
    Execution(#[from] ExecutionError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Applies a resource snapshot to a live backend.
#[async_trait::async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, mode: &str, config: &Config, args: &ExecArgs) -> Result<(), ExecutorError>;
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("store: {0}")]
    Store(#[from] StoreError),
    #[error("writing resources file: {0}")]
    File(#[source] std::io::Error),
    #[error(transparent)]
    Execution(ExecutionErrors),
    #[error("failed to sync configs: {}", .failed.join(", "))]
    Sync { failed: Vec<String>, errors: BTreeMap<String, ExecutionErrors> },
}

impl ClientError {
    /// Structured execution errors carried by this error, per config name.
    pub fn execution_errors(&self) -> BTreeMap<String, ExecutionErrors> {
        match self {
            ClientError::Execution(e) => {
                let mut out: BTreeMap<String, ExecutionErrors> = BTreeMap::new();
                for err in &e.errors {
                    out.entry(err.config_name.clone()).or_default().errors.push(err.clone());
                }
                out
            }
            ClientError::Sync { errors, .. } => errors.clone(),
            _ => BTreeMap::new(),
        }
    }
}

pub type ClientResult<T> = Result<T, ClientError>;

/// Serialize resources into a temp file that is removed when dropped.
fn write_resources(resources: &Resources) -> ClientResult<NamedTempFile> {
    let t0 = Instant::now();
    let res = (|| -> std::io::Result<NamedTempFile> {
        let mut f = tempfile::Builder::new().prefix("keel-sync-").suffix(".json").tempfile()?;
        serde_json::to_writer(&mut f, resources)?;
        f.flush()?;
        Ok(f)
    })();
    let status = if res.is_ok() { "success" } else { "failure" };
    histogram!("keel_file_io_duration_seconds", t0.elapsed().as_secs_f64(), "operation" => "write", "status" => status);
    res.map_err(ClientError::File)
}

pub struct SyncClient {
    store: Mutex<Store>,
    executor: std::sync::Arc<dyn Executor>,
    backend_mode: String,
}

impl SyncClient {
    pub fn new(executor: std::sync::Arc<dyn Executor>, backend_mode: impl Into<String>) -> Self {
        Self { store: Mutex::new(Store::new()), executor, backend_mode: backend_mode.into() }
    }

    pub fn backend_mode(&self) -> &str { &self.backend_mode }

    /// Read access to the store under the client lock.
    pub async fn with_store<R>(&self, f: impl FnOnce(&Store) -> R) -> R {
        let store = self.store.lock().await;
        f(&store)
    }

    /// Record the task in the store for every target config.
    ///
    /// The first failing config aborts the call; configs written before it
    /// keep the new state.
    pub async fn insert(&self, task: &Task) -> ClientResult<()> {
        let mut store = self.store.lock().await;
        for config in &task.configs {
            store.insert(&config.name, &task.resource_types, &task.resources, &task.labels)?;
        }
        debug!(task = %task.name, configs = task.configs.len(), "client: insert ok");
        Ok(())
    }

    /// Drop the task's resources from the store for every target config.
    /// Same abort-without-rollback behaviour as [`SyncClient::insert`].
    pub async fn remove(&self, task: &Task) -> ClientResult<()> {
        let mut store = self.store.lock().await;
        for config in &task.configs {
            store.delete(&config.name, &task.resource_types, &task.labels)?;
        }
        debug!(task = %task.name, configs = task.configs.len(), "client: remove ok");
        Ok(())
    }

    /// Push the task's resources straight to its backends.
    pub async fn update(&self, task: &Task) -> ClientResult<()> {
        let store = self.store.lock().await;
        self.sync_task(&store, task).await
    }

    /// Full reconciliation of the named configs from the store.
    ///
    /// Configs with nothing stored are skipped. One config failing never
    /// stops the others; the error lists every failing name and carries the
    /// per-config execution errors.
    pub async fn sync(&self, configs: &BTreeMap<String, Config>) -> ClientResult<()> {
        let t0 = Instant::now();
        let store = self.store.lock().await;
        let mut failed: Vec<String> = Vec::new();
        let mut errors: BTreeMap<String, ExecutionErrors> = BTreeMap::new();
        for (name, config) in configs {
            let Some(resources) = store.get_resources(name) else {
                debug!(config = %name, "client: nothing stored; skip");
                continue;
            };
            let task = Task {
                key: None,
                name: format!("{}-sync", name),
                labels: Labels::new(),
                configs: vec![config.clone()],
                resource_types: ResourceTypes::new(),
                resources,
            };
            match self.sync_task(&store, &task).await {
                Ok(()) => {}
                Err(ClientError::Execution(e)) => {
                    failed.push(name.clone());
                    errors.insert(name.clone(), e);
                }
                Err(other) => {
                    failed.push(name.clone());
                    errors.insert(name.clone(), ExecutionErrors { errors: vec![], unknown: vec![other.to_string()] });
                }
            }
        }
        info!(configs = configs.len(), failed = failed.len(), took_ms = %t0.elapsed().as_millis(), "client: sync done");
        if failed.is_empty() { Ok(()) } else { Err(ClientError::Sync { failed, errors }) }
    }

    async fn sync_task(&self, store: &Store, task: &Task) -> ClientResult<()> {
        let mut errs = ExecutionErrors::default();
        if task.resource_types.contains(&ResourceType::GlobalRule) {
            // global rules are a merge across every object targeting the config
            for config in &task.configs {
                let mut resources = task.resources.clone();
                resources.global_rules = store.merged_global_rules(&config.name);
                match write_resources(&resources) {
                    Ok(file) => self.execute(config, &file, task, &mut errs).await,
                    Err(e) => {
                        warn!(config = %config.name, error = %e, "client: resources file failed");
                        errs.unknown.push(format!("config {}: {}", config.name, e));
                    }
                }
            }
        } else {
            let file = write_resources(&task.resources)?;
            for config in &task.configs {
                self.execute(config, &file, task, &mut errs).await;
            }
        }
        if errs.is_empty() { Ok(()) } else { Err(ClientError::Execution(errs)) }
    }

    async fn execute(&self, config: &Config, file: &NamedTempFile, task: &Task, errs: &mut ExecutionErrors) {
        let args = ExecArgs {
            file_path: file.path().to_path_buf(),
            labels: task.labels.clone(),
            resource_types: task.resource_types.clone(),
        };
        let t0 = Instant::now();
        let res = self.executor.execute(&self.backend_mode, config, &args).await;
        let status = if res.is_ok() { "success" } else { "failure" };
        histogram!(
            "keel_sync_duration_seconds",
            t0.elapsed().as_secs_f64(),
            "config" => config.name.clone(),
            "resource_types" => ResourceType::join(&task.resource_types),
            "status" => status
        );
        match res {
            Ok(()) => debug!(task = %task.name, config = %config.name, "client: execute ok"),
            Err(ExecutorError::Execution(e)) => {
                warn!(task = %task.name, config = %config.name, error = %e, "client: execute failed");
                counter!("keel_execution_errors_total", 1u64, "config" => config.name.clone(), "error" => "execution");
                errs.errors.push(e);
            }
            Err(ExecutorError::Other(e)) => {
                warn!(task = %task.name, config = %config.name, error = %e, "client: execute failed (unknown)");
                counter!("keel_execution_errors_total", 1u64, "config" => config.name.clone(), "error" => "unknown");
                errs.unknown.push(format!("config {}: {}", config.name, e));
            }
        }
    }
}
