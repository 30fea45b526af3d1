//! Main runtime orchestration.
//!
//! The runtime coordinates component lifecycle:
//! - Start order: storage → controller (restore) → bootstrap pools → audit loop
//! - Shutdown order: audit loop → controller → storage

use crate::core::config::Config;
use crate::mapping::{InstanceDirectory, NoInstances};
use crate::ops::audit::ConsistencyAudit;
use crate::service::{Controller, RestoreSummary};
use crate::storage::{EntityStore, FileStore, MemoryStore};
use anyhow::{Context, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Component health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentHealth {
    /// Component is starting.
    Starting,
    /// Component is healthy and operational.
    Healthy,
    /// Component is running without background tasks.
    Degraded,
    /// Component has failed.
    Failed,
    /// Component has stopped.
    Stopped,
}

/// Health status aggregated from all components.
#[derive(Debug, Clone)]
pub struct RuntimeHealth {
    /// Storage backend health.
    pub storage: ComponentHealth,
    /// Controller health.
    pub controller: ComponentHealth,
    /// Consistency audit loop health.
    pub audit: ComponentHealth,
}

impl Default for RuntimeHealth {
    fn default() -> Self {
        Self {
            storage: ComponentHealth::Starting,
            controller: ComponentHealth::Starting,
            audit: ComponentHealth::Starting,
        }
    }
}

impl RuntimeHealth {
    /// Check if the runtime is ready to serve requests.
    pub fn is_ready(&self) -> bool {
        matches!(
            (self.storage, self.controller, self.audit),
            (
                ComponentHealth::Healthy,
                ComponentHealth::Healthy,
                ComponentHealth::Healthy | ComponentHealth::Degraded
            )
        )
    }

    /// Check if the runtime is alive (not failed).
    pub fn is_alive(&self) -> bool {
        self.storage != ComponentHealth::Failed && self.controller != ComponentHealth::Failed
    }
}

/// Warden runtime holding all component handles.
pub struct Runtime {
    config: Arc<Config>,
    directory: Arc<dyn InstanceDirectory>,
    store: Option<Arc<dyn EntityStore>>,
    controller: Option<Arc<Controller>>,
    audit: Arc<ConsistencyAudit>,
    health: RuntimeHealth,
    running: Arc<AtomicBool>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    audit_handle: Option<JoinHandle<()>>,
}

impl Runtime {
    /// Create a new runtime with the given configuration.
    pub fn new(config: Config) -> Result<Self> {
        config.validate().context("invalid configuration")?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Ok(Self {
            config: Arc::new(config),
            directory: Arc::new(NoInstances),
            store: None,
            controller: None,
            audit: Arc::new(ConsistencyAudit::new()),
            health: RuntimeHealth::default(),
            running: Arc::new(AtomicBool::new(false)),
            shutdown_tx,
            shutdown_rx,
            audit_handle: None,
        })
    }

    /// Use a workload store for internal address lookups.
    pub fn with_directory(mut self, directory: Arc<dyn InstanceDirectory>) -> Self {
        self.directory = directory;
        self
    }

    /// Get the configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Get the controller (if started).
    pub fn controller(&self) -> Option<&Arc<Controller>> {
        self.controller.as_ref()
    }

    /// Get the consistency auditor.
    pub fn audit(&self) -> &Arc<ConsistencyAudit> {
        &self.audit
    }

    /// Get the current health status.
    pub fn health(&self) -> &RuntimeHealth {
        &self.health
    }

    /// Check if the runtime is ready to serve requests.
    pub fn is_ready(&self) -> bool {
        self.health.is_ready()
    }

    /// Check if the runtime is alive.
    pub fn is_alive(&self) -> bool {
        self.health.is_alive()
    }

    /// Check if the runtime is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Get a shutdown receiver for graceful shutdown coordination.
    pub fn shutdown_receiver(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }

    /// Initialize and start all runtime components.
    ///
    /// Components are started in order:
    /// 1. Storage backend
    /// 2. Controller, restored from storage
    /// 3. Bootstrap pools
    /// 4. Consistency audit loop
    pub async fn start(&mut self) -> Result<()> {
        tracing::info!(
            backend = %self.config.storage.backend,
            "starting Warden runtime"
        );

        self.init_storage()?;
        let summary = self.init_controller()?;
        self.bootstrap_pools()?;
        self.start_audit();

        self.running.store(true, Ordering::Release);
        tracing::info!(
            pools = summary.pools,
            mappings = summary.mappings,
            "Warden runtime started"
        );
        Ok(())
    }

    fn init_storage(&mut self) -> Result<()> {
        tracing::debug!("initializing storage backend");

        let store: Arc<dyn EntityStore> = match self.config.storage.backend.as_str() {
            "file" => {
                let path = self
                    .config
                    .storage
                    .path
                    .clone()
                    .context("storage.path required for the file backend")?;
                match FileStore::open(&path) {
                    Ok(store) => Arc::new(store),
                    Err(e) => {
                        self.health.storage = ComponentHealth::Failed;
                        return Err(e)
                            .with_context(|| format!("failed to open store {}", path.display()));
                    }
                }
            }
            _ => Arc::new(MemoryStore::new()),
        };

        tracing::info!(backend = store.backend_name(), "storage backend initialized");
        self.store = Some(store);
        self.health.storage = ComponentHealth::Healthy;
        Ok(())
    }

    fn init_controller(&mut self) -> Result<RestoreSummary> {
        let store = self
            .store
            .clone()
            .context("storage must be initialized before the controller")?;

        let controller = Controller::new(
            store,
            self.directory.clone(),
            self.config.controller_options(),
        );
        let summary = match controller.restore() {
            Ok(summary) => summary,
            Err(e) => {
                self.health.controller = ComponentHealth::Failed;
                return Err(e).context("failed to restore state");
            }
        };

        self.controller = Some(Arc::new(controller));
        self.health.controller = ComponentHealth::Healthy;
        Ok(summary)
    }

    fn bootstrap_pools(&mut self) -> Result<()> {
        let controller = self
            .controller
            .clone()
            .context("controller must be initialized before bootstrap")?;

        for pool in &self.config.bootstrap.pools {
            let created = controller
                .ensure_pool(&pool.name, &pool.subnets, &pool.addresses)
                .with_context(|| format!("failed to bootstrap pool {}", pool.name))?;
            if created {
                tracing::info!(name = %pool.name, "bootstrap pool created");
            } else {
                tracing::debug!(name = %pool.name, "bootstrap pool already present");
            }
        }
        Ok(())
    }

    fn start_audit(&mut self) {
        let seconds = self.config.runtime.audit_interval_seconds;
        let Some(controller) = self.controller.clone().filter(|_| seconds > 0) else {
            self.health.audit = ComponentHealth::Degraded;
            tracing::info!("consistency audit disabled");
            return;
        };

        let audit = self.audit.clone();
        let mut shutdown_rx = self.shutdown_rx.clone();
        let period = Duration::from_secs(seconds);

        self.audit_handle = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let report = audit.sweep(&controller);
                        if !report.is_clean() {
                            tracing::warn!(
                                confirmed = report.confirmed.len(),
                                "consistency audit found problems"
                            );
                        }
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            tracing::debug!("consistency audit loop stopped");
        }));

        self.health.audit = ComponentHealth::Healthy;
        tracing::info!(interval_seconds = seconds, "consistency audit started");
    }

    /// Trigger graceful shutdown.
    pub fn shutdown(&self) {
        tracing::info!("shutdown requested");
        let _ = self.shutdown_tx.send(true);
    }

    /// Wait for shutdown signal.
    pub async fn wait_for_shutdown(&mut self) {
        let mut rx = self.shutdown_rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }

    /// Run the runtime until ctrl-c or a shutdown request.
    pub async fn run(&mut self) -> Result<()> {
        self.start().await?;

        let mut shutdown_rx = self.shutdown_rx.clone();
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("shutdown signal received (SIGINT)");
            }
            _ = async {
                while !*shutdown_rx.borrow() {
                    if shutdown_rx.changed().await.is_err() {
                        break;
                    }
                }
            } => {
                tracing::info!("shutdown requested by component");
            }
        }

        self.stop().await
    }

    /// Stop all runtime components in reverse start order.
    pub async fn stop(&mut self) -> Result<()> {
        tracing::info!("stopping Warden runtime");
        self.running.store(false, Ordering::Release);
        let _ = self.shutdown_tx.send(true);

        if let Some(handle) = self.audit_handle.take() {
            match tokio::time::timeout(Duration::from_secs(5), handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!(error = %e, "audit task panicked"),
                Err(_) => tracing::warn!("audit task stop timed out"),
            }
        }
        self.health.audit = ComponentHealth::Stopped;

        self.controller = None;
        self.health.controller = ComponentHealth::Stopped;

        self.store = None;
        self.health.storage = ComponentHealth::Stopped;

        tracing::info!("Warden runtime stopped");
        Ok(())
    }
}
