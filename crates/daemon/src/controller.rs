//! Lab lifecycle controller
//!
//! Owns the table of labs this process manages, serializes start/stop/restart
//! per lab, and keeps the registry's declared status in step with what the
//! compose launcher actually did.
//!
//! Locking: every mutating operation holds the lab's async mutex for its full
//! duration, so operations on one lab never interleave while different labs
//! proceed in parallel. The active table itself sits behind a short-lived
//! `RwLock` that is never held across an await. Where both are taken, the lab
//! mutex comes first, then the table, then the registry.

use crate::compose::{project_containers, working_dir_forms, ComposeLauncher};
use crate::config::DaemonConfig;
use crate::runtime::{ContainerStats, PruneReport, RuntimeClient};
use crate::sweep::{HealthSweep, SweepHandle};
use chrono::{DateTime, Utc};
use cyberlab_common::{
    ActivityKind, Error, LabDefinition, LabId, LabRegistry, LabStatus, Result, ServiceEndpoint,
    SessionId, UserId,
};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Tunables the controller needs from the daemon configuration
#[derive(Debug, Clone)]
pub struct ControllerOptions {
    pub labs_root: PathBuf,
    pub auto_recovery: bool,
    pub restart_settle: Duration,
    pub sweep_interval: Duration,
}

impl ControllerOptions {
    pub fn from_config(config: &DaemonConfig) -> Self {
        Self {
            labs_root: config.labs_root.clone(),
            auto_recovery: config.controller.auto_recovery,
            restart_settle: config.controller.restart_settle(),
            sweep_interval: config.controller.sweep_interval(),
        }
    }
}

/// Bookkeeping for one lab this controller manages
#[derive(Debug, Clone, Serialize)]
pub struct ActiveLabEntry {
    pub lab_id: LabId,
    pub lab_name: String,
    pub container_ids: Vec<String>,
    pub session_id: SessionId,
    pub user_id: UserId,
    pub started_at: DateTime<Utc>,
    /// Cleared by the health sweep when recovery is disabled
    pub healthy: bool,
}

impl ActiveLabEntry {
    pub fn uptime_ms(&self) -> u64 {
        (Utc::now() - self.started_at).num_milliseconds().max(0) as u64
    }
}

/// Successful start
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartedLab {
    pub lab_id: LabId,
    pub session_id: SessionId,
    pub container_ids: Vec<String>,
    pub ports: Vec<u16>,
    pub services: Vec<ServiceEndpoint>,
}

/// Point-in-time view of one lab
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LabStatusReport {
    pub lab_id: LabId,
    pub status: LabStatus,
    pub is_active: bool,
    pub uptime_ms: Option<u64>,
    pub session_id: Option<SessionId>,
    pub healthy: Option<bool>,
}

/// Lab definition merged with its current status
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LabOverview {
    #[serde(flatten)]
    pub lab: LabDefinition,
    pub is_active: bool,
    pub uptime_ms: Option<u64>,
    pub session_id: Option<SessionId>,
}

/// Runtime reachability summary
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeOverview {
    pub available: bool,
    pub info: Option<serde_json::Value>,
    pub active_labs: usize,
}

/// Outcome of one sweep-triggered recovery
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryOutcome {
    Recovered,
    Failed(String),
    /// Another lifecycle operation held the lab, or it is no longer managed
    Skipped,
}

pub struct LabController {
    registry: Arc<dyn LabRegistry>,
    runtime: Arc<dyn RuntimeClient>,
    compose: Arc<dyn ComposeLauncher>,
    options: ControllerOptions,
    active: RwLock<HashMap<LabId, ActiveLabEntry>>,
    locks: DashMap<LabId, Arc<Mutex<()>>>,
}

impl LabController {
    pub fn new(
        registry: Arc<dyn LabRegistry>,
        runtime: Arc<dyn RuntimeClient>,
        compose: Arc<dyn ComposeLauncher>,
        options: ControllerOptions,
    ) -> Self {
        Self {
            registry,
            runtime,
            compose,
            options,
            active: RwLock::new(HashMap::new()),
            locks: DashMap::new(),
        }
    }

    pub fn options(&self) -> &ControllerOptions {
        &self.options
    }

    pub fn runtime(&self) -> &Arc<dyn RuntimeClient> {
        &self.runtime
    }

    /// Start the periodic health sweep for this controller
    pub fn spawn_health_sweep(self: &Arc<Self>) -> SweepHandle {
        HealthSweep::new(self.clone(), self.options.sweep_interval).spawn()
    }

    /// Mutex for a registered lab. Unknown ids never get a table slot.
    fn lab_lock(&self, lab_id: LabId) -> Result<Arc<Mutex<()>>> {
        if let Some(lock) = self.locks.get(&lab_id) {
            return Ok(lock.value().clone());
        }
        self.load_lab(lab_id)?;
        Ok(self.locks.entry(lab_id).or_default().clone())
    }

    /// Whether a lifecycle operation currently holds the lab
    pub fn is_busy(&self, lab_id: LabId) -> bool {
        self.locks
            .get(&lab_id)
            .map_or(false, |lock| lock.value().try_lock().is_err())
    }

    fn load_lab(&self, lab_id: LabId) -> Result<LabDefinition> {
        self.registry
            .get_lab_by_id(lab_id)?
            .ok_or_else(|| Error::lab_not_found(lab_id))
    }

    fn definition_path(&self, lab: &LabDefinition) -> PathBuf {
        resolve_definition(&self.options.labs_root, &lab.compose_path)
    }

    fn set_status(&self, lab_id: LabId, from: LabStatus, to: LabStatus) -> Result<()> {
        if !from.can_transition_to(to) {
            return Err(Error::InvalidStateTransition {
                from: from.to_string(),
                to: to.to_string(),
            });
        }
        self.registry.update_lab_status(lab_id, to)?;
        debug!("Lab {}: {} -> {}", lab_id, from, to);
        Ok(())
    }

    fn record_activity(&self, user_id: UserId, lab_id: LabId, kind: ActivityKind, title: String) {
        if let Err(e) = self.registry.log_activity(user_id, lab_id, kind, &title) {
            warn!("Failed to log {} for lab {}: {}", kind.as_str(), lab_id, e);
        }
    }

    fn mark_error(&self, lab_id: LabId) {
        if let Err(e) = self.registry.update_lab_status(lab_id, LabStatus::Error) {
            warn!("Failed to mark lab {} as error: {}", lab_id, e);
        }
    }

    fn close_session(&self, session_id: SessionId) {
        if let Err(e) = self.registry.end_session(session_id) {
            warn!("Failed to close session {}: {}", session_id, e);
        }
    }

    fn close_open_sessions(&self, lab_id: LabId) -> Result<usize> {
        let sessions = self.registry.open_sessions_for_lab(lab_id)?;
        for session in &sessions {
            self.close_session(session.id);
        }
        Ok(sessions.len())
    }

    // ========================================================================
    // Lifecycle operations
    // ========================================================================

    /// Launch a lab's containers on behalf of `user_id`
    pub async fn start_lab(&self, lab_id: LabId, user_id: UserId) -> Result<StartedLab> {
        let lock = self.lab_lock(lab_id)?;
        let _guard = lock.lock().await;
        self.start_locked(lab_id, user_id).await
    }

    async fn start_locked(&self, lab_id: LabId, user_id: UserId) -> Result<StartedLab> {
        if !self.runtime.is_available().await {
            return Err(Error::RuntimeUnavailable(
                "Container runtime is not running. Start Docker and try again.".to_string(),
            ));
        }

        let lab = self.load_lab(lab_id)?;
        if self.active.read().contains_key(&lab_id) {
            return Err(Error::AlreadyRunning { lab_id });
        }

        // Leftovers from a failed run must be torn down before a fresh start.
        if lab.status != LabStatus::Stopped {
            self.clean_up_locked(&lab).await?;
        }

        self.set_status(lab_id, LabStatus::Stopped, LabStatus::Starting)?;
        let session_id = match self.registry.create_session(user_id, lab_id) {
            Ok(id) => id,
            Err(e) => {
                warn!("Could not open a session for lab {}: {}", lab_id, e);
                self.mark_error(lab_id);
                return Err(e);
            }
        };
        info!("Starting lab {} ({}) for user {}", lab.name, lab_id, user_id);

        let definition = self.definition_path(&lab);
        let up = match self.compose.up(&definition).await {
            Ok(up) => up,
            Err(e) => {
                warn!("Lab {} failed to start: {}", lab_id, e);
                self.mark_error(lab_id);
                self.close_session(session_id);
                return Err(e);
            }
        };

        let entry = ActiveLabEntry {
            lab_id,
            lab_name: lab.name.clone(),
            container_ids: up.container_ids.clone(),
            session_id,
            user_id,
            started_at: Utc::now(),
            healthy: true,
        };

        let marked = {
            // Entry and status land together for readers. No entry without `running`.
            let mut active = self.active.write();
            let marked = self.set_status(lab_id, LabStatus::Starting, LabStatus::Running);
            if marked.is_ok() {
                active.insert(lab_id, entry);
            }
            marked
        };
        if let Err(e) = marked {
            // Containers are up but unrecorded; the next start or cleanup tears them down.
            warn!("Lab {} came up but could not be marked running: {}", lab_id, e);
            self.mark_error(lab_id);
            self.close_session(session_id);
            return Err(e);
        }

        self.record_activity(
            user_id,
            lab_id,
            ActivityKind::LabStarted,
            format!("Started lab: {}", lab.name),
        );
        info!("Lab {} running with {} containers", lab_id, up.container_ids.len());

        Ok(StartedLab {
            lab_id,
            session_id,
            container_ids: up.container_ids,
            ports: lab.ports,
            services: lab.services,
        })
    }

    /// Tear a managed lab down
    pub async fn stop_lab(&self, lab_id: LabId, user_id: UserId) -> Result<()> {
        let lock = self.lab_lock(lab_id)?;
        let _guard = lock.lock().await;
        self.stop_locked(lab_id, user_id).await
    }

    async fn stop_locked(&self, lab_id: LabId, user_id: UserId) -> Result<()> {
        let entry = self
            .active
            .read()
            .get(&lab_id)
            .cloned()
            .ok_or(Error::NotRunning { lab_id })?;
        let lab = self.load_lab(lab_id)?;

        self.set_status(lab_id, lab.status, LabStatus::Stopping)?;
        info!("Stopping lab {} ({})", lab.name, lab_id);

        let definition = self.definition_path(&lab);
        if let Err(e) = self.compose.down(&definition).await {
            // Container state is unknown; leave the lab in `stopping` and keep the entry.
            warn!("Lab {} left in stopping, teardown failed: {}", lab_id, e);
            return Err(e);
        }

        {
            let mut active = self.active.write();
            active.remove(&lab_id);
            if let Err(e) = self.set_status(lab_id, LabStatus::Stopping, LabStatus::Stopped) {
                warn!("Failed to mark lab {} as stopped: {}", lab_id, e);
            }
        }
        self.close_session(entry.session_id);
        self.record_activity(
            user_id,
            lab_id,
            ActivityKind::LabStopped,
            format!("Stopped lab: {}", lab.name),
        );
        info!("Lab {} stopped", lab_id);
        Ok(())
    }

    /// Stop, settle, start. Not atomic: a crash in between leaves the lab stopped.
    pub async fn restart_lab(&self, lab_id: LabId, user_id: UserId) -> Result<StartedLab> {
        let lock = self.lab_lock(lab_id)?;
        let _guard = lock.lock().await;
        self.restart_locked(lab_id, user_id).await
    }

    async fn restart_locked(&self, lab_id: LabId, user_id: UserId) -> Result<StartedLab> {
        self.stop_locked(lab_id, user_id).await?;
        tokio::time::sleep(self.options.restart_settle).await;
        self.start_locked(lab_id, user_id).await
    }

    /// Return an unmanaged lab in `error` (or any stale active status) to `stopped`
    pub async fn clean_up_lab(&self, lab_id: LabId) -> Result<()> {
        let lock = self.lab_lock(lab_id)?;
        let _guard = lock.lock().await;

        if self.active.read().contains_key(&lab_id) {
            return Err(Error::AlreadyRunning { lab_id });
        }
        let lab = self.load_lab(lab_id)?;
        self.clean_up_locked(&lab).await
    }

    async fn clean_up_locked(&self, lab: &LabDefinition) -> Result<()> {
        let lab_id = lab.id;
        if lab.status == LabStatus::Stopped {
            self.close_open_sessions(lab_id)?;
            return Ok(());
        }

        if lab.status != LabStatus::Error {
            self.set_status(lab_id, lab.status, LabStatus::Error)?;
        }

        info!("Cleaning up lab {} ({})", lab.name, lab_id);
        let definition = self.definition_path(lab);
        match self.compose.down(&definition).await {
            Ok(()) => {}
            Err(Error::DefinitionNotFound(_)) => {
                let removed = self.remove_leftovers(&definition).await?;
                if removed > 0 {
                    info!("Removed {} leftover containers of lab {}", removed, lab_id);
                }
            }
            Err(e) => {
                warn!("Cleanup of lab {} failed: {}", lab_id, e);
                return Err(e);
            }
        }

        let closed = self.close_open_sessions(lab_id)?;
        if closed > 0 {
            debug!("Closed {} stale sessions for lab {}", closed, lab_id);
        }
        self.set_status(lab_id, LabStatus::Error, LabStatus::Stopped)
    }

    /// Without a definition compose cannot tear down; remove containers still
    /// labelled with the lab's directory instead.
    async fn remove_leftovers(&self, definition: &Path) -> Result<usize> {
        let Some(dir) = definition.parent() else {
            return Ok(0);
        };
        let containers = self.runtime.list_containers(true).await?;
        let ids = project_containers(&containers, &working_dir_forms(dir));
        for id in &ids {
            self.runtime.remove(id, true).await?;
        }
        Ok(ids.len())
    }

    /// Stop every managed lab concurrently. Callers bound the total wait.
    pub async fn stop_all_labs(&self) -> Vec<(LabId, Result<()>)> {
        let targets: Vec<(LabId, UserId)> = self
            .active
            .read()
            .values()
            .map(|e| (e.lab_id, e.user_id))
            .collect();

        info!("Stopping {} active labs", targets.len());
        let stops = targets.into_iter().map(|(lab_id, user_id)| async move {
            (lab_id, self.stop_lab(lab_id, user_id).await)
        });
        futures::future::join_all(stops).await
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Declared status plus the controller's view. Reconciles obvious
    /// divergence when no operation is in flight for the lab.
    pub fn get_lab_status(&self, lab_id: LabId) -> Result<LabStatusReport> {
        let lock = self.lab_lock(lab_id)?;
        let idle = lock.try_lock().ok();

        let active = self.active.read();
        let lab = self.load_lab(lab_id)?;
        let entry = active.get(&lab_id);
        let mut status = lab.status;

        if idle.is_some() {
            let diverged = match entry {
                None => status.is_active(),
                Some(e) => !e.healthy && status == LabStatus::Running,
            };
            if diverged {
                warn!(
                    "Lab {} is {} in the registry but {}; marking error",
                    lab_id,
                    status,
                    if entry.is_some() { "unhealthy" } else { "not managed" }
                );
                self.registry.update_lab_status(lab_id, LabStatus::Error)?;
                status = LabStatus::Error;
            }
        }

        Ok(LabStatusReport {
            lab_id,
            status,
            is_active: entry.is_some(),
            uptime_ms: entry.map(ActiveLabEntry::uptime_ms),
            session_id: entry.map(|e| e.session_id),
            healthy: entry.map(|e| e.healthy),
        })
    }

    /// Every registered lab with its current status
    pub fn get_all_labs_status(&self) -> Result<Vec<LabOverview>> {
        let labs = self.registry.list_labs()?;
        labs.into_iter()
            .map(|mut lab| {
                let report = self.get_lab_status(lab.id)?;
                lab.status = report.status;
                Ok(LabOverview {
                    lab,
                    is_active: report.is_active,
                    uptime_ms: report.uptime_ms,
                    session_id: report.session_id,
                })
            })
            .collect()
    }

    /// Tail of each container's logs, keyed by container id
    pub async fn get_lab_logs(&self, lab_id: LabId, tail_lines: usize) -> Result<BTreeMap<String, String>> {
        let container_ids = self
            .active
            .read()
            .get(&lab_id)
            .map(|e| e.container_ids.clone())
            .ok_or(Error::NotRunning { lab_id })?;

        let mut logs = BTreeMap::new();
        for id in container_ids {
            let text = self.runtime.logs(&id, tail_lines).await?;
            logs.insert(id, text);
        }
        Ok(logs)
    }

    /// Resource usage of each container of a managed lab
    pub async fn get_lab_stats(&self, lab_id: LabId) -> Result<BTreeMap<String, ContainerStats>> {
        let container_ids = self
            .active
            .read()
            .get(&lab_id)
            .map(|e| e.container_ids.clone())
            .ok_or(Error::NotRunning { lab_id })?;

        let mut stats = BTreeMap::new();
        for id in container_ids {
            let sample = self.runtime.container_stats(&id).await?;
            stats.insert(id, sample);
        }
        Ok(stats)
    }

    /// Snapshot of the labs this controller manages
    pub fn active_labs(&self) -> Vec<ActiveLabEntry> {
        self.active.read().values().cloned().collect()
    }

    pub fn is_managed(&self, lab_id: LabId) -> bool {
        self.active.read().contains_key(&lab_id)
    }

    pub async fn runtime_overview(&self) -> RuntimeOverview {
        let available = self.runtime.is_available().await;
        let info = if available {
            self.runtime.system_info().await
        } else {
            None
        };
        RuntimeOverview {
            available,
            info,
            active_labs: self.active.read().len(),
        }
    }

    /// Bulk-remove stopped containers and unused networks/volumes
    pub async fn prune_runtime(&self) -> Result<PruneReport> {
        if !self.runtime.is_available().await {
            return Err(Error::RuntimeUnavailable("Container runtime is not running".to_string()));
        }
        let report = self.runtime.prune_unused().await?;
        info!("Pruned unused runtime resources");
        Ok(report)
    }

    // ========================================================================
    // Reconciliation and recovery
    // ========================================================================

    /// Mark labs the registry believes are up, but which this process does not
    /// manage, as `error` and close their sessions. Run once at startup.
    pub fn reconcile_registry(&self) -> Result<Vec<LabId>> {
        let mut marked = Vec::new();
        for lab in self.registry.list_labs()? {
            if self.is_managed(lab.id) {
                continue;
            }
            if lab.status.is_active() {
                warn!("Lab {} was left {}; marking error", lab.id, lab.status);
                self.registry.update_lab_status(lab.id, LabStatus::Error)?;
                marked.push(lab.id);
            }
            let closed = self.close_open_sessions(lab.id)?;
            if closed > 0 {
                info!("Closed {} orphaned sessions for lab {}", closed, lab.id);
            }
        }
        Ok(marked)
    }

    /// Record the sweep's verdict on an entry
    pub fn set_healthy(&self, lab_id: LabId, healthy: bool) {
        if let Some(entry) = self.active.write().get_mut(&lab_id) {
            entry.healthy = healthy;
        }
    }

    /// Restart a lab found unhealthy, as the user who started it. Gives up
    /// after one attempt: the entry is dropped, its session closed and the lab
    /// marked `error`.
    pub async fn recover_lab(&self, lab_id: LabId) -> RecoveryOutcome {
        let Ok(lock) = self.lab_lock(lab_id) else {
            return RecoveryOutcome::Skipped;
        };
        let Ok(_guard) = lock.try_lock() else {
            return RecoveryOutcome::Skipped;
        };
        let entry = self.active.read().get(&lab_id).cloned();
        let Some(entry) = entry else {
            return RecoveryOutcome::Skipped;
        };

        info!("Attempting to recover lab {} ({})", entry.lab_name, lab_id);
        match self.restart_locked(lab_id, entry.user_id).await {
            Ok(_) => {
                info!("Lab {} recovered", lab_id);
                self.record_activity(
                    entry.user_id,
                    lab_id,
                    ActivityKind::LabRecovered,
                    format!("Auto-recovered lab: {}", entry.lab_name),
                );
                RecoveryOutcome::Recovered
            }
            Err(e) => {
                warn!("Failed to recover lab {}: {}", lab_id, e);
                let leftover = self.active.write().remove(&lab_id);
                if let Some(leftover) = leftover {
                    self.close_session(leftover.session_id);
                }
                self.mark_error(lab_id);
                RecoveryOutcome::Failed(e.to_string())
            }
        }
    }
}

/// Relative compose paths resolve against the labs root
pub fn resolve_definition(labs_root: &Path, compose_path: &Path) -> PathBuf {
    if compose_path.is_absolute() {
        compose_path.to_path_buf()
    } else {
        labs_root.join(compose_path)
    }
}
