//! In-process fakes for the registry, runtime and compose seams

use crate::compose::{ComposeLauncher, ComposeUp};
use crate::controller::{ControllerOptions, LabController};
use crate::runtime::{
    ContainerDetail, ContainerState, ContainerStats, ContainerSummary, PruneReport, RuntimeClient,
    COMPOSE_WORKING_DIR_LABEL,
};
use async_trait::async_trait;
use cyberlab_common::{
    ActivityKind, Database, Error, LabDefinition, LabId, LabRegistry, LabStatus, NewLab, Result, Session,
    SessionId, UserId,
};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Runtime whose containers are a map of id -> status
pub struct FakeRuntime {
    available: AtomicBool,
    containers: Mutex<HashMap<String, String>>,
    working_dirs: Mutex<HashMap<String, String>>,
    broken_inspect: Mutex<HashSet<String>>,
    networks: Mutex<HashSet<String>>,
    volumes: Mutex<HashSet<String>>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self {
            available: AtomicBool::new(true),
            containers: Mutex::new(HashMap::new()),
            working_dirs: Mutex::new(HashMap::new()),
            broken_inspect: Mutex::new(HashSet::new()),
            networks: Mutex::new(HashSet::new()),
            volumes: Mutex::new(HashSet::new()),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn set_status(&self, id: &str, status: &str) {
        self.containers.lock().insert(id.to_string(), status.to_string());
    }

    /// Add a container stamped with a compose working directory
    pub fn add_compose_container(&self, id: &str, status: &str, working_dir: &Path) {
        self.set_status(id, status);
        self.working_dirs
            .lock()
            .insert(id.to_string(), working_dir.to_string_lossy().to_string());
    }

    pub fn contains(&self, id: &str) -> bool {
        self.containers.lock().contains_key(id)
    }

    pub fn forget(&self, id: &str) {
        self.containers.lock().remove(id);
        self.working_dirs.lock().remove(id);
    }

    pub fn has_network(&self, name: &str) -> bool {
        self.networks.lock().contains(name)
    }

    pub fn has_volume(&self, name: &str) -> bool {
        self.volumes.lock().contains(name)
    }

    fn missing_container(container_id: &str) -> Error {
        Error::NotFound {
            kind: "container".to_string(),
            id: container_id.to_string(),
        }
    }

    /// Make inspect of `id` fail with a runtime error
    pub fn break_inspect(&self, id: &str) {
        self.broken_inspect.lock().insert(id.to_string());
    }
}

#[async_trait]
impl RuntimeClient for FakeRuntime {
    async fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    async fn system_info(&self) -> Option<serde_json::Value> {
        self.is_available()
            .await
            .then(|| serde_json::json!({ "ServerVersion": "fake" }))
    }

    async fn list_containers(&self, include_stopped: bool) -> Result<Vec<ContainerSummary>> {
        let working_dirs = self.working_dirs.lock();
        Ok(self
            .containers
            .lock()
            .iter()
            .filter(|(_, status)| include_stopped || status.as_str() == "running")
            .map(|(id, status)| ContainerSummary {
                id: id.clone(),
                names: vec![id.clone()],
                image: "fake".to_string(),
                state: status.clone(),
                status: status.clone(),
                labels: working_dirs
                    .get(id)
                    .map(|wd| HashMap::from([(COMPOSE_WORKING_DIR_LABEL.to_string(), wd.clone())]))
                    .unwrap_or_default(),
            })
            .collect())
    }

    async fn inspect(&self, container_id: &str) -> Result<Option<ContainerDetail>> {
        if self.broken_inspect.lock().contains(container_id) {
            return Err(Error::Runtime(format!("inspect {} failed", container_id)));
        }
        Ok(self.containers.lock().get(container_id).map(|status| ContainerDetail {
            id: container_id.to_string(),
            name: container_id.to_string(),
            image: "fake".to_string(),
            state: ContainerState {
                status: status.clone(),
                exit_code: None,
                started_at: None,
                finished_at: None,
            },
            labels: HashMap::new(),
        }))
    }

    async fn start(&self, container_id: &str) -> Result<()> {
        self.set_status(container_id, "running");
        Ok(())
    }

    async fn stop(&self, container_id: &str, _timeout: Duration) -> Result<()> {
        self.set_status(container_id, "exited");
        Ok(())
    }

    async fn remove(&self, container_id: &str, _force: bool) -> Result<()> {
        self.forget(container_id);
        Ok(())
    }

    async fn logs(&self, container_id: &str, tail_lines: usize) -> Result<String> {
        if !self.containers.lock().contains_key(container_id) {
            return Err(Self::missing_container(container_id));
        }
        Ok(format!("{} last {} lines\n", container_id, tail_lines))
    }

    async fn container_stats(&self, container_id: &str) -> Result<ContainerStats> {
        if !self.containers.lock().contains_key(container_id) {
            return Err(Self::missing_container(container_id));
        }
        Ok(ContainerStats {
            cpu_percent: "0.50%".to_string(),
            memory_usage: "16MiB / 1GiB".to_string(),
            memory_percent: "1.56%".to_string(),
            pids: "3".to_string(),
            ..ContainerStats::default()
        })
    }

    async fn create_network(&self, name: &str, _driver: &str) -> Result<String> {
        if !self.networks.lock().insert(name.to_string()) {
            return Err(Error::Runtime(format!("network with name {} already exists", name)));
        }
        Ok(format!("net-{}", name))
    }

    async fn remove_network(&self, name: &str) -> Result<()> {
        if !self.networks.lock().remove(name) {
            return Err(Error::Runtime(format!("network {} not found", name)));
        }
        Ok(())
    }

    async fn create_volume(&self, name: &str) -> Result<String> {
        self.volumes.lock().insert(name.to_string());
        Ok(name.to_string())
    }

    async fn remove_volume(&self, name: &str) -> Result<()> {
        if !self.volumes.lock().remove(name) {
            return Err(Error::Runtime(format!("no such volume: {}", name)));
        }
        Ok(())
    }

    async fn prune_unused(&self) -> Result<PruneReport> {
        let mut containers = self.containers.lock();
        let before = containers.len();
        containers.retain(|_, status| status.as_str() == "running");
        let networks = std::mem::take(&mut *self.networks.lock());
        let volumes = std::mem::take(&mut *self.volumes.lock());
        Ok(PruneReport {
            containers: format!("Deleted {} containers", before - containers.len()),
            networks: format!("Deleted {} networks", networks.len()),
            volumes: format!("Deleted {} volumes", volumes.len()),
        })
    }
}

/// Compose launcher that creates `containers_per_lab` fake containers per up
pub struct FakeCompose {
    runtime: Arc<FakeRuntime>,
    containers_per_lab: AtomicUsize,
    delay: Mutex<Duration>,
    fail_up: Mutex<Option<String>>,
    fail_down: Mutex<Option<String>>,
    launched: Mutex<HashMap<PathBuf, Vec<String>>>,
    generation: AtomicUsize,
    pub up_calls: AtomicUsize,
    pub down_calls: AtomicUsize,
}

impl FakeCompose {
    pub fn new(runtime: Arc<FakeRuntime>) -> Self {
        Self {
            runtime,
            containers_per_lab: AtomicUsize::new(2),
            delay: Mutex::new(Duration::ZERO),
            fail_up: Mutex::new(None),
            fail_down: Mutex::new(None),
            launched: Mutex::new(HashMap::new()),
            generation: AtomicUsize::new(0),
            up_calls: AtomicUsize::new(0),
            down_calls: AtomicUsize::new(0),
        }
    }

    pub fn set_containers_per_lab(&self, count: usize) {
        self.containers_per_lab.store(count, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    pub fn fail_up(&self, output: Option<&str>) {
        *self.fail_up.lock() = output.map(str::to_string);
    }

    pub fn fail_down(&self, output: Option<&str>) {
        *self.fail_down.lock() = output.map(str::to_string);
    }

    pub fn ups(&self) -> usize {
        self.up_calls.load(Ordering::SeqCst)
    }

    pub fn downs(&self) -> usize {
        self.down_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ComposeLauncher for FakeCompose {
    async fn up(&self, definition: &Path) -> Result<ComposeUp> {
        if !definition.is_file() {
            return Err(Error::DefinitionNotFound(definition.to_path_buf()));
        }
        self.up_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock();
        tokio::time::sleep(delay).await;

        if let Some(output) = self.fail_up.lock().clone() {
            return Err(Error::ComposeExit { code: Some(1), output });
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst);
        let project = definition
            .parent()
            .and_then(|p| p.file_name())
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let ids: Vec<String> = (0..self.containers_per_lab.load(Ordering::SeqCst))
            .map(|n| format!("{}-g{}-{}", project, generation, n))
            .collect();
        for id in &ids {
            self.runtime.set_status(id, "running");
        }
        self.launched.lock().insert(definition.to_path_buf(), ids.clone());

        Ok(ComposeUp {
            container_ids: ids,
            output: String::new(),
        })
    }

    async fn down(&self, definition: &Path) -> Result<()> {
        if !definition.is_file() {
            return Err(Error::DefinitionNotFound(definition.to_path_buf()));
        }
        self.down_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock();
        tokio::time::sleep(delay).await;

        if let Some(output) = self.fail_down.lock().clone() {
            return Err(Error::ComposeExit { code: Some(1), output });
        }

        if let Some(ids) = self.launched.lock().remove(definition) {
            for id in ids {
                self.runtime.forget(&id);
            }
        }
        Ok(())
    }
}

/// Registry that delegates to a real database but can be told to fail writes
pub struct FlakyRegistry {
    inner: Database,
    fail_status: Mutex<Option<LabStatus>>,
    fail_sessions: AtomicBool,
}

impl FlakyRegistry {
    pub fn new(inner: Database) -> Self {
        Self {
            inner,
            fail_status: Mutex::new(None),
            fail_sessions: AtomicBool::new(false),
        }
    }

    /// Fail every status update to `status`
    pub fn fail_status(&self, status: Option<LabStatus>) {
        *self.fail_status.lock() = status;
    }

    pub fn fail_sessions(&self, fail: bool) {
        self.fail_sessions.store(fail, Ordering::SeqCst);
    }
}

impl LabRegistry for FlakyRegistry {
    fn get_lab_by_id(&self, id: LabId) -> Result<Option<LabDefinition>> {
        self.inner.get_lab_by_id(id)
    }

    fn list_labs(&self) -> Result<Vec<LabDefinition>> {
        self.inner.list_labs()
    }

    fn update_lab_status(&self, id: LabId, status: LabStatus) -> Result<()> {
        if *self.fail_status.lock() == Some(status) {
            return Err(Error::Internal(format!("registry refused status {}", status)));
        }
        self.inner.update_lab_status(id, status)
    }

    fn create_session(&self, user_id: UserId, lab_id: LabId) -> Result<SessionId> {
        if self.fail_sessions.load(Ordering::SeqCst) {
            return Err(Error::Internal("registry refused session".to_string()));
        }
        self.inner.create_session(user_id, lab_id)
    }

    fn end_session(&self, session_id: SessionId) -> Result<()> {
        self.inner.end_session(session_id)
    }

    fn get_session(&self, session_id: SessionId) -> Result<Option<Session>> {
        self.inner.get_session(session_id)
    }

    fn open_sessions_for_lab(&self, lab_id: LabId) -> Result<Vec<Session>> {
        self.inner.open_sessions_for_lab(lab_id)
    }

    fn log_activity(&self, user_id: UserId, lab_id: LabId, kind: ActivityKind, title: &str) -> Result<()> {
        self.inner.log_activity(user_id, lab_id, kind, title)
    }
}

/// Controller wired to fakes, a temp labs root and an in-memory registry
pub struct Harness {
    pub labs_root: TempDir,
    pub db: Database,
    pub registry: Arc<FlakyRegistry>,
    pub runtime: Arc<FakeRuntime>,
    pub compose: Arc<FakeCompose>,
    pub controller: Arc<LabController>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_recovery(false)
    }

    pub fn with_recovery(auto_recovery: bool) -> Self {
        let labs_root = TempDir::new().unwrap();
        let db = Database::open_memory().unwrap();
        let registry = Arc::new(FlakyRegistry::new(db.clone()));
        let runtime = Arc::new(FakeRuntime::new());
        let compose = Arc::new(FakeCompose::new(runtime.clone()));
        let options = ControllerOptions {
            labs_root: labs_root.path().to_path_buf(),
            auto_recovery,
            restart_settle: Duration::ZERO,
            sweep_interval: Duration::from_secs(3600),
        };
        let controller = Arc::new(LabController::new(
            registry.clone(),
            runtime.clone(),
            compose.clone(),
            options,
        ));
        Self {
            labs_root,
            db,
            registry,
            runtime,
            compose,
            controller,
        }
    }

    /// Register a lab whose compose file exists under the labs root
    pub fn add_lab(&self, slug: &str) -> LabId {
        let dir = self.labs_root.path().join(slug);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("docker-compose.yml"), "services: {}\n").unwrap();
        self.add_lab_without_file(slug)
    }

    /// Register a lab whose compose file is absent
    pub fn add_lab_without_file(&self, slug: &str) -> LabId {
        let mut lab = NewLab::new(slug.to_uppercase(), slug, format!("{}/docker-compose.yml", slug));
        lab.ports = vec![8080];
        self.db.insert_lab(&lab).unwrap()
    }
}
