//! Project lifecycle supervisor
//!
//! Owns all process handles and the runtime state machine
//! (stopped → starting → running → stopping → stopped, plus start_failed).
//! Every lifecycle operation on a project runs under that project's
//! exclusion lock; operations on different projects proceed concurrently.
//! Persisted status only ever records stopped or running, so a crashed
//! daemon restarts into a consistent view.

use crate::config::{PathsConfig, SupervisorConfig};
use crate::error::{ErrorCode, ManagerError};
use crate::ports::{check_port, check_port_configured};
use crate::process::{ExitState, LaunchSpec, ProcessHandle};
use crate::project::{Project, ProjectStatus};
use crate::registry::Registry;
use crate::sync::Synchronizer;
use dashmap::DashMap;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

/// Delay before checking a freshly launched process for an immediate crash
const EARLY_EXIT_WINDOW: std::time::Duration = std::time::Duration::from_millis(500);

/// Runtime lifecycle state. Richer than the persisted status: transitional
/// and failure states exist only while the daemon is up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Stopped,
    Starting,
    Running,
    Stopping,
    StartFailed,
}

/// Successful start result
#[derive(Debug, Clone, Serialize)]
pub struct StartOutcome {
    pub pid: u32,
    pub log_path: PathBuf,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

/// One project as reported to the UI layer: persisted record plus
/// reconciled runtime state.
#[derive(Debug, Clone, Serialize)]
pub struct ProjectView {
    #[serde(flatten)]
    pub project: Project,
    pub state: RunState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uptime_secs: Option<u64>,
}

pub struct Supervisor {
    registry: Arc<Registry>,
    sync: Arc<Synchronizer>,
    config: SupervisorConfig,
    paths: PathsConfig,
    /// Per-project exclusion locks; lifecycle operations never nest them
    op_locks: DashMap<i64, Arc<Mutex<()>>>,
    handles: DashMap<i64, Arc<Mutex<ProcessHandle>>>,
    states: DashMap<i64, RunState>,
}

impl Supervisor {
    pub fn new(
        registry: Arc<Registry>,
        sync: Arc<Synchronizer>,
        config: SupervisorConfig,
        paths: PathsConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            sync,
            config,
            paths,
            op_locks: DashMap::new(),
            handles: DashMap::new(),
            states: DashMap::new(),
        })
    }

    fn op_lock(&self, id: i64) -> Arc<Mutex<()>> {
        self.op_locks
            .entry(id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn load(&self, id: i64) -> Result<Project, ManagerError> {
        self.registry
            .get_project(id)
            .map_err(ManagerError::Internal)?
            .ok_or(ManagerError::NotFound(id))
    }

    fn handle_for(&self, id: i64) -> Option<Arc<Mutex<ProcessHandle>>> {
        self.handles.get(&id).map(|r| Arc::clone(&r))
    }

    async fn is_running(&self, id: i64) -> bool {
        match self.handle_for(id) {
            Some(handle) => handle.lock().await.is_alive(),
            None => false,
        }
    }

    /// Children do not survive a daemon restart; any record still marked
    /// running is stale. Call once at startup before auto-start.
    pub fn reconcile_startup(&self) -> Result<usize, ManagerError> {
        let mut fixed = 0;
        for project in self.registry.list_projects().map_err(ManagerError::Internal)? {
            if project.status == ProjectStatus::Running {
                warn!(
                    project = %project.name,
                    "Clearing stale running status from previous daemon instance"
                );
                self.registry
                    .set_status(project.id, ProjectStatus::Stopped)
                    .map_err(ManagerError::Internal)?;
                fixed += 1;
            }
        }
        Ok(fixed)
    }

    /// Start every project flagged auto_start. Individual failures are
    /// logged and do not stop the pass.
    pub async fn auto_start_all(self: &Arc<Self>) -> usize {
        let projects = match self.registry.list_projects() {
            Ok(projects) => projects,
            Err(e) => {
                error!(error = %e, "Cannot list projects for auto-start");
                return 0;
            }
        };

        let mut started = 0;
        for project in projects.into_iter().filter(|p| p.auto_start) {
            match self.start(project.id).await {
                Ok(_) => started += 1,
                Err(e) => {
                    error!(project = %project.name, error = %e, "Auto-start failed");
                }
            }
        }
        started
    }

    pub async fn start(self: &Arc<Self>, id: i64) -> Result<StartOutcome, ManagerError> {
        let lock = self.op_lock(id);
        let _guard = lock.lock().await;
        self.start_locked(id).await
    }

    pub async fn stop(self: &Arc<Self>, id: i64) -> Result<bool, ManagerError> {
        let lock = self.op_lock(id);
        let _guard = lock.lock().await;
        self.stop_locked(id).await
    }

    /// Strict stop-then-start. When the stop phase fails or times out, the
    /// restart is aborted and no start is attempted.
    pub async fn restart(self: &Arc<Self>, id: i64) -> Result<StartOutcome, ManagerError> {
        let lock = self.op_lock(id);
        let _guard = lock.lock().await;

        let name = self.load(id)?.name;
        let stop_timeout = self.config.restart_stop_timeout();
        match tokio::time::timeout(stop_timeout, self.stop_locked(id)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                return Err(ManagerError::RestartStopFailed {
                    name,
                    reason: e.to_string(),
                })
            }
            Err(_) => {
                return Err(ManagerError::RestartStopFailed {
                    name,
                    reason: format!(
                        "stop did not complete within {}s",
                        stop_timeout.as_secs()
                    ),
                })
            }
        }

        self.start_locked(id).await
    }

    async fn start_locked(self: &Arc<Self>, id: i64) -> Result<StartOutcome, ManagerError> {
        let project = self.load(id)?;

        if self.is_running(id).await {
            return Err(ManagerError::AlreadyRunning { name: project.name });
        }

        let (errors, warnings) = project.validate();
        if !errors.is_empty() {
            return Err(ManagerError::Validation { details: errors });
        }

        // Create/edit-time checks can be stale by now; re-check before binding
        if let Some(conflict) = check_port(&self.registry, project.port, Some(id))?
            .into_conflict(project.port)
        {
            return Err(conflict);
        }

        self.states.insert(id, RunState::Starting);

        let spec = LaunchSpec {
            plan: project.launch_plan().inspect_err(|_| {
                self.states.insert(id, RunState::StartFailed);
            })?,
            working_dir: PathBuf::from(&project.root_dir),
            env: vec![("PORT".to_string(), project.port.to_string())],
            log_path: self.paths.project_log_path(id),
            project_type: project.project_type,
        };

        let handle = match ProcessHandle::launch(&spec) {
            Ok(handle) => handle,
            Err(e) => {
                self.states.insert(id, RunState::StartFailed);
                return Err(e);
            }
        };
        let pid = handle.pid();
        let log_path = handle.log_path().to_path_buf();
        let handle = Arc::new(Mutex::new(handle));

        // Catch processes that crash right after spawn, so the caller gets a
        // launch failure with log context instead of a phantom running state
        tokio::time::sleep(EARLY_EXIT_WINDOW).await;
        {
            let mut guard = handle.lock().await;
            if !guard.is_alive() {
                self.states.insert(id, RunState::StartFailed);
                let excerpt = tail_file(&log_path, 15);
                return Err(early_exit_error(&project, guard.exit_state(), &excerpt, &log_path));
            }
        }

        self.handles.insert(id, Arc::clone(&handle));
        self.states.insert(id, RunState::Running);
        self.registry
            .set_status(id, ProjectStatus::Running)
            .map_err(ManagerError::Internal)?;
        self.spawn_exit_monitor(id, handle);
        self.sync.request_sync();

        info!(project = %project.name, pid, "Project started");
        Ok(StartOutcome {
            pid,
            log_path,
            warnings,
        })
    }

    /// Returns true when a process was actually stopped. Stopping an already
    /// stopped project is a no-op, not an error.
    async fn stop_locked(self: &Arc<Self>, id: i64) -> Result<bool, ManagerError> {
        let project = self.load(id)?;

        let handle = self.handles.remove(&id).map(|(_, h)| h);
        let was_running = match handle {
            Some(handle) => {
                self.states.insert(id, RunState::Stopping);
                let exit = handle
                    .lock()
                    .await
                    .terminate(self.config.shutdown_grace_period())
                    .await;
                info!(project = %project.name, ?exit, "Project stopped");
                true
            }
            None => false,
        };

        self.states.insert(id, RunState::Stopped);
        if was_running || project.status == ProjectStatus::Running {
            self.registry
                .set_status(id, ProjectStatus::Stopped)
                .map_err(ManagerError::Internal)?;
            self.sync.request_sync();
        }

        Ok(was_running)
    }

    /// Polls the child for an unexpected exit and demotes the project when
    /// it dies outside of a stop operation.
    fn spawn_exit_monitor(self: &Arc<Self>, id: i64, handle: Arc<Mutex<ProcessHandle>>) {
        let supervisor = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(supervisor.config.exit_poll_interval());
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;

                // A stop or delete replaced or removed our handle
                let current = match supervisor.handle_for(id) {
                    Some(current) => current,
                    None => return,
                };
                if !Arc::ptr_eq(&current, &handle) {
                    return;
                }

                let alive = handle.lock().await.is_alive();
                if alive {
                    continue;
                }

                let exit = handle.lock().await.exit_state();
                warn!(project_id = id, ?exit, "Supervised process exited unexpectedly");
                supervisor.handles.remove(&id);
                supervisor.states.insert(id, RunState::Stopped);
                if let Err(e) = supervisor.registry.set_status(id, ProjectStatus::Stopped) {
                    error!(project_id = id, error = %e, "Cannot persist stopped status");
                }
                supervisor.sync.request_sync();
                return;
            }
        });
    }

    /// Validate and persist a new project. When auto_start is set, a start
    /// is attempted and its failure is reported as a warning rather than
    /// rolling back the creation.
    pub async fn create(
        self: &Arc<Self>,
        mut project: Project,
    ) -> Result<(Project, Vec<String>), ManagerError> {
        let (errors, mut warnings) = project.validate();
        if !errors.is_empty() {
            return Err(ManagerError::Validation { details: errors });
        }
        if let Some(conflict) =
            check_port_configured(&self.registry, project.port, None)?.into_conflict(project.port)
        {
            return Err(conflict);
        }

        let id = self
            .registry
            .insert_project(&project)
            .map_err(ManagerError::Internal)?;
        project.id = id;
        project.status = ProjectStatus::Stopped;
        info!(project = %project.name, id, "Project created");

        if project.auto_start {
            if let Err(e) = self.start(id).await {
                warnings.push(format!("project created, but auto-start failed: {e}"));
            } else {
                project.status = ProjectStatus::Running;
            }
        }

        Ok((project, warnings))
    }

    /// Update structural fields. A running project keeps its process; the
    /// proxy is re-synchronized so domain or path edits take effect.
    pub async fn update(
        self: &Arc<Self>,
        project: Project,
    ) -> Result<Vec<String>, ManagerError> {
        let lock = self.op_lock(project.id);
        let _guard = lock.lock().await;

        self.load(project.id)?;
        let (errors, warnings) = project.validate();
        if !errors.is_empty() {
            return Err(ManagerError::Validation { details: errors });
        }
        if let Some(conflict) = check_port_configured(&self.registry, project.port, Some(project.id))?
            .into_conflict(project.port)
        {
            return Err(conflict);
        }

        self.registry
            .update_project(&project)
            .map_err(ManagerError::Internal)?;
        info!(project = %project.name, "Project updated");

        if self.is_running(project.id).await {
            self.sync.request_sync();
        }
        Ok(warnings)
    }

    /// Delete a project, force-stopping its process first if one is running.
    pub async fn delete(self: &Arc<Self>, id: i64) -> Result<(), ManagerError> {
        let lock = self.op_lock(id);
        let _guard = lock.lock().await;

        let project = self.load(id)?;
        if let Some((_, handle)) = self.handles.remove(&id) {
            let _ = handle
                .lock()
                .await
                .terminate(self.config.shutdown_grace_period())
                .await;
        }
        self.states.remove(&id);
        self.registry
            .delete_project(id)
            .map_err(ManagerError::Internal)?;
        drop(_guard);
        self.op_locks.remove(&id);

        info!(project = %project.name, "Project deleted");
        self.sync.request_sync();
        Ok(())
    }

    pub fn get(&self, id: i64) -> Result<Project, ManagerError> {
        self.load(id)
    }

    /// All projects with reconciled runtime state
    pub async fn list(&self) -> Result<Vec<ProjectView>, ManagerError> {
        let projects = self.registry.list_projects().map_err(ManagerError::Internal)?;
        let mut views = Vec::with_capacity(projects.len());
        for project in projects {
            views.push(self.view_of(project).await);
        }
        Ok(views)
    }

    pub async fn view(&self, id: i64) -> Result<ProjectView, ManagerError> {
        let project = self.load(id)?;
        Ok(self.view_of(project).await)
    }

    async fn view_of(&self, project: Project) -> ProjectView {
        let id = project.id;
        let mut state = self.states.get(&id).map(|s| *s).unwrap_or(RunState::Stopped);
        let mut pid = None;
        let mut uptime_secs = None;

        match self.handle_for(id) {
            Some(handle) => {
                let mut guard = handle.lock().await;
                if guard.is_alive() {
                    pid = Some(guard.pid());
                    uptime_secs = Some(guard.uptime().as_secs());
                } else if state == RunState::Running {
                    state = RunState::Stopped;
                }
            }
            None => {
                if state == RunState::Running {
                    state = RunState::Stopped;
                }
            }
        }

        ProjectView {
            project,
            state,
            pid,
            uptime_secs,
        }
    }

    /// Tail of the project's captured stdout/stderr
    pub fn logs(&self, id: i64, lines: usize) -> Result<String, ManagerError> {
        self.load(id)?;
        Ok(tail_file(&self.paths.project_log_path(id), lines))
    }

    /// Stop all running projects; used during daemon shutdown
    pub async fn stop_all(self: &Arc<Self>) {
        let ids: Vec<i64> = self.handles.iter().map(|r| *r.key()).collect();
        for id in ids {
            if let Err(e) = self.stop(id).await {
                error!(project_id = id, error = %e, "Cannot stop project during shutdown");
            }
        }
    }
}

fn tail_file(path: &std::path::Path, lines: usize) -> String {
    match std::fs::read_to_string(path) {
        Ok(content) => {
            let all: Vec<&str> = content.lines().collect();
            let start = all.len().saturating_sub(lines);
            all[start..].join("\n")
        }
        Err(_) => String::new(),
    }
}

/// Build the launch error for a process that died inside the early-exit
/// window, mining the log tail for well-known failure signatures.
fn early_exit_error(
    project: &Project,
    exit: ExitState,
    log_excerpt: &str,
    log_path: &std::path::Path,
) -> ManagerError {
    let exit_desc = match exit {
        ExitState::Exited(Some(code)) => format!("exited with code {code}"),
        ExitState::Exited(None) => "exited (terminated by signal)".to_string(),
        _ => "exited immediately".to_string(),
    };

    let lower = log_excerpt.to_lowercase();
    let mut suggestions = Vec::new();
    if lower.contains("address already in use") || lower.contains("bind:") {
        suggestions.push(format!(
            "Another process is listening on port {}; find it with: ss -ltnp | grep :{}",
            project.port, project.port
        ));
    }
    if lower.contains("permission denied") {
        suggestions.push("Check file and directory permissions for the project".to_string());
    }
    if lower.contains("modulenotfounderror") || lower.contains("no module named") {
        suggestions.push("Install the project's Python dependencies (pip install -r requirements.txt)".to_string());
    }
    if lower.contains("cannot find module") {
        suggestions.push("Install the project's Node.js dependencies (npm install)".to_string());
    }
    if lower.contains("no such file or directory") {
        suggestions.push("Check paths referenced by the start command".to_string());
    }
    if suggestions.is_empty() {
        suggestions.push("Inspect the project log for the failure cause".to_string());
        suggestions.push("Try launching the start command manually from the project directory".to_string());
    }

    let mut message = format!("process {exit_desc} right after start");
    if !log_excerpt.trim().is_empty() {
        let last = log_excerpt.lines().rev().find(|l| !l.trim().is_empty());
        if let Some(line) = last {
            message.push_str(&format!("; last log line: {}", line.trim()));
        }
    }

    ManagerError::Launch {
        code: ErrorCode::StartFailed,
        message,
        suggestions,
        log_path: Some(log_path.to_path_buf()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::caddy::CaddyManager;
    use crate::config::{PathsConfig, SupervisorConfig};
    use crate::project::ProjectType;
    use std::path::Path;

    fn write_stub_caddy(dir: &Path) -> PathBuf {
        let stub = dir.join("caddy");
        std::fs::write(&stub, "#!/bin/sh\nexit 0\n").unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&stub, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        stub
    }

    fn build(dir: &Path) -> (Arc<Registry>, Arc<Supervisor>) {
        let registry = Arc::new(Registry::open_in_memory().unwrap());
        let caddy = Arc::new(CaddyManager::new(
            write_stub_caddy(dir),
            dir.join("Caddyfile"),
            dir.join("caddy.log"),
        ));
        let sync = Synchronizer::new(Arc::clone(&registry), caddy);
        let supervisor = Supervisor::new(
            Arc::clone(&registry),
            sync,
            SupervisorConfig {
                shutdown_grace_period_secs: 2,
                restart_stop_timeout_secs: 5,
                exit_poll_interval_ms: 100,
            },
            PathsConfig {
                data_dir: dir.to_path_buf(),
                caddy_bin: PathBuf::from("caddy"),
            },
        );
        (registry, supervisor)
    }

    fn sample(dir: &Path, name: &str, port: u16, command: &str) -> Project {
        Project {
            id: 0,
            name: name.to_string(),
            project_type: ProjectType::Go,
            root_dir: dir.to_string_lossy().into_owned(),
            exec_path: None,
            start_command: Some(command.to_string()),
            port,
            auto_start: false,
            domains: vec![format!("{name}.example.com")],
            ssl_enabled: false,
            ssl_email: None,
            reverse_proxy_path: "/".to_string(),
            extra_headers: Vec::new(),
            description: String::new(),
            use_ipv4: true,
            status: ProjectStatus::Stopped,
        }
    }

    #[tokio::test]
    async fn test_start_and_stop_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, supervisor) = build(dir.path());
        let id = registry
            .insert_project(&sample(dir.path(), "api", 18501, "sleep 60"))
            .unwrap();

        let outcome = supervisor.start(id).await.unwrap();
        assert!(outcome.pid > 0);
        assert_eq!(
            registry.get_project(id).unwrap().unwrap().status,
            ProjectStatus::Running
        );
        let view = supervisor.view(id).await.unwrap();
        assert_eq!(view.state, RunState::Running);
        assert!(view.pid.is_some());

        assert!(supervisor.stop(id).await.unwrap());
        assert_eq!(
            registry.get_project(id).unwrap().unwrap().status,
            ProjectStatus::Stopped
        );
        assert_eq!(supervisor.view(id).await.unwrap().state, RunState::Stopped);

        // Stopping again is a no-op, not an error
        assert!(!supervisor.stop(id).await.unwrap());
    }

    #[tokio::test]
    async fn test_start_twice_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, supervisor) = build(dir.path());
        let id = registry
            .insert_project(&sample(dir.path(), "api", 18502, "sleep 60"))
            .unwrap();

        supervisor.start(id).await.unwrap();
        let err = supervisor.start(id).await.unwrap_err();
        assert!(matches!(err, ManagerError::AlreadyRunning { .. }));

        supervisor.stop(id).await.unwrap();
    }

    #[tokio::test]
    async fn test_start_unknown_project() {
        let dir = tempfile::tempdir().unwrap();
        let (_registry, supervisor) = build(dir.path());
        assert!(matches!(
            supervisor.start(999).await.unwrap_err(),
            ManagerError::NotFound(999)
        ));
    }

    #[tokio::test]
    async fn test_immediate_crash_reports_start_failure() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, supervisor) = build(dir.path());
        let id = registry
            .insert_project(&sample(
                dir.path(),
                "crasher",
                18503,
                "sh -c 'echo boom; exit 3'",
            ))
            .unwrap();

        let err = supervisor.start(id).await.unwrap_err();
        match err {
            ManagerError::Launch {
                code,
                message,
                log_path,
                ..
            } => {
                assert_eq!(code, ErrorCode::StartFailed);
                assert!(message.contains("code 3"), "{message}");
                assert!(log_path.is_some());
            }
            other => panic!("expected Launch error, got {other:?}"),
        }

        assert_eq!(
            supervisor.view(id).await.unwrap().state,
            RunState::StartFailed
        );
        assert_eq!(
            registry.get_project(id).unwrap().unwrap().status,
            ProjectStatus::Stopped
        );
    }

    #[tokio::test]
    async fn test_exit_monitor_demotes_dead_process() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, supervisor) = build(dir.path());
        let id = registry
            .insert_project(&sample(dir.path(), "shortlived", 18504, "sleep 1"))
            .unwrap();

        supervisor.start(id).await.unwrap();
        assert_eq!(supervisor.view(id).await.unwrap().state, RunState::Running);

        // Let the child exit and the monitor observe it
        tokio::time::sleep(std::time::Duration::from_millis(1500)).await;
        assert_eq!(supervisor.view(id).await.unwrap().state, RunState::Stopped);
        assert_eq!(
            registry.get_project(id).unwrap().unwrap().status,
            ProjectStatus::Stopped
        );
    }

    #[tokio::test]
    async fn test_restart_replaces_process() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, supervisor) = build(dir.path());
        let id = registry
            .insert_project(&sample(dir.path(), "api", 18505, "sleep 60"))
            .unwrap();

        let first = supervisor.start(id).await.unwrap();
        let second = supervisor.restart(id).await.unwrap();
        assert_ne!(first.pid, second.pid);
        assert_eq!(supervisor.view(id).await.unwrap().state, RunState::Running);

        supervisor.stop(id).await.unwrap();
    }

    #[tokio::test]
    async fn test_restart_works_from_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, supervisor) = build(dir.path());
        let id = registry
            .insert_project(&sample(dir.path(), "api", 18506, "sleep 60"))
            .unwrap();

        let outcome = supervisor.restart(id).await.unwrap();
        assert!(outcome.pid > 0);
        supervisor.stop(id).await.unwrap();
    }

    #[tokio::test]
    async fn test_create_rejects_duplicate_port() {
        let dir = tempfile::tempdir().unwrap();
        let (_registry, supervisor) = build(dir.path());

        supervisor
            .create(sample(dir.path(), "a", 18507, "sleep 60"))
            .await
            .unwrap();
        let err = supervisor
            .create(sample(dir.path(), "b", 18507, "sleep 60"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ManagerError::Conflict { holder: Some(ref n), .. } if n == "a"
        ));
    }

    #[tokio::test]
    async fn test_create_rejects_invalid_project() {
        let dir = tempfile::tempdir().unwrap();
        let (_registry, supervisor) = build(dir.path());

        let mut project = sample(dir.path(), "bad", 18508, "sleep 60");
        project.root_dir = "/definitely/not/a/dir".to_string();
        let err = supervisor.create(project).await.unwrap_err();
        assert!(matches!(err, ManagerError::Validation { .. }));
    }

    #[tokio::test]
    async fn test_create_with_auto_start() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, supervisor) = build(dir.path());

        let mut project = sample(dir.path(), "auto", 18509, "sleep 60");
        project.auto_start = true;
        let (created, warnings) = supervisor.create(project).await.unwrap();
        assert!(warnings.is_empty(), "{warnings:?}");
        assert_eq!(
            registry.get_project(created.id).unwrap().unwrap().status,
            ProjectStatus::Running
        );
        supervisor.stop(created.id).await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_running_project_stops_it() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, supervisor) = build(dir.path());
        let id = registry
            .insert_project(&sample(dir.path(), "doomed", 18510, "sleep 60"))
            .unwrap();

        supervisor.start(id).await.unwrap();
        supervisor.delete(id).await.unwrap();
        assert!(registry.get_project(id).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reconcile_startup_clears_stale_running() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, supervisor) = build(dir.path());
        let id = registry
            .insert_project(&sample(dir.path(), "stale", 18511, "sleep 60"))
            .unwrap();
        registry.set_status(id, ProjectStatus::Running).unwrap();

        assert_eq!(supervisor.reconcile_startup().unwrap(), 1);
        assert_eq!(
            registry.get_project(id).unwrap().unwrap().status,
            ProjectStatus::Stopped
        );
    }

    #[tokio::test]
    async fn test_logs_tail() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, supervisor) = build(dir.path());
        let id = registry
            .insert_project(&sample(
                dir.path(),
                "echoer",
                18512,
                "sh -c 'echo hello-from-project; sleep 60'",
            ))
            .unwrap();

        supervisor.start(id).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        let logs = supervisor.logs(id, 50).unwrap();
        assert!(logs.contains("hello-from-project"));
        supervisor.stop(id).await.unwrap();
    }
}
