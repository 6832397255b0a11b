//! Process handles for supervised project children
//!
//! Wraps one external process: launch with log capture, non-blocking
//! liveness checks, and graceful termination (SIGTERM, grace window,
//! SIGKILL). Handles are runtime-only and owned by the supervisor.

use crate::error::{ErrorCode, ManagerError};
use crate::project::{LaunchPlan, ProjectType};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::{info, warn};

/// Terminal or live state of a supervised child
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitState {
    Running,
    /// Process exited on its own; exit code when the OS reported one
    Exited(Option<i32>),
    /// Process had to be force-killed after the grace period
    Killed,
}

/// Handle to one running project process
#[derive(Debug)]
pub struct ProcessHandle {
    child: Child,
    pid: u32,
    started_at: std::time::Instant,
    log_path: PathBuf,
    exit: ExitState,
}

/// Everything needed for one launch attempt
pub struct LaunchSpec {
    pub plan: LaunchPlan,
    pub working_dir: PathBuf,
    pub env: Vec<(String, String)>,
    pub log_path: PathBuf,
    /// Used to pick a runtime-specific install hint on spawn failure
    pub project_type: ProjectType,
}

impl ProcessHandle {
    /// Spawn the process described by `spec`, capturing stdout and stderr
    /// into the project's log file (opened in append mode).
    pub fn launch(spec: &LaunchSpec) -> Result<Self, ManagerError> {
        if !spec.working_dir.is_dir() {
            return Err(ManagerError::Launch {
                code: ErrorCode::FileNotFound,
                message: format!(
                    "working directory does not exist: {}",
                    spec.working_dir.display()
                ),
                suggestions: vec!["Check the project's root directory setting".to_string()],
                log_path: None,
            });
        }

        if let Some(parent) = spec.log_path.parent() {
            std::fs::create_dir_all(parent).map_err(ManagerError::Io)?;
        }
        let log_file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&spec.log_path)
            .map_err(ManagerError::Io)?;
        let stderr_file = log_file.try_clone().map_err(ManagerError::Io)?;

        let mut cmd = Command::new(&spec.plan.program);
        cmd.args(&spec.plan.args)
            .current_dir(&spec.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log_file))
            .stderr(Stdio::from(stderr_file));
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }

        let child = cmd
            .spawn()
            .map_err(|e| spawn_error(e, spec))?;

        let pid = child.id().unwrap_or(0);
        info!(program = %spec.plan.program, pid, "Process spawned");

        Ok(Self {
            child,
            pid,
            started_at: std::time::Instant::now(),
            log_path: spec.log_path.clone(),
            exit: ExitState::Running,
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn exit_state(&self) -> ExitState {
        self.exit
    }

    /// Poll process existence without blocking
    pub fn is_alive(&mut self) -> bool {
        if self.exit != ExitState::Running {
            return false;
        }
        match self.child.try_wait() {
            Ok(Some(status)) => {
                self.exit = ExitState::Exited(status.code());
                false
            }
            Ok(None) => true,
            Err(e) => {
                warn!(pid = self.pid, error = %e, "Failed to poll child status");
                false
            }
        }
    }

    /// Graceful stop: SIGTERM, wait up to `grace`, then SIGKILL. The handle
    /// is always left in a terminal state before returning.
    pub async fn terminate(&mut self, grace: Duration) -> ExitState {
        if !self.is_alive() {
            return self.exit;
        }

        info!(pid = self.pid, "Sending SIGTERM");
        #[cfg(unix)]
        unsafe {
            libc::kill(self.pid as i32, libc::SIGTERM);
        }
        #[cfg(not(unix))]
        {
            let _ = self.child.start_kill();
        }

        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => {
                info!(pid = self.pid, ?status, "Process exited gracefully");
                self.exit = ExitState::Exited(status.code());
            }
            Ok(Err(e)) => {
                warn!(pid = self.pid, error = %e, "Error waiting for process exit");
                self.exit = ExitState::Killed;
            }
            Err(_) => {
                warn!(
                    pid = self.pid,
                    grace_secs = grace.as_secs(),
                    "Grace period exceeded, sending SIGKILL"
                );
                let _ = self.child.kill().await;
                self.exit = ExitState::Killed;
            }
        }

        self.exit
    }
}

/// Map a spawn failure into a structured launch error with suggestions
fn spawn_error(err: std::io::Error, spec: &LaunchSpec) -> ManagerError {
    let (code, message, mut suggestions) = match err.kind() {
        std::io::ErrorKind::NotFound => {
            let code = if spec.project_type.runtime_hint().is_some() {
                ErrorCode::RuntimeMissing
            } else {
                ErrorCode::FileNotFound
            };
            (
                code,
                format!("executable not found: {}", spec.plan.program),
                vec![
                    format!("Check that '{}' exists and is on PATH", spec.plan.program),
                    format!("Confirm the file is inside {}", spec.working_dir.display()),
                ],
            )
        }
        std::io::ErrorKind::PermissionDenied => (
            ErrorCode::PermissionDenied,
            format!("permission denied executing: {}", spec.plan.program),
            vec![
                format!("Check execute permissions: chmod +x {}", spec.plan.program),
                "Run caddygate as a user with access to the project directory".to_string(),
            ],
        ),
        _ => (
            ErrorCode::StartFailed,
            format!("failed to start '{}': {}", spec.plan.program, err),
            vec![
                "Check the project log for details".to_string(),
                "Try launching the command manually from the project directory".to_string(),
            ],
        ),
    };

    if let Some(hint) = spec.project_type.runtime_hint() {
        if err.kind() == std::io::ErrorKind::NotFound {
            suggestions.insert(0, hint.to_string());
        }
    }

    ManagerError::Launch {
        code,
        message,
        suggestions,
        log_path: Some(spec.log_path.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(program: &str, args: &[&str], dir: &Path) -> LaunchSpec {
        LaunchSpec {
            plan: LaunchPlan {
                program: program.to_string(),
                args: args.iter().map(|s| s.to_string()).collect(),
            },
            working_dir: dir.to_path_buf(),
            env: vec![("PORT".to_string(), "3000".to_string())],
            log_path: dir.join("out.log"),
            project_type: ProjectType::Go,
        }
    }

    #[tokio::test]
    async fn test_launch_and_terminate() {
        let dir = tempfile::tempdir().unwrap();
        let mut handle = ProcessHandle::launch(&spec("sleep", &["60"], dir.path())).unwrap();

        assert!(handle.pid() > 0);
        assert!(handle.is_alive());
        assert_eq!(handle.exit_state(), ExitState::Running);

        let exit = handle.terminate(Duration::from_secs(2)).await;
        assert_ne!(exit, ExitState::Running);
        assert!(!handle.is_alive());
    }

    #[tokio::test]
    async fn test_launch_detects_natural_exit() {
        let dir = tempfile::tempdir().unwrap();
        let mut handle = ProcessHandle::launch(&spec("true", &[], dir.path())).unwrap();

        // Give the child a moment to exit
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!handle.is_alive());
        assert!(matches!(handle.exit_state(), ExitState::Exited(_)));
    }

    #[tokio::test]
    async fn test_launch_missing_executable() {
        let dir = tempfile::tempdir().unwrap();
        let err = ProcessHandle::launch(&spec("/no/such/binary", &[], dir.path())).unwrap_err();

        match err {
            ManagerError::Launch {
                code,
                suggestions,
                log_path,
                ..
            } => {
                assert_eq!(code, ErrorCode::FileNotFound);
                assert!(!suggestions.is_empty());
                assert!(log_path.is_some());
            }
            other => panic!("expected Launch error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_launch_missing_working_dir() {
        let err = ProcessHandle::launch(&spec("sleep", &["1"], Path::new("/no/such/dir")))
            .unwrap_err();
        assert!(err.to_string().contains("working directory"));
    }

    #[tokio::test]
    async fn test_runtime_hint_for_interpreter_types() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = spec("definitely-not-python3", &["app.py"], dir.path());
        s.project_type = ProjectType::Python;

        let err = ProcessHandle::launch(&s).unwrap_err();
        match err {
            ManagerError::Launch { code, suggestions, .. } => {
                assert_eq!(code, ErrorCode::RuntimeMissing);
                assert!(suggestions.iter().any(|s| s.contains("Python")));
            }
            other => panic!("expected Launch error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_log_capture_appends() {
        let dir = tempfile::tempdir().unwrap();
        let s = spec("sh", &["-c", "echo first"], dir.path());
        let mut handle = ProcessHandle::launch(&s).unwrap();
        let _ = handle.terminate(Duration::from_secs(2)).await;

        let s2 = spec("sh", &["-c", "echo second"], dir.path());
        let mut handle2 = ProcessHandle::launch(&s2).unwrap();
        let _ = handle2.terminate(Duration::from_secs(2)).await;

        tokio::time::sleep(Duration::from_millis(200)).await;
        let content = std::fs::read_to_string(dir.path().join("out.log")).unwrap();
        assert!(content.contains("first"));
        assert!(content.contains("second"));
    }
}
