//! Caddy lifecycle driver
//!
//! Runs and controls the external Caddy reverse proxy: start/stop/restart of
//! the `caddy run` child, configuration validation via `caddy validate`, and
//! zero-downtime application via `caddy reload`. TLS issuance itself is
//! Caddy's job; this module only drives it.

use crate::error::ManagerError;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Grace period for stopping the caddy child itself
const CADDY_STOP_GRACE: Duration = Duration::from_secs(5);

/// Reported proxy state
#[derive(Debug, Clone, Serialize)]
pub struct ProxyStatus {
    pub running: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

pub struct CaddyManager {
    bin: PathBuf,
    caddyfile_path: PathBuf,
    log_path: PathBuf,
    child: Mutex<Option<Child>>,
}

impl CaddyManager {
    pub fn new(bin: PathBuf, caddyfile_path: PathBuf, log_path: PathBuf) -> Self {
        Self {
            bin,
            caddyfile_path,
            log_path,
            child: Mutex::new(None),
        }
    }

    pub fn caddyfile_path(&self) -> &Path {
        &self.caddyfile_path
    }

    /// Write a placeholder Caddyfile when none exists yet, so `caddy run`
    /// has something to load before the first synchronization.
    pub fn ensure_default_config(&self) -> Result<(), ManagerError> {
        if self.caddyfile_path.exists() {
            return Ok(());
        }
        if let Some(parent) = self.caddyfile_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.caddyfile_path, default_caddyfile())?;
        info!(path = %self.caddyfile_path.display(), "Wrote default Caddyfile");
        Ok(())
    }

    /// Start `caddy run` with log capture. A previously started child is
    /// stopped first.
    pub async fn start(&self) -> Result<(), ManagerError> {
        self.stop().await;
        self.ensure_default_config()?;

        if let Some(parent) = self.log_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let log_file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)?;
        let stderr_file = log_file.try_clone()?;

        let child = Command::new(&self.bin)
            .arg("run")
            .arg("--config")
            .arg(&self.caddyfile_path)
            .arg("--adapter")
            .arg("caddyfile")
            .stdin(Stdio::null())
            .stdout(Stdio::from(log_file))
            .stderr(Stdio::from(stderr_file))
            .spawn()
            .map_err(|e| {
                ManagerError::ProxyControl(format!(
                    "failed to start caddy ({}): {e}",
                    self.bin.display()
                ))
            })?;

        info!(pid = child.id().unwrap_or(0), "Caddy started");
        *self.child.lock().await = Some(child);
        Ok(())
    }

    /// Stop the caddy child if we own one. SIGTERM lets Caddy finish
    /// in-flight requests before the force kill.
    pub async fn stop(&self) {
        let mut guard = self.child.lock().await;
        if let Some(mut child) = guard.take() {
            if let Some(pid) = child.id() {
                info!(pid, "Stopping Caddy");
                #[cfg(unix)]
                unsafe {
                    libc::kill(pid as i32, libc::SIGTERM);
                }
                #[cfg(not(unix))]
                {
                    let _ = child.start_kill();
                }
            }
            match tokio::time::timeout(CADDY_STOP_GRACE, child.wait()).await {
                Ok(_) => {}
                Err(_) => {
                    warn!("Caddy did not exit within grace period, killing");
                    let _ = child.kill().await;
                }
            }
        }
    }

    /// Full restart: only for explicit operator requests, never used by the
    /// synchronizer (which relies on reload).
    pub async fn restart(&self) -> Result<(), ManagerError> {
        self.stop().await;
        tokio::time::sleep(Duration::from_millis(500)).await;
        self.start().await
    }

    pub async fn is_running(&self) -> bool {
        let mut guard = self.child.lock().await;
        match guard.as_mut() {
            Some(child) => match child.try_wait() {
                Ok(Some(_)) => {
                    *guard = None;
                    false
                }
                Ok(None) => true,
                Err(_) => false,
            },
            None => false,
        }
    }

    pub async fn status(&self) -> ProxyStatus {
        ProxyStatus {
            running: self.is_running().await,
            version: self.version().await,
        }
    }

    /// `caddy version` output, first token
    pub async fn version(&self) -> Option<String> {
        let output = Command::new(&self.bin).arg("version").output().await.ok()?;
        if !output.status.success() {
            return None;
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        stdout.split_whitespace().next().map(str::to_string)
    }

    /// Validate a candidate Caddyfile with Caddy's own validator. The live
    /// configuration is untouched either way.
    pub async fn validate(&self, config_path: &Path) -> Result<(), ManagerError> {
        let output = Command::new(&self.bin)
            .arg("validate")
            .arg("--config")
            .arg(config_path)
            .arg("--adapter")
            .arg("caddyfile")
            .output()
            .await
            .map_err(|e| {
                ManagerError::ProxyControl(format!(
                    "failed to run caddy validate ({}): {e}",
                    self.bin.display()
                ))
            })?;

        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(ManagerError::ProxyControl(format!(
                "configuration rejected: {}",
                stderr.lines().last().unwrap_or("unknown error").trim()
            )))
        }
    }

    /// Apply the live Caddyfile with a zero-downtime reload. In-flight
    /// connections on unrelated routes are preserved; this never restarts
    /// the caddy process.
    pub async fn reload(&self) -> Result<(), ManagerError> {
        let output = Command::new(&self.bin)
            .arg("reload")
            .arg("--config")
            .arg(&self.caddyfile_path)
            .arg("--adapter")
            .arg("caddyfile")
            .output()
            .await
            .map_err(|e| {
                ManagerError::ProxyControl(format!(
                    "failed to run caddy reload ({}): {e}",
                    self.bin.display()
                ))
            })?;

        if output.status.success() {
            info!("Caddy configuration reloaded");
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(ManagerError::ProxyControl(format!(
                "reload rejected: {}",
                stderr.lines().last().unwrap_or("unknown error").trim()
            )))
        }
    }

    /// Tail of the caddy log
    pub fn logs(&self, lines: usize) -> String {
        match std::fs::read_to_string(&self.log_path) {
            Ok(content) => {
                let all: Vec<&str> = content.lines().collect();
                let start = all.len().saturating_sub(lines);
                all[start..].join("\n")
            }
            Err(_) => String::new(),
        }
    }
}

fn default_caddyfile() -> &'static str {
    "# Generated by caddygate. Do not edit; changes are overwritten on\n\
     # the next synchronization.\n\n\
     :80 {\n\
     \trespond \"caddygate proxy is running\" 200\n\
     }\n"
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager_in(dir: &Path, bin: &str) -> CaddyManager {
        CaddyManager::new(
            PathBuf::from(bin),
            dir.join("Caddyfile"),
            dir.join("caddy.log"),
        )
    }

    #[tokio::test]
    async fn test_ensure_default_config() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_in(dir.path(), "caddy");

        manager.ensure_default_config().unwrap();
        let content = std::fs::read_to_string(dir.path().join("Caddyfile")).unwrap();
        assert!(content.contains(":80"));

        // Existing files are never overwritten
        std::fs::write(dir.path().join("Caddyfile"), "custom").unwrap();
        manager.ensure_default_config().unwrap();
        assert_eq!(
            std::fs::read_to_string(dir.path().join("Caddyfile")).unwrap(),
            "custom"
        );
    }

    #[tokio::test]
    async fn test_not_running_initially() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_in(dir.path(), "caddy");
        assert!(!manager.is_running().await);
    }

    #[tokio::test]
    async fn test_validate_with_stub_binary() {
        let dir = tempfile::tempdir().unwrap();
        // A stub caddy that accepts everything
        let stub = dir.path().join("caddy");
        std::fs::write(&stub, "#!/bin/sh\nexit 0\n").unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&stub, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        let manager = manager_in(dir.path(), stub.to_str().unwrap());
        let config = dir.path().join("candidate");
        std::fs::write(&config, "localhost {\n}\n").unwrap();
        manager.validate(&config).await.unwrap();
    }

    #[tokio::test]
    async fn test_validate_failure_carries_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let stub = dir.path().join("caddy");
        std::fs::write(&stub, "#!/bin/sh\necho 'adapting config: syntax error' >&2\nexit 1\n")
            .unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&stub, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        let manager = manager_in(dir.path(), stub.to_str().unwrap());
        let config = dir.path().join("candidate");
        std::fs::write(&config, "garbage").unwrap();

        let err = manager.validate(&config).await.unwrap_err();
        assert!(err.to_string().contains("syntax error"));
    }

    #[tokio::test]
    async fn test_missing_binary_is_proxy_control_error() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_in(dir.path(), "/no/such/caddy");
        let config = dir.path().join("candidate");
        std::fs::write(&config, "localhost {\n}\n").unwrap();

        let err = manager.validate(&config).await.unwrap_err();
        assert!(matches!(err, ManagerError::ProxyControl(_)));
    }

    #[test]
    fn test_logs_tail() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_in(dir.path(), "caddy");
        std::fs::write(dir.path().join("caddy.log"), "a\nb\nc\nd\n").unwrap();

        assert_eq!(manager.logs(2), "c\nd");
        assert_eq!(manager.logs(100), "a\nb\nc\nd");
    }
}
