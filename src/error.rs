//! Error taxonomy and structured operation reports
//!
//! Every operation the UI layer can invoke returns either a success payload
//! or an [`OpReport`] carrying a machine-readable code, human-readable detail
//! lines, ordered suggestions and (for launch failures) the log file path.

use serde::Serialize;
use std::path::PathBuf;
use thiserror::Error;

/// Machine-readable error codes surfaced to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Project record does not exist
    ProjectNotFound,
    /// Field validation rejected the request before any mutation
    ValidationError,
    /// Requested port is claimed by another project or bound on the host
    PortInUse,
    /// Project is already running
    AlreadyRunning,
    /// Executable or script missing
    FileNotFound,
    /// OS denied execution or port binding
    PermissionDenied,
    /// Required language runtime is not installed
    RuntimeMissing,
    /// Process failed to launch for another reason
    StartFailed,
    /// Stop phase of a restart did not complete
    RestartStopFailed,
    /// Proxy configuration was rejected or reload failed
    SyncFailed,
    /// Caddy binary missing or control command failed
    ProxyControlFailed,
    /// Requested diagnostic issue has no registered remedy
    NotAutoFixable,
    /// Storage layer failure
    StorageError,
    /// Anything else
    InternalError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ProjectNotFound => "PROJECT_NOT_FOUND",
            ErrorCode::ValidationError => "VALIDATION_ERROR",
            ErrorCode::PortInUse => "PORT_IN_USE",
            ErrorCode::AlreadyRunning => "ALREADY_RUNNING",
            ErrorCode::FileNotFound => "FILE_NOT_FOUND",
            ErrorCode::PermissionDenied => "PERMISSION_DENIED",
            ErrorCode::RuntimeMissing => "RUNTIME_MISSING",
            ErrorCode::StartFailed => "START_FAILED",
            ErrorCode::RestartStopFailed => "RESTART_STOP_FAILED",
            ErrorCode::SyncFailed => "SYNC_FAILED",
            ErrorCode::ProxyControlFailed => "PROXY_CONTROL_FAILED",
            ErrorCode::NotAutoFixable => "NOT_AUTO_FIXABLE",
            ErrorCode::StorageError => "STORAGE_ERROR",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// Errors produced by the supervisor, synchronizer and caddy driver
#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("project {0} not found")]
    NotFound(i64),

    #[error("validation failed")]
    Validation { details: Vec<String> },

    #[error("port {port} is not available")]
    Conflict {
        port: u16,
        /// Name of the project holding the port, if a managed one does
        holder: Option<String>,
    },

    #[error("project '{name}' is already running")]
    AlreadyRunning { name: String },

    #[error("failed to launch: {message}")]
    Launch {
        code: ErrorCode,
        message: String,
        suggestions: Vec<String>,
        log_path: Option<PathBuf>,
    },

    #[error("restart aborted: stop phase failed for '{name}'")]
    RestartStopFailed { name: String, reason: String },

    #[error("proxy synchronization failed: {message}")]
    Sync {
        message: String,
        /// Projects whose configuration was rejected by the proxy validator
        offenders: Vec<String>,
    },

    #[error("proxy control failed: {0}")]
    ProxyControl(String),

    #[error("issue '{0}' is not auto-fixable")]
    NotAutoFixable(String),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ManagerError {
    pub fn code(&self) -> ErrorCode {
        match self {
            ManagerError::NotFound(_) => ErrorCode::ProjectNotFound,
            ManagerError::Validation { .. } => ErrorCode::ValidationError,
            ManagerError::Conflict { .. } => ErrorCode::PortInUse,
            ManagerError::AlreadyRunning { .. } => ErrorCode::AlreadyRunning,
            ManagerError::Launch { code, .. } => *code,
            ManagerError::RestartStopFailed { .. } => ErrorCode::RestartStopFailed,
            ManagerError::Sync { .. } => ErrorCode::SyncFailed,
            ManagerError::ProxyControl(_) => ErrorCode::ProxyControlFailed,
            ManagerError::NotAutoFixable(_) => ErrorCode::NotAutoFixable,
            ManagerError::Storage(_) => ErrorCode::StorageError,
            ManagerError::Io(_) => ErrorCode::InternalError,
            ManagerError::Internal(_) => ErrorCode::InternalError,
        }
    }
}

/// Structured result consumed by the UI layer
#[derive(Debug, Clone, Serialize)]
pub struct OpReport {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<ErrorCode>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub details: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub suggestions: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_path: Option<String>,
}

impl OpReport {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: Some(message.into()),
            error: None,
            code: None,
            details: Vec::new(),
            suggestions: Vec::new(),
            log_path: None,
        }
    }

    pub fn failure(error: &ManagerError) -> Self {
        let mut report = Self {
            success: false,
            message: None,
            error: Some(error.to_string()),
            code: Some(error.code()),
            details: Vec::new(),
            suggestions: Vec::new(),
            log_path: None,
        };

        match error {
            ManagerError::Validation { details } => {
                report.details = details.clone();
                report.suggestions = vec!["Fix the listed fields and retry".to_string()];
            }
            ManagerError::Conflict { port, holder } => {
                match holder {
                    Some(name) => {
                        report
                            .details
                            .push(format!("port {port} is already in use by project '{name}'"));
                        report
                            .suggestions
                            .push(format!("Stop project '{name}' or choose another port"));
                    }
                    None => {
                        report
                            .details
                            .push(format!("port {port} is bound by a process outside caddygate"));
                        report
                            .suggestions
                            .push(format!("Find the listener with: ss -ltnp | grep :{port}"));
                        report.suggestions.push("Choose another port".to_string());
                    }
                }
            }
            ManagerError::Launch {
                message,
                suggestions,
                log_path,
                ..
            } => {
                report.details.push(message.clone());
                report.suggestions = suggestions.clone();
                report.log_path = log_path
                    .as_ref()
                    .map(|p| p.to_string_lossy().into_owned());
            }
            ManagerError::RestartStopFailed { reason, .. } => {
                report.details.push(reason.clone());
                report
                    .suggestions
                    .push("Check the process state and stop it manually before retrying".to_string());
            }
            ManagerError::Sync { offenders, .. } => {
                if !offenders.is_empty() {
                    report
                        .details
                        .push(format!("offending project(s): {}", offenders.join(", ")));
                }
                report
                    .suggestions
                    .push("The previous proxy configuration is still active".to_string());
                report
                    .suggestions
                    .push("Review the listed projects' domains and proxy settings".to_string());
            }
            _ => {}
        }

        report
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"success":false,"error":"{}"}}"#,
                self.error.as_deref().unwrap_or("unknown").replace('"', "\\\"")
            )
        })
    }
}
