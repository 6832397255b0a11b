//! Project records and per-type launch strategies
//!
//! A project is one externally managed application bound to a single TCP
//! port. The launch strategy is a tagged variant per project type: adding a
//! type means adding one enum arm, not scattering branches.

use crate::error::{ErrorCode, ManagerError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// How a project is started
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProjectType {
    Go,
    Python,
    Nodejs,
    Java,
    Php,
    Static,
}

impl ProjectType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProjectType::Go => "go",
            ProjectType::Python => "python",
            ProjectType::Nodejs => "nodejs",
            ProjectType::Java => "java",
            ProjectType::Php => "php",
            ProjectType::Static => "static",
        }
    }

    /// The interpreter this type launches start_command with, if any.
    /// php is not listed: its start_command conventionally already names
    /// the binary (`php -S ...`), so it runs as written.
    fn interpreter(&self) -> Option<&'static str> {
        match self {
            ProjectType::Python => Some("python3"),
            ProjectType::Nodejs => Some("node"),
            ProjectType::Java => Some("java"),
            ProjectType::Go | ProjectType::Php | ProjectType::Static => None,
        }
    }

    /// Install hint used when the interpreter is missing at launch time
    pub fn runtime_hint(&self) -> Option<&'static str> {
        match self {
            ProjectType::Python => Some("Install Python 3 and verify with: python3 --version"),
            ProjectType::Nodejs => Some("Install Node.js and verify with: node --version"),
            ProjectType::Java => Some("Install a JRE or JDK and verify with: java -version"),
            ProjectType::Php => Some("Install PHP and verify with: php --version"),
            ProjectType::Go | ProjectType::Static => None,
        }
    }
}

impl FromStr for ProjectType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "go" => Ok(ProjectType::Go),
            "python" => Ok(ProjectType::Python),
            "nodejs" => Ok(ProjectType::Nodejs),
            "java" => Ok(ProjectType::Java),
            "php" => Ok(ProjectType::Php),
            "static" => Ok(ProjectType::Static),
            other => Err(format!("unknown project type: {other}")),
        }
    }
}

impl fmt::Display for ProjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted lifecycle status. Transitional states (starting, stopping,
/// start_failed) are runtime-only and live in the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProjectStatus {
    Stopped,
    Running,
}

impl ProjectStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProjectStatus::Stopped => "stopped",
            ProjectStatus::Running => "running",
        }
    }
}

impl FromStr for ProjectStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stopped" => Ok(ProjectStatus::Stopped),
            "running" => Ok(ProjectStatus::Running),
            other => Err(format!("unknown project status: {other}")),
        }
    }
}

/// One externally managed application
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    #[serde(default)]
    pub id: i64,
    pub name: String,
    pub project_type: ProjectType,
    pub root_dir: String,
    #[serde(default)]
    pub exec_path: Option<String>,
    #[serde(default)]
    pub start_command: Option<String>,
    pub port: u16,
    #[serde(default)]
    pub auto_start: bool,
    /// Ordered hostnames, first is primary
    #[serde(default)]
    pub domains: Vec<String>,
    #[serde(default)]
    pub ssl_enabled: bool,
    #[serde(default)]
    pub ssl_email: Option<String>,
    #[serde(default = "default_proxy_path")]
    pub reverse_proxy_path: String,
    /// Opaque `Name value` lines forwarded as proxy header_up directives
    #[serde(default)]
    pub extra_headers: Vec<String>,
    #[serde(default)]
    pub description: String,
    /// Proxy upstream target uses 127.0.0.1 instead of localhost
    #[serde(default = "default_use_ipv4")]
    pub use_ipv4: bool,
    #[serde(default = "default_status")]
    pub status: ProjectStatus,
}

fn default_proxy_path() -> String {
    "/".to_string()
}

fn default_use_ipv4() -> bool {
    true
}

fn default_status() -> ProjectStatus {
    ProjectStatus::Stopped
}

/// Resolved program and arguments for one launch attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchPlan {
    pub program: String,
    pub args: Vec<String>,
}

impl Project {
    pub fn primary_domain(&self) -> Option<&str> {
        self.domains.first().map(|d| d.as_str())
    }

    /// Persisted status says running (the supervisor's runtime view may
    /// be more precise)
    pub fn is_running_status(&self) -> bool {
        self.status == ProjectStatus::Running
    }

    /// Loopback target the proxy forwards to
    pub fn upstream_addr(&self) -> String {
        if self.use_ipv4 {
            format!("127.0.0.1:{}", self.port)
        } else {
            format!("localhost:{}", self.port)
        }
    }

    /// Domains that pass syntactic validation, in declared order
    pub fn valid_domains(&self) -> Vec<&str> {
        self.domains
            .iter()
            .map(|d| d.as_str())
            .filter(|d| is_valid_host(d))
            .collect()
    }

    /// Validate all fields. Returns detail lines for hard errors and a
    /// separate list of non-fatal warnings (e.g. SSL without a contact email).
    pub fn validate(&self) -> (Vec<String>, Vec<String>) {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();

        if self.name.trim().is_empty() {
            errors.push("project name is required".to_string());
        }

        if self.root_dir.trim().is_empty() {
            errors.push("project root directory is not configured".to_string());
        } else if !Path::new(&self.root_dir).is_dir() {
            errors.push(format!("project root directory does not exist: {}", self.root_dir));
        }

        if self.port == 0 {
            errors.push("port must be between 1 and 65535".to_string());
        }

        for domain in &self.domains {
            if !is_valid_host(domain) {
                errors.push(format!("invalid domain or address: {domain}"));
            }
        }

        if self.ssl_enabled {
            if self.domains.is_empty() {
                errors.push("SSL is enabled but no domains are configured".to_string());
            }
            if self.ssl_email.as_deref().map_or(true, |e| e.trim().is_empty()) {
                warnings.push(
                    "SSL is enabled without a contact email; certificate expiry notices will not be delivered"
                        .to_string(),
                );
            }
        }

        if !self.reverse_proxy_path.starts_with('/') {
            errors.push(format!(
                "reverse proxy path must start with '/': {}",
                self.reverse_proxy_path
            ));
        }

        match self.project_type {
            ProjectType::Static => {
                if self.start_command.as_deref().map_or(true, str::is_empty) {
                    // No process to supervise; served by the proxy directly.
                }
            }
            _ => {
                let has_exec = self.exec_path.as_deref().map_or(false, |p| !p.is_empty());
                let has_cmd = self.start_command.as_deref().map_or(false, |c| !c.is_empty());
                if !has_exec && !has_cmd {
                    errors.push("neither a start command nor an executable path is configured".to_string());
                }
                // Existence of exec_path is a launch concern: checking it here
                // would turn a missing binary into a validation failure with no
                // log path instead of a start failure
            }
        }

        (errors, warnings)
    }

    /// Resolve the command to launch this project with. start_command takes
    /// precedence; otherwise the type-specific default invocation is used.
    pub fn launch_plan(&self) -> Result<LaunchPlan, ManagerError> {
        let split = |cmd: &str| -> Result<Vec<String>, ManagerError> {
            shell_words::split(cmd).map_err(|e| ManagerError::Launch {
                code: ErrorCode::ValidationError,
                message: format!("cannot parse start command '{cmd}': {e}"),
                suggestions: vec!["Check quoting in the start command".to_string()],
                log_path: None,
            })
        };

        if let Some(cmd) = self.start_command.as_deref().filter(|c| !c.trim().is_empty()) {
            let mut parts = split(cmd)?;
            return match self.project_type.interpreter() {
                // python/node/java run the command through the runtime,
                // matching how operators write "app.py" or "-jar app.jar"
                Some(interp) => Ok(LaunchPlan {
                    program: interp.to_string(),
                    args: parts,
                }),
                None => {
                    let program = parts.remove(0);
                    Ok(LaunchPlan { program, args: parts })
                }
            };
        }

        match self.project_type {
            ProjectType::Go => {
                let exec = self.exec_path.as_deref().filter(|p| !p.is_empty()).ok_or_else(|| {
                    ManagerError::Launch {
                        code: ErrorCode::ValidationError,
                        message: "go project has no executable path or start command".to_string(),
                        suggestions: vec![
                            "Set the compiled binary path, or configure a start command".to_string(),
                        ],
                        log_path: None,
                    }
                })?;
                Ok(LaunchPlan {
                    program: exec.to_string(),
                    args: Vec::new(),
                })
            }
            ProjectType::Static => Err(ManagerError::Launch {
                code: ErrorCode::ValidationError,
                message: "static projects have no process; the proxy serves them directly".to_string(),
                suggestions: vec![
                    "Remove the start action, or configure an explicit start command".to_string(),
                ],
                log_path: None,
            }),
            other => Err(ManagerError::Launch {
                code: ErrorCode::ValidationError,
                message: format!("{other} project has no start command configured"),
                suggestions: vec!["Configure a start command for this project".to_string()],
                log_path: None,
            }),
        }
    }
}

/// Syntactic hostname/IP validation, applied before a domain is accepted.
///
/// Accepts DNS names (letter/digit/hyphen labels), `localhost`, and literal
/// IPv4/IPv6 addresses. A trailing `:port` suffix is stripped first.
pub fn is_valid_host(input: &str) -> bool {
    let host = input.trim();
    if host.is_empty() {
        return false;
    }

    // Literal IP addresses are accepted as-is
    if host.parse::<std::net::IpAddr>().is_ok() {
        return true;
    }

    // Strip :port if present (not an IPv6 literal at this point)
    let host = match host.rsplit_once(':') {
        Some((h, port)) if port.parse::<u16>().is_ok() => h,
        Some(_) => return false,
        None => host,
    };

    if host.is_empty() || host.len() > 253 {
        return false;
    }
    if host.parse::<std::net::IpAddr>().is_ok() {
        return true;
    }

    host.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_project() -> Project {
        Project {
            id: 1,
            name: "api".to_string(),
            project_type: ProjectType::Go,
            root_dir: "/tmp".to_string(),
            exec_path: None,
            start_command: Some("./bin/api --listen :8080".to_string()),
            port: 8080,
            auto_start: false,
            domains: vec!["api.example.com".to_string()],
            ssl_enabled: true,
            ssl_email: Some("ops@example.com".to_string()),
            reverse_proxy_path: "/".to_string(),
            extra_headers: Vec::new(),
            description: String::new(),
            use_ipv4: true,
            status: ProjectStatus::Stopped,
        }
    }

    #[test]
    fn test_is_valid_host() {
        assert!(is_valid_host("example.com"));
        assert!(is_valid_host("api.example.com"));
        assert!(is_valid_host("localhost"));
        assert!(is_valid_host("example.com:8443"));
        assert!(is_valid_host("192.168.1.10"));
        assert!(is_valid_host("::1"));

        assert!(!is_valid_host(""));
        assert!(!is_valid_host("has space.com"));
        assert!(!is_valid_host("-leading.example.com"));
        assert!(!is_valid_host("trailing-.example.com"));
        assert!(!is_valid_host("bad_label.example.com"));
        assert!(!is_valid_host("example.com:notaport"));
    }

    #[test]
    fn test_validate_ok_with_email() {
        let project = sample_project();
        let (errors, warnings) = project.validate();
        assert!(errors.is_empty(), "{errors:?}");
        assert!(warnings.is_empty());
    }

    #[test]
    fn test_validate_ssl_without_email_warns() {
        let mut project = sample_project();
        project.ssl_email = Some(String::new());
        let (errors, warnings) = project.validate();
        assert!(errors.is_empty());
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("contact email"));
    }

    #[test]
    fn test_validate_ssl_without_domains_fails() {
        let mut project = sample_project();
        project.domains.clear();
        let (errors, _) = project.validate();
        assert!(errors.iter().any(|e| e.contains("SSL")));
    }

    #[test]
    fn test_validate_defers_exec_path_existence_to_launch() {
        let mut project = sample_project();
        project.start_command = None;
        project.exec_path = Some("/definitely/not/a/binary".to_string());
        let (errors, _) = project.validate();
        assert!(errors.is_empty(), "{errors:?}");
    }

    #[test]
    fn test_validate_missing_root_dir() {
        let mut project = sample_project();
        project.root_dir = "/definitely/not/a/dir".to_string();
        let (errors, _) = project.validate();
        assert!(errors.iter().any(|e| e.contains("root directory")));
    }

    #[test]
    fn test_validate_rejects_bad_domain() {
        let mut project = sample_project();
        project.domains.push("not a domain".to_string());
        let (errors, _) = project.validate();
        assert!(errors.iter().any(|e| e.contains("invalid domain")));
    }

    #[test]
    fn test_launch_plan_start_command_wins() {
        let project = sample_project();
        let plan = project.launch_plan().unwrap();
        assert_eq!(plan.program, "./bin/api");
        assert_eq!(plan.args, vec!["--listen", ":8080"]);
    }

    #[test]
    fn test_launch_plan_interpreter_types() {
        let mut project = sample_project();
        project.project_type = ProjectType::Python;
        project.start_command = Some("app.py --port 8080".to_string());
        let plan = project.launch_plan().unwrap();
        assert_eq!(plan.program, "python3");
        assert_eq!(plan.args, vec!["app.py", "--port", "8080"]);

        project.project_type = ProjectType::Java;
        project.start_command = Some("-jar app.jar".to_string());
        let plan = project.launch_plan().unwrap();
        assert_eq!(plan.program, "java");
        assert_eq!(plan.args, vec!["-jar", "app.jar"]);
    }

    #[test]
    fn test_launch_plan_php_runs_command_as_written() {
        let mut project = sample_project();
        project.project_type = ProjectType::Php;
        project.start_command = Some("php -S 0.0.0.0:8080".to_string());
        let plan = project.launch_plan().unwrap();
        assert_eq!(plan.program, "php");
        assert_eq!(plan.args, vec!["-S", "0.0.0.0:8080"]);
    }

    #[test]
    fn test_launch_plan_go_exec_path_default() {
        let mut project = sample_project();
        project.start_command = None;
        project.exec_path = Some("/srv/api/bin/api".to_string());
        let plan = project.launch_plan().unwrap();
        assert_eq!(plan.program, "/srv/api/bin/api");
        assert!(plan.args.is_empty());
    }

    #[test]
    fn test_launch_plan_static_has_no_process() {
        let mut project = sample_project();
        project.project_type = ProjectType::Static;
        project.start_command = None;
        let err = project.launch_plan().unwrap_err();
        assert!(err.to_string().contains("static"));
    }

    #[test]
    fn test_upstream_addr_respects_use_ipv4() {
        let mut project = sample_project();
        assert_eq!(project.upstream_addr(), "127.0.0.1:8080");
        project.use_ipv4 = false;
        assert_eq!(project.upstream_addr(), "localhost:8080");
    }

    #[test]
    fn test_project_type_round_trip() {
        for t in ["go", "python", "nodejs", "java", "php", "static"] {
            assert_eq!(ProjectType::from_str(t).unwrap().as_str(), t);
        }
        assert!(ProjectType::from_str("ruby").is_err());
    }
}
