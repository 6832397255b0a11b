use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Global configuration for caddygate
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Admin API server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Filesystem layout
    #[serde(default)]
    pub paths: PathsConfig,

    /// Process supervision defaults
    #[serde(default)]
    pub supervisor: SupervisorConfig,

    /// Diagnostics tuning
    #[serde(default)]
    pub diagnostics: DiagnosticsConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address for the admin API (default: 127.0.0.1)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Port for the admin API
    #[serde(default = "default_admin_port")]
    pub admin_port: u16,

    /// Authentication token for the admin API (required for all project,
    /// proxy and diagnostics operations). If not set, a random token is
    /// generated at startup and logged.
    pub admin_token: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            admin_port: default_admin_port(),
            admin_token: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct PathsConfig {
    /// Data directory: database, logs and the generated Caddyfile live here
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Path to the caddy binary (default: resolved from PATH)
    #[serde(default = "default_caddy_bin")]
    pub caddy_bin: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            caddy_bin: default_caddy_bin(),
        }
    }
}

impl PathsConfig {
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("projects.db")
    }

    pub fn caddyfile_path(&self) -> PathBuf {
        self.data_dir.join("Caddyfile")
    }

    pub fn caddy_log_path(&self) -> PathBuf {
        self.data_dir.join("logs").join("caddy.log")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    pub fn project_log_path(&self, project_id: i64) -> PathBuf {
        self.log_dir().join(format!("project_{project_id}.log"))
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SupervisorConfig {
    /// Grace period between SIGTERM and SIGKILL when stopping a project
    #[serde(default = "default_shutdown_grace_period")]
    pub shutdown_grace_period_secs: u64,

    /// Overall bound for the stop phase of a restart
    #[serde(default = "default_restart_stop_timeout")]
    pub restart_stop_timeout_secs: u64,

    /// Interval at which running children are polled for unexpected exits
    #[serde(default = "default_exit_poll_interval")]
    pub exit_poll_interval_ms: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            shutdown_grace_period_secs: default_shutdown_grace_period(),
            restart_stop_timeout_secs: default_restart_stop_timeout(),
            exit_poll_interval_ms: default_exit_poll_interval(),
        }
    }
}

impl SupervisorConfig {
    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_period_secs)
    }

    pub fn restart_stop_timeout(&self) -> Duration {
        Duration::from_secs(self.restart_stop_timeout_secs)
    }

    pub fn exit_poll_interval(&self) -> Duration {
        Duration::from_millis(self.exit_poll_interval_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DiagnosticsConfig {
    /// Per-probe timeout for DNS lookups and TCP/TLS connects
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,

    /// Certificates expiring within this many days raise a warning
    #[serde(default = "default_cert_warning_days")]
    pub cert_warning_days: i64,
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            probe_timeout_secs: default_probe_timeout(),
            cert_warning_days: default_cert_warning_days(),
        }
    }
}

impl DiagnosticsConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }
}

impl Config {
    /// Load configuration from a TOML file. A missing file yields defaults.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file {}: {}", path.display(), e))?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Failed to parse config file {}: {}", path.display(), e))?;
        Ok(config)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            paths: PathsConfig::default(),
            supervisor: SupervisorConfig::default(),
            diagnostics: DiagnosticsConfig::default(),
        }
    }
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_admin_port() -> u16 {
    7019
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_caddy_bin() -> PathBuf {
    PathBuf::from("caddy")
}

fn default_shutdown_grace_period() -> u64 {
    10
}

fn default_restart_stop_timeout() -> u64 {
    30
}

fn default_exit_poll_interval() -> u64 {
    2000
}

fn default_probe_timeout() -> u64 {
    5
}

fn default_cert_warning_days() -> i64 {
    14
}
