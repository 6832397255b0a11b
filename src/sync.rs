//! Proxy configuration synchronizer
//!
//! Derives the full route set from all running projects, renders it to a
//! staged Caddyfile, validates it with Caddy's own validator, and only then
//! swaps it in with a zero-downtime reload. Each successful pass produces an
//! immutable [`ConfigGeneration`]; a failed pass leaves the previous
//! generation fully active. Concurrent triggers coalesce into a single
//! staging→validate→apply cycle over the latest registry state.

use crate::caddy::CaddyManager;
use crate::error::ManagerError;
use crate::project::Project;
use crate::registry::Registry;
use parking_lot::RwLock;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

/// TLS policy for one route, derived from the project's SSL settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TlsPolicy {
    /// Plain HTTP; the site address is prefixed with http://
    Disabled,
    /// Caddy's automatic HTTPS with its default issuer settings
    Auto,
    /// Automatic HTTPS with an ACME contact email
    AutoWithEmail(String),
}

/// One domain-to-upstream mapping as applied in the proxy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyRoute {
    pub project_id: i64,
    pub project_name: String,
    pub domain: String,
    pub path: String,
    pub upstream: String,
    pub tls: TlsPolicy,
    pub extra_headers: Vec<String>,
}

/// Immutable result of one successful synchronization
#[derive(Debug)]
pub struct ConfigGeneration {
    pub seq: u64,
    pub routes: Vec<ProxyRoute>,
    pub rendered: String,
}

impl ConfigGeneration {
    pub fn has_route_for_domain(&self, domain: &str) -> bool {
        self.routes.iter().any(|r| r.domain == domain)
    }

    pub fn has_routes_for_project(&self, project_id: i64) -> bool {
        self.routes.iter().any(|r| r.project_id == project_id)
    }
}

/// What a synchronize call observed
#[derive(Debug, Clone)]
pub enum SyncOutcome {
    /// This call ran a cycle and applied a new generation
    Applied(Arc<ConfigGeneration>),
    /// An overlapping cycle already covered this trigger
    Coalesced(Option<Arc<ConfigGeneration>>),
}

impl SyncOutcome {
    pub fn generation(&self) -> Option<&Arc<ConfigGeneration>> {
        match self {
            SyncOutcome::Applied(generation) => Some(generation),
            SyncOutcome::Coalesced(generation) => generation.as_ref(),
        }
    }
}

pub struct Synchronizer {
    registry: Arc<Registry>,
    caddy: Arc<CaddyManager>,
    current: RwLock<Option<Arc<ConfigGeneration>>>,
    seq: AtomicU64,
    /// Single-writer critical section for staging→validate→apply
    cycle_lock: Mutex<()>,
    /// Set by every trigger, cleared by the cycle that consumes it
    dirty: AtomicBool,
}

impl Synchronizer {
    pub fn new(registry: Arc<Registry>, caddy: Arc<CaddyManager>) -> Arc<Self> {
        Arc::new(Self {
            registry,
            caddy,
            current: RwLock::new(None),
            seq: AtomicU64::new(0),
            cycle_lock: Mutex::new(()),
            dirty: AtomicBool::new(false),
        })
    }

    pub fn current_generation(&self) -> Option<Arc<ConfigGeneration>> {
        self.current.read().clone()
    }

    /// Regenerate and apply the proxy configuration from current registry
    /// state. Logically atomic: either the full eligible route set becomes
    /// live, or the previous configuration stays untouched.
    pub async fn synchronize(&self) -> Result<SyncOutcome, ManagerError> {
        self.dirty.store(true, Ordering::SeqCst);
        let _guard = self.cycle_lock.lock().await;

        // A cycle that started after our trigger has already read the
        // latest registry state; nothing left to do.
        if !self.dirty.swap(false, Ordering::SeqCst) {
            return Ok(SyncOutcome::Coalesced(self.current_generation()));
        }

        let generation = self.run_cycle().await?;
        Ok(SyncOutcome::Applied(generation))
    }

    /// Fire-and-forget trigger used after lifecycle transitions; failures
    /// are logged, not propagated, so a sync problem never wedges the
    /// supervisor.
    pub fn request_sync(self: &Arc<Self>) {
        let sync = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = sync.synchronize().await {
                error!(error = %e, "Background proxy synchronization failed");
            }
        });
    }

    async fn run_cycle(&self) -> Result<Arc<ConfigGeneration>, ManagerError> {
        let candidates: Vec<Project> = self
            .registry
            .running_projects()
            .map_err(|e| ManagerError::Sync {
                message: format!("cannot read registry: {e}"),
                offenders: Vec::new(),
            })?
            .into_iter()
            .filter(|p| !p.valid_domains().is_empty())
            .collect();

        let routes = build_routes(&candidates);
        let rendered = render_caddyfile(&routes);

        let live_path = self.caddy.caddyfile_path().to_path_buf();
        let staging_dir = live_path
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| std::path::PathBuf::from("."));
        std::fs::create_dir_all(&staging_dir)?;

        // Stage next to the live file so the final persist is a rename
        let mut staging = tempfile::NamedTempFile::new_in(&staging_dir)?;
        std::io::Write::write_all(&mut staging, rendered.as_bytes())?;
        std::io::Write::flush(&mut staging)?;

        if let Err(validation_err) = self.caddy.validate(staging.path()).await {
            let offenders = self.identify_offenders(&candidates, &staging_dir).await;
            warn!(
                error = %validation_err,
                offenders = ?offenders,
                "Staged proxy configuration rejected, previous configuration preserved"
            );
            return Err(ManagerError::Sync {
                message: validation_err.to_string(),
                offenders,
            });
        }

        // Keep the previous rendering so a rejected reload can be rolled back
        let previous = std::fs::read_to_string(&live_path).ok();

        staging.persist(&live_path).map_err(|e| ManagerError::Sync {
            message: format!("cannot write live configuration: {}", e.error),
            offenders: Vec::new(),
        })?;

        if self.caddy.is_running().await {
            if let Err(reload_err) = self.caddy.reload().await {
                // Disk state must match the still-active configuration
                match previous {
                    Some(prev) => {
                        let _ = std::fs::write(&live_path, prev);
                    }
                    None => {
                        let _ = std::fs::remove_file(&live_path);
                    }
                }
                return Err(ManagerError::Sync {
                    message: reload_err.to_string(),
                    offenders: Vec::new(),
                });
            }
        } else {
            // No running proxy to reload; the file is picked up on start
            warn!("Caddy is not running; configuration staged for next start");
        }

        let generation = Arc::new(ConfigGeneration {
            seq: self.seq.fetch_add(1, Ordering::SeqCst) + 1,
            routes,
            rendered,
        });
        *self.current.write() = Some(Arc::clone(&generation));

        info!(
            generation = generation.seq,
            routes = generation.routes.len(),
            "Proxy configuration synchronized"
        );
        Ok(generation)
    }

    /// Name the project(s) whose solo configuration fails validation. When
    /// every solo rendering validates, the combination is at fault and all
    /// candidates are named.
    async fn identify_offenders(
        &self,
        candidates: &[Project],
        staging_dir: &std::path::Path,
    ) -> Vec<String> {
        let mut offenders = Vec::new();
        for project in candidates {
            let solo = render_caddyfile(&build_routes(std::slice::from_ref(project)));
            let staged = tempfile::NamedTempFile::new_in(staging_dir)
                .and_then(|mut f| {
                    std::io::Write::write_all(&mut f, solo.as_bytes())?;
                    std::io::Write::flush(&mut f)?;
                    Ok(f)
                });
            match staged {
                Ok(file) => {
                    if self.caddy.validate(file.path()).await.is_err() {
                        offenders.push(project.name.clone());
                    }
                }
                Err(e) => {
                    warn!(project = %project.name, error = %e, "Cannot stage solo validation");
                }
            }
        }
        if offenders.is_empty() {
            offenders = candidates.iter().map(|p| p.name.clone()).collect();
        }
        offenders
    }
}

/// Build the route set: one route per declared valid domain, first domain
/// being the project's primary.
pub fn build_routes(projects: &[Project]) -> Vec<ProxyRoute> {
    let mut routes = Vec::new();
    for project in projects {
        let tls = if !project.ssl_enabled {
            TlsPolicy::Disabled
        } else {
            match project.ssl_email.as_deref().filter(|e| !e.trim().is_empty()) {
                Some(email) => TlsPolicy::AutoWithEmail(email.trim().to_string()),
                None => TlsPolicy::Auto,
            }
        };
        for domain in project.valid_domains() {
            routes.push(ProxyRoute {
                project_id: project.id,
                project_name: project.name.clone(),
                domain: domain.to_string(),
                path: project.reverse_proxy_path.clone(),
                upstream: project.upstream_addr(),
                tls: tls.clone(),
                extra_headers: project.extra_headers.clone(),
            });
        }
    }
    routes
}

/// Render the full Caddyfile for a route set
pub fn render_caddyfile(routes: &[ProxyRoute]) -> String {
    let mut out = String::new();
    out.push_str("# Generated by caddygate. Do not edit; changes are overwritten on\n");
    out.push_str("# the next synchronization.\n\n");

    if routes.is_empty() {
        out.push_str(":80 {\n\trespond \"caddygate proxy is running\" 200\n}\n");
        return out;
    }

    for route in routes {
        let site = match route.tls {
            TlsPolicy::Disabled => format!("http://{}", route.domain),
            _ => route.domain.clone(),
        };
        let _ = writeln!(out, "# project: {}", route.project_name);
        let _ = writeln!(out, "{site} {{");

        let proxy_block = render_reverse_proxy(route, route.path != "/");
        out.push_str(&proxy_block);

        if let TlsPolicy::AutoWithEmail(ref email) = route.tls {
            let _ = writeln!(out, "\ttls {email}");
        }
        out.push_str("}\n\n");
    }

    out
}

fn render_reverse_proxy(route: &ProxyRoute, scoped: bool) -> String {
    let indent = if scoped { "\t\t" } else { "\t" };
    let mut block = String::new();

    if scoped {
        let path = route.path.trim_end_matches('/');
        let _ = writeln!(block, "\troute {path}/* {{");
    }

    if route.extra_headers.is_empty() {
        let _ = writeln!(block, "{indent}reverse_proxy {}", route.upstream);
    } else {
        let _ = writeln!(block, "{indent}reverse_proxy {} {{", route.upstream);
        for header in &route.extra_headers {
            let _ = writeln!(block, "{indent}\theader_up {header}");
        }
        let _ = writeln!(block, "{indent}}}");
    }

    if scoped {
        block.push_str("\t}\n");
    }
    block
}
