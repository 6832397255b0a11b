//! Hosting diagnostics
//!
//! Read-only checks over the proxy, supervised listeners, DNS and TLS
//! certificates. Each check is an isolated failure domain: a probe that
//! errors produces an issue in the report instead of aborting the run.
//! Every network probe is bounded by the configured timeout.

use crate::caddy::CaddyManager;
use crate::config::DiagnosticsConfig;
use crate::error::ManagerError;
use crate::project::Project;
use crate::registry::Registry;
use crate::sync::Synchronizer;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

pub const PROXY_DOWN: &str = "PROXY_DOWN";
pub const ROUTE_MISSING: &str = "ROUTE_MISSING";
pub const LISTENER_UNREACHABLE: &str = "LISTENER_UNREACHABLE";
pub const PORT_CONFLICT: &str = "PORT_CONFLICT";
pub const DNS_UNRESOLVED: &str = "DNS_UNRESOLVED";
pub const DNS_PROBE_FAILED: &str = "DNS_PROBE_FAILED";
pub const DNS_MISMATCH: &str = "DNS_MISMATCH";
pub const CLOUDFLARE_PROXY: &str = "CLOUDFLARE_PROXY";
pub const CERT_EXPIRED: &str = "CERT_EXPIRED";
pub const CERT_EXPIRING_SOON: &str = "CERT_EXPIRING_SOON";
pub const CERT_UNAVAILABLE: &str = "CERT_UNAVAILABLE";

/// Issue severity; ordering is used to sort reports, errors first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
    Info,
}

/// One finding with remediation guidance
#[derive(Debug, Clone, Serialize)]
pub struct Issue {
    pub code: String,
    pub severity: Severity,
    pub title: String,
    pub description: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub solutions: Vec<String>,
    /// True when auto_fix() has a registered remedy for this code
    pub auto_fix: bool,
}

impl Issue {
    fn new(code: &str, severity: Severity, title: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            severity,
            title: title.into(),
            description: String::new(),
            solutions: Vec::new(),
            auto_fix: matches!(code, PROXY_DOWN | ROUTE_MISSING | PORT_CONFLICT),
        }
    }

    fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    fn solution(mut self, solution: impl Into<String>) -> Self {
        self.solutions.push(solution.into());
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DiagnosticReport {
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    pub issues: Vec<Issue>,
    pub has_errors: bool,
    pub has_warnings: bool,
}

impl DiagnosticReport {
    fn build(domain: Option<String>, mut issues: Vec<Issue>) -> Self {
        issues.sort_by(|a, b| a.severity.cmp(&b.severity).then_with(|| a.code.cmp(&b.code)));
        let has_errors = issues.iter().any(|i| i.severity == Severity::Error);
        let has_warnings = issues.iter().any(|i| i.severity == Severity::Warning);
        Self {
            timestamp: Utc::now(),
            domain,
            issues,
            has_errors,
            has_warnings,
        }
    }
}

pub struct Diagnostics {
    registry: Arc<Registry>,
    caddy: Arc<CaddyManager>,
    sync: Arc<Synchronizer>,
    config: DiagnosticsConfig,
}

impl Diagnostics {
    pub fn new(
        registry: Arc<Registry>,
        caddy: Arc<CaddyManager>,
        sync: Arc<Synchronizer>,
        config: DiagnosticsConfig,
    ) -> Self {
        Self {
            registry,
            caddy,
            sync,
            config,
        }
    }

    /// Full diagnostic pass over the whole deployment
    pub async fn run_all(&self) -> DiagnosticReport {
        let mut issues = Vec::new();

        issues.extend(self.check_proxy().await);

        let projects = match self.registry.list_projects() {
            Ok(projects) => projects,
            Err(e) => {
                warn!(error = %e, "Diagnostics cannot read the registry");
                return DiagnosticReport::build(None, issues);
            }
        };

        issues.extend(self.check_route_coverage(&projects));
        issues.extend(self.check_listeners(&projects).await);
        issues.extend(self.check_port_squatters(&projects));

        for project in &projects {
            for domain in project.valid_domains() {
                issues.extend(self.check_dns(domain).await);
                if project.ssl_enabled {
                    issues.extend(self.check_certificate(domain).await);
                }
            }
        }

        DiagnosticReport::build(None, issues)
    }

    /// DNS and certificate checks for one domain
    pub async fn check_domain(&self, domain: &str) -> DiagnosticReport {
        let mut issues = self.check_dns(domain).await;

        let ssl_enabled = self
            .registry
            .list_projects()
            .map(|projects| {
                projects.iter().any(|p| {
                    p.ssl_enabled && p.valid_domains().iter().any(|d| *d == domain)
                })
            })
            .unwrap_or(false);
        if ssl_enabled {
            issues.extend(self.check_certificate(domain).await);
        }

        DiagnosticReport::build(Some(domain.to_string()), issues)
    }

    /// Apply the registered remedy for an issue code. Codes without a remedy
    /// return NotAutoFixable; nothing destructive is ever attempted here.
    pub async fn auto_fix(&self, code: &str) -> Result<String, ManagerError> {
        match code {
            PROXY_DOWN => {
                self.caddy.start().await?;
                Ok("proxy started".to_string())
            }
            ROUTE_MISSING | PORT_CONFLICT => {
                self.sync.synchronize().await?;
                Ok("proxy configuration re-synchronized".to_string())
            }
            other => Err(ManagerError::NotAutoFixable(other.to_string())),
        }
    }

    async fn check_proxy(&self) -> Vec<Issue> {
        if self.caddy.is_running().await {
            return Vec::new();
        }
        vec![Issue::new(PROXY_DOWN, Severity::Error, "Reverse proxy is not running")
            .describe("No domain is reachable while Caddy is down.")
            .solution("Start the proxy (auto-fixable)")
            .solution("Check the caddy log for startup errors")]
    }

    /// Running projects with declared domains must appear in the active
    /// configuration generation.
    fn check_route_coverage(&self, projects: &[Project]) -> Vec<Issue> {
        let generation = self.sync.current_generation();
        let mut issues = Vec::new();

        for project in projects.iter().filter(|p| p.is_running_status()) {
            let domains = project.valid_domains();
            if domains.is_empty() {
                continue;
            }
            let covered = generation
                .as_ref()
                .map(|g| domains.iter().all(|d| g.has_route_for_domain(d)))
                .unwrap_or(false);
            if !covered {
                issues.push(
                    Issue::new(ROUTE_MISSING, Severity::Error, format!(
                        "Project '{}' has no active proxy route",
                        project.name
                    ))
                    .describe(format!(
                        "The project is running but its domains ({}) are not in the live proxy configuration.",
                        domains.join(", ")
                    ))
                    .solution("Re-synchronize the proxy configuration (auto-fixable)"),
                );
            }
        }
        issues
    }

    /// Each running project should accept TCP connections on its port
    async fn check_listeners(&self, projects: &[Project]) -> Vec<Issue> {
        let mut issues = Vec::new();
        for project in projects.iter().filter(|p| p.is_running_status()) {
            let addr = format!("127.0.0.1:{}", project.port);
            let reachable = matches!(
                timeout(self.config.probe_timeout(), TcpStream::connect(&addr)).await,
                Ok(Ok(_))
            );
            if !reachable {
                issues.push(
                    Issue::new(LISTENER_UNREACHABLE, Severity::Error, format!(
                        "Project '{}' is not accepting connections on port {}",
                        project.name, project.port
                    ))
                    .describe(format!(
                        "The process is marked running but nothing answered on {addr}."
                    ))
                    .solution("Check the project log for bind errors")
                    .solution(format!(
                        "Confirm the application listens on the configured port ({})",
                        project.port
                    ))
                    .solution("Restart the project"),
                );
            }
        }
        issues
    }

    /// A stopped project whose configured port is already bound will fail to
    /// start later; surface that now.
    fn check_port_squatters(&self, projects: &[Project]) -> Vec<Issue> {
        let mut issues = Vec::new();
        for project in projects.iter().filter(|p| !p.is_running_status()) {
            if std::net::TcpListener::bind(("127.0.0.1", project.port)).is_err() {
                issues.push(
                    Issue::new(PORT_CONFLICT, Severity::Warning, format!(
                        "Port {} for stopped project '{}' is already in use",
                        project.port, project.name
                    ))
                    .describe("Starting this project will fail until the port is free.")
                    .solution(format!(
                        "Find the listener with: ss -ltnp | grep :{}",
                        project.port
                    ))
                    .solution("Choose another port for the project"),
                );
            }
        }
        issues
    }

    /// Resolve the domain, retrying once before reporting a hard failure.
    /// A resolution that does not include this host's outbound address is a
    /// warning, or informational when the records look like Cloudflare's
    /// proxy ranges.
    async fn check_dns(&self, domain: &str) -> Vec<Issue> {
        let addrs = match self.resolve_with_retry(domain).await {
            Ok(addrs) => addrs,
            // Transient probe failures (timeouts) were already retried once;
            // report them as a warning, not a missing record
            Err(ProbeFailure::Timeout) => {
                return vec![Issue::new(DNS_PROBE_FAILED, Severity::Warning, format!(
                    "DNS lookup for '{domain}' timed out"
                ))
                .describe("The resolver did not answer in time; the record may still exist.")
                .solution("Check this host's resolver configuration")
                .solution(format!("Verify manually with: dig +short {domain}"))];
            }
            Err(ProbeFailure::NoRecord(reason)) => {
                return vec![Issue::new(DNS_UNRESOLVED, Severity::Error, format!(
                    "Domain '{domain}' does not resolve"
                ))
                .describe(reason)
                .solution(format!("Create an A record for {domain} at your DNS provider"))
                .solution("Wait for DNS propagation (up to 48h after changes)")
                .solution(format!("Verify with: dig +short {domain}"))];
            }
        };

        if addrs.iter().any(is_cloudflare_ip) {
            return vec![Issue::new(CLOUDFLARE_PROXY, Severity::Info, format!(
                "Domain '{domain}' appears to be behind Cloudflare"
            ))
            .describe(
                "Resolved addresses are in Cloudflare's proxy ranges; the origin address is hidden and a mismatch here is expected.",
            )];
        }

        if let Some(local) = outbound_ip() {
            if !addrs.contains(&local) {
                let listed = addrs
                    .iter()
                    .map(|a| a.to_string())
                    .collect::<Vec<_>>()
                    .join(", ");
                return vec![Issue::new(DNS_MISMATCH, Severity::Warning, format!(
                    "Domain '{domain}' does not point at this host"
                ))
                .describe(format!(
                    "Resolved to {listed}, but this host's outbound address is {local}. Behind NAT this can be a false positive."
                ))
                .solution(format!("Point the A record for {domain} at this host's public address"))
                .solution("Ignore this warning if a NAT or load balancer fronts this host")];
            }
        }

        Vec::new()
    }

    async fn resolve_with_retry(&self, domain: &str) -> Result<Vec<IpAddr>, ProbeFailure> {
        let mut last = ProbeFailure::NoRecord("unresolved".to_string());
        for attempt in 0..2 {
            if attempt > 0 {
                tokio::time::sleep(std::time::Duration::from_millis(250)).await;
            }
            match timeout(
                self.config.probe_timeout(),
                tokio::net::lookup_host((domain, 443u16)),
            )
            .await
            {
                Ok(Ok(addrs)) => {
                    let ips: Vec<IpAddr> = addrs.map(|a| a.ip()).collect();
                    if !ips.is_empty() {
                        return Ok(ips);
                    }
                    last = ProbeFailure::NoRecord("resolver returned no addresses".to_string());
                }
                Ok(Err(e)) => last = ProbeFailure::NoRecord(e.to_string()),
                Err(_) => last = ProbeFailure::Timeout,
            }
            debug!(domain, attempt, "DNS lookup attempt failed");
        }
        Err(last)
    }

    /// TLS handshake against port 443 with verification disabled, purely to
    /// capture the served certificate and inspect its expiry.
    async fn check_certificate(&self, domain: &str) -> Vec<Issue> {
        let not_after = match self.probe_certificate(domain).await {
            Ok(not_after) => not_after,
            Err(reason) => {
                return vec![Issue::new(CERT_UNAVAILABLE, Severity::Warning, format!(
                    "Cannot inspect the certificate for '{domain}'"
                ))
                .describe(reason)
                .solution("Confirm the proxy is running and the domain resolves to this host")
                .solution("Check the caddy log for certificate issuance errors")];
            }
        };

        let now = Utc::now().timestamp();
        let days_remaining = (not_after - now) / 86_400;

        if not_after <= now {
            return vec![Issue::new(CERT_EXPIRED, Severity::Error, format!(
                "Certificate for '{domain}' has expired"
            ))
            .describe("Browsers will refuse connections until a new certificate is issued.")
            .solution("Check the caddy log for renewal errors")
            .solution("Confirm port 443 is reachable from the internet for the ACME challenge")];
        }

        if days_remaining < self.config.cert_warning_days {
            return vec![Issue::new(CERT_EXPIRING_SOON, Severity::Warning, format!(
                "Certificate for '{domain}' expires in {days_remaining} day(s)"
            ))
            .describe("Automatic renewal normally happens well before expiry; a short remaining lifetime suggests renewal is failing.")
            .solution("Check the caddy log for renewal errors")];
        }

        Vec::new()
    }

    /// Returns the certificate's not-after as a unix timestamp
    async fn probe_certificate(&self, domain: &str) -> Result<i64, String> {
        let tcp = timeout(
            self.config.probe_timeout(),
            TcpStream::connect((domain, 443u16)),
        )
        .await
        .map_err(|_| "TCP connect to port 443 timed out".to_string())?
        .map_err(|e| format!("TCP connect to port 443 failed: {e}"))?;

        let connector = tokio_rustls::TlsConnector::from(insecure_probe_config());
        let server_name = rustls::pki_types::ServerName::try_from(domain.to_string())
            .map_err(|e| format!("invalid server name: {e}"))?;

        let stream = timeout(self.config.probe_timeout(), connector.connect(server_name, tcp))
            .await
            .map_err(|_| "TLS handshake timed out".to_string())?
            .map_err(|e| format!("TLS handshake failed: {e}"))?;

        let (_, session) = stream.get_ref();
        let certs = session
            .peer_certificates()
            .ok_or_else(|| "peer presented no certificate".to_string())?;
        let leaf = certs
            .first()
            .ok_or_else(|| "peer presented an empty certificate chain".to_string())?;

        let (_, parsed) = x509_parser::parse_x509_certificate(leaf.as_ref())
            .map_err(|e| format!("cannot parse peer certificate: {e}"))?;
        Ok(parsed.validity().not_after.timestamp())
    }
}

enum ProbeFailure {
    /// Resolver answered and the record is absent or unusable
    NoRecord(String),
    /// Resolver never answered within the probe timeout
    Timeout,
}

/// Cloudflare fronts origins from well-known proxy ranges; seeing one means
/// a mismatch against the local address is expected, not a problem.
fn is_cloudflare_ip(ip: &IpAddr) -> bool {
    let s = ip.to_string();
    s.starts_with("104.21.") || s.starts_with("172.67.") || s.starts_with("104.18.")
}

/// The address the default route would use for outbound traffic. No packet
/// is sent; connect() on a UDP socket just selects the interface.
fn outbound_ip() -> Option<IpAddr> {
    let socket = std::net::UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    Some(socket.local_addr().ok()?.ip())
}

/// Client config that accepts any certificate. Only used to read the peer
/// certificate for expiry inspection, never for real traffic.
fn insecure_probe_config() -> Arc<rustls::ClientConfig> {
    let config = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyCert))
        .with_no_client_auth();
    Arc::new(config)
}

#[derive(Debug)]
struct AcceptAnyCert;

impl rustls::client::danger::ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DiagnosticsConfig;
    use crate::project::{ProjectStatus, ProjectType};
    use std::path::Path;

    fn write_stub_caddy(dir: &Path) -> std::path::PathBuf {
        let stub = dir.join("caddy");
        std::fs::write(&stub, "#!/bin/sh\nexit 0\n").unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&stub, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        stub
    }

    fn build(dir: &Path) -> (Arc<Registry>, Diagnostics) {
        let registry = Arc::new(Registry::open_in_memory().unwrap());
        let caddy = Arc::new(CaddyManager::new(
            write_stub_caddy(dir),
            dir.join("Caddyfile"),
            dir.join("caddy.log"),
        ));
        let sync = Synchronizer::new(Arc::clone(&registry), Arc::clone(&caddy));
        let diagnostics = Diagnostics::new(
            Arc::clone(&registry),
            caddy,
            sync,
            DiagnosticsConfig {
                probe_timeout_secs: 2,
                cert_warning_days: 14,
            },
        );
        (registry, diagnostics)
    }

    fn sample(name: &str, port: u16, domains: &[&str]) -> Project {
        Project {
            id: 0,
            name: name.to_string(),
            project_type: ProjectType::Go,
            root_dir: "/tmp".to_string(),
            exec_path: None,
            start_command: Some("sleep 60".to_string()),
            port,
            auto_start: false,
            domains: domains.iter().map(|d| d.to_string()).collect(),
            ssl_enabled: false,
            ssl_email: None,
            reverse_proxy_path: "/".to_string(),
            extra_headers: Vec::new(),
            description: String::new(),
            use_ipv4: true,
            status: ProjectStatus::Stopped,
        }
    }

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Error < Severity::Warning);
        assert!(Severity::Warning < Severity::Info);
    }

    #[test]
    fn test_report_sorts_and_flags() {
        let issues = vec![
            Issue::new(CLOUDFLARE_PROXY, Severity::Info, "info"),
            Issue::new(DNS_UNRESOLVED, Severity::Error, "error"),
            Issue::new(DNS_MISMATCH, Severity::Warning, "warning"),
        ];
        let report = DiagnosticReport::build(None, issues);
        assert_eq!(report.issues[0].severity, Severity::Error);
        assert_eq!(report.issues[2].severity, Severity::Info);
        assert!(report.has_errors);
        assert!(report.has_warnings);
    }

    #[test]
    fn test_cloudflare_detection() {
        assert!(is_cloudflare_ip(&"104.21.5.9".parse().unwrap()));
        assert!(is_cloudflare_ip(&"172.67.180.3".parse().unwrap()));
        assert!(!is_cloudflare_ip(&"93.184.216.34".parse().unwrap()));
        assert!(!is_cloudflare_ip(&"::1".parse().unwrap()));
    }

    #[tokio::test]
    async fn test_unresolvable_domain_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let (_registry, diagnostics) = build(dir.path());

        // .invalid is reserved and never resolves (RFC 2606)
        let report = diagnostics.check_domain("nope.invalid").await;
        assert!(report.has_errors);
        let issue = report
            .issues
            .iter()
            .find(|i| i.code == DNS_UNRESOLVED)
            .expect("DNS issue");
        assert!(!issue.solutions.is_empty());
        assert_eq!(report.domain.as_deref(), Some("nope.invalid"));
    }

    #[tokio::test]
    async fn test_proxy_down_reported() {
        let dir = tempfile::tempdir().unwrap();
        let (_registry, diagnostics) = build(dir.path());

        let report = diagnostics.run_all().await;
        let issue = report
            .issues
            .iter()
            .find(|i| i.code == PROXY_DOWN)
            .expect("proxy issue");
        assert_eq!(issue.severity, Severity::Error);
        assert!(issue.auto_fix);
    }

    #[tokio::test]
    async fn test_route_missing_for_running_project_without_generation() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, diagnostics) = build(dir.path());

        let id = registry
            .insert_project(&sample("api", 18601, &["api.example.com"]))
            .unwrap();
        registry.set_status(id, ProjectStatus::Running).unwrap();

        let report = diagnostics.run_all().await;
        assert!(report.issues.iter().any(|i| i.code == ROUTE_MISSING));
        // Its listener cannot be reached either
        assert!(report.issues.iter().any(|i| i.code == LISTENER_UNREACHABLE));
    }

    #[tokio::test]
    async fn test_port_squatter_warning_for_stopped_project() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, diagnostics) = build(dir.path());

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        registry.insert_project(&sample("squatted", port, &[])).unwrap();

        let report = diagnostics.run_all().await;
        let issue = report
            .issues
            .iter()
            .find(|i| i.code == PORT_CONFLICT)
            .expect("port conflict issue");
        assert_eq!(issue.severity, Severity::Warning);
        assert!(issue.auto_fix);
    }

    #[tokio::test]
    async fn test_unknown_code_is_not_auto_fixable() {
        let dir = tempfile::tempdir().unwrap();
        let (_registry, diagnostics) = build(dir.path());

        let err = diagnostics.auto_fix("CERT_EXPIRED").await.unwrap_err();
        assert!(matches!(err, ManagerError::NotAutoFixable(_)));
    }

    #[tokio::test]
    async fn test_route_missing_auto_fix_synchronizes() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, diagnostics) = build(dir.path());

        let id = registry
            .insert_project(&sample("api", 18602, &["api.example.com"]))
            .unwrap();
        registry.set_status(id, ProjectStatus::Running).unwrap();

        diagnostics.auto_fix(ROUTE_MISSING).await.unwrap();
        let generation = diagnostics.sync.current_generation().unwrap();
        assert!(generation.has_route_for_domain("api.example.com"));
    }
}
