//! Admin API server
//!
//! Local HTTP interface for project lifecycle, proxy control and
//! diagnostics. Binds to the loopback by default and requires a bearer
//! token for everything except /health and /version.

use crate::caddy::CaddyManager;
use crate::diagnostics::Diagnostics;
use crate::error::{ErrorCode, ManagerError, OpReport};
use crate::project::Project;
use crate::supervisor::Supervisor;
use crate::sync::Synchronizer;
use anyhow::Result;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::{AUTHORIZATION, CONTENT_TYPE};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Success envelope; failures are serialized as [`OpReport`]s
#[derive(Debug, Serialize)]
struct ApiResponse<T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
        }
    }
}

pub struct AdminServer {
    bind_addr: SocketAddr,
    token: String,
    supervisor: Arc<Supervisor>,
    caddy: Arc<CaddyManager>,
    sync: Arc<Synchronizer>,
    diagnostics: Arc<Diagnostics>,
    shutdown_rx: watch::Receiver<bool>,
}

impl AdminServer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        bind_addr: SocketAddr,
        token: String,
        supervisor: Arc<Supervisor>,
        caddy: Arc<CaddyManager>,
        sync: Arc<Synchronizer>,
        diagnostics: Arc<Diagnostics>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bind_addr,
            token,
            supervisor,
            caddy,
            sync,
            diagnostics,
            shutdown_rx,
        }
    }

    pub async fn run(self: Arc<Self>) -> Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(addr = %self.bind_addr, "Admin API listening");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let server = Arc::clone(&self);
                            tokio::spawn(async move {
                                if let Err(e) = server.serve_connection(stream).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Admin API shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    async fn serve_connection<S>(self: Arc<Self>, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let io = TokioIo::new(stream);
        let service = service_fn(move |req| {
            let server = Arc::clone(&self);
            async move { server.handle_request(req).await }
        });

        AutoBuilder::new(TokioExecutor::new())
            .serve_connection(io, service)
            .await
            .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

        Ok(())
    }

    fn check_auth(&self, req: &Request<hyper::body::Incoming>) -> bool {
        req.headers()
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(|auth| auth.strip_prefix("Bearer ").unwrap_or(auth).eq(&self.token))
            .unwrap_or(false)
    }

    async fn handle_request(
        self: Arc<Self>,
        req: Request<hyper::body::Incoming>,
    ) -> Result<Response<Full<Bytes>>, hyper::Error> {
        let path = req.uri().path().to_string();
        let method = req.method().clone();

        debug!(%method, %path, "Admin API request");

        if path == "/health" && method == Method::GET {
            return Ok(json_response(StatusCode::OK, r#"{"status":"ok"}"#));
        }
        if path == "/version" && method == Method::GET {
            let version = serde_json::json!({
                "name": "caddygate",
                "version": env!("CARGO_PKG_VERSION"),
            });
            return Ok(json_response(StatusCode::OK, version.to_string()));
        }

        if !self.check_auth(&req) {
            warn!(%path, "Unauthorized admin API request");
            return Ok(json_response(
                StatusCode::UNAUTHORIZED,
                r#"{"success":false,"error":"unauthorized"}"#,
            ));
        }

        let query = req.uri().query().map(str::to_string);
        let response = match (method, path.as_str()) {
            // Projects
            (Method::GET, "/projects") => self.list_projects().await,
            (Method::POST, "/projects") => self.create_project(req).await,
            (Method::GET, p) if project_id(p, None).is_some() => {
                self.get_project(project_id(p, None).unwrap()).await
            }
            (Method::PUT, p) if project_id(p, None).is_some() => {
                self.update_project(project_id(p, None).unwrap(), req).await
            }
            (Method::DELETE, p) if project_id(p, None).is_some() => {
                self.delete_project(project_id(p, None).unwrap()).await
            }
            (Method::POST, p) if project_id(p, Some("start")).is_some() => {
                self.start_project(project_id(p, Some("start")).unwrap()).await
            }
            (Method::POST, p) if project_id(p, Some("stop")).is_some() => {
                self.stop_project(project_id(p, Some("stop")).unwrap()).await
            }
            (Method::POST, p) if project_id(p, Some("restart")).is_some() => {
                self.restart_project(project_id(p, Some("restart")).unwrap()).await
            }
            (Method::GET, p) if project_id(p, Some("logs")).is_some() => {
                self.project_logs(project_id(p, Some("logs")).unwrap(), query.as_deref())
            }

            // Proxy
            (Method::GET, "/proxy/status") => self.proxy_status().await,
            (Method::POST, "/proxy/start") => self.proxy_control("start").await,
            (Method::POST, "/proxy/stop") => self.proxy_control("stop").await,
            (Method::POST, "/proxy/restart") => self.proxy_control("restart").await,
            (Method::POST, "/proxy/reload") => self.proxy_reload().await,
            (Method::GET, "/proxy/logs") => self.proxy_logs(query.as_deref()),

            // Diagnostics
            (Method::GET, "/diagnostics/run") => self.run_diagnostics().await,
            (Method::GET, p) if p.starts_with("/diagnostics/domain/") => {
                let domain = p.trim_start_matches("/diagnostics/domain/").to_string();
                self.diagnose_domain(&domain).await
            }
            (Method::POST, p) if p.starts_with("/diagnostics/fix/") => {
                let code = p.trim_start_matches("/diagnostics/fix/").to_string();
                self.fix_issue(&code).await
            }

            _ => Ok(json_response(
                StatusCode::NOT_FOUND,
                r#"{"success":false,"error":"not found"}"#,
            )),
        };

        response.or_else(|e| {
            error!(error = %e, "Admin API handler error");
            Ok(json_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!(r#"{{"success":false,"error":"internal error: {e}"}}"#),
            ))
        })
    }

    // ==================== Projects ====================

    async fn list_projects(&self) -> Result<Response<Full<Bytes>>> {
        match self.supervisor.list().await {
            Ok(views) => ok_json(&ApiResponse::ok(views)),
            Err(e) => Ok(error_response(&e)),
        }
    }

    async fn get_project(&self, id: i64) -> Result<Response<Full<Bytes>>> {
        match self.supervisor.view(id).await {
            Ok(view) => ok_json(&ApiResponse::ok(view)),
            Err(e) => Ok(error_response(&e)),
        }
    }

    async fn create_project(
        &self,
        req: Request<hyper::body::Incoming>,
    ) -> Result<Response<Full<Bytes>>> {
        let body = req.collect().await?.to_bytes();
        let project: Project = match serde_json::from_slice(&body) {
            Ok(p) => p,
            Err(e) => return Ok(bad_request(format!("invalid project payload: {e}"))),
        };

        match self.supervisor.create(project).await {
            Ok((created, warnings)) => ok_json(&ApiResponse::ok(serde_json::json!({
                "project": created,
                "warnings": warnings,
            }))),
            Err(e) => Ok(error_response(&e)),
        }
    }

    async fn update_project(
        &self,
        id: i64,
        req: Request<hyper::body::Incoming>,
    ) -> Result<Response<Full<Bytes>>> {
        let body = req.collect().await?.to_bytes();
        let mut project: Project = match serde_json::from_slice(&body) {
            Ok(p) => p,
            Err(e) => return Ok(bad_request(format!("invalid project payload: {e}"))),
        };
        project.id = id;

        match self.supervisor.update(project).await {
            Ok(warnings) => ok_json(&ApiResponse::ok(serde_json::json!({
                "warnings": warnings,
            }))),
            Err(e) => Ok(error_response(&e)),
        }
    }

    async fn delete_project(&self, id: i64) -> Result<Response<Full<Bytes>>> {
        match self.supervisor.delete(id).await {
            Ok(()) => ok_json(&OpReport::ok(format!("project {id} deleted"))),
            Err(e) => Ok(error_response(&e)),
        }
    }

    async fn start_project(&self, id: i64) -> Result<Response<Full<Bytes>>> {
        match self.supervisor.start(id).await {
            Ok(outcome) => ok_json(&ApiResponse::ok(outcome)),
            Err(e) => Ok(error_response(&e)),
        }
    }

    async fn stop_project(&self, id: i64) -> Result<Response<Full<Bytes>>> {
        match self.supervisor.stop(id).await {
            Ok(true) => ok_json(&OpReport::ok(format!("project {id} stopped"))),
            Ok(false) => ok_json(&OpReport::ok(format!("project {id} was not running"))),
            Err(e) => Ok(error_response(&e)),
        }
    }

    async fn restart_project(&self, id: i64) -> Result<Response<Full<Bytes>>> {
        match self.supervisor.restart(id).await {
            Ok(outcome) => ok_json(&ApiResponse::ok(outcome)),
            Err(e) => Ok(error_response(&e)),
        }
    }

    fn project_logs(&self, id: i64, query: Option<&str>) -> Result<Response<Full<Bytes>>> {
        match self.supervisor.logs(id, lines_param(query)) {
            Ok(logs) => ok_json(&ApiResponse::ok(serde_json::json!({ "logs": logs }))),
            Err(e) => Ok(error_response(&e)),
        }
    }

    // ==================== Proxy ====================

    async fn proxy_status(&self) -> Result<Response<Full<Bytes>>> {
        let status = self.caddy.status().await;
        ok_json(&ApiResponse::ok(status))
    }

    async fn proxy_control(&self, action: &str) -> Result<Response<Full<Bytes>>> {
        let result = match action {
            "start" => self.caddy.start().await,
            "restart" => self.caddy.restart().await,
            "stop" => {
                self.caddy.stop().await;
                Ok(())
            }
            _ => Err(ManagerError::ProxyControl(format!("unknown action: {action}"))),
        };
        match result {
            Ok(()) => ok_json(&OpReport::ok(format!("proxy {action} completed"))),
            Err(e) => Ok(error_response(&e)),
        }
    }

    /// Zero-downtime apply of the current registry state
    async fn proxy_reload(&self) -> Result<Response<Full<Bytes>>> {
        match self.sync.synchronize().await {
            Ok(outcome) => {
                let seq = outcome.generation().map(|g| g.seq);
                ok_json(&ApiResponse::ok(serde_json::json!({ "generation": seq })))
            }
            Err(e) => Ok(error_response(&e)),
        }
    }

    fn proxy_logs(&self, query: Option<&str>) -> Result<Response<Full<Bytes>>> {
        let logs = self.caddy.logs(lines_param(query));
        ok_json(&ApiResponse::ok(serde_json::json!({ "logs": logs })))
    }

    // ==================== Diagnostics ====================

    async fn run_diagnostics(&self) -> Result<Response<Full<Bytes>>> {
        let report = self.diagnostics.run_all().await;
        ok_json(&ApiResponse::ok(report))
    }

    async fn diagnose_domain(&self, domain: &str) -> Result<Response<Full<Bytes>>> {
        if domain.is_empty() {
            return Ok(bad_request("domain is required"));
        }
        let report = self.diagnostics.check_domain(domain).await;
        ok_json(&ApiResponse::ok(report))
    }

    async fn fix_issue(&self, code: &str) -> Result<Response<Full<Bytes>>> {
        match self.diagnostics.auto_fix(code).await {
            Ok(message) => ok_json(&OpReport::ok(message)),
            Err(e) => Ok(error_response(&e)),
        }
    }
}

/// Parse `/projects/{id}` or `/projects/{id}/{action}` paths
fn project_id(path: &str, action: Option<&str>) -> Option<i64> {
    let rest = path.strip_prefix("/projects/")?;
    match action {
        Some(action) => {
            let (id, tail) = rest.split_once('/')?;
            if tail != action {
                return None;
            }
            id.parse().ok()
        }
        None => {
            if rest.contains('/') {
                return None;
            }
            rest.parse().ok()
        }
    }
}

fn lines_param(query: Option<&str>) -> usize {
    query
        .and_then(|q| {
            q.split('&')
                .find_map(|pair| pair.strip_prefix("lines="))
                .and_then(|v| v.parse().ok())
        })
        .unwrap_or(100)
}

fn status_for(error: &ManagerError) -> StatusCode {
    match error.code() {
        ErrorCode::ProjectNotFound => StatusCode::NOT_FOUND,
        ErrorCode::ValidationError | ErrorCode::NotAutoFixable => StatusCode::BAD_REQUEST,
        ErrorCode::PortInUse | ErrorCode::AlreadyRunning => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(error: &ManagerError) -> Response<Full<Bytes>> {
    json_response(status_for(error), OpReport::failure(error).to_json())
}

fn ok_json<T: Serialize>(payload: &T) -> Result<Response<Full<Bytes>>> {
    Ok(json_response(StatusCode::OK, serde_json::to_string(payload)?))
}

fn bad_request(message: impl Into<String>) -> Response<Full<Bytes>> {
    let body = serde_json::json!({
        "success": false,
        "error": message.into(),
    });
    json_response(StatusCode::BAD_REQUEST, body.to_string())
}

fn json_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .body(Full::new(body.into()))
        .expect("valid response")
}
