//! Caddygate - project process supervisor and reverse proxy synchronizer
//!
//! This library hosts locally built applications behind a single Caddy
//! instance:
//! - Supervises one process per project with log capture and graceful stop
//! - Persists project records in a SQLite registry
//! - Derives the Caddyfile from running projects and applies it with
//!   validate-then-reload, so a bad configuration never goes live
//! - Drives automatic TLS through Caddy per domain
//! - Diagnoses hosting problems (proxy state, DNS, certificates, ports)
//!   with remediation suggestions and a few safe auto-fixes

pub mod admin;
pub mod caddy;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod ports;
pub mod process;
pub mod project;
pub mod registry;
pub mod supervisor;
pub mod sync;
