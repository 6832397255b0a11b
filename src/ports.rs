//! Port allocation checks
//!
//! A port is available only when no other non-stopped project claims it and
//! the OS accepts a bind on it. Callers run this both at create/edit time
//! (reject early) and again at start time to close the race window.

use crate::error::ManagerError;
use crate::registry::Registry;
use std::net::TcpListener;

/// Outcome of a port availability check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortAvailability {
    Available,
    /// Another managed project holds the port; carries id and name so
    /// callers can render a precise conflict message
    HeldByProject { id: i64, name: String },
    /// Something outside caddygate is already listening
    BoundElsewhere,
}

impl PortAvailability {
    pub fn is_available(&self) -> bool {
        matches!(self, PortAvailability::Available)
    }

    /// Convert an unavailable result into the conflict error for `port`
    pub fn into_conflict(self, port: u16) -> Option<ManagerError> {
        match self {
            PortAvailability::Available => None,
            PortAvailability::HeldByProject { name, .. } => Some(ManagerError::Conflict {
                port,
                holder: Some(name),
            }),
            PortAvailability::BoundElsewhere => Some(ManagerError::Conflict { port, holder: None }),
        }
    }
}

/// Check whether `port` can be used by the project identified by
/// `excluding_id` (None for a not-yet-created project).
pub fn check_port(
    registry: &Registry,
    port: u16,
    excluding_id: Option<i64>,
) -> Result<PortAvailability, ManagerError> {
    // Registry claims first: a named holder beats an anonymous bind failure
    if let Some(holder) = registry
        .project_on_port(port, excluding_id)
        .map_err(ManagerError::Internal)?
    {
        return Ok(PortAvailability::HeldByProject {
            id: holder.id,
            name: holder.name,
        });
    }

    if !os_port_free(port) {
        return Ok(PortAvailability::BoundElsewhere);
    }

    Ok(PortAvailability::Available)
}

/// Create/edit-time variant: also rejects ports configured on stopped
/// projects, so two records never share a port.
pub fn check_port_configured(
    registry: &Registry,
    port: u16,
    excluding_id: Option<i64>,
) -> Result<PortAvailability, ManagerError> {
    if let Some(holder) = registry
        .project_with_port(port, excluding_id)
        .map_err(ManagerError::Internal)?
    {
        return Ok(PortAvailability::HeldByProject {
            id: holder.id,
            name: holder.name,
        });
    }
    Ok(PortAvailability::Available)
}

/// OS-level probe: try to bind the port on the loopback and wildcard
/// addresses. Listeners bound to either would collide with a project.
fn os_port_free(port: u16) -> bool {
    TcpListener::bind(("127.0.0.1", port)).is_ok() && TcpListener::bind(("0.0.0.0", port)).is_ok()
}
