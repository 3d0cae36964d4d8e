//! Container data model derived from runtime listings and their labels
//!
//! Nothing here is cached: every [`Container`] and [`ContainerGroup`] is
//! rebuilt from a fresh runtime listing each time a decision is made.

use crate::docker::RuntimeContainer;
use crate::error::GateError;
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};

/// Label naming the group a container belongs to
pub const LABEL_GROUP_NAME: &str = "io.wakegate.group_name";
/// Label declaring the host port the proxied service listens on
pub const LABEL_ACCESSIBLE_PORT: &str = "io.wakegate.accessible_at_port";
/// Label declaring the client-facing service name
pub const LABEL_SERVICE_NAME: &str = "io.wakegate.service_name";
/// Label ordering start/stop within a group (higher starts first)
pub const LABEL_PRIORITY: &str = "io.wakegate.priority";

/// A runtime-managed container as seen through its labels
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Container {
    pub id: String,
    pub group_name: String,
    pub container_name: String,
    pub service_name: Option<String>,
    pub accessible_port: Option<u16>,
    pub priority: i32,
    pub running: bool,
}

impl Container {
    /// Parse a runtime listing entry against the label contract
    pub fn from_runtime(raw: &RuntimeContainer) -> Result<Self, GateError> {
        let invalid = |reason: String| GateError::InvalidLabels {
            id: raw.id.clone(),
            reason,
        };

        let group_name = raw
            .labels
            .get(LABEL_GROUP_NAME)
            .filter(|g| !g.is_empty())
            .cloned()
            .ok_or_else(|| invalid(format!("missing {}", LABEL_GROUP_NAME)))?;

        let service_name = raw
            .labels
            .get(LABEL_SERVICE_NAME)
            .filter(|s| !s.is_empty())
            .cloned();

        let accessible_port = match raw.labels.get(LABEL_ACCESSIBLE_PORT) {
            Some(value) if !value.is_empty() => {
                let port: u16 = value
                    .trim()
                    .parse()
                    .map_err(|_| invalid(format!("invalid accessible port '{}'", value)))?;
                if service_name.is_none() {
                    return Err(invalid(format!(
                        "{} is required when {} is set",
                        LABEL_SERVICE_NAME, LABEL_ACCESSIBLE_PORT
                    )));
                }
                Some(port)
            }
            _ => None,
        };

        let priority = match raw.labels.get(LABEL_PRIORITY) {
            Some(value) if !value.is_empty() => value
                .trim()
                .parse()
                .map_err(|_| invalid(format!("invalid priority '{}'", value)))?,
            _ => 0,
        };

        let container_name = raw
            .names
            .first()
            .map(|n| n.trim_start_matches('/').to_string())
            .unwrap_or_else(|| raw.id.clone());

        Ok(Self {
            id: raw.id.clone(),
            group_name,
            container_name,
            service_name,
            accessible_port,
            priority,
            running: raw.state == "running",
        })
    }
}

/// All containers sharing a group label; they start and stop together
#[derive(Debug, Clone)]
pub struct ContainerGroup {
    pub name: String,
    pub containers: Vec<Container>,
}

impl ContainerGroup {
    pub fn is_all_running(&self) -> bool {
        self.containers.iter().all(|c| c.running)
    }

    /// Members in start order: highest priority first
    pub fn by_highest_priority(&self) -> Vec<&Container> {
        let mut members: Vec<&Container> = self.containers.iter().collect();
        members.sort_by(|a, b| b.priority.cmp(&a.priority));
        members
    }

    /// Members in stop order: lowest priority first
    pub fn by_lowest_priority(&self) -> Vec<&Container> {
        let mut members: Vec<&Container> = self.containers.iter().collect();
        members.sort_by_key(|c| c.priority);
        members
    }
}

/// Availability of a service, recomputed on every request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceStatus {
    /// Some group member is not running yet
    Loading,
    /// Some group member is being stopped
    ShuttingDown,
    /// Every group member is running
    Running,
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceStatus::Loading => f.write_str("loading"),
            ServiceStatus::ShuttingDown => f.write_str("shutting down"),
            ServiceStatus::Running => f.write_str("running"),
        }
    }
}

/// The container reachable for a requested service plus its computed status
#[derive(Debug, Clone)]
pub struct ServiceContainer {
    pub container: Container,
    pub status: ServiceStatus,
}

impl ServiceContainer {
    /// Address the proxied service listens on, if it declares a port
    pub fn access_addr(&self) -> Option<SocketAddr> {
        self.container
            .accessible_port
            .map(|port| SocketAddr::from((Ipv4Addr::LOCALHOST, port)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn raw(id: &str, labels: &[(&str, &str)], state: &str) -> RuntimeContainer {
        RuntimeContainer {
            id: id.to_string(),
            names: vec![format!("/{}", id)],
            labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<HashMap<_, _>>(),
            state: state.to_string(),
        }
    }

    fn member(id: &str, priority: i32) -> Container {
        Container {
            id: id.to_string(),
            group_name: "stack".to_string(),
            container_name: id.to_string(),
            service_name: None,
            accessible_port: None,
            priority,
            running: true,
        }
    }

    #[test]
    fn test_parse_service_container() {
        let c = Container::from_runtime(&raw(
            "abc",
            &[
                (LABEL_GROUP_NAME, "stack"),
                (LABEL_SERVICE_NAME, "web"),
                (LABEL_ACCESSIBLE_PORT, "8080"),
                (LABEL_PRIORITY, "10"),
            ],
            "running",
        ))
        .unwrap();

        assert_eq!(c.group_name, "stack");
        assert_eq!(c.container_name, "abc");
        assert_eq!(c.service_name.as_deref(), Some("web"));
        assert_eq!(c.accessible_port, Some(8080));
        assert_eq!(c.priority, 10);
        assert!(c.running);
    }

    #[test]
    fn test_parse_plain_member_defaults() {
        let c = Container::from_runtime(&raw("db", &[(LABEL_GROUP_NAME, "stack")], "exited")).unwrap();

        assert_eq!(c.service_name, None);
        assert_eq!(c.accessible_port, None);
        assert_eq!(c.priority, 0);
        assert!(!c.running);
    }

    #[test]
    fn test_service_name_without_port_parses() {
        let c = Container::from_runtime(&raw(
            "abc",
            &[(LABEL_GROUP_NAME, "stack"), (LABEL_SERVICE_NAME, "web")],
            "running",
        ))
        .unwrap();
        assert_eq!(c.accessible_port, None);
    }

    #[test]
    fn test_port_requires_service_name() {
        let err = Container::from_runtime(&raw(
            "abc",
            &[(LABEL_GROUP_NAME, "stack"), (LABEL_ACCESSIBLE_PORT, "8080")],
            "running",
        ))
        .unwrap_err();
        assert!(matches!(err, GateError::InvalidLabels { .. }));
    }

    #[test]
    fn test_invalid_port_and_priority() {
        let bad_port = Container::from_runtime(&raw(
            "abc",
            &[
                (LABEL_GROUP_NAME, "stack"),
                (LABEL_SERVICE_NAME, "web"),
                (LABEL_ACCESSIBLE_PORT, "http"),
            ],
            "running",
        ));
        assert!(bad_port.is_err());

        let bad_priority = Container::from_runtime(&raw(
            "abc",
            &[(LABEL_GROUP_NAME, "stack"), (LABEL_PRIORITY, "high")],
            "running",
        ));
        assert!(bad_priority.is_err());
    }

    #[test]
    fn test_missing_group_label() {
        let err = Container::from_runtime(&raw("abc", &[(LABEL_SERVICE_NAME, "web")], "running"))
            .unwrap_err();
        assert!(err.to_string().contains(LABEL_GROUP_NAME));
    }

    #[test]
    fn test_priority_ordering() {
        let group = ContainerGroup {
            name: "stack".to_string(),
            containers: vec![member("b", 5), member("a", 10), member("c", 5), member("d", -1)],
        };

        let start: Vec<&str> = group.by_highest_priority().iter().map(|c| c.id.as_str()).collect();
        assert_eq!(start, vec!["a", "b", "c", "d"]);

        let stop: Vec<&str> = group.by_lowest_priority().iter().map(|c| c.id.as_str()).collect();
        assert_eq!(stop, vec!["d", "b", "c", "a"]);
    }

    #[test]
    fn test_is_all_running() {
        let mut group = ContainerGroup {
            name: "stack".to_string(),
            containers: vec![member("a", 1), member("b", 2)],
        };
        assert!(group.is_all_running());

        group.containers[1].running = false;
        assert!(!group.is_all_running());
    }

    #[test]
    fn test_access_addr() {
        let mut container = member("a", 0);
        container.accessible_port = Some(3000);
        let service = ServiceContainer {
            container,
            status: ServiceStatus::Running,
        };
        assert_eq!(service.access_addr().unwrap().to_string(), "127.0.0.1:3000");
    }
}
