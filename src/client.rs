//! Label-aware container client with per-container start/stop guards

use crate::container::{Container, ContainerGroup, LABEL_GROUP_NAME, LABEL_SERVICE_NAME};
use crate::docker::{ContainerRuntime, RuntimeContainer};
use crate::error::{GateError, Transition};
use crate::pending::PendingSet;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Default grace period given to a container to stop before the runtime kills it
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Wraps a [`ContainerRuntime`] with the label contract and the pending guards.
///
/// The starting/stopping sets are the only protection against issuing two
/// starts (or two stops) for the same container at once. Different containers
/// of the same group may be transitioned concurrently.
pub struct ContainerClient {
    runtime: Arc<dyn ContainerRuntime>,
    stop_timeout: Duration,
    starting: PendingSet,
    stopping: PendingSet,
}

impl ContainerClient {
    pub fn new(runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self::with_stop_timeout(runtime, DEFAULT_STOP_TIMEOUT)
    }

    pub fn with_stop_timeout(runtime: Arc<dyn ContainerRuntime>, stop_timeout: Duration) -> Self {
        Self {
            runtime,
            stop_timeout,
            starting: PendingSet::new(),
            stopping: PendingSet::new(),
        }
    }

    /// Every container known to the runtime, with its raw labels
    pub async fn list_containers(&self) -> Result<Vec<RuntimeContainer>, GateError> {
        Ok(self.runtime.list_containers().await?)
    }

    /// The container advertising `service_name`
    pub async fn container_by_service_name(&self, service_name: &str) -> Result<Container, GateError> {
        let containers = self.list_containers().await?;
        let raw = containers
            .iter()
            .find(|c| c.labels.get(LABEL_SERVICE_NAME).map(String::as_str) == Some(service_name))
            .ok_or_else(|| GateError::NotFound(service_name.to_string()))?;

        Container::from_runtime(raw)
    }

    /// All containers carrying the group label `group_name`
    pub async fn group_by_label(&self, group_name: &str) -> Result<ContainerGroup, GateError> {
        let containers = self
            .list_containers()
            .await?
            .iter()
            .filter(|c| c.labels.get(LABEL_GROUP_NAME).map(String::as_str) == Some(group_name))
            .map(Container::from_runtime)
            .collect::<Result<Vec<_>, _>>()?;

        if containers.is_empty() {
            return Err(GateError::GroupNotFound(group_name.to_string()));
        }

        Ok(ContainerGroup {
            name: group_name.to_string(),
            containers,
        })
    }

    /// Distinct group labels across all containers, sorted
    pub async fn group_labels(&self) -> Result<Vec<String>, GateError> {
        let labels: BTreeSet<String> = self
            .list_containers()
            .await?
            .into_iter()
            .filter_map(|mut c| c.labels.remove(LABEL_GROUP_NAME))
            .filter(|label| !label.is_empty())
            .collect();

        Ok(labels.into_iter().collect())
    }

    pub async fn is_running(&self, id: &str) -> Result<bool, GateError> {
        Ok(self.runtime.is_running(id).await?)
    }

    pub fn is_starting(&self, id: &str) -> bool {
        self.starting.contains(id)
    }

    pub fn is_stopping(&self, id: &str) -> bool {
        self.stopping.contains(id)
    }

    /// Start a container unless a start is already pending for it
    pub async fn start(&self, id: &str) -> Result<(), GateError> {
        let _pending = self
            .starting
            .try_acquire(id)
            .ok_or_else(|| GateError::DuplicateTransition {
                id: id.to_string(),
                transition: Transition::Start,
            })?;

        debug!(container_id = id, "Issuing container start");
        self.runtime.start_container(id).await?;
        Ok(())
    }

    /// Stop a container unless a stop is already pending for it
    pub async fn stop(&self, id: &str) -> Result<(), GateError> {
        let _pending = self
            .stopping
            .try_acquire(id)
            .ok_or_else(|| GateError::DuplicateTransition {
                id: id.to_string(),
                transition: Transition::Stop,
            })?;

        debug!(
            container_id = id,
            timeout_secs = self.stop_timeout.as_secs(),
            "Issuing container stop"
        );
        self.runtime.stop_container(id, self.stop_timeout).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::{FakeContainer, FakeRuntime, RuntimeCall};

    fn client_with(runtime: &Arc<FakeRuntime>) -> Arc<ContainerClient> {
        Arc::new(ContainerClient::new(runtime.clone()))
    }

    fn stack() -> Arc<FakeRuntime> {
        let runtime = FakeRuntime::new();
        runtime.add(FakeContainer::new("web-1").group("stack").service("web", 8080).priority(5));
        runtime.add(FakeContainer::new("db-1").group("stack").priority(10).running());
        runtime.add(FakeContainer::new("blog-1").group("blog").service("blog", 8081));
        runtime.add(FakeContainer::new("unmanaged"));
        Arc::new(runtime)
    }

    #[tokio::test]
    async fn test_container_by_service_name() {
        let runtime = stack();
        let client = client_with(&runtime);

        let web = client.container_by_service_name("web").await.unwrap();
        assert_eq!(web.id, "web-1");
        assert_eq!(web.group_name, "stack");
        assert_eq!(web.accessible_port, Some(8080));

        let err = client.container_by_service_name("nope").await.unwrap_err();
        assert!(matches!(err, GateError::NotFound(name) if name == "nope"));
    }

    #[tokio::test]
    async fn test_group_by_label() {
        let runtime = stack();
        let client = client_with(&runtime);

        let group = client.group_by_label("stack").await.unwrap();
        assert_eq!(group.name, "stack");
        assert_eq!(group.containers.len(), 2);
        assert!(!group.is_all_running());

        let err = client.group_by_label("missing").await.unwrap_err();
        assert!(matches!(err, GateError::GroupNotFound(_)));
    }

    #[tokio::test]
    async fn test_group_labels_are_distinct() {
        let runtime = stack();
        let client = client_with(&runtime);

        assert_eq!(client.group_labels().await.unwrap(), vec!["blog", "stack"]);
    }

    #[tokio::test]
    async fn test_start_and_stop_delegate_to_runtime() {
        let runtime = stack();
        let client = client_with(&runtime);

        client.start("web-1").await.unwrap();
        assert!(client.is_running("web-1").await.unwrap());

        client.stop("web-1").await.unwrap();
        assert!(!client.is_running("web-1").await.unwrap());

        assert_eq!(
            runtime.calls(),
            vec![
                RuntimeCall::Start("web-1".to_string()),
                RuntimeCall::Stop("web-1".to_string())
            ]
        );
        assert!(!client.is_starting("web-1"));
        assert!(!client.is_stopping("web-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_start_is_rejected() {
        let runtime = stack();
        runtime.set_start_delay(Duration::from_secs(1));
        let client = client_with(&runtime);

        let first = {
            let client = client.clone();
            tokio::spawn(async move { client.start("web-1").await })
        };
        while !client.is_starting("web-1") {
            tokio::task::yield_now().await;
        }

        let err = client.start("web-1").await.unwrap_err();
        assert!(matches!(
            err,
            GateError::DuplicateTransition { transition: Transition::Start, .. }
        ));

        first.await.unwrap().unwrap();
        assert_eq!(runtime.start_calls(), vec!["web-1".to_string()]);
        assert!(!client.is_starting("web-1"));
    }

    #[tokio::test]
    async fn test_pending_mark_cleared_on_failure() {
        let runtime = stack();
        runtime.fail_stop("db-1");
        let client = client_with(&runtime);

        let err = client.stop("db-1").await.unwrap_err();
        assert!(matches!(err, GateError::Runtime(_)));
        assert!(!client.is_stopping("db-1"));

        // A retry is not rejected as a duplicate
        let err = client.stop("db-1").await.unwrap_err();
        assert!(matches!(err, GateError::Runtime(_)));
        assert_eq!(runtime.stop_calls().len(), 2);
    }

    #[tokio::test]
    async fn test_invalid_member_fails_group_lookup() {
        let runtime = stack();
        runtime.add(
            FakeContainer::new("broken")
                .group("stack")
                .label(crate::container::LABEL_PRIORITY, "first"),
        );
        let client = client_with(&runtime);

        let err = client.group_by_label("stack").await.unwrap_err();
        assert!(matches!(err, GateError::InvalidLabels { id, .. } if id == "broken"));
    }
}
