//! Shared test utilities available to both unit and integration tests.
//!
//! Enabled via `#[cfg(test)]` (unit tests) or the `testkit` feature
//! (integration tests).

use crate::container::{LABEL_ACCESSIBLE_PORT, LABEL_GROUP_NAME, LABEL_PRIORITY, LABEL_SERVICE_NAME};
use crate::docker::{ContainerRuntime, RuntimeContainer};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::time::Duration;

/// A call recorded by [`FakeRuntime`], in issue order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeCall {
    Start(String),
    Stop(String),
}

/// Builder for containers registered with [`FakeRuntime`]
#[derive(Debug, Clone)]
pub struct FakeContainer {
    inner: RuntimeContainer,
}

impl FakeContainer {
    pub fn new(id: &str) -> Self {
        Self {
            inner: RuntimeContainer {
                id: id.to_string(),
                names: vec![format!("/{}", id)],
                labels: HashMap::new(),
                state: "exited".to_string(),
            },
        }
    }

    pub fn group(self, group: &str) -> Self {
        self.label(LABEL_GROUP_NAME, group)
    }

    pub fn service(self, name: &str, port: u16) -> Self {
        self.label(LABEL_SERVICE_NAME, name)
            .label(LABEL_ACCESSIBLE_PORT, &port.to_string())
    }

    pub fn priority(self, priority: i32) -> Self {
        self.label(LABEL_PRIORITY, &priority.to_string())
    }

    pub fn label(mut self, key: &str, value: &str) -> Self {
        self.inner.labels.insert(key.to_string(), value.to_string());
        self
    }

    pub fn running(mut self) -> Self {
        self.inner.state = "running".to_string();
        self
    }
}

/// In-memory container runtime.
///
/// Start/stop flip the container state after an optional delay (which
/// honours tokio's paused clock) and can be made to fail per container id.
/// Single-container inspects can be slowed down too.
#[derive(Default)]
pub struct FakeRuntime {
    containers: Mutex<Vec<RuntimeContainer>>,
    calls: Mutex<Vec<RuntimeCall>>,
    inspect_delay: Mutex<Duration>,
    start_delay: Mutex<Duration>,
    stop_delay: Mutex<Duration>,
    failing_starts: Mutex<HashSet<String>>,
    failing_stops: Mutex<HashSet<String>>,
    unreachable: Mutex<bool>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, container: FakeContainer) {
        self.containers.lock().push(container.inner);
    }

    pub fn remove(&self, id: &str) {
        self.containers.lock().retain(|c| c.id != id);
    }

    pub fn set_running(&self, id: &str, running: bool) {
        let state = if running { "running" } else { "exited" };
        if let Some(c) = self.containers.lock().iter_mut().find(|c| c.id == id) {
            c.state = state.to_string();
        }
    }

    pub fn running(&self, id: &str) -> bool {
        self.containers
            .lock()
            .iter()
            .any(|c| c.id == id && c.state == "running")
    }

    pub fn set_inspect_delay(&self, delay: Duration) {
        *self.inspect_delay.lock() = delay;
    }

    pub fn set_start_delay(&self, delay: Duration) {
        *self.start_delay.lock() = delay;
    }

    pub fn set_stop_delay(&self, delay: Duration) {
        *self.stop_delay.lock() = delay;
    }

    pub fn fail_start(&self, id: &str) {
        self.failing_starts.lock().insert(id.to_string());
    }

    pub fn fail_stop(&self, id: &str) {
        self.failing_stops.lock().insert(id.to_string());
    }

    /// Make every listing fail, as if the daemon went away
    pub fn set_unreachable(&self, unreachable: bool) {
        *self.unreachable.lock() = unreachable;
    }

    pub fn calls(&self) -> Vec<RuntimeCall> {
        self.calls.lock().clone()
    }

    pub fn start_calls(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                RuntimeCall::Start(id) => Some(id),
                RuntimeCall::Stop(_) => None,
            })
            .collect()
    }

    pub fn stop_calls(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                RuntimeCall::Stop(id) => Some(id),
                RuntimeCall::Start(_) => None,
            })
            .collect()
    }

    fn check_reachable(&self) -> anyhow::Result<()> {
        if *self.unreachable.lock() {
            anyhow::bail!("fake runtime unreachable");
        }
        Ok(())
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn ping(&self) -> anyhow::Result<()> {
        self.check_reachable()
    }

    async fn list_containers(&self) -> anyhow::Result<Vec<RuntimeContainer>> {
        self.check_reachable()?;
        Ok(self.containers.lock().clone())
    }

    async fn is_running(&self, id: &str) -> anyhow::Result<bool> {
        self.check_reachable()?;
        let delay = *self.inspect_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(self.running(id))
    }

    async fn start_container(&self, id: &str) -> anyhow::Result<()> {
        self.calls.lock().push(RuntimeCall::Start(id.to_string()));
        let delay = *self.start_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.failing_starts.lock().contains(id) {
            anyhow::bail!("fake start failure for {}", id);
        }
        self.set_running(id, true);
        Ok(())
    }

    async fn stop_container(&self, id: &str, _timeout: Duration) -> anyhow::Result<()> {
        self.calls.lock().push(RuntimeCall::Stop(id.to_string()));
        let delay = *self.stop_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.failing_stops.lock().contains(id) {
            anyhow::bail!("fake stop failure for {}", id);
        }
        self.set_running(id, false);
        Ok(())
    }
}
