//! Lifecycle orchestration for container groups
//!
//! The orchestrator decides, per request, whether a service is running,
//! loading or shutting down, starts groups in the background when they are
//! needed, and stops groups whose last access is older than the inactivity
//! timeout.
//!
//! Status is never stored: it is recomputed from a fresh runtime listing and
//! the pending start/stop markers on every call to [`Orchestrator::resolve`].
//! Starting a group is always dispatched onto its own task so the request
//! that discovered the need never waits on the container runtime.

use crate::client::ContainerClient;
use crate::container::{ContainerGroup, ServiceContainer, ServiceStatus};
use crate::error::GateError;
use crate::pending::PendingSet;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Default interval between inactivity sweeps
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(5);

/// What a group start or stop pass did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransitionOutcome {
    /// Commands that completed successfully
    pub issued: usize,
    /// Members left alone (already in the target state or mid-transition)
    pub skipped: usize,
    /// Commands the runtime rejected
    pub failed: usize,
}

/// Tracks group access recency and drives group start/stop.
///
/// Like the process manager it replaces, the orchestrator lives behind an
/// `Arc`; [`Orchestrator::new`] returns `Arc<Self>` and the methods that
/// spawn background work take `self: &Arc<Self>`.
pub struct Orchestrator {
    client: Arc<ContainerClient>,
    inactivity_timeout: Duration,
    /// Group name -> last observed traffic
    last_access: DashMap<String, Instant>,
    /// Groups with a stop pass in progress
    shutting_down: PendingSet,
}

impl Orchestrator {
    /// Create the orchestrator and seed access recency for every known group.
    ///
    /// Each group gets one full inactivity timeout of grace from now before
    /// the sweep may stop it.
    pub async fn new(
        client: Arc<ContainerClient>,
        inactivity_timeout: Duration,
    ) -> Result<Arc<Self>, GateError> {
        let groups = client.group_labels().await?;
        let now = Instant::now();

        let last_access = DashMap::new();
        for group in &groups {
            last_access.insert(group.clone(), now);
        }

        info!(
            groups = ?groups,
            inactivity_timeout_secs = inactivity_timeout.as_secs(),
            "Seeded access times for known groups"
        );

        Ok(Arc::new(Self {
            client,
            inactivity_timeout,
            last_access,
            shutting_down: PendingSet::new(),
        }))
    }

    pub fn client(&self) -> &Arc<ContainerClient> {
        &self.client
    }

    /// Find the container serving `service_name` and compute its status.
    ///
    /// A group that is not fully running gets a background start; the
    /// caller receives `Loading` immediately.
    pub async fn resolve(self: &Arc<Self>, service_name: &str) -> Result<ServiceContainer, GateError> {
        let container = self.client.container_by_service_name(service_name).await?;
        if container.accessible_port.is_none() {
            return Err(GateError::NotAccessible(service_name.to_string()));
        }

        let group = self.client.group_by_label(&container.group_name).await?;
        let status = self.status_of(&group);

        match status {
            ServiceStatus::Loading => {
                debug!(service = service_name, group = %group.name, "Group not fully running, starting it");
                self.spawn_start_group(group);
            }
            ServiceStatus::ShuttingDown => {
                debug!(service = service_name, group = %group.name, "Group is shutting down");
            }
            ServiceStatus::Running => {}
        }

        Ok(ServiceContainer { container, status })
    }

    /// Status of a group from its current membership and pending markers
    pub fn status_of(&self, group: &ContainerGroup) -> ServiceStatus {
        let stopping = self.shutting_down.contains(&group.name)
            || group.containers.iter().any(|c| self.client.is_stopping(&c.id));

        if stopping {
            ServiceStatus::ShuttingDown
        } else if !group.is_all_running() {
            ServiceStatus::Loading
        } else {
            ServiceStatus::Running
        }
    }

    /// Record traffic for a group
    pub fn notify_access(&self, group_name: &str) {
        self.last_access.insert(group_name.to_string(), Instant::now());
    }

    /// Last recorded access for a group, if it is tracked
    pub fn last_access(&self, group_name: &str) -> Option<Instant> {
        self.last_access.get(group_name).map(|entry| *entry.value())
    }

    /// Groups currently tracked for inactivity
    pub fn tracked_groups(&self) -> Vec<String> {
        let mut groups: Vec<String> = self.last_access.iter().map(|e| e.key().clone()).collect();
        groups.sort();
        groups
    }

    fn spawn_start_group(self: &Arc<Self>, group: ContainerGroup) {
        let orchestrator = Arc::clone(self);
        tokio::spawn(async move {
            let outcome = orchestrator.start_group(&group).await;
            if outcome.failed > 0 {
                warn!(
                    group = %group.name,
                    issued = outcome.issued,
                    failed = outcome.failed,
                    "Group start finished with failures"
                );
            } else if outcome.issued > 0 {
                info!(group = %group.name, started = outcome.issued, "Group started");
            }
        });
    }

    /// Start every stopped member, highest priority first.
    ///
    /// Failures are logged and do not stop the remaining members from being
    /// started. Each attempt refreshes the group's access time.
    pub async fn start_group(&self, group: &ContainerGroup) -> TransitionOutcome {
        let mut outcome = TransitionOutcome::default();

        for container in group.by_highest_priority() {
            if container.running
                || self.client.is_starting(&container.id)
                || self.client.is_stopping(&container.id)
            {
                outcome.skipped += 1;
                continue;
            }

            // The group snapshot may be stale by the time this member comes up
            match self.client.is_running(&container.id).await {
                Ok(true) => {
                    outcome.skipped += 1;
                    continue;
                }
                Ok(false) => {}
                Err(e) => {
                    debug!(container = %container.container_name, error = %e, "Inspect failed, starting anyway");
                }
            }

            info!(
                container = %container.container_name,
                group = %group.name,
                priority = container.priority,
                "Starting container"
            );

            match self.client.start(&container.id).await {
                Ok(()) => outcome.issued += 1,
                Err(e @ GateError::DuplicateTransition { .. }) => {
                    debug!(container = %container.container_name, error = %e, "Start already in flight");
                    outcome.skipped += 1;
                }
                Err(e) => {
                    error!(
                        container = %container.container_name,
                        group = %group.name,
                        error = %e,
                        "Error starting container"
                    );
                    outcome.failed += 1;
                }
            }

            self.notify_access(&group.name);
        }

        outcome
    }

    /// Stop every running member, lowest priority first.
    ///
    /// The group reports `ShuttingDown` for the whole pass. Members the
    /// runtime already reports stopped are skipped. Failures are logged and
    /// do not stop the remaining members from being stopped.
    pub async fn stop_group(&self, group: &ContainerGroup) -> TransitionOutcome {
        let mut outcome = TransitionOutcome::default();

        let Some(_shutting_down) = self.shutting_down.try_acquire(&group.name) else {
            debug!(group = %group.name, "Group stop already in progress");
            outcome.skipped = group.containers.len();
            return outcome;
        };

        for container in group.by_lowest_priority() {
            if !container.running
                || self.client.is_starting(&container.id)
                || self.client.is_stopping(&container.id)
            {
                outcome.skipped += 1;
                continue;
            }

            match self.client.is_running(&container.id).await {
                Ok(false) => {
                    outcome.skipped += 1;
                    continue;
                }
                Ok(true) => {}
                Err(e) => {
                    debug!(container = %container.container_name, error = %e, "Inspect failed, stopping anyway");
                }
            }

            info!(
                container = %container.container_name,
                group = %group.name,
                priority = container.priority,
                "Stopping container due to inactivity"
            );

            match self.client.stop(&container.id).await {
                Ok(()) => outcome.issued += 1,
                Err(e @ GateError::DuplicateTransition { .. }) => {
                    debug!(container = %container.container_name, error = %e, "Stop already in flight");
                    outcome.skipped += 1;
                }
                Err(e) => {
                    error!(
                        container = %container.container_name,
                        group = %group.name,
                        error = %e,
                        "Error stopping container"
                    );
                    outcome.failed += 1;
                }
            }
        }

        outcome
    }

    /// Stop every group idle for at least the inactivity timeout.
    ///
    /// The access entry is removed once the group has been acted on, even if
    /// some stop failed; the group is only reconsidered after new traffic.
    /// Returns the number of groups acted on.
    pub async fn sweep_once(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<String> = self
            .last_access
            .iter()
            .filter(|entry| now.saturating_duration_since(*entry.value()) >= self.inactivity_timeout)
            .map(|entry| entry.key().clone())
            .collect();

        let mut swept = 0;
        for group_name in expired {
            match self.client.group_by_label(&group_name).await {
                Ok(group) => {
                    info!(group = %group_name, "Group idle timeout reached");
                    let outcome = self.stop_group(&group).await;
                    if outcome.failed > 0 {
                        warn!(
                            group = %group_name,
                            stopped = outcome.issued,
                            failed = outcome.failed,
                            "Idle group stop finished with failures, not retrying until next access"
                        );
                    }
                }
                Err(GateError::GroupNotFound(_)) => {
                    debug!(group = %group_name, "Idle group no longer has containers");
                }
                Err(e) => {
                    warn!(group = %group_name, error = %e, "Failed to load idle group, retrying next sweep");
                    continue;
                }
            }

            self.last_access.remove(&group_name);
            swept += 1;
        }

        swept
    }

    /// Run [`Orchestrator::sweep_once`] every `interval` until shutdown is signalled
    pub async fn run_sweep_loop(self: Arc<Self>, interval: Duration, mut shutdown_rx: watch::Receiver<bool>) {
        debug!(interval_ms = interval.as_millis() as u64, "Inactivity sweep started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    self.sweep_once().await;
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        debug!("Inactivity sweep stopped");
                        break;
                    }
                }
            }
        }
    }
}
