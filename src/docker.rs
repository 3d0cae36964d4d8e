//! Container runtime seam and its Docker implementation

use async_trait::async_trait;
use bollard::container::{
    InspectContainerOptions, ListContainersOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::Docker;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info};

/// One entry of a runtime container listing
#[derive(Debug, Clone, Default)]
pub struct RuntimeContainer {
    pub id: String,
    pub names: Vec<String>,
    pub labels: HashMap<String, String>,
    /// Runtime state string ("running", "exited", "created", ...)
    pub state: String,
}

/// Operations the proxy needs from a container runtime.
///
/// All calls address containers by opaque identifiers. Implementations must
/// treat starting an already running container and stopping an already
/// stopped one as success.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Check that the runtime is reachable
    async fn ping(&self) -> anyhow::Result<()>;

    /// List every container (running or not) with its labels
    async fn list_containers(&self) -> anyhow::Result<Vec<RuntimeContainer>>;

    /// Inspect a single container's running flag
    async fn is_running(&self, id: &str) -> anyhow::Result<bool>;

    async fn start_container(&self, id: &str) -> anyhow::Result<()>;

    /// Stop a container, letting it terminate gracefully within `timeout`
    async fn stop_container(&self, id: &str, timeout: Duration) -> anyhow::Result<()>;
}

/// Docker daemon client
pub struct DockerRuntime {
    client: Docker,
}

impl DockerRuntime {
    /// Connect to the Docker daemon and verify the connection
    ///
    /// Connection priority:
    /// 1. Explicit docker_host parameter
    /// 2. DOCKER_HOST environment variable
    /// 3. Common socket paths (platform-specific)
    pub async fn connect(docker_host: Option<&str>) -> anyhow::Result<Self> {
        let client = if let Some(host) = docker_host {
            Self::connect_to_host(host).map_err(|e| {
                anyhow::anyhow!("Failed to connect to Docker at '{}': {}", host, e)
            })?
        } else if let Ok(host) = std::env::var("DOCKER_HOST") {
            Self::connect_to_host(&host).map_err(|e| {
                anyhow::anyhow!("Failed to connect to Docker via DOCKER_HOST='{}': {}", host, e)
            })?
        } else {
            Self::connect_with_defaults()?
        };

        let runtime = Self { client };
        runtime.ping().await.map_err(|e| {
            anyhow::anyhow!(
                "{}. This most likely means the Docker daemon is not running \
                 or the host Docker socket is not mounted into this container.",
                e
            )
        })?;

        debug!("Connected to Docker daemon");
        Ok(runtime)
    }

    fn connect_to_host(host: &str) -> anyhow::Result<Docker> {
        if let Some(socket_path) = host.strip_prefix("unix://") {
            Docker::connect_with_socket(socket_path, 120, bollard::API_DEFAULT_VERSION)
                .map_err(|e| anyhow::anyhow!("Cannot connect to Unix socket '{}': {}", socket_path, e))
        } else if host.starts_with("tcp://") || host.starts_with("http://") {
            Docker::connect_with_http(host, 120, bollard::API_DEFAULT_VERSION)
                .map_err(|e| anyhow::anyhow!("Cannot connect to TCP endpoint '{}': {}", host, e))
        } else {
            anyhow::bail!(
                "Invalid docker host format: '{}'. Expected 'unix:///path/to/socket' or 'tcp://host:port'",
                host
            )
        }
    }

    fn connect_with_defaults() -> anyhow::Result<Docker> {
        let home = std::env::var("HOME").unwrap_or_default();

        let socket_paths = [
            "/var/run/docker.sock".to_string(),
            format!("{}/.docker/run/docker.sock", home),
            format!("{}/.colima/default/docker.sock", home),
        ];

        for path in &socket_paths {
            if std::path::Path::new(path).exists() {
                debug!(path, "Found Docker socket");
                return Docker::connect_with_socket(path, 120, bollard::API_DEFAULT_VERSION)
                    .map_err(|e| anyhow::anyhow!("Cannot connect to Unix socket '{}': {}", path, e));
            }
        }

        Docker::connect_with_socket_defaults().map_err(|e| {
            anyhow::anyhow!(
                "Cannot connect to Docker daemon: {}. \
                 Set DOCKER_HOST or WAKEGATE_DOCKER_HOST, or mount /var/run/docker.sock",
                e
            )
        })
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn ping(&self) -> anyhow::Result<()> {
        self.client
            .ping()
            .await
            .map_err(|e| anyhow::anyhow!("Docker daemon is not responding: {}", e))?;
        Ok(())
    }

    async fn list_containers(&self) -> anyhow::Result<Vec<RuntimeContainer>> {
        let options = ListContainersOptions::<String> {
            all: true,
            ..Default::default()
        };

        let summaries = self
            .client
            .list_containers(Some(options))
            .await
            .map_err(|e| anyhow::anyhow!("Failed to list containers: {}", e))?;

        Ok(summaries
            .into_iter()
            .filter_map(|summary| {
                Some(RuntimeContainer {
                    id: summary.id?,
                    names: summary.names.unwrap_or_default(),
                    labels: summary.labels.unwrap_or_default(),
                    state: summary.state.unwrap_or_default(),
                })
            })
            .collect())
    }

    async fn is_running(&self, id: &str) -> anyhow::Result<bool> {
        let info = self
            .client
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to inspect container {}: {}", id, e))?;

        Ok(info.state.and_then(|s| s.running).unwrap_or(false))
    }

    async fn start_container(&self, id: &str) -> anyhow::Result<()> {
        match self
            .client
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
        {
            Ok(_) => {
                info!(container_id = id, "Started Docker container");
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => {
                debug!(container_id = id, "Container was already running");
                Ok(())
            }
            Err(e) => Err(anyhow::anyhow!("Failed to start container {}: {}", id, e)),
        }
    }

    async fn stop_container(&self, id: &str, timeout: Duration) -> anyhow::Result<()> {
        let options = StopContainerOptions {
            t: timeout.as_secs() as i64,
        };

        match self.client.stop_container(id, Some(options)).await {
            Ok(_) => {
                info!(container_id = id, "Stopped Docker container");
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => {
                debug!(container_id = id, "Container was already stopped");
                Ok(())
            }
            Err(e) => Err(anyhow::anyhow!("Failed to stop container {}: {}", id, e)),
        }
    }
}
