// Container engine capability
//
// The reconcile and orchestration layers only talk to containers through this trait, so tests
// can substitute an in-memory engine and the Docker CLI stays confined to `docker.rs`.
// Service names are compose service names; container and volume names are engine-global.

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;

use super::CommandOutput;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    /// No container exists for the service.
    Missing,
    Created,
    Running,
    Restarting,
    Paused,
    Exited,
    Dead,
}

impl ContainerState {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "created" => ContainerState::Created,
            "running" => ContainerState::Running,
            "restarting" => ContainerState::Restarting,
            "paused" => ContainerState::Paused,
            "exited" => ContainerState::Exited,
            "dead" | "removing" => ContainerState::Dead,
            _ => ContainerState::Missing,
        }
    }

    pub fn is_running(self) -> bool {
        matches!(self, ContainerState::Running)
    }
}

/// Container-level healthcheck status reported by the engine, when the image defines one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DockerHealth {
    Starting,
    Healthy,
    Unhealthy,
}

impl DockerHealth {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "starting" => Some(DockerHealth::Starting),
            "healthy" => Some(DockerHealth::Healthy),
            "unhealthy" => Some(DockerHealth::Unhealthy),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContainerSummary {
    pub name: String,
    /// Compose service label, if the container belongs to a compose project.
    pub service: Option<String>,
    pub state: ContainerState,
    /// Host ports published by this container.
    pub published_ports: Vec<u16>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ServiceStatus {
    pub state: ContainerState,
    pub health: Option<DockerHealth>,
}

impl ServiceStatus {
    pub fn missing() -> Self {
        Self {
            state: ContainerState::Missing,
            health: None,
        }
    }
}

/// A throwaway container, used for volume measurement and credential probing.
#[derive(Debug, Clone, Default)]
pub struct EphemeralSpec {
    pub image: String,
    /// `(volume, mount point, read_only)`
    pub mounts: Vec<(String, String, bool)>,
    pub env: Vec<(String, String)>,
    pub command: Vec<String>,
    pub label: String,
}

#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Engine reachable and responsive.
    async fn ping(&self) -> Result<()>;

    /// Names of all volumes known to the engine.
    async fn list_volumes(&self) -> Result<Vec<String>>;

    /// Disk usage of a volume's contents, bounded by `timeout`.
    async fn volume_usage_bytes(&self, volume: &str, timeout: Duration) -> Result<u64>;

    async fn remove_volume(&self, volume: &str) -> Result<()>;

    /// Containers belonging to this installation's compose project.
    async fn list_containers(&self) -> Result<Vec<ContainerSummary>>;

    /// Name of the container publishing `port` on the host, if any.
    async fn port_owner(&self, port: u16) -> Result<Option<String>>;

    async fn start_service(&self, service: &str) -> Result<()>;

    /// Stop the named services; an empty slice stops the whole project.
    async fn stop_services(&self, services: &[String]) -> Result<()>;

    /// Remove the project's containers and networks (volumes are left alone).
    async fn remove_stack(&self) -> Result<()>;

    async fn service_status(&self, service: &str) -> Result<ServiceStatus>;

    async fn service_logs(&self, service: &str, tail: u32) -> Result<String>;

    /// Start a detached throwaway container; returns its id.
    async fn run_ephemeral(&self, spec: &EphemeralSpec) -> Result<String>;

    async fn exec(
        &self,
        container: &str,
        env: &[(String, String)],
        command: &[String],
        timeout: Duration,
    ) -> Result<CommandOutput>;

    async fn remove_container(&self, container: &str) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn container_state_parse_is_total() {
        assert_eq!(ContainerState::parse("running"), ContainerState::Running);
        assert_eq!(ContainerState::parse(" Exited "), ContainerState::Exited);
        assert_eq!(ContainerState::parse("removing"), ContainerState::Dead);
        assert_eq!(ContainerState::parse("whatever"), ContainerState::Missing);
        assert_eq!(ContainerState::parse(""), ContainerState::Missing);
    }

    #[test]
    fn docker_health_parse() {
        assert_eq!(DockerHealth::parse("healthy"), Some(DockerHealth::Healthy));
        assert_eq!(DockerHealth::parse(""), None);
    }
}
