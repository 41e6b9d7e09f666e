// Health monitor
//
// Readiness = container state from the engine, then (only for running containers without a
// failing engine healthcheck) the service's application-level signal. Polls all pending
// services of a tier together, once per interval, under one timeout per loop.

use futures::future::join_all;
use log::{debug, info, warn};
use regex::Regex;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use crate::config::{EngineConfig, HealthSignal, ServiceConfig};
use crate::error::{InstallError, InstallResult};
use crate::installation::engine::{ContainerEngine, ContainerState, DockerHealth, ServiceStatus};
use crate::models::health::{HealthBoard, ServiceHealth};
use crate::models::ports::PortAssignment;
use crate::utils::retry::{PaceStop, RetryPolicy};

const SIGNAL_TIMEOUT: Duration = Duration::from_secs(5);
const LOG_TAIL_LINES: u32 = 200;

/// Health implied by container state alone; `None` means the signal decides.
pub fn health_from_status(status: &ServiceStatus) -> Option<ServiceHealth> {
    match status.state {
        ContainerState::Missing | ContainerState::Created => Some(ServiceHealth::Starting),
        ContainerState::Running => match status.health {
            Some(DockerHealth::Unhealthy) => Some(ServiceHealth::Unhealthy),
            Some(DockerHealth::Starting) => Some(ServiceHealth::Starting),
            Some(DockerHealth::Healthy) | None => None,
        },
        ContainerState::Restarting | ContainerState::Paused => Some(ServiceHealth::Unhealthy),
        ContainerState::Exited | ContainerState::Dead => Some(ServiceHealth::Failed),
    }
}

pub struct HealthMonitor<'a> {
    engine: &'a dyn ContainerEngine,
    ports: &'a PortAssignment,
    policy: RetryPolicy,
    cancel: &'a CancellationToken,
    http: reqwest::Client,
}

impl<'a> HealthMonitor<'a> {
    pub fn new(
        engine: &'a dyn ContainerEngine,
        config: &EngineConfig,
        ports: &'a PortAssignment,
        cancel: &'a CancellationToken,
    ) -> Self {
        // Self-signed certificates are expected on the edge.
        let http = reqwest::Client::builder()
            .timeout(SIGNAL_TIMEOUT)
            .danger_accept_invalid_certs(true)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .unwrap_or_default();
        Self {
            engine,
            ports,
            policy: RetryPolicy::new(config.poll_interval(), config.tier_health_timeout()),
            cancel,
            http,
        }
    }

    async fn port_open(&self, port_name: &str) -> bool {
        let Some(port) = self.ports.get(port_name) else {
            warn!(
                "[PHASE: startup] [STEP: health] No port assigned for '{}'",
                port_name
            );
            return false;
        };
        matches!(
            tokio::time::timeout(SIGNAL_TIMEOUT, TcpStream::connect(("127.0.0.1", port))).await,
            Ok(Ok(_))
        )
    }

    async fn http_ok(&self, port_name: &str, path: &str) -> bool {
        let Some(port) = self.ports.get(port_name) else {
            return false;
        };
        let scheme = if port_name == "https" { "https" } else { "http" };
        let url = format!("{}://127.0.0.1:{}{}", scheme, port, path);
        match self.http.get(&url).send().await {
            Ok(resp) => {
                let s = resp.status();
                s.is_success() || s.is_redirection()
            }
            Err(e) => {
                debug!("[PHASE: startup] [STEP: health] GET {} failed: {}", url, e);
                false
            }
        }
    }

    async fn log_matches(&self, service: &str, pattern: &str) -> bool {
        let re = match Regex::new(pattern) {
            Ok(re) => re,
            Err(e) => {
                warn!(
                    "[PHASE: startup] [STEP: health] Invalid log pattern for {}: {}",
                    service, e
                );
                return false;
            }
        };
        match self.engine.service_logs(service, LOG_TAIL_LINES).await {
            Ok(logs) => re.is_match(&logs),
            Err(_) => false,
        }
    }

    /// One readiness check.
    pub async fn check(&self, service: &ServiceConfig) -> ServiceHealth {
        let status = match self.engine.service_status(&service.name).await {
            Ok(s) => s,
            Err(e) => {
                debug!(
                    "[PHASE: startup] [STEP: health] Status query for {} failed: {:#}",
                    service.name, e
                );
                return ServiceHealth::Unknown;
            }
        };
        if let Some(health) = health_from_status(&status) {
            return health;
        }
        let ok = match &service.signal {
            HealthSignal::None => true,
            HealthSignal::Port { port_name } => self.port_open(port_name).await,
            HealthSignal::Http { port_name, path } => self.http_ok(port_name, path).await,
            HealthSignal::LogPattern { pattern } => self.log_matches(&service.name, pattern).await,
        };
        if ok {
            ServiceHealth::Healthy
        } else {
            ServiceHealth::Starting
        }
    }

    /// Poll `services` until all are healthy or the loop times out. Only cancellation is an
    /// error; the board holds the final state either way.
    pub async fn watch(&self, services: &[ServiceConfig], board: &mut HealthBoard) -> InstallResult<()> {
        let mut pacer = self.policy.start();
        loop {
            let pending: Vec<&ServiceConfig> = services
                .iter()
                .filter(|s| !board.is_ready(&s.name))
                .collect();
            let results = join_all(pending.iter().map(|s| self.check(s))).await;
            for (svc, health) in pending.iter().zip(results) {
                if board.get(&svc.name) != health {
                    debug!(
                        "[PHASE: startup] [STEP: health] {}: {} -> {}",
                        svc.name,
                        board.get(&svc.name),
                        health
                    );
                }
                board.set(&svc.name, health);
            }

            if services.iter().all(|s| board.is_ready(&s.name)) {
                info!(
                    "[PHASE: startup] [STEP: health] All {} service(s) ready after {}ms",
                    services.len(),
                    pacer.elapsed().as_millis()
                );
                return Ok(());
            }

            match pacer.next_attempt(self.cancel).await {
                Ok(()) => {}
                Err(PaceStop::Cancelled) => return Err(InstallError::Cancelled),
                Err(stop) => {
                    let waiting: Vec<String> = services
                        .iter()
                        .filter(|s| !board.is_ready(&s.name))
                        .map(|s| format!("{}={}", s.name, board.get(&s.name)))
                        .collect();
                    warn!(
                        "[PHASE: startup] [STEP: health] Health loop ended ({:?}) with services not ready: {}",
                        stop,
                        waiting.join(", ")
                    );
                    return Ok(());
                }
            }
        }
    }
}
