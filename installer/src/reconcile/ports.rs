// Port conflict resolver
//
// Fixed table of logical ports with a documented alternate each. A default port that is busy
// is kept when one of this installation's own containers holds it, otherwise moved to its
// alternate. Resolution is deterministic: the same host state always yields the same plan.

use async_trait::async_trait;
use log::{debug, info, warn};
use serde::Serialize;
use tokio::net::TcpListener;

use crate::config::EngineConfig;
use crate::error::{InstallError, InstallResult};
use crate::installation::engine::ContainerEngine;
use crate::models::ports::PortAssignment;

/// `(logical name, default, alternate)`
pub const DEFAULT_PORT_TABLE: [(&str, u16, u16); 8] = [
    ("database", 5432, 5433),
    ("cache", 6379, 6380),
    ("queue", 5672, 5673),
    ("queue-admin", 15672, 15673),
    ("backend", 8000, 8001),
    ("frontend", 3000, 3001),
    ("http", 80, 8080),
    ("https", 443, 8443),
];

#[async_trait]
pub trait PortProber: Send + Sync {
    /// True when nothing is listening on `port` locally.
    async fn is_available(&self, port: u16) -> bool;
}

/// Probes by binding a TCP listener on all interfaces.
pub struct TcpPortProber;

#[async_trait]
impl PortProber for TcpPortProber {
    async fn is_available(&self, port: u16) -> bool {
        match TcpListener::bind(("0.0.0.0", port)).await {
            Ok(listener) => {
                drop(listener);
                true
            }
            Err(e) => {
                debug!(
                    "[PHASE: reconcile] [STEP: ports] Port {} unavailable: {}",
                    port, e
                );
                false
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortMove {
    pub name: String,
    pub from: u16,
    pub to: u16,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PortResolution {
    pub assignment: PortAssignment,
    pub moved: Vec<PortMove>,
    /// Ports kept because this installation already holds them.
    pub owned: Vec<(String, u16)>,
}

enum Holder {
    Free,
    Ours(String),
    Foreign(Option<String>),
}

pub struct PortResolver<'a> {
    config: &'a EngineConfig,
    prober: &'a dyn PortProber,
    engine: &'a dyn ContainerEngine,
}

impl<'a> PortResolver<'a> {
    pub fn new(
        config: &'a EngineConfig,
        prober: &'a dyn PortProber,
        engine: &'a dyn ContainerEngine,
    ) -> Self {
        Self {
            config,
            prober,
            engine,
        }
    }

    fn is_ours(&self, container: &str) -> bool {
        let p = &self.config.project_name;
        container.starts_with(&format!("{}-", p)) || container.starts_with(&format!("{}_", p))
    }

    async fn holder(&self, port: u16) -> Holder {
        if self.prober.is_available(port).await {
            return Holder::Free;
        }
        match self.engine.port_owner(port).await {
            Ok(Some(name)) if self.is_ours(&name) => Holder::Ours(name),
            Ok(owner) => Holder::Foreign(owner),
            Err(e) => {
                debug!(
                    "[PHASE: reconcile] [STEP: ports] Could not ask engine who holds port {}: {:#}",
                    port, e
                );
                Holder::Foreign(None)
            }
        }
    }

    fn conflict(name: &str, port: u16, owner: Option<String>) -> InstallError {
        let who = owner
            .map(|o| format!("container '{}'", o))
            .unwrap_or_else(|| "another process".to_string());
        InstallError::conflict(
            format!("port {} for '{}' is held by {}", port, name, who),
            format!(
                "Free port {} (e.g. `ss -ltnp 'sport = :{}'` to find the owner) or set \
                 port_overrides.{} in installer.toml / STACK_INSTALLER__PORT_OVERRIDES__{}.",
                port,
                port,
                name,
                name.to_ascii_uppercase().replace('-', "_")
            ),
        )
    }

    pub async fn resolve(&self) -> InstallResult<PortResolution> {
        let mut entries: Vec<(String, u16, Option<u16>)> = DEFAULT_PORT_TABLE
            .iter()
            .map(|(name, default, alt)| match self.config.port_overrides.get(*name) {
                Some(port) => (name.to_string(), *port, None),
                None => (name.to_string(), *default, Some(*alt)),
            })
            .collect();
        for (name, port) in &self.config.port_overrides {
            if !DEFAULT_PORT_TABLE.iter().any(|(n, _, _)| n == name) {
                entries.push((name.clone(), *port, None));
            }
        }

        let mut resolution = PortResolution::default();
        for (name, port, alternate) in entries {
            let chosen = match self.holder(port).await {
                Holder::Free => port,
                Holder::Ours(container) => {
                    debug!(
                        "[PHASE: reconcile] [STEP: ports] Port {} for {} is held by our container {}",
                        port, name, container
                    );
                    resolution.owned.push((name.clone(), port));
                    port
                }
                Holder::Foreign(owner) => {
                    let Some(alt) = alternate else {
                        return Err(Self::conflict(&name, port, owner));
                    };
                    match self.holder(alt).await {
                        Holder::Free | Holder::Ours(_) => {
                            warn!(
                                "[PHASE: reconcile] [STEP: ports] Port {} for {} is in use; using alternate {}",
                                port, name, alt
                            );
                            resolution.moved.push(PortMove {
                                name: name.clone(),
                                from: port,
                                to: alt,
                            });
                            alt
                        }
                        Holder::Foreign(alt_owner) => {
                            return Err(Self::conflict(&name, alt, alt_owner.or(owner)));
                        }
                    }
                }
            };
            resolution.assignment.assign(&name, chosen).map_err(|c| {
                InstallError::conflict(
                    c.to_string(),
                    "Give each service a distinct port in port_overrides.",
                )
            })?;
        }

        info!(
            "[PHASE: reconcile] [STEP: ports] Port plan: {} (moved={})",
            resolution.assignment,
            resolution.moved.len()
        );
        Ok(resolution)
    }
}
