// Read-only status view
//
// Same observations as an install run (classification, volumes, port plan, service states),
// with nothing written, started or prompted.

use futures::future::join_all;
use serde::Serialize;
use std::path::PathBuf;

use crate::api::installer::Capabilities;
use crate::config::EngineConfig;
use crate::installation::engine::{ContainerState, DockerHealth};
use crate::models::state::InstallationState;
use crate::models::volumes::{VolumeObservation, VolumeSnapshot};
use crate::reconcile::classifier::observe;
use crate::reconcile::ports::{PortResolution, PortResolver};
use crate::reconcile::volumes::VolumeInspector;

#[derive(Debug, Clone, Serialize)]
pub struct ServiceLine {
    pub name: String,
    pub state: ContainerState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health: Option<DockerHealth>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub state: InstallationState,
    pub descriptor_path: PathBuf,
    pub descriptor_present: bool,
    pub descriptor_issues: usize,
    pub engine_reachable: bool,
    pub volumes: Vec<VolumeObservation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ports: Option<PortResolution>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port_conflict: Option<String>,
    pub services: Vec<ServiceLine>,
}

impl StatusReport {
    pub fn lines(&self) -> Vec<String> {
        let mut out = vec![
            format!("State:        {}", self.state),
            format!(
                "Descriptor:   {} ({})",
                self.descriptor_path.display(),
                if !self.descriptor_present {
                    "absent".to_string()
                } else if self.descriptor_issues == 0 {
                    "ok".to_string()
                } else {
                    format!("{} issue(s)", self.descriptor_issues)
                }
            ),
            format!(
                "Engine:       {}",
                if self.engine_reachable { "reachable" } else { "unreachable" }
            ),
        ];
        for v in &self.volumes {
            let size = v
                .size_bytes
                .map(|b| format!("{} KiB", b / 1024))
                .unwrap_or_else(|| "unmeasured".to_string());
            out.push(format!("Volume:       {} [{}] {} ({:?})", v.name, v.role, size, v.class));
        }
        match (&self.ports, &self.port_conflict) {
            (Some(p), _) => out.push(format!("Ports:        {}", p.assignment)),
            (None, Some(c)) => out.push(format!("Ports:        conflict: {}", c)),
            (None, None) => {}
        }
        for s in &self.services {
            let health = s.health.map(|h| format!(" ({:?})", h).to_lowercase()).unwrap_or_default();
            out.push(format!("Service:      {:<10} {:?}{}", s.name, s.state, health));
        }
        out
    }
}

pub async fn collect_status(config: &EngineConfig, caps: &Capabilities) -> StatusReport {
    let engine = caps.engine.as_ref();
    let snapshot: VolumeSnapshot = VolumeInspector::new(engine, config).snapshot().await;
    let observation = observe(&config.descriptor_path(), &snapshot, engine).await;

    let (ports, port_conflict) = match PortResolver::new(config, caps.prober.as_ref(), engine)
        .resolve()
        .await
    {
        Ok(p) => (Some(p), None),
        Err(e) => (None, Some(e.to_string())),
    };

    let names = config.all_services();
    let statuses = if snapshot.engine_reachable {
        join_all(names.iter().map(|n| engine.service_status(n))).await
    } else {
        Vec::new()
    };
    let services = names
        .into_iter()
        .zip(statuses)
        .map(|(name, status)| match status {
            Ok(s) => ServiceLine {
                name,
                state: s.state,
                health: s.health,
            },
            Err(_) => ServiceLine {
                name,
                state: ContainerState::Missing,
                health: None,
            },
        })
        .collect();

    StatusReport {
        state: observation.state,
        descriptor_path: config.descriptor_path(),
        descriptor_present: observation.raw_descriptor.is_some(),
        descriptor_issues: observation.parsed.as_ref().map(|p| p.issues.len()).unwrap_or(0),
        engine_reachable: snapshot.engine_reachable,
        volumes: snapshot.iter().cloned().collect(),
        ports,
        port_conflict,
        services,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ScriptedPrompter, StubCertificates, StubEngine, StubProber};
    use std::sync::Arc;

    fn caps(engine: StubEngine, prober: StubProber) -> (Capabilities, Arc<StubEngine>) {
        let engine = Arc::new(engine);
        (
            Capabilities {
                engine: engine.clone(),
                prober: Arc::new(prober),
                prompter: Arc::new(ScriptedPrompter::non_interactive()),
                certificates: Arc::new(StubCertificates::new()),
            },
            engine,
        )
    }

    #[tokio::test]
    async fn status_reports_without_side_effects() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = EngineConfig::default();
        config.install_dir = dir.path().to_path_buf();
        std::fs::write(config.descriptor_path(), "DB_USER=u1\nDB_PASSWORD=p1\n").unwrap();

        let (caps, engine) = caps(
            StubEngine::new()
                .with_volume("stack_postgres_data", 50 * 1024 * 1024)
                .with_running("database"),
            StubProber::new().occupied(5432),
        );
        let report = collect_status(&config, &caps).await;

        assert_eq!(report.state, InstallationState::Complete);
        assert!(report.descriptor_present);
        assert_eq!(report.volumes.len(), 1);
        assert_eq!(report.services.len(), 7);
        assert_eq!(report.services[0].state, ContainerState::Running);
        assert_eq!(report.ports.as_ref().unwrap().assignment.get("database"), Some(5433));
        assert!(report.lines().iter().any(|l| l.contains("stack_postgres_data")));

        let state = engine.snapshot();
        assert!(state.started.is_empty());
        assert!(state.removed_volumes.is_empty());
        assert!(state.ephemeral.is_empty());
    }

    #[tokio::test]
    async fn unreachable_engine_still_reports() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = EngineConfig::default();
        config.install_dir = dir.path().to_path_buf();
        let (caps, _) = caps(StubEngine::new().unreachable(), StubProber::new());

        let report = collect_status(&config, &caps).await;
        assert!(!report.engine_reachable);
        assert!(report.services.is_empty());
        assert_eq!(report.state, InstallationState::Partial);
    }
}
