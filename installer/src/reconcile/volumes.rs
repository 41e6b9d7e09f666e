// Volume inspector
//
// Looks up the database/cache/queue volumes under every naming convention the stack has used
// and classifies their size by measuring usage in a throwaway container.
//
// Never fails: an unreachable engine yields a snapshot marked `engine_reachable = false`, and a
// failed measurement of an existing volume is classified as substantial.

use log::{debug, info, warn};
use std::time::Duration;

use crate::config::EngineConfig;
use crate::installation::engine::ContainerEngine;
use crate::models::volumes::{SizeClass, VolumeObservation, VolumeRole, VolumeSnapshot};

pub struct VolumeInspector<'a> {
    engine: &'a dyn ContainerEngine,
    project: &'a str,
    timeout: Duration,
}

impl<'a> VolumeInspector<'a> {
    pub fn new(engine: &'a dyn ContainerEngine, config: &'a EngineConfig) -> Self {
        Self {
            engine,
            project: &config.project_name,
            timeout: config.volume_check_timeout(),
        }
    }

    /// Pick the volume for `role` among `existing`, in naming-convention order.
    fn find_name(&self, role: VolumeRole, existing: &[String]) -> Option<String> {
        let candidates = role.candidate_names(self.project);
        let mut found = candidates.iter().filter(|c| existing.contains(c));
        let first = found.next()?.clone();
        let others: Vec<&String> = found.collect();
        if !others.is_empty() {
            warn!(
                "[PHASE: reconcile] [STEP: volumes] Multiple {} volumes found; using {} (also present: {:?})",
                role, first, others
            );
        }
        Some(first)
    }

    /// Measure one volume; measurement failures count as substantial.
    pub async fn measure(&self, role: VolumeRole, name: &str) -> VolumeObservation {
        match self.engine.volume_usage_bytes(name, self.timeout).await {
            Ok(bytes) => {
                let class = SizeClass::from_bytes(bytes);
                debug!(
                    "[PHASE: reconcile] [STEP: volumes] {} volume {} uses {} bytes ({:?})",
                    role, name, bytes, class
                );
                VolumeObservation {
                    role,
                    name: name.to_string(),
                    size_bytes: Some(bytes),
                    class,
                }
            }
            Err(e) => {
                warn!(
                    "[PHASE: reconcile] [STEP: volumes] Could not measure {} volume {} ({:#}); assuming it holds data",
                    role, name, e
                );
                VolumeObservation {
                    role,
                    name: name.to_string(),
                    size_bytes: None,
                    class: SizeClass::Substantial,
                }
            }
        }
    }

    pub async fn snapshot(&self) -> VolumeSnapshot {
        let existing = match self.engine.list_volumes().await {
            Ok(v) => v,
            Err(e) => {
                warn!(
                    "[PHASE: reconcile] [STEP: volumes] Container engine unreachable ({:#}); volumes may exist",
                    e
                );
                return VolumeSnapshot::new(false);
            }
        };

        let mut snapshot = VolumeSnapshot::new(true);
        for role in VolumeRole::ALL {
            if let Some(name) = self.find_name(role, &existing) {
                snapshot.insert(self.measure(role, &name).await);
            }
        }
        info!(
            "[PHASE: reconcile] [STEP: volumes] Volume snapshot: {}",
            describe(&snapshot)
        );
        snapshot
    }

    /// Fresh measurement of a single role, right before it gates an action.
    pub async fn remeasure(&self, role: VolumeRole) -> Option<VolumeObservation> {
        let existing = self.engine.list_volumes().await.ok()?;
        let name = self.find_name(role, &existing)?;
        Some(self.measure(role, &name).await)
    }
}

/// One-line summary for logs and status output.
pub fn describe(snapshot: &VolumeSnapshot) -> String {
    if !snapshot.engine_reachable {
        return "engine unreachable".to_string();
    }
    if !snapshot.any_present() {
        return "none".to_string();
    }
    snapshot
        .iter()
        .map(|v| format!("{}={}({:?})", v.role, v.name, v.class))
        .collect::<Vec<_>>()
        .join(", ")
}
