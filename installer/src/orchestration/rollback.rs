// Rollback
//
// Compensating transaction for a failed run. The snapshot is captured before the descriptor is
// touched or any service is started; `compensate` undoes what it can and reports the rest.
// It never returns an error: a failed rollback step is logged and recorded in the report.

use log::{error, info, warn};
use serde::Serialize;
use std::path::{Path, PathBuf};

use crate::descriptor::writer::write_atomic;
use crate::installation::engine::ContainerEngine;

#[derive(Debug, Clone)]
pub struct RollbackSnapshot {
    pub descriptor_path: PathBuf,
    pub descriptor_existed: bool,
    /// Bytes of the prior descriptor, kept so restore does not depend on the backup file.
    prior_content: Option<Vec<u8>>,
    pub backup_path: Option<PathBuf>,
    pub running_services: Vec<String>,
    pub services: Vec<String>,
}

impl RollbackSnapshot {
    pub async fn capture(
        descriptor_path: &Path,
        running_services: Vec<String>,
        services: Vec<String>,
    ) -> Self {
        let prior_content = match tokio::fs::read(descriptor_path).await {
            Ok(bytes) => Some(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                warn!(
                    "[PHASE: rollback] [STEP: capture] Could not read {}: {}",
                    descriptor_path.display(),
                    e
                );
                None
            }
        };
        let descriptor_existed = prior_content.is_some()
            || tokio::fs::try_exists(descriptor_path).await.unwrap_or(false);
        Self {
            descriptor_path: descriptor_path.to_path_buf(),
            descriptor_existed,
            prior_content,
            backup_path: None,
            running_services,
            services,
        }
    }

    /// Record the backup created when the new descriptor was written.
    pub fn with_backup(mut self, backup: Option<PathBuf>) -> Self {
        self.backup_path = backup;
        self
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RollbackReport {
    pub descriptor_restored: bool,
    pub descriptor_removed: bool,
    pub services_stopped: bool,
    pub services_restarted: Vec<String>,
    pub failures: Vec<String>,
}

impl RollbackReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

async fn restore_descriptor(snapshot: &RollbackSnapshot, report: &mut RollbackReport) {
    let path = &snapshot.descriptor_path;
    if !snapshot.descriptor_existed {
        match tokio::fs::remove_file(path).await {
            Ok(()) => {
                report.descriptor_removed = true;
                info!(
                    "[PHASE: rollback] [STEP: descriptor] Removed newly created {}",
                    path.display()
                );
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => report
                .failures
                .push(format!("remove {}: {}", path.display(), e)),
        }
        return;
    }

    let bytes = match (&snapshot.prior_content, &snapshot.backup_path) {
        (Some(bytes), _) => Some(bytes.clone()),
        (None, Some(backup)) => tokio::fs::read(backup).await.ok(),
        (None, None) => None,
    };
    let Some(bytes) = bytes else {
        report
            .failures
            .push(format!("no prior content available for {}", path.display()));
        return;
    };
    match write_atomic(path, &bytes).await {
        Ok(()) => {
            report.descriptor_restored = true;
            info!(
                "[PHASE: rollback] [STEP: descriptor] Restored prior {}",
                path.display()
            );
        }
        Err(e) => report
            .failures
            .push(format!("restore {}: {:#}", path.display(), e)),
    }
}

pub async fn compensate(engine: &dyn ContainerEngine, snapshot: &RollbackSnapshot) -> RollbackReport {
    let mut report = RollbackReport::default();
    warn!(
        "[PHASE: rollback] [STEP: start] Rolling back (descriptor_existed={}, previously_running={})",
        snapshot.descriptor_existed,
        snapshot.running_services.len()
    );

    restore_descriptor(snapshot, &mut report).await;

    match engine.stop_services(&snapshot.services).await {
        Ok(()) => report.services_stopped = true,
        Err(e) => report.failures.push(format!("stop services: {:#}", e)),
    }

    for svc in &snapshot.running_services {
        match engine.start_service(svc).await {
            Ok(()) => report.services_restarted.push(svc.clone()),
            Err(e) => report.failures.push(format!("restart {}: {:#}", svc, e)),
        }
    }

    if report.is_clean() {
        info!("[PHASE: rollback] [STEP: done] Rollback completed");
    } else {
        for failure in &report.failures {
            error!("[PHASE: rollback] [STEP: done] {}", failure);
        }
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::StubEngine;

    fn services() -> Vec<String> {
        vec!["database".into(), "backend".into()]
    }

    #[tokio::test]
    async fn restores_prior_descriptor_and_restarts_previous_services() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".env");
        tokio::fs::write(&path, "DB_USER=u1\n").await.unwrap();

        let snapshot = RollbackSnapshot::capture(&path, vec!["database".into()], services()).await;
        tokio::fs::write(&path, "DB_USER=new\n").await.unwrap();

        let engine = StubEngine::new();
        let report = compensate(&engine, &snapshot).await;

        assert!(report.is_clean(), "{:?}", report.failures);
        assert!(report.descriptor_restored);
        assert_eq!(tokio::fs::read_to_string(&path).await.unwrap(), "DB_USER=u1\n");
        let state = engine.snapshot();
        assert_eq!(state.stopped, vec![services()]);
        assert_eq!(state.started, vec!["database".to_string()]);
    }

    #[tokio::test]
    async fn removes_descriptor_that_did_not_exist() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".env");
        let snapshot = RollbackSnapshot::capture(&path, Vec::new(), services()).await;
        assert!(!snapshot.descriptor_existed);

        tokio::fs::write(&path, "DOMAIN=x\n").await.unwrap();
        let report = compensate(&StubEngine::new(), &snapshot).await;
        assert!(report.descriptor_removed);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn engine_failures_are_reported_not_raised() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".env");
        let snapshot = RollbackSnapshot::capture(&path, vec!["database".into()], services()).await;

        let report = compensate(&StubEngine::new().unreachable(), &snapshot).await;
        assert!(!report.services_stopped);
        assert!(report.services_restarted.is_empty());
        assert_eq!(report.failures.len(), 2);
    }
}
