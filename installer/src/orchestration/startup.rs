// Phased startup
//
// Tiers start strictly in configuration order; start commands inside a tier are dispatched
// concurrently, then the tier is watched until ready or its loop times out. A data tier that
// is not entirely ready stops the sequence.

use futures::future::join_all;
use log::{error, info, warn};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::api::progress::ProgressReporter;
use crate::config::{EngineConfig, ServiceConfig, TierConfig, TierRole};
use crate::error::{InstallError, InstallResult};
use crate::installation::engine::ContainerEngine;
use crate::models::health::{HealthBoard, ServiceHealth, StartupOutcome};
use crate::models::ports::PortAssignment;
use crate::orchestration::health::HealthMonitor;

#[derive(Debug, Clone, Serialize)]
pub struct StartupReport {
    pub outcome: StartupOutcome,
    pub board: HealthBoard,
    pub tiers_started: Vec<String>,
}

/// Apply the readiness threshold: everything ready is success; the whole data tier plus at
/// least one application or edge service is degraded success; anything less is failure.
pub fn evaluate_outcome(tiers: &[TierConfig], board: &HealthBoard) -> StartupOutcome {
    let mut ready = Vec::new();
    let mut not_ready = Vec::new();
    let mut data_ready = true;
    let mut upper_ready = 0usize;

    for tier in tiers {
        for svc in &tier.services {
            if board.is_ready(&svc.name) {
                ready.push(svc.name.clone());
                if tier.role != TierRole::Data {
                    upper_ready += 1;
                }
            } else {
                not_ready.push(svc.name.clone());
                if tier.role == TierRole::Data {
                    data_ready = false;
                }
            }
        }
    }

    if not_ready.is_empty() {
        StartupOutcome::Success { ready }
    } else if data_ready && upper_ready > 0 {
        StartupOutcome::DegradedSuccess { ready, not_ready }
    } else {
        StartupOutcome::Failure { ready, not_ready }
    }
}

pub struct StartupOrchestrator<'a> {
    engine: &'a dyn ContainerEngine,
    config: &'a EngineConfig,
    ports: &'a PortAssignment,
    cancel: &'a CancellationToken,
    progress: &'a ProgressReporter,
}

impl<'a> StartupOrchestrator<'a> {
    pub fn new(
        engine: &'a dyn ContainerEngine,
        config: &'a EngineConfig,
        ports: &'a PortAssignment,
        cancel: &'a CancellationToken,
        progress: &'a ProgressReporter,
    ) -> Self {
        Self {
            engine,
            config,
            ports,
            cancel,
            progress,
        }
    }

    /// Dispatch all starts for a tier at once; returns the services whose start failed.
    async fn start_tier(&self, tier: &TierConfig, board: &mut HealthBoard) -> Vec<String> {
        let results = join_all(tier.services.iter().map(|s| self.engine.start_service(&s.name))).await;
        let mut failed = Vec::new();
        for (svc, result) in tier.services.iter().zip(results) {
            match result {
                Ok(()) => board.set(&svc.name, ServiceHealth::Starting),
                Err(e) => {
                    error!(
                        "[PHASE: startup] [STEP: start] Failed to start {}: {:#}",
                        svc.name, e
                    );
                    board.set(&svc.name, ServiceHealth::Failed);
                    failed.push(svc.name.clone());
                }
            }
        }
        failed
    }

    pub async fn run(&self) -> InstallResult<StartupReport> {
        let tiers = &self.config.tiers;
        let mut board = HealthBoard::new(
            tiers
                .iter()
                .flat_map(|t| t.services.iter().map(|s| s.name.as_str())),
        );
        let monitor = HealthMonitor::new(self.engine, self.config, self.ports, self.cancel);
        let mut tiers_started = Vec::new();
        let total = tiers.len().max(1) as i32;

        for (idx, tier) in tiers.iter().enumerate() {
            if self.cancel.is_cancelled() {
                return Err(InstallError::Cancelled);
            }
            let base = 70 + (idx as i32 * 25) / total;
            info!(
                "[PHASE: startup] [STEP: tier] Starting tier '{}' ({} service(s))",
                tier.name,
                tier.services.len()
            );
            self.progress
                .info("startup", "tier", base, format!("Starting {} tier", tier.name));

            let failed = self.start_tier(tier, &mut board).await;
            tiers_started.push(tier.name.clone());

            let watched: Vec<ServiceConfig> = tier
                .services
                .iter()
                .filter(|s| !failed.contains(&s.name))
                .cloned()
                .collect();
            if !watched.is_empty() {
                monitor.watch(&watched, &mut board).await?;
            }

            let not_ready: Vec<&str> = tier
                .services
                .iter()
                .map(|s| s.name.as_str())
                .filter(|n| !board.is_ready(n))
                .collect();
            if not_ready.is_empty() {
                self.progress
                    .info("startup", "tier", base, format!("{} tier ready", tier.name));
            } else {
                warn!(
                    "[PHASE: startup] [STEP: tier] Tier '{}' not fully ready: {}",
                    tier.name,
                    not_ready.join(", ")
                );
                self.progress.warn(
                    "startup",
                    "tier",
                    base,
                    format!("{} tier not ready: {}", tier.name, not_ready.join(", ")),
                );
                if tier.role == TierRole::Data {
                    error!(
                        "[PHASE: startup] [STEP: tier] Data tier not ready; later tiers will not be started"
                    );
                    break;
                }
            }
        }

        let outcome = evaluate_outcome(tiers, &board);
        info!("[PHASE: startup] [STEP: outcome] {:?}", outcome);
        Ok(StartupReport {
            outcome,
            board,
            tiers_started,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HealthSignal;
    use crate::installation::engine::ContainerState;
    use crate::testing::StubEngine;

    /// Default tier layout with every application signal removed, so stub state decides.
    fn plain_config() -> EngineConfig {
        let mut cfg = EngineConfig::default();
        for tier in &mut cfg.tiers {
            for svc in &mut tier.services {
                svc.signal = HealthSignal::None;
            }
        }
        cfg.timeouts.poll_interval_secs = 1;
        cfg.timeouts.tier_health_secs = 4;
        cfg
    }

    fn board_with(ready: &[&str], all: &[&str]) -> HealthBoard {
        let mut board = HealthBoard::new(all.iter().copied());
        for name in ready {
            board.set(name, ServiceHealth::Healthy);
        }
        board
    }

    const ALL: [&str; 7] = ["database", "cache", "queue", "backend", "worker", "frontend", "proxy"];

    #[test]
    fn threshold_rule() {
        let tiers = EngineConfig::default().tiers;

        let all = board_with(&ALL, &ALL);
        assert!(matches!(evaluate_outcome(&tiers, &all), StartupOutcome::Success { .. }));

        let degraded = board_with(&["database", "cache", "queue", "backend", "frontend"], &ALL);
        match evaluate_outcome(&tiers, &degraded) {
            StartupOutcome::DegradedSuccess { ready, not_ready } => {
                assert_eq!(ready.len(), 5);
                assert_eq!(not_ready, vec!["worker", "proxy"]);
            }
            other => panic!("expected degraded success, got {:?}", other),
        }

        let data_only = board_with(&["database", "cache", "queue"], &ALL);
        assert!(evaluate_outcome(&tiers, &data_only).is_failure());

        let missing_queue = board_with(&["database", "cache", "backend", "worker", "frontend", "proxy"], &ALL);
        assert!(evaluate_outcome(&tiers, &missing_queue).is_failure());
    }

    #[tokio::test(start_paused = true)]
    async fn partial_upper_tiers_yield_degraded_success() {
        let engine = StubEngine::new()
            .failing_start("worker", "image pull failed")
            .with_state("proxy", ContainerState::Exited);
        let cfg = plain_config();
        let ports = PortAssignment::new();
        let cancel = CancellationToken::new();
        let progress = ProgressReporter::silent();

        let report = StartupOrchestrator::new(&engine, &cfg, &ports, &cancel, &progress)
            .run()
            .await
            .unwrap();

        assert_eq!(report.tiers_started, vec!["data", "application", "edge"]);
        assert_eq!(
            report.outcome,
            StartupOutcome::DegradedSuccess {
                ready: vec![
                    "database".into(),
                    "cache".into(),
                    "queue".into(),
                    "backend".into(),
                    "frontend".into()
                ],
                not_ready: vec!["worker".into(), "proxy".into()],
            }
        );
        assert_eq!(report.board.get("worker"), ServiceHealth::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn data_tier_failure_stops_later_tiers() {
        let engine = StubEngine::new().failing_start("cache", "port is already allocated");
        let cfg = plain_config();
        let ports = PortAssignment::new();
        let cancel = CancellationToken::new();
        let progress = ProgressReporter::silent();

        let report = StartupOrchestrator::new(&engine, &cfg, &ports, &cancel, &progress)
            .run()
            .await
            .unwrap();

        assert_eq!(report.tiers_started, vec!["data"]);
        assert!(report.outcome.is_failure());
        let started = engine.snapshot().started;
        assert!(!started.iter().any(|s| s == "backend" || s == "frontend"));
    }

    #[tokio::test]
    async fn all_ready_is_success() {
        let engine = StubEngine::new();
        let cfg = plain_config();
        let ports = PortAssignment::new();
        let cancel = CancellationToken::new();
        let progress = ProgressReporter::silent();

        let report = StartupOrchestrator::new(&engine, &cfg, &ports, &cancel, &progress)
            .run()
            .await
            .unwrap();
        assert!(matches!(report.outcome, StartupOutcome::Success { ref ready } if ready.len() == 7));
    }

    #[tokio::test]
    async fn cancellation_before_start_is_reported() {
        let engine = StubEngine::new();
        let cfg = plain_config();
        let ports = PortAssignment::new();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let progress = ProgressReporter::silent();

        let err = StartupOrchestrator::new(&engine, &cfg, &ports, &cancel, &progress)
            .run()
            .await
            .unwrap_err();
        assert!(matches!(err, InstallError::Cancelled));
        assert!(engine.snapshot().started.is_empty());
    }
}
