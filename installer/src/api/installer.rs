// Install pipeline
//
// One invocation, in order:
//   preflight -> volumes -> classify -> identity -> reconcile credentials -> teardown (clean)
//   -> ports -> certificates -> validate preserved credentials -> render
//   -> [dry run stops here] -> write descriptor -> phased startup -> rollback on failure
//
// Nothing is cached between invocations; every decision is made from what is observed now.

use chrono::{Local, Utc};
use log::{error, info, warn};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::api::progress::ProgressReporter;
use crate::config::{EngineConfig, InstallContext, RunOptions};
use crate::descriptor::writer::write_descriptor;
use crate::descriptor::EnvironmentDescriptor;
use crate::error::{InstallError, InstallResult};
use crate::installation::certificates::{CertificatePaths, CertificateProvider};
use crate::installation::engine::ContainerEngine;
use crate::models::health::StartupOutcome;
use crate::models::secrets::{SecretBundle, SecretKey};
use crate::models::state::{CredentialDecision, InstallationState};
use crate::models::volumes::VolumeSnapshot;
use crate::orchestration::rollback::{compensate, RollbackReport, RollbackSnapshot};
use crate::orchestration::startup::{StartupOrchestrator, StartupReport};
use crate::prompt::Prompter;
use crate::reconcile::classifier::{observe, Observation};
use crate::reconcile::credentials::{CredentialReconciler, PriorDescriptor, Provenance};
use crate::reconcile::generator::{self, GeneratorInputs};
use crate::reconcile::ports::{PortProber, PortResolution, PortResolver};
use crate::reconcile::validator::{ConsistencyValidator, ValidationDecision, Verdict};
use crate::reconcile::volumes::{describe, VolumeInspector};
use crate::security::random::SecretGenerator;
use crate::utils::validation::{validate_domain, validate_email, validate_project_name, validate_token};

/// External capabilities, resolved once at composition time.
#[derive(Clone)]
pub struct Capabilities {
    pub engine: Arc<dyn ContainerEngine>,
    pub prober: Arc<dyn PortProber>,
    pub prompter: Arc<dyn Prompter>,
    pub certificates: Arc<dyn CertificateProvider>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Dry run: nothing written, nothing started.
    Planned,
    Installed,
    Degraded,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallReport {
    pub correlation_id: String,
    pub status: RunStatus,
    pub state: InstallationState,
    pub decision: CredentialDecision,
    pub decision_reason: String,
    pub provenance: BTreeMap<SecretKey, Provenance>,
    pub removed_volumes: Vec<String>,
    pub ports: PortResolution,
    pub certificates: CertificatePaths,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validation: Option<Verdict>,
    pub descriptor_path: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup_path: Option<PathBuf>,
    /// Redacted descriptor, dry runs only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preview: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub startup: Option<StartupReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rollback: Option<RollbackReport>,
}

impl InstallReport {
    /// Surfaced error for a run whose startup failed and was rolled back.
    pub fn failure(&self) -> Option<InstallError> {
        if self.status != RunStatus::Failed {
            return None;
        }
        let not_ready = self
            .startup
            .as_ref()
            .map(|s| s.outcome.not_ready().join(", "))
            .unwrap_or_default();
        Some(InstallError::timeout(
            format!("services did not become ready: {}", not_ready),
            "Inspect `docker compose logs <service>` for the services listed; the previous descriptor was restored, so re-running is safe.",
        ))
    }
}

/// Who the deployment is for: resolved from flags, else from the prior descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Identity {
    domain: String,
    email: String,
    token: String,
}

fn pick(flag: Option<&str>, prior: Option<&EnvironmentDescriptor>, key: &str) -> Option<String> {
    flag.map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .or_else(|| {
            prior
                .and_then(|d| d.get(key))
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        })
}

fn resolve_identity(options: &RunOptions, prior: Option<&EnvironmentDescriptor>) -> InstallResult<Identity> {
    let required = |flag: Option<&str>, key: &str, cli: &str| {
        pick(flag, prior, key).ok_or_else(|| {
            InstallError::validation(
                format!("{} is required for a new installation", cli),
                format!("Pass {} <value>.", cli),
            )
        })
    };
    let domain = required(options.domain.as_deref(), "DOMAIN", "--domain")?;
    let email = required(options.email.as_deref(), "ADMIN_EMAIL", "--email")?;
    let token = required(options.token.as_deref(), "REGISTRATION_TOKEN", "--token")?;

    validate_domain(&domain)
        .map_err(|e| InstallError::validation(e.to_string(), "Pass --domain with a fully qualified host name, e.g. app.example.com."))?;
    validate_email(&email)
        .map_err(|e| InstallError::validation(e.to_string(), "Pass --email with a valid address."))?;
    validate_token(&token)
        .map_err(|e| InstallError::validation(e.to_string(), "Pass --token with the registration token you were issued."))?;

    Ok(Identity {
        domain,
        email,
        token,
    })
}

async fn preflight(config: &EngineConfig, options: &RunOptions, engine: &dyn ContainerEngine) -> InstallResult<()> {
    validate_project_name(&config.project_name).map_err(|e| {
        InstallError::validation(e.to_string(), "Set project_name in installer.toml to a lowercase identifier.")
    })?;

    if let Err(e) = engine.ping().await {
        if options.dry_run {
            warn!(
                "[PHASE: preflight] [STEP: engine] Container engine unreachable; dry run continues with a partial view: {:#}",
                e
            );
        } else {
            return Err(InstallError::from_engine("container engine check", &e));
        }
    }

    let compose = config.compose_path();
    if !tokio::fs::try_exists(&compose).await.unwrap_or(false) {
        let err = InstallError::validation(
            format!("compose file not found: {}", compose.display()),
            "Place the stack's compose file in the install directory or set compose_file in installer.toml.",
        );
        if options.dry_run {
            warn!("[PHASE: preflight] [STEP: compose] {}", err);
        } else {
            return Err(err);
        }
    }
    info!("[PHASE: preflight] [STEP: done] Preflight checks passed");
    Ok(())
}

/// Remove the stack's containers, then the given volumes.
async fn tear_down(engine: &dyn ContainerEngine, volumes: &[String]) -> InstallResult<Vec<String>> {
    engine
        .remove_stack()
        .await
        .map_err(|e| InstallError::from_engine("remove stack containers", &e))?;
    let mut removed = Vec::new();
    for volume in volumes {
        engine
            .remove_volume(volume)
            .await
            .map_err(|e| InstallError::from_engine(&format!("remove volume {}", volume), &e))?;
        warn!("[PHASE: reconcile] [STEP: teardown] Removed volume {}", volume);
        removed.push(volume.clone());
    }
    Ok(removed)
}

pub async fn run_installation(
    ctx: &InstallContext,
    caps: &Capabilities,
    cancel: &CancellationToken,
    progress: &ProgressReporter,
) -> InstallResult<InstallReport> {
    let config = ctx.config.as_ref();
    let options = ctx.options.as_ref();
    let engine = caps.engine.as_ref();
    let descriptor_path = config.descriptor_path();

    info!(
        "[PHASE: preflight] [STEP: start] Install run {} (project={}, dir={}, dry_run={}, force={}, clean={})",
        progress.correlation_id(),
        config.project_name,
        config.install_dir.display(),
        options.dry_run,
        options.force,
        options.clean
    );
    progress.info("preflight", "start", 2, "Checking prerequisites");
    preflight(config, options, engine).await?;

    progress.info("reconcile", "volumes", 10, "Inspecting persistent volumes");
    let snapshot: VolumeSnapshot = VolumeInspector::new(engine, config).snapshot().await;
    info!("[PHASE: reconcile] [STEP: volumes] {}", describe(&snapshot));

    let observation: Observation = observe(&descriptor_path, &snapshot, engine).await;
    progress.info(
        "reconcile",
        "classify",
        20,
        format!("Installation state: {}", observation.state),
    );
    let prior_descriptor = observation.parsed.as_ref().map(|r| &r.descriptor);

    let identity = resolve_identity(options, prior_descriptor)?;

    if cancel.is_cancelled() {
        return Err(InstallError::Cancelled);
    }

    let secrets = SecretGenerator::new();
    let reconciler = CredentialReconciler::new(&secrets, caps.prompter.as_ref());
    let mut outcome = reconciler
        .reconcile(
            observation.state,
            options,
            &snapshot,
            PriorDescriptor {
                raw: observation.raw_descriptor.as_deref(),
                parsed: prior_descriptor,
            },
        )
        .await?;
    progress.info(
        "reconcile",
        "credentials",
        30,
        format!("Credentials: {} ({})", outcome.decision, outcome.reason),
    );

    let rollback_snapshot = RollbackSnapshot::capture(
        &descriptor_path,
        observation.running_services(),
        config.all_services(),
    )
    .await;

    let mut removed_volumes = Vec::new();
    if !outcome.teardown.is_empty() {
        if options.dry_run {
            warn!(
                "[PHASE: reconcile] [STEP: teardown] Dry run: would remove volumes {:?}",
                outcome.teardown
            );
        } else {
            progress.warn("reconcile", "teardown", 35, "Removing existing stack data (--clean)");
            removed_volumes = tear_down(engine, &outcome.teardown).await?;
        }
    }

    progress.info("ports", "resolve", 40, "Resolving host ports");
    let ports = PortResolver::new(config, caps.prober.as_ref(), engine)
        .resolve()
        .await?;
    for moved in &ports.moved {
        progress.warn(
            "ports",
            "resolve",
            40,
            format!("{} moved from {} to {}", moved.name, moved.from, moved.to),
        );
    }

    progress.info("tls", "certificates", 45, "Preparing TLS material");
    let certificates = if options.dry_run {
        caps.certificates.planned(&identity.domain, &options.tls)
    } else {
        caps.certificates
            .ensure(&identity.domain, &options.tls)
            .await?
    };

    let mut validation = None;
    if outcome.decision == CredentialDecision::Preserve && snapshot.has_substantial() {
        if options.dry_run {
            info!("[PHASE: validate] [STEP: skip] Dry run: credential probe skipped");
        } else {
            progress.info("validate", "probe", 55, "Checking preserved credentials against existing data");
            let validator = ConsistencyValidator::new(engine, config, cancel);
            let decision = validator
                .validate_with_policy(&outcome.bundle, options, caps.prompter.as_ref())
                .await?;
            match decision {
                ValidationDecision::Proceed { verdict, warned } => {
                    if warned {
                        progress.warn("validate", "probe", 55, format!("Continuing: {}", verdict));
                    }
                    validation = Some(verdict);
                }
                ValidationDecision::ResetVolume { volume } => {
                    progress.warn("validate", "reset", 55, format!("Resetting volume {}", volume));
                    removed_volumes.extend(tear_down(engine, std::slice::from_ref(&volume)).await?);
                }
                ValidationDecision::FullClean => {
                    progress.warn("validate", "clean", 55, "Removing all stack data and regenerating credentials");
                    removed_volumes.extend(tear_down(engine, &snapshot.volume_names()).await?);
                    let bundle = secrets.generate_bundle().map_err(|e| {
                        InstallError::external(
                            format!("secure random source failed: {:#}", e),
                            "Check that the system entropy source is available and retry.",
                        )
                    })?;
                    outcome.bundle = bundle;
                    outcome.decision = CredentialDecision::Regenerate;
                    outcome.reason = "full clean chosen after credential mismatch".to_string();
                    outcome.provenance = SecretKey::ALL
                        .iter()
                        .map(|k| (*k, Provenance::Generated))
                        .collect();
                }
            }
        }
    }

    let image_tag = options
        .image_tag
        .clone()
        .unwrap_or_else(|| config.images.tag.clone());
    let bundle: &SecretBundle = &outcome.bundle;
    let descriptor = generator::render(&GeneratorInputs {
        project: &config.project_name,
        domain: &identity.domain,
        email: &identity.email,
        token: &identity.token,
        secrets: bundle,
        ports: &ports.assignment,
        certificates: &certificates,
        image_registry: &config.images.registry,
        image_tag: &image_tag,
        database_name: &config.probe.database_name,
        generated_at: Utc::now(),
    });
    let missing = generator::missing_required(&descriptor);
    if !missing.is_empty() {
        return Err(InstallError::validation(
            format!("rendered descriptor lacks required keys: {}", missing.join(", ")),
            "Report this as a bug; no files were changed.",
        ));
    }
    progress.info("descriptor", "render", 60, "Descriptor rendered");

    let mut report = InstallReport {
        correlation_id: progress.correlation_id().to_string(),
        status: RunStatus::Planned,
        state: observation.state,
        decision: outcome.decision,
        decision_reason: outcome.reason.clone(),
        provenance: outcome.provenance.clone(),
        removed_volumes,
        ports,
        certificates,
        validation,
        descriptor_path: descriptor_path.clone(),
        backup_path: None,
        preview: None,
        startup: None,
        rollback: None,
    };

    if options.dry_run {
        report.preview = Some(descriptor.render_redacted());
        progress.info("descriptor", "dry_run", 100, "Dry run complete; nothing was written");
        info!("[PHASE: descriptor] [STEP: dry_run] Dry run complete; nothing written, nothing started");
        return Ok(report);
    }

    if cancel.is_cancelled() {
        return Err(InstallError::Cancelled);
    }

    let receipt = write_descriptor(&descriptor_path, &descriptor, config.backups_to_keep, Local::now())
        .await
        .map_err(|e| {
            InstallError::permission(
                format!("failed to write {}: {:#}", descriptor_path.display(), e),
                "Run the installer with write access to the install directory.",
            )
        })?;
    report.backup_path = receipt.backup_path.clone();
    let rollback_snapshot = rollback_snapshot.with_backup(receipt.backup_path);
    progress.info("descriptor", "write", 65, "Descriptor written");

    let startup = StartupOrchestrator::new(engine, config, &report.ports.assignment, cancel, progress)
        .run()
        .await;
    let startup = match startup {
        Ok(s) => s,
        Err(e) => {
            error!("[PHASE: startup] [STEP: abort] Startup interrupted: {}", e);
            let rb = compensate(engine, &rollback_snapshot).await;
            report.rollback = Some(rb);
            return Err(e);
        }
    };

    report.status = match &startup.outcome {
        StartupOutcome::Success { .. } => RunStatus::Installed,
        StartupOutcome::DegradedSuccess { not_ready, .. } => {
            progress.warn(
                "startup",
                "outcome",
                100,
                format!("Running in degraded mode; not ready: {}", not_ready.join(", ")),
            );
            RunStatus::Degraded
        }
        StartupOutcome::Failure { .. } => RunStatus::Failed,
    };
    report.startup = Some(startup);

    if report.status == RunStatus::Failed {
        progress.error("rollback", "start", 100, "Startup failed; rolling back");
        report.rollback = Some(compensate(engine, &rollback_snapshot).await);
    } else {
        progress.info("startup", "done", 100, "Installation complete");
    }
    Ok(report)
}

/// Fresh correlation id for a run.
pub fn new_correlation_id() -> String {
    Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HealthSignal;
    use crate::descriptor;
    use crate::error::ErrorKind;
    use crate::installation::engine::ContainerState;
    use crate::installation::CommandOutput;
    use crate::reconcile::validator::MismatchPolicy;
    use crate::testing::{ScriptedPrompter, StubCertificates, StubEngine, StubProber};

    const MIB: u64 = 1024 * 1024;

    fn config_in(dir: &std::path::Path) -> EngineConfig {
        let mut cfg = EngineConfig::default();
        cfg.install_dir = dir.to_path_buf();
        for tier in &mut cfg.tiers {
            for svc in &mut tier.services {
                svc.signal = HealthSignal::None;
            }
        }
        cfg.timeouts.poll_interval_secs = 1;
        cfg.timeouts.tier_health_secs = 3;
        cfg.timeouts.probe_secs = 3;
        std::fs::write(cfg.compose_path(), "services: {}\n").unwrap();
        cfg
    }

    fn identity_options() -> RunOptions {
        RunOptions {
            domain: Some("app.example.com".into()),
            email: Some("ops@example.com".into()),
            token: Some("token-123456".into()),
            non_interactive: true,
            ..Default::default()
        }
    }

    fn caps(engine: Arc<StubEngine>) -> Capabilities {
        Capabilities {
            engine,
            prober: Arc::new(StubProber::new()),
            prompter: Arc::new(ScriptedPrompter::non_interactive()),
            certificates: Arc::new(StubCertificates::new()),
        }
    }

    fn ok() -> CommandOutput {
        CommandOutput {
            exit_code: Some(0),
            stdout: "1\n".into(),
            stderr: String::new(),
            duration_ms: 1,
        }
    }

    async fn run(cfg: EngineConfig, options: RunOptions, caps: &Capabilities) -> InstallResult<InstallReport> {
        let ctx = InstallContext::new(cfg, options);
        run_installation(&ctx, caps, &CancellationToken::new(), &ProgressReporter::silent()).await
    }

    #[tokio::test]
    async fn fresh_host_generates_everything_and_starts_all_tiers() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config_in(dir.path());
        let path = cfg.descriptor_path();
        let engine = Arc::new(StubEngine::new());

        let report = run(cfg, identity_options(), &caps(engine.clone())).await.unwrap();

        assert_eq!(report.state, InstallationState::Fresh);
        assert_eq!(report.decision, CredentialDecision::Regenerate);
        assert_eq!(report.status, RunStatus::Installed);
        assert!(report.backup_path.is_none());

        let written = descriptor::parse(&std::fs::read_to_string(&path).unwrap());
        assert!(written.is_valid());
        let bundle = written.descriptor.secret_bundle();
        assert!(bundle.is_complete());
        assert_eq!(written.descriptor.get("DOMAIN"), Some("app.example.com"));
        assert_eq!(engine.snapshot().started.len(), 7);
    }

    #[tokio::test]
    async fn existing_data_keeps_prior_credentials() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config_in(dir.path());
        let path = cfg.descriptor_path();
        std::fs::write(
            &path,
            "DOMAIN=app.example.com\nADMIN_EMAIL=ops@example.com\nREGISTRATION_TOKEN=token-123456\ndb_user=u1\ndb_password=p1\n",
        )
        .unwrap();
        let engine = Arc::new(
            StubEngine::new()
                .with_volume("stack_postgres_data", 50 * MIB)
                .with_exec(ok())
                .with_exec(ok()),
        );

        let options = RunOptions {
            non_interactive: true,
            ..Default::default()
        };
        let report = run(cfg, options, &caps(engine.clone())).await.unwrap();

        assert_eq!(report.state, InstallationState::Complete);
        assert_eq!(report.decision, CredentialDecision::Preserve);
        assert_eq!(report.validation, Some(Verdict::Compatible));
        assert!(report.backup_path.as_ref().is_some_and(|p| p.exists()));

        let written = descriptor::parse(&std::fs::read_to_string(&path).unwrap()).descriptor;
        assert_eq!(written.get("DB_USER"), Some("u1"));
        assert_eq!(written.get("DB_PASSWORD"), Some("p1"));
        assert!(written.secret_bundle().is_complete());
        let state = engine.snapshot();
        assert!(state.removed_volumes.is_empty());
        assert_eq!(state.removed_containers.len(), 1);
    }

    #[tokio::test]
    async fn dry_run_writes_and_starts_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config_in(dir.path());
        let path = cfg.descriptor_path();
        let engine = Arc::new(StubEngine::new());
        let certs = Arc::new(StubCertificates::new());
        let caps = Capabilities {
            certificates: certs.clone(),
            ..caps(engine.clone())
        };

        let options = RunOptions {
            dry_run: true,
            ..identity_options()
        };
        let report = run(cfg, options, &caps).await.unwrap();

        assert_eq!(report.status, RunStatus::Planned);
        assert!(!path.exists());
        let preview = report.preview.unwrap();
        assert!(preview.contains("DB_PASSWORD=***"));
        assert!(preview.contains("DOMAIN=app.example.com"));
        assert_eq!(certs.ensured(), 0);
        let state = engine.snapshot();
        assert!(state.started.is_empty());
        assert!(state.ephemeral.is_empty());
    }

    #[tokio::test]
    async fn missing_identity_is_a_validation_error_before_any_change() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config_in(dir.path());
        let engine = Arc::new(StubEngine::new().with_volume("stack_postgres_data", 50 * MIB));

        let options = RunOptions {
            clean: true,
            non_interactive: true,
            ..Default::default()
        };
        let err = run(cfg, options, &caps(engine.clone())).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(err.remediation().contains("--domain"));
        assert!(engine.snapshot().removed_volumes.is_empty());
    }

    #[tokio::test]
    async fn unreachable_engine_fails_preflight() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config_in(dir.path());
        let engine = Arc::new(StubEngine::new().unreachable());
        let err = run(cfg, identity_options(), &caps(engine)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ExternalTool);
    }

    #[tokio::test]
    async fn clean_removes_volumes_before_regenerating() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config_in(dir.path());
        let engine = Arc::new(
            StubEngine::new()
                .with_volume("stack_postgres_data", 50 * MIB)
                .with_volume("stack_redis_data", 2 * MIB),
        );
        let options = RunOptions {
            clean: true,
            ..identity_options()
        };
        let report = run(cfg, options, &caps(engine.clone())).await.unwrap();
        assert_eq!(report.decision, CredentialDecision::Regenerate);
        let state = engine.snapshot();
        assert!(state.stack_removed);
        assert_eq!(state.removed_volumes.len(), 2);
    }

    #[tokio::test]
    async fn explicit_full_clean_on_mismatch_regenerates() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config_in(dir.path());
        std::fs::write(
            cfg.descriptor_path(),
            "DOMAIN=app.example.com\nADMIN_EMAIL=ops@example.com\nREGISTRATION_TOKEN=token-123456\nDB_USER=u1\nDB_PASSWORD=p1\n",
        )
        .unwrap();
        let engine = Arc::new(
            StubEngine::new()
                .with_volume("stack_postgres_data", 50 * MIB)
                .with_exec(ok())
                .with_exec(CommandOutput {
                    exit_code: Some(2),
                    stdout: String::new(),
                    stderr: "FATAL:  password authentication failed for user \"u1\"".into(),
                    duration_ms: 1,
                }),
        );
        let options = RunOptions {
            non_interactive: true,
            on_mismatch: Some(MismatchPolicy::FullClean),
            ..Default::default()
        };
        let report = run(cfg, options, &caps(engine.clone())).await.unwrap();
        assert_eq!(report.decision, CredentialDecision::Regenerate);
        assert_eq!(report.removed_volumes, vec!["stack_postgres_data".to_string()]);
        assert_ne!(
            descriptor::parse(&std::fs::read_to_string(report.descriptor_path).unwrap())
                .descriptor
                .get("DB_USER"),
            Some("u1")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn failed_startup_restores_prior_descriptor() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config_in(dir.path());
        let path = cfg.descriptor_path();
        let prior = "DOMAIN=app.example.com\nADMIN_EMAIL=ops@example.com\nREGISTRATION_TOKEN=token-123456\nDB_USER=u1\n";
        std::fs::write(&path, prior).unwrap();
        let engine = Arc::new(StubEngine::new().with_state("database", ContainerState::Exited));

        let options = RunOptions {
            force: true,
            non_interactive: true,
            ..Default::default()
        };
        let report = run(cfg, options, &caps(engine.clone())).await.unwrap();

        assert_eq!(report.status, RunStatus::Failed);
        let rollback = report.rollback.as_ref().unwrap();
        assert!(rollback.descriptor_restored);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), prior);
        let failure = report.failure().unwrap();
        assert_eq!(failure.kind(), ErrorKind::Timeout);
        assert!(failure.to_string().contains("database"));
    }

    #[test]
    fn identity_falls_back_to_prior_descriptor() {
        let prior = descriptor::parse(
            "DOMAIN=old.example.com\nADMIN_EMAIL=old@example.com\nREGISTRATION_TOKEN=token-abcdef\n",
        )
        .descriptor;
        let options = RunOptions {
            domain: Some("new.example.com".into()),
            ..Default::default()
        };
        let id = resolve_identity(&options, Some(&prior)).unwrap();
        assert_eq!(id.domain, "new.example.com");
        assert_eq!(id.email, "old@example.com");
        assert_eq!(id.token, "token-abcdef");

        let bad = RunOptions {
            domain: Some("not a domain".into()),
            ..identity_options()
        };
        assert_eq!(resolve_identity(&bad, None).unwrap_err().kind(), ErrorKind::Validation);
    }
}
