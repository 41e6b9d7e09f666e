// Consistency validator
//
// Checks that preserved credentials still open the existing database before the new
// descriptor is committed:
//   (a) re-measure the database volume; if it is no longer substantial the deep check is skipped
//   (b) probe: authenticate against the data with the candidate credentials, either inside the
//       running database container or in a throwaway one started over the volume
//
// Anything but `Compatible` is handed to the mismatch policy. Nothing here removes data; a
// destructive policy is returned to the caller to carry out.

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio_util::sync::CancellationToken;

use super::volumes::VolumeInspector;
use crate::config::{EngineConfig, RunOptions};
use crate::error::{InstallError, InstallResult};
use crate::installation::engine::{ContainerEngine, ContainerSummary, EphemeralSpec};
use crate::installation::CommandOutput;
use crate::models::secrets::{SecretBundle, SecretKey};
use crate::models::volumes::{SizeClass, VolumeRole};
use crate::prompt::Prompter;
use crate::utils::retry::{PaceStop, RetryPolicy};

/// What to do when candidate credentials do not (provably) match existing data.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "kebab-case")]
pub enum MismatchPolicy {
    /// Keep going with a warning.
    Continue,
    /// Wait and validate again.
    Retry,
    /// Remove only the database volume.
    ResetVolume,
    /// Remove every volume and regenerate all credentials.
    FullClean,
    Abort,
}

impl MismatchPolicy {
    pub const ALL: [MismatchPolicy; 5] = [
        MismatchPolicy::Continue,
        MismatchPolicy::Retry,
        MismatchPolicy::ResetVolume,
        MismatchPolicy::FullClean,
        MismatchPolicy::Abort,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            MismatchPolicy::Continue => "continue",
            MismatchPolicy::Retry => "retry",
            MismatchPolicy::ResetVolume => "reset-volume",
            MismatchPolicy::FullClean => "full-clean",
            MismatchPolicy::Abort => "abort",
        }
    }

    pub fn is_destructive(self) -> bool {
        matches!(self, MismatchPolicy::ResetVolume | MismatchPolicy::FullClean)
    }
}

impl fmt::Display for MismatchPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "verdict", content = "detail", rename_all = "snake_case")]
pub enum Verdict {
    Compatible,
    Incompatible(String),
    Inconclusive(String),
    /// The database volume holds no meaningful data; nothing to check against.
    NotApplicable,
}

impl Verdict {
    pub fn is_ok(&self) -> bool {
        matches!(self, Verdict::Compatible | Verdict::NotApplicable)
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Compatible => f.write_str("compatible"),
            Verdict::Incompatible(d) => write!(f, "incompatible: {}", d),
            Verdict::Inconclusive(d) => write!(f, "inconclusive: {}", d),
            Verdict::NotApplicable => f.write_str("not applicable (database volume is empty)"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ValidationReport {
    pub verdict: Verdict,
    pub volume: Option<String>,
    /// `exec` into the running database, or a throwaway container.
    pub probed_running_container: bool,
    pub attempts: u32,
}

/// Outcome of validation after the mismatch policy was applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationDecision {
    Proceed { verdict: Verdict, warned: bool },
    ResetVolume { volume: String },
    FullClean,
}

/// Map psql output to a verdict.
pub fn classify_probe_output(out: &CommandOutput) -> Verdict {
    if out.success() {
        return Verdict::Compatible;
    }
    let stderr = out.stderr.to_ascii_lowercase();
    if stderr.contains("password authentication failed")
        || (stderr.contains("role") && stderr.contains("does not exist"))
        || stderr.contains("no pg_hba.conf entry")
    {
        return Verdict::Incompatible(first_line(&out.stderr));
    }
    // Authentication passed; only the configured database is missing.
    if stderr.contains("database") && stderr.contains("does not exist") {
        return Verdict::Compatible;
    }
    Verdict::Inconclusive(if out.stderr.trim().is_empty() {
        format!("psql exited with {:?}", out.exit_code)
    } else {
        first_line(&out.stderr)
    })
}

fn first_line(s: &str) -> String {
    s.lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("")
        .to_string()
}

pub struct ConsistencyValidator<'a> {
    engine: &'a dyn ContainerEngine,
    config: &'a EngineConfig,
    cancel: &'a CancellationToken,
}

impl<'a> ConsistencyValidator<'a> {
    pub fn new(
        engine: &'a dyn ContainerEngine,
        config: &'a EngineConfig,
        cancel: &'a CancellationToken,
    ) -> Self {
        Self {
            engine,
            config,
            cancel,
        }
    }

    fn psql_command(&self, user: &str) -> Vec<String> {
        vec![
            "psql".to_string(),
            "-h".to_string(),
            "127.0.0.1".to_string(),
            "-U".to_string(),
            user.to_string(),
            "-d".to_string(),
            self.config.probe.database_name.clone(),
            "-tAc".to_string(),
            "SELECT 1".to_string(),
        ]
    }

    async fn psql(&self, container: &str, bundle: &SecretBundle) -> Verdict {
        let env = vec![(
            "PGPASSWORD".to_string(),
            bundle.get(SecretKey::DbPassword).to_string(),
        )];
        let cmd = self.psql_command(bundle.get(SecretKey::DbUser));
        match self
            .engine
            .exec(container, &env, &cmd, self.config.command_timeout())
            .await
        {
            Ok(out) => classify_probe_output(&out),
            Err(e) => Verdict::Inconclusive(format!("probe exec failed: {:#}", e)),
        }
    }

    /// Start a throwaway database over `volume`, wait for readiness, authenticate once.
    async fn probe_ephemeral(&self, volume: &str, bundle: &SecretBundle) -> InstallResult<(Verdict, u32)> {
        let spec = EphemeralSpec {
            image: self.config.probe.database_image.clone(),
            mounts: vec![(
                volume.to_string(),
                self.config.probe.data_mount.clone(),
                false,
            )],
            env: vec![
                (
                    "POSTGRES_USER".to_string(),
                    bundle.get(SecretKey::DbUser).to_string(),
                ),
                (
                    "POSTGRES_PASSWORD".to_string(),
                    bundle.get(SecretKey::DbPassword).to_string(),
                ),
            ],
            command: Vec::new(),
            label: "probe".to_string(),
        };

        let container = match self.engine.run_ephemeral(&spec).await {
            Ok(id) => id,
            Err(e) => {
                return Ok((
                    Verdict::Inconclusive(format!("could not start probe container: {:#}", e)),
                    0,
                ))
            }
        };

        let result = self.wait_and_probe(&container, bundle).await;

        if let Err(e) = self.engine.remove_container(&container).await {
            warn!(
                "[PHASE: validate] [STEP: probe] Failed to remove probe container {}: {:#}",
                container, e
            );
        }
        result
    }

    async fn wait_and_probe(&self, container: &str, bundle: &SecretBundle) -> InstallResult<(Verdict, u32)> {
        let policy = RetryPolicy::new(self.config.poll_interval(), self.config.probe_timeout());
        let mut pacer = policy.start();
        let ready_cmd = vec![
            "pg_isready".to_string(),
            "-h".to_string(),
            "127.0.0.1".to_string(),
            "-q".to_string(),
        ];
        loop {
            let ready = matches!(
                self.engine
                    .exec(container, &[], &ready_cmd, self.config.command_timeout())
                    .await,
                Ok(out) if out.success()
            );
            if ready {
                debug!(
                    "[PHASE: validate] [STEP: probe] Probe database ready after {} check(s)",
                    pacer.attempts() + 1
                );
                break;
            }
            match pacer.next_attempt(self.cancel).await {
                Ok(()) => {}
                Err(PaceStop::Cancelled) => return Err(InstallError::Cancelled),
                Err(_) => {
                    return Ok((
                        Verdict::Inconclusive(format!(
                            "probe database not ready within {}s",
                            self.config.timeouts.probe_secs
                        )),
                        pacer.attempts(),
                    ))
                }
            }
        }
        Ok((self.psql(container, bundle).await, pacer.attempts() + 1))
    }

    /// The stack's database container, if it is running right now.
    async fn running_database(&self) -> Option<ContainerSummary> {
        let containers = match self.engine.list_containers().await {
            Ok(c) => c,
            Err(e) => {
                warn!(
                    "[PHASE: validate] [STEP: probe] Could not list containers ({:#}); using a throwaway probe",
                    e
                );
                return None;
            }
        };
        containers.into_iter().find(|c| {
            c.state.is_running() && c.service.as_deref() == Some(VolumeRole::Database.as_str())
        })
    }

    /// One validation pass. Volume size and running containers are queried afresh each time.
    pub async fn validate(&self, bundle: &SecretBundle) -> InstallResult<ValidationReport> {
        let inspector = VolumeInspector::new(self.engine, self.config);
        let Some(observation) = inspector.remeasure(VolumeRole::Database).await else {
            info!("[PHASE: validate] [STEP: measure] Database volume no longer present; skipping probe");
            return Ok(ValidationReport {
                verdict: Verdict::NotApplicable,
                volume: None,
                probed_running_container: false,
                attempts: 0,
            });
        };
        if observation.class != SizeClass::Substantial {
            info!(
                "[PHASE: validate] [STEP: measure] Database volume {} is {:?}; treating as fresh",
                observation.name, observation.class
            );
            return Ok(ValidationReport {
                verdict: Verdict::NotApplicable,
                volume: Some(observation.name),
                probed_running_container: false,
                attempts: 0,
            });
        }

        let running = self.running_database().await;

        let (verdict, attempts, probed_running) = match running {
            Some(c) => {
                info!(
                    "[PHASE: validate] [STEP: probe] Probing credentials inside running container {}",
                    c.name
                );
                (self.psql(&c.name, bundle).await, 1, true)
            }
            None => {
                info!(
                    "[PHASE: validate] [STEP: probe] Probing credentials in a throwaway container over {}",
                    observation.name
                );
                let (v, a) = self.probe_ephemeral(&observation.name, bundle).await?;
                (v, a, false)
            }
        };

        info!("[PHASE: validate] [STEP: probe] Verdict: {}", verdict);
        Ok(ValidationReport {
            verdict,
            volume: Some(observation.name),
            probed_running_container: probed_running,
            attempts,
        })
    }

    /// Validate, and on mismatch apply the policy (explicit flag, prompt, or non-interactive
    /// default `continue`). `retry` is bounded by the configured retry count.
    pub async fn validate_with_policy(
        &self,
        bundle: &SecretBundle,
        options: &RunOptions,
        prompter: &dyn Prompter,
    ) -> InstallResult<ValidationDecision> {
        let max_retries = self.config.timeouts.mismatch_max_retries;
        let mut retries = 0u32;
        loop {
            let report = self.validate(bundle).await?;
            if report.verdict.is_ok() {
                return Ok(ValidationDecision::Proceed {
                    verdict: report.verdict,
                    warned: false,
                });
            }

            let policy = match options.on_mismatch {
                Some(p) => p,
                None if prompter.is_interactive() => {
                    prompter.choose_mismatch_policy(&report).await.unwrap_or_else(|e| {
                        warn!(
                            "[PHASE: validate] [STEP: policy] Prompt failed ({:#}); continuing",
                            e
                        );
                        MismatchPolicy::Continue
                    })
                }
                None => MismatchPolicy::Continue,
            };
            info!(
                "[PHASE: validate] [STEP: policy] Mismatch policy: {} (verdict: {})",
                policy, report.verdict
            );

            match policy {
                MismatchPolicy::Continue => {
                    warn!(
                        "[PHASE: validate] [STEP: policy] Continuing although credentials may not match existing data ({})",
                        report.verdict
                    );
                    return Ok(ValidationDecision::Proceed {
                        verdict: report.verdict,
                        warned: true,
                    });
                }
                MismatchPolicy::Retry => {
                    if retries >= max_retries {
                        return Err(InstallError::timeout(
                            format!(
                                "credentials still not confirmed after {} retries ({})",
                                retries, report.verdict
                            ),
                            "Check the database container logs, then re-run; or pass --on-mismatch continue / --clean.",
                        ));
                    }
                    retries += 1;
                    let delay = self.config.mismatch_retry_delay();
                    info!(
                        "[PHASE: validate] [STEP: policy] Retrying validation in {}s ({}/{})",
                        delay.as_secs(),
                        retries,
                        max_retries
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.cancel.cancelled() => return Err(InstallError::Cancelled),
                    }
                }
                MismatchPolicy::ResetVolume => {
                    let Some(volume) = report.volume else {
                        return Ok(ValidationDecision::Proceed {
                            verdict: report.verdict,
                            warned: true,
                        });
                    };
                    return Ok(ValidationDecision::ResetVolume { volume });
                }
                MismatchPolicy::FullClean => return Ok(ValidationDecision::FullClean),
                MismatchPolicy::Abort => {
                    return Err(InstallError::conflict(
                        format!("credentials do not match existing data ({})", report.verdict),
                        "Restore the previous descriptor from its .backup file, or re-run with --clean to discard existing data.",
                    ))
                }
            }
        }
    }
}
