// Credential reconciler
//
// Decision table (first match wins):
//   clean                                  => regenerate, tear down matching volumes
//   force                                  => regenerate, volumes untouched
//   Fresh                                  => regenerate
//   Complete + data may exist              => preserve (interactive confirm may override)
//   Complete, volumes empty/small          => regenerate
//   Partial | Corrupted                    => salvage, fill the gaps
//
// Whatever the path, the returned bundle has every key populated.

use log::{info, warn};
use serde::Serialize;
use std::collections::BTreeMap;

use super::extractor::extract_secrets;
use crate::config::RunOptions;
use crate::descriptor::EnvironmentDescriptor;
use crate::error::{InstallError, InstallResult};
use crate::models::secrets::{SecretBundle, SecretKey};
use crate::models::state::{CredentialDecision, InstallationState};
use crate::models::volumes::VolumeSnapshot;
use crate::prompt::Prompter;
use crate::security::crypto::secret_fingerprint;
use crate::security::random::SecretGenerator;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Provenance {
    /// Read from a valid existing descriptor.
    Preserved,
    /// Recovered line-by-line from a damaged or partial descriptor.
    Salvaged,
    Generated,
}

#[derive(Debug, Clone)]
pub struct ReconcileOutcome {
    pub decision: CredentialDecision,
    pub bundle: SecretBundle,
    pub provenance: BTreeMap<SecretKey, Provenance>,
    /// Volumes to remove before the new credentials are used.
    pub teardown: Vec<String>,
    pub reason: String,
}

impl ReconcileOutcome {
    pub fn count(&self, provenance: Provenance) -> usize {
        self.provenance.values().filter(|p| **p == provenance).count()
    }
}

/// Prior descriptor as seen by the classifier.
#[derive(Debug, Clone, Copy)]
pub struct PriorDescriptor<'a> {
    pub raw: Option<&'a str>,
    pub parsed: Option<&'a EnvironmentDescriptor>,
}

pub struct CredentialReconciler<'a> {
    generator: &'a SecretGenerator,
    prompter: &'a dyn Prompter,
}

impl<'a> CredentialReconciler<'a> {
    pub fn new(generator: &'a SecretGenerator, prompter: &'a dyn Prompter) -> Self {
        Self {
            generator,
            prompter,
        }
    }

    fn generate_all(&self) -> InstallResult<SecretBundle> {
        self.generator.generate_bundle().map_err(rng_error)
    }

    /// Fill the gaps of a partially known bundle, recording where each value came from.
    fn complete(
        &self,
        mut bundle: SecretBundle,
        known: Provenance,
    ) -> InstallResult<(SecretBundle, BTreeMap<SecretKey, Provenance>)> {
        let mut provenance: BTreeMap<SecretKey, Provenance> =
            bundle.iter().map(|(k, _)| (k, known)).collect();
        let filled = self.generator.fill_missing(&mut bundle).map_err(rng_error)?;
        for key in filled {
            provenance.insert(key, Provenance::Generated);
        }
        for key in bundle.nonconforming_keys() {
            if provenance.get(&key) != Some(&Provenance::Generated) {
                warn!(
                    "[PHASE: reconcile] [STEP: credentials] Kept {} ({}) although it does not meet the current strength requirement",
                    key,
                    secret_fingerprint(bundle.get(key))
                );
            }
        }
        Ok((bundle, provenance))
    }

    fn regenerate(&self, teardown: Vec<String>, reason: &str) -> InstallResult<ReconcileOutcome> {
        let bundle = self.generate_all()?;
        let provenance = SecretKey::ALL
            .iter()
            .map(|k| (*k, Provenance::Generated))
            .collect();
        Ok(ReconcileOutcome {
            decision: CredentialDecision::Regenerate,
            bundle,
            provenance,
            teardown,
            reason: reason.to_string(),
        })
    }

    pub async fn reconcile(
        &self,
        state: InstallationState,
        options: &RunOptions,
        snapshot: &VolumeSnapshot,
        prior: PriorDescriptor<'_>,
    ) -> InstallResult<ReconcileOutcome> {
        let outcome = self.decide(state, options, snapshot, prior).await?;
        info!(
            "[PHASE: reconcile] [STEP: credentials] Decision: {} ({}); preserved={}, salvaged={}, generated={}, teardown={:?}",
            outcome.decision,
            outcome.reason,
            outcome.count(Provenance::Preserved),
            outcome.count(Provenance::Salvaged),
            outcome.count(Provenance::Generated),
            outcome.teardown
        );
        Ok(outcome)
    }

    async fn decide(
        &self,
        state: InstallationState,
        options: &RunOptions,
        snapshot: &VolumeSnapshot,
        prior: PriorDescriptor<'_>,
    ) -> InstallResult<ReconcileOutcome> {
        if options.clean {
            return self.regenerate(snapshot.volume_names(), "--clean requested");
        }
        if options.force {
            return self.regenerate(Vec::new(), "--force requested");
        }

        // An unreachable engine may be hiding real data.
        let data_may_exist = snapshot.has_substantial() || !snapshot.engine_reachable;

        match state {
            InstallationState::Fresh => self.regenerate(Vec::new(), "fresh installation"),
            InstallationState::Complete if data_may_exist => {
                let existing = prior
                    .parsed
                    .map(EnvironmentDescriptor::secret_bundle)
                    .unwrap_or_default();

                if self.prompter.is_interactive() {
                    let question = "Existing data was found. Regenerate all credentials anyway? \
                                    The existing database will likely reject them.";
                    match self.prompter.confirm_regenerate(question).await {
                        Ok(true) => {
                            warn!("[PHASE: reconcile] [STEP: credentials] Operator chose to regenerate credentials over existing data");
                            return self.regenerate(Vec::new(), "operator override");
                        }
                        Ok(false) => {}
                        Err(e) => warn!(
                            "[PHASE: reconcile] [STEP: credentials] Prompt failed ({:#}); preserving credentials",
                            e
                        ),
                    }
                }

                let (bundle, provenance) = self.complete(existing, Provenance::Preserved)?;
                for (key, value) in bundle.iter() {
                    if provenance.get(&key) == Some(&Provenance::Preserved) {
                        info!(
                            "[PHASE: reconcile] [STEP: credentials] Preserved {} {}",
                            key,
                            secret_fingerprint(value)
                        );
                    }
                }
                Ok(ReconcileOutcome {
                    decision: CredentialDecision::Preserve,
                    bundle,
                    provenance,
                    teardown: Vec::new(),
                    reason: "existing data found".to_string(),
                })
            }
            InstallationState::Complete => {
                self.regenerate(Vec::new(), "no substantial data behind existing descriptor")
            }
            InstallationState::Partial | InstallationState::Corrupted => {
                let salvaged = prior.raw.map(extract_secrets).unwrap_or_default();
                if salvaged.is_empty() {
                    return self.regenerate(Vec::new(), "nothing to salvage");
                }
                let (bundle, provenance) = self.complete(salvaged, Provenance::Salvaged)?;
                Ok(ReconcileOutcome {
                    decision: CredentialDecision::Preserve,
                    bundle,
                    provenance,
                    teardown: Vec::new(),
                    reason: format!("salvaged from {} descriptor", state),
                })
            }
        }
    }
}

fn rng_error(e: anyhow::Error) -> InstallError {
    InstallError::external(
        format!("secure random generation failed: {:#}", e),
        "Check that the system entropy source (/dev/urandom, getrandom) is available.",
    )
}
