// Installation lifecycle state (in-memory)
//
// NOTE: This is NOT persisted. It is recomputed from the descriptor file and the container
// engine on every invocation, so a stale value can never gate a destructive action.

use serde::Serialize;
use std::fmt;

/// Lifecycle phase of the deployment on this host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InstallationState {
    /// No descriptor and no persistent volumes.
    Fresh,
    /// Something exists, but not a usable descriptor with credentials.
    Partial,
    /// Valid descriptor carrying at least one recognized secret.
    Complete,
    /// Descriptor exists but fails syntactic validation.
    Corrupted,
}

impl InstallationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstallationState::Fresh => "fresh",
            InstallationState::Partial => "partial",
            InstallationState::Complete => "complete",
            InstallationState::Corrupted => "corrupted",
        }
    }
}

impl fmt::Display for InstallationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the credential reconciler decided to do with the stored secrets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CredentialDecision {
    Preserve,
    Regenerate,
}

impl fmt::Display for CredentialDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CredentialDecision::Preserve => f.write_str("preserve"),
            CredentialDecision::Regenerate => f.write_str("regenerate"),
        }
    }
}
