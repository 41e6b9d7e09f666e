// Surfaced error taxonomy
//
// Low-level plumbing (command execution, file I/O) uses anyhow with context; anything that
// reaches the caller is converted into an InstallError carrying a remediation hint that names
// the flag or manual step that resolves it.

use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Conflict,
    ExternalTool,
    Timeout,
    Permission,
    Cancelled,
}

#[derive(Debug, Error)]
pub enum InstallError {
    #[error("validation failed: {message}")]
    Validation { message: String, remediation: String },

    #[error("conflict: {message}")]
    Conflict { message: String, remediation: String },

    #[error("container engine error: {message}")]
    ExternalTool { message: String, remediation: String },

    #[error("timed out: {message}")]
    Timeout { message: String, remediation: String },

    #[error("permission denied: {message}")]
    Permission { message: String, remediation: String },

    #[error("cancelled by user")]
    Cancelled,
}

pub type InstallResult<T> = std::result::Result<T, InstallError>;

impl InstallError {
    pub fn validation(message: impl Into<String>, remediation: impl Into<String>) -> Self {
        InstallError::Validation {
            message: message.into(),
            remediation: remediation.into(),
        }
    }

    pub fn conflict(message: impl Into<String>, remediation: impl Into<String>) -> Self {
        InstallError::Conflict {
            message: message.into(),
            remediation: remediation.into(),
        }
    }

    pub fn external(message: impl Into<String>, remediation: impl Into<String>) -> Self {
        InstallError::ExternalTool {
            message: message.into(),
            remediation: remediation.into(),
        }
    }

    pub fn timeout(message: impl Into<String>, remediation: impl Into<String>) -> Self {
        InstallError::Timeout {
            message: message.into(),
            remediation: remediation.into(),
        }
    }

    pub fn permission(message: impl Into<String>, remediation: impl Into<String>) -> Self {
        InstallError::Permission {
            message: message.into(),
            remediation: remediation.into(),
        }
    }

    /// Classify a container-engine failure by its message.
    pub fn from_engine(action: &str, err: &anyhow::Error) -> Self {
        let detail = format!("{}: {:#}", action, err);
        let lower = detail.to_ascii_lowercase();
        if lower.contains("permission denied") || lower.contains("access denied") {
            return InstallError::permission(
                detail,
                "Run as root or add the current user to the 'docker' group, then retry.",
            );
        }
        if lower.contains("timed out") {
            return InstallError::timeout(
                detail,
                "Check that the Docker daemon is responsive (`docker info`) and retry.",
            );
        }
        InstallError::external(
            detail,
            "Ensure Docker is installed and running (`systemctl start docker`), then retry.",
        )
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            InstallError::Validation { .. } => ErrorKind::Validation,
            InstallError::Conflict { .. } => ErrorKind::Conflict,
            InstallError::ExternalTool { .. } => ErrorKind::ExternalTool,
            InstallError::Timeout { .. } => ErrorKind::Timeout,
            InstallError::Permission { .. } => ErrorKind::Permission,
            InstallError::Cancelled => ErrorKind::Cancelled,
        }
    }

    pub fn remediation(&self) -> &str {
        match self {
            InstallError::Validation { remediation, .. }
            | InstallError::Conflict { remediation, .. }
            | InstallError::ExternalTool { remediation, .. }
            | InstallError::Timeout { remediation, .. }
            | InstallError::Permission { remediation, .. } => remediation,
            InstallError::Cancelled => "Re-run the installer; completed steps are detected and reused.",
        }
    }

    /// Process exit code for this error kind (0 and 1 are reserved).
    pub fn exit_code(&self) -> i32 {
        match self.kind() {
            ErrorKind::Validation => 2,
            ErrorKind::Conflict => 3,
            ErrorKind::ExternalTool => 4,
            ErrorKind::Timeout => 5,
            ErrorKind::Permission => 6,
            ErrorKind::Cancelled => 130,
        }
    }
}
