// External tooling
//
// Everything that shells out lives under this module: the container engine (Docker CLI +
// Compose) and the certificate provider (openssl). Shared here is the command runner with
// timeouts, transient-failure retries and masked argument logging.
//
// IMPORTANT:
// - Never log secrets (passwords passed via `-e KEY=...`, connection URLs, tokens).
// - All I/O is async; child processes are killed when their future is dropped.

pub mod certificates;
pub mod docker;
pub mod engine;

use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use std::process::Stdio;
use std::time::Instant;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::time::{timeout, Duration};
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;

use crate::utils::logging::{is_sensitive_key, mask_url_credentials};

#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u128,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// stdout followed by stderr (container logs are split across both).
    pub fn combined(&self) -> String {
        format!("{}{}", self.stdout, self.stderr)
    }

    /// Turn a non-zero exit into an error carrying trimmed stderr.
    pub fn ensure_success(self, what: &str) -> Result<Self> {
        if self.success() {
            return Ok(self);
        }
        let detail = if self.stderr.trim().is_empty() {
            self.stdout.trim().to_string()
        } else {
            self.stderr.trim().to_string()
        };
        anyhow::bail!("{} failed (exit_code={:?}): {}", what, self.exit_code, detail)
    }
}

pub(crate) fn mask_arg_for_log(arg: &str) -> String {
    let lower = arg.to_ascii_lowercase();
    if lower.contains("password=") || lower.contains("pwd=") || lower.contains("token=") {
        return "***".to_string();
    }

    if arg.contains("://") && arg.contains('@') {
        return mask_url_credentials(arg);
    }

    // `KEY=VALUE` env assignments (docker run -e ...).
    if let Some((key, _)) = arg.split_once('=') {
        if is_sensitive_key(key) {
            return format!("{}=***", key);
        }
    }

    arg.to_string()
}

fn is_transient_exec_error(e: &anyhow::Error) -> bool {
    let msg = e.to_string().to_ascii_lowercase();
    msg.contains("timed out")
        || msg.contains("timeout")
        || msg.contains("temporarily")
        || msg.contains("temporary")
        || msg.contains("resource")
        || msg.contains("i/o")
        || msg.contains("io error")
}

/// Run a command once, bounded by `timeout_dur`, without retries.
///
/// Returns captured stdout/stderr even when exit code is non-zero (caller decides success).
pub async fn run_cmd_once(
    program: &str,
    args: &[String],
    timeout_dur: Duration,
    operation: &str,
) -> Result<CommandOutput> {
    let started = Instant::now();

    debug!(
        "[PHASE: tooling] [STEP: cmd] run_cmd_once entered (operation={}, program={}, args=[{}], timeout_ms={})",
        operation,
        program,
        args.iter().map(|a| mask_arg_for_log(a)).collect::<Vec<_>>().join(", "),
        timeout_dur.as_millis()
    );

    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn().with_context(|| {
        format!(
            "Failed to spawn command '{}' (operation={})",
            program, operation
        )
    })?;

    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow::anyhow!("Failed to capture stdout (operation={})", operation))?;
    let mut stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow::anyhow!("Failed to capture stderr (operation={})", operation))?;

    let stdout_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        stdout.read_to_end(&mut buf).await?;
        Ok::<String, std::io::Error>(String::from_utf8_lossy(&buf).to_string())
    });
    let stderr_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        stderr.read_to_end(&mut buf).await?;
        Ok::<String, std::io::Error>(String::from_utf8_lossy(&buf).to_string())
    });

    let status = match timeout(timeout_dur, child.wait()).await {
        Ok(Ok(s)) => s,
        Ok(Err(e)) => {
            return Err(anyhow::Error::new(e)).with_context(|| {
                format!(
                    "Command wait failed (operation={}, program={})",
                    operation, program
                )
            });
        }
        Err(_) => {
            warn!(
                "[PHASE: tooling] [STEP: cmd] Timeout reached (operation={}, program={}, timeout_ms={}); killing process",
                operation,
                program,
                timeout_dur.as_millis()
            );
            if let Err(e) = child.kill().await {
                warn!(
                    "[PHASE: tooling] [STEP: cmd] Failed to kill timed-out process (operation={}, program={}): {}",
                    operation, program, e
                );
            }
            let _ = timeout(Duration::from_secs(5), child.wait()).await;

            anyhow::bail!(
                "Command timed out after {}ms (operation={}, program={})",
                timeout_dur.as_millis(),
                operation,
                program
            );
        }
    };

    let stdout_str = stdout_task
        .await
        .context("stdout join failed")?
        .context("stdout read failed")?;
    let stderr_str = stderr_task
        .await
        .context("stderr join failed")?
        .context("stderr read failed")?;

    let out = CommandOutput {
        exit_code: status.code(),
        stdout: stdout_str,
        stderr: stderr_str,
        duration_ms: started.elapsed().as_millis(),
    };

    debug!(
        "[PHASE: tooling] [STEP: cmd] run_cmd_once exit (operation={}, program={}, exit_code={:?}, duration_ms={}, stdout_len={}, stderr_len={})",
        operation,
        program,
        out.exit_code,
        out.duration_ms,
        out.stdout.len(),
        out.stderr.len()
    );

    Ok(out)
}

/// Run an external command with a timeout and up to 3 retries for transient failures.
///
/// Only use for idempotent commands. Returns captured output even when the exit code is non-zero.
pub async fn run_cmd_with_timeout(
    program: &str,
    args: &[String],
    timeout_dur: Duration,
    operation: &str,
) -> Result<CommandOutput> {
    let started = Instant::now();
    debug!(
        "[PHASE: tooling] [STEP: cmd] run_cmd_with_timeout entered (operation={}, program={}, args_count={}, timeout_ms={})",
        operation,
        program,
        args.len(),
        timeout_dur.as_millis()
    );

    let program_owned = program.to_string();
    let args_owned = args.to_vec();
    let operation_owned = operation.to_string();

    let attempt = move || {
        let program = program_owned.clone();
        let args = args_owned.clone();
        let op = operation_owned.clone();
        async move { run_cmd_once(&program, &args, timeout_dur, &op).await }
    };

    let retry_strategy = ExponentialBackoff::from_millis(200)
        .factor(2)
        .max_delay(Duration::from_secs(2))
        .take(3)
        .map(jitter);

    let result = RetryIf::spawn(retry_strategy, attempt, |e: &anyhow::Error| {
        let transient = is_transient_exec_error(e);
        if transient {
            warn!(
                "[PHASE: tooling] [STEP: cmd] Transient command failure detected; will retry (operation={}, program={}, err={})",
                operation,
                program,
                e
            );
        }
        transient
    })
    .await;

    match &result {
        Ok(out) => {
            info!(
                "[PHASE: tooling] [STEP: cmd] {} finished (exit_code={:?}, duration_ms={})",
                operation,
                out.exit_code,
                started.elapsed().as_millis()
            );
        }
        Err(e) => {
            error!(
                "[PHASE: tooling] [STEP: cmd] {} failed (program={}, duration_ms={}, err={:#})",
                operation,
                program,
                started.elapsed().as_millis(),
                e
            );
        }
    }

    result
}
