// Docker CLI + Compose engine
//
// `DockerCli` implements `ContainerEngine` by invoking the `docker` binary (and `docker compose`
// or legacy `docker-compose`). Every compose call is scoped with `-p <project> -f <file>` so
// only this installation's containers are touched. Output parsing is kept in free functions
// so it can be tested without a daemon.

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{debug, info, warn};
use serde::Deserialize;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::engine::{
    ContainerEngine, ContainerState, ContainerSummary, DockerHealth, EphemeralSpec, ServiceStatus,
};
use super::{run_cmd_once, run_cmd_with_timeout, CommandOutput};
use crate::config::EngineConfig;

const DETECT_TIMEOUT: Duration = Duration::from_secs(15);
const LOGS_TIMEOUT: Duration = Duration::from_secs(30);
const EPHEMERAL_LABEL: &str = "stack-installer.ephemeral=true";

/// Docker version information.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DockerVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
    /// Original version string for display/logging.
    pub raw: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ComposeInvocation {
    /// `docker compose` (V2 plugin)
    DockerSubcommand,
    /// `docker-compose` (V1 standalone binary)
    DockerComposeBinary(PathBuf),
}

/// Parse `docker --version` output.
///
/// Expected format: "Docker version 24.0.5, build abcdef"
pub fn parse_docker_version(output: &str) -> Option<DockerVersion> {
    let output = output.trim();
    let version_str = match output.to_lowercase().find("docker version ") {
        Some(pos) => &output[pos + "docker version ".len()..],
        None => output,
    };
    let version_part = version_str
        .split(|c: char| c == ',' || c == ' ' || c == '-')
        .next()?;

    let parts: Vec<&str> = version_part.split('.').collect();
    let major: u32 = parts.first().and_then(|s| s.parse().ok())?;
    let minor: u32 = parts.get(1).and_then(|s| s.parse().ok()).unwrap_or(0);
    let patch: u32 = parts.get(2).and_then(|s| s.parse().ok()).unwrap_or(0);

    Some(DockerVersion {
        major,
        minor,
        patch,
        raw: output.to_string(),
    })
}

/// One line of `docker ps --format '{{json .}}'`.
#[derive(Debug, Deserialize)]
struct PsLine {
    #[serde(rename = "Names", default)]
    names: String,
    #[serde(rename = "State", default)]
    state: String,
    #[serde(rename = "Status", default)]
    status: String,
    #[serde(rename = "Labels", default)]
    labels: String,
    #[serde(rename = "Ports", default)]
    ports: String,
}

fn label_value<'a>(labels: &'a str, name: &str) -> Option<&'a str> {
    labels.split(',').find_map(|kv| {
        let (k, v) = kv.split_once('=')?;
        (k.trim() == name).then(|| v.trim())
    })
}

/// Host ports from a `Ports` column such as `0.0.0.0:5432->5432/tcp, :::5432->5432/tcp`.
pub fn parse_published_ports(ports: &str) -> Vec<u16> {
    let mut out = Vec::new();
    for part in ports.split(',') {
        let Some((host, _)) = part.trim().split_once("->") else {
            continue;
        };
        let Some((_, port)) = host.rsplit_once(':') else {
            continue;
        };
        let range = match port.split_once('-') {
            Some((a, b)) => (a.parse::<u16>().ok(), b.parse::<u16>().ok()),
            None => (port.parse::<u16>().ok(), port.parse::<u16>().ok()),
        };
        if let (Some(start), Some(end)) = range {
            for p in start..=end {
                if !out.contains(&p) {
                    out.push(p);
                }
            }
        }
    }
    out
}

/// Container-level health from a `Status` column such as `Up 2 minutes (healthy)`.
pub fn parse_health_from_status(status: &str) -> Option<DockerHealth> {
    let lower = status.to_ascii_lowercase();
    if lower.contains("(unhealthy)") {
        Some(DockerHealth::Unhealthy)
    } else if lower.contains("(healthy)") {
        Some(DockerHealth::Healthy)
    } else if lower.contains("health: starting") {
        Some(DockerHealth::Starting)
    } else {
        None
    }
}

/// Parse JSON-lines output of `docker ps -a --format '{{json .}}'`. Malformed lines are skipped.
pub fn parse_ps_json_lines(stdout: &str) -> Vec<(ContainerSummary, Option<DockerHealth>)> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .filter_map(|line| match serde_json::from_str::<PsLine>(line) {
            Ok(ps) => Some(ps),
            Err(e) => {
                debug!(
                    "[PHASE: tooling] [STEP: docker] Skipping unparsable ps line: {}",
                    e
                );
                None
            }
        })
        .map(|ps| {
            let summary = ContainerSummary {
                name: ps.names.split(',').next().unwrap_or("").trim().to_string(),
                service: label_value(&ps.labels, "com.docker.compose.service").map(str::to_string),
                state: ContainerState::parse(&ps.state),
                published_ports: parse_published_ports(&ps.ports),
            };
            (summary, parse_health_from_status(&ps.status))
        })
        .collect()
}

/// Kilobytes reported by `du -sk <dir>` (first column), converted to bytes.
pub fn parse_du_output(stdout: &str) -> Option<u64> {
    let first = stdout.lines().find(|l| !l.trim().is_empty())?;
    let kib: u64 = first.split_whitespace().next()?.parse().ok()?;
    Some(kib.saturating_mul(1024))
}

fn is_not_found(stderr: &str) -> bool {
    let lower = stderr.to_ascii_lowercase();
    lower.contains("no such volume")
        || lower.contains("no such container")
        || lower.contains("not found")
}

/// Check if the Docker daemon is reachable by executing `docker info`.
async fn docker_info(docker: &Path) -> Result<CommandOutput> {
    let args = vec![
        "info".to_string(),
        "--format".to_string(),
        "{{.ServerVersion}}".to_string(),
    ];
    run_cmd_with_timeout(&docker.to_string_lossy(), &args, DETECT_TIMEOUT, "docker_info").await
}

/// Detect which compose invocation is available (V2 preferred, V1 fallback).
pub async fn detect_compose_invocation(docker: &Path) -> Result<ComposeInvocation> {
    debug!("[PHASE: preflight] [STEP: docker] detect_compose_invocation: checking V2 (docker compose)");
    let out = run_cmd_once(
        &docker.to_string_lossy(),
        &["compose".to_string(), "version".to_string()],
        DETECT_TIMEOUT,
        "docker_compose_subcommand_version",
    )
    .await;
    if out.as_ref().map(CommandOutput::success).unwrap_or(false) {
        debug!("[PHASE: preflight] [STEP: docker] detect_compose_invocation: using docker compose (V2)");
        return Ok(ComposeInvocation::DockerSubcommand);
    }

    debug!("[PHASE: preflight] [STEP: docker] detect_compose_invocation: V2 not available, checking V1 (docker-compose)");
    if let Ok(bin) = which::which("docker-compose") {
        let out = run_cmd_once(
            &bin.to_string_lossy(),
            &["--version".to_string()],
            DETECT_TIMEOUT,
            "docker_compose_version",
        )
        .await;
        if out.as_ref().map(CommandOutput::success).unwrap_or(false) {
            debug!("[PHASE: preflight] [STEP: docker] detect_compose_invocation: using docker-compose (V1)");
            return Ok(ComposeInvocation::DockerComposeBinary(bin));
        }
    }

    anyhow::bail!("Neither 'docker compose' (V2) nor 'docker-compose' (V1) is available. Please install Docker Compose.");
}

#[derive(Debug, Clone)]
pub struct DockerCli {
    docker: PathBuf,
    compose: ComposeInvocation,
    project: String,
    compose_file: PathBuf,
    command_timeout: Duration,
    utility_image: String,
}

impl DockerCli {
    /// Locate the docker binary and the compose flavour for this configuration.
    pub async fn detect(config: &EngineConfig) -> Result<Self> {
        let docker = which::which("docker")
            .context("Docker CLI not found in PATH. Install Docker Engine and retry.")?;
        let compose = detect_compose_invocation(&docker).await?;
        info!(
            "[PHASE: preflight] [STEP: docker] Using docker at {} with {:?}",
            docker.display(),
            compose
        );
        Ok(Self {
            docker,
            compose,
            project: config.project_name.clone(),
            compose_file: config.compose_path(),
            command_timeout: config.command_timeout(),
            utility_image: config.probe.utility_image.clone(),
        })
    }

    pub fn compose_invocation(&self) -> &ComposeInvocation {
        &self.compose
    }

    pub async fn version(&self) -> Result<DockerVersion> {
        let out = run_cmd_with_timeout(
            &self.docker.to_string_lossy(),
            &["--version".to_string()],
            DETECT_TIMEOUT,
            "docker_version",
        )
        .await?
        .ensure_success("docker --version")?;
        parse_docker_version(&out.stdout)
            .ok_or_else(|| anyhow::anyhow!("Failed to parse docker version from: {}", out.stdout))
    }

    async fn docker(&self, args: Vec<String>, operation: &str) -> Result<CommandOutput> {
        run_cmd_with_timeout(
            &self.docker.to_string_lossy(),
            &args,
            self.command_timeout,
            operation,
        )
        .await
    }

    fn compose_args(&self, subcommand: &[&str]) -> (String, Vec<String>) {
        let mut args = Vec::new();
        let program = match &self.compose {
            ComposeInvocation::DockerSubcommand => {
                args.push("compose".to_string());
                self.docker.to_string_lossy().into_owned()
            }
            ComposeInvocation::DockerComposeBinary(bin) => bin.to_string_lossy().into_owned(),
        };
        args.extend([
            "-p".to_string(),
            self.project.clone(),
            "-f".to_string(),
            self.compose_file.to_string_lossy().into_owned(),
        ]);
        args.extend(subcommand.iter().map(|s| s.to_string()));
        (program, args)
    }

    async fn compose(&self, subcommand: &[&str], timeout: Duration, operation: &str) -> Result<CommandOutput> {
        let (program, args) = self.compose_args(subcommand);
        run_cmd_with_timeout(&program, &args, timeout, operation).await
    }

    async fn ps(&self, filters: &[String], all: bool) -> Result<Vec<(ContainerSummary, Option<DockerHealth>)>> {
        let mut args = vec!["ps".to_string()];
        if all {
            args.push("-a".to_string());
        }
        for f in filters {
            args.push("--filter".to_string());
            args.push(f.clone());
        }
        args.push("--format".to_string());
        args.push("{{json .}}".to_string());
        let out = self.docker(args, "docker_ps").await?.ensure_success("docker ps")?;
        Ok(parse_ps_json_lines(&out.stdout))
    }

    fn project_filter(&self) -> String {
        format!("label=com.docker.compose.project={}", self.project)
    }
}

#[async_trait]
impl ContainerEngine for DockerCli {
    async fn ping(&self) -> Result<()> {
        let out = docker_info(&self.docker).await?;
        if out.success() {
            debug!(
                "[PHASE: preflight] [STEP: docker] Docker daemon reachable (server_version={})",
                out.stdout.trim()
            );
            return Ok(());
        }
        if out.stderr.to_ascii_lowercase().contains("permission denied") {
            warn!("[PHASE: preflight] [STEP: docker] Docker daemon check failed due to permission denied");
        }
        anyhow::bail!("Docker daemon is not reachable: {}", out.stderr.trim())
    }

    async fn list_volumes(&self) -> Result<Vec<String>> {
        let out = self
            .docker(
                vec!["volume".into(), "ls".into(), "--format".into(), "{{.Name}}".into()],
                "docker_volume_ls",
            )
            .await?
            .ensure_success("docker volume ls")?;
        Ok(out
            .stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    async fn volume_usage_bytes(&self, volume: &str, timeout: Duration) -> Result<u64> {
        let args = vec![
            "run".to_string(),
            "--rm".to_string(),
            "--label".to_string(),
            EPHEMERAL_LABEL.to_string(),
            "--network".to_string(),
            "none".to_string(),
            "-v".to_string(),
            format!("{}:/data:ro", volume),
            self.utility_image.clone(),
            "du".to_string(),
            "-sk".to_string(),
            "/data".to_string(),
        ];
        // Single attempt, bounded by the volume-check timeout.
        let out = run_cmd_once(&self.docker.to_string_lossy(), &args, timeout, "volume_usage")
            .await?
            .ensure_success("volume size measurement")?;
        parse_du_output(&out.stdout)
            .ok_or_else(|| anyhow::anyhow!("Unexpected du output for volume {}: {}", volume, out.stdout.trim()))
    }

    async fn remove_volume(&self, volume: &str) -> Result<()> {
        let out = self
            .docker(
                vec!["volume".into(), "rm".into(), volume.to_string()],
                "docker_volume_rm",
            )
            .await?;
        if out.success() || is_not_found(&out.stderr) {
            info!("[PHASE: reconcile] [STEP: teardown] Removed volume {}", volume);
            return Ok(());
        }
        out.ensure_success(&format!("docker volume rm {}", volume))?;
        Ok(())
    }

    async fn list_containers(&self) -> Result<Vec<ContainerSummary>> {
        let rows = self.ps(&[self.project_filter()], true).await?;
        Ok(rows.into_iter().map(|(c, _)| c).collect())
    }

    async fn port_owner(&self, port: u16) -> Result<Option<String>> {
        let rows = self.ps(&[format!("publish={}", port)], false).await?;
        Ok(rows.into_iter().map(|(c, _)| c.name).next())
    }

    async fn start_service(&self, service: &str) -> Result<()> {
        info!("[PHASE: startup] [STEP: start] Starting service {}", service);
        self.compose(
            &["up", "-d", "--no-deps", service],
            self.command_timeout,
            "compose_up",
        )
        .await?
        .ensure_success(&format!("compose up {}", service))?;
        Ok(())
    }

    async fn stop_services(&self, services: &[String]) -> Result<()> {
        let mut sub: Vec<&str> = vec!["stop"];
        sub.extend(services.iter().map(String::as_str));
        self.compose(&sub, self.command_timeout, "compose_stop")
            .await?
            .ensure_success("compose stop")?;
        Ok(())
    }

    async fn remove_stack(&self) -> Result<()> {
        self.compose(&["down", "--remove-orphans"], self.command_timeout, "compose_down")
            .await?
            .ensure_success("compose down")?;
        Ok(())
    }

    async fn service_status(&self, service: &str) -> Result<ServiceStatus> {
        let filters = [
            self.project_filter(),
            format!("label=com.docker.compose.service={}", service),
        ];
        let rows = self.ps(&filters, true).await?;
        // Prefer a running replica when several exist.
        let best = rows
            .iter()
            .find(|(c, _)| c.state.is_running())
            .or_else(|| rows.first());
        Ok(match best {
            Some((c, health)) => ServiceStatus {
                state: c.state,
                health: *health,
            },
            None => ServiceStatus::missing(),
        })
    }

    async fn service_logs(&self, service: &str, tail: u32) -> Result<String> {
        let tail_arg = format!("--tail={}", tail);
        let out = self
            .compose(&["logs", "--no-color", &tail_arg, service], LOGS_TIMEOUT, "compose_logs")
            .await?;
        Ok(out.combined())
    }

    async fn run_ephemeral(&self, spec: &EphemeralSpec) -> Result<String> {
        let name = format!(
            "{}-{}-{}",
            self.project,
            spec.label,
            &uuid::Uuid::new_v4().simple().to_string()[..8]
        );
        let mut args = vec![
            "run".to_string(),
            "-d".to_string(),
            "--name".to_string(),
            name.clone(),
            "--label".to_string(),
            EPHEMERAL_LABEL.to_string(),
        ];
        for (volume, mount, read_only) in &spec.mounts {
            args.push("-v".to_string());
            args.push(if *read_only {
                format!("{}:{}:ro", volume, mount)
            } else {
                format!("{}:{}", volume, mount)
            });
        }
        let env_file = write_env_file(&spec.env)?;
        push_env_file(&mut args, env_file.as_ref().map(|f| f.path()));
        args.push(spec.image.clone());
        args.extend(spec.command.iter().cloned());

        // Single attempt; `docker run -d` is not idempotent.
        let out = run_cmd_once(&self.docker.to_string_lossy(), &args, self.command_timeout, "docker_run_ephemeral")
            .await?
            .ensure_success("docker run")?;
        let id = out.stdout.trim().to_string();
        info!(
            "[PHASE: validate] [STEP: probe] Started ephemeral container {} ({})",
            name,
            &id[..id.len().min(12)]
        );
        Ok(if id.is_empty() { name } else { id })
    }

    async fn exec(
        &self,
        container: &str,
        env: &[(String, String)],
        command: &[String],
        timeout: Duration,
    ) -> Result<CommandOutput> {
        let env_file = write_env_file(env)?;
        let args = exec_args(container, env_file.as_ref().map(|f| f.path()), command);
        run_cmd_once(&self.docker.to_string_lossy(), &args, timeout, "docker_exec").await
    }

    async fn remove_container(&self, container: &str) -> Result<()> {
        let out = self
            .docker(
                vec!["rm".into(), "-f".into(), "-v".into(), container.to_string()],
                "docker_rm",
            )
            .await?;
        if out.success() || is_not_found(&out.stderr) {
            return Ok(());
        }
        out.ensure_success(&format!("docker rm {}", container))?;
        Ok(())
    }
}

/// `KEY=VALUE` lines in docker's env-file format (no quoting, one variable per line).
fn env_file_contents(env: &[(String, String)]) -> Result<String> {
    let mut out = String::new();
    for (k, v) in env {
        if k.contains('=') || k.contains('\n') || v.contains('\n') {
            anyhow::bail!("Environment variable {} cannot be passed through an env file", k);
        }
        out.push_str(k);
        out.push('=');
        out.push_str(v);
        out.push('\n');
    }
    Ok(out)
}

/// Write `env` to an owner-only temp file so values stay off the host process list.
/// The file is deleted when the handle drops.
fn write_env_file(env: &[(String, String)]) -> Result<Option<tempfile::NamedTempFile>> {
    if env.is_empty() {
        return Ok(None);
    }
    let contents = env_file_contents(env)?;
    let mut file = tempfile::Builder::new()
        .prefix("stack-installer-env-")
        .tempfile()
        .context("Failed to create env file")?;
    file.write_all(contents.as_bytes())
        .and_then(|_| file.flush())
        .context("Failed to write env file")?;
    Ok(Some(file))
}

fn push_env_file(args: &mut Vec<String>, env_file: Option<&Path>) {
    if let Some(path) = env_file {
        args.push("--env-file".to_string());
        args.push(path.to_string_lossy().into_owned());
    }
}

fn exec_args(container: &str, env_file: Option<&Path>, command: &[String]) -> Vec<String> {
    let mut args = vec!["exec".to_string()];
    push_env_file(&mut args, env_file);
    args.push(container.to_string());
    args.extend(command.iter().cloned());
    args
}
