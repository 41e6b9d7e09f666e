// In-memory capability stubs for unit tests.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use crate::config::TlsRequest;
use crate::error::InstallResult;
use crate::installation::certificates::{CertificatePaths, CertificateProvider, SslMode};
use crate::installation::engine::{
    ContainerEngine, ContainerState, ContainerSummary, EphemeralSpec, ServiceStatus,
};
use crate::installation::CommandOutput;
use crate::prompt::Prompter;
use crate::reconcile::ports::PortProber;
use crate::reconcile::validator::{MismatchPolicy, ValidationReport};

#[derive(Debug, Clone, Default)]
pub struct StubState {
    pub reachable: bool,
    /// Volume name -> usage; `None` makes measurement fail.
    pub volumes: BTreeMap<String, Option<u64>>,
    pub containers: Vec<ContainerSummary>,
    pub port_owners: BTreeMap<u16, String>,
    /// Status reported for a service once started.
    pub statuses: BTreeMap<String, ServiceStatus>,
    pub logs: BTreeMap<String, String>,
    pub exec_results: VecDeque<CommandOutput>,
    pub remove_volume_error: Option<String>,
    pub start_error: BTreeMap<String, String>,
    /// Service that comes up once the first container is removed.
    pub start_on_container_removal: Option<String>,

    pub started: Vec<String>,
    pub stopped: Vec<Vec<String>>,
    pub stack_removed: bool,
    pub removed_volumes: Vec<String>,
    pub removed_containers: Vec<String>,
    pub ephemeral: Vec<EphemeralSpec>,
    pub execs: Vec<(String, Vec<String>)>,
}

pub struct StubEngine {
    state: Mutex<StubState>,
}

impl Default for StubEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl StubEngine {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(StubState {
                reachable: true,
                ..Default::default()
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, StubState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn edit(self, f: impl FnOnce(&mut StubState)) -> Self {
        f(&mut self.lock());
        self
    }

    pub fn unreachable(self) -> Self {
        self.edit(|s| s.reachable = false)
    }

    pub fn with_volume(self, name: &str, bytes: u64) -> Self {
        self.edit(|s| {
            s.volumes.insert(name.to_string(), Some(bytes));
        })
    }

    pub fn with_unmeasurable_volume(self, name: &str) -> Self {
        self.edit(|s| {
            s.volumes.insert(name.to_string(), None);
        })
    }

    pub fn with_running(self, service: &str) -> Self {
        self.edit(|s| {
            s.containers.push(ContainerSummary {
                name: format!("stack-{}-1", service),
                service: Some(service.to_string()),
                state: ContainerState::Running,
                published_ports: Vec::new(),
            })
        })
    }

    /// The stack's `service` starts once a throwaway container has been removed.
    pub fn starting_after_removal(self, service: &str) -> Self {
        self.edit(|s| s.start_on_container_removal = Some(service.to_string()))
    }

    pub fn with_port_owner(self, port: u16, container: &str) -> Self {
        self.edit(|s| {
            s.port_owners.insert(port, container.to_string());
        })
    }

    pub fn with_status(self, service: &str, status: ServiceStatus) -> Self {
        self.edit(|s| {
            s.statuses.insert(service.to_string(), status);
        })
    }

    pub fn with_state(self, service: &str, state: ContainerState) -> Self {
        self.with_status(service, ServiceStatus { state, health: None })
    }

    pub fn with_logs(self, service: &str, logs: &str) -> Self {
        self.edit(|s| {
            s.logs.insert(service.to_string(), logs.to_string());
        })
    }

    /// Queue the result of the next `exec` call.
    pub fn with_exec(self, out: CommandOutput) -> Self {
        self.edit(|s| s.exec_results.push_back(out))
    }

    pub fn failing_volume_removal(self, message: &str) -> Self {
        self.edit(|s| s.remove_volume_error = Some(message.to_string()))
    }

    pub fn failing_start(self, service: &str, message: &str) -> Self {
        self.edit(|s| {
            s.start_error.insert(service.to_string(), message.to_string());
        })
    }

    pub fn snapshot(&self) -> StubState {
        self.lock().clone()
    }

    fn check_reachable(&self) -> Result<()> {
        if self.lock().reachable {
            Ok(())
        } else {
            anyhow::bail!("Cannot connect to the Docker daemon at unix:///var/run/docker.sock")
        }
    }
}

#[async_trait]
impl ContainerEngine for StubEngine {
    async fn ping(&self) -> Result<()> {
        self.check_reachable()
    }

    async fn list_volumes(&self) -> Result<Vec<String>> {
        self.check_reachable()?;
        Ok(self.lock().volumes.keys().cloned().collect())
    }

    async fn volume_usage_bytes(&self, volume: &str, _timeout: Duration) -> Result<u64> {
        self.check_reachable()?;
        match self.lock().volumes.get(volume) {
            Some(Some(bytes)) => Ok(*bytes),
            Some(None) => anyhow::bail!("Command timed out after 10000ms (operation=volume_usage)"),
            None => anyhow::bail!("no such volume: {}", volume),
        }
    }

    async fn remove_volume(&self, volume: &str) -> Result<()> {
        self.check_reachable()?;
        let mut s = self.lock();
        if let Some(msg) = &s.remove_volume_error {
            anyhow::bail!("{}", msg);
        }
        s.volumes.remove(volume);
        s.removed_volumes.push(volume.to_string());
        Ok(())
    }

    async fn list_containers(&self) -> Result<Vec<ContainerSummary>> {
        self.check_reachable()?;
        Ok(self.lock().containers.clone())
    }

    async fn port_owner(&self, port: u16) -> Result<Option<String>> {
        self.check_reachable()?;
        Ok(self.lock().port_owners.get(&port).cloned())
    }

    async fn start_service(&self, service: &str) -> Result<()> {
        self.check_reachable()?;
        let mut s = self.lock();
        if let Some(msg) = s.start_error.get(service) {
            anyhow::bail!("{}", msg.clone());
        }
        s.started.push(service.to_string());
        Ok(())
    }

    async fn stop_services(&self, services: &[String]) -> Result<()> {
        self.check_reachable()?;
        self.lock().stopped.push(services.to_vec());
        Ok(())
    }

    async fn remove_stack(&self) -> Result<()> {
        self.check_reachable()?;
        let mut s = self.lock();
        s.stack_removed = true;
        s.containers.clear();
        Ok(())
    }

    async fn service_status(&self, service: &str) -> Result<ServiceStatus> {
        self.check_reachable()?;
        let s = self.lock();
        if let Some(status) = s.statuses.get(service) {
            return Ok(*status);
        }
        if s.started.iter().any(|x| x == service) {
            return Ok(ServiceStatus {
                state: ContainerState::Running,
                health: None,
            });
        }
        Ok(s.containers
            .iter()
            .find(|c| c.service.as_deref() == Some(service))
            .map(|c| ServiceStatus {
                state: c.state,
                health: None,
            })
            .unwrap_or_else(ServiceStatus::missing))
    }

    async fn service_logs(&self, service: &str, _tail: u32) -> Result<String> {
        self.check_reachable()?;
        Ok(self.lock().logs.get(service).cloned().unwrap_or_default())
    }

    async fn run_ephemeral(&self, spec: &EphemeralSpec) -> Result<String> {
        self.check_reachable()?;
        let mut s = self.lock();
        s.ephemeral.push(spec.clone());
        Ok(format!("ephemeral-{}", s.ephemeral.len()))
    }

    async fn exec(
        &self,
        container: &str,
        _env: &[(String, String)],
        command: &[String],
        _timeout: Duration,
    ) -> Result<CommandOutput> {
        self.check_reachable()?;
        let mut s = self.lock();
        s.execs.push((container.to_string(), command.to_vec()));
        Ok(s.exec_results.pop_front().unwrap_or(CommandOutput {
            exit_code: Some(2),
            stdout: String::new(),
            stderr: "no response".to_string(),
            duration_ms: 0,
        }))
    }

    async fn remove_container(&self, container: &str) -> Result<()> {
        self.check_reachable()?;
        let mut s = self.lock();
        s.removed_containers.push(container.to_string());
        if let Some(service) = s.start_on_container_removal.take() {
            s.containers.push(ContainerSummary {
                name: format!("stack-{}-1", service),
                service: Some(service),
                state: ContainerState::Running,
                published_ports: Vec::new(),
            });
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct StubProber {
    occupied: BTreeSet<u16>,
}

impl StubProber {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn occupied(mut self, port: u16) -> Self {
        self.occupied.insert(port);
        self
    }
}

#[async_trait]
impl PortProber for StubProber {
    async fn is_available(&self, port: u16) -> bool {
        !self.occupied.contains(&port)
    }
}

pub struct ScriptedPrompter {
    interactive: bool,
    regenerate: bool,
    policies: Mutex<VecDeque<MismatchPolicy>>,
    regenerate_prompts: Mutex<u32>,
    policy_prompts: Mutex<u32>,
}

impl ScriptedPrompter {
    fn with_mode(interactive: bool) -> Self {
        Self {
            interactive,
            regenerate: false,
            policies: Mutex::new(VecDeque::new()),
            regenerate_prompts: Mutex::new(0),
            policy_prompts: Mutex::new(0),
        }
    }

    pub fn interactive() -> Self {
        Self::with_mode(true)
    }

    pub fn non_interactive() -> Self {
        Self::with_mode(false)
    }

    pub fn with_regenerate(mut self, answer: bool) -> Self {
        self.regenerate = answer;
        self
    }

    /// Queue an answer for the next mismatch prompt (defaults to abort when empty).
    pub fn with_policy(self, policy: MismatchPolicy) -> Self {
        self.policies
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(policy);
        self
    }

    pub fn regenerate_prompts(&self) -> u32 {
        *self.regenerate_prompts.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn policy_prompts(&self) -> u32 {
        *self.policy_prompts.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl Prompter for ScriptedPrompter {
    fn is_interactive(&self) -> bool {
        self.interactive
    }

    async fn confirm_regenerate(&self, _question: &str) -> Result<bool> {
        *self.regenerate_prompts.lock().unwrap_or_else(|e| e.into_inner()) += 1;
        Ok(self.regenerate)
    }

    async fn choose_mismatch_policy(&self, _report: &ValidationReport) -> Result<MismatchPolicy> {
        *self.policy_prompts.lock().unwrap_or_else(|e| e.into_inner()) += 1;
        Ok(self
            .policies
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
            .unwrap_or(MismatchPolicy::Abort))
    }
}

/// Certificate provider that never touches the filesystem.
#[derive(Default)]
pub struct StubCertificates {
    ensured: Mutex<u32>,
}

impl StubCertificates {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ensured(&self) -> u32 {
        *self.ensured.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl CertificateProvider for StubCertificates {
    fn planned(&self, domain: &str, request: &TlsRequest) -> CertificatePaths {
        match request.mode {
            SslMode::Disabled => CertificatePaths::disabled(),
            mode => CertificatePaths {
                mode,
                cert: Some(request.cert.clone().unwrap_or_else(|| format!("/certs/{}.crt", domain).into())),
                key: Some(request.key.clone().unwrap_or_else(|| format!("/certs/{}.key", domain).into())),
            },
        }
    }

    async fn ensure(&self, domain: &str, request: &TlsRequest) -> InstallResult<CertificatePaths> {
        *self.ensured.lock().unwrap_or_else(|e| e.into_inner()) += 1;
        Ok(self.planned(domain, request))
    }
}
