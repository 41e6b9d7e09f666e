// Engine configuration
//
// One immutable value built once at startup and passed explicitly into every component.
// Layering (lowest to highest precedence):
//   1. EngineConfig::default()
//   2. TOML file (`--config`, or `<install_dir>/installer.toml` when present)
//   3. Environment variables: STACK_INSTALLER__<FIELD>[__<NESTED>]

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::installation::certificates::SslMode;
use crate::reconcile::validator::MismatchPolicy;

pub const ENV_PREFIX: &str = "STACK_INSTALLER";
pub const DEFAULT_CONFIG_FILE: &str = "installer.toml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Naming prefix shared by containers, volumes, and the compose project.
    pub project_name: String,
    pub install_dir: PathBuf,
    pub descriptor_file: String,
    pub compose_file: String,
    pub backups_to_keep: usize,
    pub images: ImageSelection,
    /// Explicit host ports by logical name; replaces the default/alternate pair.
    pub port_overrides: BTreeMap<String, u16>,
    pub tiers: Vec<TierConfig>,
    pub probe: ProbeConfig,
    pub timeouts: Timeouts,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageSelection {
    pub registry: String,
    pub tag: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    /// Image used for the isolated credential probe; must match the data-tier database.
    pub database_image: String,
    pub data_mount: String,
    pub database_name: String,
    /// Small image used to measure volume usage over a read-only mount.
    pub utility_image: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    pub command_secs: u64,
    pub volume_check_secs: u64,
    pub poll_interval_secs: u64,
    pub tier_health_secs: u64,
    pub probe_secs: u64,
    pub mismatch_retry_delay_secs: u64,
    pub mismatch_max_retries: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TierRole {
    Data,
    Application,
    Edge,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierConfig {
    pub name: String,
    pub role: TierRole,
    pub services: Vec<ServiceConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub name: String,
    #[serde(default)]
    pub signal: HealthSignal,
}

/// Application-level readiness signal checked on top of the container's process state.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HealthSignal {
    #[default]
    None,
    Port {
        port_name: String,
    },
    Http {
        port_name: String,
        path: String,
    },
    LogPattern {
        pattern: String,
    },
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            project_name: "stack".to_string(),
            install_dir: PathBuf::from("/opt/stack"),
            descriptor_file: ".env".to_string(),
            compose_file: "docker-compose.yml".to_string(),
            backups_to_keep: 5,
            images: ImageSelection::default(),
            port_overrides: BTreeMap::new(),
            tiers: default_tiers(),
            probe: ProbeConfig::default(),
            timeouts: Timeouts::default(),
        }
    }
}

impl Default for ImageSelection {
    fn default() -> Self {
        Self {
            registry: "ghcr.io/stack".to_string(),
            tag: "stable".to_string(),
        }
    }
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            database_image: "postgres:16-alpine".to_string(),
            data_mount: "/var/lib/postgresql/data".to_string(),
            database_name: "app".to_string(),
            utility_image: "busybox:1.36".to_string(),
        }
    }
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            command_secs: 120,
            volume_check_secs: 10,
            poll_interval_secs: 3,
            tier_health_secs: 180,
            probe_secs: 60,
            mismatch_retry_delay_secs: 15,
            mismatch_max_retries: 3,
        }
    }
}

fn service(name: &str, signal: HealthSignal) -> ServiceConfig {
    ServiceConfig {
        name: name.to_string(),
        signal,
    }
}

fn port_signal(port_name: &str) -> HealthSignal {
    HealthSignal::Port {
        port_name: port_name.to_string(),
    }
}

pub fn default_tiers() -> Vec<TierConfig> {
    vec![
        TierConfig {
            name: "data".to_string(),
            role: TierRole::Data,
            services: vec![
                service("database", port_signal("database")),
                service("cache", port_signal("cache")),
                service("queue", port_signal("queue")),
            ],
        },
        TierConfig {
            name: "application".to_string(),
            role: TierRole::Application,
            services: vec![
                service(
                    "backend",
                    HealthSignal::Http {
                        port_name: "backend".to_string(),
                        path: "/health".to_string(),
                    },
                ),
                service(
                    "worker",
                    HealthSignal::LogPattern {
                        pattern: r"(?i)worker (ready|started)".to_string(),
                    },
                ),
            ],
        },
        TierConfig {
            name: "edge".to_string(),
            role: TierRole::Edge,
            services: vec![
                service(
                    "frontend",
                    HealthSignal::Http {
                        port_name: "frontend".to_string(),
                        path: "/".to_string(),
                    },
                ),
                service("proxy", port_signal("http")),
            ],
        },
    ]
}

impl EngineConfig {
    /// Load layered configuration. `explicit` must exist when given; the default file under the
    /// install directory is optional.
    pub fn load(explicit: Option<&Path>, install_dir: Option<&Path>) -> Result<Self> {
        let mut base = EngineConfig::default();
        if let Some(dir) = install_dir {
            base.install_dir = dir.to_path_buf();
        }

        let defaults = config::Config::try_from(&base)
            .context("Failed to serialize built-in configuration defaults")?;

        let mut builder = config::Config::builder().add_source(defaults);
        match explicit {
            Some(path) => {
                builder = builder.add_source(config::File::from(path).required(true));
            }
            None => {
                let candidate = base.install_dir.join(DEFAULT_CONFIG_FILE);
                builder = builder.add_source(config::File::from(candidate).required(false));
            }
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );

        let mut cfg: EngineConfig = builder
            .build()
            .context("Failed to build installer configuration")?
            .try_deserialize()
            .context("Invalid installer configuration")?;

        // A CLI-provided install dir wins over file and environment.
        if let Some(dir) = install_dir {
            cfg.install_dir = dir.to_path_buf();
        }
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        crate::utils::validation::validate_project_name(&self.project_name)?;
        if self.tiers.is_empty() {
            anyhow::bail!("Configuration must define at least one service tier");
        }
        if !self.tiers.iter().any(|t| t.role == TierRole::Data) {
            anyhow::bail!("Configuration must define a data tier");
        }
        let mut seen = std::collections::BTreeSet::new();
        for svc in self.tiers.iter().flat_map(|t| t.services.iter()) {
            if !seen.insert(svc.name.as_str()) {
                anyhow::bail!("Service '{}' appears in more than one tier", svc.name);
            }
        }
        if self.timeouts.poll_interval_secs == 0 {
            anyhow::bail!("timeouts.poll_interval_secs must be greater than zero");
        }
        Ok(())
    }

    pub fn descriptor_path(&self) -> PathBuf {
        self.install_dir.join(&self.descriptor_file)
    }

    pub fn compose_path(&self) -> PathBuf {
        self.install_dir.join(&self.compose_file)
    }

    pub fn all_services(&self) -> Vec<String> {
        self.tiers
            .iter()
            .flat_map(|t| t.services.iter().map(|s| s.name.clone()))
            .collect()
    }

    pub fn data_tier_services(&self) -> Vec<String> {
        self.tiers
            .iter()
            .filter(|t| t.role == TierRole::Data)
            .flat_map(|t| t.services.iter().map(|s| s.name.clone()))
            .collect()
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.command_secs)
    }

    pub fn volume_check_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.volume_check_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.timeouts.poll_interval_secs)
    }

    pub fn tier_health_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.tier_health_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.probe_secs)
    }

    pub fn mismatch_retry_delay(&self) -> Duration {
        Duration::from_secs(self.timeouts.mismatch_retry_delay_secs)
    }
}

/// TLS material requested by the caller.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsRequest {
    pub mode: SslMode,
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
}

/// Caller-supplied flags for a single invocation.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub domain: Option<String>,
    pub email: Option<String>,
    pub token: Option<String>,
    pub force: bool,
    pub clean: bool,
    pub non_interactive: bool,
    pub dry_run: bool,
    /// Explicit mismatch policy; when absent the prompter decides.
    pub on_mismatch: Option<MismatchPolicy>,
    pub tls: TlsRequest,
    pub image_tag: Option<String>,
}

/// Immutable per-invocation context handed to every component.
#[derive(Debug, Clone)]
pub struct InstallContext {
    pub config: Arc<EngineConfig>,
    pub options: Arc<RunOptions>,
}

impl InstallContext {
    pub fn new(config: EngineConfig, options: RunOptions) -> Self {
        Self {
            config: Arc::new(config),
            options: Arc::new(options),
        }
    }
}
