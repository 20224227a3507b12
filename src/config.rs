use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::application::ApplicationInfo;
use crate::profile::ProfilerKind;

/// Top-level configuration for the profile exporter.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Logging verbosity (trace, debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Process id reported in tags and file names. Default: current process.
    #[serde(default)]
    pub process_id: Option<u32>,

    /// Base tag values attached to every artifact.
    #[serde(default)]
    pub tags: TagsConfig,

    /// Enabled profilers; determines the sample value layout.
    #[serde(default = "default_profilers")]
    pub profilers: Vec<ProfilerKind>,

    /// Service name for applications without configured metadata.
    #[serde(default)]
    pub default_service: String,

    /// Per-application metadata keyed by application identifier.
    #[serde(default)]
    pub applications: HashMap<String, ApplicationInfo>,

    /// Export destination and cadence.
    #[serde(default)]
    pub export: ExportConfig,

    /// Prometheus metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,
}

/// Base tag values.
#[derive(Debug, Clone, Deserialize)]
pub struct TagsConfig {
    /// Runtime family of the instrumented process (e.g. "dotnet").
    #[serde(default)]
    pub language: String,

    /// Host name; omitted from tags when empty.
    #[serde(default)]
    pub host: String,

    /// Profiler version tag. Default: this crate's version.
    #[serde(default = "default_profiler_version")]
    pub profiler_version: String,

    /// Additional user tags, emitted in name order.
    #[serde(default)]
    pub extra: BTreeMap<String, String>,
}

/// Export destination and cadence.
#[derive(Debug, Clone, Deserialize)]
pub struct ExportConfig {
    /// Period of the export scheduler. Default: 60s.
    #[serde(default = "default_export_interval", with = "humantime_serde")]
    pub interval: Duration,

    /// Request timeout for remote delivery. Default: 10s.
    #[serde(default = "default_export_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    /// Full agent base URL; overrides host/port when set.
    #[serde(default)]
    pub agent_url: Option<String>,

    /// Agent host. Default: "localhost".
    #[serde(default = "default_agent_host")]
    pub agent_host: String,

    /// Agent port. Default: 8126.
    #[serde(default = "default_agent_port")]
    pub agent_port: u16,

    /// Send straight to the intake instead of a local agent.
    #[serde(default)]
    pub agentless: bool,

    /// API key, required in agentless mode.
    #[serde(default)]
    pub api_key: String,

    /// Intake site used in agentless mode. Default: "datadoghq.com".
    #[serde(default = "default_site")]
    pub site: String,

    /// Write artifacts to this directory instead of sending them.
    #[serde(default)]
    pub output_dir: Option<PathBuf>,
}

/// Prometheus metrics server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Serve /metrics and /healthz. Default: false.
    #[serde(default)]
    pub enabled: bool,

    /// Listen address. Default: "127.0.0.1:9090".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_profilers() -> Vec<ProfilerKind> {
    vec![ProfilerKind::Walltime, ProfilerKind::Cpu]
}

fn default_profiler_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

fn default_export_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_export_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_agent_host() -> String {
    "localhost".to_string()
}

fn default_agent_port() -> u16 {
    8126
}

fn default_site() -> String {
    "datadoghq.com".to_string()
}

fn default_health_addr() -> String {
    "127.0.0.1:9090".to_string()
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            process_id: None,
            tags: TagsConfig::default(),
            profilers: default_profilers(),
            default_service: String::new(),
            applications: HashMap::new(),
            export: ExportConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

impl Default for TagsConfig {
    fn default() -> Self {
        Self {
            language: String::new(),
            host: String::new(),
            profiler_version: default_profiler_version(),
            extra: BTreeMap::new(),
        }
    }
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            interval: default_export_interval(),
            timeout: default_export_timeout(),
            agent_url: None,
            agent_host: default_agent_host(),
            agent_port: default_agent_port(),
            agentless: false,
            api_key: String::new(),
            site: default_site(),
            output_dir: None,
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            addr: default_health_addr(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        Self::from_yaml(&data).with_context(|| format!("loading config file {}", path.display()))
    }

    /// Parse and validate configuration from YAML text.
    pub fn from_yaml(data: &str) -> Result<Self> {
        let cfg: Config = serde_yaml::from_str(data).context("parsing config")?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Process id used in tags and file names.
    pub fn process_id(&self) -> u32 {
        self.process_id.unwrap_or_else(std::process::id)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.tags.language.trim().is_empty() {
            bail!("tags.language is required");
        }

        if self.profilers.is_empty() {
            bail!("at least one profiler must be enabled");
        }

        for name in self.tags.extra.keys() {
            if name.trim().is_empty() {
                bail!("tags.extra contains an empty tag name");
            }
        }

        if self.export.interval.is_zero() {
            bail!("export.interval must be positive");
        }

        if self.export.timeout.is_zero() {
            bail!("export.timeout must be positive");
        }

        if self.export.output_dir.is_none() {
            if self.export.agentless {
                if self.export.api_key.is_empty() {
                    bail!("export.api_key is required when export.agentless is true");
                }
                if self.export.site.trim().is_empty() {
                    bail!("export.site is required when export.agentless is true");
                }
            } else if self.export.agent_url.is_none() {
                if self.export.agent_host.trim().is_empty() {
                    bail!("export.agent_host is required when no agent_url is set");
                }
                if self.export.agent_port == 0 {
                    bail!("export.agent_port must be positive");
                }
            }
        }

        if self.health.enabled {
            self.health
                .addr
                .parse::<SocketAddr>()
                .with_context(|| format!("invalid health.addr {:?}", self.health.addr))?;
        }

        Ok(())
    }
}
