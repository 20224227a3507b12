use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use reqwest::Url;

use crate::config::ExportConfig;

/// Path appended to the agent base URL, relative so a proxy prefix survives.
const AGENT_PROFILE_PATH: &str = "profiling/v1/input";

/// Where exported artifacts go. Resolved once when the exporter is built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// Remote collector reached with one POST per artifact.
    Http {
        url: Url,
        /// Sent as `DD-API-KEY` in agentless mode.
        api_key: Option<String>,
        timeout: Duration,
    },
    /// Local directory receiving one file per artifact.
    Disk { directory: PathBuf },
}

impl Endpoint {
    /// Resolves the delivery target.
    ///
    /// An output directory wins over everything else and is created here.
    /// Agentless mode targets the intake for `site`, otherwise the local agent.
    pub fn resolve(cfg: &ExportConfig) -> Result<Self> {
        if let Some(directory) = &cfg.output_dir {
            std::fs::create_dir_all(directory).with_context(|| {
                format!("creating profile output directory {}", directory.display())
            })?;
            return Ok(Self::Disk {
                directory: directory.clone(),
            });
        }

        if cfg.timeout.is_zero() {
            bail!("export timeout must be positive");
        }

        if cfg.agentless {
            if cfg.api_key.is_empty() {
                bail!("an API key is required for agentless export");
            }
            if cfg.site.trim().is_empty() {
                bail!("a site is required for agentless export");
            }
            let raw = format!("https://intake.profile.{}/api/v2/profile", cfg.site.trim());
            let url = Url::parse(&raw).with_context(|| format!("invalid intake URL {raw:?}"))?;
            return Ok(Self::Http {
                url,
                api_key: Some(cfg.api_key.clone()),
                timeout: cfg.timeout,
            });
        }

        let base = match &cfg.agent_url {
            Some(agent_url) => agent_url.clone(),
            None => format!("http://{}:{}", cfg.agent_host, cfg.agent_port),
        };
        let mut url = Url::parse(&base).with_context(|| format!("invalid agent URL {base:?}"))?;
        if !url.path().ends_with('/') {
            let dir = format!("{}/", url.path());
            url.set_path(&dir);
        }
        let url = url
            .join(AGENT_PROFILE_PATH)
            .with_context(|| format!("invalid agent URL {base:?}"))?;

        Ok(Self::Http {
            url,
            api_key: None,
            timeout: cfg.timeout,
        })
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Http {
                url,
                api_key,
                timeout,
            } => write!(
                f,
                "http {url} (timeout {}ms, {})",
                timeout.as_millis(),
                if api_key.is_some() { "agentless" } else { "agent" }
            ),
            Self::Disk { directory } => write!(f, "disk {}", directory.display()),
        }
    }
}
