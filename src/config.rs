use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/mail/filter-rspamd.yaml";
pub const DEFAULT_RSPAMD_URL: &str = "http://localhost:11333/checkv2";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// rspamd `/checkv2` endpoint.
    pub rspamd_url: String,
    /// Per-request timeout. Unset means wait as long as rspamd takes.
    pub timeout_seconds: Option<u64>,
    /// Upper bound on scans in flight across all sessions.
    pub max_concurrent_scans: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            rspamd_url: DEFAULT_RSPAMD_URL.to_string(),
            timeout_seconds: None,
            max_concurrent_scans: 64,
        }
    }
}

impl Config {
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("parsing configuration file {path}"))?;
        Ok(config)
    }

    pub fn to_file(&self, path: &str) -> anyhow::Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Check the settings and return the parsed endpoint.
    pub fn validate(&self) -> anyhow::Result<Url> {
        let url = Url::parse(&self.rspamd_url)
            .with_context(|| format!("invalid rspamd_url {:?}", self.rspamd_url))?;
        if !matches!(url.scheme(), "http" | "https") {
            anyhow::bail!("rspamd_url must be http or https, got {}", url.scheme());
        }
        if self.max_concurrent_scans == 0 {
            anyhow::bail!("max_concurrent_scans must be at least 1");
        }
        Ok(url)
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_seconds.map(Duration::from_secs)
    }
}
