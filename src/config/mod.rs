// src/config/mod.rs
pub mod geo;

use anyhow::{anyhow, bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use crate::ingest::types::{FrequencyClass, Source};

pub const ENV_CONFIG_PATH: &str = "INGEST_CONFIG_PATH";
pub const DEFAULT_CONFIG_PATH: &str = "config/ingest.toml";

const ENV_INTERVAL: &str = "PERIODIC_FETCH_INTERVAL";
const ENV_THRESHOLD: &str = "DOWNLOAD_LIMIT_THRESHOLD";
const ENV_DATABASE_URL: &str = "DATABASE_URL";

fn default_database_url() -> String {
    "sqlite:data/feeds.db?mode=rwc".to_string()
}
fn default_base_interval_secs() -> u64 {
    300
}
fn default_high_multiplier() -> u32 {
    1
}
fn default_low_multiplier() -> u32 {
    60
}
fn default_daily_quota_bytes() -> u64 {
    10 * 1024 * 1024 * 1024
}
fn default_soft_threshold() -> f64 {
    0.8
}
fn default_fetch_timeout_secs() -> u64 {
    crate::ingest::fetch::DEFAULT_FETCH_TIMEOUT_SECS
}
fn default_max_parallel_sources() -> usize {
    1
}
fn default_user_agent() -> String {
    format!("jma-feed-ingest/{}", env!("CARGO_PKG_VERSION"))
}

#[derive(Debug, Clone, Deserialize)]
pub struct IngestConfig {
    #[serde(default = "default_database_url")]
    pub database_url: String,
    /// Sleep between passes; also the unit of the throttle intervals.
    #[serde(default = "default_base_interval_secs")]
    pub base_interval_secs: u64,
    #[serde(default = "default_high_multiplier")]
    pub high_multiplier: u32,
    #[serde(default = "default_low_multiplier")]
    pub low_multiplier: u32,
    #[serde(default = "default_daily_quota_bytes")]
    pub daily_quota_bytes: u64,
    /// Detail documents are fetched only while usage is below this share of the quota.
    #[serde(default = "default_soft_threshold")]
    pub soft_threshold: f64,
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,
    #[serde(default = "default_max_parallel_sources")]
    pub max_parallel_sources: usize,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default)]
    pub quota_state_path: Option<PathBuf>,
    #[serde(default)]
    pub retention_days: Option<u32>,
    #[serde(default)]
    pub geo_tables_path: Option<PathBuf>,
    #[serde(default = "default_sources")]
    pub sources: Vec<Source>,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            database_url: default_database_url(),
            base_interval_secs: default_base_interval_secs(),
            high_multiplier: default_high_multiplier(),
            low_multiplier: default_low_multiplier(),
            daily_quota_bytes: default_daily_quota_bytes(),
            soft_threshold: default_soft_threshold(),
            fetch_timeout_secs: default_fetch_timeout_secs(),
            max_parallel_sources: default_max_parallel_sources(),
            user_agent: default_user_agent(),
            quota_state_path: None,
            retention_days: None,
            geo_tables_path: None,
            sources: default_sources(),
        }
    }
}

/// The six JMA publishing feeds: three categories, each in a high- and a
/// low-frequency variant.
pub fn default_sources() -> Vec<Source> {
    const BASE: &str = "https://www.data.jma.go.jp/developer/xml/feed";
    [
        ("extra", "警報・注意報", FrequencyClass::High),
        ("eqvol", "地震・火山", FrequencyClass::High),
        ("other", "その他", FrequencyClass::High),
        ("extra_l", "警報・注意報", FrequencyClass::Low),
        ("eqvol_l", "地震・火山", FrequencyClass::Low),
        ("other_l", "その他", FrequencyClass::Low),
    ]
    .into_iter()
    .map(|(id, category, frequency)| Source {
        id: id.to_string(),
        url: format!("{BASE}/{id}.xml"),
        category: category.to_string(),
        frequency,
    })
    .collect()
}

impl IngestConfig {
    /// Load from an explicit TOML path, then apply env overrides and validate.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading ingest config from {}", path.display()))?;
        let cfg: IngestConfig = toml::from_str(&content)
            .with_context(|| format!("parsing ingest config {}", path.display()))?;
        cfg.finish()
    }

    /// Load using env var + fallbacks:
    /// 1) $INGEST_CONFIG_PATH
    /// 2) config/ingest.toml
    /// 3) built-in defaults
    pub fn load_default() -> Result<Self> {
        if let Ok(p) = std::env::var(ENV_CONFIG_PATH) {
            let pb = PathBuf::from(p);
            if pb.exists() {
                return Self::load_from(&pb);
            } else {
                return Err(anyhow!("{ENV_CONFIG_PATH} points to non-existent path"));
            }
        }
        let default_p = PathBuf::from(DEFAULT_CONFIG_PATH);
        if default_p.exists() {
            return Self::load_from(&default_p);
        }
        Self::default().finish()
    }

    fn finish(mut self) -> Result<Self> {
        self.apply_env_overrides()?;
        self.validate()?;
        Ok(self)
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(v) = std::env::var(ENV_INTERVAL) {
            // Tolerate trailing comments such as "300  # five minutes".
            let first = v.split_whitespace().next().unwrap_or_default();
            self.base_interval_secs = first
                .parse()
                .with_context(|| format!("{ENV_INTERVAL}={v:?} is not a number of seconds"))?;
        }
        if let Ok(v) = std::env::var(ENV_THRESHOLD) {
            self.soft_threshold = v
                .trim()
                .parse()
                .with_context(|| format!("{ENV_THRESHOLD}={v:?} is not a fraction"))?;
        }
        if let Ok(v) = std::env::var(ENV_DATABASE_URL) {
            if !v.trim().is_empty() {
                self.database_url = v.trim().to_string();
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.sources.is_empty() {
            bail!("no sources configured");
        }
        let mut ids = HashSet::new();
        let mut urls = HashSet::new();
        for s in &self.sources {
            if s.id.trim().is_empty() || s.url.trim().is_empty() {
                bail!("source with empty id or url");
            }
            if !ids.insert(s.id.as_str()) {
                bail!("duplicate source id {}", s.id);
            }
            if !urls.insert(s.url.as_str()) {
                bail!("duplicate source url {}", s.url);
            }
        }
        if self.base_interval_secs == 0 {
            bail!("base_interval_secs must be positive");
        }
        if self.high_multiplier == 0 || self.low_multiplier == 0 {
            bail!("frequency multipliers must be positive");
        }
        if self.daily_quota_bytes == 0 {
            bail!("daily_quota_bytes must be positive");
        }
        if !(self.soft_threshold > 0.0 && self.soft_threshold <= 1.0) {
            bail!("soft_threshold must be in (0, 1], got {}", self.soft_threshold);
        }
        if self.fetch_timeout_secs == 0 {
            bail!("fetch_timeout_secs must be positive");
        }
        if self.max_parallel_sources == 0 {
            bail!("max_parallel_sources must be at least 1");
        }
        Ok(())
    }

    pub fn source(&self, id: &str) -> Option<&Source> {
        self.sources.iter().find(|s| s.id == id)
    }
}
