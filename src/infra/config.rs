//! Configuration loading from TOML files
//!
//! Config file is selected via:
//! 1. --config <path> command line argument
//! 2. CONFIG_FILE environment variable
//! 3. Default: config/dev.toml

use crate::domain::{NewFacility, Tariff};
use crate::services::hub::DEFAULT_STALL_TIMEOUT;
use anyhow::Context;
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::warn;

const DEFAULT_CONFIG_PATH: &str = "config/dev.toml";

#[derive(Debug, Clone, Deserialize)]
pub struct SiteConfig {
    /// Site label attached to exported metrics
    #[serde(default = "default_site_id")]
    pub id: String,
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self { id: default_site_id() }
    }
}

fn default_site_id() -> String {
    "parkhub".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// HTTP facade port (0 to disable)
    #[serde(default = "default_http_port")]
    pub http_port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { http_port: default_http_port() }
    }
}

fn default_http_port() -> u16 {
    8080
}

#[derive(Debug, Clone, Deserialize)]
pub struct ObserversConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_observer_port")]
    pub port: u16,
    /// Longest a single delivery may take before the observer is dropped
    #[serde(default = "default_stall_timeout_ms")]
    pub stall_timeout_ms: u64,
}

impl Default for ObserversConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_observer_port(),
            stall_timeout_ms: default_stall_timeout_ms(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_observer_port() -> u16 {
    9090
}

fn default_stall_timeout_ms() -> u64 {
    DEFAULT_STALL_TIMEOUT.as_millis() as u64
}

#[derive(Debug, Clone, Deserialize)]
pub struct BillingConfig {
    /// Tariff kind used to price sessions
    #[serde(default = "default_tariff")]
    pub default_tariff: String,
    /// Hourly rate in minor units when a facility has no such tariff
    #[serde(default = "default_fallback_rate")]
    pub fallback_rate: u64,
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self { default_tariff: default_tariff(), fallback_rate: default_fallback_rate() }
    }
}

fn default_tariff() -> String {
    "hourly".to_string()
}

fn default_fallback_rate() -> u64 {
    250
}

#[derive(Debug, Clone, Deserialize)]
pub struct JournalConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// File path for the ledger journal (JSONL format)
    #[serde(default = "default_journal_file")]
    pub file: String,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self { enabled: true, file: default_journal_file() }
    }
}

fn default_journal_file() -> String {
    "data/ledger.jsonl".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_interval")]
    pub interval_secs: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { interval_secs: default_metrics_interval() }
    }
}

fn default_metrics_interval() -> u64 {
    10
}

/// Facility registered at startup
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FacilitySeed {
    pub name: String,
    #[serde(default)]
    pub latitude: f64,
    #[serde(default)]
    pub longitude: f64,
    /// Defaults to the number of spots
    #[serde(default)]
    pub capacity: Option<u32>,
    #[serde(default)]
    pub spots: Vec<String>,
    #[serde(default)]
    pub tariffs: Vec<Tariff>,
}

impl FacilitySeed {
    pub fn capacity(&self) -> u32 {
        self.capacity.unwrap_or(self.spots.len() as u32)
    }

    pub fn to_new_facility(&self) -> NewFacility {
        NewFacility {
            name: self.name.clone(),
            latitude: self.latitude,
            longitude: self.longitude,
            capacity: self.capacity(),
            tariffs: self.tariffs.clone(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub site: SiteConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub observers: ObserversConfig,
    #[serde(default)]
    pub billing: BillingConfig,
    #[serde(default)]
    pub journal: JournalConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub facilities: Vec<FacilitySeed>,
}

/// Main configuration struct used throughout the application
#[derive(Debug, Clone)]
pub struct Config {
    site_id: String,
    http_port: u16,
    observers_enabled: bool,
    observer_port: u16,
    observer_stall_timeout_ms: u64,
    default_tariff: String,
    fallback_rate: u64,
    journal_enabled: bool,
    journal_file: String,
    metrics_interval_secs: u64,
    facilities: Vec<FacilitySeed>,
    config_file: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::from_toml(TomlConfig::default(), "default".to_string())
    }
}

impl Config {
    fn from_toml(toml_config: TomlConfig, config_file: String) -> Self {
        Self {
            site_id: toml_config.site.id,
            http_port: toml_config.server.http_port,
            observers_enabled: toml_config.observers.enabled,
            observer_port: toml_config.observers.port,
            observer_stall_timeout_ms: toml_config.observers.stall_timeout_ms,
            default_tariff: toml_config.billing.default_tariff,
            fallback_rate: toml_config.billing.fallback_rate,
            journal_enabled: toml_config.journal.enabled,
            journal_file: toml_config.journal.file,
            metrics_interval_secs: toml_config.metrics.interval_secs,
            facilities: toml_config.facilities,
            config_file,
        }
    }

    /// Determine config file path from the command line or environment
    pub fn resolve_config_path(cli_path: Option<&str>) -> String {
        if let Some(path) = cli_path {
            return path.to_string();
        }
        if let Ok(path) = env::var("CONFIG_FILE") {
            return path;
        }
        DEFAULT_CONFIG_PATH.to_string()
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let toml_config: TomlConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        let config = Self::from_toml(toml_config, path.display().to_string());
        config.validate().with_context(|| format!("Invalid config file {}", path.display()))?;
        Ok(config)
    }

    /// Load configuration from a path, falling back to defaults on error
    pub fn load_from_path(path: &str) -> Self {
        match Self::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                warn!(error = %format!("{e:#}"), "config_load_failed_using_defaults");
                Self::default()
            }
        }
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.default_tariff.trim().is_empty() {
            anyhow::bail!("billing.default_tariff must not be empty");
        }
        if self.observer_stall_timeout_ms == 0 {
            anyhow::bail!("observers.stall_timeout_ms must be at least 1");
        }
        for seed in &self.facilities {
            if seed.capacity() == 0 {
                anyhow::bail!("facility {:?} needs a capacity or at least one spot", seed.name);
            }
        }
        Ok(())
    }

    // Getters for all config fields

    pub fn site_id(&self) -> &str {
        &self.site_id
    }

    pub fn http_port(&self) -> u16 {
        self.http_port
    }

    pub fn observers_enabled(&self) -> bool {
        self.observers_enabled
    }

    pub fn observer_port(&self) -> u16 {
        self.observer_port
    }

    pub fn observer_stall_timeout(&self) -> Duration {
        Duration::from_millis(self.observer_stall_timeout_ms)
    }

    pub fn default_tariff(&self) -> &str {
        &self.default_tariff
    }

    pub fn fallback_rate(&self) -> u64 {
        self.fallback_rate
    }

    pub fn journal_enabled(&self) -> bool {
        self.journal_enabled
    }

    pub fn journal_file(&self) -> &str {
        &self.journal_file
    }

    pub fn metrics_interval_secs(&self) -> u64 {
        self.metrics_interval_secs
    }

    pub fn facilities(&self) -> &[FacilitySeed] {
        &self.facilities
    }

    pub fn config_file(&self) -> &str {
        &self.config_file
    }
}
