//! Settings for the volumetry service.
//!
//! Configuration resolves in three layers: compiled defaults, an optional
//! TOML file, then per-key environment overrides. Evaluation order for the
//! file: `$VOLUMETRY_CONFIG_PATH`, then `volumetry.toml` /
//! `config/volumetry.toml` in the working directory, then defaults.

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context};
use regex::Regex;
use serde::{Deserialize, Serialize};

mod overrides;

pub use overrides::apply_env_overrides;

/// Source that produced the settings.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SettingsSource {
    #[default]
    Default,
    EnvPath(PathBuf),
    File(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub server: ServerSettings,
    pub scan: ScanSettings,
    pub cache: CacheSettings,
    pub events: EventSettings,
    pub persistence: PersistenceSettings,
    pub oracle: OracleSettings,
    pub volumes: VolumeSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerSettings::default(),
            scan: ScanSettings::default(),
            cache: CacheSettings::default(),
            events: EventSettings::default(),
            persistence: PersistenceSettings::default(),
            oracle: OracleSettings::default(),
            volumes: VolumeSettings::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    pub cors_allowed_origins: Vec<String>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            cors_allowed_origins: vec!["http://localhost:5173".to_string()],
        }
    }
}

/// Scheduler and engine tuning. Raise `concurrency` to drain the volume
/// inventory faster; raise `max_concurrent_scans` only if the disks can take
/// the extra parallel walkers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanSettings {
    pub enabled: bool,
    /// Periodic tick period, seconds.
    pub interval_secs: u64,
    /// Scheduler worker count.
    pub concurrency: usize,
    /// Engine per-scan deadline, seconds.
    pub timeout_per_volume_secs: u64,
    /// Ordered method preference; the first available method wins.
    pub methods_order: Vec<String>,
    /// Volume-name regex to skip at admission.
    pub skip_pattern: Option<String>,
    pub bind_mounts_enabled: bool,
    /// Path prefixes bind mounts must fall under to be admitted.
    pub bind_allow_list: Vec<String>,
    /// Engine-wide cap on concurrent scans, independent of `concurrency`.
    pub max_concurrent_scans: usize,
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 3_600,
            concurrency: 2,
            timeout_per_volume_secs: 300,
            methods_order: vec![
                "fast".to_string(),
                "portable".to_string(),
                "native".to_string(),
            ],
            skip_pattern: None,
            bind_mounts_enabled: false,
            bind_allow_list: Vec::new(),
            max_concurrent_scans: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub ttl_secs: u64,
    pub max_size: usize,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            ttl_secs: 300,
            max_size: 1_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventSettings {
    pub enabled: bool,
    /// Full reconciliation period, seconds.
    pub reconcile_interval_secs: u64,
}

impl Default for EventSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            reconcile_interval_secs: 300,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceSettings {
    /// `postgres://...` for the relational backend, `memory:` for the
    /// embedded in-process backend.
    pub dsn: String,
    pub max_conns: u32,
    pub timeout_secs: u64,
}

impl Default for PersistenceSettings {
    fn default() -> Self {
        Self {
            dsn: "memory:".to_string(),
            max_conns: 10,
            timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OracleSettings {
    /// Base URL of the container host API, e.g. `http://localhost:2375`.
    pub endpoint: String,
    pub timeout_secs: u64,
}

impl Default for OracleSettings {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:2375".to_string(),
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumeSettings {
    /// Names matching this pattern are classified as system volumes, in
    /// addition to the anonymous 64-hex form.
    pub system_pattern: Option<String>,
}

impl Default for VolumeSettings {
    fn default() -> Self {
        Self {
            system_pattern: Some("^(buildx_|builder_|registry_)".to_string()),
        }
    }
}

impl Settings {
    /// Load settings: file layer (if any), then environment overrides, then
    /// validation.
    pub fn load() -> anyhow::Result<(Self, SettingsSource)> {
        let (mut settings, source) = Self::load_file_layer()?;
        apply_env_overrides(&mut settings)?;
        settings.validate()?;
        Ok((settings, source))
    }

    fn load_file_layer() -> anyhow::Result<(Self, SettingsSource)> {
        if let Ok(path_str) = env::var("VOLUMETRY_CONFIG_PATH") {
            if !path_str.trim().is_empty() {
                let path = PathBuf::from(path_str);
                let settings = Self::load_from_file(&path)?;
                return Ok((settings, SettingsSource::EnvPath(path)));
            }
        }

        if let Some(path) = Self::find_default_file() {
            let settings = Self::load_from_file(&path)?;
            return Ok((settings, SettingsSource::File(path)));
        }

        Ok((Self::default(), SettingsSource::Default))
    }

    pub fn load_from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {}", path.display()))?;
        toml::from_str(&contents)
            .map_err(|err| anyhow!("invalid config {}: {}", path.display(), err))
    }

    fn find_default_file() -> Option<PathBuf> {
        const CANDIDATES: &[&str] = &["volumetry.toml", "config/volumetry.toml"];

        CANDIDATES
            .iter()
            .map(Path::new)
            .find(|path| path.exists())
            .map(|path| path.to_path_buf())
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.scan.concurrency == 0 {
            return Err(anyhow!("scan.concurrency must be at least 1"));
        }
        if self.scan.max_concurrent_scans == 0 {
            return Err(anyhow!("scan.max_concurrent_scans must be at least 1"));
        }
        if self.scan.methods_order.is_empty() {
            return Err(anyhow!("scan.methods_order must not be empty"));
        }
        for method in &self.scan.methods_order {
            if !matches!(method.as_str(), "fast" | "portable" | "native") {
                return Err(anyhow!("unknown scan method in methods_order: {method}"));
            }
        }
        if let Some(pattern) = &self.scan.skip_pattern {
            Regex::new(pattern)
                .map_err(|err| anyhow!("scan.skip_pattern is not a valid regex: {err}"))?;
        }
        if let Some(pattern) = &self.volumes.system_pattern {
            Regex::new(pattern)
                .map_err(|err| anyhow!("volumes.system_pattern is not a valid regex: {err}"))?;
        }
        if self.cache.max_size == 0 {
            return Err(anyhow!("cache.max_size must be at least 1"));
        }
        if self.persistence.dsn.is_empty() {
            return Err(anyhow!("persistence.dsn must be set"));
        }
        Ok(())
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan.interval_secs)
    }

    pub fn scan_timeout(&self) -> Duration {
        Duration::from_secs(self.scan.timeout_per_volume_secs)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache.ttl_secs)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.events.reconcile_interval_secs)
    }

    pub fn skip_regex(&self) -> Option<Regex> {
        self.scan
            .skip_pattern
            .as_deref()
            .and_then(|p| Regex::new(p).ok())
    }

    pub fn system_regex(&self) -> Option<Regex> {
        self.volumes
            .system_pattern
            .as_deref()
            .and_then(|p| Regex::new(p).ok())
    }
}
