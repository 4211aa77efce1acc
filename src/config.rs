//! Configuration management for the fleet
//!
//! Every process reads the same `ApplicationConfig` and uses the sections
//! relevant to its role. Values come from, in increasing precedence:
//! built-in defaults, a TOML file, environment variables, and finally the
//! remote configuration service (see [`crate::client::ConfigServiceClient`]).

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Env var naming the configuration file
pub const CONFIG_ENV: &str = "FLEET_CONFIG";

/// File looked up in the working directory when nothing else is given
pub const DEFAULT_CONFIG_FILE: &str = "fleet.toml";

/// Root configuration
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct ApplicationConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub range_assigner: RangeAssignerConfig,
    #[serde(default)]
    pub router: RouterConfig,
    #[serde(default)]
    pub leaf: LeafConfig,
    #[serde(default)]
    pub mixer: MixerConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP listener settings
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Deadline applied to requests that arrive without `x-deadline-ms`
    #[serde(default = "default_deadline_ms")]
    pub default_deadline_ms: u64,

    /// How long background services get to stop on shutdown
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
}

/// Where the other fleet processes live
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ClusterConfig {
    #[serde(default = "default_zone_id")]
    pub zone_id: String,

    #[serde(default = "default_range_assigner_url")]
    pub range_assigner_url: String,

    #[serde(default = "default_zone_index_url")]
    pub zone_index_url: String,

    /// Remote configuration service; unset disables remote overrides
    #[serde(default)]
    pub config_url: Option<String>,

    /// Recovery log broker base URL; unset selects the in-memory broker
    #[serde(default)]
    pub recovery_log_broker: Option<String>,

    /// Zone mixers a root mixer fans out to
    #[serde(default)]
    pub zone_mixers: Vec<ZoneEndpoint>,

    /// Root mixer the scheduler issues standing queries to
    #[serde(default = "default_root_mixer_url")]
    pub root_mixer_url: String,
}

/// A zone mixer endpoint
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ZoneEndpoint {
    pub zone: String,
    pub url: String,
}

/// Range assigner settings
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RangeAssignerConfig {
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// Missed heartbeats before a leaf is declared dead
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Snapshots kept for delta computation
    #[serde(default = "default_history_len")]
    pub history_len: usize,
}

/// Ingestion router settings
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RouterConfig {
    #[serde(default = "default_max_write_retries")]
    pub max_write_retries: u32,

    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,

    #[serde(default = "default_refresh_interval_secs")]
    pub refresh_interval_secs: u64,
}

/// Leaf store settings
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct LeafConfig {
    /// Address registered with the range assigner; defaults to the bind address
    #[serde(default)]
    pub advertise_addr: Option<String>,

    /// Acknowledge writes only after the recovery log accepted them
    #[serde(default)]
    pub durable_writes: bool,

    #[serde(default = "default_hint_flush_interval_ms")]
    pub hint_flush_interval_ms: u64,

    #[serde(default = "default_assignment_poll_ms")]
    pub assignment_poll_ms: u64,

    /// How long state of a lost range is kept before being dropped
    #[serde(default = "default_grace_period_secs")]
    pub grace_period_secs: u64,

    #[serde(default = "default_max_points_per_write")]
    pub max_points_per_write: usize,

    /// Batches the recovery log writer may hold before writes are shed
    #[serde(default = "default_log_queue_capacity")]
    pub log_queue_capacity: usize,

    #[serde(default = "default_remote_config_poll_secs")]
    pub remote_config_poll_secs: u64,
}

/// Zone and root mixer settings
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct MixerConfig {
    /// Maximum concurrent child calls per query
    #[serde(default = "default_fan_out_limit")]
    pub fan_out_limit: usize,

    #[serde(default = "default_query_timeout_ms")]
    pub query_timeout_ms: u64,
}

/// Where standing-query results go
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SinkKind {
    #[default]
    Log,
    Broker,
}

/// Standing-query scheduler settings
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,

    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    #[serde(default)]
    pub sink: SinkKind,
}

/// Log output settings
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub json: bool,
}

fn default_bind_addr() -> String { "0.0.0.0:8080".to_string() }
fn default_deadline_ms() -> u64 { 5_000 }
fn default_shutdown_timeout_secs() -> u64 { 10 }
fn default_zone_id() -> String { "zone-1".to_string() }
fn default_range_assigner_url() -> String { "http://127.0.0.1:7001".to_string() }
fn default_zone_index_url() -> String { "http://127.0.0.1:7002".to_string() }
fn default_root_mixer_url() -> String { "http://127.0.0.1:7005".to_string() }
fn default_heartbeat_interval_ms() -> u64 { 1_000 }
fn default_failure_threshold() -> u32 { 3 }
fn default_history_len() -> usize { 64 }
fn default_max_write_retries() -> u32 { 3 }
fn default_backoff_base_ms() -> u64 { 50 }
fn default_backoff_max_ms() -> u64 { 1_000 }
fn default_refresh_interval_secs() -> u64 { 10 }
fn default_hint_flush_interval_ms() -> u64 { 250 }
fn default_assignment_poll_ms() -> u64 { 1_000 }
fn default_grace_period_secs() -> u64 { 30 }
fn default_max_points_per_write() -> usize { 10_000 }
fn default_log_queue_capacity() -> usize { 1_024 }
fn default_remote_config_poll_secs() -> u64 { 10 }
fn default_fan_out_limit() -> usize { 16 }
fn default_query_timeout_ms() -> u64 { 5_000 }
fn default_tick_ms() -> u64 { 100 }
fn default_max_concurrent() -> usize { 8 }
fn default_log_level() -> String { "info".to_string() }

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            default_deadline_ms: default_deadline_ms(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
        }
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            zone_id: default_zone_id(),
            range_assigner_url: default_range_assigner_url(),
            zone_index_url: default_zone_index_url(),
            config_url: None,
            recovery_log_broker: None,
            zone_mixers: Vec::new(),
            root_mixer_url: default_root_mixer_url(),
        }
    }
}

impl Default for RangeAssignerConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            failure_threshold: default_failure_threshold(),
            history_len: default_history_len(),
        }
    }
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            max_write_retries: default_max_write_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            refresh_interval_secs: default_refresh_interval_secs(),
        }
    }
}

impl RouterConfig {
    /// Backoff before retry `attempt` (0-based): `min(base * 2^n, max)`
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        Duration::from_millis(
            self.backoff_base_ms
                .saturating_mul(factor)
                .min(self.backoff_max_ms),
        )
    }
}

impl Default for LeafConfig {
    fn default() -> Self {
        Self {
            advertise_addr: None,
            durable_writes: false,
            hint_flush_interval_ms: default_hint_flush_interval_ms(),
            assignment_poll_ms: default_assignment_poll_ms(),
            grace_period_secs: default_grace_period_secs(),
            max_points_per_write: default_max_points_per_write(),
            log_queue_capacity: default_log_queue_capacity(),
            remote_config_poll_secs: default_remote_config_poll_secs(),
        }
    }
}

impl Default for MixerConfig {
    fn default() -> Self {
        Self {
            fan_out_limit: default_fan_out_limit(),
            query_timeout_ms: default_query_timeout_ms(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_ms: default_tick_ms(),
            max_concurrent: default_max_concurrent(),
            sink: SinkKind::Log,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

/// Where a loaded configuration came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    File(PathBuf),
    Defaults,
}

impl ApplicationConfig {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!("failed to read {}: {e}", path.display()))
        })?;
        toml::from_str(&contents).map_err(|e| {
            Error::Configuration(format!("failed to parse {}: {e}", path.display()))
        })
    }

    /// Resolve, load, override from env and validate
    ///
    /// Priority: explicit path, `FLEET_CONFIG`, `./fleet.toml`, defaults.
    /// An explicitly named file that cannot be read is an error; a missing
    /// `./fleet.toml` is not.
    pub fn resolve(explicit: Option<&Path>) -> Result<(Self, ConfigSource)> {
        let named = explicit
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from));

        let (mut config, source) = match named {
            Some(path) => (Self::load(&path)?, ConfigSource::File(path)),
            None => {
                let local = PathBuf::from(DEFAULT_CONFIG_FILE);
                if local.exists() {
                    (Self::load(&local)?, ConfigSource::File(local))
                } else {
                    (Self::default(), ConfigSource::Defaults)
                }
            },
        };

        config.apply_env_overrides()?;
        config.validate().map_err(Error::Configuration)?;
        Ok((config, source))
    }

    /// Apply environment variable overrides
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary lookup (env in production)
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(zone) = lookup("ZONE_ID") {
            self.cluster.zone_id = zone;
        }
        if let Some(url) = lookup("RA_URL") {
            self.cluster.range_assigner_url = url;
        }
        if let Some(url) = lookup("ZIS_URL") {
            self.cluster.zone_index_url = url;
        }
        if let Some(url) = lookup("CONFIG_URL") {
            self.cluster.config_url = Some(url).filter(|u| !u.is_empty());
        }
        if let Some(url) = lookup("RECOVERY_LOG_BROKER") {
            self.cluster.recovery_log_broker = Some(url).filter(|u| !u.is_empty());
        }
        if let Some(addr) = lookup("BIND_ADDR") {
            self.server.bind_addr = addr;
        }
        if let Some(list) = lookup("ZONE_MIXER_URLS") {
            self.cluster.zone_mixers = parse_zone_list(&list)?;
        }
        if let Some(url) = lookup("ROOT_MIXER_URL") {
            self.cluster.root_mixer_url = url;
        }
        if let Some(addr) = lookup("LEAF_ADVERTISE_ADDR") {
            self.leaf.advertise_addr = Some(addr).filter(|a| !a.is_empty());
        }
        if let Some(level) = lookup("RUST_LOG") {
            self.logging.level = level;
        }
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.cluster.zone_id.trim().is_empty() {
            return Err("cluster.zone_id cannot be empty".to_string());
        }
        if self.mixer.fan_out_limit == 0 {
            return Err("mixer.fan_out_limit must be > 0".to_string());
        }
        if self.router.max_write_retries == 0 && self.router.refresh_interval_secs == 0 {
            return Err(
                "router.max_write_retries and router.refresh_interval_secs cannot both be 0"
                    .to_string(),
            );
        }
        if self.range_assigner.heartbeat_interval_ms == 0 {
            return Err("range_assigner.heartbeat_interval_ms must be > 0".to_string());
        }
        if self.range_assigner.failure_threshold == 0 {
            return Err("range_assigner.failure_threshold must be > 0".to_string());
        }
        if self.leaf.max_points_per_write == 0 {
            return Err("leaf.max_points_per_write must be > 0".to_string());
        }
        if self.leaf.log_queue_capacity == 0 {
            return Err("leaf.log_queue_capacity must be > 0".to_string());
        }
        if self.scheduler.tick_ms == 0 || self.scheduler.max_concurrent == 0 {
            return Err("scheduler.tick_ms and scheduler.max_concurrent must be > 0".to_string());
        }
        Ok(())
    }

    /// Address a leaf registers under
    pub fn leaf_advertise_addr(&self) -> String {
        self.leaf
            .advertise_addr
            .clone()
            .unwrap_or_else(|| self.server.bind_addr.clone())
    }

    pub fn default_deadline(&self) -> Duration {
        Duration::from_millis(self.server.default_deadline_ms)
    }
}

/// Parse `zone=url,zone=url` (or bare urls, named `zone-N`)
pub fn parse_zone_list(list: &str) -> Result<Vec<ZoneEndpoint>> {
    list.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .enumerate()
        .map(|(i, entry)| match entry.split_once('=') {
            Some((zone, url)) if !zone.trim().is_empty() && !url.trim().is_empty() => {
                Ok(ZoneEndpoint {
                    zone: zone.trim().to_string(),
                    url: url.trim().to_string(),
                })
            },
            Some(_) => Err(Error::Configuration(format!("bad zone mixer entry '{entry}'"))),
            None => Ok(ZoneEndpoint {
                zone: format!("zone-{}", i + 1),
                url: entry.to_string(),
            }),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = ApplicationConfig::default();
        assert_eq!(config.server.bind_addr, "0.0.0.0:8080");
        assert_eq!(config.range_assigner.failure_threshold, 3);
        assert_eq!(config.router.max_write_retries, 3);
        assert_eq!(config.mixer.fan_out_limit, 16);
        assert_eq!(config.scheduler.sink, SinkKind::Log);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[cluster]
zone_id = "us-east"

[mixer]
fan_out_limit = 4

[scheduler]
sink = "broker"
"#
        )
        .unwrap();

        let config = ApplicationConfig::load(file.path()).unwrap();
        assert_eq!(config.cluster.zone_id, "us-east");
        assert_eq!(config.mixer.fan_out_limit, 4);
        assert_eq!(config.mixer.query_timeout_ms, 5_000);
        assert_eq!(config.scheduler.sink, SinkKind::Broker);
        assert_eq!(config.leaf.grace_period_secs, 30);
    }

    #[test]
    fn test_unparseable_file_is_configuration_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[mixer\nfan_out_limit = ").unwrap();
        assert!(matches!(
            ApplicationConfig::load(file.path()),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn test_overrides() {
        let env: HashMap<&str, &str> = [
            ("ZONE_ID", "eu-west"),
            ("RA_URL", "http://ra:7001"),
            ("ZONE_MIXER_URLS", "a=http://zm-a:1, b=http://zm-b:1"),
            ("LEAF_ADVERTISE_ADDR", "10.0.0.5:9000"),
            ("CONFIG_URL", ""),
        ]
        .into_iter()
        .collect();

        let mut config = ApplicationConfig::default();
        config
            .apply_overrides(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.cluster.zone_id, "eu-west");
        assert_eq!(config.cluster.range_assigner_url, "http://ra:7001");
        assert_eq!(config.cluster.zone_mixers.len(), 2);
        assert_eq!(config.cluster.zone_mixers[1].zone, "b");
        assert_eq!(config.leaf_advertise_addr(), "10.0.0.5:9000");
        assert_eq!(config.cluster.config_url, None);
    }

    #[test]
    fn test_bare_zone_urls_get_names() {
        let zones = parse_zone_list("http://a:1,http://b:1").unwrap();
        assert_eq!(zones[0].zone, "zone-1");
        assert_eq!(zones[1].url, "http://b:1");
        assert!(parse_zone_list("=http://a:1").is_err());
    }

    #[test]
    fn test_validation_rejects_zero_fan_out() {
        let mut config = ApplicationConfig::default();
        config.mixer.fan_out_limit = 0;
        assert!(config.validate().is_err());

        let mut config = ApplicationConfig::default();
        config.cluster.zone_id = " ".to_string();
        assert!(config.validate().is_err());

        let mut config = ApplicationConfig::default();
        config.range_assigner.failure_threshold = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_backoff_is_capped() {
        let router = RouterConfig::default();
        assert_eq!(router.backoff(0), Duration::from_millis(50));
        assert_eq!(router.backoff(2), Duration::from_millis(200));
        assert_eq!(router.backoff(10), Duration::from_millis(1_000));
        assert_eq!(router.backoff(80), Duration::from_millis(1_000));
    }
}
