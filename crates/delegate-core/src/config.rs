//! Process-wide configuration snapshot.
//!
//! Built once at boot by layering: schema defaults < config file
//! (`~/.delegate/config.json`) < environment variables. The snapshot is
//! immutable afterwards; components receive it by reference. The save and
//! reset operations mutate only the config-file layer -- the running
//! process never hot-reloads.
//!
//! An invalid lower layer never shadows a valid upper one: when the fully
//! merged result fails validation, the loader retries with environment
//! over defaults alone, and failing that falls back to pure defaults.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::DelegateError;

/// Log verbosity, settable via `LOG_LEVEL`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

impl FromStr for LogLevel {
    type Err = LogLevelParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            other => Err(LogLevelParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`LogLevel`] string.
#[derive(Debug, Clone)]
pub struct LogLevelParseError(pub String);

impl fmt::Display for LogLevelParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid log level: {:?}", self.0)
    }
}

impl std::error::Error for LogLevelParseError {}

// ---------------------------------------------------------------------------

const GIB: u64 = 1024 * 1024 * 1024;

/// The immutable configuration snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DelegateConfig {
    /// Default wall-time limit for a task, in milliseconds.
    pub task_timeout_ms: u64,
    /// Per-task output buffer cap, in bytes.
    pub max_output_buffer: u64,
    /// CPU cores that must stay unclaimed by workers.
    pub cpu_cores_reserved: u32,
    /// Free memory that must remain before a spawn, in bytes.
    pub memory_reserve: u64,
    pub log_level: LogLevel,
    pub max_listeners_per_event: usize,
    pub max_total_subscriptions: usize,
    /// Grace between SIGTERM and SIGKILL, in milliseconds.
    pub kill_grace_period_ms: u64,
    pub resource_monitor_interval_ms: u64,
    /// Minimum gap between two worker spawns, in milliseconds.
    pub min_spawn_delay_ms: u64,
    /// Window after a spawn in which the new worker's load is assumed not
    /// yet visible in CPU metrics.
    pub settling_window_ms: u64,
    pub event_request_timeout_ms: u64,
    pub event_cleanup_interval_ms: u64,
    /// Output larger than this spills to a sidecar file at persist time.
    pub file_storage_threshold_bytes: u64,
    pub retry_initial_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub task_retention_days: u32,
    pub max_queue_size: usize,
    pub schedule_check_interval_ms: u64,
    pub missed_run_grace_period_ms: u64,
    pub database_path: PathBuf,
}

impl Default for DelegateConfig {
    fn default() -> Self {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        Self {
            task_timeout_ms: 300_000,
            max_output_buffer: 10 * 1024 * 1024,
            cpu_cores_reserved: 2,
            memory_reserve: GIB,
            log_level: LogLevel::Info,
            max_listeners_per_event: 100,
            max_total_subscriptions: 1000,
            kill_grace_period_ms: 5_000,
            resource_monitor_interval_ms: 5_000,
            min_spawn_delay_ms: 10_000,
            settling_window_ms: 15_000,
            event_request_timeout_ms: 5_000,
            event_cleanup_interval_ms: 30_000,
            file_storage_threshold_bytes: 100 * 1024,
            retry_initial_delay_ms: 1_000,
            retry_max_delay_ms: 30_000,
            task_retention_days: 30,
            max_queue_size: 1000,
            schedule_check_interval_ms: 1_000,
            missed_run_grace_period_ms: 60_000,
            database_path: home.join(".delegate/tasks.db"),
        }
    }
}

/// One layer of overrides; every field optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConfigOverlay {
    pub task_timeout_ms: Option<u64>,
    pub max_output_buffer: Option<u64>,
    pub cpu_cores_reserved: Option<u32>,
    pub memory_reserve: Option<u64>,
    pub log_level: Option<LogLevel>,
    pub max_listeners_per_event: Option<usize>,
    pub max_total_subscriptions: Option<usize>,
    pub kill_grace_period_ms: Option<u64>,
    pub resource_monitor_interval_ms: Option<u64>,
    pub min_spawn_delay_ms: Option<u64>,
    pub settling_window_ms: Option<u64>,
    pub event_request_timeout_ms: Option<u64>,
    pub event_cleanup_interval_ms: Option<u64>,
    pub file_storage_threshold_bytes: Option<u64>,
    pub retry_initial_delay_ms: Option<u64>,
    pub retry_max_delay_ms: Option<u64>,
    pub task_retention_days: Option<u32>,
    pub max_queue_size: Option<usize>,
    pub schedule_check_interval_ms: Option<u64>,
    pub missed_run_grace_period_ms: Option<u64>,
    pub database_path: Option<PathBuf>,
}

impl DelegateConfig {
    /// The config file location: `$HOME/.delegate/config.json`.
    pub fn config_file_path() -> PathBuf {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        home.join(".delegate/config.json")
    }

    /// Load the layered snapshot from the default file location and the
    /// process environment. Never fails; invalid layers degrade as
    /// documented on the module.
    pub fn load() -> Self {
        Self::load_from(&Self::config_file_path())
    }

    /// Load with an explicit config file path (test support).
    pub fn load_from(file: &Path) -> Self {
        let file_overlay = match read_file_overlay(file) {
            Ok(overlay) => overlay,
            Err(e) => {
                warn!(path = %file.display(), error = %e, "ignoring unreadable config file");
                None
            }
        };
        let env_overlay = env_overlay();

        let mut merged = Self::default();
        if let Some(overlay) = &file_overlay {
            merged.apply(overlay);
        }
        merged.apply(&env_overlay);
        if merged.validate().is_ok() {
            return merged;
        }
        warn!("merged configuration failed validation; retrying with environment only");

        let mut env_only = Self::default();
        env_only.apply(&env_overlay);
        if env_only.validate().is_ok() {
            return env_only;
        }
        warn!("environment configuration failed validation; falling back to defaults");

        Self::default()
    }

    /// Apply one overlay on top of this snapshot.
    pub fn apply(&mut self, overlay: &ConfigOverlay) {
        macro_rules! take {
            ($field:ident) => {
                if let Some(v) = &overlay.$field {
                    self.$field = v.clone();
                }
            };
        }
        take!(task_timeout_ms);
        take!(max_output_buffer);
        take!(cpu_cores_reserved);
        take!(memory_reserve);
        take!(log_level);
        take!(max_listeners_per_event);
        take!(max_total_subscriptions);
        take!(kill_grace_period_ms);
        take!(resource_monitor_interval_ms);
        take!(min_spawn_delay_ms);
        take!(settling_window_ms);
        take!(event_request_timeout_ms);
        take!(event_cleanup_interval_ms);
        take!(file_storage_threshold_bytes);
        take!(retry_initial_delay_ms);
        take!(retry_max_delay_ms);
        take!(task_retention_days);
        take!(max_queue_size);
        take!(schedule_check_interval_ms);
        take!(missed_run_grace_period_ms);
        take!(database_path);
    }

    /// Validate every numeric bound.
    pub fn validate(&self) -> Result<(), DelegateError> {
        fn bound<T: PartialOrd + fmt::Display + Copy>(
            name: &str,
            value: T,
            min: T,
            max: T,
        ) -> Result<(), DelegateError> {
            if value < min || value > max {
                return Err(DelegateError::InvalidInput(format!(
                    "{name} = {value} out of bounds [{min}, {max}]"
                )));
            }
            Ok(())
        }

        bound("taskTimeoutMs", self.task_timeout_ms, 1_000, 3_600_000)?;
        bound("maxOutputBuffer", self.max_output_buffer, 1024, GIB)?;
        bound("cpuCoresReserved", self.cpu_cores_reserved, 1, 32)?;
        bound("memoryReserve", self.memory_reserve, 0, 64 * GIB)?;
        bound(
            "maxListenersPerEvent",
            self.max_listeners_per_event,
            1,
            10_000,
        )?;
        bound(
            "maxTotalSubscriptions",
            self.max_total_subscriptions,
            1,
            100_000,
        )?;
        bound("killGracePeriodMs", self.kill_grace_period_ms, 100, 300_000)?;
        bound(
            "resourceMonitorIntervalMs",
            self.resource_monitor_interval_ms,
            10,
            600_000,
        )?;
        bound("minSpawnDelayMs", self.min_spawn_delay_ms, 0, 600_000)?;
        bound("settlingWindowMs", self.settling_window_ms, 0, 600_000)?;
        bound(
            "eventRequestTimeoutMs",
            self.event_request_timeout_ms,
            10,
            600_000,
        )?;
        bound(
            "eventCleanupIntervalMs",
            self.event_cleanup_interval_ms,
            100,
            3_600_000,
        )?;
        bound(
            "fileStorageThresholdBytes",
            self.file_storage_threshold_bytes,
            1024,
            GIB,
        )?;
        bound("retryInitialDelayMs", self.retry_initial_delay_ms, 1, 600_000)?;
        bound("retryMaxDelayMs", self.retry_max_delay_ms, 1, 3_600_000)?;
        bound("taskRetentionDays", self.task_retention_days, 1, 3650)?;
        bound("maxQueueSize", self.max_queue_size, 1, 1_000_000)?;
        bound(
            "scheduleCheckIntervalMs",
            self.schedule_check_interval_ms,
            10,
            600_000,
        )?;
        bound(
            "missedRunGracePeriodMs",
            self.missed_run_grace_period_ms,
            0,
            86_400_000,
        )?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Layers
// ---------------------------------------------------------------------------

fn read_file_overlay(path: &Path) -> Result<Option<ConfigOverlay>> {
    if !path.exists() {
        return Ok(None);
    }
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    let overlay: ConfigOverlay =
        serde_json::from_str(&contents).context("failed to parse config file")?;
    Ok(Some(overlay))
}

/// Build the environment-variable layer.
///
/// Numeric variables parse as base-10 integers; a parse failure logs a
/// warning and leaves that field to the lower layers.
pub fn env_overlay() -> ConfigOverlay {
    fn num<T: FromStr>(var: &str) -> Option<T> {
        let raw = std::env::var(var).ok()?;
        match raw.trim().parse() {
            Ok(v) => Some(v),
            Err(_) => {
                warn!(var, value = %raw, "ignoring unparseable environment variable");
                None
            }
        }
    }

    ConfigOverlay {
        task_timeout_ms: num("TASK_TIMEOUT"),
        max_output_buffer: num("MAX_OUTPUT_BUFFER"),
        cpu_cores_reserved: num("CPU_CORES_RESERVED"),
        memory_reserve: num("MEMORY_RESERVE"),
        log_level: std::env::var("LOG_LEVEL")
            .ok()
            .and_then(|raw| match raw.parse() {
                Ok(level) => Some(level),
                Err(_) => {
                    warn!(value = %raw, "ignoring invalid LOG_LEVEL");
                    None
                }
            }),
        max_listeners_per_event: num("EVENTBUS_MAX_LISTENERS_PER_EVENT"),
        max_total_subscriptions: num("EVENTBUS_MAX_TOTAL_SUBSCRIPTIONS"),
        kill_grace_period_ms: num("PROCESS_KILL_GRACE_PERIOD_MS"),
        resource_monitor_interval_ms: num("RESOURCE_MONITOR_INTERVAL_MS"),
        min_spawn_delay_ms: num("WORKER_MIN_SPAWN_DELAY_MS"),
        settling_window_ms: num("WORKER_SETTLING_WINDOW_MS"),
        event_request_timeout_ms: num("EVENT_REQUEST_TIMEOUT_MS"),
        event_cleanup_interval_ms: num("EVENT_CLEANUP_INTERVAL_MS"),
        file_storage_threshold_bytes: num("FILE_STORAGE_THRESHOLD_BYTES"),
        retry_initial_delay_ms: num("RETRY_INITIAL_DELAY_MS"),
        retry_max_delay_ms: num("RETRY_MAX_DELAY_MS"),
        task_retention_days: num("TASK_RETENTION_DAYS"),
        max_queue_size: None,
        schedule_check_interval_ms: None,
        missed_run_grace_period_ms: None,
        database_path: std::env::var("DELEGATE_DATABASE_PATH").ok().map(PathBuf::from),
    }
}

// ---------------------------------------------------------------------------
// File-layer mutation
// ---------------------------------------------------------------------------

/// Set one key in the config file, creating the file if needed.
///
/// Idempotent: writing the same value twice leaves the same file.
pub fn save_config_value(path: &Path, key: &str, value: serde_json::Value) -> Result<()> {
    let mut map = read_config_map(path)?;
    map.insert(key.to_string(), value);
    write_config_map(path, &map)
}

/// Remove one key from the config file. Succeeds when the key (or the
/// whole file) is absent.
pub fn reset_config_value(path: &Path, key: &str) -> Result<()> {
    if !path.exists() {
        return Ok(());
    }
    let mut map = read_config_map(path)?;
    if map.remove(key).is_none() {
        return Ok(());
    }
    write_config_map(path, &map)
}

fn read_config_map(path: &Path) -> Result<BTreeMap<String, serde_json::Value>> {
    if !path.exists() {
        return Ok(BTreeMap::new());
    }
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    serde_json::from_str(&contents).context("config file is not a JSON object")
}

fn write_config_map(path: &Path, map: &BTreeMap<String, serde_json::Value>) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create config directory {}", parent.display()))?;
    }
    let contents = serde_json::to_string_pretty(map).context("failed to serialize config")?;
    std::fs::write(path, contents)
        .with_context(|| format!("failed to write config file at {}", path.display()))?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_pass_validation() {
        DelegateConfig::default().validate().unwrap();
    }

    #[test]
    fn file_layer_overrides_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.json");
        std::fs::write(&path, r#"{"taskTimeoutMs": 60000, "cpuCoresReserved": 4}"#).unwrap();

        let config = DelegateConfig::load_from(&path);
        assert_eq!(config.task_timeout_ms, 60_000);
        assert_eq!(config.cpu_cores_reserved, 4);
        // Untouched fields keep their defaults.
        assert_eq!(config.max_queue_size, 1000);
    }

    #[test]
    fn invalid_file_layer_never_shadows_valid_env() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.json");
        // Out of bounds: timeout below 1s.
        std::fs::write(&path, r#"{"taskTimeoutMs": 5}"#).unwrap();

        let config = DelegateConfig::load_from(&path);
        // The merged layer failed validation, so the file value is gone.
        assert_eq!(config.task_timeout_ms, 300_000);
    }

    #[test]
    fn unreadable_file_is_ignored() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.json");
        std::fs::write(&path, "not json at all {{{").unwrap();

        let config = DelegateConfig::load_from(&path);
        assert_eq!(config, DelegateConfig::default());
    }

    #[test]
    fn missing_file_yields_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let config = DelegateConfig::load_from(&tmp.path().join("nope.json"));
        assert_eq!(config, DelegateConfig::default());
    }

    #[test]
    fn save_value_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.json");

        save_config_value(&path, "taskTimeoutMs", serde_json::json!(42_000)).unwrap();
        let first = std::fs::read_to_string(&path).unwrap();
        save_config_value(&path, "taskTimeoutMs", serde_json::json!(42_000)).unwrap();
        let second = std::fs::read_to_string(&path).unwrap();
        assert_eq!(first, second);

        let config = DelegateConfig::load_from(&path);
        assert_eq!(config.task_timeout_ms, 42_000);
    }

    #[test]
    fn reset_value_on_missing_key_succeeds() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.json");

        // No file at all.
        reset_config_value(&path, "taskTimeoutMs").unwrap();

        save_config_value(&path, "cpuCoresReserved", serde_json::json!(8)).unwrap();
        // Key not in file.
        reset_config_value(&path, "taskTimeoutMs").unwrap();
        // Key in file.
        reset_config_value(&path, "cpuCoresReserved").unwrap();
        let config = DelegateConfig::load_from(&path);
        assert_eq!(config.cpu_cores_reserved, 2);
    }

    #[test]
    fn log_level_parse_roundtrip() {
        for level in [
            LogLevel::Debug,
            LogLevel::Info,
            LogLevel::Warn,
            LogLevel::Error,
        ] {
            let parsed: LogLevel = level.to_string().parse().unwrap();
            assert_eq!(level, parsed);
        }
        assert!("verbose".parse::<LogLevel>().is_err());
    }

    #[test]
    fn validate_rejects_out_of_bounds() {
        let mut config = DelegateConfig::default();
        config.cpu_cores_reserved = 64;
        assert!(config.validate().is_err());

        let mut config = DelegateConfig::default();
        config.memory_reserve = 65 * GIB;
        assert!(config.validate().is_err());

        let mut config = DelegateConfig::default();
        config.task_timeout_ms = 500;
        assert!(config.validate().is_err());
    }
}
