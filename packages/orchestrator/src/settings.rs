// ABOUTME: Orchestrator settings with defaults and environment overrides
// ABOUTME: Port range, TTL bounds, launcher timeouts, reaper cadence and persistence location

use crate::error::SettingsError;
use crate::types::LauncherKind;
use mockbox_config::constants::*;
use mockbox_config::env::{
    env_list, env_string, parse_env_flag, parse_env_or_default,
    parse_env_or_default_with_validation,
};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_PORT_RANGE_START: u16 = 40000;
pub const DEFAULT_PORT_RANGE_END: u16 = 49999;
pub const DEFAULT_TTL_MINUTES: u64 = 60;
pub const DEFAULT_MAX_TTL_MINUTES: u64 = 24 * 60;
pub const DEFAULT_READINESS_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_STOP_GRACE_PERIOD_MS: u64 = 5_000;
pub const DEFAULT_REAPER_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_PROXY_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_PUBLIC_BASE_URL: &str = "http://localhost:4080";

/// Every tunable of the orchestrator in one place
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub port_range_start: u16,
    pub port_range_end: u16,
    pub default_ttl_minutes: u64,
    pub max_ttl_minutes: u64,
    pub readiness_timeout: Duration,
    pub stop_grace_period: Duration,
    pub reaper_interval: Duration,
    pub proxy_timeout: Duration,
    pub public_base_url: String,
    pub max_sandboxes_per_owner: Option<usize>,
    pub refresh_ttl_on_access: bool,
    pub launcher: LauncherKind,
    /// Program spawned by the process launcher; defaults to the running executable
    pub mock_binary: Option<PathBuf>,
    pub state_dir: PathBuf,
    /// SQLite file backing the registry; `None` keeps everything in memory
    pub database_path: Option<PathBuf>,
    /// Owners allowed to create sandboxes; empty means everyone
    pub allowed_owners: Vec<String>,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            port_range_start: DEFAULT_PORT_RANGE_START,
            port_range_end: DEFAULT_PORT_RANGE_END,
            default_ttl_minutes: DEFAULT_TTL_MINUTES,
            max_ttl_minutes: DEFAULT_MAX_TTL_MINUTES,
            readiness_timeout: Duration::from_millis(DEFAULT_READINESS_TIMEOUT_MS),
            stop_grace_period: Duration::from_millis(DEFAULT_STOP_GRACE_PERIOD_MS),
            reaper_interval: Duration::from_secs(DEFAULT_REAPER_INTERVAL_SECS),
            proxy_timeout: Duration::from_secs(DEFAULT_PROXY_TIMEOUT_SECS),
            public_base_url: DEFAULT_PUBLIC_BASE_URL.to_string(),
            max_sandboxes_per_owner: None,
            refresh_ttl_on_access: true,
            launcher: LauncherKind::InProcess,
            mock_binary: None,
            state_dir: default_state_dir(),
            database_path: None,
            allowed_owners: Vec::new(),
        }
    }
}

impl OrchestratorSettings {
    /// Build settings from `MOCKBOX_*` environment variables on top of the defaults.
    pub fn from_env() -> Result<Self, SettingsError> {
        let defaults = Self::default();

        let launcher = match env_string(MOCKBOX_LAUNCHER) {
            Some(raw) => LauncherKind::from_str(&raw).ok_or(SettingsError::UnknownLauncher(raw))?,
            None => defaults.launcher,
        };

        let max_ttl_minutes = parse_env_or_default_with_validation(
            MOCKBOX_MAX_TTL_MINUTES,
            DEFAULT_MAX_TTL_MINUTES,
            |v| v > 0,
        );

        let settings = Self {
            port_range_start: parse_env_or_default(MOCKBOX_PORT_RANGE_START, DEFAULT_PORT_RANGE_START),
            port_range_end: parse_env_or_default(MOCKBOX_PORT_RANGE_END, DEFAULT_PORT_RANGE_END),
            default_ttl_minutes: parse_env_or_default_with_validation(
                MOCKBOX_DEFAULT_TTL_MINUTES,
                DEFAULT_TTL_MINUTES,
                |v| v <= max_ttl_minutes,
            ),
            max_ttl_minutes,
            readiness_timeout: Duration::from_millis(parse_env_or_default_with_validation(
                MOCKBOX_READINESS_TIMEOUT_MS,
                DEFAULT_READINESS_TIMEOUT_MS,
                |v| (100..=120_000).contains(&v),
            )),
            stop_grace_period: Duration::from_millis(parse_env_or_default_with_validation(
                MOCKBOX_STOP_GRACE_PERIOD_MS,
                DEFAULT_STOP_GRACE_PERIOD_MS,
                |v| v <= 60_000,
            )),
            reaper_interval: Duration::from_secs(
                parse_env_or_default(MOCKBOX_REAPER_INTERVAL_SECS, DEFAULT_REAPER_INTERVAL_SECS)
                    .clamp(10, 300), // Min 10s, max 5 minutes
            ),
            proxy_timeout: Duration::from_secs(parse_env_or_default_with_validation(
                MOCKBOX_PROXY_TIMEOUT_SECS,
                DEFAULT_PROXY_TIMEOUT_SECS,
                |v| v > 0,
            )),
            public_base_url: env_string(MOCKBOX_PUBLIC_BASE_URL)
                .unwrap_or(defaults.public_base_url),
            max_sandboxes_per_owner: env_string(MOCKBOX_MAX_SANDBOXES_PER_OWNER)
                .and_then(|v| v.parse::<usize>().ok())
                .filter(|v| *v > 0),
            refresh_ttl_on_access: parse_env_flag(MOCKBOX_REFRESH_TTL_ON_ACCESS, true),
            launcher,
            mock_binary: env_string(MOCKBOX_MOCK_BINARY).map(PathBuf::from),
            state_dir: env_string(MOCKBOX_STATE_DIR)
                .map(PathBuf::from)
                .unwrap_or(defaults.state_dir),
            database_path: env_string(MOCKBOX_DATABASE_PATH).map(PathBuf::from),
            allowed_owners: env_list(MOCKBOX_ALLOWED_OWNERS),
        };

        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.port_range_start == 0 || self.port_range_start > self.port_range_end {
            return Err(SettingsError::InvalidPortRange {
                start: self.port_range_start,
                end: self.port_range_end,
            });
        }
        Ok(())
    }

    /// Resolve a caller-supplied TTL against the configured default and ceiling.
    pub fn effective_ttl_minutes(&self, requested: Option<i64>) -> Option<u64> {
        match requested {
            None => Some(self.default_ttl_minutes),
            Some(minutes) if minutes < 0 => None,
            Some(minutes) => Some((minutes as u64).min(self.max_ttl_minutes)),
        }
    }
}

fn default_state_dir() -> PathBuf {
    std::env::var(HOME)
        .map(|home| PathBuf::from(home).join(".mockbox"))
        .unwrap_or_else(|_| std::env::temp_dir().join("mockbox"))
}
