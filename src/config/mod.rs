//! Controller configuration, read from the environment (and `.env`).

mod helpers;

use std::net::IpAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono::Utc;
use cron::Schedule;

use crate::error::ConfigError;
use crate::runtime::ResourceLimits;

use helpers::{optional_env, parse_duration_ms_env, parse_list, parse_optional_env, parse_string_env};

/// Every 15 minutes, so the 45 minute inactivity threshold spans several sweeps.
pub const DEFAULT_REAPER_SCHEDULE: &str = "*/15 * * * *";

/// Firings inspected when measuring the longest gap in a schedule.
const SCHEDULE_PROBE_FIRINGS: usize = 16;

/// What every provisioned container looks like.
#[derive(Debug, Clone)]
pub struct LaunchSettings {
    pub image: String,
    /// Port the workload listens on inside the container.
    pub internal_port: u16,
    /// Passed to the workload as `ORIGINS` and used for CORS.
    pub origins: Vec<String>,
    pub limits: ResourceLimits,
    /// Grace period after the awaited reload before a route is handed out.
    pub settle: Duration,
}

impl Default for LaunchSettings {
    fn default() -> Self {
        Self {
            image: "runner-prod".to_string(),
            internal_port: 5000,
            origins: Vec::new(),
            limits: ResourceLimits::default(),
            settle: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProxySettings {
    pub conf_dir: PathBuf,
    /// Host nginx forwards to; the container's port is bound there.
    pub upstream_host: String,
    pub reload_command: String,
    pub debounce: Duration,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            conf_dir: PathBuf::from("/etc/nginx/conf.d"),
            upstream_host: "host.docker.internal".to_string(),
            reload_command: "nginx -s reload".to_string(),
            debounce: crate::proxy::DEFAULT_DEBOUNCE,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReaperSettings {
    pub schedule: Schedule,
    pub inactivity: Duration,
}

impl ReaperSettings {
    /// Parse `expression` and check `inactivity` against it.
    pub fn new(expression: &str, inactivity: Duration) -> Result<Self, ConfigError> {
        let schedule = parse_schedule(expression)?;
        validate_inactivity(&schedule, inactivity)?;
        Ok(Self {
            schedule,
            inactivity,
        })
    }
}

#[derive(Debug, Clone)]
pub struct HttpSettings {
    pub bind_addr: IpAddr,
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub pool_size: usize,
    /// `None` selects the in-memory store.
    pub database_url: Option<String>,
    pub launch: LaunchSettings,
    pub proxy: ProxySettings,
    pub reaper: ReaperSettings,
    pub http: HttpSettings,
}

impl ControllerConfig {
    /// Load `.env` (if present) and resolve every setting.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        Self::resolve()
    }

    fn resolve() -> Result<Self, ConfigError> {
        let defaults = LaunchSettings::default();
        let memory_mb: i64 = parse_optional_env("CONTAINER_MEMORY_MB", 1024)?;
        let launch = LaunchSettings {
            image: parse_string_env("RUNNER_IMAGE", &defaults.image)?,
            internal_port: parse_optional_env("RUNNER_INTERNAL_PORT", defaults.internal_port)?,
            origins: optional_env("ORIGINS")?
                .map(|raw| parse_list(&raw))
                .unwrap_or_default(),
            limits: ResourceLimits {
                memory_bytes: memory_mb.saturating_mul(1024 * 1024),
                cpu_shares: parse_optional_env("CONTAINER_CPU_SHARES", defaults.limits.cpu_shares)?,
                pids_limit: parse_optional_env("CONTAINER_PIDS_LIMIT", defaults.limits.pids_limit)?,
                restart_max_retries: parse_optional_env(
                    "CONTAINER_RESTART_RETRIES",
                    defaults.limits.restart_max_retries,
                )?,
            },
            settle: parse_duration_ms_env("RELOAD_SETTLE_MS", defaults.settle)?,
        };
        if memory_mb <= 0 {
            return Err(ConfigError::InvalidValue {
                key: "CONTAINER_MEMORY_MB".to_string(),
                message: "must be positive".to_string(),
            });
        }

        let proxy_defaults = ProxySettings::default();
        let proxy = ProxySettings {
            conf_dir: optional_env("NGINX_CONF_DIR")?
                .map(PathBuf::from)
                .unwrap_or(proxy_defaults.conf_dir),
            upstream_host: parse_string_env("UPSTREAM_HOST", &proxy_defaults.upstream_host)?,
            reload_command: parse_string_env(
                "NGINX_RELOAD_COMMAND",
                &proxy_defaults.reload_command,
            )?,
            debounce: parse_duration_ms_env("RELOAD_DEBOUNCE_MS", proxy_defaults.debounce)?,
        };

        let inactivity_minutes: u64 = parse_optional_env("REAPER_INACTIVITY_MINUTES", 45)?;
        let reaper = ReaperSettings::new(
            &parse_string_env("REAPER_SCHEDULE", DEFAULT_REAPER_SCHEDULE)?,
            inactivity_from_minutes(inactivity_minutes)?,
        )?;

        let http = HttpSettings {
            bind_addr: parse_optional_env("BIND_ADDR", IpAddr::from([0, 0, 0, 0]))?,
            port: parse_optional_env("PORT", 1337)?,
        };

        Ok(Self {
            pool_size: parse_optional_env("CONTAINER_POOL_SIZE", 2)?,
            database_url: optional_env("DATABASE_URL")?,
            launch,
            proxy,
            reaper,
            http,
        })
    }
}

/// Parse a cron expression. Five-field expressions get a `0` seconds field.
pub fn parse_schedule(expression: &str) -> Result<Schedule, ConfigError> {
    let expression = expression.trim();
    let normalized = if expression.split_whitespace().count() == 5 {
        format!("0 {}", expression)
    } else {
        expression.to_string()
    };
    Schedule::from_str(&normalized).map_err(|e| ConfigError::InvalidValue {
        key: "REAPER_SCHEDULE".to_string(),
        message: format!("{:?}: {}", expression, e),
    })
}

/// Longest gap between consecutive upcoming firings, if it fires at least twice.
pub fn max_firing_gap(schedule: &Schedule) -> Option<Duration> {
    let firings: Vec<_> = schedule
        .upcoming(Utc)
        .take(SCHEDULE_PROBE_FIRINGS)
        .collect();
    firings
        .windows(2)
        .filter_map(|pair| (pair[1] - pair[0]).to_std().ok())
        .max()
}

/// Allocations must survive at least one full sweep period before they can
/// be reaped.
fn inactivity_from_minutes(minutes: u64) -> Result<Duration, ConfigError> {
    minutes
        .checked_mul(60)
        .map(Duration::from_secs)
        .ok_or_else(|| ConfigError::InvalidValue {
            key: "REAPER_INACTIVITY_MINUTES".to_string(),
            message: format!("{} minutes is too large", minutes),
        })
}

fn validate_inactivity(schedule: &Schedule, inactivity: Duration) -> Result<(), ConfigError> {
    let Some(gap) = max_firing_gap(schedule) else {
        return Err(ConfigError::InvalidValue {
            key: "REAPER_SCHEDULE".to_string(),
            message: "schedule does not fire repeatedly".to_string(),
        });
    };
    if inactivity <= gap {
        return Err(ConfigError::InvalidValue {
            key: "REAPER_INACTIVITY_MINUTES".to_string(),
            message: format!(
                "inactivity threshold ({}s) must exceed the sweep period ({}s)",
                inactivity.as_secs(),
                gap.as_secs()
            ),
        });
    }
    Ok(())
}
