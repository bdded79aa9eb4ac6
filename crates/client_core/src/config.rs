use std::{
    collections::HashMap,
    fs,
    path::Path,
    str::FromStr,
    time::Duration,
};

use anyhow::{Context, Result};
use serde::Deserialize;
use shared::domain::DeviceType;
use uuid::Uuid;

use crate::{
    connection::{ConnectionConfig, ReconnectPolicy},
    heartbeat::{HeartbeatConfig, DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_MISSED_THRESHOLD},
    message_window::DEFAULT_PAGE_SIZE,
};

pub const DEFAULT_CONFIG_FILE: &str = "client.toml";
const ENV_PREFIX: &str = "APP__";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub server_url: String,
    /// Derived from `server_url` when unset.
    pub ws_url: Option<String>,
    pub database_url: String,
    pub device_id: String,
    pub device_type: DeviceType,
    pub heartbeat_interval_secs: u64,
    pub heartbeat_missed_threshold: u32,
    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    pub max_reconnect_attempts: u32,
    pub page_size: u32,
}

impl Default for Settings {
    fn default() -> Self {
        let reconnect = ReconnectPolicy::default();
        Self {
            server_url: "http://127.0.0.1:8080".into(),
            ws_url: None,
            database_url: "sqlite://./data/client.db".into(),
            device_id: Uuid::new_v4().to_string(),
            device_type: DeviceType::default(),
            heartbeat_interval_secs: DEFAULT_HEARTBEAT_INTERVAL.as_secs(),
            heartbeat_missed_threshold: DEFAULT_MISSED_THRESHOLD,
            reconnect_base_delay_ms: reconnect.base_delay.as_millis() as u64,
            reconnect_max_delay_ms: reconnect.max_delay.as_millis() as u64,
            max_reconnect_attempts: reconnect.max_attempts,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

/// Keys accepted in `client.toml`; anything left out keeps its default.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileSettings {
    server_url: Option<String>,
    ws_url: Option<String>,
    database_url: Option<String>,
    device_id: Option<String>,
    device_type: Option<String>,
    heartbeat_interval_secs: Option<u64>,
    heartbeat_missed_threshold: Option<u32>,
    reconnect_base_delay_ms: Option<u64>,
    reconnect_max_delay_ms: Option<u64>,
    max_reconnect_attempts: Option<u32>,
    page_size: Option<u32>,
}

fn parse_env<T>(env: &HashMap<String, String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let name = format!("{ENV_PREFIX}{key}");
    let Some(raw) = env.get(&name) else {
        return Ok(None);
    };
    raw.trim()
        .parse::<T>()
        .map(Some)
        .map_err(|err| anyhow::anyhow!("invalid {name}={raw:?}: {err}"))
}

fn overlay<T>(target: &mut T, value: Option<T>) {
    if let Some(value) = value {
        *target = value;
    }
}

impl Settings {
    /// Defaults, then the TOML file contents, then `APP__*` variables.
    pub fn from_sources(file: Option<&str>, env: &HashMap<String, String>) -> Result<Self> {
        let mut settings = Self::default();

        if let Some(raw) = file {
            let file: FileSettings = toml::from_str(raw).context("invalid client config file")?;
            overlay(&mut settings.server_url, file.server_url);
            if file.ws_url.is_some() {
                settings.ws_url = file.ws_url;
            }
            overlay(&mut settings.database_url, file.database_url);
            overlay(&mut settings.device_id, file.device_id);
            if let Some(raw) = file.device_type {
                settings.device_type = raw
                    .parse()
                    .with_context(|| format!("invalid device_type {raw:?} in config file"))?;
            }
            overlay(&mut settings.heartbeat_interval_secs, file.heartbeat_interval_secs);
            overlay(
                &mut settings.heartbeat_missed_threshold,
                file.heartbeat_missed_threshold,
            );
            overlay(&mut settings.reconnect_base_delay_ms, file.reconnect_base_delay_ms);
            overlay(&mut settings.reconnect_max_delay_ms, file.reconnect_max_delay_ms);
            overlay(&mut settings.max_reconnect_attempts, file.max_reconnect_attempts);
            overlay(&mut settings.page_size, file.page_size);
        }

        overlay(&mut settings.server_url, parse_env(env, "SERVER_URL")?);
        if let Some(ws_url) = parse_env::<String>(env, "WS_URL")? {
            settings.ws_url = Some(ws_url);
        }
        overlay(&mut settings.database_url, parse_env(env, "DATABASE_URL")?);
        overlay(&mut settings.device_id, parse_env(env, "DEVICE_ID")?);
        overlay(&mut settings.device_type, parse_env(env, "DEVICE_TYPE")?);
        overlay(
            &mut settings.heartbeat_interval_secs,
            parse_env(env, "HEARTBEAT_INTERVAL_SECS")?,
        );
        overlay(
            &mut settings.heartbeat_missed_threshold,
            parse_env(env, "HEARTBEAT_MISSED_THRESHOLD")?,
        );
        overlay(
            &mut settings.reconnect_base_delay_ms,
            parse_env(env, "RECONNECT_BASE_DELAY_MS")?,
        );
        overlay(
            &mut settings.reconnect_max_delay_ms,
            parse_env(env, "RECONNECT_MAX_DELAY_MS")?,
        );
        overlay(
            &mut settings.max_reconnect_attempts,
            parse_env(env, "MAX_RECONNECT_ATTEMPTS")?,
        );
        overlay(&mut settings.page_size, parse_env(env, "PAGE_SIZE")?);

        settings.database_url = normalize_database_url(&settings.database_url);
        if settings.heartbeat_interval_secs == 0 {
            anyhow::bail!("heartbeat interval must be at least one second");
        }
        if settings.page_size == 0 {
            anyhow::bail!("page size must be positive");
        }
        Ok(settings)
    }

    /// Reads `path` (or `client.toml` when present) and the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(path) => Some(
                fs::read_to_string(path)
                    .with_context(|| format!("failed to read config file '{}'", path.display()))?,
            ),
            None => fs::read_to_string(DEFAULT_CONFIG_FILE).ok(),
        };
        let env: HashMap<String, String> = std::env::vars()
            .filter(|(key, _)| key.starts_with(ENV_PREFIX))
            .collect();
        Self::from_sources(file.as_deref(), &env)
    }

    pub fn ws_url(&self) -> String {
        if let Some(ws_url) = &self.ws_url {
            return ws_url.clone();
        }
        let base = self.server_url.trim_end_matches('/');
        let base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            base.to_string()
        };
        format!("{base}/ws")
    }

    pub fn heartbeat(&self) -> HeartbeatConfig {
        HeartbeatConfig {
            interval: Duration::from_secs(self.heartbeat_interval_secs),
            missed_threshold: self.heartbeat_missed_threshold,
        }
    }

    pub fn reconnect(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            base_delay: Duration::from_millis(self.reconnect_base_delay_ms),
            max_delay: Duration::from_millis(self.reconnect_max_delay_ms),
            max_attempts: self.max_reconnect_attempts,
        }
    }

    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            ws_url: self.ws_url(),
            device_id: self.device_id.clone(),
            device_type: self.device_type,
            heartbeat: self.heartbeat(),
            reconnect: self.reconnect(),
        }
    }
}

/// Accepts bare paths and `sqlite:` shorthands as well as full sqlx urls.
pub fn normalize_database_url(raw: &str) -> String {
    let raw = raw.trim();
    if raw.is_empty() {
        return "sqlite://./data/client.db".to_string();
    }
    if raw.starts_with("sqlite::memory:") || raw.contains("://") {
        return raw.to_string();
    }
    if let Some(path) = raw.strip_prefix("sqlite:") {
        return format!("sqlite://{}", path.replace('\\', "/"));
    }
    format!("sqlite://{}", raw.replace('\\', "/"))
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
