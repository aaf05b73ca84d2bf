use std::env;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

const ENV_PREFIX: &str = "WEBCHAT_BROKER_";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Serves websocket upgrades and the plain HTTP routes on one port.
    #[serde(default = "default_server_bind")]
    pub bind: String,
    #[serde(default = "default_ws_path")]
    pub ws_path: String,
    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    /// Bounds reading the request head and each plain HTTP exchange.
    #[serde(default = "default_http_timeout_ms")]
    pub http_timeout_ms: u64,
    #[serde(default = "default_route_timeout_ms")]
    pub route_timeout_ms: u64,
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
    #[serde(default = "default_max_delivery_bytes")]
    pub max_delivery_bytes: usize,
    #[serde(default = "default_index_redirect_url")]
    pub index_redirect_url: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_server_bind(),
            ws_path: default_ws_path(),
            ping_interval_secs: default_ping_interval_secs(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
            http_timeout_ms: default_http_timeout_ms(),
            route_timeout_ms: default_route_timeout_ms(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
            max_delivery_bytes: default_max_delivery_bytes(),
            index_redirect_url: default_index_redirect_url(),
        }
    }
}

impl ServerConfig {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_millis(self.http_timeout_ms)
    }

    pub fn route_timeout(&self) -> Duration {
        Duration::from_millis(self.route_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(default = "default_backend_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_backend_user_agent")]
    pub user_agent: String,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_backend_timeout_ms(),
            user_agent: default_backend_user_agent(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Errors and panics are reported to Sentry when set.
    #[serde(default)]
    pub sentry_dsn: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            sentry_dsn: None,
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let mut cfg = Self::read_file(path)?;
        cfg.apply_env_overrides(|key| env::var(key).ok());
        cfg.validate()?;
        Ok(cfg)
    }

    fn read_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed reading config file {}", path.display()))?;
        toml::from_str::<Config>(&text)
            .with_context(|| format!("failed parsing TOML config {}", path.display()))
    }

    pub fn apply_cli_overrides(
        &mut self,
        bind: Option<&str>,
        log_level: Option<&str>,
    ) -> Result<()> {
        if let Some(bind) = bind {
            self.server.bind = bind.trim().to_owned();
        }
        if let Some(level) = log_level {
            self.logging.level = level.trim().to_owned();
        }
        self.validate()
    }

    fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));
        if let Some(v) = var("BIND") {
            self.server.bind = v.trim().to_owned();
        }
        if let Some(v) = var("WS_PATH") {
            self.server.ws_path = v.trim().to_owned();
        }
        if let Some(v) = var("PING_INTERVAL_SECS").and_then(|v| parse_number(&v)) {
            self.server.ping_interval_secs = v;
        }
        if let Some(v) = var("HANDSHAKE_TIMEOUT_MS").and_then(|v| parse_number(&v)) {
            self.server.handshake_timeout_ms = v;
        }
        if let Some(v) = var("HTTP_TIMEOUT_MS").and_then(|v| parse_number(&v)) {
            self.server.http_timeout_ms = v;
        }
        if let Some(v) = var("ROUTE_TIMEOUT_MS").and_then(|v| parse_number(&v)) {
            self.server.route_timeout_ms = v;
        }
        if let Some(v) = var("SHUTDOWN_GRACE_MS").and_then(|v| parse_number(&v)) {
            self.server.shutdown_grace_ms = v;
        }
        if let Some(v) = var("MAX_DELIVERY_BYTES").and_then(|v| parse_number(&v)) {
            self.server.max_delivery_bytes = v;
        }
        if let Some(v) = var("INDEX_REDIRECT_URL") {
            self.server.index_redirect_url = v.trim().to_owned();
        }
        if let Some(v) = var("BACKEND_TIMEOUT_MS").and_then(|v| parse_number(&v)) {
            self.backend.timeout_ms = v;
        }
        if let Some(v) = var("BACKEND_USER_AGENT") {
            self.backend.user_agent = v;
        }
        if let Some(v) = var("LOG_LEVEL") {
            self.logging.level = v.trim().to_owned();
        }
        if let Some(v) = var("SENTRY_DSN") {
            let dsn = v.trim();
            self.logging.sentry_dsn = (!dsn.is_empty()).then(|| dsn.to_owned());
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.bind.trim().is_empty() {
            anyhow::bail!("server.bind must not be empty");
        }
        if !self.server.ws_path.starts_with('/') {
            anyhow::bail!("server.ws_path must start with '/'");
        }
        if self.server.ping_interval_secs == 0 {
            anyhow::bail!("server.ping_interval_secs must be > 0");
        }
        if self.server.handshake_timeout_ms == 0 {
            anyhow::bail!("server.handshake_timeout_ms must be > 0");
        }
        if self.server.http_timeout_ms == 0 {
            anyhow::bail!("server.http_timeout_ms must be > 0");
        }
        if self.server.route_timeout_ms == 0 {
            anyhow::bail!("server.route_timeout_ms must be > 0");
        }
        if self.server.max_delivery_bytes == 0 {
            anyhow::bail!("server.max_delivery_bytes must be > 0");
        }
        if self.backend.timeout_ms == 0 {
            anyhow::bail!("backend.timeout_ms must be > 0");
        }
        if self.backend.user_agent.trim().is_empty() {
            anyhow::bail!("backend.user_agent must not be empty");
        }
        if self.logging.level.trim().is_empty() {
            anyhow::bail!("logging.level must not be empty");
        }
        if let Some(dsn) = &self.logging.sentry_dsn {
            if !dsn.trim().is_empty() {
                dsn.parse::<sentry::types::Dsn>()
                    .with_context(|| format!("logging.sentry_dsn {dsn:?} is not a valid DSN"))?;
            }
        }
        Ok(())
    }
}

fn parse_number<T: std::str::FromStr>(s: &str) -> Option<T> {
    s.trim().parse().ok()
}

fn default_server_bind() -> String {
    "0.0.0.0:9090".to_owned()
}


fn default_ws_path() -> String {
    "/socketcluster".to_owned()
}

fn default_ping_interval_secs() -> u64 {
    10
}

fn default_handshake_timeout_ms() -> u64 {
    8_000
}

fn default_http_timeout_ms() -> u64 {
    30_000
}

fn default_route_timeout_ms() -> u64 {
    5_000
}

fn default_shutdown_grace_ms() -> u64 {
    5_000
}

fn default_max_delivery_bytes() -> usize {
    100_000
}

fn default_index_redirect_url() -> String {
    "https://help.communityconnectlabs.com/support/home".to_owned()
}

fn default_backend_timeout_ms() -> u64 {
    30_000
}

fn default_backend_user_agent() -> String {
    format!("webchat-broker/{}", env!("CARGO_PKG_VERSION"))
}

fn default_log_level() -> String {
    "info".to_owned()
}
