//! Configuration: a `toml`-backed value loaded once at startup and handed
//! down as an immutable value — no process-wide singletons beyond the
//! long-lived subsystem instances built from it (spec's "Global mutable
//! state" design note).

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub acme: AcmeConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub reconcile: ReconcileConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Read a TOML file at `path` if it exists, else fall back to defaults.
    /// `API_TOKEN`/`DATA_DIR`/`CONFIG_DIR` environment variables always
    /// override whatever the file (or default) contains.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let mut config: Config = if path.exists() {
            let raw = std::fs::read_to_string(path)?;
            toml::from_str(&raw)?
        } else {
            Config::default()
        };

        if let Ok(token) = std::env::var("API_TOKEN") {
            config.auth.admin_token = token;
        }
        if let Ok(dir) = std::env::var("DATA_DIR") {
            config.server.data_dir = PathBuf::from(dir);
        }
        if let Ok(dir) = std::env::var("CONFIG_DIR") {
            config.server.config_dir = PathBuf::from(dir);
        }

        Ok(config)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            auth: AuthConfig::default(),
            runtime: RuntimeConfig::default(),
            proxy: ProxyConfig::default(),
            acme: AcmeConfig::default(),
            health: HealthConfig::default(),
            reconcile: ReconcileConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_admin_host")]
    pub admin_host: String,
    #[serde(default = "default_admin_port")]
    pub admin_port: u16,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_config_dir")]
    pub config_dir: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            admin_host: default_admin_host(),
            admin_port: default_admin_port(),
            data_dir: default_data_dir(),
            config_dir: default_config_dir(),
        }
    }
}

fn default_admin_host() -> String {
    "0.0.0.0".to_string()
}
fn default_admin_port() -> u16 {
    2019
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}
fn default_config_dir() -> PathBuf {
    PathBuf::from("./config")
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// Bearer token for the admin API. Compared with a constant-time
    /// equality check (see `api::auth`). Required in production; a random
    /// value is generated if the caller never sets `API_TOKEN` so the
    /// daemon still starts for local inspection, with every token rejected.
    #[serde(default = "default_admin_token")]
    pub admin_token: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            admin_token: default_admin_token(),
        }
    }
}

fn default_admin_token() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    format!("unset-{nanos:x}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeKind {
    Auto,
    Docker,
    Podman,
}

fn default_runtime_kind() -> RuntimeKind {
    RuntimeKind::Auto
}
fn default_docker_socket() -> String {
    "/var/run/docker.sock".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_runtime_kind")]
    pub kind: RuntimeKind,
    #[serde(default = "default_docker_socket")]
    pub docker_socket: String,
    /// Docker/Podman network all app containers must share to be eligible
    /// (spec §4.6: "attached to the project's shared network").
    #[serde(default = "default_network")]
    pub network: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            kind: default_runtime_kind(),
            docker_socket: default_docker_socket(),
            network: default_network(),
        }
    }
}

fn default_network() -> String {
    "wharfd".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    #[serde(default = "default_https_port")]
    pub https_port: u16,
    /// Domain the admin API is served on inside the proxy's :443/:80
    /// handlers, distinct from routed app traffic.
    pub api_domain: Option<String>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            http_port: default_http_port(),
            https_port: default_https_port(),
            api_domain: None,
        }
    }
}

fn default_http_port() -> u16 {
    80
}
fn default_https_port() -> u16 {
    443
}

#[derive(Debug, Clone, Deserialize)]
pub struct AcmeConfig {
    #[serde(default)]
    pub staging: bool,
    /// Fallback email when a container's `acme_email` label is absent.
    pub default_email: Option<String>,
    #[serde(default = "default_cert_dir")]
    pub cert_dir: PathBuf,
    #[serde(default = "default_challenge_port")]
    pub challenge_port: u16,
    #[serde(default = "default_renewal_window")]
    pub renewal_window: Duration,
}

impl Default for AcmeConfig {
    fn default() -> Self {
        Self {
            staging: false,
            default_email: None,
            cert_dir: default_cert_dir(),
            challenge_port: default_challenge_port(),
            renewal_window: default_renewal_window(),
        }
    }
}

fn default_cert_dir() -> PathBuf {
    PathBuf::from("./data/certs")
}
fn default_challenge_port() -> u16 {
    9080
}
fn default_renewal_window() -> Duration {
    Duration::from_secs(30 * 24 * 3600)
}

#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "default_fall")]
    pub fall: u32,
    #[serde(default = "default_rise")]
    pub rise: u32,
    #[serde(default = "default_check_interval")]
    pub interval: Duration,
    #[serde(default = "default_check_timeout")]
    pub timeout: Duration,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff: Duration,
    #[serde(default = "default_max_backoff")]
    pub max_backoff: Duration,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            fall: default_fall(),
            rise: default_rise(),
            interval: default_check_interval(),
            timeout: default_check_timeout(),
            max_retries: default_max_retries(),
            initial_backoff: default_initial_backoff(),
            max_backoff: default_max_backoff(),
            max_concurrent: default_max_concurrent(),
        }
    }
}

fn default_fall() -> u32 {
    3
}
fn default_rise() -> u32 {
    2
}
fn default_check_interval() -> Duration {
    Duration::from_secs(10)
}
fn default_check_timeout() -> Duration {
    Duration::from_secs(5)
}
fn default_max_retries() -> u32 {
    5
}
fn default_initial_backoff() -> Duration {
    Duration::from_millis(500)
}
fn default_max_backoff() -> Duration {
    Duration::from_secs(8)
}
fn default_max_concurrent() -> usize {
    16
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReconcileConfig {
    #[serde(default = "default_debounce")]
    pub debounce: Duration,
    #[serde(default = "default_periodic_interval")]
    pub periodic_interval: Duration,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            debounce: default_debounce(),
            periodic_interval: default_periodic_interval(),
        }
    }
}

fn default_debounce() -> Duration {
    Duration::from_secs(5)
}
fn default_periodic_interval() -> Duration {
    Duration::from_secs(300)
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_sane_ports() {
        let config = Config::default();
        assert_eq!(config.proxy.http_port, 80);
        assert_eq!(config.proxy.https_port, 443);
        assert_eq!(config.health.fall, 3);
        assert_eq!(config.health.rise, 2);
    }

    #[test]
    fn load_falls_back_to_default_when_file_missing() {
        let config = Config::load(std::path::Path::new("/nonexistent/wharfd.toml")).unwrap();
        assert_eq!(config.server.admin_port, 2019);
    }

    #[test]
    fn api_token_env_overrides_config() {
        std::env::set_var("API_TOKEN", "test-token-123");
        let config = Config::load(std::path::Path::new("/nonexistent/wharfd.toml")).unwrap();
        assert_eq!(config.auth.admin_token, "test-token-123");
        std::env::remove_var("API_TOKEN");
    }
}
