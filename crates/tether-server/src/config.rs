//! Broker configuration.
//!
//! Configuration can be loaded from:
//! - A TOML configuration file (`tether.toml` or `--config` path)
//! - Environment variables (TETHER_*) for the bind addresses

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tether_core::GroupOptions;
use tether_protocol::AuthKey;

/// Broker configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Object-facing TCP listener.
    #[serde(default)]
    pub tcp: TcpConfig,

    /// Telemetry UDP listener.
    #[serde(default)]
    pub udp: UdpConfig,

    /// Central-facing HTTP bridge.
    #[serde(default)]
    pub http: HttpConfig,

    /// Central authority settings.
    pub central: CentralConfig,

    /// Path of the persisted ACL store.
    #[serde(default = "default_acl_path")]
    pub acl_path: PathBuf,

    /// How long a departed session's slot holds requests, in seconds.
    #[serde(default = "default_keep_session_sec")]
    pub keep_session_sec: u64,

    /// Device groups and their options, keyed by group name.
    #[serde(default)]
    pub groups: HashMap<String, GroupOptions>,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// TCP listener configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct TcpConfig {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_tcp_port")]
    pub port: u16,

    /// Deadline in seconds for a routed request to be answered.
    #[serde(default = "default_request_timeout_sec")]
    pub request_timeout_sec: u64,

    /// PEM certificate chain offered when peers request TLS.
    #[serde(default)]
    pub tls_cert: Option<PathBuf>,

    /// PEM private key matching `tls_cert`.
    #[serde(default)]
    pub tls_key: Option<PathBuf>,
}

/// UDP telemetry listener configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct UdpConfig {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_udp_port")]
    pub port: u16,

    /// Largest accepted datagram in bytes.
    #[serde(default = "default_datagram_max_size")]
    pub datagram_max_size: usize,
}

/// HTTP bridge configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_http_port")]
    pub port: u16,

    /// Largest accepted request body in bytes.
    #[serde(default = "default_max_content_length")]
    pub max_content_length: usize,

    /// PEM certificate chain the bridge serves TLS with.
    #[serde(default)]
    pub tls_cert: Option<PathBuf>,

    /// PEM private key matching `tls_cert`.
    #[serde(default)]
    pub tls_key: Option<PathBuf>,
}

/// Central authority settings.
#[derive(Debug, Clone, Deserialize)]
pub struct CentralConfig {
    /// Shared secret, 32 hex characters.
    pub auth_key: String,

    /// Webhook fallbacks used while no central session exists.
    #[serde(default)]
    pub webhooks: WebhookConfig,
}

/// Webhook fallback configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookConfig {
    /// URL posted object requests while no central session exists.
    #[serde(default)]
    pub request: Option<String>,

    /// URL posted telemetry data while no central session exists.
    #[serde(default)]
    pub telemetry: Option<String>,

    /// Seconds to wait for a webhook reply.
    #[serde(default = "default_webhook_timeout_sec")]
    pub timeout_sec: u64,
}

/// Metrics configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default value functions
fn default_host() -> String {
    std::env::var("TETHER_HOST").unwrap_or_else(|_| "127.0.0.1".to_string())
}

fn default_tcp_port() -> u16 {
    port_from_env("TETHER_TCP_PORT", 5850)
}

fn default_udp_port() -> u16 {
    port_from_env("TETHER_UDP_PORT", 5850)
}

fn default_http_port() -> u16 {
    port_from_env("TETHER_HTTP_PORT", 8520)
}

fn port_from_env(var: &str, fallback: u16) -> u16 {
    std::env::var(var)
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(fallback)
}

fn default_request_timeout_sec() -> u64 {
    10
}

fn default_datagram_max_size() -> usize {
    2048
}

fn default_max_content_length() -> usize {
    64 * 1024 // 64 KB
}

fn default_webhook_timeout_sec() -> u64 {
    10
}

fn default_acl_path() -> PathBuf {
    PathBuf::from("acl.json")
}

fn default_keep_session_sec() -> u64 {
    180
}

fn default_true() -> bool {
    true
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            request: None,
            telemetry: None,
            timeout_sec: default_webhook_timeout_sec(),
        }
    }
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_tcp_port(),
            request_timeout_sec: default_request_timeout_sec(),
            tls_cert: None,
            tls_key: None,
        }
    }
}

impl Default for UdpConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_udp_port(),
            datagram_max_size: default_datagram_max_size(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_http_port(),
            max_content_length: default_max_content_length(),
            tls_cert: None,
            tls_key: None,
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl Config {
    /// Load configuration from the given path or the default locations.
    ///
    /// # Errors
    ///
    /// Returns an error if no file is found or one fails to parse or
    /// validate.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::from_file(path);
        }
        let config_paths = [
            "tether.toml",
            "/etc/tether/tether.toml",
            "~/.config/tether/tether.toml",
        ];
        for path in &config_paths {
            let expanded = shellexpand::tilde(path);
            if Path::new(expanded.as_ref()).exists() {
                return Self::from_file(expanded.as_ref());
            }
        }
        bail!("no configuration file found (tried {})", config_paths.join(", "))
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config.central_auth_key()?;
        Ok(config)
    }

    /// Decode the central shared secret.
    ///
    /// # Errors
    ///
    /// Returns an error unless it is exactly 32 hex characters.
    pub fn central_auth_key(&self) -> Result<AuthKey> {
        let bytes = hex::decode(&self.central.auth_key)
            .context("central.auth_key is not valid hex")?;
        AuthKey::try_from(bytes.as_slice())
            .map_err(|_| anyhow::anyhow!("central.auth_key must be 16 bytes (32 hex characters)"))
    }

    /// Socket address of the TCP listener.
    ///
    /// # Errors
    ///
    /// Returns an error for an unparsable host.
    pub fn tcp_addr(&self) -> Result<SocketAddr> {
        parse_addr(&self.tcp.host, self.tcp.port)
    }

    /// Socket address of the UDP listener.
    ///
    /// # Errors
    ///
    /// Returns an error for an unparsable host.
    pub fn udp_addr(&self) -> Result<SocketAddr> {
        parse_addr(&self.udp.host, self.udp.port)
    }

    /// Socket address of the HTTP bridge.
    ///
    /// # Errors
    ///
    /// Returns an error for an unparsable host.
    pub fn http_addr(&self) -> Result<SocketAddr> {
        parse_addr(&self.http.host, self.http.port)
    }
}

fn parse_addr(host: &str, port: u16) -> Result<SocketAddr> {
    format!("{host}:{port}")
        .parse()
        .with_context(|| format!("invalid bind address {host}:{port}"))
}
