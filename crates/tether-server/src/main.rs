//! # Tether Broker
//!
//! IoT broker bridging low-power object devices to a central authority.
//!
//! ## Usage
//!
//! ```bash
//! # Run with tether.toml from the working directory
//! tether
//!
//! # Run with a specific config
//! tether --config /etc/tether/tether.toml
//! ```

mod acl_watch;
mod bridge;
mod config;
mod metrics;
mod tcp;
mod udp;
mod webhook;

use anyhow::{bail, Context, Result};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tether_core::{Router, RouterConfig, WebhookSet};
use tether_protocol::codec::{self, close_code};
use tether_protocol::GroupId;
use tether_transport::{RustlsUpgrade, TlsUpgrade};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use webhook::HttpWebhook;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tether=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config_path = config_path_arg()?;
    let config = config::Config::load(config_path.as_deref())?;

    // Initialize metrics
    metrics::init_metrics();
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    run_broker(config).await
}

fn config_path_arg() -> Result<Option<PathBuf>> {
    let mut args = std::env::args().skip(1);
    match args.next().as_deref() {
        None => Ok(None),
        Some("--config") => match args.next() {
            Some(path) => Ok(Some(PathBuf::from(path))),
            None => bail!("--config requires a path"),
        },
        Some(other) => bail!("unknown argument: {other}"),
    }
}

async fn run_broker(config: config::Config) -> Result<()> {
    let central_auth_key = config.central_auth_key()?;

    let mut groups = HashMap::new();
    for (name, options) in &config.groups {
        let group = GroupId::from_name(name)
            .with_context(|| format!("invalid group name {name:?} in configuration"))?;
        groups.insert(group, *options);
    }

    let webhooks = WebhookSet {
        request: build_webhook(
            config.central.webhooks.request.as_deref(),
            &config.central.auth_key,
            config.central.webhooks.timeout_sec,
        )?,
        telemetry: build_webhook(
            config.central.webhooks.telemetry.as_deref(),
            &config.central.auth_key,
            config.central.webhooks.timeout_sec,
        )?,
    };

    let router = Arc::new(Router::new(
        RouterConfig {
            acl_path: config.acl_path.clone(),
            central_auth_key,
            keep_session: Duration::from_secs(config.keep_session_sec),
        },
        groups,
        webhooks,
    ));
    if let Err(e) = router.load_acl() {
        warn!(error = %e, "cannot read ACL store, starting with an empty table");
    }

    let tls = build_tls(&config.tcp.tls_cert, &config.tcp.tls_key, "tcp")?;
    if tls.is_some() {
        info!("TLS enabled for object connections");
    }
    let http_tls = build_tls(&config.http.tls_cert, &config.http.tls_key, "http")?;
    let cancel = CancellationToken::new();
    let sweeper = router.start_sweeper(cancel.clone());
    let watcher = acl_watch::spawn_acl_watcher(
        config.acl_path.clone(),
        Arc::clone(&router),
        cancel.clone(),
    );

    info!("Starting Tether broker");

    let tcp_task = tokio::spawn(tcp::run_tcp_server(
        config.tcp_addr()?,
        Arc::clone(&router),
        tls,
        Duration::from_secs(config.tcp.request_timeout_sec),
        cancel.clone(),
    ));
    let udp_task = tokio::spawn(udp::run_udp_server(
        config.udp_addr()?,
        config.udp.datagram_max_size,
        Arc::clone(&router),
        cancel.clone(),
    ));

    let http_addr = config.http_addr()?;
    let app = bridge::bridge_app(Arc::clone(&router), config.http.max_content_length);
    let listener = tokio::net::TcpListener::bind(http_addr)
        .await
        .with_context(|| format!("failed to bind HTTP bridge on {http_addr}"))?;
    info!(
        "HTTP bridge listening on {} (TLS {})",
        http_addr,
        if http_tls.is_some() { "on" } else { "off" }
    );
    let http_task = tokio::spawn(bridge::run_bridge_server(
        listener,
        app,
        http_tls,
        cancel.clone(),
    ));

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Shutting down");

    // Announce the shutdown to connected peers, then stop everything.
    router.shutdown(codec::make_close(close_code::PLANNED_SHUTDOWN));
    cancel.cancel();

    let _ = tcp_task.await;
    let _ = udp_task.await;
    let _ = http_task.await;
    let _ = sweeper.await;
    let _ = watcher.await;
    Ok(())
}

fn build_webhook(
    url: Option<&str>,
    auth_key_hex: &str,
    timeout_sec: u64,
) -> Result<Option<Arc<dyn tether_core::Webhook>>> {
    let Some(url) = url else {
        return Ok(None);
    };
    let hook = HttpWebhook::new(
        url.to_owned(),
        auth_key_hex.to_owned(),
        Duration::from_secs(timeout_sec),
    )
    .with_context(|| format!("failed to build webhook client for {url}"))?;
    Ok(Some(Arc::new(hook)))
}

fn build_tls(
    cert: &Option<PathBuf>,
    key: &Option<PathBuf>,
    section: &str,
) -> Result<Option<Arc<dyn TlsUpgrade>>> {
    match (cert, key) {
        (Some(cert), Some(key)) => {
            let upgrade = RustlsUpgrade::from_pem_files(cert, key)
                .with_context(|| format!("failed to load TLS material for [{section}]"))?;
            Ok(Some(Arc::new(upgrade)))
        }
        (None, None) => Ok(None),
        _ => bail!("{section}.tls_cert and {section}.tls_key must be set together"),
    }
}
