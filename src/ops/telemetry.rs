//! Tracing initialization and the admin console.
//!
//! The console is a deliberately small hand-rolled HTTP endpoint on a TCP
//! listener: health, a JSON status snapshot, and live log-level control via
//! the tracing reload handle.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;
use tracing_subscriber::reload;

pub type LogHandle = reload::Handle<EnvFilter, tracing_subscriber::Registry>;

/// Initialize JSON logging with a reloadable level.
pub fn init_tracing(log_level: Option<&str>) -> Result<LogHandle> {
    let level = log_level.unwrap_or("info");
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    let (filter_layer, handle) = reload::Layer::new(filter);
    let fmt_layer = fmt::layer().json().with_target(true);
    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to init tracing: {e}"))?;
    Ok(handle)
}

/// Snapshot provider for the `/status` endpoint; implemented by the
/// gateway runtime.
pub trait StatusSource: Send + Sync + 'static {
    fn status(&self) -> serde_json::Value;
}

/// Start the admin console listener. Serves `/healthz`, `/status`, and
/// `/loglevel?level=<filter>`.
pub async fn start_console(
    bind: &str,
    source: Arc<dyn StatusSource>,
    log_handle: Option<LogHandle>,
) -> Result<()> {
    let listener = TcpListener::bind(bind)
        .await
        .with_context(|| format!("failed to bind console on {bind}"))?;
    tracing::info!("admin console listening on {}", bind);
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((mut socket, addr)) => {
                    let source = Arc::clone(&source);
                    let log_handle = log_handle.clone();
                    tokio::spawn(async move {
                        if let Err(err) = handle_conn(&mut socket, addr, source, log_handle).await {
                            tracing::warn!("console handler error: {err:?}");
                        }
                    });
                }
                Err(err) => {
                    tracing::warn!("console accept error: {err:?}");
                }
            }
        }
    });
    Ok(())
}

async fn handle_conn(
    socket: &mut tokio::net::TcpStream,
    _addr: SocketAddr,
    source: Arc<dyn StatusSource>,
    log_handle: Option<LogHandle>,
) -> Result<()> {
    let mut buf = [0u8; 4096];
    let n = socket.read(&mut buf).await?;
    let req = String::from_utf8_lossy(&buf[..n]);
    let first = req.lines().next().unwrap_or("");
    let mut request_line = first.split_whitespace();
    let method = request_line.next().unwrap_or("");
    let target = request_line.next().unwrap_or("/");
    let (route, query) = match target.split_once('?') {
        Some((route, query)) => (route, query),
        None => (target, ""),
    };

    let (status, body, content_type) = match route {
        "/healthz" => (200, "{\"status\":\"ok\"}".to_string(), "application/json"),
        "/status" => (200, source.status().to_string(), "application/json"),
        // Mutating the live filter is PUT-only.
        "/loglevel" if method != "PUT" => (
            405,
            "{\"error\":\"method not allowed\"}".to_string(),
            "application/json",
        ),
        "/loglevel" => {
            if let Some(handle) = log_handle {
                if let Some(level) = query.strip_prefix("level=") {
                    if let Ok(filter) = EnvFilter::try_new(level) {
                        let _ = handle.modify(|f| *f = filter);
                    }
                }
            }
            (200, "{\"status\":\"ok\"}".to_string(), "application/json")
        }
        _ => (404, "not found".to_string(), "text/plain"),
    };

    let resp = format!(
        "HTTP/1.1 {} OK\r\nContent-Type: {}\r\nContent-Length: {}\r\n\r\n{}",
        status,
        content_type,
        body.len(),
        body
    );
    socket.write_all(resp.as_bytes()).await?;
    Ok(())
}
