//! The shared SSH session to the bastion host.
//!
//! All tunnels open their `direct-tcpip` channels on one [`SshClient`]. The
//! session is established lazily on the first tunnel start and reused until
//! it dies or the process shuts down. When a channel open fails, the stored
//! handle is invalidated so the next attempt reconnects; the auto-restart
//! supervisors ensure forward progress when that happens while no lifecycle
//! operation is in flight.
//!
//! Connection attempts use exponential backoff with jitter. Only transient
//! failures are retried (see [`Error::is_transient`]); a bastion that
//! refuses the credentials fails immediately.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use russh::client;
use russh::keys;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::auth::AuthChain;
use crate::config::{MAX_RETRY_DELAY, SshConfig};
use crate::error::{Error, Result};

/// Keepalive interval for the bastion session. A forwarding daemon sits idle
/// for long stretches; keepalives stop NAT boxes from silently dropping it.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Client handler for russh.
///
/// When a `known_hosts` file is configured, the server key is verified
/// against it: known keys are accepted, unknown and changed keys are
/// rejected. Without a configured file all host keys are accepted, like
/// `StrictHostKeyChecking=no` in OpenSSH.
pub struct ClientHandler {
    host: String,
    port: u16,
    known_hosts_file: Option<PathBuf>,
}

impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &keys::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        let Some(path) = &self.known_hosts_file else {
            return Ok(true);
        };

        match keys::check_known_hosts_path(&self.host, self.port, server_public_key, path) {
            Ok(true) => {
                debug!("host key verified for {}:{}", self.host, self.port);
                Ok(true)
            }
            Ok(false) => {
                warn!(
                    "host key for {}:{} not found in {}, rejecting",
                    self.host,
                    self.port,
                    path.display()
                );
                Ok(false)
            }
            Err(e) => {
                error!(
                    "host key verification failed for {}:{}: {} \
                     (the key may have changed; check {})",
                    self.host,
                    self.port,
                    e,
                    path.display()
                );
                Ok(false)
            }
        }
    }
}

/// Build the russh client configuration for the bastion session.
///
/// No inactivity timeout: the session must stay open as long as the process
/// runs. Keepalives detect dead peers; Nagle is disabled for lower latency
/// on small interactive payloads.
fn build_client_config() -> Arc<client::Config> {
    Arc::new(client::Config {
        inactivity_timeout: None,
        keepalive_interval: Some(KEEPALIVE_INTERVAL),
        keepalive_max: 3,
        nodelay: true,
        ..Default::default()
    })
}

/// The shared, lazily established SSH session.
///
/// `russh::client::Handle` is not `Clone`; it is wrapped in an `Arc` so
/// concurrent channel opens from multiple tunnels can share it. The `Mutex`
/// around the slot also serializes concurrent connection attempts: the first
/// starter dials, later starters reuse the result.
pub struct SshClient {
    config: RwLock<SshConfig>,
    handle: Mutex<Option<Arc<client::Handle<ClientHandler>>>>,
}

impl SshClient {
    pub fn new(config: SshConfig) -> Self {
        Self {
            config: RwLock::new(config),
            handle: Mutex::new(None),
        }
    }

    /// Snapshot of the current connection parameters.
    pub async fn config(&self) -> SshConfig {
        self.config.read().await.clone()
    }

    /// Replace the connection parameters. An established session is kept:
    /// the new parameters take effect on the next reconnect.
    pub async fn replace_config(&self, config: SshConfig) {
        *self.config.write().await = config;
    }

    /// Get the established session, dialing the bastion if necessary.
    pub async fn connect(&self) -> Result<Arc<client::Handle<ClientHandler>>> {
        let mut slot = self.handle.lock().await;

        if let Some(handle) = slot.as_ref()
            && !handle.is_closed()
        {
            return Ok(handle.clone());
        }

        let config = self.config.read().await.clone();
        let handle = Arc::new(connect_with_retry(&config).await?);
        *slot = Some(handle.clone());

        Ok(handle)
    }

    /// Open a `direct-tcpip` channel to `(remote_host, remote_port)`.
    ///
    /// On failure the stored handle is dropped, so the next open (or the
    /// next tunnel start) dials a fresh session.
    pub async fn open_direct_tcpip(
        &self,
        remote_host: &str,
        remote_port: u16,
    ) -> Result<russh::Channel<client::Msg>> {
        let handle = self.connect().await?;

        match handle
            .channel_open_direct_tcpip(remote_host, u32::from(remote_port), "127.0.0.1", 0)
            .await
        {
            Ok(channel) => Ok(channel),
            Err(e) => {
                self.invalidate(&handle).await;
                Err(Error::ChannelOpenFailed(e.to_string()))
            }
        }
    }

    /// Drop the stored handle if it is still the one that failed. A handle
    /// replaced by a concurrent reconnect is left alone.
    async fn invalidate(&self, failed: &Arc<client::Handle<ClientHandler>>) {
        let mut slot = self.handle.lock().await;
        if let Some(current) = slot.as_ref()
            && Arc::ptr_eq(current, failed)
        {
            *slot = None;
        }
    }

    /// Gracefully disconnect the session, if one is established.
    pub async fn disconnect(&self) {
        let handle = self.handle.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle
                .disconnect(russh::Disconnect::ByApplication, "", "en")
                .await
            {
                debug!("failed to disconnect ssh session gracefully: {}", e);
            }
        }
    }
}

/// Dial the bastion with exponential backoff and jitter. Transient
/// connection errors are retried up to `config.max_retries` times;
/// authentication failures fail immediately.
async fn connect_with_retry(config: &SshConfig) -> Result<client::Handle<ClientHandler>> {
    let backoff = ExponentialBuilder::default()
        .with_min_delay(config.retry_delay)
        .with_max_delay(MAX_RETRY_DELAY)
        .with_max_times(config.max_retries as usize)
        .with_jitter();

    let result = (|| async { dial(config).await })
        .retry(backoff)
        .when(|e: &Error| e.is_transient())
        .notify(|err, dur| {
            warn!(
                "ssh connection to {}@{}:{} failed: {}. Retrying in {:?}",
                config.user, config.host, config.port, err, dur
            );
        })
        .await;

    match result {
        Ok(handle) => {
            info!(
                "ssh session established to {}@{}:{}",
                config.user, config.host, config.port
            );
            Ok(handle)
        }
        Err(e) => {
            error!(
                "ssh connection to {}@{}:{} failed: {}",
                config.user, config.host, config.port, e
            );
            Err(e)
        }
    }
}

/// A single connection attempt: TCP connect with timeout, then the
/// authentication chain.
async fn dial(config: &SshConfig) -> Result<client::Handle<ClientHandler>> {
    let client_config = build_client_config();
    let handler = ClientHandler {
        host: config.host.clone(),
        port: config.port,
        known_hosts_file: config.known_hosts_file.clone(),
    };

    let timeout = config.connect_timeout_or_default();
    let connect_future = client::connect(client_config, (config.host.as_str(), config.port), handler);

    let mut handle = tokio::time::timeout(timeout, connect_future)
        .await
        .map_err(|_| {
            Error::SshUnavailable(format!(
                "connection to {}:{} timed out after {:?}",
                config.host, config.port, timeout
            ))
        })?
        .map_err(|e| Error::SshUnavailable(format!("failed to connect: {}", e)))?;

    let chain = AuthChain::from_credentials(config.password.as_deref(), config.key_file.as_deref());
    chain.authenticate(&mut handle, &config.user).await?;

    Ok(handle)
}
