//! The supervisor that owns the shared SSH session and every tunnel.
//!
//! The manager indexes tunnels by name and serializes lifecycle operations
//! under concurrent access: all map mutations take the write lock, snapshots
//! take the read lock, and the lock is always released before calling into a
//! tunnel (which may block on I/O). Stop and remove paths extract the tunnel
//! handle under the lock and operate on it unlocked.
//!
//! For each tunnel with auto-restart enabled, a background supervisor wakes
//! on its interval and restarts the tunnel when it is in Error or carries a
//! last error. At most one supervisor runs per tunnel; starting a new one
//! cancels the old, and removing the tunnel cancels it too.
//!
//! [`Manager::reconcile`] applies a desired configuration as a diff: removed
//! tunnels are torn down, new tunnels are added and started, and changed
//! tunnels are rebuilt with their new parameters and restarted. Unchanged
//! tunnels keep their identity and their open client connections across
//! reloads.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::client::SshClient;
use crate::config::{Config, SshConfig, TunnelConfig};
use crate::error::{Error, Result};
use crate::tunnel::{Tunnel, TunnelStats, TunnelStatus};

/// Health snapshot for one tunnel, as consumed by readiness probes.
#[derive(Debug, Clone)]
pub struct HealthStatus {
    pub name: String,
    pub status: TunnelStatus,
    pub last_error: Option<String>,
    pub healthy: bool,
}

#[derive(Default)]
struct Inner {
    tunnels: HashMap<String, Arc<Tunnel>>,
    configs: HashMap<String, TunnelConfig>,
    supervisors: HashMap<String, CancellationToken>,
}

/// Tunnel registry and lifecycle orchestrator.
pub struct Manager {
    ssh: Arc<SshClient>,
    inner: RwLock<Inner>,
    shutdown: CancellationToken,
    // Handed to supervisor tasks so they never keep the manager alive.
    weak: Weak<Manager>,
}

impl Manager {
    pub fn new(ssh_config: SshConfig) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            ssh: Arc::new(SshClient::new(ssh_config)),
            inner: RwLock::new(Inner::default()),
            shutdown: CancellationToken::new(),
            weak: weak.clone(),
        })
    }

    /// Register a new tunnel. Does not start it.
    pub async fn add(&self, cfg: TunnelConfig) -> Result<()> {
        let mut inner = self.inner.write().await;

        if inner.tunnels.contains_key(&cfg.name) {
            return Err(Error::NameInUse(cfg.name));
        }

        let tunnel = Arc::new(Tunnel::new(
            cfg.name.clone(),
            self.ssh.clone(),
            cfg.remote_host.clone(),
            cfg.remote_port,
            cfg.local_port,
        ));
        inner.tunnels.insert(cfg.name.clone(), tunnel);
        inner.configs.insert(cfg.name.clone(), cfg);

        Ok(())
    }

    /// Stop the tunnel's supervisor and the tunnel itself, then delete it.
    pub async fn remove(&self, name: &str) -> Result<()> {
        self.stop_supervisor(name).await;

        let tunnel = {
            let inner = self.inner.read().await;
            inner
                .tunnels
                .get(name)
                .cloned()
                .ok_or_else(|| Error::NotFound(name.to_string()))?
        };

        if tunnel.status().await == TunnelStatus::Running {
            tunnel
                .stop()
                .await
                .map_err(|e| Error::for_tunnel(name, e))?;
        }

        let mut inner = self.inner.write().await;
        inner.tunnels.remove(name);
        inner.configs.remove(name);

        Ok(())
    }

    /// Start the named tunnel and, if configured, its auto-restart
    /// supervisor.
    pub async fn start(&self, name: &str) -> Result<()> {
        let (tunnel, cfg) = {
            let inner = self.inner.read().await;
            (
                inner
                    .tunnels
                    .get(name)
                    .cloned()
                    .ok_or_else(|| Error::NotFound(name.to_string()))?,
                inner.configs.get(name).cloned(),
            )
        };

        tunnel
            .start()
            .await
            .map_err(|e| Error::for_tunnel(name, e))?;

        if let Some(cfg) = cfg
            && cfg.auto_restart.enabled
        {
            self.start_supervisor(name, cfg.auto_restart.interval).await;
        }

        Ok(())
    }

    /// Stop the named tunnel, cancelling its supervisor first.
    pub async fn stop(&self, name: &str) -> Result<()> {
        self.stop_supervisor(name).await;

        let tunnel = {
            let inner = self.inner.read().await;
            inner
                .tunnels
                .get(name)
                .cloned()
                .ok_or_else(|| Error::NotFound(name.to_string()))?
        };

        tunnel.stop().await.map_err(|e| Error::for_tunnel(name, e))
    }

    /// Restart the named tunnel. The supervisor, if any, keeps running.
    pub async fn restart(&self, name: &str) -> Result<()> {
        let tunnel = {
            let inner = self.inner.read().await;
            inner
                .tunnels
                .get(name)
                .cloned()
                .ok_or_else(|| Error::NotFound(name.to_string()))?
        };

        tunnel
            .restart()
            .await
            .map_err(|e| Error::for_tunnel(name, e))
    }

    /// Start every registered tunnel, returning per-tunnel failures (empty
    /// on full success).
    pub async fn start_all(&self) -> HashMap<String, Error> {
        let names = self.list().await;

        let results = join_all(names.into_iter().map(|name| async move {
            let result = self.start(&name).await;
            (name, result)
        }))
        .await;

        results
            .into_iter()
            .filter_map(|(name, result)| result.err().map(|e| (name, e)))
            .collect()
    }

    /// Stop every registered tunnel and supervisor, returning per-tunnel
    /// failures.
    pub async fn stop_all(&self) -> HashMap<String, Error> {
        let tunnels: Vec<(String, Arc<Tunnel>)> = {
            let mut inner = self.inner.write().await;
            for (_, token) in inner.supervisors.drain() {
                token.cancel();
            }
            inner
                .tunnels
                .iter()
                .map(|(name, tunnel)| (name.clone(), tunnel.clone()))
                .collect()
        };

        let results = join_all(tunnels.into_iter().map(|(name, tunnel)| async move {
            let result = tunnel.stop().await;
            (name, result)
        }))
        .await;

        results
            .into_iter()
            .filter_map(|(name, result)| result.err().map(|e| (name, e)))
            .collect()
    }

    pub async fn get(&self, name: &str) -> Option<Arc<Tunnel>> {
        self.inner.read().await.tunnels.get(name).cloned()
    }

    /// Names of all registered tunnels, in unspecified order.
    pub async fn list(&self) -> Vec<String> {
        self.inner.read().await.tunnels.keys().cloned().collect()
    }

    pub async fn status(&self) -> HashMap<String, TunnelStatus> {
        let tunnels = self.snapshot().await;

        let mut out = HashMap::with_capacity(tunnels.len());
        for (name, tunnel) in tunnels {
            out.insert(name, tunnel.status().await);
        }
        out
    }

    pub async fn stats(&self) -> HashMap<String, TunnelStats> {
        let tunnels = self.snapshot().await;

        let mut out = HashMap::with_capacity(tunnels.len());
        for (name, tunnel) in tunnels {
            out.insert(name, tunnel.stats().await);
        }
        out
    }

    /// Health snapshot of every tunnel. A tunnel is healthy when it is
    /// Running with no recorded error.
    pub async fn health_check(&self) -> Vec<HealthStatus> {
        let tunnels = self.snapshot().await;

        let mut out = Vec::with_capacity(tunnels.len());
        for (name, tunnel) in tunnels {
            let status = tunnel.status().await;
            let last_error = tunnel.last_error().await;
            let healthy = status == TunnelStatus::Running && last_error.is_none();
            out.push(HealthStatus {
                name,
                status,
                last_error,
                healthy,
            });
        }
        out
    }

    /// The unhealthy subset of [`Manager::health_check`].
    pub async fn unhealthy(&self) -> Vec<HealthStatus> {
        self.health_check()
            .await
            .into_iter()
            .filter(|h| !h.healthy)
            .collect()
    }

    /// Apply a desired configuration: remove tunnels that are gone, add and
    /// start new ones, rebuild and restart changed ones. Per-tunnel failures
    /// are logged, never aborting the pass, so one broken tunnel cannot hold
    /// the rest of the reload hostage.
    pub async fn reconcile(&self, new_config: &Config) -> Result<()> {
        self.ssh.replace_config(new_config.ssh.clone()).await;

        let current: Vec<String> = self.list().await;
        let desired: HashMap<String, TunnelConfig> = new_config
            .tunnels
            .iter()
            .map(|cfg| (cfg.name.clone(), cfg.clone()))
            .collect();

        for name in &current {
            if !desired.contains_key(name) {
                info!(tunnel = %name, "reconcile: removing tunnel");
                if let Err(e) = self.remove(name).await {
                    warn!(tunnel = %name, "reconcile: failed to remove: {}", e);
                }
            }
        }

        for (name, cfg) in &desired {
            if current.contains(name) {
                continue;
            }
            info!(tunnel = %name, "reconcile: adding tunnel");
            if let Err(e) = self.add(cfg.clone()).await {
                warn!(tunnel = %name, "reconcile: failed to add: {}", e);
                continue;
            }
            if let Err(e) = self.start(name).await {
                warn!(tunnel = %name, "reconcile: failed to start: {}", e);
            }
        }

        for (name, new_cfg) in &desired {
            if !current.contains(name) {
                continue;
            }
            let old_cfg = self.inner.read().await.configs.get(name).cloned();
            if let Some(old_cfg) = old_cfg
                && config_changed(&old_cfg, new_cfg)
            {
                info!(tunnel = %name, "reconcile: tunnel changed, restarting");
                self.rebuild(name, new_cfg.clone()).await;
            }
        }

        Ok(())
    }

    /// Cancel all supervisors, stop all tunnels in parallel, and release the
    /// SSH session. Idempotent.
    pub async fn close(&self) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Ok(());
        }
        self.shutdown.cancel();

        let failures = self.stop_all().await;
        self.ssh.disconnect().await;

        if failures.is_empty() {
            Ok(())
        } else {
            let summary = failures
                .iter()
                .map(|(name, e)| format!("{name}: {e}"))
                .collect::<Vec<_>>()
                .join("; ");
            Err(Error::Close(summary))
        }
    }

    async fn snapshot(&self) -> Vec<(String, Arc<Tunnel>)> {
        let inner = self.inner.read().await;
        inner
            .tunnels
            .iter()
            .map(|(name, tunnel)| (name.clone(), tunnel.clone()))
            .collect()
    }

    /// Replace a tunnel whose config changed: tear down the old instance,
    /// build one from the new parameters, and start it. The old instance's
    /// monotonic counters carry over so stats survive the restart.
    async fn rebuild(&self, name: &str, new_cfg: TunnelConfig) {
        self.stop_supervisor(name).await;

        let old = self.inner.read().await.tunnels.get(name).cloned();
        let mut prior_stats = None;
        if let Some(old) = old {
            if let Err(e) = old.stop().await {
                warn!(tunnel = %name, "reconcile: failed to stop old tunnel: {}", e);
            }
            prior_stats = Some(old.stats().await);
        }

        {
            let mut inner = self.inner.write().await;
            let tunnel = match &prior_stats {
                Some(prior) => Tunnel::replacing(
                    name,
                    self.ssh.clone(),
                    new_cfg.remote_host.clone(),
                    new_cfg.remote_port,
                    new_cfg.local_port,
                    prior,
                ),
                None => Tunnel::new(
                    name,
                    self.ssh.clone(),
                    new_cfg.remote_host.clone(),
                    new_cfg.remote_port,
                    new_cfg.local_port,
                ),
            };
            inner.tunnels.insert(name.to_string(), Arc::new(tunnel));
            inner.configs.insert(name.to_string(), new_cfg);
        }

        if let Err(e) = self.start(name).await {
            warn!(tunnel = %name, "reconcile: failed to restart: {}", e);
        }
    }

    /// Launch the auto-restart supervisor for a tunnel, cancelling any
    /// existing one first so at most one runs per tunnel.
    async fn start_supervisor(&self, name: &str, interval: Duration) {
        let token = CancellationToken::new();
        {
            let mut inner = self.inner.write().await;
            if let Some(old) = inner.supervisors.insert(name.to_string(), token.clone()) {
                old.cancel();
            }
        }

        let name = name.to_string();
        let shutdown = self.shutdown.clone();
        let weak = self.weak.clone();

        tokio::spawn(async move {
            let start = tokio::time::Instant::now() + interval;
            let mut ticker = tokio::time::interval_at(start, interval);

            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = shutdown.cancelled() => return,
                    _ = ticker.tick() => {
                        let Some(manager) = weak.upgrade() else {
                            return;
                        };
                        // The tunnel may have been removed between ticks.
                        let Some(tunnel) = manager.get(&name).await else {
                            return;
                        };

                        let status = tunnel.status().await;
                        let last_error = tunnel.last_error().await;
                        if status == TunnelStatus::Error || last_error.is_some() {
                            info!(tunnel = %name, "auto-restart: restarting unhealthy tunnel");
                            if let Err(e) = manager.restart(&name).await {
                                warn!(tunnel = %name, "auto-restart failed: {}", e);
                            }
                        }
                    }
                }
            }
        });
    }

    async fn stop_supervisor(&self, name: &str) {
        let mut inner = self.inner.write().await;
        if let Some(token) = inner.supervisors.remove(name) {
            token.cancel();
        }
    }
}

/// The reconcile change predicate: remote endpoint, local port, and both
/// auto-restart fields. Renames are impossible because the name is the key.
fn config_changed(old: &TunnelConfig, new: &TunnelConfig) -> bool {
    old.remote_host != new.remote_host
        || old.remote_port != new.remote_port
        || old.local_port != new.local_port
        || old.auto_restart.enabled != new.auto_restart.enabled
        || old.auto_restart.interval != new.auto_restart.interval
}
