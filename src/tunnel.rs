//! The per-tunnel engine: local listener, accept loop, bidirectional proxy,
//! and lifecycle state machine.
//!
//! A tunnel is the stable mapping `127.0.0.1:<local_port>` to
//! `<remote_host>:<remote_port>` via the bastion. Each accepted local
//! connection gets its own `direct-tcpip` channel on the shared SSH session
//! and a byte-transparent proxy with no framing and no idle deadlines;
//! databases rely on application-level keepalive.
//!
//! State machine:
//!
//! ```text
//!   Stopped ──start──▶ Starting ──listener bound──▶ Running
//!      ▲                  │                           │
//!      │                  └─bind/ssh fails─▶ Error    │
//!      │                                              │
//!      └──────────────stop──────────────── Running, Error
//! ```
//!
//! Per-connection errors (channel open, copy) are recorded in the stats and
//! never fail sibling connections. Consecutive channel-open failures are the
//! signal that the shared session has died: after a threshold the tunnel
//! moves to Error, where the auto-restart supervisor picks it up.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::client::SshClient;
use crate::error::{Error, Result};

/// Consecutive channel-open failures after which the tunnel goes to Error.
const MAX_CONSECUTIVE_CHANNEL_FAILURES: u32 = 3;

/// How long `stop` waits for in-flight connections to drain before tearing
/// them down.
const STOP_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// How long `stop` waits after force-closing before giving up.
const STOP_FORCE_TIMEOUT: Duration = Duration::from_secs(1);

/// Lifecycle state of a tunnel. Initial state is `Stopped`; every state is
/// re-entrant via restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelStatus {
    Stopped,
    Starting,
    Running,
    Error,
}

impl std::fmt::Display for TunnelStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TunnelStatus::Stopped => "stopped",
            TunnelStatus::Starting => "starting",
            TunnelStatus::Running => "running",
            TunnelStatus::Error => "error",
        };
        f.write_str(s)
    }
}

/// Point-in-time snapshot of a tunnel's counters.
#[derive(Debug, Clone, Default)]
pub struct TunnelStats {
    pub active_connections: u64,
    pub total_connections: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub channel_open_failures: u64,
    pub copy_errors: u64,
    pub last_error: Option<String>,
    pub last_started_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct Counters {
    active_connections: AtomicU64,
    total_connections: AtomicU64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    channel_open_failures: AtomicU64,
    copy_errors: AtomicU64,
}

impl Counters {
    /// Seed a fresh set of counters from a predecessor's snapshot. The
    /// monotonic counters continue where the old tunnel left off;
    /// `active_connections` starts at zero because in-flight connections
    /// die with the old tunnel and decrement its counters, not these.
    fn carry_from(prior: &TunnelStats) -> Self {
        Self {
            active_connections: AtomicU64::new(0),
            total_connections: AtomicU64::new(prior.total_connections),
            bytes_in: AtomicU64::new(prior.bytes_in),
            bytes_out: AtomicU64::new(prior.bytes_out),
            channel_open_failures: AtomicU64::new(prior.channel_open_failures),
            copy_errors: AtomicU64::new(prior.copy_errors),
        }
    }
}

struct State {
    status: TunnelStatus,
    last_error: Option<String>,
    last_started_at: Option<DateTime<Utc>>,
    local_addr: Option<SocketAddr>,
    accept_token: Option<CancellationToken>,
    conn_token: Option<CancellationToken>,
    accept_task: Option<JoinHandle<()>>,
}

/// State and counters shared with the accept loop and proxy tasks.
struct Shared {
    name: String,
    state: RwLock<State>,
    counters: Counters,
}

/// A single forwarding rule and the runtime that realizes it.
///
/// Exclusively owned by the manager, which mediates all access. The
/// operation lock serializes `start`/`stop`/`restart`; the snapshot readers
/// (`status`, `last_error`, `stats`) never take it.
pub struct Tunnel {
    remote_host: String,
    remote_port: u16,
    local_port: u16,
    ssh: Arc<SshClient>,
    op_lock: Mutex<()>,
    shared: Arc<Shared>,
}

impl Tunnel {
    pub fn new(
        name: impl Into<String>,
        ssh: Arc<SshClient>,
        remote_host: impl Into<String>,
        remote_port: u16,
        local_port: u16,
    ) -> Self {
        Self::with_counters(name, ssh, remote_host, remote_port, local_port, Counters::default())
    }

    /// Build a replacement for a tunnel whose config changed, carrying the
    /// predecessor's monotonic counters forward so the rebuild does not
    /// reset `total_connections` or the byte counts.
    pub fn replacing(
        name: impl Into<String>,
        ssh: Arc<SshClient>,
        remote_host: impl Into<String>,
        remote_port: u16,
        local_port: u16,
        prior: &TunnelStats,
    ) -> Self {
        Self::with_counters(
            name,
            ssh,
            remote_host,
            remote_port,
            local_port,
            Counters::carry_from(prior),
        )
    }

    fn with_counters(
        name: impl Into<String>,
        ssh: Arc<SshClient>,
        remote_host: impl Into<String>,
        remote_port: u16,
        local_port: u16,
        counters: Counters,
    ) -> Self {
        Self {
            remote_host: remote_host.into(),
            remote_port,
            local_port,
            ssh,
            op_lock: Mutex::new(()),
            shared: Arc::new(Shared {
                name: name.into(),
                state: RwLock::new(State {
                    status: TunnelStatus::Stopped,
                    last_error: None,
                    last_started_at: None,
                    local_addr: None,
                    accept_token: None,
                    conn_token: None,
                    accept_task: None,
                }),
                counters,
            }),
        }
    }

    /// Bind the local listener and spawn the accept loop.
    ///
    /// Establishes the shared SSH session on demand. Returns only after the
    /// listener is confirmed bound. Fails with [`Error::AlreadyRunning`] if
    /// the tunnel is Running or Starting, [`Error::SshUnavailable`] if the
    /// session cannot be established, and [`Error::ListenFailed`] if the
    /// bind fails.
    pub async fn start(&self) -> Result<()> {
        let _guard = self.op_lock.lock().await;
        self.start_locked().await
    }

    /// Close the listener, drain in-flight connections, and move to Stopped.
    ///
    /// Idempotent: stopping an already-stopped tunnel returns success. The
    /// active connection counter reaches zero before the status changes.
    pub async fn stop(&self) -> Result<()> {
        let _guard = self.op_lock.lock().await;
        self.stop_locked().await
    }

    /// `stop` followed by `start`, under a single operation lock so no
    /// caller observes a half-finished transition.
    pub async fn restart(&self) -> Result<()> {
        let _guard = self.op_lock.lock().await;
        self.stop_locked().await?;
        self.start_locked().await
    }

    pub async fn status(&self) -> TunnelStatus {
        self.shared.state.read().await.status
    }

    pub async fn last_error(&self) -> Option<String> {
        self.shared.state.read().await.last_error.clone()
    }

    /// The bound listener address while Running. With `local_port = 0` this
    /// is the only way to learn the ephemeral port.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.shared.state.read().await.local_addr
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub fn remote_host(&self) -> &str {
        &self.remote_host
    }

    pub fn remote_port(&self) -> u16 {
        self.remote_port
    }

    pub async fn stats(&self) -> TunnelStats {
        let c = &self.shared.counters;
        let state = self.shared.state.read().await;
        TunnelStats {
            active_connections: c.active_connections.load(Ordering::Relaxed),
            total_connections: c.total_connections.load(Ordering::Relaxed),
            bytes_in: c.bytes_in.load(Ordering::Relaxed),
            bytes_out: c.bytes_out.load(Ordering::Relaxed),
            channel_open_failures: c.channel_open_failures.load(Ordering::Relaxed),
            copy_errors: c.copy_errors.load(Ordering::Relaxed),
            last_error: state.last_error.clone(),
            last_started_at: state.last_started_at,
        }
    }

    async fn start_locked(&self) -> Result<()> {
        {
            let mut state = self.shared.state.write().await;
            match state.status {
                TunnelStatus::Running | TunnelStatus::Starting => {
                    return Err(Error::AlreadyRunning);
                }
                TunnelStatus::Stopped | TunnelStatus::Error => {}
            }
            state.status = TunnelStatus::Starting;
        }

        // The shared session must be usable before we accept anything.
        if let Err(e) = self.ssh.connect().await {
            let mut state = self.shared.state.write().await;
            state.status = TunnelStatus::Error;
            state.last_error = Some(e.to_string());
            return Err(e);
        }

        let listener = match TcpListener::bind(("127.0.0.1", self.local_port)).await {
            Ok(listener) => listener,
            Err(source) => {
                let err = Error::ListenFailed {
                    port: self.local_port,
                    source,
                };
                let mut state = self.shared.state.write().await;
                state.status = TunnelStatus::Error;
                state.last_error = Some(err.to_string());
                return Err(err);
            }
        };

        let local_addr = listener.local_addr().ok();
        let accept_token = CancellationToken::new();
        let conn_token = CancellationToken::new();

        let task = tokio::spawn(accept_loop(
            listener,
            self.ssh.clone(),
            self.remote_host.clone(),
            self.remote_port,
            self.shared.clone(),
            accept_token.clone(),
            conn_token.clone(),
        ));

        let mut state = self.shared.state.write().await;
        state.status = TunnelStatus::Running;
        state.last_error = None;
        state.last_started_at = Some(Utc::now());
        state.local_addr = local_addr;
        state.accept_token = Some(accept_token);
        state.conn_token = Some(conn_token);
        state.accept_task = Some(task);

        debug!(
            tunnel = %self.shared.name,
            addr = ?local_addr,
            "listening, forwarding to {}:{}",
            self.remote_host,
            self.remote_port
        );

        Ok(())
    }

    async fn stop_locked(&self) -> Result<()> {
        let (accept_token, conn_token, accept_task) = {
            let mut state = self.shared.state.write().await;
            if state.status == TunnelStatus::Stopped {
                return Ok(());
            }
            state.local_addr = None;
            (
                state.accept_token.take(),
                state.conn_token.take(),
                state.accept_task.take(),
            )
        };

        // Closing the listener is what wakes the accept loop; awaiting the
        // task guarantees the port is released before we return.
        if let Some(token) = accept_token {
            token.cancel();
        }
        if let Some(task) = accept_task {
            let _ = task.await;
        }

        if let Some(conn_token) = conn_token {
            if !self.wait_for_drain(STOP_DRAIN_TIMEOUT).await {
                debug!(tunnel = %self.shared.name, "forcing in-flight connections closed");
                conn_token.cancel();
                if !self.wait_for_drain(STOP_FORCE_TIMEOUT).await {
                    warn!(tunnel = %self.shared.name, "connections did not drain");
                    return Err(Error::StopTimeout(STOP_DRAIN_TIMEOUT + STOP_FORCE_TIMEOUT));
                }
            }
        }

        self.shared.state.write().await.status = TunnelStatus::Stopped;
        debug!(tunnel = %self.shared.name, "stopped");

        Ok(())
    }

    /// Poll the active-connection counter down to zero, bounded by `limit`.
    async fn wait_for_drain(&self, limit: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + limit;
        loop {
            if self
                .shared
                .counters
                .active_connections
                .load(Ordering::Relaxed)
                == 0
            {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

/// Accept local connections until cancelled, opening one `direct-tcpip`
/// channel per connection.
async fn accept_loop(
    listener: TcpListener,
    ssh: Arc<SshClient>,
    remote_host: String,
    remote_port: u16,
    shared: Arc<Shared>,
    accept_token: CancellationToken,
    conn_token: CancellationToken,
) {
    let mut consecutive_failures = 0u32;

    loop {
        let (stream, peer_addr) = tokio::select! {
            _ = accept_token.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    // The normal stop path closes the listener; anything
                    // else is transient and the loop keeps accepting.
                    if accept_token.is_cancelled() {
                        break;
                    }
                    warn!(tunnel = %shared.name, "accept failed: {}", e);
                    continue;
                }
            },
        };

        debug!(tunnel = %shared.name, peer = %peer_addr, "accepted connection");

        match ssh.open_direct_tcpip(&remote_host, remote_port).await {
            Ok(channel) => {
                consecutive_failures = 0;
                shared
                    .counters
                    .total_connections
                    .fetch_add(1, Ordering::Relaxed);
                shared
                    .counters
                    .active_connections
                    .fetch_add(1, Ordering::Relaxed);

                tokio::spawn(proxy(stream, channel, shared.clone(), conn_token.clone()));
            }
            Err(e) => {
                consecutive_failures += 1;
                shared
                    .counters
                    .channel_open_failures
                    .fetch_add(1, Ordering::Relaxed);
                warn!(
                    tunnel = %shared.name,
                    "channel open failed ({}/{}): {}",
                    consecutive_failures,
                    MAX_CONSECUTIVE_CHANNEL_FAILURES,
                    e
                );

                let mut state = shared.state.write().await;
                state.last_error = Some(e.to_string());
                if consecutive_failures >= MAX_CONSECUTIVE_CHANNEL_FAILURES {
                    state.status = TunnelStatus::Error;
                }
                // The local connection is dropped here; the listener stays
                // open and the loop keeps accepting.
            }
        }
    }
}

/// Proxy one connection until either side closes, an error occurs, or the
/// tunnel tears it down. Byte-transparent; half-close is propagated by the
/// copier.
async fn proxy(
    mut local: TcpStream,
    channel: russh::Channel<russh::client::Msg>,
    shared: Arc<Shared>,
    conn_token: CancellationToken,
) {
    let mut remote = channel.into_stream();

    tokio::select! {
        copied = tokio::io::copy_bidirectional(&mut local, &mut remote) => match copied {
            Ok((to_remote, to_local)) => {
                shared.counters.bytes_out.fetch_add(to_remote, Ordering::Relaxed);
                shared.counters.bytes_in.fetch_add(to_local, Ordering::Relaxed);
                debug!(
                    tunnel = %shared.name,
                    "connection closed: {} bytes out, {} bytes in",
                    to_remote,
                    to_local
                );
            }
            Err(e) => {
                shared.counters.copy_errors.fetch_add(1, Ordering::Relaxed);
                debug!(tunnel = %shared.name, "proxy ended: {}", e);
            }
        },
        _ = conn_token.cancelled() => {
            debug!(tunnel = %shared.name, "connection torn down on stop");
        }
    }

    shared
        .counters
        .active_connections
        .fetch_sub(1, Ordering::Relaxed);
}
