//! Error taxonomy for the conduit core.
//!
//! Lifecycle errors (`start`/`stop`/`restart`/`add`/`remove`) are returned to
//! callers; the manager wraps tunnel errors with the tunnel name. Errors on
//! individual forwarded connections never surface here: they are recorded in
//! the tunnel's stats and stay local to the connection.
//!
//! The connect retry layer decides whether to retry by [`Error::is_transient`],
//! which classifies by variant rather than by scraping message text: the
//! layers that produce the errors know whether the failure was the network
//! or the credentials, and encode that in the variant they pick. A refused
//! credential is [`Error::AuthFailed`] and is never retried; a dead or
//! unreachable session is [`Error::SshUnavailable`] and is.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type for the conduit core.
#[derive(Debug, Error)]
pub enum Error {
    /// Reading the config file from disk failed.
    #[error("failed to read config file {path}: {source}")]
    ConfigIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The config document did not parse.
    #[error("failed to parse config file: {0}")]
    ConfigParse(#[from] serde_yaml::Error),

    /// The config document parsed but violated a validation rule.
    #[error("invalid config: {0}")]
    ConfigInvalid(String),

    /// A tunnel with this name is already registered.
    #[error("tunnel {0} already exists")]
    NameInUse(String),

    /// No tunnel with this name is registered.
    #[error("tunnel {0} not found")]
    NotFound(String),

    /// `start` was called while the tunnel was Running or Starting.
    #[error("tunnel is already running")]
    AlreadyRunning,

    /// Binding the local listener failed (port busy, permission denied).
    #[error("failed to listen on 127.0.0.1:{port}: {source}")]
    ListenFailed {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    /// The shared SSH session could not be established or has died.
    #[error("ssh session unavailable: {0}")]
    SshUnavailable(String),

    /// The bastion answered and refused the configured credentials.
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// Opening a `direct-tcpip` channel for one connection failed.
    #[error("failed to open direct-tcpip channel: {0}")]
    ChannelOpenFailed(String),

    /// In-flight connections did not drain within the stop bound.
    #[error("tunnel did not stop within {0:?}")]
    StopTimeout(Duration),

    /// A tunnel-level error, wrapped with the tunnel name by the manager.
    #[error("tunnel {name}: {source}")]
    Tunnel {
        name: String,
        #[source]
        source: Box<Error>,
    },

    /// Shutting down the manager left tunnels in a failed state.
    #[error("errors closing manager: {0}")]
    Close(String),

    /// Creating or starting the filesystem watcher failed.
    #[error("watcher: {0}")]
    Watch(#[from] notify::Error),
}

impl Error {
    /// Wrap a tunnel-level error with the tunnel's name.
    pub(crate) fn for_tunnel(name: &str, source: Error) -> Error {
        Error::Tunnel {
            name: name.to_string(),
            source: Box::new(source),
        }
    }

    /// Whether retrying the failed operation could plausibly succeed.
    ///
    /// Connection-level failures are transient: the bastion may be
    /// restarting, the network flaky, the shared session freshly dead.
    /// Everything else is permanent from the retry layer's point of view;
    /// in particular a refused credential is never retried, since that only
    /// hammers the account towards a lockout.
    pub(crate) fn is_transient(&self) -> bool {
        matches!(self, Error::SshUnavailable(_) | Error::ChannelOpenFailed(_))
    }
}
