//! Credential presentation for the bastion session.
//!
//! Conduit authenticates with whatever the config provides: a password, a
//! private key file, or both. Each credential is one [`AuthStrategy`];
//! [`AuthChain`] presents them in priority order (password before key) and,
//! when nothing is accepted, reports a single failure naming every method
//! the server turned down.
//!
//! The distinction the retry layer needs is made here, where it is actually
//! known: a transport failure mid-handshake surfaces as
//! [`Error::SshUnavailable`] (retryable), while a bastion that answers and
//! says no is [`Error::AuthFailed`] (never retried).

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use russh::client;
use russh::keys;
use tracing::debug;

use crate::client::ClientHandler;
use crate::error::{Error, Result};

/// What the server said to one credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthOutcome {
    /// The session is authenticated.
    Accepted,
    /// The server turned this credential down; the next one may still work.
    Rejected,
}

/// One way of proving identity to the bastion.
#[async_trait]
pub trait AuthStrategy: Send + Sync {
    /// Present this credential on the session.
    ///
    /// Transport-level failures are errors; a clean refusal by the server
    /// is `Ok(AuthOutcome::Rejected)`.
    async fn attempt(
        &self,
        session: &mut client::Handle<ClientHandler>,
        user: &str,
    ) -> Result<AuthOutcome>;

    /// Method name as it appears in logs and failure messages.
    fn method(&self) -> &'static str;
}

fn outcome_of(result: client::AuthResult) -> AuthOutcome {
    match result {
        client::AuthResult::Success => AuthOutcome::Accepted,
        client::AuthResult::Failure { .. } => AuthOutcome::Rejected,
    }
}

/// Password credential.
pub struct PasswordAuth {
    password: String,
}

impl PasswordAuth {
    pub fn new(password: impl Into<String>) -> Self {
        Self {
            password: password.into(),
        }
    }
}

#[async_trait]
impl AuthStrategy for PasswordAuth {
    async fn attempt(
        &self,
        session: &mut client::Handle<ClientHandler>,
        user: &str,
    ) -> Result<AuthOutcome> {
        let result = session
            .authenticate_password(user, &self.password)
            .await
            .map_err(|e| Error::SshUnavailable(format!("password auth aborted: {e}")))?;

        Ok(outcome_of(result))
    }

    fn method(&self) -> &'static str {
        "password"
    }
}

/// Private key file credential. Only passphrase-less keys are supported;
/// an encrypted key fails at load time.
pub struct KeyAuth {
    key_file: PathBuf,
}

impl KeyAuth {
    pub fn new(key_file: impl Into<PathBuf>) -> Self {
        Self {
            key_file: key_file.into(),
        }
    }

    fn load(&self) -> Result<keys::PrivateKey> {
        keys::load_secret_key(&self.key_file, None)
            .map_err(|e| Error::AuthFailed(format!("cannot load key {}: {e}", self.key_file.display())))
    }
}

#[async_trait]
impl AuthStrategy for KeyAuth {
    async fn attempt(
        &self,
        session: &mut client::Handle<ClientHandler>,
        user: &str,
    ) -> Result<AuthOutcome> {
        let key = self.load()?;

        // RSA keys sign with the strongest hash both sides speak; other key
        // types ignore the hint.
        let hash = session
            .best_supported_rsa_hash()
            .await
            .map_err(|e| Error::SshUnavailable(format!("key auth aborted: {e}")))?
            .flatten();

        let result = session
            .authenticate_publickey(user, keys::PrivateKeyWithHashAlg::new(Arc::new(key), hash))
            .await
            .map_err(|e| Error::SshUnavailable(format!("key auth aborted: {e}")))?;

        Ok(outcome_of(result))
    }

    fn method(&self) -> &'static str {
        "key"
    }
}

/// The configured credentials, in the order they are presented.
pub struct AuthChain {
    strategies: Vec<Box<dyn AuthStrategy>>,
}

impl AuthChain {
    /// Assemble the chain from the config's credentials: password first when
    /// both are set, then the key file.
    pub fn from_credentials(password: Option<&str>, key_file: Option<&Path>) -> Self {
        let mut strategies: Vec<Box<dyn AuthStrategy>> = Vec::new();
        if let Some(password) = password {
            strategies.push(Box::new(PasswordAuth::new(password)));
        }
        if let Some(key_file) = key_file {
            strategies.push(Box::new(KeyAuth::new(key_file)));
        }
        Self { strategies }
    }

    /// Method names in presentation order.
    pub fn methods(&self) -> Vec<&'static str> {
        self.strategies.iter().map(|s| s.method()).collect()
    }

    /// Present each credential until one is accepted.
    ///
    /// Rejections accumulate; when nothing is accepted the failure names
    /// every refused method. A transport error aborts the chain immediately,
    /// since no credential can succeed on a broken session.
    pub async fn authenticate(
        &self,
        session: &mut client::Handle<ClientHandler>,
        user: &str,
    ) -> Result<()> {
        if self.strategies.is_empty() {
            return Err(Error::AuthFailed("no credentials configured".to_string()));
        }

        let mut rejected = Vec::with_capacity(self.strategies.len());

        for strategy in &self.strategies {
            debug!("presenting {} credential for {}", strategy.method(), user);
            match strategy.attempt(session, user).await? {
                AuthOutcome::Accepted => {
                    debug!("{} credential accepted", strategy.method());
                    return Ok(());
                }
                AuthOutcome::Rejected => rejected.push(strategy.method()),
            }
        }

        Err(Error::AuthFailed(format!(
            "server rejected {}",
            rejected.join(", ")
        )))
    }
}
