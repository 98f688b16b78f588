//! Declarative configuration: document types, loader, and validator.
//!
//! The config file is a YAML document with two sections: an `ssh` block
//! describing the bastion connection and a `tunnels` list of forwarding
//! rules. `${VAR}` tokens in the raw text are substituted from the
//! environment before parsing, so credentials can stay out of the file:
//!
//! ```yaml
//! ssh:
//!   host: bastion.internal
//!   user: deploy
//!   password: ${SSH_PASSWORD}
//! tunnels:
//!   - name: postgres
//!     remoteHost: db.internal
//!     remotePort: 5432
//!     localPort: 15432
//!     autoRestart:
//!       enabled: true
//!       interval: 30s
//! ```
//!
//! Durations are written in humane form (`100ms`, `30s`, `1m30s`).
//! Validation failures are reported with the offending index or name.

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Deserializer};

use crate::error::{Error, Result};

/// Default SSH port when the `ssh.port` field is omitted.
pub const DEFAULT_SSH_PORT: u16 = 22;

/// Default timeout for establishing the TCP+SSH connection to the bastion.
pub(crate) const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default maximum retry attempts for the bastion connection.
pub(crate) const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default initial delay between connection retries.
pub(crate) const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Cap on the exponential backoff delay between connection retries.
pub(crate) const MAX_RETRY_DELAY: Duration = Duration::from_secs(10);

/// Bastion connection parameters. Immutable once created; replaced wholesale
/// when the config is reconciled.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SshConfig {
    #[serde(default)]
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    #[serde(default)]
    pub user: String,
    /// Password authentication. At least one of `password`/`keyFile` is
    /// required; when both are set, password is tried first.
    #[serde(default)]
    pub password: Option<String>,
    /// Path to a private key file for public key authentication.
    #[serde(default)]
    pub key_file: Option<PathBuf>,
    /// Path to an OpenSSH `known_hosts` file. When set, host keys are
    /// verified against it; when unset, all host keys are accepted.
    #[serde(default)]
    pub known_hosts_file: Option<PathBuf>,
    #[serde(default, deserialize_with = "de_opt_duration")]
    pub connect_timeout: Option<Duration>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay", deserialize_with = "de_duration")]
    pub retry_delay: Duration,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: DEFAULT_SSH_PORT,
            user: String::new(),
            password: None,
            key_file: None,
            known_hosts_file: None,
            connect_timeout: None,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }
}

impl SshConfig {
    /// Effective connect timeout, falling back to the built-in default.
    pub(crate) fn connect_timeout_or_default(&self) -> Duration {
        self.connect_timeout.unwrap_or(DEFAULT_CONNECT_TIMEOUT)
    }

    fn validate(&self) -> std::result::Result<(), String> {
        if self.user.is_empty() {
            return Err("ssh: user is required".to_string());
        }
        if self.host.is_empty() {
            return Err("ssh: host is required".to_string());
        }
        if self.password.is_none() && self.key_file.is_none() {
            return Err("ssh: either password or keyFile is required".to_string());
        }
        Ok(())
    }
}

/// Auto-restart settings for a single tunnel.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct AutoRestartConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default, deserialize_with = "de_duration")]
    pub interval: Duration,
}

/// Declarative description of one forwarding rule. Pure data; compared by
/// value during reconcile.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelConfig {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub remote_host: String,
    #[serde(default)]
    pub remote_port: u16,
    /// Local listener port. 0 yields an ephemeral port and is rejected by
    /// validation; it is only meaningful for tests driving the API directly.
    #[serde(default)]
    pub local_port: u16,
    #[serde(default)]
    pub auto_restart: AutoRestartConfig,
}

/// Top-level configuration document.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub ssh: SshConfig,
    #[serde(default)]
    pub tunnels: Vec<TunnelConfig>,
}

impl Config {
    /// Checks the document for missing fields, invalid values, and duplicate
    /// tunnel definitions.
    pub fn validate(&self) -> Result<()> {
        self.ssh.validate().map_err(Error::ConfigInvalid)?;

        if self.tunnels.is_empty() {
            return Err(Error::ConfigInvalid(
                "at least one tunnel is required".to_string(),
            ));
        }

        let mut names = std::collections::HashSet::new();
        let mut local_ports = std::collections::HashSet::new();

        for (i, t) in self.tunnels.iter().enumerate() {
            if t.name.is_empty() {
                return Err(Error::ConfigInvalid(format!(
                    "tunnels[{i}].name is required"
                )));
            }
            if !names.insert(t.name.clone()) {
                return Err(Error::ConfigInvalid(format!(
                    "duplicate tunnel name: {}",
                    t.name
                )));
            }
            if t.remote_host.is_empty() {
                return Err(Error::ConfigInvalid(format!(
                    "tunnels[{i}].remoteHost is required"
                )));
            }
            if t.remote_port == 0 {
                return Err(Error::ConfigInvalid(format!(
                    "tunnels[{i}].remotePort must be greater than 0"
                )));
            }
            if t.local_port == 0 {
                return Err(Error::ConfigInvalid(format!(
                    "tunnels[{i}].localPort must be greater than 0"
                )));
            }
            if !local_ports.insert(t.local_port) {
                return Err(Error::ConfigInvalid(format!(
                    "duplicate localPort: {}",
                    t.local_port
                )));
            }
            if t.auto_restart.enabled && t.auto_restart.interval.is_zero() {
                return Err(Error::ConfigInvalid(format!(
                    "tunnels[{i}].autoRestart.interval must be greater than 0 when enabled"
                )));
            }
        }

        Ok(())
    }
}

/// Reads a config file, substitutes `${VAR}` tokens from the environment,
/// parses it, and validates the result.
pub fn load(path: &Path) -> Result<Config> {
    let raw = std::fs::read_to_string(path).map_err(|source| Error::ConfigIo {
        path: path.to_path_buf(),
        source,
    })?;

    let expanded = expand_env(&raw);
    let cfg: Config = serde_yaml::from_str(&expanded)?;
    cfg.validate()?;

    Ok(cfg)
}

/// Substitutes `${VAR}` tokens with the named environment variable. Unset
/// variables substitute the empty string. Text without a closing brace is
/// left untouched.
fn expand_env(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let name = &after[..end];
                if let Ok(value) = env::var(name) {
                    out.push_str(&value);
                }
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }

    out.push_str(rest);
    out
}

/// Parses a humane duration string: one or more `<number><unit>` segments
/// where unit is one of `ns`, `us`, `ms`, `s`, `m`, `h` (e.g. `100ms`,
/// `1m30s`, `0.5s`).
pub(crate) fn parse_duration(s: &str) -> std::result::Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty duration".to_string());
    }

    let mut total = Duration::ZERO;
    let mut rest = s;

    while !rest.is_empty() {
        let num_end = rest
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .ok_or_else(|| format!("missing unit in duration {s:?}"))?;
        if num_end == 0 {
            return Err(format!("invalid duration {s:?}"));
        }
        let value: f64 = rest[..num_end]
            .parse()
            .map_err(|_| format!("invalid number in duration {s:?}"))?;

        let unit_end = rest[num_end..]
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .map(|i| num_end + i)
            .unwrap_or(rest.len());
        let secs = match &rest[num_end..unit_end] {
            "ns" => value / 1e9,
            "us" => value / 1e6,
            "ms" => value / 1e3,
            "s" => value,
            "m" => value * 60.0,
            "h" => value * 3600.0,
            unit => return Err(format!("unknown unit {unit:?} in duration {s:?}")),
        };
        total += Duration::from_secs_f64(secs);
        rest = &rest[unit_end..];
    }

    Ok(total)
}

fn de_duration<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    parse_duration(&s).map_err(serde::de::Error::custom)
}

fn de_opt_duration<'de, D>(deserializer: D) -> std::result::Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    let s = Option::<String>::deserialize(deserializer)?;
    match s {
        Some(s) => parse_duration(&s).map(Some).map_err(serde::de::Error::custom),
        None => Ok(None),
    }
}

fn default_ssh_port() -> u16 {
    DEFAULT_SSH_PORT
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn default_retry_delay() -> Duration {
    DEFAULT_RETRY_DELAY
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::Mutex as StdMutex;

    // Serializes tests that touch process-wide environment variables.
    static ENV_TEST_MUTEX: once_cell::sync::Lazy<StdMutex<()>> =
        once_cell::sync::Lazy::new(|| StdMutex::new(()));

    fn valid_config() -> Config {
        Config {
            ssh: SshConfig {
                host: "bastion.example.com".to_string(),
                user: "deploy".to_string(),
                password: Some("secret".to_string()),
                ..SshConfig::default()
            },
            tunnels: vec![TunnelConfig {
                name: "postgres".to_string(),
                remote_host: "db.internal".to_string(),
                remote_port: 5432,
                local_port: 15432,
                ..TunnelConfig::default()
            }],
        }
    }

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        file.write_all(contents.as_bytes()).expect("write config");
        file
    }

    mod validation {
        use super::*;

        #[test]
        fn test_valid_config_passes() {
            assert!(valid_config().validate().is_ok());
        }

        #[test]
        fn test_missing_user() {
            let mut cfg = valid_config();
            cfg.ssh.user = String::new();
            let err = cfg.validate().unwrap_err();
            assert!(err.to_string().contains("user is required"));
        }

        #[test]
        fn test_missing_host() {
            let mut cfg = valid_config();
            cfg.ssh.host = String::new();
            let err = cfg.validate().unwrap_err();
            assert!(err.to_string().contains("host is required"));
        }

        #[test]
        fn test_missing_credentials() {
            let mut cfg = valid_config();
            cfg.ssh.password = None;
            cfg.ssh.key_file = None;
            let err = cfg.validate().unwrap_err();
            assert!(err.to_string().contains("password or keyFile"));
        }

        #[test]
        fn test_key_file_alone_is_enough() {
            let mut cfg = valid_config();
            cfg.ssh.password = None;
            cfg.ssh.key_file = Some(PathBuf::from("/home/deploy/.ssh/id_ed25519"));
            assert!(cfg.validate().is_ok());
        }

        #[test]
        fn test_no_tunnels() {
            let mut cfg = valid_config();
            cfg.tunnels.clear();
            let err = cfg.validate().unwrap_err();
            assert!(err.to_string().contains("at least one tunnel"));
        }

        #[test]
        fn test_missing_tunnel_name_reports_index() {
            let mut cfg = valid_config();
            cfg.tunnels.push(TunnelConfig {
                remote_host: "redis.internal".to_string(),
                remote_port: 6379,
                local_port: 16379,
                ..TunnelConfig::default()
            });
            let err = cfg.validate().unwrap_err();
            assert!(err.to_string().contains("tunnels[1].name"));
        }

        #[test]
        fn test_duplicate_name_reports_name() {
            let mut cfg = valid_config();
            let mut dup = cfg.tunnels[0].clone();
            dup.local_port = 15433;
            cfg.tunnels.push(dup);
            let err = cfg.validate().unwrap_err();
            assert!(err.to_string().contains("duplicate tunnel name: postgres"));
        }

        #[test]
        fn test_missing_remote_host() {
            let mut cfg = valid_config();
            cfg.tunnels[0].remote_host = String::new();
            let err = cfg.validate().unwrap_err();
            assert!(err.to_string().contains("tunnels[0].remoteHost"));
        }

        #[test]
        fn test_zero_remote_port() {
            let mut cfg = valid_config();
            cfg.tunnels[0].remote_port = 0;
            let err = cfg.validate().unwrap_err();
            assert!(err.to_string().contains("tunnels[0].remotePort"));
        }

        #[test]
        fn test_zero_local_port() {
            let mut cfg = valid_config();
            cfg.tunnels[0].local_port = 0;
            let err = cfg.validate().unwrap_err();
            assert!(err.to_string().contains("tunnels[0].localPort"));
        }

        #[test]
        fn test_duplicate_local_port_reports_port() {
            let mut cfg = valid_config();
            cfg.tunnels.push(TunnelConfig {
                name: "redis".to_string(),
                remote_host: "redis.internal".to_string(),
                remote_port: 6379,
                local_port: 15432,
                ..TunnelConfig::default()
            });
            let err = cfg.validate().unwrap_err();
            assert!(err.to_string().contains("duplicate localPort: 15432"));
        }

        #[test]
        fn test_auto_restart_enabled_requires_interval() {
            let mut cfg = valid_config();
            cfg.tunnels[0].auto_restart = AutoRestartConfig {
                enabled: true,
                interval: Duration::ZERO,
            };
            let err = cfg.validate().unwrap_err();
            assert!(err.to_string().contains("tunnels[0].autoRestart.interval"));
        }

        #[test]
        fn test_auto_restart_disabled_ignores_interval() {
            let mut cfg = valid_config();
            cfg.tunnels[0].auto_restart = AutoRestartConfig {
                enabled: false,
                interval: Duration::ZERO,
            };
            assert!(cfg.validate().is_ok());
        }
    }

    mod loading {
        use super::*;

        const VALID_YAML: &str = r#"
ssh:
  host: bastion.example.com
  user: deploy
  password: secret
tunnels:
  - name: postgres
    remoteHost: db.internal
    remotePort: 5432
    localPort: 15432
    autoRestart:
      enabled: true
      interval: 30s
"#;

        #[test]
        fn test_load_valid_file() {
            let file = write_config(VALID_YAML);
            let cfg = load(file.path()).expect("load");
            assert_eq!(cfg.ssh.host, "bastion.example.com");
            assert_eq!(cfg.ssh.port, DEFAULT_SSH_PORT);
            assert_eq!(cfg.tunnels.len(), 1);
            assert_eq!(cfg.tunnels[0].name, "postgres");
            assert_eq!(cfg.tunnels[0].local_port, 15432);
            assert!(cfg.tunnels[0].auto_restart.enabled);
            assert_eq!(
                cfg.tunnels[0].auto_restart.interval,
                Duration::from_secs(30)
            );
        }

        #[test]
        fn test_load_missing_file() {
            let err = load(Path::new("/nonexistent/config.yaml")).unwrap_err();
            assert!(matches!(err, Error::ConfigIo { .. }));
        }

        #[test]
        fn test_load_unparseable_file() {
            let file = write_config("ssh: [not a mapping");
            let err = load(file.path()).unwrap_err();
            assert!(matches!(err, Error::ConfigParse(_)));
        }

        #[test]
        fn test_load_invalid_file() {
            let file = write_config("ssh:\n  host: bastion\n  user: deploy\n  password: x\ntunnels: []\n");
            let err = load(file.path()).unwrap_err();
            assert!(matches!(err, Error::ConfigInvalid(_)));
        }

        #[test]
        fn test_load_substitutes_env_vars() {
            let _guard = ENV_TEST_MUTEX.lock().unwrap();
            // SAFETY: ENV_TEST_MUTEX serializes all env mutation in tests
            unsafe { env::set_var("CONDUIT_TEST_PASSWORD", "hunter2") };

            let file = write_config(
                "ssh:\n  host: bastion\n  user: deploy\n  password: ${CONDUIT_TEST_PASSWORD}\ntunnels:\n  - name: t\n    remoteHost: db\n    remotePort: 5432\n    localPort: 15432\n",
            );
            let cfg = load(file.path()).expect("load");

            // SAFETY: ENV_TEST_MUTEX serializes all env mutation in tests
            unsafe { env::remove_var("CONDUIT_TEST_PASSWORD") };
            assert_eq!(cfg.ssh.password.as_deref(), Some("hunter2"));
        }
    }

    mod env_expansion {
        use super::*;

        #[test]
        fn test_expands_set_variable() {
            let _guard = ENV_TEST_MUTEX.lock().unwrap();
            // SAFETY: ENV_TEST_MUTEX serializes all env mutation in tests
            unsafe { env::set_var("CONDUIT_TEST_VAR", "value") };
            let expanded = expand_env("a ${CONDUIT_TEST_VAR} b");
            // SAFETY: ENV_TEST_MUTEX serializes all env mutation in tests
            unsafe { env::remove_var("CONDUIT_TEST_VAR") };
            assert_eq!(expanded, "a value b");
        }

        #[test]
        fn test_unset_variable_becomes_empty() {
            let _guard = ENV_TEST_MUTEX.lock().unwrap();
            assert_eq!(expand_env("a ${CONDUIT_TEST_UNSET} b"), "a  b");
        }

        #[test]
        fn test_unterminated_token_left_alone() {
            assert_eq!(expand_env("a ${UNTERMINATED"), "a ${UNTERMINATED");
        }

        #[test]
        fn test_no_tokens() {
            assert_eq!(expand_env("plain text"), "plain text");
        }

        #[test]
        fn test_multiple_tokens() {
            let _guard = ENV_TEST_MUTEX.lock().unwrap();
            // SAFETY: ENV_TEST_MUTEX serializes all env mutation in tests
            unsafe {
                env::set_var("CONDUIT_TEST_A", "1");
                env::set_var("CONDUIT_TEST_B", "2");
            }
            let expanded = expand_env("${CONDUIT_TEST_A}-${CONDUIT_TEST_B}");
            // SAFETY: ENV_TEST_MUTEX serializes all env mutation in tests
            unsafe {
                env::remove_var("CONDUIT_TEST_A");
                env::remove_var("CONDUIT_TEST_B");
            }
            assert_eq!(expanded, "1-2");
        }
    }

    mod durations {
        use super::*;

        #[test]
        fn test_milliseconds() {
            assert_eq!(parse_duration("100ms").unwrap(), Duration::from_millis(100));
        }

        #[test]
        fn test_seconds() {
            assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        }

        #[test]
        fn test_minutes_and_hours() {
            assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
            assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        }

        #[test]
        fn test_compound() {
            assert_eq!(parse_duration("1m30s").unwrap(), Duration::from_secs(90));
        }

        #[test]
        fn test_fractional() {
            assert_eq!(parse_duration("0.5s").unwrap(), Duration::from_millis(500));
        }

        #[test]
        fn test_missing_unit() {
            assert!(parse_duration("30").is_err());
        }

        #[test]
        fn test_unknown_unit() {
            assert!(parse_duration("30x").is_err());
        }

        #[test]
        fn test_empty() {
            assert!(parse_duration("").is_err());
        }
    }
}
