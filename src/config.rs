//! Process configuration and the key material needed to accept a handshake.

use russh::keys::ssh_key::rand_core::OsRng;
use russh::keys::ssh_key::{Algorithm, PublicKey};
use russh::keys::PrivateKey;
use russh::{MethodKind, MethodSet};
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::error::ConfigError;

const DEFAULT_PORT_ATTEMPTS: u16 = 10;
const DEFAULT_INACTIVITY_SECS: u64 = 300;
const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 30;
const DEFAULT_SHELL: &str = "/bin/sh";

/// Settings read from the environment (and `.env`, loaded by `main`).
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub bind_address: IpAddr,
    /// Preferred starting port, 0 for an ephemeral one.
    pub port: u16,
    pub port_attempts: u16,
    pub host_key: Option<PathBuf>,
    pub authorized_keys: PathBuf,
    pub user: Option<String>,
    pub inactivity_timeout: Duration,
    /// How long in-flight connections may keep running after shutdown.
    pub shutdown_grace: Duration,
    pub shell: String,
}

impl ProxyConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build the configuration from any variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let bind_address = match var("PROXY_BIND_ADDRESS") {
            Some(value) => parse_setting("PROXY_BIND_ADDRESS", &value)?,
            None => IpAddr::V4(Ipv4Addr::LOCALHOST),
        };
        let port = match var("PROXY_PORT") {
            Some(value) => parse_setting("PROXY_PORT", &value)?,
            None => 0,
        };
        let port_attempts = match var("PROXY_PORT_ATTEMPTS") {
            Some(value) => parse_setting("PROXY_PORT_ATTEMPTS", &value)?,
            None => DEFAULT_PORT_ATTEMPTS,
        };
        if port_attempts == 0 {
            return Err(ConfigError::InvalidSetting {
                name: "PROXY_PORT_ATTEMPTS",
                value: "0".into(),
            });
        }
        let inactivity_timeout = match var("PROXY_INACTIVITY_TIMEOUT") {
            Some(value) => {
                Duration::from_secs(parse_setting("PROXY_INACTIVITY_TIMEOUT", &value)?)
            }
            None => Duration::from_secs(DEFAULT_INACTIVITY_SECS),
        };
        let shutdown_grace = match var("PROXY_SHUTDOWN_GRACE") {
            Some(value) => Duration::from_secs(parse_setting("PROXY_SHUTDOWN_GRACE", &value)?),
            None => Duration::from_secs(DEFAULT_SHUTDOWN_GRACE_SECS),
        };
        let authorized_keys = var("PROXY_AUTHORIZED_KEYS")
            .map(PathBuf::from)
            .ok_or(ConfigError::MissingSetting("PROXY_AUTHORIZED_KEYS"))?;

        Ok(Self {
            bind_address,
            port,
            port_attempts,
            host_key: var("PROXY_HOST_KEY").map(PathBuf::from),
            authorized_keys,
            user: var("PROXY_USER"),
            inactivity_timeout,
            shutdown_grace,
            shell: var("PROXY_SHELL").unwrap_or_else(|| DEFAULT_SHELL.to_string()),
        })
    }

    /// Load keys from disk and assemble the server side of the handshake.
    pub fn protocol_config(&self) -> Result<ProtocolServerConfig, ConfigError> {
        let host_key = match &self.host_key {
            Some(path) => load_host_key(path)?,
            None => {
                tracing::info!("No host key configured, generating an ephemeral Ed25519 key");
                generate_host_key()?
            }
        };
        let keys = load_authorized_keys(&self.authorized_keys)?;
        let auth = AuthPolicy::new(self.user.clone(), keys);
        Ok(ProtocolServerConfig::new(
            host_key,
            auth,
            Some(self.inactivity_timeout),
        ))
    }
}

fn parse_setting<T: std::str::FromStr>(name: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidSetting {
        name,
        value: value.to_string(),
    })
}

/// Which client keys (and optionally which user) may open a connection.
#[derive(Debug, Clone)]
pub struct AuthPolicy {
    user: Option<String>,
    keys: Vec<PublicKey>,
}

impl AuthPolicy {
    pub fn new(user: Option<String>, keys: Vec<PublicKey>) -> Self {
        Self { user, keys }
    }

    pub fn permits(&self, user: &str, key: &PublicKey) -> bool {
        if let Some(expected) = &self.user {
            if expected != user {
                return false;
            }
        }
        self.keys
            .iter()
            .any(|authorized| authorized.key_data() == key.key_data())
    }
}

/// Everything a connection needs to complete the SSH handshake.
#[derive(Clone)]
pub struct ProtocolServerConfig {
    pub ssh: Arc<russh::server::Config>,
    pub auth: Arc<AuthPolicy>,
}

impl ProtocolServerConfig {
    pub fn new(
        host_key: PrivateKey,
        auth: AuthPolicy,
        inactivity_timeout: Option<Duration>,
    ) -> Self {
        let mut methods = MethodSet::empty();
        methods.push(MethodKind::PublicKey);

        let ssh = russh::server::Config {
            inactivity_timeout,
            auth_rejection_time: Duration::from_secs(1),
            auth_rejection_time_initial: Some(Duration::from_secs(0)),
            methods,
            keys: vec![host_key],
            ..Default::default()
        };

        Self {
            ssh: Arc::new(ssh),
            auth: Arc::new(auth),
        }
    }
}

pub fn load_host_key(path: &Path) -> Result<PrivateKey, ConfigError> {
    tracing::info!("Loading host key from {}", path.display());
    russh::keys::load_secret_key(path, None).map_err(|source| ConfigError::HostKey {
        path: path.to_path_buf(),
        source,
    })
}

pub fn generate_host_key() -> Result<PrivateKey, ConfigError> {
    PrivateKey::random(&mut OsRng, Algorithm::Ed25519).map_err(ConfigError::HostKeyGeneration)
}

/// Parse an OpenSSH `authorized_keys` file, skipping blank lines and comments.
pub fn load_authorized_keys(path: &Path) -> Result<Vec<PublicKey>, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::AuthorizedKeysRead {
        path: path.to_path_buf(),
        source,
    })?;
    let keys = parse_authorized_keys(path, &text)?;
    if keys.is_empty() {
        return Err(ConfigError::NoAuthorizedKeys(path.to_path_buf()));
    }
    tracing::info!("Loaded {} authorized key(s) from {}", keys.len(), path.display());
    Ok(keys)
}

fn parse_authorized_keys(path: &Path, text: &str) -> Result<Vec<PublicKey>, ConfigError> {
    text.lines()
        .enumerate()
        .map(|(index, line)| (index + 1, line.trim()))
        .filter(|(_, line)| !line.is_empty() && !line.starts_with('#'))
        .map(|(line_no, line)| {
            PublicKey::from_openssh(line).map_err(|source| ConfigError::AuthorizedKeyParse {
                path: path.to_path_buf(),
                line: line_no,
                source,
            })
        })
        .collect()
}
