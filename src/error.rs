use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while turning process configuration into a running listener.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    MissingSetting(&'static str),

    #[error("invalid value {value:?} for {name}")]
    InvalidSetting { name: &'static str, value: String },

    #[error("failed to load host key from {}", path.display())]
    HostKey {
        path: PathBuf,
        #[source]
        source: russh::keys::Error,
    },

    #[error("failed to generate host key")]
    HostKeyGeneration(#[source] russh::keys::ssh_key::Error),

    #[error("failed to read authorized keys from {}", path.display())]
    AuthorizedKeysRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid authorized key on line {line} of {}", path.display())]
    AuthorizedKeyParse {
        path: PathBuf,
        line: usize,
        #[source]
        source: russh::keys::ssh_key::Error,
    },

    #[error("no authorized keys found in {}", .0.display())]
    NoAuthorizedKeys(PathBuf),

    #[error("no free port in {start}..={end}")]
    NoFreePort {
        start: u16,
        end: u16,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
