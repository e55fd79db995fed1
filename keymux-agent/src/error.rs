//! Error types shared by every agent backend.

use std::io;

/// Failure of a key agent operation.
///
/// The same enum is returned by the local keyring, the upstream connector
/// and the multiplexer, so callers can match on the condition regardless of
/// which backend produced it.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("agent locked")]
    Locked,

    #[error("agent not locked")]
    NotLocked,

    #[error("agent already locked")]
    AlreadyLocked,

    #[error("incorrect passphrase")]
    IncorrectPassphrase,

    #[error("key not found")]
    KeyNotFound,

    #[error("{0} not supported")]
    NotSupported(&'static str),

    #[error("extension unsupported: {0}")]
    ExtensionUnsupported(String),

    /// No upstream configured, the dial failed, or the connector was closed.
    #[error("upstream agent unavailable: {0}")]
    Unavailable(String),

    /// The upstream agent answered but the operation failed.
    #[error("upstream agent: {0}")]
    Upstream(#[source] ssh_agent_lib::error::AgentError),

    /// Both the upstream agent and the local keyring failed to sign.
    #[error("no backend could sign (upstream: {upstream}; local: {local})")]
    NoSigner { upstream: Box<Error>, local: Box<Error> },

    #[error("invalid key: {0}")]
    InvalidKey(#[from] ssh_key::Error),

    #[error("RSA key: {0}")]
    Rsa(#[from] rsa::Error),

    #[error("signing failed: {0}")]
    Signing(#[from] signature::Error),

    #[error("shutting down")]
    Cancelled,

    #[error("key store lock poisoned")]
    Poisoned,

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// True for failures that mean "the backend is not there", as opposed to
    /// a backend that answered with an error.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Cancelled)
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
