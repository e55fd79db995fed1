//! The operation surface shared by every agent backend.
//!
//! [`KeyAgent`] is implemented by the local [`Keyring`](crate::Keyring), the
//! [`UpstreamAgent`](crate::UpstreamAgent) connector and the
//! [`Multiplexer`](crate::Multiplexer) that composes the two.  Callers only
//! ever depend on the trait.

use std::fmt;
use std::ops::BitOr;
use std::sync::Arc;
use std::time::Duration;

use ssh_agent_lib::proto::{Extension, Identity};
use ssh_key::public::KeyData;
use ssh_key::{PrivateKey, Signature};

use crate::error::{Error, Result};

/// Signing-scheme hints carried by a sign request.
///
/// Passed through unmodified to whichever backend performs the signature.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct SignatureFlags(u32);

impl SignatureFlags {
    /// Request an `rsa-sha2-256` signature for RSA keys.
    pub const RSA_SHA2_256: Self = Self(0x02);
    /// Request an `rsa-sha2-512` signature for RSA keys.
    pub const RSA_SHA2_512: Self = Self(0x04);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        other.0 != 0 && self.0 & other.0 == other.0
    }
}

impl BitOr for SignatureFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// A private key submitted for addition, with its optional constraints.
///
/// Consumed by [`KeyAgent::add`]; nothing retains the record itself.
pub struct AddedKey {
    pub private_key: PrivateKey,
    pub comment: String,
    /// Remove the key automatically once this much time has passed.
    pub lifetime: Option<Duration>,
    pub confirm_before_use: bool,
}

impl AddedKey {
    /// Wrap a key without constraints, using the key's own comment.
    pub fn new(private_key: PrivateKey) -> Self {
        let comment = private_key.comment().to_string();
        Self {
            private_key,
            comment,
            lifetime: None,
            confirm_before_use: false,
        }
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = comment.into();
        self
    }

    pub fn with_lifetime(mut self, lifetime: Duration) -> Self {
        self.lifetime = Some(lifetime);
        self
    }
}

impl fmt::Debug for AddedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AddedKey")
            .field("algorithm", &self.private_key.algorithm())
            .field("comment", &self.comment)
            .field("lifetime", &self.lifetime)
            .field("confirm_before_use", &self.confirm_before_use)
            .finish_non_exhaustive()
    }
}

/// The credential-agent operation surface.
///
/// Mutating operations default to [`Error::NotSupported`] so that read-only
/// backends (the upstream connector) cannot alter key state by accident.
#[async_trait::async_trait]
pub trait KeyAgent: Send + Sync {
    async fn list(&self) -> Result<Vec<Identity>>;

    async fn signers(&self) -> Result<Vec<AgentSigner>>;

    async fn sign(&self, key: &KeyData, data: &[u8]) -> Result<Signature> {
        self.sign_with_flags(key, data, SignatureFlags::empty()).await
    }

    async fn sign_with_flags(
        &self,
        key: &KeyData,
        data: &[u8],
        flags: SignatureFlags,
    ) -> Result<Signature>;

    async fn add(&self, _key: AddedKey) -> Result<()> {
        Err(Error::NotSupported("add"))
    }

    async fn remove(&self, _key: &KeyData) -> Result<()> {
        Err(Error::NotSupported("remove"))
    }

    async fn remove_all(&self) -> Result<()> {
        Err(Error::NotSupported("remove all"))
    }

    async fn lock(&self, _passphrase: &[u8]) -> Result<()> {
        Err(Error::NotSupported("lock"))
    }

    async fn unlock(&self, _passphrase: &[u8]) -> Result<()> {
        Err(Error::NotSupported("unlock"))
    }

    async fn extension(&self, extension: Extension) -> Result<Option<Extension>> {
        Err(Error::ExtensionUnsupported(extension.name))
    }
}

/// A key together with the backend able to sign with it.
#[derive(Clone)]
pub struct AgentSigner {
    identity: Identity,
    key: KeyData,
    agent: Arc<dyn KeyAgent>,
}

impl AgentSigner {
    pub fn new(identity: Identity, key: KeyData, agent: Arc<dyn KeyAgent>) -> Self {
        Self {
            identity,
            key,
            agent,
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn public_key(&self) -> &KeyData {
        &self.key
    }

    /// Sign `data` with the backend that advertised this key.
    pub async fn sign(&self, data: &[u8], flags: SignatureFlags) -> Result<Signature> {
        self.agent.sign_with_flags(&self.key, data, flags).await
    }
}

impl fmt::Debug for AgentSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentSigner")
            .field("identity", &self.identity)
            .finish_non_exhaustive()
    }
}

/// Build the wire identity advertised for `key`.
pub(crate) fn identity_for(key: &KeyData, comment: &str) -> Identity {
    Identity {
        pubkey: key.clone().into(),
        comment: comment.to_string(),
    }
}
