//! In-memory key store.
//!
//! The [`Keyring`] holds the private keys owned by this process: keys
//! preloaded at startup and keys added by clients over the agent socket.
//! Every mutating agent operation lands here and nowhere else.
//!
//! Thread safety: all state lives behind one `Arc<RwLock<…>>`; clones of a
//! [`Keyring`] are handles onto the same store.  No lock is ever held across
//! an `.await`.

use std::fmt;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

use rsa::BigUint;
use rsa::pkcs1v15::SigningKey;
use rsa::signature::SignatureEncoding as _;
use sha1::Sha1;
use sha2::{Sha256, Sha512};
use signature::Signer as _;
use ssh_agent_lib::proto::Identity;
use ssh_key::private::{KeypairData, RsaKeypair};
use ssh_key::public::KeyData;
use ssh_key::{Algorithm, HashAlg, Mpint, PrivateKey, Signature};
use tracing::{debug, warn};
use zeroize::Zeroizing;

use crate::agent::{AddedKey, AgentSigner, KeyAgent, SignatureFlags, identity_for};
use crate::error::{Error, Result};

/// An individual key held by the keyring.
pub struct KeyEntry {
    /// The private key (zeroized on drop via `ssh_key::PrivateKey`).
    pub private_key: PrivateKey,

    /// Comment advertised alongside the public key.
    pub comment: String,

    /// SHA-256 fingerprint string (e.g. `"SHA256:abc123…"`), for logging.
    pub fingerprint: String,

    /// Set from the `lifetime` constraint.
    pub expires_at: Option<Instant>,

    pub confirm_before_use: bool,
}

impl KeyEntry {
    fn from_added(key: AddedKey) -> Self {
        let fingerprint = key.private_key.fingerprint(HashAlg::Sha256).to_string();
        Self {
            expires_at: key.lifetime.map(|lifetime| Instant::now() + lifetime),
            private_key: key.private_key,
            comment: key.comment,
            fingerprint,
            confirm_before_use: key.confirm_before_use,
        }
    }

    pub fn key_data(&self) -> &KeyData {
        self.private_key.public_key().key_data()
    }

    fn identity(&self) -> Identity {
        identity_for(self.key_data(), &self.comment)
    }
}

impl fmt::Debug for KeyEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyEntry")
            .field("comment", &self.comment)
            .field("fingerprint", &self.fingerprint)
            .field("expires_at", &self.expires_at)
            .field("confirm_before_use", &self.confirm_before_use)
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
struct KeyringState {
    /// Insertion order is the order keys are advertised in.
    entries: Vec<KeyEntry>,
    /// `Some` while locked.
    passphrase: Option<Zeroizing<Vec<u8>>>,
}

impl KeyringState {
    fn is_locked(&self) -> bool {
        self.passphrase.is_some()
    }

    fn position(&self, key: &KeyData) -> Option<usize> {
        self.entries.iter().position(|e| e.key_data() == key)
    }

    fn prune_expired(&mut self, now: Instant) {
        self.entries.retain(|e| match e.expires_at {
            Some(at) if at <= now => {
                debug!(fingerprint = %e.fingerprint, "keyring: key lifetime expired");
                false
            }
            _ => true,
        });
    }
}

/// Shared, thread-safe in-process keyring.
#[derive(Clone, Default)]
pub struct Keyring {
    state: Arc<RwLock<KeyringState>>,
}

impl Keyring {
    /// Create an empty, unlocked keyring.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys currently held, including expired ones not yet pruned.
    pub fn len(&self) -> usize {
        self.read().map(|s| s.entries.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_locked(&self) -> bool {
        self.read().map(|s| s.is_locked()).unwrap_or(true)
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, KeyringState>> {
        self.state.read().map_err(|_| Error::Poisoned)
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, KeyringState>> {
        self.state.write().map_err(|_| Error::Poisoned)
    }

    /// Prune expired keys and return the unlocked entries' projection.
    fn snapshot<T>(&self, f: impl Fn(&KeyEntry) -> T) -> Result<Vec<T>> {
        let mut state = self.write()?;
        state.prune_expired(Instant::now());
        if state.is_locked() {
            return Ok(Vec::new());
        }
        Ok(state.entries.iter().map(f).collect())
    }
}

impl fmt::Debug for Keyring {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keyring")
            .field("keys", &self.len())
            .field("locked", &self.is_locked())
            .finish()
    }
}

fn sign_entry(entry: &KeyEntry, data: &[u8], flags: SignatureFlags) -> Result<Signature> {
    match entry.private_key.key_data() {
        KeypairData::Rsa(keypair) => sign_rsa(keypair, data, flags),
        _ => Ok(entry.private_key.try_sign(data)?),
    }
}

/// Rebuild the `rsa` crate's private key from the OpenSSH components.
pub(crate) fn rsa_private_key(keypair: &RsaKeypair) -> Result<rsa::RsaPrivateKey> {
    let uint = |mpint: &Mpint| {
        mpint
            .as_positive_bytes()
            .map(BigUint::from_bytes_be)
            .ok_or(Error::NotSupported("RSA key with a non-positive component"))
    };
    let key = rsa::RsaPrivateKey::from_components(
        uint(&keypair.public.n)?,
        uint(&keypair.public.e)?,
        uint(&keypair.private.d)?,
        vec![uint(&keypair.private.p)?, uint(&keypair.private.q)?],
    )?;
    Ok(key)
}

/// PKCS#1 v1.5 signature: `rsa-sha2-512` or `rsa-sha2-256` when requested,
/// legacy SHA-1 `ssh-rsa` otherwise.
fn sign_rsa(keypair: &RsaKeypair, data: &[u8], flags: SignatureFlags) -> Result<Signature> {
    let key = rsa_private_key(keypair)?;
    let (hash, bytes) = if flags.contains(SignatureFlags::RSA_SHA2_512) {
        let signer = SigningKey::<Sha512>::new(key);
        (Some(HashAlg::Sha512), signer.try_sign(data)?.to_vec())
    } else if flags.contains(SignatureFlags::RSA_SHA2_256) {
        let signer = SigningKey::<Sha256>::new(key);
        (Some(HashAlg::Sha256), signer.try_sign(data)?.to_vec())
    } else {
        let signer = SigningKey::<Sha1>::new(key);
        (None, signer.try_sign(data)?.to_vec())
    };
    Ok(Signature::new(Algorithm::Rsa { hash }, bytes)?)
}

fn passphrase_matches(expected: &[u8], given: &[u8]) -> bool {
    expected.len() == given.len()
        && expected
            .iter()
            .zip(given)
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
}

#[async_trait::async_trait]
impl KeyAgent for Keyring {
    async fn list(&self) -> Result<Vec<Identity>> {
        let identities = self.snapshot(KeyEntry::identity)?;
        debug!(count = identities.len(), "keyring: list");
        Ok(identities)
    }

    async fn signers(&self) -> Result<Vec<AgentSigner>> {
        let handle: Arc<dyn KeyAgent> = Arc::new(self.clone());
        self.snapshot(|entry| {
            AgentSigner::new(entry.identity(), entry.key_data().clone(), Arc::clone(&handle))
        })
    }

    async fn sign_with_flags(
        &self,
        key: &KeyData,
        data: &[u8],
        flags: SignatureFlags,
    ) -> Result<Signature> {
        let mut state = self.write()?;
        state.prune_expired(Instant::now());
        if state.is_locked() {
            return Err(Error::Locked);
        }
        let idx = state.position(key).ok_or(Error::KeyNotFound)?;
        let entry = &state.entries[idx];

        if entry.confirm_before_use {
            warn!(
                fingerprint = %entry.fingerprint,
                comment = %entry.comment,
                "sign request for key added with confirm constraint (no confirmation available, allowing)"
            );
        }

        debug!(
            fingerprint = %entry.fingerprint,
            data_len = data.len(),
            flags = flags.bits(),
            "keyring: sign"
        );
        sign_entry(entry, data, flags)
    }

    async fn add(&self, key: AddedKey) -> Result<()> {
        if key.private_key.is_encrypted() {
            return Err(Error::NotSupported("encrypted private key"));
        }
        let entry = KeyEntry::from_added(key);

        let mut state = self.write()?;
        if state.is_locked() {
            return Err(Error::Locked);
        }
        debug!(
            fingerprint = %entry.fingerprint,
            comment = %entry.comment,
            lifetime = ?entry.expires_at.map(|at| at.saturating_duration_since(Instant::now())),
            "keyring: adding key"
        );
        match state.position(entry.key_data()) {
            Some(idx) => state.entries[idx] = entry,
            None => state.entries.push(entry),
        }
        Ok(())
    }

    async fn remove(&self, key: &KeyData) -> Result<()> {
        let mut state = self.write()?;
        if state.is_locked() {
            return Err(Error::Locked);
        }
        let idx = state.position(key).ok_or(Error::KeyNotFound)?;
        let removed = state.entries.remove(idx);
        debug!(fingerprint = %removed.fingerprint, "keyring: removed key");
        Ok(())
    }

    async fn remove_all(&self) -> Result<()> {
        let mut state = self.write()?;
        if state.is_locked() {
            return Err(Error::Locked);
        }
        let removed = state.entries.len();
        state.entries.clear();
        debug!(removed, "keyring: removed all keys");
        Ok(())
    }

    async fn lock(&self, passphrase: &[u8]) -> Result<()> {
        let mut state = self.write()?;
        if state.is_locked() {
            return Err(Error::AlreadyLocked);
        }
        state.passphrase = Some(Zeroizing::new(passphrase.to_vec()));
        debug!("keyring: locked");
        Ok(())
    }

    async fn unlock(&self, passphrase: &[u8]) -> Result<()> {
        let mut state = self.write()?;
        let expected = state.passphrase.as_ref().ok_or(Error::NotLocked)?;
        if !passphrase_matches(expected, passphrase) {
            return Err(Error::IncorrectPassphrase);
        }
        state.passphrase = None;
        debug!("keyring: unlocked");
        Ok(())
    }
}
