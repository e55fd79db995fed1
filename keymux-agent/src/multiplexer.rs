//! Agent multiplexer.
//!
//! Presents the local keyring and the upstream agent as one agent:
//!
//! | operation                         | policy                                  |
//! |-----------------------------------|-----------------------------------------|
//! | `list`, `signers`                 | union of both; upstream failure ignored |
//! | `sign`, `sign_with_flags`         | upstream first, then local              |
//! | `add`, `remove`, `remove_all`     | local only                              |
//! | `lock`, `unlock`, `extension`     | local only                              |
//!
//! The upstream agent is a separate process whose key set and lock state are
//! never touched from here.

use std::sync::Arc;

use ssh_agent_lib::proto::{Extension, Identity};
use ssh_key::Signature;
use ssh_key::public::KeyData;
use tracing::{debug, warn};

use crate::agent::{AddedKey, AgentSigner, KeyAgent, SignatureFlags};
use crate::error::{Error, Result};

pub struct Multiplexer {
    local: Arc<dyn KeyAgent>,
    upstream: Arc<dyn KeyAgent>,
}

impl Multiplexer {
    pub fn new(local: Arc<dyn KeyAgent>, upstream: Arc<dyn KeyAgent>) -> Self {
        Self { local, upstream }
    }
}

impl std::fmt::Debug for Multiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Multiplexer").finish_non_exhaustive()
    }
}

/// Local entries first, then upstream entries not already present.
fn union<T>(mut local: Vec<T>, upstream: Vec<T>, same: impl Fn(&T, &T) -> bool) -> Vec<T> {
    let local_len = local.len();
    for candidate in upstream {
        if !local[..local_len].iter().any(|known| same(known, &candidate)) {
            local.push(candidate);
        }
    }
    local
}

fn upstream_or_empty<T>(what: &str, result: Result<Vec<T>>) -> Vec<T> {
    match result {
        Ok(items) => items,
        Err(err) => {
            warn!("upstream {what} failed, using local keys only: {err}");
            Vec::new()
        }
    }
}

#[async_trait::async_trait]
impl KeyAgent for Multiplexer {
    async fn list(&self) -> Result<Vec<Identity>> {
        let (upstream, local) = tokio::join!(self.upstream.list(), self.local.list());
        let local = local?;
        let upstream = upstream_or_empty("list", upstream);

        let (local_count, upstream_count) = (local.len(), upstream.len());
        let merged = union(local, upstream, |a, b| a.pubkey == b.pubkey);
        debug!(local = local_count, upstream = upstream_count, merged = merged.len(), "list");
        Ok(merged)
    }

    async fn signers(&self) -> Result<Vec<AgentSigner>> {
        let (upstream, local) = tokio::join!(self.upstream.signers(), self.local.signers());
        let local = local?;
        let upstream = upstream_or_empty("signers", upstream);
        Ok(union(local, upstream, |a, b| a.public_key() == b.public_key()))
    }

    async fn sign_with_flags(
        &self,
        key: &KeyData,
        data: &[u8],
        flags: SignatureFlags,
    ) -> Result<Signature> {
        let upstream_err = match self.upstream.sign_with_flags(key, data, flags).await {
            Ok(signature) => {
                debug!("sign: satisfied by upstream agent");
                return Ok(signature);
            }
            Err(err) => err,
        };
        debug!("sign: upstream declined ({upstream_err}), trying local keyring");

        match self.local.sign_with_flags(key, data, flags).await {
            Ok(signature) => {
                debug!("sign: satisfied by local keyring");
                Ok(signature)
            }
            Err(local_err) => {
                warn!("sign: no backend could sign (upstream: {upstream_err}; local: {local_err})");
                Err(Error::NoSigner {
                    upstream: Box::new(upstream_err),
                    local: Box::new(local_err),
                })
            }
        }
    }

    async fn add(&self, key: AddedKey) -> Result<()> {
        self.local.add(key).await
    }

    async fn remove(&self, key: &KeyData) -> Result<()> {
        self.local.remove(key).await
    }

    async fn remove_all(&self) -> Result<()> {
        self.local.remove_all().await
    }

    async fn lock(&self, passphrase: &[u8]) -> Result<()> {
        self.local.lock(passphrase).await
    }

    async fn unlock(&self, passphrase: &[u8]) -> Result<()> {
        self.local.unlock(passphrase).await
    }

    async fn extension(&self, extension: Extension) -> Result<Option<Extension>> {
        self.local.extension(extension).await
    }
}
