//! Connector to an independently running upstream agent.
//!
//! The connector never keeps a connection around: every operation dials the
//! configured socket, performs exactly one request through
//! [`ssh_agent_lib::client::Client`] and drops the connection before
//! returning.  Operations are serialised, so at most one upstream connection
//! is open at any instant.
//!
//! An absent or unreachable upstream is not an error for listing: `list` and
//! `signers` report zero keys.  Signing reports [`Error::Unavailable`] so the
//! caller can fall back to local keys.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use ssh_agent_lib::agent::Session as _;
use ssh_agent_lib::client::Client;
use ssh_agent_lib::error::AgentError;
use ssh_agent_lib::proto::{Identity, SignRequest};
use ssh_key::Signature;
use ssh_key::public::KeyData;
use tokio::net::UnixStream;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::agent::{AgentSigner, KeyAgent, SignatureFlags};
use crate::error::{Error, Result};

/// Upper bound on one dial-and-request exchange with the upstream agent.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Zero-or-one upstream agent endpoint.
#[derive(Clone, Debug)]
pub struct UpstreamAgent {
    socket_path: Option<PathBuf>,
    timeout: Duration,
    closed: CancellationToken,
    exchange: Arc<Mutex<()>>,
}

impl UpstreamAgent {
    /// Connector for the agent listening on `socket_path`.
    ///
    /// An empty path means "no upstream configured".
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        let path = socket_path.into();
        let socket_path = (!path.as_os_str().is_empty()).then_some(path);
        Self {
            socket_path,
            timeout: DEFAULT_TIMEOUT,
            closed: CancellationToken::new(),
            exchange: Arc::new(Mutex::new(())),
        }
    }

    pub fn unconfigured() -> Self {
        Self::new(PathBuf::new())
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn socket_path(&self) -> Option<&Path> {
        self.socket_path.as_deref()
    }

    pub fn is_configured(&self) -> bool {
        self.socket_path.is_some()
    }

    /// Abort any in-flight exchange and refuse further ones.
    ///
    /// The aborted exchange drops (and thereby closes) its connection.
    /// Calling this more than once has no further effect.
    pub fn close(&self) {
        if !self.closed.is_cancelled() {
            debug!("upstream: closing connector");
        }
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Dial the upstream agent, hand the fresh client to `request`, and drop
    /// the connection once it completes, fails, times out or is aborted.
    async fn exchange<T, F, Fut>(&self, op: &'static str, request: F) -> Result<T>
    where
        F: FnOnce(Client<UnixStream>) -> Fut,
        Fut: Future<Output = std::result::Result<T, AgentError>>,
    {
        let path = self
            .socket_path
            .as_deref()
            .ok_or_else(|| Error::Unavailable("no upstream configured".to_string()))?;
        if self.closed.is_cancelled() {
            return Err(Error::Unavailable("connector closed".to_string()));
        }

        let _exclusive = self.exchange.lock().await;
        let attempt = async {
            let stream = UnixStream::connect(path).await.map_err(|e| {
                Error::Unavailable(format!("dial {}: {e}", path.display()))
            })?;
            debug!(op, socket = %path.display(), "upstream: connected");
            request(Client::new(stream)).await.map_err(Error::Upstream)
        };

        tokio::select! {
            _ = self.closed.cancelled() => {
                Err(Error::Unavailable("connector closed".to_string()))
            }
            outcome = tokio::time::timeout(self.timeout, attempt) => match outcome {
                Ok(result) => result,
                Err(_) => Err(Error::Unavailable(format!(
                    "{op} timed out after {:?}",
                    self.timeout
                ))),
            },
        }
    }

    /// List upstream identities, mapping "unavailable" to an empty set.
    async fn identities(&self) -> Result<Vec<Identity>> {
        let result = self
            .exchange("list", |mut client| async move {
                client.request_identities().await
            })
            .await;

        match result {
            Ok(identities) => {
                debug!(count = identities.len(), "upstream: list");
                Ok(identities)
            }
            Err(err) if err.is_unavailable() => {
                if self.is_configured() && !self.is_closed() {
                    warn!("upstream agent unavailable, treating as empty: {err}");
                }
                Ok(Vec::new())
            }
            Err(err) => Err(err),
        }
    }
}

#[async_trait::async_trait]
impl KeyAgent for UpstreamAgent {
    async fn list(&self) -> Result<Vec<Identity>> {
        self.identities().await
    }

    async fn signers(&self) -> Result<Vec<AgentSigner>> {
        let handle: Arc<dyn KeyAgent> = Arc::new(self.clone());
        let signers = self
            .identities()
            .await?
            .into_iter()
            .map(|identity| {
                let key = identity.pubkey.clone();
                AgentSigner::new(identity, key, Arc::clone(&handle))
            })
            .collect();
        Ok(signers)
    }

    async fn sign_with_flags(
        &self,
        key: &KeyData,
        data: &[u8],
        flags: SignatureFlags,
    ) -> Result<Signature> {
        let request = SignRequest {
            pubkey: key.clone(),
            data: data.to_vec(),
            flags: flags.bits(),
        };
        let signature = self
            .exchange("sign", |mut client| async move { client.sign(request).await })
            .await?;
        debug!(data_len = data.len(), flags = flags.bits(), "upstream: signed");
        Ok(signature)
    }
}
