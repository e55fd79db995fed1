//! SSH agent session and listener.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use ssh_agent_lib::agent::{Session, listen};
use ssh_agent_lib::error::AgentError;
use ssh_agent_lib::proto::{
    AddIdentity, AddIdentityConstrained, Credential, Extension, Identity, KeyConstraint,
    RemoveIdentity, SignRequest,
};
use ssh_key::{PrivateKey, Signature};
use tokio::net::UnixListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::agent::{AddedKey, KeyAgent, SignatureFlags};
use crate::error::Error;

/// Per-connection protocol session.  Cheap to clone; every clone dispatches
/// to the same [`KeyAgent`].
#[derive(Clone)]
pub struct AgentSession {
    agent: Arc<dyn KeyAgent>,
}

impl AgentSession {
    pub fn new(agent: Arc<dyn KeyAgent>) -> Self {
        Self { agent }
    }
}

impl std::fmt::Debug for AgentSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentSession").finish_non_exhaustive()
    }
}

/// Every error becomes a plain `SSH_AGENT_FAILURE` on the wire.
fn failure(err: Error) -> AgentError {
    debug!("request failed: {err}");
    match err {
        Error::ExtensionUnsupported(_) => AgentError::Failure,
        other => AgentError::other(other),
    }
}

/// Convert a wire add request into an [`AddedKey`].
fn added_key(identity: AddIdentity, constraints: Vec<KeyConstraint>) -> Result<AddedKey, Error> {
    let (privkey, comment) = match identity.credential {
        Credential::Key { privkey, comment } => (privkey, comment),
        Credential::Cert { .. } => {
            return Err(Error::NotSupported("certificate identities"));
        }
    };
    let private_key = PrivateKey::new(privkey, comment.clone())?;
    let mut key = AddedKey::new(private_key).with_comment(comment);

    for constraint in constraints {
        match constraint {
            KeyConstraint::Lifetime(secs) => {
                key.lifetime = Some(Duration::from_secs(u64::from(secs)));
            }
            KeyConstraint::Confirm => key.confirm_before_use = true,
            #[allow(unreachable_patterns)]
            _ => return Err(Error::NotSupported("key constraint extensions")),
        }
    }
    Ok(key)
}

#[ssh_agent_lib::async_trait]
impl Session for AgentSession {
    async fn request_identities(&mut self) -> Result<Vec<Identity>, AgentError> {
        self.agent.list().await.map_err(failure)
    }

    async fn sign(&mut self, request: SignRequest) -> Result<Signature, AgentError> {
        let flags = SignatureFlags::from_bits(request.flags);
        self.agent
            .sign_with_flags(&request.pubkey, &request.data, flags)
            .await
            .map_err(failure)
    }

    async fn add_identity(&mut self, identity: AddIdentity) -> Result<(), AgentError> {
        let key = added_key(identity, Vec::new()).map_err(failure)?;
        self.agent.add(key).await.map_err(failure)
    }

    async fn add_identity_constrained(
        &mut self,
        identity: AddIdentityConstrained,
    ) -> Result<(), AgentError> {
        let AddIdentityConstrained {
            identity,
            constraints,
        } = identity;
        let key = added_key(identity, constraints).map_err(failure)?;
        self.agent.add(key).await.map_err(failure)
    }

    async fn remove_identity(&mut self, identity: RemoveIdentity) -> Result<(), AgentError> {
        self.agent.remove(&identity.pubkey).await.map_err(failure)
    }

    async fn remove_all_identities(&mut self) -> Result<(), AgentError> {
        self.agent.remove_all().await.map_err(failure)
    }

    async fn lock(&mut self, key: String) -> Result<(), AgentError> {
        let passphrase = Zeroizing::new(key);
        self.agent.lock(passphrase.as_bytes()).await.map_err(failure)
    }

    async fn unlock(&mut self, key: String) -> Result<(), AgentError> {
        let passphrase = Zeroizing::new(key);
        self.agent
            .unlock(passphrase.as_bytes())
            .await
            .map_err(failure)
    }

    async fn extension(&mut self, extension: Extension) -> Result<Option<Extension>, AgentError> {
        self.agent.extension(extension).await.map_err(failure)
    }
}

/// Accept connections on `listener` and serve each one on its own task until
/// `shutdown` is cancelled.
///
/// Returns [`Error::Cancelled`] on shutdown and an I/O error if the listener
/// fails.  Connections already being served are left to finish on their own.
pub async fn serve(
    listener: UnixListener,
    agent: Arc<dyn KeyAgent>,
    shutdown: CancellationToken,
) -> Result<(), Error> {
    let session = AgentSession::new(agent);
    tokio::select! {
        _ = shutdown.cancelled() => {
            info!("agent listener stopped");
            Err(Error::Cancelled)
        }
        result = listen(listener, session) => match result {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!("SSH agent listener failed: {e}");
                Err(Error::Io(io::Error::other(e)))
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use ssh_key::private::KeypairData;

    use super::*;
    use crate::keyring::Keyring;
    use crate::keyring::tests::{key_data, test_key};
    use crate::multiplexer::tests::Counting;

    fn add_request(seed: u8) -> AddIdentity {
        let key = test_key(seed);
        AddIdentity {
            credential: Credential::Key {
                privkey: key.key_data().clone(),
                comment: format!("added-{seed}"),
            },
        }
    }

    #[tokio::test]
    async fn add_with_constraints_reaches_the_keyring() {
        let keyring = Keyring::new();
        let mut session = AgentSession::new(Arc::new(keyring.clone()));

        let request = AddIdentityConstrained {
            identity: add_request(1),
            constraints: vec![KeyConstraint::Lifetime(60), KeyConstraint::Confirm],
        };
        assert!(session.add_identity_constrained(request).await.is_ok());

        let identities = match session.request_identities().await {
            Ok(ids) => ids,
            Err(err) => panic!("request_identities failed: {err}"),
        };
        assert_eq!(identities.len(), 1);
        assert_eq!(identities[0].comment, "added-1");
    }

    #[tokio::test]
    async fn sign_and_remove_round_trip_through_session() {
        let keyring = Keyring::new();
        let mut session = AgentSession::new(Arc::new(keyring.clone()));
        assert!(session.add_identity(add_request(3)).await.is_ok());

        let request = SignRequest {
            pubkey: key_data(3),
            data: b"challenge".to_vec(),
            flags: 0,
        };
        assert!(session.sign(request).await.is_ok());

        let removal = RemoveIdentity { pubkey: key_data(3) };
        assert!(session.remove_identity(removal).await.is_ok());
        assert!(keyring.is_empty());
    }

    #[tokio::test]
    async fn sign_passes_wire_flags_through() {
        let agent = Counting::with(&[4]).await;
        let mut session = AgentSession::new(agent.clone());

        let request = SignRequest {
            pubkey: key_data(4),
            data: b"challenge".to_vec(),
            flags: 0x04,
        };
        assert!(session.sign(request).await.is_ok());
        assert_eq!(agent.flags_seen(), [SignatureFlags::RSA_SHA2_512]);
    }

    #[tokio::test]
    async fn lock_and_unlock_use_the_passphrase_string() {
        let keyring = Keyring::new();
        let mut session = AgentSession::new(Arc::new(keyring.clone()));

        assert!(session.lock("pass".to_string()).await.is_ok());
        assert!(keyring.is_locked());
        assert!(session.unlock("nope".to_string()).await.is_err());
        assert!(session.unlock("pass".to_string()).await.is_ok());
        assert!(!keyring.is_locked());
    }

    #[tokio::test]
    async fn failures_map_to_agent_errors() {
        let mut session = AgentSession::new(Arc::new(Keyring::new()));
        let request = SignRequest {
            pubkey: key_data(1),
            data: Vec::new(),
            flags: 0,
        };
        assert!(session.sign(request).await.is_err());
        assert!(
            session
                .remove_identity(RemoveIdentity { pubkey: key_data(1) })
                .await
                .is_err()
        );
    }

    #[test]
    fn added_key_applies_lifetime() {
        let key = match added_key(add_request(2), vec![KeyConstraint::Lifetime(5)]) {
            Ok(k) => k,
            Err(err) => panic!("added_key failed: {err}"),
        };
        assert_eq!(key.lifetime, Some(Duration::from_secs(5)));
        assert!(!key.confirm_before_use);
        assert_eq!(key.comment, "added-2");
        assert!(matches!(key.private_key.key_data(), KeypairData::Ed25519(_)));
    }

    #[tokio::test]
    async fn serve_stops_on_cancellation() {
        let dir = match tempfile::tempdir() {
            Ok(d) => d,
            Err(err) => panic!("tempdir: {err}"),
        };
        let listener = match UnixListener::bind(dir.path().join("agent.sock")) {
            Ok(l) => l,
            Err(err) => panic!("bind: {err}"),
        };
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(serve(listener, Arc::new(Keyring::new()), shutdown.clone()));

        shutdown.cancel();
        match task.await {
            Ok(Err(Error::Cancelled)) => {}
            other => panic!("expected cancellation, got {other:?}"),
        }
    }
}
