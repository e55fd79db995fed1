//! Proxy lifecycle: listening socket, shared keyring, upstream connector and
//! the cancellation token that stops them.

use std::io;
use std::os::unix::fs::{FileTypeExt as _, PermissionsExt as _};
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::net::UnixListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agent::{AddedKey, KeyAgent};
use crate::error::{Error, Result};
use crate::keyring::Keyring;
use crate::multiplexer::Multiplexer;
use crate::session;
use crate::upstream::UpstreamAgent;

/// Unlink a socket left behind by a previous run.
///
/// Only a socket that refuses connections is removed: a live socket belongs
/// to a running agent and anything else is not ours to delete.
fn remove_stale_socket(path: &Path) -> Result<()> {
    let meta = match std::fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => {
            return Err(io::Error::new(e.kind(), format!("stat {}: {e}", path.display())).into());
        }
    };
    if !meta.file_type().is_socket() {
        return Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("{} exists and is not a socket", path.display()),
        )
        .into());
    }
    if StdUnixStream::connect(path).is_ok() {
        return Err(io::Error::new(
            io::ErrorKind::AddrInUse,
            format!("an agent is already listening on {}", path.display()),
        )
        .into());
    }

    debug!(path = %path.display(), "removing stale agent socket");
    std::fs::remove_file(path).map_err(|e| {
        io::Error::new(e.kind(), format!("remove stale socket {}: {e}", path.display()))
    })?;
    Ok(())
}

/// Cloneable handle that shuts a [`ProxyAgent`] down.
///
/// Safe to use from a signal task while the proxy is serving.
#[derive(Clone, Debug)]
pub struct ShutdownHandle {
    token: CancellationToken,
    upstream: Arc<UpstreamAgent>,
}

impl ShutdownHandle {
    /// Stop accepting connections and abort any in-flight upstream exchange.
    ///
    /// Idempotent.
    pub fn close(&self) {
        if !self.token.is_cancelled() {
            info!("stopping SSH agent proxy");
        }
        self.token.cancel();
        self.upstream.close();
    }

    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// A bound proxy agent: the multiplexer behind a local Unix socket.
pub struct ProxyAgent {
    socket_path: PathBuf,
    listener: UnixListener,
    keyring: Keyring,
    upstream: Arc<UpstreamAgent>,
    multiplexer: Arc<Multiplexer>,
    shutdown: ShutdownHandle,
}

impl std::fmt::Debug for ProxyAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyAgent")
            .field("socket_path", &self.socket_path)
            .field("upstream", &self.upstream.socket_path())
            .finish_non_exhaustive()
    }
}

impl ProxyAgent {
    /// Bind the agent socket at `socket_path`, replacing a stale socket from a
    /// previous run, and restrict it to the current user.
    ///
    /// Fails without touching the path if another agent is still listening
    /// there or if it is not a socket.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn bind(socket_path: impl Into<PathBuf>, upstream: UpstreamAgent) -> Result<Self> {
        let socket_path = socket_path.into();

        remove_stale_socket(&socket_path)?;

        let listener = UnixListener::bind(&socket_path).map_err(|e| {
            io::Error::new(e.kind(), format!("bind agent socket {}: {e}", socket_path.display()))
        })?;
        std::fs::set_permissions(&socket_path, std::fs::Permissions::from_mode(0o600))
            .map_err(|e| {
                io::Error::new(e.kind(), format!("chmod 0600 {}: {e}", socket_path.display()))
            })?;

        let keyring = Keyring::new();
        let upstream = Arc::new(upstream);
        let multiplexer = Arc::new(Multiplexer::new(
            Arc::new(keyring.clone()),
            Arc::clone(&upstream) as Arc<dyn KeyAgent>,
        ));
        let shutdown = ShutdownHandle {
            token: CancellationToken::new(),
            upstream: Arc::clone(&upstream),
        };

        debug!(
            sock = %socket_path.display(),
            upstream = ?upstream.socket_path(),
            "SSH agent proxy bound"
        );

        Ok(Self {
            socket_path,
            listener,
            keyring,
            upstream,
            multiplexer,
            shutdown,
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// The proxy's own keyring.
    pub fn keyring(&self) -> &Keyring {
        &self.keyring
    }

    /// The merged agent served to clients.
    pub fn agent(&self) -> Arc<dyn KeyAgent> {
        Arc::clone(&self.multiplexer) as Arc<dyn KeyAgent>
    }

    /// Preload keys into the local keyring, stopping at the first failure.
    pub async fn add_identities(&self, keys: impl IntoIterator<Item = AddedKey>) -> Result<()> {
        for key in keys {
            self.multiplexer.add(key).await?;
        }
        Ok(())
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Serve clients until [`ShutdownHandle::close`] is called or the listener
    /// fails, then unlink the socket file.
    ///
    /// Returns [`Error::Cancelled`] after a requested shutdown.
    pub async fn serve(self) -> Result<()> {
        let Self {
            socket_path,
            listener,
            multiplexer,
            shutdown,
            ..
        } = self;

        info!(sock = %socket_path.display(), "SSH agent proxy listening");
        let result = session::serve(listener, multiplexer, shutdown.token.clone()).await;

        if let Err(e) = std::fs::remove_file(&socket_path)
            && e.kind() != io::ErrorKind::NotFound
        {
            warn!(path = %socket_path.display(), "failed to remove agent socket: {e}");
        }
        if !matches!(result, Err(Error::Cancelled)) {
            // Listener failure: make sure the upstream connector stops too.
            shutdown.close();
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::{FileTypeExt as _, PermissionsExt as _};
use std::os::unix::net::UnixStream as StdUnixStream;

    use super::*;
    use crate::keyring::tests::test_key;

    fn tempdir() -> tempfile::TempDir {
        match tempfile::tempdir() {
            Ok(d) => d,
            Err(err) => panic!("tempdir: {err}"),
        }
    }

    #[tokio::test]
    async fn bind_replaces_stale_socket_and_restricts_mode() {
        let dir = tempdir();
        let path = dir.path().join("agent.sock");
        // A listener that has gone away leaves its socket file behind.
        match std::os::unix::net::UnixListener::bind(&path) {
            Ok(listener) => drop(listener),
            Err(err) => panic!("bind stale listener: {err}"),
        }
        assert!(path.exists());

        let proxy = match ProxyAgent::bind(&path, UpstreamAgent::unconfigured()) {
            Ok(p) => p,
            Err(err) => panic!("bind: {err}"),
        };
        let mode = match std::fs::metadata(proxy.socket_path()) {
            Ok(meta) => meta.permissions().mode() & 0o777,
            Err(err) => panic!("metadata: {err}"),
        };
        assert_eq!(mode, 0o600);
    }

    #[tokio::test]
    async fn bind_refuses_a_live_agent_socket() {
        let dir = tempdir();
        let path = dir.path().join("agent.sock");
        let running = match std::os::unix::net::UnixListener::bind(&path) {
            Ok(l) => l,
            Err(err) => panic!("bind running listener: {err}"),
        };

        match ProxyAgent::bind(&path, UpstreamAgent::unconfigured()) {
            Err(Error::Io(e)) => assert_eq!(e.kind(), io::ErrorKind::AddrInUse),
            other => panic!("expected address in use, got {other:?}"),
        }
        // The running agent still owns its socket.
        assert!(path.exists());
        assert!(std::os::unix::net::UnixStream::connect(&path).is_ok());
        drop(running);
    }

    #[tokio::test]
    async fn bind_leaves_non_socket_files_alone() {
        let dir = tempdir();
        let path = dir.path().join("agent.sock");
        if let Err(err) = std::fs::write(&path, b"not a socket") {
            panic!("write file: {err}");
        }

        assert!(matches!(
            ProxyAgent::bind(&path, UpstreamAgent::unconfigured()),
            Err(Error::Io(_))
        ));
        assert_eq!(std::fs::read(&path).ok().as_deref(), Some(&b"not a socket"[..]));
    }

    #[tokio::test]
    async fn add_identities_fills_the_keyring() {
        let dir = tempdir();
        let proxy = match ProxyAgent::bind(dir.path().join("agent.sock"), UpstreamAgent::unconfigured()) {
            Ok(p) => p,
            Err(err) => panic!("bind: {err}"),
        };
        let keys = [1, 2, 3].map(|seed| AddedKey::new(test_key(seed)));
        assert!(proxy.add_identities(keys).await.is_ok());
        assert_eq!(proxy.keyring().len(), 3);
        assert_eq!(proxy.agent().list().await.map(|ids| ids.len()).ok(), Some(3));
    }

    #[tokio::test]
    async fn close_twice_stops_serving_and_unlinks_socket() {
        let dir = tempdir();
        let path = dir.path().join("agent.sock");
        let proxy = match ProxyAgent::bind(&path, UpstreamAgent::new(dir.path().join("up.sock"))) {
            Ok(p) => p,
            Err(err) => panic!("bind: {err}"),
        };
        let handle = proxy.shutdown_handle();
        let serving = tokio::spawn(proxy.serve());

        handle.close();
        handle.close();
        assert!(handle.is_closed());

        match serving.await {
            Ok(Err(Error::Cancelled)) => {}
            other => panic!("expected cancellation, got {other:?}"),
        }
        assert!(!path.exists());
    }
}
