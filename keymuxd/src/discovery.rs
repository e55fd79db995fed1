//! Upstream agent discovery.
//!
//! Each [`UpstreamSource`] proposes at most one socket path.  A candidate is
//! only accepted if it is a Unix socket and is not the proxy's own socket;
//! otherwise the next source is tried.

use std::ffi::OsString;
use std::fmt;
use std::os::unix::fs::FileTypeExt as _;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Socket paths used by the 1Password SSH agent, relative to `$HOME`.
const ONEPASSWORD_SOCKETS: &[&str] = &[
    ".1password/agent.sock",
    "Library/Group Containers/2BUA8C4S2C.com.1password/t/agent.sock",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpstreamSource {
    /// `SSH_AUTH_SOCK` inherited by the daemon.
    Env,
    /// The per-user launchd environment (macOS only).
    Launchctl,
    #[serde(rename = "1password")]
    OnePassword,
}

impl fmt::Display for UpstreamSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            UpstreamSource::Env => "env",
            UpstreamSource::Launchctl => "launchctl",
            UpstreamSource::OnePassword => "1password",
        })
    }
}

/// The parts of the process environment discovery looks at.
#[derive(Debug, Clone, Default)]
pub struct Environment {
    pub ssh_auth_sock: Option<OsString>,
    pub home: Option<PathBuf>,
}

impl Environment {
    pub fn from_process() -> Self {
        Self {
            ssh_auth_sock: std::env::var_os("SSH_AUTH_SOCK"),
            home: std::env::var_os("HOME").map(PathBuf::from),
        }
    }
}

impl UpstreamSource {
    fn candidates(self, env: &Environment) -> Vec<PathBuf> {
        match self {
            UpstreamSource::Env => env
                .ssh_auth_sock
                .as_deref()
                .and_then(|value| trimmed_path(&value.to_string_lossy()))
                .into_iter()
                .collect(),
            UpstreamSource::Launchctl => launchctl_socket().into_iter().collect(),
            UpstreamSource::OnePassword => match &env.home {
                Some(home) => ONEPASSWORD_SOCKETS.iter().map(|rel| home.join(rel)).collect(),
                None => Vec::new(),
            },
        }
    }
}

fn trimmed_path(value: &str) -> Option<PathBuf> {
    let value = value.trim();
    (!value.is_empty()).then(|| PathBuf::from(value))
}

#[cfg(target_os = "macos")]
fn launchctl_socket() -> Option<PathBuf> {
    // SAFETY: getuid has no preconditions and cannot fail.
    let uid = unsafe { libc::getuid() }.to_string();
    let output = std::process::Command::new("launchctl")
        .args(["asuser", &uid, "launchctl", "getenv", "SSH_AUTH_SOCK"])
        .output();
    match output {
        Ok(out) if out.status.success() => trimmed_path(&String::from_utf8_lossy(&out.stdout)),
        Ok(out) => {
            debug!(status = %out.status, "launchctl getenv SSH_AUTH_SOCK failed");
            None
        }
        Err(e) => {
            debug!("could not run launchctl: {e}");
            None
        }
    }
}

#[cfg(not(target_os = "macos"))]
fn launchctl_socket() -> Option<PathBuf> {
    None
}

/// Whether `path` exists and is a Unix domain socket.
pub fn is_unix_socket(path: &Path) -> bool {
    match std::fs::metadata(path) {
        Ok(meta) => meta.file_type().is_socket(),
        Err(e) => {
            debug!(path = %path.display(), "cannot stat candidate socket: {e}");
            false
        }
    }
}

/// Try `sources` in order and return the first usable upstream socket.
///
/// `own_socket` is the proxy's listening socket; an environment that already
/// points at the proxy must not make it dial itself.
pub fn discover_upstream(
    sources: &[UpstreamSource],
    env: &Environment,
    own_socket: &Path,
) -> Option<PathBuf> {
    for source in sources {
        for candidate in source.candidates(env) {
            if candidate == own_socket {
                warn!(
                    source = %source,
                    path = %candidate.display(),
                    "upstream candidate is the proxy's own socket, skipping"
                );
                continue;
            }
            if !is_unix_socket(&candidate) {
                debug!(source = %source, path = %candidate.display(), "not a socket, skipping");
                continue;
            }
            info!(source = %source, path = %candidate.display(), "found upstream SSH agent");
            return Some(candidate);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use std::os::unix::net::UnixListener;

    use super::*;

    fn tempdir() -> tempfile::TempDir {
        match tempfile::tempdir() {
            Ok(d) => d,
            Err(err) => panic!("tempdir: {err}"),
        }
    }

    fn listen(path: &Path) -> UnixListener {
        if let Some(parent) = path.parent()
            && let Err(err) = std::fs::create_dir_all(parent)
        {
            panic!("mkdir {}: {err}", parent.display());
        }
        match UnixListener::bind(path) {
            Ok(l) => l,
            Err(err) => panic!("bind {}: {err}", path.display()),
        }
    }

    #[test]
    fn env_source_trims_and_checks_socket() {
        let dir = tempdir();
        let sock = dir.path().join("agent.sock");
        let _listener = listen(&sock);
        let env = Environment {
            ssh_auth_sock: Some(format!("  {}\n", sock.display()).into()),
            home: None,
        };
        let own = dir.path().join("proxy.sock");
        assert_eq!(discover_upstream(&[UpstreamSource::Env], &env, &own), Some(sock));
    }

    #[test]
    fn blank_env_value_is_not_found() {
        let env = Environment {
            ssh_auth_sock: Some("   ".into()),
            home: None,
        };
        assert_eq!(
            discover_upstream(&[UpstreamSource::Env], &env, Path::new("/nonexistent")),
            None
        );
    }

    #[test]
    fn regular_file_is_rejected() {
        let dir = tempdir();
        let file = dir.path().join("not-a-socket");
        if let Err(err) = std::fs::write(&file, b"") {
            panic!("write: {err}");
        }
        assert!(!is_unix_socket(&file));
        assert!(!is_unix_socket(&dir.path().join("missing")));

        let env = Environment {
            ssh_auth_sock: Some(file.into_os_string()),
            home: None,
        };
        assert_eq!(
            discover_upstream(&[UpstreamSource::Env], &env, &dir.path().join("proxy.sock")),
            None
        );
    }

    #[test]
    fn own_socket_is_never_chosen() {
        let dir = tempdir();
        let own = dir.path().join("proxy.sock");
        let _listener = listen(&own);
        let env = Environment {
            ssh_auth_sock: Some(own.clone().into_os_string()),
            home: None,
        };
        assert_eq!(discover_upstream(&[UpstreamSource::Env], &env, &own), None);
    }

    #[test]
    fn falls_through_to_onepassword_socket() {
        let home = tempdir();
        let sock = home.path().join(".1password/agent.sock");
        let _listener = listen(&sock);
        let env = Environment {
            ssh_auth_sock: None,
            home: Some(home.path().to_path_buf()),
        };
        let sources = [
            UpstreamSource::Env,
            UpstreamSource::Launchctl,
            UpstreamSource::OnePassword,
        ];
        let found = discover_upstream(&sources, &env, &home.path().join("proxy.sock"));
        // On macOS the launchd environment may legitimately win.
        if cfg!(not(target_os = "macos")) {
            assert_eq!(found, Some(sock));
        }
    }

    #[test]
    fn source_order_is_respected() {
        let dir = tempdir();
        let env_sock = dir.path().join("env.sock");
        let _env_listener = listen(&env_sock);
        let op_sock = dir.path().join(".1password/agent.sock");
        let _op_listener = listen(&op_sock);
        let env = Environment {
            ssh_auth_sock: Some(env_sock.clone().into_os_string()),
            home: Some(dir.path().to_path_buf()),
        };
        let own = dir.path().join("proxy.sock");

        let env_first = [UpstreamSource::Env, UpstreamSource::OnePassword];
        assert_eq!(discover_upstream(&env_first, &env, &own), Some(env_sock));

        let op_first = [UpstreamSource::OnePassword, UpstreamSource::Env];
        assert_eq!(discover_upstream(&op_first, &env, &own), Some(op_sock));
    }

    #[test]
    fn no_sources_finds_nothing() {
        assert_eq!(
            discover_upstream(&[], &Environment::default(), Path::new("/tmp/proxy.sock")),
            None
        );
    }
}
