//! Local identity loading.
//!
//! Private keys are discovered by walking `~/.ssh` and read from any extra
//! paths listed in the config.  Only unencrypted OpenSSH-format keys are
//! loaded; everything else is skipped with a log line.

use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result, bail};
use keymux_agent::AddedKey;
use ssh_key::PrivateKey;
use tracing::{debug, warn};

/// Well-known files in `~/.ssh` that are never private keys.
const IGNORED_FILES: &[&str] = &[
    "authorized_keys",
    "known_hosts",
    "known_hosts.old",
    "config",
    ".DS_Store",
    "allowed_signers",
];

/// Anything larger than this is not a private key.
const MAX_KEY_FILE_SIZE: u64 = 50 * 1024;

pub fn default_ssh_dir(home: Option<&Path>) -> Option<PathBuf> {
    home.map(|h| h.join(".ssh"))
}

fn is_candidate_name(name: &str) -> bool {
    !IGNORED_FILES.contains(&name) && !name.ends_with(".pub")
}

/// Walk `dir` in lexical order and collect every file whose name could hold
/// a private key.  Symlinked directories are not followed.
pub fn candidate_files(dir: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    walk(dir, &mut files);
    files
}

fn walk(dir: &Path, files: &mut Vec<PathBuf>) {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(path = %dir.display(), "cannot read directory: {e}");
            return;
        }
    };
    let mut entries: Vec<_> = entries.filter_map(|entry| entry.ok()).collect();
    entries.sort_by_key(|entry| entry.file_name());

    for entry in entries {
        let path = entry.path();
        let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
        if is_dir {
            walk(&path, files);
            continue;
        }
        if is_candidate_name(&entry.file_name().to_string_lossy()) {
            files.push(path);
        }
    }
}

/// Read and parse one unencrypted OpenSSH private key.
pub fn load_key(path: &Path) -> Result<PrivateKey> {
    let meta = std::fs::metadata(path).with_context(|| format!("stat {}", path.display()))?;
    if meta.len() > MAX_KEY_FILE_SIZE {
        bail!(
            "{} is {} bytes, larger than a private key can be",
            path.display(),
            meta.len()
        );
    }
    let data = std::fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let key = PrivateKey::from_openssh(&data)
        .with_context(|| format!("parse {} as an OpenSSH private key", path.display()))?;
    if key.is_encrypted() {
        bail!("{} is passphrase-protected", path.display());
    }
    Ok(key)
}

fn added_key(path: &Path, key: PrivateKey) -> AddedKey {
    let comment = if key.comment().is_empty() {
        path.display().to_string()
    } else {
        key.comment().to_string()
    };
    AddedKey::new(key).with_comment(comment)
}

/// Load every usable key under `ssh_dir` followed by each of `extra_paths`.
///
/// Failures never abort loading.  Discovered files that do not parse are
/// logged at debug level since most of `~/.ssh` is not key material;
/// explicitly configured paths that fail are logged as warnings.
pub fn load_identities(ssh_dir: Option<&Path>, extra_paths: &[PathBuf]) -> Vec<AddedKey> {
    let mut keys = Vec::new();

    if let Some(dir) = ssh_dir {
        if dir.is_dir() {
            for path in candidate_files(dir) {
                match load_key(&path) {
                    Ok(key) => {
                        debug!(path = %path.display(), "loaded private key");
                        keys.push(added_key(&path, key));
                    }
                    Err(e) => debug!(path = %path.display(), "skipping: {e:#}"),
                }
            }
        } else {
            debug!(path = %dir.display(), "no SSH directory to scan");
        }
    }

    for path in extra_paths {
        match load_key(path) {
            Ok(key) => keys.push(added_key(path, key)),
            Err(e) => warn!(path = %path.display(), "skipping configured identity: {e:#}"),
        }
    }

    keys
}
