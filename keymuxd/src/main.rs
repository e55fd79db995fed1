mod bootstrap;
mod config;
mod discovery;
mod identity;

use std::ffi::OsString;
use std::os::unix::fs::PermissionsExt as _;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, Result, bail};
use keymux_agent::{ProxyAgent, UpstreamAgent};
use tokio::signal::unix::{SignalKind, signal};
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::discovery::Environment;

const USAGE: &str = "\
Usage: keymuxd [--config <path>]

Serve one SSH agent socket merging local keys with an upstream agent.

Options:
  -c, --config <path>  Path to config file (default: $XDG_CONFIG_HOME/keymux/config.toml)
  -h, --help           Show this help message";

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config_path = match parse_args(std::env::args().skip(1))? {
        Invocation::Help => {
            eprintln!("{USAGE}");
            return Ok(());
        }
        Invocation::Run { config } => config.or_else(|| {
            default_config_path(
                std::env::var_os("XDG_CONFIG_HOME"),
                std::env::var_os("HOME").map(PathBuf::from).as_deref(),
            )
        }),
    };

    bootstrap::harden_process();

    let config = match &config_path {
        Some(path) => {
            let config = Config::load(path)?;
            tracing::info!("loaded config from {}", path.display());
            config
        }
        None => {
            tracing::warn!("neither XDG_CONFIG_HOME nor HOME is set, using default config");
            Config::default()
        }
    };

    let env = Environment::from_process();
    let socket_path = match &config.agent.socket {
        Some(path) => path.clone(),
        None => default_socket_path(),
    };
    prepare_socket_dir(&socket_path)?;

    let upstream = resolve_upstream(&config, &env, &socket_path)
        .with_timeout(Duration::from_secs(config.upstream.timeout_secs));

    let ssh_dir = if config.identities.discover {
        identity::default_ssh_dir(env.home.as_deref())
    } else {
        None
    };
    let keys = identity::load_identities(ssh_dir.as_deref(), &config.identities.paths);

    let proxy = ProxyAgent::bind(&socket_path, upstream).context("start SSH agent proxy")?;
    let count = keys.len();
    proxy
        .add_identities(keys)
        .await
        .context("load local identities")?;
    tracing::info!(count, "local identities loaded");

    let mut interrupt = signal(SignalKind::interrupt()).context("register SIGINT handler")?;
    let mut terminate = signal(SignalKind::terminate()).context("register SIGTERM handler")?;
    let handle = proxy.shutdown_handle();
    tokio::spawn(async move {
        let received = tokio::select! {
            _ = interrupt.recv() => "SIGINT",
            _ = terminate.recv() => "SIGTERM",
        };
        tracing::info!(signal = received, "shutting down");
        handle.close();
    });

    // Shell-evaluable, in the same form ssh-agent prints.
    println!(
        "SSH_AUTH_SOCK={}; export SSH_AUTH_SOCK;",
        socket_path.display()
    );

    match proxy.serve().await {
        Ok(()) | Err(keymux_agent::Error::Cancelled) => {
            tracing::info!("keymuxd stopped");
            Ok(())
        }
        Err(e) => Err(e).context("SSH agent proxy failed"),
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Invocation {
    Run { config: Option<PathBuf> },
    Help,
}

fn parse_args(args: impl IntoIterator<Item = String>) -> Result<Invocation> {
    let mut config = None;
    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-h" | "--help" => return Ok(Invocation::Help),
            "-c" | "--config" => {
                let path = args
                    .next()
                    .with_context(|| format!("{arg} requires a path argument"))?;
                config = Some(PathBuf::from(path));
            }
            _ => match arg.strip_prefix("--config=") {
                Some(path) => config = Some(PathBuf::from(path)),
                None => bail!("unexpected argument {arg:?}, see --help"),
            },
        }
    }
    Ok(Invocation::Run { config })
}

/// `$XDG_CONFIG_HOME/keymux/config.toml`, else `~/.config/keymux/config.toml`.
fn default_config_path(xdg_config_home: Option<OsString>, home: Option<&Path>) -> Option<PathBuf> {
    let base = match xdg_config_home {
        Some(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => home?.join(".config"),
    };
    Some(base.join("keymux").join("config.toml"))
}

/// Explicit upstream socket from config, else discovery, else none.
fn resolve_upstream(config: &Config, env: &Environment, own_socket: &Path) -> UpstreamAgent {
    if let Some(path) = &config.upstream.socket {
        tracing::info!(path = %path.display(), "using configured upstream SSH agent");
        return UpstreamAgent::new(path.clone());
    }
    if !config.upstream.discover {
        tracing::info!("upstream discovery disabled, serving local identities only");
        return UpstreamAgent::unconfigured();
    }
    match discovery::discover_upstream(&config.upstream.sources, env, own_socket) {
        Some(path) => UpstreamAgent::new(path),
        None => {
            tracing::info!("no upstream SSH agent found, serving local identities only");
            UpstreamAgent::unconfigured()
        }
    }
}

fn default_socket_path() -> PathBuf {
    match std::env::var_os("XDG_RUNTIME_DIR") {
        Some(dir) if !dir.is_empty() => PathBuf::from(dir).join("keymux").join("agent.sock"),
        _ => std::env::temp_dir()
            .join(format!("keymux-{}", std::process::id()))
            .join("agent.sock"),
    }
}

/// Create the socket's parent directory and restrict it to the current user.
fn prepare_socket_dir(socket_path: &Path) -> Result<()> {
    let Some(dir) = socket_path.parent() else {
        return Ok(());
    };
    if dir.as_os_str().is_empty() || dir.exists() {
        return Ok(());
    }
    std::fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
    std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))
        .with_context(|| format!("chmod 0700 {}", dir.display()))?;
    Ok(())
}
