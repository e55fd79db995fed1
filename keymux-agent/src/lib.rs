//! SSH agent multiplexer.
//!
//! Serves one agent socket that merges an in-process [`Keyring`] with an
//! already-running upstream agent (the system agent, a hardware-backed agent
//! or a password manager's agent).
//!
//! # Architecture
//!
//! ```text
//! client ──► UnixListener ──► AgentSession (one task per connection)
//!                                  │
//!                             Multiplexer
//!              list/sign: both ┌───┴────┐ add/remove/lock: local only
//!                              ▼        ▼
//!                    UpstreamAgent    Keyring
//!               (dial per request)    (Arc<RwLock<…>>)
//! ```
//!
//! All three backends implement [`KeyAgent`].  [`ProxyAgent`] binds the
//! socket and owns the cancellation token that stops serving.

pub mod agent;
pub mod error;
pub mod keyring;
pub mod multiplexer;
pub mod proxy;
pub mod session;
pub mod upstream;

pub use agent::{AddedKey, AgentSigner, KeyAgent, SignatureFlags};
pub use error::{Error, Result};
pub use keyring::Keyring;
pub use multiplexer::Multiplexer;
pub use proxy::{ProxyAgent, ShutdownHandle};
pub use session::AgentSession;
pub use upstream::UpstreamAgent;
