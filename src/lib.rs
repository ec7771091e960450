//! A session-scoped daemon that runs commands in parallel.
//!
//! `fanout` keeps one background server per login session. Successive
//! `run` invocations queue work on it, bounded by a configurable
//! concurrency limit, and `wait` blocks until everything submitted so far
//! has finished, reporting an aggregate exit status. It is meant as a
//! stateful, lower-friction replacement for `xargs -P`.

pub mod client;
pub mod cmd;
pub mod connection;
pub mod error;
pub mod instance;
pub mod message;
pub mod platform;
pub mod server;

mod launcher;

pub use client::Client;
pub use cmd::Command;
pub use connection::Connection;
pub use error::Error;
pub use instance::Instance;
pub use message::{Request, Response};

/// Parallelism bound used when `start` is given no `--parallel`.
pub const DEFAULT_PARALLEL: u32 = 10;

/// Environment variable that marks the re-executed background server
/// child. Its value is the bound socket path.
pub const MAGIC_ENV: &str = "FANOUT_MAGIC";

/// Environment variable that overrides the default socket path.
pub const SOCKET_ENV: &str = "FANOUT_SOCKET";

pub type Result<T> = std::result::Result<T, Error>;
