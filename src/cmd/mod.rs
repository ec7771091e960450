//! Commands module.
use std::os::fd::OwnedFd;

use crate::connection::ConnectionStream;
use crate::message::RequestType;
use crate::{Connection, Instance, Request, Result};

pub mod config;
pub use config::ConfigCmd;

pub mod getpid;
pub use getpid::GetpidCmd;

pub mod kill;
pub use kill::KillCmd;

pub mod run;
pub use run::RunCmd;

pub mod shutdown;
pub use shutdown::ShutdownCmd;

pub mod unknown;
pub use unknown::UnknownCmd;

pub mod wait;
pub use wait::WaitCmd;

/// All possible command variants.
#[derive(Debug)]
pub enum Command {
    /// `run`: queue a child process.
    Run(RunCmd),
    /// `wait`: block until everything submitted has finished.
    Wait(WaitCmd),
    /// `getpid`: report the daemon's pid.
    Getpid(GetpidCmd),
    /// `kill`: SIGKILL the daemon's process group.
    Kill(KillCmd),
    /// `shutdown`: drain in-flight work and stop.
    Shutdown(ShutdownCmd),
    /// `config`: change the parallelism bound.
    Config(ConfigCmd),
    /// A request type this daemon does not know.
    Unknown(UnknownCmd),
}

impl Command {
    /// Build a command from a decoded request and the descriptors received
    /// alongside it.
    ///
    /// Errors here are protocol errors (a missing payload, a descriptor
    /// count that does not match) and the caller answers them with an
    /// error response while keeping the connection alive. Descriptors are
    /// dropped (closed) when the request they came with is rejected.
    pub(crate) fn from_request(request: Request, fds: Vec<OwnedFd>) -> Result<Self> {
        let command = match request.kind {
            RequestType::Run => Command::Run(RunCmd::from_request(request, fds)?),
            RequestType::Wait => Command::Wait(WaitCmd),
            RequestType::Getpid => Command::Getpid(GetpidCmd),
            RequestType::Kill => Command::Kill(KillCmd),
            RequestType::Shutdown => Command::Shutdown(ShutdownCmd),
            RequestType::Config => Command::Config(ConfigCmd::from_request(request)?),
            RequestType::Unknown(tag) => Command::Unknown(UnknownCmd::new(tag)),
        };
        Ok(command)
    }

    /// Apply the command against the shared instance, writing any response
    /// to `dst`. `kill` is the one command that writes nothing.
    pub(crate) async fn apply<S: ConnectionStream>(
        self,
        instance: &Instance,
        dst: &mut Connection<S>,
    ) -> Result<()> {
        use Command as C;

        match self {
            C::Run(cmd) => cmd.apply(instance, dst).await,
            C::Wait(cmd) => cmd.apply(instance, dst).await,
            C::Getpid(cmd) => cmd.apply(dst).await,
            C::Kill(cmd) => cmd.apply(),
            C::Shutdown(cmd) => cmd.apply(instance, dst).await,
            C::Config(cmd) => cmd.apply(instance, dst).await,
            C::Unknown(cmd) => cmd.apply(dst).await,
        }
    }

    pub fn get_name(&self) -> &str {
        use Command as C;
        match self {
            C::Run(_) => "run",
            C::Wait(_) => "wait",
            C::Getpid(_) => "getpid",
            C::Kill(_) => "kill",
            C::Shutdown(_) => "shutdown",
            C::Config(_) => "config",
            C::Unknown(_) => "unknown",
        }
    }
}
