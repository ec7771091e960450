//! Implement the `kill` command.
use std::io;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tracing::warn;

use crate::Result;

/// SIGKILL the daemon's own process group: the daemon itself and every
/// child that has not moved to a group of its own.
///
/// No response is written, since the daemon does not outlive the
/// signal; clients must not wait for one.
#[derive(Debug)]
pub struct KillCmd;

impl KillCmd {
    pub(crate) fn apply(self) -> Result<()> {
        warn!("killing own process group");
        // Pid 0 addresses the caller's entire process group.
        kill(Pid::from_raw(0), Signal::SIGKILL).map_err(io::Error::from)?;
        Ok(())
    }
}
