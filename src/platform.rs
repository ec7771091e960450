//! Unix helpers used by the command-line front-end.
//!
//! The daemon itself uses none of these: they exist so the `run` and
//! `start` subcommands can decide what to submit and where the session's
//! socket lives.

use std::os::fd::RawFd;
use std::path::{Path, PathBuf};

use nix::unistd::getsid;
use tracing::warn;

use crate::Result;

/// Enumerate the caller's descriptors that are worth passing to a child:
/// regular files, FIFOs, and the three standard streams.
///
/// Everything else (sockets, epoll handles, the runtime's own plumbing)
/// is left out; inheriting those would tie the child to resources it
/// cannot use.
pub fn inheritable_fds() -> Result<Vec<RawFd>> {
    let mut fds = Vec::new();
    for entry in std::fs::read_dir("/dev/fd")? {
        let entry = entry?;
        let Ok(fd) = entry.file_name().to_string_lossy().parse::<RawFd>() else {
            continue;
        };

        let mut stat = unsafe { std::mem::zeroed::<libc::stat>() };
        if unsafe { libc::fstat(fd, &mut stat) } != 0 {
            // Closed between readdir and here, or not ours to ask about.
            continue;
        }

        let format = stat.st_mode & libc::S_IFMT;
        if format == libc::S_IFREG || format == libc::S_IFIFO || fd < 3 {
            fds.push(fd);
        }
    }
    fds.sort_unstable();
    Ok(fds)
}

/// The session id of the calling process.
pub fn session_id() -> i32 {
    match getsid(None) {
        Ok(sid) => sid.as_raw(),
        Err(err) => {
            warn!(cause = %err, "error determining session id, using 0");
            0
        }
    }
}

/// Default socket path for this session: `$HOME/.fanout/socket.<sid>`.
///
/// One socket per session id is what gives every login shell its own
/// daemon. Returns `None` when `HOME` is unset.
pub fn default_socket_path() -> Option<PathBuf> {
    let home = std::env::var_os("HOME")?;
    let sid = session_id();
    Some(PathBuf::from(home).join(".fanout").join(format!("socket.{sid}")))
}

/// Resolve `name` the way a shell would: as given when it contains a
/// slash (made absolute against the current directory), otherwise by
/// searching `PATH` for an executable regular file.
pub fn find_executable(name: &str) -> Option<PathBuf> {
    if name.contains('/') {
        let path = if Path::new(name).is_absolute() {
            PathBuf::from(name)
        } else {
            std::env::current_dir().ok()?.join(name)
        };
        return is_executable(&path).then_some(path);
    }

    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(name))
        .find(|candidate| is_executable(candidate))
}

fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;

    std::fs::metadata(path)
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}
