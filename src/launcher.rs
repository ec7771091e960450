//! Turns an admitted run into a child process.
use std::io;
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::process::CommandExt;
use std::process::{ExitStatus, Stdio};

use tracing::{debug, warn};

use crate::connection::MAX_PASSED_FDS;
use crate::instance::{Instance, TaskId};
use crate::message::RunPayload;
use crate::{Error, Result};

/// Lifecycle of one submitted run: consume an admission slot, launch the
/// child, wait for it, and record the completion.
///
/// A launch failure is recorded with a null exit state; it is not fatal to
/// the daemon and surfaces later through `wait`. Either way the parent's
/// copies of the transferred descriptors are closed here.
pub(crate) async fn execute(
    instance: Instance,
    id: TaskId,
    run: RunPayload,
    fds: Vec<(i32, OwnedFd)>,
) {
    instance.acquire_slot(id).await;
    let status = match launch(&run, fds).await {
        Ok(status) => Some(status),
        Err(err) => {
            warn!(exe = %run.exe, cause = %err, "failed to launch task");
            None
        }
    };
    instance.release_slot(id, run, status);
}

/// Spawn the child and wait for it to exit.
///
/// The child sees each transferred descriptor at its logical number and
/// nothing else of the parent's table: standard streams not named in the
/// request are attached to `/dev/null`, and everything at 3 or above is
/// close-on-exec unless remapped below. argv[0] comes from the request and
/// is not forced to equal the executable path.
async fn launch(run: &RunPayload, fds: Vec<(i32, OwnedFd)>) -> Result<ExitStatus> {
    if fds.len() > MAX_PASSED_FDS {
        return Err(Error::Protocol(format!(
            "run carries {} descriptors, limit is {MAX_PASSED_FDS}",
            fds.len()
        )));
    }
    if let Some((logical, _)) = fds.iter().find(|(logical, _)| *logical < 0) {
        return Err(Error::Protocol(format!(
            "negative descriptor number {logical} in run request"
        )));
    }

    let mut command = std::process::Command::new(&run.exe);
    if let Some((argv0, rest)) = run.args.split_first() {
        command.arg0(argv0);
        command.args(rest);
    }
    command.env_clear();
    command.envs(run.env.iter().filter_map(|pair| pair.split_once('=')));
    if !run.cwd.is_empty() {
        command.current_dir(&run.cwd);
    }
    command
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());

    // The remap table must live on the stack: the hook below runs between
    // fork and exec where allocation is not allowed.
    let mut table = [(0i32, -1i32); MAX_PASSED_FDS];
    for (slot, (logical, fd)) in table.iter_mut().zip(&fds) {
        *slot = (*logical, fd.as_raw_fd());
    }
    let len = fds.len();
    // SAFETY: build_fd_table only calls async-signal-safe syscalls (fcntl,
    // dup2) and touches no heap state.
    unsafe {
        command.pre_exec(move || build_fd_table(&table[..len]));
    }

    let mut child = tokio::process::Command::from(command).spawn()?;
    // The child holds its own copies now; release the parent's.
    drop(fds);

    let status = child.wait().await?;
    debug!(exe = %run.exe, %status, "task exited");
    Ok(status)
}

/// Place every received descriptor at its logical number in the child.
///
/// Runs between fork and exec. Received descriptors are first staged above
/// the highest logical number so that no `dup2` target can clobber a
/// descriptor still waiting to be placed. The staged copies and the
/// originals are close-on-exec; `dup2` clears the flag on the final
/// descriptors, so they alone survive into the child.
fn build_fd_table(table: &[(i32, i32)]) -> io::Result<()> {
    let floor = table.iter().map(|(logical, _)| *logical).max().unwrap_or(-1) + 1;

    let mut staged = [-1i32; MAX_PASSED_FDS];
    for (slot, (_, received)) in staged.iter_mut().zip(table) {
        let fd = unsafe { libc::fcntl(*received, libc::F_DUPFD_CLOEXEC, floor) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        *slot = fd;
    }
    for (staged_fd, (logical, _)) in staged.iter().zip(table) {
        if unsafe { libc::dup2(*staged_fd, *logical) } < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Read;

    fn sh(script: &str) -> RunPayload {
        RunPayload {
            exe: "/bin/sh".to_string(),
            args: vec!["/bin/sh".to_string(), "-c".to_string(), script.to_string()],
            env: vec!["PATH=/usr/bin:/bin".to_string()],
            cwd: "/".to_string(),
        }
    }

    fn read_all(fd: OwnedFd) -> String {
        let mut output = String::new();
        File::from(fd).read_to_string(&mut output).unwrap();
        output
    }

    #[tokio::test]
    async fn child_sees_descriptors_at_their_logical_numbers() {
        let (pipe_read, pipe_write) = nix::unistd::pipe().unwrap();

        // Logical 9 is far from wherever the pipe landed in our table.
        let status = launch(&sh("echo staged >&9"), vec![(9, pipe_write)])
            .await
            .unwrap();
        assert!(status.success());
        assert_eq!(read_all(pipe_read), "staged\n");
    }

    #[tokio::test]
    async fn environment_and_cwd_come_from_the_request() {
        let (pipe_read, pipe_write) = nix::unistd::pipe().unwrap();

        let mut run = sh("echo \"$GREETING $(pwd)\" >&3");
        run.env.push("GREETING=hello".to_string());
        let status = launch(&run, vec![(3, pipe_write)]).await.unwrap();
        assert!(status.success());
        assert_eq!(read_all(pipe_read), "hello /\n");
    }

    #[tokio::test]
    async fn child_exit_code_is_reported() {
        let status = launch(&sh("exit 3"), Vec::new()).await.unwrap();
        assert!(!status.success());
        assert_eq!(status.code(), Some(3));
    }

    #[tokio::test]
    async fn missing_executable_is_a_launch_error() {
        let run = RunPayload {
            exe: "/nonexistent/xyz".to_string(),
            args: vec!["/nonexistent/xyz".to_string()],
            env: Vec::new(),
            cwd: "/".to_string(),
        };
        assert!(launch(&run, Vec::new()).await.is_err());
    }

    #[tokio::test]
    async fn launch_failures_are_recorded_against_the_instance() {
        let instance = Instance::new(1);
        let id = instance.submit().unwrap();
        let run = RunPayload {
            exe: "/nonexistent/xyz".to_string(),
            args: vec!["/nonexistent/xyz".to_string()],
            env: Vec::new(),
            cwd: "/".to_string(),
        };
        execute(instance.clone(), id, run, Vec::new()).await;
        assert_eq!(instance.wait_drained().await, 2);
    }

    #[tokio::test]
    async fn parent_copies_are_released_after_launch() {
        let (pipe_read, pipe_write) = nix::unistd::pipe().unwrap();

        // If the daemon kept a copy of the write end alive, this read
        // would never see EOF.
        let status = launch(&sh("echo done >&5"), vec![(5, pipe_write)])
            .await
            .unwrap();
        assert!(status.success());
        assert_eq!(read_all(pipe_read), "done\n");
    }
}
