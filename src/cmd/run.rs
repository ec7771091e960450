//! Implement the `run` command.
use std::os::fd::OwnedFd;

use tracing::debug;

use crate::connection::ConnectionStream;
use crate::message::{Response, RunPayload};
use crate::{launcher, Connection, Error, Instance, Request, Result};

/// Queue a command for execution.
///
/// The reply goes out as soon as the task is queued. A background task
/// then consumes an admission slot, launches the child with the
/// transferred descriptors at their logical numbers, waits for it, and
/// records the outcome for a later `wait`.
#[derive(Debug)]
pub struct RunCmd {
    /// What to execute: path, argv, environment, working directory.
    run: RunPayload,
    /// Descriptor numbers the child should see, each paired with the
    /// descriptor received over the socket for it.
    fds: Vec<(i32, OwnedFd)>,
}

impl RunCmd {
    pub fn new(run: RunPayload, fds: Vec<(i32, OwnedFd)>) -> Self {
        Self { run, fds }
    }

    /// Parse a `RunCmd` out of a received request, zipping the logical
    /// descriptor numbers with the descriptors that arrived as ancillary
    /// data. Both lists must have the same length.
    pub(crate) fn from_request(request: Request, received: Vec<OwnedFd>) -> Result<Self> {
        let run = request
            .run
            .ok_or_else(|| Error::Protocol("run request has no Run payload".to_string()))?;
        if request.fds.len() != received.len() {
            return Err(Error::Protocol(format!(
                "request names {} descriptors but {} were received",
                request.fds.len(),
                received.len()
            )));
        }
        Ok(Self::new(run, request.fds.into_iter().zip(received).collect()))
    }

    /// Queue the run and acknowledge. Rejected once shutdown has begun;
    /// the descriptors are closed with the rejected command.
    #[tracing::instrument(skip_all)]
    pub(crate) async fn apply<S: ConnectionStream>(
        self,
        instance: &Instance,
        dst: &mut Connection<S>,
    ) -> Result<()> {
        let response = match instance.submit() {
            Ok(id) => {
                tokio::spawn(launcher::execute(instance.clone(), id, self.run, self.fds));
                Response::ok()
            }
            Err(err @ Error::ShuttingDown) => Response::err(err.to_string()),
            Err(err) => return Err(err),
        };
        debug!(?response);
        dst.write_response(&response).await
    }
}
