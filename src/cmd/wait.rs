//! Implement the `wait` command.
use tracing::debug;

use crate::connection::ConnectionStream;
use crate::message::Response;
use crate::{Connection, Instance, Result};

/// Block until nothing is pending or running, then report the aggregate
/// exit status: 0 if every task succeeded, 1 if any exited non-zero, 2 if
/// any failed to launch.
///
/// The completion history is cumulative: a second `wait` with no
/// intervening `run` reports the same result.
#[derive(Debug)]
pub struct WaitCmd;

impl WaitCmd {
    #[tracing::instrument(skip_all)]
    pub(crate) async fn apply<S: ConnectionStream>(
        self,
        instance: &Instance,
        dst: &mut Connection<S>,
    ) -> Result<()> {
        let exit_status = instance.wait_drained().await;
        let response = Response::exit_status(exit_status);
        debug!(?response);
        dst.write_response(&response).await
    }
}
