//! Implement the `shutdown` command.
use tracing::debug;

use crate::connection::ConnectionStream;
use crate::message::Response;
use crate::{Connection, Instance, Result};

/// Stop admitting new runs, let in-flight runs finish, then acknowledge.
///
/// The reply is only written once the drain is complete, so a client that
/// has seen the OK knows nothing is running anymore. Runs submitted after
/// shutdown begins are rejected at the `run` handler.
#[derive(Debug)]
pub struct ShutdownCmd;

impl ShutdownCmd {
    #[tracing::instrument(skip_all)]
    pub(crate) async fn apply<S: ConnectionStream>(
        self,
        instance: &Instance,
        dst: &mut Connection<S>,
    ) -> Result<()> {
        instance.shutdown().await;
        debug!("drain complete, acknowledging shutdown");
        dst.write_response(&Response::ok()).await
    }
}
