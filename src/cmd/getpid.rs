//! Implement the `getpid` command.
use tracing::debug;

use crate::connection::ConnectionStream;
use crate::message::Response;
use crate::{Connection, Result};

/// Report the daemon's own process id.
#[derive(Debug)]
pub struct GetpidCmd;

impl GetpidCmd {
    pub(crate) async fn apply<S: ConnectionStream>(self, dst: &mut Connection<S>) -> Result<()> {
        let response = Response::pid(std::process::id());
        debug!(?response);
        dst.write_response(&response).await
    }
}
