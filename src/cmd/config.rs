//! Implement the `config` command.
use tracing::debug;

use crate::connection::ConnectionStream;
use crate::message::Response;
use crate::{Connection, Error, Instance, Request, Result};

/// Change the server configuration while it runs.
///
/// Currently the only knob is the parallelism bound. Growing it frees
/// slots immediately; shrinking lets running tasks finish and simply
/// blocks admission until the count is back under the new bound.
#[derive(Debug)]
pub struct ConfigCmd {
    /// New parallelism bound, if it should change.
    parallel: Option<i64>,
}

impl ConfigCmd {
    pub fn new(parallel: Option<i64>) -> Self {
        Self { parallel }
    }

    pub(crate) fn from_request(request: Request) -> Result<Self> {
        let config = request
            .config
            .ok_or_else(|| Error::Protocol("config request has no Config payload".to_string()))?;
        Ok(Self::new(config.parallel))
    }

    pub(crate) async fn apply<S: ConnectionStream>(
        self,
        instance: &Instance,
        dst: &mut Connection<S>,
    ) -> Result<()> {
        instance.reconfigure(self.parallel);
        debug!(parallel = ?self.parallel, "configuration applied");
        dst.write_response(&Response::ok()).await
    }
}
