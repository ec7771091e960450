//! Answer requests whose type this daemon does not know.
use tracing::debug;

use crate::connection::ConnectionStream;
use crate::message::Response;
use crate::{Connection, Result};

/// Responds to request tags outside the known range with an error
/// response. This keeps the connection usable, which matters for clients
/// newer than the daemon they are talking to.
#[derive(Debug)]
pub struct UnknownCmd {
    tag: u8,
}

impl UnknownCmd {
    pub(crate) fn new(tag: u8) -> Self {
        Self { tag }
    }

    pub(crate) async fn apply<S: ConnectionStream>(self, dst: &mut Connection<S>) -> Result<()> {
        let response = Response::err(format!("unknown request type {}", self.tag));
        debug!(?response);
        dst.write_response(&response).await
    }
}
