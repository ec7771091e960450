//! The daemon's accept loop and per-connection handlers.
//!
//! Provides an async `run` function that listens for inbound connections,
//! spawning a task per connection, until a `shutdown` request has drained
//! the scheduler.

use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, error, info};

use crate::{Command, Connection, Instance, Response, Result};

/// Run the fanout daemon.
///
/// Accepts connections from the supplied listener. For each inbound
/// connection, a task is spawned to handle that connection. Returns once
/// the shutdown drain is complete, or if accepting fails.
pub async fn run(listener: UnixListener, instance: Instance) {
    let mut server = Listener { listener, instance };

    if let Err(err) = server.run().await {
        // Accepting connections from the listener failed. Errors
        // encountered when handling individual connections do not bubble
        // up to this point.
        error!(cause = %err, "failed to accept");
    }
}

/// Server listener state. Accepts connections and hands each one to its
/// own [`Handler`] task. All handlers share the one [`Instance`].
#[derive(Debug)]
struct Listener {
    /// Unix socket listener supplied by the `run` caller, who owns the
    /// socket path and removes the file once `run` returns.
    listener: UnixListener,
    /// Shared scheduler handle. Also carries the shutdown-complete signal
    /// that ends the accept loop.
    instance: Instance,
}

/// Per-connection handler. Reads requests from `connection` and applies
/// the commands against `instance`.
#[derive(Debug)]
struct Handler {
    /// Shared scheduler handle.
    instance: Instance,
    /// The socket decorated with the framing codec.
    connection: Connection<UnixStream>,
}

impl Listener {
    /// Accept connections until the shutdown drain completes.
    ///
    /// An accept error while not shutting down is fatal to the daemon:
    /// there is no meaningful way to keep serving a session whose socket
    /// stopped accepting.
    async fn run(&mut self) -> Result<()> {
        info!("accepting inbound connections");

        loop {
            let socket = tokio::select! {
                res = self.listener.accept() => res.map(|(socket, _)| socket)?,
                _ = self.instance.shutdown_complete() => {
                    info!("shutdown complete, closing listener");
                    return Ok(());
                }
            };

            // The drain may have finished while this accept was already
            // resolving; a handler could no longer be served.
            if self.instance.is_shutdown_complete() {
                info!("shutdown complete, dropping late connection");
                return Ok(());
            }

            let mut handler = Handler {
                instance: self.instance.clone(),
                connection: Connection::new(socket),
            };

            tokio::spawn(async move {
                if let Err(err) = handler.run().await {
                    error!(cause = %err, "connection error");
                }
            });
        }
    }
}

impl Handler {
    /// Process a single connection until the peer disconnects or a
    /// transport error occurs.
    ///
    /// Requests on one connection are dispatched serially; pipelining is
    /// intentionally not supported. Commands that suspend (`wait`,
    /// `shutdown`) block this connection only; other connections keep
    /// their own handlers.
    #[tracing::instrument(skip_all)]
    async fn run(&mut self) -> Result<()> {
        while let Some(request) = self.connection.read_request().await? {
            // The descriptor carrier follows the request frame on the
            // stream, so it must be consumed before anything else is read,
            // whatever the request turns out to contain.
            let fds = if request.has_fds {
                self.connection.recv_fds().await?
            } else {
                Vec::new()
            };

            let cmd = match Command::from_request(request, fds) {
                Ok(cmd) => cmd,
                Err(err) => {
                    // Malformed but well-framed requests keep the
                    // connection alive.
                    debug!(cause = %err, "rejecting malformed request");
                    self.connection
                        .write_response(&Response::err(err.to_string()))
                        .await?;
                    continue;
                }
            };

            debug!(command = cmd.get_name());
            cmd.apply(&self.instance, &mut self.connection).await?;
        }

        Ok(())
    }
}
