//! Client-side access to a running daemon.
use std::os::fd::RawFd;
use std::path::Path;

use tokio::net::UnixStream;
use tracing::debug;

use crate::message::{Request, Response, ResponseType, RunPayload};
use crate::{Connection, Error, Result};

/// Established connection with a fanout daemon.
///
/// Backed by a single `UnixStream`, `Client` provides basic client
/// functionality (no pooling, retrying, ...). Requests are issued using
/// the various methods of `Client` and are answered in order on the same
/// connection.
#[derive(Debug)]
pub struct Client {
    /// The socket decorated with the framing codec.
    connection: Connection<UnixStream>,
}

impl Client {
    /// Establish a connection with the daemon listening on the socket at
    /// `path`.
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self> {
        let socket = UnixStream::connect(path).await?;
        let connection = Connection::new(socket);
        Ok(Client { connection })
    }

    /// Ask the daemon for its pid.
    #[tracing::instrument(skip(self))]
    pub async fn getpid(&mut self) -> Result<u32> {
        self.connection.write_request(&Request::getpid()).await?;
        let response = self.read_response().await?;
        match response.getpid {
            Some(payload) if response.kind == ResponseType::Getpid => Ok(payload.pid),
            _ => Err(unexpected(&response)),
        }
    }

    /// Queue a command on the daemon.
    ///
    /// `fds` are descriptors of this process that the child should
    /// inherit, at the same numbers; they are transferred as ancillary
    /// data right after the request frame. Returns as soon as the daemon
    /// has queued the task; use [`wait`](Self::wait) for the outcome.
    #[tracing::instrument(skip_all, fields(exe = %run.exe))]
    pub async fn run(&mut self, run: RunPayload, fds: &[RawFd]) -> Result<()> {
        let request = Request::run(run, fds.to_vec());
        self.connection.write_request(&request).await?;
        if !fds.is_empty() {
            self.connection.send_fds(fds).await?;
        }
        let response = self.read_response().await?;
        match response.kind {
            ResponseType::Ok => Ok(()),
            _ => Err(unexpected(&response)),
        }
    }

    /// Block until every task submitted so far has finished and return
    /// the aggregate exit status (0, 1 or 2).
    #[tracing::instrument(skip(self))]
    pub async fn wait(&mut self) -> Result<i32> {
        self.connection.write_request(&Request::wait()).await?;
        let response = self.read_response().await?;
        match response.wait {
            Some(payload) if response.kind == ResponseType::Wait => {
                debug!(exit_status = payload.exit_status);
                Ok(payload.exit_status)
            }
            _ => Err(unexpected(&response)),
        }
    }

    /// Change the daemon's parallelism bound.
    #[tracing::instrument(skip(self))]
    pub async fn config(&mut self, parallel: Option<i64>) -> Result<()> {
        self.connection
            .write_request(&Request::config(parallel))
            .await?;
        let response = self.read_response().await?;
        match response.kind {
            ResponseType::Ok => Ok(()),
            _ => Err(unexpected(&response)),
        }
    }

    /// Ask the daemon to drain and stop. Returns once nothing is running
    /// anymore.
    #[tracing::instrument(skip(self))]
    pub async fn shutdown(&mut self) -> Result<()> {
        self.connection.write_request(&Request::shutdown()).await?;
        let response = self.read_response().await?;
        match response.kind {
            ResponseType::Ok => Ok(()),
            _ => Err(unexpected(&response)),
        }
    }

    /// Ask the daemon to SIGKILL its process group.
    ///
    /// The daemon never answers this one, so the request is only flushed,
    /// not awaited.
    #[tracing::instrument(skip(self))]
    pub async fn kill(&mut self) -> Result<()> {
        self.connection.write_request(&Request::kill()).await
    }

    /// Read one response, surfacing server-side errors as [`Error::Server`]
    /// and an unexpected end of stream as a protocol error.
    async fn read_response(&mut self) -> Result<Response> {
        match self.connection.read_response().await? {
            Some(response) if response.kind == ResponseType::Err => {
                Err(Error::Server(response.message))
            }
            Some(response) => Ok(response),
            None => Err(Error::Protocol(
                "server closed the connection without replying".to_string(),
            )),
        }
    }
}

fn unexpected(response: &Response) -> Error {
    Error::Protocol(format!("unexpected response {:?}", response.kind))
}
