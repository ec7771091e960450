//! A module for handling the connection to a stream, usually a local peer
//! via a [`UnixStream`].
use std::io::{self, IoSlice, IoSliceMut};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use nix::sys::socket::{recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags, UnixAddr};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter, Interest};
use tokio::net::UnixStream;
use tracing::debug;

use crate::message::{Request, Response};
use crate::{Error, Result};

/// Refuse to allocate for messages claiming to be larger than this.
const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Upper bound on descriptors a single request may carry.
pub const MAX_PASSED_FDS: usize = 64;

/// Send and receive protocol messages from a peer.
///
/// Each message is framed as a 4-byte big-endian length followed by that
/// many bytes of JSON. Reads are exact (header, then payload) with no
/// read-ahead: a request whose `HasFds` flag is set is followed on the
/// stream by a one-byte carrier with descriptors attached as ancillary
/// data, and bytes buffered past a message boundary would consume that
/// carrier and lose the descriptors with it.
///
/// Writes go through a buffer and are flushed once per message.
#[derive(Debug)]
pub struct Connection<S> {
    /// Stream wrapped with a `BufWriter` for buffering writes.
    stream: BufWriter<S>,
}

/// A trait for types that can be used as a connection stream.
pub trait ConnectionStream: AsyncRead + AsyncWrite + Unpin + Send {}

// Blanket implementation for all types that implement `AsyncRead + AsyncWrite + Unpin + Send`.
impl<T: AsyncRead + AsyncWrite + Unpin + Send> ConnectionStream for T {}

impl<S: ConnectionStream> Connection<S> {
    pub fn new(socket: S) -> Self {
        Self {
            stream: BufWriter::new(socket),
        }
    }

    /// Read a single request from the connection.
    ///
    /// Returns `None` on a clean end of stream, i.e. the peer closed the
    /// connection between messages. Closing mid-message is an error.
    pub async fn read_request(&mut self) -> Result<Option<Request>> {
        self.read_message().await
    }

    /// Read a single response from the connection.
    pub async fn read_response(&mut self) -> Result<Option<Response>> {
        self.read_message().await
    }

    pub async fn write_request(&mut self, request: &Request) -> Result<()> {
        self.write_message(request).await
    }

    pub async fn write_response(&mut self, response: &Response) -> Result<()> {
        self.write_message(response).await
    }

    async fn read_message<T: DeserializeOwned>(&mut self) -> Result<Option<T>> {
        let mut header = [0u8; 4];
        let mut filled = 0;
        while filled < header.len() {
            let n = self.stream.read(&mut header[filled..]).await?;
            if n == 0 {
                if filled == 0 {
                    debug!("peer closed the connection");
                    return Ok(None);
                }
                return Err(Error::Protocol(
                    "connection closed inside a message header".to_string(),
                ));
            }
            filled += n;
        }

        let len = u32::from_be_bytes(header) as usize;
        if len > MAX_MESSAGE_SIZE {
            return Err(Error::Protocol(format!(
                "message of {len} bytes exceeds the {MAX_MESSAGE_SIZE} byte limit"
            )));
        }

        let mut payload = vec![0u8; len];
        if let Err(err) = self.stream.read_exact(&mut payload).await {
            if err.kind() == io::ErrorKind::UnexpectedEof {
                return Err(Error::Protocol(
                    "connection closed inside a message payload".to_string(),
                ));
            }
            return Err(err.into());
        }

        let message = serde_json::from_slice(&payload)?;
        debug!(bytes = len, "message received");
        Ok(Some(message))
    }

    async fn write_message<T: Serialize>(&mut self, message: &T) -> Result<()> {
        let payload = serde_json::to_vec(message)?;
        let len = u32::try_from(payload.len())
            .map_err(|_| Error::Protocol("message does not fit in a frame".to_string()))?;

        self.stream.write_u32(len).await?;
        self.stream.write_all(&payload).await?;
        self.stream.flush().await?;
        debug!(bytes = len, "message sent");
        Ok(())
    }
}

impl Connection<UnixStream> {
    /// Receive the one-byte carrier that follows a request whose `HasFds`
    /// flag is set, and return every descriptor transferred with it.
    ///
    /// Non-descriptor control messages are ignored; receiving no
    /// descriptors at all is an error. The returned descriptors are owned
    /// and close on drop.
    pub async fn recv_fds(&mut self) -> Result<Vec<OwnedFd>> {
        let stream = self.stream.get_ref();
        let fds = stream
            .async_io(Interest::READABLE, || {
                let mut carrier = [0u8; 1];
                let mut iov = [IoSliceMut::new(&mut carrier)];
                let mut cmsg_buffer = nix::cmsg_space!([RawFd; MAX_PASSED_FDS]);
                let message = recvmsg::<UnixAddr>(
                    stream.as_raw_fd(),
                    &mut iov,
                    Some(&mut cmsg_buffer),
                    MsgFlags::MSG_CMSG_CLOEXEC,
                )
                .map_err(io::Error::from)?;

                if message.bytes == 0 {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "connection closed before the descriptor carrier",
                    ));
                }

                let mut fds = Vec::new();
                for cmsg in message.cmsgs().map_err(io::Error::from)? {
                    if let ControlMessageOwned::ScmRights(received) = cmsg {
                        // SAFETY: recvmsg installed these descriptors in our
                        // table; nothing else owns them yet.
                        fds.extend(
                            received
                                .into_iter()
                                .map(|fd| unsafe { OwnedFd::from_raw_fd(fd) }),
                        );
                    }
                }
                Ok(fds)
            })
            .await?;

        if fds.is_empty() {
            return Err(Error::Protocol(
                "request advertised descriptors but none arrived".to_string(),
            ));
        }
        debug!(count = fds.len(), "descriptors received");
        Ok(fds)
    }

    /// Send `fds` as ancillary data on a one-byte carrier.
    ///
    /// Must be called directly after writing the request that advertises
    /// them; any buffered frame bytes are flushed first so the carrier
    /// lands where the receiver expects it.
    pub async fn send_fds(&mut self, fds: &[RawFd]) -> Result<()> {
        if fds.len() > MAX_PASSED_FDS {
            return Err(Error::Protocol(format!(
                "cannot transfer more than {MAX_PASSED_FDS} descriptors in one request"
            )));
        }
        self.stream.flush().await?;

        let stream = self.stream.get_ref();
        stream
            .async_io(Interest::WRITABLE, || {
                let carrier = [0u8; 1];
                let iov = [IoSlice::new(&carrier)];
                let cmsgs = [ControlMessage::ScmRights(fds)];
                sendmsg::<UnixAddr>(stream.as_raw_fd(), &iov, &cmsgs, MsgFlags::empty(), None)
                    .map_err(io::Error::from)?;
                Ok(())
            })
            .await?;
        debug!(count = fds.len(), "descriptors sent");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::RunPayload;
    use std::fs::File;
    use std::io::{Read, Write};

    fn frame(payload: &[u8]) -> Vec<u8> {
        let mut bytes = (payload.len() as u32).to_be_bytes().to_vec();
        bytes.extend_from_slice(payload);
        bytes
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn test_read_write_request() {
        let requests = [
            Request::getpid(),
            Request::wait(),
            Request::config(Some(3)),
            Request::run(
                RunPayload {
                    exe: "/bin/echo".to_string(),
                    args: vec!["/bin/echo".to_string(), "hi".to_string()],
                    env: vec!["PATH=/bin".to_string()],
                    cwd: "/".to_string(),
                },
                vec![0, 1, 2],
            ),
        ];

        // A mock stream that expects every encoded request to be both read
        // and written, in order.
        let stream = requests
            .iter()
            .fold(tokio_test::io::Builder::new(), |mut acc, request| {
                let bytes = frame(&serde_json::to_vec(request).unwrap());
                acc.read(&bytes);
                acc.write(&bytes);
                acc
            })
            .build();
        let mut conn = Connection::new(stream);

        for request in &requests {
            let received = conn.read_request().await.unwrap().unwrap();
            assert_eq!(received, *request);
            conn.write_request(request).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_clean_eof_reads_as_none() {
        let stream = tokio_test::io::Builder::new().build();
        let mut conn = Connection::new(stream);
        assert!(conn.read_request().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_eof_inside_header_is_an_error() {
        let stream = tokio_test::io::Builder::new().read(&[0, 0]).build();
        let mut conn = Connection::new(stream);
        match conn.read_request().await {
            Err(Error::Protocol(msg)) => assert!(msg.contains("header")),
            other => panic!("expected a protocol error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_eof_inside_payload_is_an_error() {
        // Header claims 100 bytes, only 3 arrive.
        let mut bytes = 100u32.to_be_bytes().to_vec();
        bytes.extend_from_slice(b"abc");
        let stream = tokio_test::io::Builder::new().read(&bytes).build();
        let mut conn = Connection::new(stream);
        match conn.read_request().await {
            Err(Error::Protocol(msg)) => assert!(msg.contains("payload")),
            other => panic!("expected a protocol error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_garbage_payload_is_a_codec_error() {
        let stream = tokio_test::io::Builder::new()
            .read(&frame(b"not json"))
            .build();
        let mut conn = Connection::new(stream);
        assert!(matches!(conn.read_request().await, Err(Error::Json(_))));
    }

    #[tokio::test]
    async fn test_oversized_length_is_rejected() {
        let stream = tokio_test::io::Builder::new()
            .read(&u32::MAX.to_be_bytes())
            .build();
        let mut conn = Connection::new(stream);
        match conn.read_request().await {
            Err(Error::Protocol(msg)) => assert!(msg.contains("limit")),
            other => panic!("expected a protocol error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_descriptors_cross_a_socketpair() {
        let (left, right) = UnixStream::pair().unwrap();
        let mut sender = Connection::new(left);
        let mut receiver = Connection::new(right);

        let (pipe_read, pipe_write) = nix::unistd::pipe().unwrap();
        sender.send_fds(&[pipe_write.as_raw_fd()]).await.unwrap();

        let received = receiver.recv_fds().await.unwrap();
        assert_eq!(received.len(), 1);

        // Writing through the received copy must be visible on the
        // original pipe: same open file description.
        let mut writer = File::from(received.into_iter().next().unwrap());
        writer.write_all(b"ping").unwrap();
        drop(writer);
        drop(pipe_write);

        let mut output = String::new();
        File::from(pipe_read).read_to_string(&mut output).unwrap();
        assert_eq!(output, "ping");
    }
}
