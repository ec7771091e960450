//! Requests and responses exchanged between a client and the daemon.
//!
//! Messages travel as length-prefixed JSON (see [`crate::connection`]).
//! Field names and the compact integer tags are wire format: reordering an
//! enumeration or renaming a field breaks compatibility with existing
//! clients.

use serde::{Deserialize, Serialize};

use crate::Error;

/// Command selector carried in a request's `Type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "u8", into = "u8")]
pub enum RequestType {
    /// Queue a command for execution.
    Run,
    /// Block until all submitted work has finished.
    Wait,
    /// Report the daemon's pid.
    Getpid,
    /// SIGKILL the daemon's process group. No response is sent.
    Kill,
    /// Stop admitting work, drain in-flight tasks, close the listener.
    Shutdown,
    /// Change the parallelism bound.
    Config,
    /// A tag this daemon does not know. Kept so the server can answer
    /// with an error response instead of dropping the connection.
    Unknown(u8),
}

impl From<u8> for RequestType {
    fn from(tag: u8) -> Self {
        match tag {
            0 => RequestType::Run,
            1 => RequestType::Wait,
            2 => RequestType::Getpid,
            3 => RequestType::Kill,
            4 => RequestType::Shutdown,
            5 => RequestType::Config,
            tag => RequestType::Unknown(tag),
        }
    }
}

impl From<RequestType> for u8 {
    fn from(kind: RequestType) -> Self {
        match kind {
            RequestType::Run => 0,
            RequestType::Wait => 1,
            RequestType::Getpid => 2,
            RequestType::Kill => 3,
            RequestType::Shutdown => 4,
            RequestType::Config => 5,
            RequestType::Unknown(tag) => tag,
        }
    }
}

/// Response selector carried in a response's `Type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum ResponseType {
    Err,
    Ok,
    Getpid,
    Wait,
}

impl TryFrom<u8> for ResponseType {
    type Error = Error;

    fn try_from(tag: u8) -> Result<Self, Error> {
        match tag {
            0 => Ok(ResponseType::Err),
            1 => Ok(ResponseType::Ok),
            2 => Ok(ResponseType::Getpid),
            3 => Ok(ResponseType::Wait),
            tag => Err(Error::Protocol(format!("unknown response type {tag}"))),
        }
    }
}

impl From<ResponseType> for u8 {
    fn from(kind: ResponseType) -> Self {
        match kind {
            ResponseType::Err => 0,
            ResponseType::Ok => 1,
            ResponseType::Getpid => 2,
            ResponseType::Wait => 3,
        }
    }
}

/// A request from a client to the daemon.
///
/// Descriptors themselves are not part of the JSON payload: when
/// `has_fds` is set, the sender follows the request frame with a one-byte
/// carrier holding the descriptors as ancillary data, and `fds` lists the
/// numbers the child should see them at, in transfer order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Request {
    #[serde(rename = "Type")]
    pub kind: RequestType,
    #[serde(default)]
    pub has_fds: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fds: Vec<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run: Option<RunPayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<ConfigPayload>,
}

impl Request {
    /// A `run` request. `fds` are the descriptor numbers the child should
    /// see; the matching descriptors must be sent as ancillary data right
    /// after this request.
    pub fn run(run: RunPayload, fds: Vec<i32>) -> Self {
        Self {
            kind: RequestType::Run,
            has_fds: !fds.is_empty(),
            fds,
            run: Some(run),
            config: None,
        }
    }

    pub fn wait() -> Self {
        Self::bare(RequestType::Wait)
    }

    pub fn getpid() -> Self {
        Self::bare(RequestType::Getpid)
    }

    pub fn kill() -> Self {
        Self::bare(RequestType::Kill)
    }

    pub fn shutdown() -> Self {
        Self::bare(RequestType::Shutdown)
    }

    pub fn config(parallel: Option<i64>) -> Self {
        Self {
            config: Some(ConfigPayload { parallel }),
            ..Self::bare(RequestType::Config)
        }
    }

    fn bare(kind: RequestType) -> Self {
        Self {
            kind,
            has_fds: false,
            fds: Vec::new(),
            run: None,
            config: None,
        }
    }
}

/// What a `run` request should execute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RunPayload {
    /// Absolute path of the executable.
    pub exe: String,
    /// Full argument vector, argv[0] included. argv[0] is the caller's
    /// choice and is not forced to equal `exe`.
    pub args: Vec<String>,
    /// Environment as `KEY=VALUE` strings; replaces the daemon's own.
    pub env: Vec<String>,
    /// Working directory for the child.
    pub cwd: String,
}

/// Payload of a `config` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ConfigPayload {
    /// New parallelism bound, if it should change.
    pub parallel: Option<i64>,
}

/// A response from the daemon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Response {
    #[serde(rename = "Type")]
    pub kind: ResponseType,
    /// Human-readable detail; always present on `Err` responses.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub getpid: Option<GetpidPayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait: Option<WaitPayload>,
}

impl Response {
    pub fn ok() -> Self {
        Self::bare(ResponseType::Ok)
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Self::bare(ResponseType::Err)
        }
    }

    pub fn pid(pid: u32) -> Self {
        Self {
            getpid: Some(GetpidPayload { pid }),
            ..Self::bare(ResponseType::Getpid)
        }
    }

    pub fn exit_status(exit_status: i32) -> Self {
        Self {
            wait: Some(WaitPayload { exit_status }),
            ..Self::bare(ResponseType::Wait)
        }
    }

    fn bare(kind: ResponseType) -> Self {
        Self {
            kind,
            message: String::new(),
            getpid: None,
            wait: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct GetpidPayload {
    pub pid: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct WaitPayload {
    /// 0 if every task succeeded, 1 if any exited non-zero, 2 if any
    /// failed to launch at all.
    pub exit_status: i32,
}
