use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("codec error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("cannot send requests to a shutting-down server")]
    /// A `run` request arrived after shutdown began.
    ShuttingDown,
    #[error("server error: {0}")]
    /// The server answered with an error response; the message is the
    /// server's own description of what went wrong.
    Server(String),
}
