use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// The state loop is not running.
    #[error("raft is stopped")]
    Stop,

    /// The state loop did not take or answer a request in time.
    #[error("failed to deliver request to the state loop")]
    Send,

    #[error("call timed out")]
    Timeout,

    #[error("rpc error: {0}")]
    Rpc(String),

    #[error("mysql error: {0}")]
    MySql(String),

    #[error("shell command failed: {0}")]
    Shell(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}
