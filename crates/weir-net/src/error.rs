use std::io;

use thiserror::Error;

pub type NetResult<T> = Result<T, NetError>;

#[derive(Debug, Error)]
pub enum NetError {
    #[error("invalid URL `{0}`")]
    InvalidUrl(String),

    #[error("{operation} failed for {host}: {source}")]
    Io {
        operation: &'static str,
        host: String,
        #[source]
        source: io::Error,
    },

    #[error("{operation} timed out for {host}")]
    Timeout {
        operation: &'static str,
        host: String,
    },

    #[error("invalid TLS server name `{host}`")]
    InvalidServerName { host: String },

    #[error("malformed response from {host}: {reason}")]
    MalformedResponse { host: String, reason: String },

    #[error("connection pool is shut down")]
    PoolClosed,
}
