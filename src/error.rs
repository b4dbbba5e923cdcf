use std::io;
use thiserror::Error;

/// Failure raised by the connection and acceptor factories.
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("no such host: {0}")]
    Resolution(String),
    #[error("invalid address: {0}")]
    InvalidAddress(String),
    #[error("could not connect to {host}: {source}")]
    Connect {
        host: String,
        #[source]
        source: io::Error,
    },
    #[error("socket error: {0}")]
    Socket(#[from] io::Error),
}

impl From<NetworkError> for io::Error {
    fn from(value: NetworkError) -> Self {
        match value {
            NetworkError::Socket(err) => err,
            other => io::Error::other(other),
        }
    }
}
