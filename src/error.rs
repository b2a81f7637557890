//! Error types for vidq.

use std::net::SocketAddr;

use thiserror::Error;

use crate::codec::DecodeError;

#[derive(Debug, Error)]
pub enum Error {
    /// Invalid startup configuration. Fatal: the pipeline never starts.
    #[error("configuration error: {0}")]
    Config(String),

    /// A listener could not bind its port. Fatal at startup.
    #[error("cannot bind listener on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("video not found: {0}")]
    NotFound(String),

    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("processing error: {0}")]
    Processing(String),

    #[error("storage error: {0}")]
    Storage(String),

    /// The shared cancel signal fired before the operation finished.
    #[error("cancelled")]
    Cancelled,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
