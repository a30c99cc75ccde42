use thiserror::Error;

use crate::client::UploadError;
use crate::rpc::RpcError;

/// A broken or unusable configuration.
#[derive(Error, Debug)]
#[error("config error: {reason}")]
pub struct ConfigError {
    pub reason: String,
}

/// Failures while bringing the server up or tearing it down.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    #[error("fatal: {0}")]
    Fatal(String),
}

/// Crate-level convenience error.
///
/// A thin wrapper over the subsystem errors; nothing is lost by matching on
/// the canonical types instead.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Server(#[from] ServerError),

    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error(transparent)]
    Upload(#[from] UploadError),
}
