use thiserror::Error;

use crate::protocol::Protocol;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("no available port")]
    NoAvailablePort,

    #[error("failed to get lock")]
    FailedToGetLock,

    #[error("pool not found: {0}")]
    PoolNotFound(String),

    #[error("pool item not found: {0}")]
    ItemNotFound(String),

    #[error("pool item already exists: {0}")]
    ItemAlreadyExists(String),

    #[error("pool item is deleting: {0}")]
    ItemDeleting(String),

    #[error("protocol {0} is not supported by the pool item")]
    ProtocolNotSupported(Protocol),

    #[error("pool item must support at least two protocols")]
    NotMultiProtocol,

    #[error("pool item must support at least one protocol")]
    NoProtocol,

    #[error("duplicated protocol: {0}")]
    DuplicatedProtocol(Protocol),

    #[error("invalid protocol: {0}")]
    InvalidProtocol(String),

    #[error("invalid port range: {0}-{1}")]
    InvalidRange(u16, u16),

    #[error("new end port {new} must be larger than current end port {current}")]
    InvalidEndPort { current: u16, new: u16 },
}
