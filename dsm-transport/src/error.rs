use thiserror::Error;

use crate::protocol::ProtocolError;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("peer handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("peer rank {rank} has no open connection")]
    NoConnection { rank: u32 },
}
