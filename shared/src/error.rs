use std::io;

use crate::memory_region::MemoryKind;

pub type Result<T> = std::result::Result<T, BenchError>;

#[derive(Debug, thiserror::Error)]
pub enum BenchError {
    #[error("failed to allocate {capacity} bytes of {kind} memory: {reason}")]
    Allocation {
        kind: MemoryKind,
        capacity: usize,
        reason: String,
    },

    #[error("connection with {peer} failed: {reason}")]
    Connection { peer: String, reason: String },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("transfer of {size} bytes failed: {reason}")]
    Transfer { size: usize, reason: String },

    #[error("failed to write report: {0}")]
    Io(#[from] io::Error),
}

impl BenchError {
    pub(crate) fn connection(peer: impl ToString, reason: impl ToString) -> Self {
        BenchError::Connection {
            peer: peer.to_string(),
            reason: reason.to_string(),
        }
    }
}
