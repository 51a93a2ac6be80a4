use crate::container::{ChainId, ContainerId};
use crate::object::Opcode;

pub type Result<T> = std::result::Result<T, SpillError>;

/// Errors produced by the display-list spill store.
#[derive(Debug, thiserror::Error)]
pub enum SpillError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bincode error: {0}")]
    Encode(#[from] bincode::Error),

    #[error("corrupt spill record at offset {offset}: {reason}")]
    CorruptRecord { offset: u64, reason: &'static str },

    #[error("page processing failed after an earlier spill error")]
    PageFailed,

    #[error("no page is active")]
    NoActivePage,

    #[error("scratch channel is not open")]
    ChannelClosed,

    #[error("unknown chain {0:?}")]
    UnknownChain(ChainId),

    #[error("object index {index} out of range for chain of {len} objects")]
    ObjectOutOfRange { index: usize, len: usize },

    #[error("chain links to missing container {0:?}")]
    BrokenChain(ContainerId),

    #[error("container {0:?} is not archived")]
    NotArchived(ContainerId),

    #[error("container {0:?} is not the block currently loaded")]
    BlockNotLoaded(ContainerId),

    #[error("record at offset {offset} would change size: expected {expected} bytes, found {found}")]
    RecordSizeChanged {
        offset: u64,
        expected: u64,
        found: u64,
    },

    #[error("{0:?} payloads cannot be rewritten")]
    NotRewritable(Opcode),

    #[error("record of {needed} bytes does not fit the {limit} byte load buffer")]
    LoadBufferTooSmall { needed: usize, limit: usize },

    #[error("invalid spill config: {0}")]
    Config(String),
}

impl SpillError {
    /// Whether the error leaves the page's spilled data in an unknown state.
    ///
    /// Fatal errors poison the page: every later operation on it returns
    /// [`SpillError::PageFailed`].
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SpillError::Io(_)
                | SpillError::Encode(_)
                | SpillError::CorruptRecord { .. }
                | SpillError::ChannelClosed
                | SpillError::BrokenChain(_)
                | SpillError::LoadBufferTooSmall { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_are_fatal_and_caller_errors_are_not() {
        assert!(SpillError::from(std::io::Error::other("boom")).is_fatal());
        assert!(SpillError::CorruptRecord {
            offset: 0,
            reason: "bad kind"
        }
        .is_fatal());
        assert!(!SpillError::NoActivePage.is_fatal());
        assert!(!SpillError::BlockNotLoaded(ContainerId::from_raw(3)).is_fatal());
        assert!(!SpillError::RecordSizeChanged {
            offset: 0,
            expected: 1,
            found: 2
        }
        .is_fatal());
    }
}
