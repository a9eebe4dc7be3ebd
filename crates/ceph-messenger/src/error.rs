use thiserror::Error;

/// Transport-level faults, per §7. Every variant that reaches a caller has
/// already been classified as fault-the-connection, close-permanently, or
/// session-reset; none of them represent partial message delivery.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),

    #[error("crc mismatch on {section} section")]
    CrcMismatch { section: &'static str },

    #[error("protocol violation: {0}")]
    Protocol(&'static str),

    #[error("peer refused connect: {0:?}")]
    Refused(crate::wire::ConnectReply),

    #[error("peer reset the session")]
    SessionReset,

    #[error("keepalive timeout exceeded")]
    KeepaliveTimeout,
}

pub type Result<T> = std::result::Result<T, ConnectionError>;
