use thiserror::Error;

/// Failure kinds for the snap engine, per §7. Both variants are
/// drop-the-message faults: the caller logs and moves on rather than
/// propagating a failure to whatever delivered the trace (one corrupt
/// update should not fault the MDS session).
#[derive(Debug, Error)]
pub enum SnapError {
    #[error("corrupt snap trace: {0}")]
    CorruptTrace(&'static str),

    #[error("corrupt snap message: {0}")]
    CorruptMessage(&'static str),
}

pub type Result<T> = std::result::Result<T, SnapError>;
