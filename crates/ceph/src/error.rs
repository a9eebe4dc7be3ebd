use thiserror::Error;

use crate::config::ConfigError;

/// Unifies the subsystem error types behind one enum so the facade's public
/// functions have a single error type (§7).
#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Connection(#[from] ceph_messenger::ConnectionError),

    #[error(transparent)]
    Snap(#[from] ceph_snap::SnapError),

    #[error("no monitor addresses configured")]
    NoMonitors,
}

pub type Result<T> = std::result::Result<T, ClientError>;
