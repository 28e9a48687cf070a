//! Top-level error type for the relay binary and embedders.

use thiserror::Error;

use crate::capture::ConfigError;
use crate::relay::StartError;
use crate::server::ServerError;
use crate::settings::SettingsError;
use crate::source::SourceError;

/// Any error that can stop the relay.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Settings(#[from] SettingsError),

    #[error(transparent)]
    Start(#[from] StartError),

    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Server(#[from] ServerError),

    #[error("runtime error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias using the crate error.
pub type Result<T, E = Error> = std::result::Result<T, E>;
