//! Application-level error type for the binary.

use thiserror::Error;

use crate::config;
use crate::paths::PathError;
use crate::server;
use crate::services::PlatformError;

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    ConfigLoad(#[from] config::AppConfigError),
    #[error(transparent)]
    Paths(#[from] PathError),
    #[error(transparent)]
    Platform(#[from] PlatformError),
    #[error(transparent)]
    Server(#[from] server::ServerError),
}
