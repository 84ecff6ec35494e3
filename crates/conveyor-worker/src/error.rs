use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Core(#[from] conveyor_core::Error),

    #[error("Worker pool is already running")]
    AlreadyRunning,

    #[error("Worker pool is not running")]
    NotRunning,

    #[error("Shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),
}

pub type Result<T> = std::result::Result<T, Error>;
