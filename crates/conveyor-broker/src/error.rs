use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Redis connection failed: {0}")]
    Connection(String),

    #[error("Redis operation failed: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Corrupt entry at {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<Error> for conveyor_core::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::Serialization(e) => conveyor_core::Error::Serialization(e),
            other => conveyor_core::Error::Broker(other.to_string()),
        }
    }
}
