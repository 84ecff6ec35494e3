use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Database connection error: {0}")]
    Connection(String),

    #[error("Corrupt task record {id}: {reason}")]
    CorruptRecord { id: String, reason: String },

    #[error("SQLx error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<Error> for conveyor_core::Error {
    fn from(err: Error) -> Self {
        conveyor_core::Error::Store(err.to_string())
    }
}
