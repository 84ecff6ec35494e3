use thiserror::Error;

use crate::task::TaskState;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Unknown task name: {0}")]
    UnknownTask(String),

    #[error("Queue not served by this broker: {0}")]
    UnknownQueue(String),

    #[error("Task handler already registered: {0}")]
    DuplicateHandler(String),

    #[error("Invalid task state transition: {from:?} -> {to:?}")]
    InvalidTransition { from: TaskState, to: TaskState },

    #[error("Invalid schedule '{name}': {reason}")]
    InvalidSchedule { name: String, reason: String },

    #[error("Invalid topology: {0}")]
    InvalidTopology(String),

    #[error("Dependency cycle detected involving service: {0}")]
    DependencyCycle(String),

    #[error("{service} did not become healthy after {attempts} attempts: {last_error}")]
    Unhealthy {
        service: String,
        attempts: u32,
        last_error: String,
    },

    #[error("Broker error: {0}")]
    Broker(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
