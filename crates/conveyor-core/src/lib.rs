pub mod broker;
pub mod builtin;
pub mod config;
pub mod engine;
pub mod error;
pub mod health;
pub mod memory;
pub mod registry;
pub mod schedule;
pub mod signal;
pub mod store;
pub mod task;
pub mod telemetry;
pub mod topology;

// Re-exports
pub use broker::{Broker, DeadLetter, QueueStats};
pub use engine::{Conveyor, EngineStatistics, SubmitHook, SubmitRequest};
pub use error::{Error, Result};
pub use memory::{MemoryBroker, MemoryStore};
pub use registry::{TaskContext, TaskError, TaskHandler, TaskRegistry};
pub use schedule::{Cadence, ScheduleEntry};
pub use store::{ResultStore, WorkerHeartbeat};
pub use task::{RetryPolicy, Task, TaskOrigin, TaskState};
