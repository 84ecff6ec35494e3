use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

use crate::{Error, Result};

pub const DEFAULT_QUEUE: &str = "default";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskState {
    Queued,
    Running,
    Succeeded,
    Failed,
    Retrying,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Succeeded | TaskState::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Queued => "Queued",
            TaskState::Running => "Running",
            TaskState::Succeeded => "Succeeded",
            TaskState::Failed => "Failed",
            TaskState::Retrying => "Retrying",
        }
    }

    fn can_transition_to(self, next: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (self, next),
            (Queued, Running)
                | (Retrying, Running)
                | (Running, Succeeded)
                | (Running, Retrying)
                | (Running, Failed)
        )
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "queued" => Ok(TaskState::Queued),
            "running" => Ok(TaskState::Running),
            "succeeded" => Ok(TaskState::Succeeded),
            "failed" => Ok(TaskState::Failed),
            "retrying" => Ok(TaskState::Retrying),
            other => Err(Error::Other(anyhow::anyhow!("unknown task state: {}", other))),
        }
    }
}

/// Who put the task on the queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "entry", rename_all = "snake_case")]
pub enum TaskOrigin {
    Api,
    Cli,
    Schedule(String),
}

impl fmt::Display for TaskOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskOrigin::Api => f.write_str("api"),
            TaskOrigin::Cli => f.write_str("cli"),
            TaskOrigin::Schedule(entry) => write!(f, "schedule:{}", entry),
        }
    }
}

impl FromStr for TaskOrigin {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "api" => Ok(TaskOrigin::Api),
            "cli" => Ok(TaskOrigin::Cli),
            other => other
                .strip_prefix("schedule:")
                .map(|entry| TaskOrigin::Schedule(entry.to_string()))
                .ok_or_else(|| Error::Other(anyhow::anyhow!("unknown task origin: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub name: String,
    pub payload: Value,
    pub queue: String,
    pub state: TaskState,
    pub attempts: u32,
    pub max_retries: u32,
    pub origin: TaskOrigin,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub eta: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(name: impl Into<String>, payload: Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            payload,
            queue: DEFAULT_QUEUE.to_string(),
            state: TaskState::Queued,
            attempts: 0,
            max_retries: RetryPolicy::default().max_retries,
            origin: TaskOrigin::Api,
            result: None,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            eta: None,
        }
    }

    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_origin(mut self, origin: TaskOrigin) -> Self {
        self.origin = origin;
        self
    }

    fn transition(&mut self, next: TaskState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(Error::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }

    /// Begins a run. Every run counts as an attempt.
    pub fn start(&mut self) -> Result<()> {
        self.transition(TaskState::Running)?;
        self.attempts += 1;
        self.started_at = Some(Utc::now());
        self.eta = None;
        Ok(())
    }

    pub fn succeed(&mut self, result: Value) -> Result<()> {
        self.transition(TaskState::Succeeded)?;
        self.result = Some(result);
        self.error = None;
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    pub fn retry_at(&mut self, error: String, eta: DateTime<Utc>) -> Result<()> {
        self.transition(TaskState::Retrying)?;
        self.error = Some(error);
        self.eta = Some(eta);
        Ok(())
    }

    pub fn fail(&mut self, error: String) -> Result<()> {
        self.transition(TaskState::Failed)?;
        self.error = Some(error);
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    /// Whether another run is allowed after the current one.
    pub fn has_retries_left(&self) -> bool {
        self.attempts <= self.max_retries
    }

    /// Wall time of the last run, if it finished.
    pub fn runtime(&self) -> Option<chrono::Duration> {
        match (self.started_at, self.completed_at) {
            (Some(started), Some(completed)) => Some(completed - started),
            _ => None,
        }
    }
}

/// Exponential backoff between runs of a failing task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
    #[serde(with = "duration_secs")]
    pub base_delay: Duration,
    #[serde(with = "duration_secs")]
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(300),
        }
    }
}

impl RetryPolicy {
    /// Delay before the run following `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let factor = 1u32 << exponent;
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    pub fn next_eta(&self, attempt: u32, now: DateTime<Utc>) -> DateTime<Utc> {
        let delay = chrono::Duration::from_std(self.delay_for(attempt))
            .unwrap_or_else(|_| chrono::Duration::seconds(self.max_delay.as_secs() as i64));
        now + delay
    }
}

pub(crate) mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        if !secs.is_finite() || secs < 0.0 {
            return Err(serde::de::Error::custom("duration must be a non-negative number"));
        }
        Ok(Duration::from_secs_f64(secs))
    }
}
