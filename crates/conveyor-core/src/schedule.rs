use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::path::Path;
use std::str::FromStr;

use crate::{Error, Result, Task, TaskOrigin};

/// How often a schedule entry fires.
#[derive(Debug, Clone)]
pub enum Cadence {
    Cron { expr: String, schedule: cron::Schedule },
    Every { seconds: u64 },
}

impl Cadence {
    /// Accepts the `cron` crate grammar (seconds first) and classic
    /// five-field expressions, which fire at second zero.
    pub fn cron(expr: &str) -> std::result::Result<Self, String> {
        let fields = expr.split_whitespace().count();
        let normalized = if fields == 5 {
            format!("0 {}", expr.trim())
        } else {
            expr.trim().to_string()
        };
        let schedule = cron::Schedule::from_str(&normalized).map_err(|e| e.to_string())?;
        Ok(Cadence::Cron {
            expr: expr.trim().to_string(),
            schedule,
        })
    }

    pub fn every(seconds: u64) -> std::result::Result<Self, String> {
        if seconds == 0 {
            return Err("interval must be at least one second".to_string());
        }
        Ok(Cadence::Every { seconds })
    }

    /// First fire time strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Cadence::Cron { schedule, .. } => schedule.after(&after).next(),
            Cadence::Every { seconds } => {
                Some(after + chrono::Duration::seconds(i64::try_from(*seconds).ok()?))
            }
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Cadence::Cron { expr, .. } => format!("cron({})", expr),
            Cadence::Every { seconds } => format!("every {}s", seconds),
        }
    }
}

/// Schedule entry as written in a schedule file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleSpec {
    pub name: String,
    pub task: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub queue: Option<String>,
    #[serde(default)]
    pub cron: Option<String>,
    #[serde(default)]
    pub every_secs: Option<u64>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub run_on_start: bool,
    #[serde(default)]
    pub max_retries: Option<u32>,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone)]
pub struct ScheduleEntry {
    pub name: String,
    pub task: String,
    pub payload: Value,
    pub queue: Option<String>,
    pub cadence: Cadence,
    pub enabled: bool,
    pub run_on_start: bool,
    pub max_retries: Option<u32>,
}

impl ScheduleEntry {
    pub fn new(name: impl Into<String>, task: impl Into<String>, cadence: Cadence) -> Self {
        Self {
            name: name.into(),
            task: task.into(),
            payload: Value::Null,
            queue: None,
            cadence,
            enabled: true,
            run_on_start: false,
            max_retries: None,
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn run_on_start(mut self) -> Self {
        self.run_on_start = true;
        self
    }

    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.cadence.next_after(after)
    }

    /// Builds the task this entry emits.
    pub fn instantiate(&self, default_queue: &str) -> Task {
        let mut task = Task::new(self.task.clone(), self.payload.clone())
            .with_queue(self.queue.clone().unwrap_or_else(|| default_queue.to_string()))
            .with_origin(TaskOrigin::Schedule(self.name.clone()));
        if let Some(max_retries) = self.max_retries {
            task = task.with_max_retries(max_retries);
        }
        task
    }
}

impl TryFrom<ScheduleSpec> for ScheduleEntry {
    type Error = Error;

    fn try_from(spec: ScheduleSpec) -> Result<Self> {
        let invalid = |reason: String| Error::InvalidSchedule {
            name: spec.name.clone(),
            reason,
        };

        let cadence = match (&spec.cron, spec.every_secs) {
            (Some(expr), None) => Cadence::cron(expr).map_err(invalid)?,
            (None, Some(seconds)) => Cadence::every(seconds).map_err(invalid)?,
            (Some(_), Some(_)) => {
                return Err(invalid("set either `cron` or `every_secs`, not both".to_string()))
            }
            (None, None) => return Err(invalid("missing `cron` or `every_secs`".to_string())),
        };

        Ok(Self {
            name: spec.name,
            task: spec.task,
            payload: spec.payload,
            queue: spec.queue,
            cadence,
            enabled: spec.enabled,
            run_on_start: spec.run_on_start,
            max_retries: spec.max_retries,
        })
    }
}

#[derive(Debug, Deserialize)]
struct ScheduleFile {
    #[serde(default)]
    schedules: Vec<ScheduleSpec>,
}

/// Rejects entries sharing a name; the name keys the last-fired record.
pub fn ensure_unique_names(entries: &[ScheduleEntry]) -> Result<()> {
    let mut seen = HashSet::new();
    for entry in entries {
        if !seen.insert(entry.name.as_str()) {
            return Err(Error::InvalidSchedule {
                name: entry.name.clone(),
                reason: "duplicate schedule name".to_string(),
            });
        }
    }
    Ok(())
}

/// Reads `[[schedules]]` from a TOML, YAML or JSON file.
pub fn load_schedules(path: impl AsRef<Path>) -> Result<Vec<ScheduleEntry>> {
    let file: ScheduleFile = config::Config::builder()
        .add_source(config::File::from(path.as_ref()))
        .build()?
        .try_deserialize()?;

    let entries = file
        .schedules
        .into_iter()
        .map(ScheduleEntry::try_from)
        .collect::<Result<Vec<_>>>()?;
    ensure_unique_names(&entries)?;
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn spec(name: &str) -> ScheduleSpec {
        ScheduleSpec {
            name: name.to_string(),
            task: "echo".to_string(),
            payload: Value::Null,
            queue: None,
            cron: None,
            every_secs: None,
            enabled: true,
            run_on_start: false,
            max_retries: None,
        }
    }

    #[test]
    fn test_every_cadence() {
        let cadence = Cadence::every(30).unwrap();
        let t = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(cadence.next_after(t), Some(t + chrono::Duration::seconds(30)));
        assert!(Cadence::every(0).is_err());
    }

    #[test]
    fn test_five_field_cron_fires_on_second_zero() {
        let cadence = Cadence::cron("*/15 * * * *").unwrap();
        let t = Utc.with_ymd_and_hms(2024, 1, 1, 10, 7, 30).unwrap();
        assert_eq!(
            cadence.next_after(t),
            Some(Utc.with_ymd_and_hms(2024, 1, 1, 10, 15, 0).unwrap())
        );
    }

    #[test]
    fn test_cron_next_is_strictly_after() {
        let cadence = Cadence::cron("0 0 * * * *").unwrap();
        let on_the_hour = Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap();
        assert_eq!(
            cadence.next_after(on_the_hour),
            Some(Utc.with_ymd_and_hms(2024, 1, 1, 11, 0, 0).unwrap())
        );
    }

    #[test]
    fn test_spec_requires_exactly_one_cadence() {
        assert!(ScheduleEntry::try_from(spec("none")).is_err());

        let mut both = spec("both");
        both.cron = Some("0 * * * * *".to_string());
        both.every_secs = Some(5);
        assert!(ScheduleEntry::try_from(both).is_err());

        let mut bad = spec("bad");
        bad.cron = Some("not a cron".to_string());
        assert!(matches!(
            ScheduleEntry::try_from(bad),
            Err(Error::InvalidSchedule { name, .. }) if name == "bad"
        ));
    }

    #[test]
    fn test_instantiate_tags_origin() {
        let entry = ScheduleEntry::new("tick", "echo", Cadence::every(1).unwrap())
            .with_payload(json!({"n": 1}));
        let task = entry.instantiate("reports");

        assert_eq!(task.origin, TaskOrigin::Schedule("tick".to_string()));
        assert_eq!(task.queue, "reports");
        assert_eq!(task.payload, json!({"n": 1}));
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let a = ScheduleEntry::new("dup", "echo", Cadence::every(1).unwrap());
        let b = ScheduleEntry::new("dup", "add", Cadence::every(2).unwrap());
        assert!(ensure_unique_names(&[a, b]).is_err());
    }

    #[test]
    fn test_load_schedules_from_toml() {
        let dir = std::env::temp_dir().join(format!("conveyor-sched-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("schedules.toml");
        std::fs::write(
            &path,
            r#"
[[schedules]]
name = "heartbeat"
task = "echo"
every_secs = 60
payload = { source = "beat" }

[[schedules]]
name = "nightly"
task = "sleep"
cron = "0 3 * * *"
enabled = false
"#,
        )
        .unwrap();

        let entries = load_schedules(&path).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].payload, json!({"source": "beat"}));
        assert!(!entries[1].enabled);

        std::fs::remove_dir_all(dir).ok();
    }
}
