//! Periodic task emitter.
//!
//! Each tick compares every entry's next fire time, computed from the last
//! time it fired, with the clock. An entry that is due emits exactly one
//! task even if several of its periods were missed while the beat was down.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::future::Future;
use std::time::Duration;

use conveyor_core::config::{instance_name, Settings};
use conveyor_core::schedule::{ensure_unique_names, load_schedules};
use conveyor_core::{Conveyor, Result, ScheduleEntry, Task};

pub struct Beat {
    entries: Vec<ScheduleEntry>,
    conveyor: Conveyor,
}

/// One entry as shown to operators.
#[derive(Debug, Clone, Serialize)]
pub struct ScheduleInfo {
    pub name: String,
    pub task: String,
    pub cadence: String,
    pub enabled: bool,
    pub last_fired: Option<DateTime<Utc>>,
    pub next_fire: Option<DateTime<Utc>>,
}

impl Beat {
    pub fn new(entries: Vec<ScheduleEntry>, conveyor: Conveyor) -> Result<Self> {
        ensure_unique_names(&entries)?;
        Ok(Self { entries, conveyor })
    }

    pub fn entries(&self) -> &[ScheduleEntry] {
        &self.entries
    }

    /// Emits the tasks due at `now`.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<Vec<Task>> {
        let store = self.conveyor.store();
        let mut emitted = Vec::new();

        for entry in self.entries.iter().filter(|e| e.enabled) {
            let due = match store.last_fired(&entry.name).await? {
                Some(last) => entry.next_after(last).map_or(false, |next| next <= now),
                None if entry.run_on_start => true,
                None => {
                    // First sighting starts the clock.
                    store.mark_fired(&entry.name, now).await?;
                    tracing::debug!(entry = %entry.name, "Schedule registered");
                    continue;
                }
            };
            if !due {
                continue;
            }

            let task = entry.instantiate(self.conveyor.queue_name());
            // Marked even when submission fails so a broken entry waits for
            // its next period instead of firing every tick.
            store.mark_fired(&entry.name, now).await?;

            match self.conveyor.submit_task(task).await {
                Ok(task) => {
                    tracing::info!(entry = %entry.name, task_id = %task.id, "Schedule fired");
                    emitted.push(task);
                }
                Err(e) => {
                    tracing::error!(entry = %entry.name, error = %e, "Failed to submit scheduled task");
                }
            }
        }

        Ok(emitted)
    }

    /// Ticks every `tick` until `shutdown` resolves.
    pub async fn run(&self, tick: Duration, shutdown: impl Future<Output = ()>) {
        let mut ticker = tokio::time::interval(tick.max(Duration::from_millis(100)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        tokio::pin!(shutdown);

        tracing::info!(entries = self.entries.len(), "Beat started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = &mut shutdown => break,
            }

            if let Err(e) = self.tick(Utc::now()).await {
                tracing::error!(error = %e, "Beat tick failed");
            }
        }

        tracing::info!("Beat stopped");
    }

    pub async fn schedules(&self) -> Result<Vec<ScheduleInfo>> {
        let store = self.conveyor.store();
        let mut infos = Vec::with_capacity(self.entries.len());

        for entry in &self.entries {
            let last_fired = store.last_fired(&entry.name).await?;
            let next_fire = if entry.enabled {
                entry.next_after(last_fired.unwrap_or_else(Utc::now))
            } else {
                None
            };
            infos.push(ScheduleInfo {
                name: entry.name.clone(),
                task: entry.task.clone(),
                cadence: entry.cadence.describe(),
                enabled: entry.enabled,
                last_fired,
                next_fire,
            });
        }

        Ok(infos)
    }
}

/// Entries from the configured schedule file; none when no file is set.
pub fn configured_entries(settings: &Settings) -> Result<Vec<ScheduleEntry>> {
    match &settings.beat.schedule_file {
        Some(path) => load_schedules(path),
        None => {
            tracing::warn!("No schedule file configured; beat has nothing to emit");
            Ok(Vec::new())
        }
    }
}

/// Runs the beat service until `shutdown` resolves.
pub async fn run(settings: &Settings, shutdown: impl Future<Output = ()>) -> anyhow::Result<()> {
    let entries = configured_entries(settings)?;
    let backends =
        conveyor_broker::Backends::open_when_ready(settings, &instance_name("beat")).await?;
    let conveyor = Conveyor::new(backends.broker, backends.store)
        .with_default_max_retries(settings.retry.max_retries);

    let beat = Beat::new(entries, conveyor)?;
    beat.run(Duration::from_secs(settings.beat.tick_secs), shutdown)
        .await;
    Ok(())
}
