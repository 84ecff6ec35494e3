use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::json;
use std::sync::Arc;

use conveyor_beat::Beat;
use conveyor_core::{
    Broker, Cadence, Conveyor, MemoryBroker, MemoryStore, ResultStore, ScheduleEntry, TaskOrigin,
};

fn at(secs: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::seconds(secs)
}

fn every(name: &str, seconds: u64) -> ScheduleEntry {
    ScheduleEntry::new(name, "echo", Cadence::every(seconds).unwrap())
}

fn beat(entries: Vec<ScheduleEntry>) -> (Beat, Arc<MemoryBroker>, Arc<MemoryStore>) {
    let broker = Arc::new(MemoryBroker::default());
    let store = Arc::new(MemoryStore::new());
    let conveyor = Conveyor::new(broker.clone(), store.clone());
    (Beat::new(entries, conveyor).unwrap(), broker, store)
}

#[tokio::test]
async fn test_first_tick_only_starts_the_clock() {
    let (beat, broker, store) = beat(vec![every("heartbeat", 60)]);

    assert!(beat.tick(at(0)).await.unwrap().is_empty());
    assert_eq!(store.last_fired("heartbeat").await.unwrap(), Some(at(0)));
    assert_eq!(broker.stats().await.unwrap().pending, 0);
}

#[tokio::test]
async fn test_run_on_start_fires_immediately() {
    let (beat, _, _) = beat(vec![every("warmup", 60).run_on_start()]);

    let fired = beat.tick(at(0)).await.unwrap();
    assert_eq!(fired.len(), 1);
    assert_eq!(fired[0].origin, TaskOrigin::Schedule("warmup".to_string()));
}

#[tokio::test]
async fn test_fires_once_per_period() {
    let (beat, broker, _) = beat(vec![every("report", 60).with_payload(json!({"kind": "daily"}))]);

    beat.tick(at(0)).await.unwrap();
    assert!(beat.tick(at(59)).await.unwrap().is_empty());

    let fired = beat.tick(at(60)).await.unwrap();
    assert_eq!(fired.len(), 1);
    assert_eq!(fired[0].payload, json!({"kind": "daily"}));
    assert!(beat.tick(at(61)).await.unwrap().is_empty());

    assert_eq!(broker.stats().await.unwrap().pending, 1);
}

#[tokio::test]
async fn test_missed_periods_are_not_caught_up() {
    let (beat, _, store) = beat(vec![every("sync", 10)]);

    beat.tick(at(0)).await.unwrap();
    // Down for ten periods; one catch-up task, then the clock restarts.
    assert_eq!(beat.tick(at(100)).await.unwrap().len(), 1);
    assert_eq!(store.last_fired("sync").await.unwrap(), Some(at(100)));
    assert!(beat.tick(at(105)).await.unwrap().is_empty());
    assert_eq!(beat.tick(at(110)).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_disabled_entries_never_fire() {
    let (beat, _, store) = beat(vec![every("off", 1).disabled().run_on_start()]);

    assert!(beat.tick(at(0)).await.unwrap().is_empty());
    assert!(beat.tick(at(100)).await.unwrap().is_empty());
    assert!(store.last_fired("off").await.unwrap().is_none());
}

#[tokio::test]
async fn test_cron_entry_fires_on_boundary() {
    let entry = ScheduleEntry::new("minutely", "echo", Cadence::cron("* * * * *").unwrap());
    let (beat, _, _) = beat(vec![entry]);

    beat.tick(at(10)).await.unwrap();
    assert!(beat.tick(at(59)).await.unwrap().is_empty());
    assert_eq!(beat.tick(at(60)).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_duplicate_names_rejected() {
    let conveyor = Conveyor::new(Arc::new(MemoryBroker::default()), Arc::new(MemoryStore::new()));
    let result = Beat::new(vec![every("dup", 5), every("dup", 10)], conveyor);
    assert!(result.is_err());
}

#[tokio::test]
async fn test_schedules_view_reports_next_fire() {
    let (beat, _, _) = beat(vec![every("a", 30), every("b", 5).disabled()]);
    beat.tick(at(0)).await.unwrap();

    let infos = tokio_test::assert_ok!(beat.schedules().await);
    assert_eq!(infos[0].name, "a");
    assert_eq!(infos[0].cadence, "every 30s");
    assert_eq!(infos[0].next_fire, Some(at(30)));
    assert!(infos[1].next_fire.is_none());
}
