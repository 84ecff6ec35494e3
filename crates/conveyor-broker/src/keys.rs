//! Key layout shared by broker and store.

const PREFIX: &str = "conveyor";

pub fn ready(queue: &str) -> String {
    format!("{}:queue:{}", PREFIX, queue)
}

pub fn in_flight(queue: &str, consumer: &str) -> String {
    format!("{}:queue:{}:in_flight:{}", PREFIX, queue, consumer)
}

pub fn consumers(queue: &str) -> String {
    format!("{}:queue:{}:consumers", PREFIX, queue)
}

pub fn delayed(queue: &str) -> String {
    format!("{}:queue:{}:delayed", PREFIX, queue)
}

pub fn dead(queue: &str) -> String {
    format!("{}:queue:{}:dead", PREFIX, queue)
}

pub fn task(id: &str) -> String {
    format!("{}:task:{}", PREFIX, id)
}

pub fn worker(id: &str) -> String {
    format!("{}:worker:{}", PREFIX, id)
}

pub fn workers() -> String {
    format!("{}:workers", PREFIX)
}

pub fn cache(key: &str) -> String {
    format!("{}:cache:{}", PREFIX, key)
}

pub fn beat_last_fired() -> String {
    format!("{}:beat:last_fired", PREFIX)
}
