//! Common test utilities

#![allow(dead_code)]

use std::sync::Arc;

use serde_json::{json, Value};

use scrapefleet::config::Config;
use scrapefleet::coordination::MemoryCoordination;
use scrapefleet::coordinator::AppState;
use scrapefleet::models::{Task, TaskKind};
use scrapefleet::storage::{MemoryStore, StateStore};

/// In-memory coordinator wiring
pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub coordination: Arc<MemoryCoordination>,
    pub state: AppState,
}

pub fn harness() -> Harness {
    harness_with(Config::default())
}

pub fn harness_with(config: Config) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let coordination = Arc::new(MemoryCoordination::new());
    let state = AppState::new(&config, store.clone(), coordination.clone());
    Harness {
        store,
        coordination,
        state,
    }
}

/// A valid scraper record for video `id`
pub fn video(id: u64) -> Value {
    json!({
        "url": format!("https://www.tiktok.com/@creator/video/{id}"),
        "description": format!("clip {id} #fyp #remix with @friend"),
        "views": "1.2K",
        "likes": 100,
        "comments": 10,
        "shares": 5,
        "duration": "0:15",
        "upload_date": "2024-03-01"
    })
}

/// `valid` good records followed by `missing_url` records without a URL
pub fn batch(valid: u64, missing_url: usize) -> Value {
    let mut records: Vec<Value> = (1..=valid).map(video).collect();
    for i in 0..missing_url {
        records.push(json!({ "description": format!("orphan {i}"), "views": 3 }));
    }
    Value::Array(records)
}

/// Insert a PENDING profile task
pub async fn pending_task(store: &MemoryStore, handle: &str) -> Task {
    let task = Task::new(format!("https://www.tiktok.com/@{handle}"), TaskKind::Profile);
    store.create_task(&task).await.expect("create task");
    task
}
