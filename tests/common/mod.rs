//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use serde_json::{json, Value};
use snapstore::{
    Database, Entity, EntityCore, EventRecord, Identity, MemoryDatabase, Repository, Result,
};

/// Task entity moving through created -> initiated -> started -> ended.
#[derive(Debug, Default)]
pub struct Task {
    core: EntityCore,
    pub status: String,
    pub started_by: Option<String>,
    pub ended_by: Option<String>,
}

impl Task {
    pub fn new(id: impl Into<Identity>) -> Self {
        Self {
            core: EntityCore::with_id(id),
            status: "created".into(),
            ..Default::default()
        }
    }

    /// A task without any identity.
    pub fn anonymous() -> Self {
        Self {
            status: "created".into(),
            ..Default::default()
        }
    }

    pub fn init(mut self) -> Self {
        self.record("init", Value::Null).unwrap();
        self
    }

    pub fn start(mut self, agent: &str) -> Self {
        self.record("start", json!({ "agent": agent })).unwrap();
        self.emit("started", &[json!(agent)]);
        self
    }

    pub fn end(mut self, agent: &str) -> Self {
        self.record("end", json!({ "agent": agent })).unwrap();
        self.enqueue("ended", vec![json!(agent)]);
        self
    }
}

impl Entity for Task {
    fn core(&self) -> &EntityCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut EntityCore {
        &mut self.core
    }

    fn state(&self) -> Result<Value> {
        Ok(json!({
            "status": self.status,
            "started_by": self.started_by,
            "ended_by": self.ended_by,
        }))
    }

    fn restore_state(&mut self, state: &Value) -> Result<()> {
        self.status = state["status"].as_str().unwrap_or("created").to_string();
        self.started_by = state["started_by"].as_str().map(String::from);
        self.ended_by = state["ended_by"].as_str().map(String::from);
        Ok(())
    }

    fn apply(&mut self, event: &EventRecord) -> Result<()> {
        let agent = event.payload["agent"].as_str().map(String::from);
        match event.name.as_str() {
            "init" => self.status = "initiated".into(),
            "start" => {
                self.status = "started".into();
                self.started_by = agent;
            }
            "end" => {
                self.status = "ended".into();
                self.ended_by = agent;
            }
            _ => {}
        }
        Ok(())
    }
}

/// Repository over a fresh in-memory database, plus a handle to that database.
pub async fn task_repo() -> (Repository<Task>, Arc<MemoryDatabase>) {
    let db = Arc::new(MemoryDatabase::new());
    let repo = task_repo_on(db.clone() as Arc<dyn Database>).await;
    (repo, db)
}

pub async fn task_repo_on(db: Arc<dyn Database>) -> Repository<Task> {
    Repository::<Task>::builder()
        .factory(Task::new)
        .database(db)
        .open()
        .await
        .unwrap()
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}
