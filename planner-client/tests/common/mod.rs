//! Test helpers for planner-client integration tests.
//!
//! `MockBackend` serves canned collections and errors, counts calls per
//! method and can hold a fetch open on a `Notify` gate.

#![allow(dead_code)]

use async_trait::async_trait;
use client_core::error::RpcError;
use client_core::grpc::{Batch, BatchStream, Code, GenerationStream, GenerationUpdate};
use futures::{StreamExt, stream};
use planner_client::models::{AgendaItem, Event, Expense, Guest, Task, UserProfile};
use planner_client::services::PlannerBackend;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

#[derive(Default)]
pub struct MockBackend {
    pub events: Mutex<Vec<Event>>,
    pub guests: Mutex<HashMap<String, Vec<Guest>>>,
    pub tasks: Mutex<HashMap<String, Vec<Task>>>,
    /// Errors returned instead of data, keyed by method name.
    pub errors: Mutex<HashMap<&'static str, RpcError>>,
    /// Batches served by `stream_events`; `None` makes the stream unavailable.
    pub feed_batches: Mutex<Option<Vec<Result<Batch<Event>, RpcError>>>>,
    pub agenda_updates: Mutex<Vec<GenerationUpdate<AgendaItem>>>,
    pub migrated_version: Mutex<u32>,
    /// When set, `list_guests` waits for a permit before answering.
    pub guest_gate: Mutex<Option<Arc<Notify>>>,
    /// When set, `stream_events` holds back everything after the first batch
    /// until a permit arrives.
    pub feed_gate: Mutex<Option<Arc<Notify>>>,
    calls: Mutex<Vec<&'static str>>,
}

impl MockBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_guests(self: &Arc<Self>, event_id: &str, guests: Vec<Guest>) -> Arc<Self> {
        self.guests.lock().unwrap().insert(event_id.to_string(), guests);
        self.clone()
    }

    pub fn with_tasks(self: &Arc<Self>, event_id: &str, tasks: Vec<Task>) -> Arc<Self> {
        self.tasks.lock().unwrap().insert(event_id.to_string(), tasks);
        self.clone()
    }

    pub fn with_events(self: &Arc<Self>, events: Vec<Event>) -> Arc<Self> {
        *self.events.lock().unwrap() = events;
        self.clone()
    }

    pub fn fail(&self, method: &'static str, err: RpcError) {
        self.errors.lock().unwrap().insert(method, err);
    }

    pub fn succeed(&self, method: &'static str) {
        self.errors.lock().unwrap().remove(method);
    }

    pub fn gate_guests(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.guest_gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    pub fn gate_feed(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.feed_gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    pub fn calls(&self, method: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|m| **m == method).count()
    }

    /// Every call in the order it was made.
    pub fn call_log(&self) -> Vec<&'static str> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, method: &'static str) -> Result<(), RpcError> {
        self.calls.lock().unwrap().push(method);
        match self.errors.lock().unwrap().get(method) {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}

pub fn event(id: &str, owner_id: &str) -> Event {
    Event {
        id: id.to_string(),
        owner_id: owner_id.to_string(),
        title: format!("Event {}", id),
        ..Default::default()
    }
}

pub fn guest(id: &str, event_id: &str) -> Guest {
    Guest {
        id: id.to_string(),
        event_id: event_id.to_string(),
        name: format!("Guest {}", id),
        ..Default::default()
    }
}

pub fn task(id: &str, event_id: &str) -> Task {
    Task {
        id: id.to_string(),
        event_id: event_id.to_string(),
        title: format!("Task {}", id),
        ..Default::default()
    }
}

pub fn agenda_item(id: &str, event_id: &str) -> AgendaItem {
    AgendaItem {
        id: id.to_string(),
        event_id: event_id.to_string(),
        ..Default::default()
    }
}

pub fn not_found() -> RpcError {
    RpcError::server(Code::NotFound, "event not found")
}

pub fn unavailable() -> RpcError {
    RpcError::Transport("connection reset".to_string())
}

pub fn ids<T, F>(items: &[T], id: F) -> Vec<String>
where
    F: Fn(&T) -> &str,
{
    items.iter().map(|i| id(i).to_string()).collect()
}

#[async_trait]
impl PlannerBackend for MockBackend {
    async fn list_events(&self, owner_id: &str) -> Result<Vec<Event>, RpcError> {
        self.record("list_events")?;
        Ok(self
            .events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.owner_id == owner_id)
            .cloned()
            .collect())
    }

    async fn stream_events(&self, _owner_id: &str, _batch_size: u32) -> Result<BatchStream<Event>, RpcError> {
        self.record("stream_events")?;
        let batches = self
            .feed_batches
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| RpcError::server(Code::Unimplemented, "streaming disabled"))?;
        let gate = self.feed_gate.lock().unwrap().clone();
        let source = match gate {
            None => stream::iter(batches).boxed(),
            Some(gate) => {
                let mut rest = batches;
                let first: Vec<_> = rest.drain(..rest.len().min(1)).collect();
                let held = stream::once(async move {
                    gate.notified().await;
                    stream::iter(rest)
                })
                .flatten();
                stream::iter(first).chain(held).boxed()
            }
        };
        Ok(BatchStream::batches(source, None))
    }

    async fn get_event(&self, event_id: &str) -> Result<Event, RpcError> {
        self.record("get_event")?;
        self.events
            .lock()
            .unwrap()
            .iter()
            .find(|e| e.id == event_id)
            .cloned()
            .ok_or_else(not_found)
    }

    async fn list_guests(&self, event_id: &str) -> Result<Vec<Guest>, RpcError> {
        let gate = self.guest_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        self.record("list_guests")?;
        Ok(self
            .guests
            .lock()
            .unwrap()
            .get(event_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn list_tasks(&self, event_id: &str) -> Result<Vec<Task>, RpcError> {
        self.record("list_tasks")?;
        Ok(self
            .tasks
            .lock()
            .unwrap()
            .get(event_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn list_agenda(&self, _event_id: &str) -> Result<Vec<AgendaItem>, RpcError> {
        self.record("list_agenda")?;
        Ok(Vec::new())
    }

    async fn list_expenses(&self, _event_id: &str) -> Result<Vec<Expense>, RpcError> {
        self.record("list_expenses")?;
        Ok(Vec::new())
    }

    async fn delete_guests(&self, event_id: &str, guest_ids: &[String]) -> Result<(), RpcError> {
        self.record("delete_guests")?;
        if let Some(guests) = self.guests.lock().unwrap().get_mut(event_id) {
            guests.retain(|g| !guest_ids.contains(&g.id));
        }
        Ok(())
    }

    async fn upsert_task(&self, mut task: Task) -> Result<Task, RpcError> {
        self.record("upsert_task")?;
        if task.id.starts_with("local-") {
            task.id = task.id.replace("local-", "srv-");
        }
        self.tasks
            .lock()
            .unwrap()
            .entry(task.event_id.clone())
            .or_default()
            .insert(0, task.clone());
        Ok(task)
    }

    async fn accept_invitation(&self, secret: &str) -> Result<Event, RpcError> {
        self.record("accept_invitation")?;
        Ok(event(&format!("shared-{}", secret), "someone-else"))
    }

    async fn generate_agenda(
        &self,
        _event_id: &str,
        _prompt: &str,
    ) -> Result<GenerationStream<AgendaItem>, RpcError> {
        self.record("generate_agenda")?;
        let updates: Vec<Result<GenerationUpdate<AgendaItem>, RpcError>> = self
            .agenda_updates
            .lock()
            .unwrap()
            .iter()
            .cloned()
            .map(Ok)
            .collect();
        Ok(GenerationStream::generation(futures::stream::iter(updates), None))
    }

    async fn migrate_account(&self, _from_version: u32) -> Result<u32, RpcError> {
        self.record("migrate_account")?;
        Ok(*self.migrated_version.lock().unwrap())
    }

    async fn fetch_profile(&self) -> Result<UserProfile, RpcError> {
        self.record("fetch_profile")?;
        Ok(UserProfile {
            id: "u1".to_string(),
            display_name: "Uma".to_string(),
            email: "uma@example.com".to_string(),
        })
    }

    async fn register_device(&self, _device_token: &str, _platform: &str) -> Result<(), RpcError> {
        self.record("register_device")?;
        Ok(())
    }
}
