//! Entity caches for the planner and the operations that span them.

pub mod entity;

pub use entity::{Entity, EntityKind, EntityStore, Fetcher, LoadOutcome, Publisher, SharedLoad};

use std::sync::{Arc, RwLock};

use client_core::error::RpcError;
use client_core::grpc::collect_generation;
use futures::{FutureExt, StreamExt};
use tokio::sync::mpsc;

use crate::models::{AgendaItem, Event, Expense, Guest, Task};
use crate::services::PlannerBackend;

/// Events per batch when streaming the home feed.
pub const FEED_BATCH_SIZE: u32 = 2;

/// The five entity stores. Events are keyed by owner id (the home feed);
/// guests, tasks, agenda items and expenses by event id.
pub struct DataStores {
    backend: Arc<dyn PlannerBackend>,
    pub events: EntityStore<Event>,
    pub guests: EntityStore<Guest>,
    pub tasks: EntityStore<Task>,
    pub agenda: EntityStore<AgendaItem>,
    pub expenses: EntityStore<Expense>,
    feed_owner: RwLock<Option<String>>,
}

impl DataStores {
    pub fn new(backend: Arc<dyn PlannerBackend>) -> Self {
        let b = backend.clone();
        let events = EntityStore::new(EntityKind::Event, move |owner_id: String| {
            let b = b.clone();
            async move { b.list_events(&owner_id).await }
        });
        let b = backend.clone();
        let guests = EntityStore::new(EntityKind::Guest, move |event_id: String| {
            let b = b.clone();
            async move { b.list_guests(&event_id).await }
        });
        let b = backend.clone();
        let tasks = EntityStore::new(EntityKind::Task, move |event_id: String| {
            let b = b.clone();
            async move { b.list_tasks(&event_id).await }
        });
        let b = backend.clone();
        let agenda = EntityStore::new(EntityKind::Agenda, move |event_id: String| {
            let b = b.clone();
            async move { b.list_agenda(&event_id).await }
        });
        let b = backend.clone();
        let expenses = EntityStore::new(EntityKind::Expense, move |event_id: String| {
            let b = b.clone();
            async move { b.list_expenses(&event_id).await }
        });

        Self {
            backend,
            events,
            guests,
            tasks,
            agenda,
            expenses,
            feed_owner: RwLock::new(None),
        }
    }

    /// Set the user whose events make up the home feed; `None` on logout.
    pub fn set_feed_owner(&self, owner_id: Option<String>) {
        *self.feed_owner.write().unwrap_or_else(|e| e.into_inner()) = owner_id;
    }

    pub fn feed_owner(&self) -> Option<String> {
        self.feed_owner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Events in the signed-in user's feed.
    pub fn feed(&self) -> Vec<Event> {
        self.feed_owner()
            .map(|owner| self.events.get(&owner))
            .unwrap_or_default()
    }

    pub fn find_event(&self, event_id: &str) -> Option<Event> {
        self.events
            .parent_ids()
            .iter()
            .find_map(|owner| self.events.find(owner, event_id))
    }

    pub async fn load_feed(&self) -> LoadOutcome {
        match self.feed_owner() {
            Some(owner) => self.events.load(&owner).await,
            None => LoadOutcome::Failed(RpcError::AuthFailure("no signed-in user".to_string())),
        }
    }

    /// Load the feed in small batches, publishing after every batch so the
    /// first events are visible before the rest arrive. Falls back to a
    /// full fetch if the stream cannot be opened or breaks mid-way.
    ///
    /// Runs as the feed's single in-flight load: a concurrent caller joins it
    /// (and sees no batches of its own), and `clear` stops it.
    pub async fn load_feed_progressive<F>(&self, mut on_batch: F) -> LoadOutcome
    where
        F: FnMut(&[Event]),
    {
        let Some(owner) = self.feed_owner() else {
            return LoadOutcome::Failed(RpcError::AuthFailure("no signed-in user".to_string()));
        };

        let (batch_tx, mut batch_rx) = mpsc::unbounded_channel();
        let backend = self.backend.clone();
        let mut load = self.events.load_with(&owner, move |publisher| {
            stream_feed(backend, publisher, batch_tx).boxed()
        });

        loop {
            tokio::select! {
                biased;
                Some(snapshot) = batch_rx.recv() => on_batch(&snapshot),
                outcome = &mut load => {
                    while let Ok(snapshot) = batch_rx.try_recv() {
                        on_batch(&snapshot);
                    }
                    return outcome;
                }
            }
        }
    }

    /// Load one child collection of an event, purging the event if it turns
    /// out to be gone.
    pub async fn load_children(&self, kind: EntityKind, event_id: &str) -> LoadOutcome {
        let outcome = match kind {
            EntityKind::Event => return self.refresh_event(event_id).await,
            EntityKind::Guest => self.guests.load(event_id).await,
            EntityKind::Task => self.tasks.load(event_id).await,
            EntityKind::Agenda => self.agenda.load(event_id).await,
            EntityKind::Expense => self.expenses.load(event_id).await,
        };
        self.react(event_id, outcome)
    }

    /// Revalidate one kind for one parent. For `Event` the parent id is the
    /// event id and the record itself is refetched.
    pub async fn refresh(&self, kind: EntityKind, parent_id: &str) -> LoadOutcome {
        let outcome = match kind {
            EntityKind::Event => return self.refresh_event(parent_id).await,
            EntityKind::Guest => self.guests.refresh(parent_id).await,
            EntityKind::Task => self.tasks.refresh(parent_id).await,
            EntityKind::Agenda => self.agenda.refresh(parent_id).await,
            EntityKind::Expense => self.expenses.refresh(parent_id).await,
        };
        self.react(parent_id, outcome)
    }

    /// Refetch the event record and write it into every feed holding it.
    pub async fn refresh_event(&self, event_id: &str) -> LoadOutcome {
        match self.backend.get_event(event_id).await {
            Ok(event) => {
                if !self.events.update_everywhere(&event) {
                    if let Some(owner) = self.feed_owner() {
                        self.events.upsert_local(event, &owner);
                    }
                }
                LoadOutcome::Loaded(1)
            }
            Err(err) if err.is_access_lost() => {
                self.purge_event(event_id);
                LoadOutcome::AccessLost(err)
            }
            Err(err) => {
                tracing::warn!(event_id, error = %err, "Event refresh failed, keeping cached record");
                LoadOutcome::Failed(err)
            }
        }
    }

    /// Refresh the event and all four child collections. Stops early if the
    /// event turns out to be gone.
    pub async fn refresh_event_tree(&self, event_id: &str) -> LoadOutcome {
        let outcome = self.refresh_event(event_id).await;
        if outcome.is_access_lost() {
            return outcome;
        }

        let (guests, tasks, agenda, expenses) = tokio::join!(
            self.guests.refresh(event_id),
            self.tasks.refresh(event_id),
            self.agenda.refresh(event_id),
            self.expenses.refresh(event_id),
        );
        for child in [guests, tasks, agenda, expenses] {
            if child.is_access_lost() {
                return self.react(event_id, child);
            }
        }
        outcome
    }

    /// Remove the event from every feed along with all of its children.
    pub fn purge_event(&self, event_id: &str) {
        self.events.remove_everywhere(event_id);
        self.guests.clear(event_id);
        self.tasks.clear(event_id);
        self.agenda.clear(event_id);
        self.expenses.clear(event_id);
        tracing::info!(event_id, "Event purged from all stores");
    }

    pub fn clear_all(&self) {
        self.events.clear_all();
        self.guests.clear_all();
        self.tasks.clear_all();
        self.agenda.clear_all();
        self.expenses.clear_all();
        tracing::info!("All stores cleared");
    }

    /// Remove guests locally, then on the server. On failure the guest list
    /// is reloaded so the cache matches the server again.
    pub async fn delete_guests(&self, event_id: &str, guest_ids: Vec<String>) -> Result<(), RpcError> {
        self.guests.remove_many_local(&guest_ids, event_id);
        match self.backend.delete_guests(event_id, &guest_ids).await {
            Ok(()) => Ok(()),
            Err(err) => {
                tracing::warn!(event_id, error = %err, "Guest delete failed, reloading guests");
                self.refresh(EntityKind::Guest, event_id).await;
                Err(err)
            }
        }
    }

    /// Show the task immediately, then swap in the saved copy.
    pub async fn save_task(&self, task: Task) -> Result<Task, RpcError> {
        let event_id = task.event_id.clone();
        let local_id = task.id.clone();
        self.tasks.upsert_local(task.clone(), &event_id);

        match self.backend.upsert_task(task).await {
            Ok(saved) => {
                self.tasks.replace_local(&local_id, saved.clone(), &event_id);
                Ok(saved)
            }
            Err(err) => {
                tracing::warn!(event_id = %event_id, error = %err, "Task save failed, reloading tasks");
                self.refresh(EntityKind::Task, &event_id).await;
                Err(err)
            }
        }
    }

    /// Redeem an invitation and add the shared event to the feed.
    pub async fn accept_invitation(&self, secret: &str) -> Result<Event, RpcError> {
        let event = self.backend.accept_invitation(secret).await?;
        if let Some(owner) = self.feed_owner() {
            self.events.upsert_local(event.clone(), &owner);
        }
        tracing::info!(event_id = %event.id, "Invitation accepted");
        Ok(event)
    }

    /// Generate agenda items for an event and add them to its agenda.
    pub async fn generate_agenda<F>(
        &self,
        event_id: &str,
        prompt: &str,
        on_progress: F,
    ) -> Result<Vec<AgendaItem>, RpcError>
    where
        F: FnMut(f32, &str),
    {
        let stream = self.backend.generate_agenda(event_id, prompt).await?;
        let items = collect_generation(stream, on_progress).await?;
        for item in items.iter().rev() {
            self.agenda.upsert_local(item.clone(), event_id);
        }
        tracing::info!(event_id, generated = items.len(), "Agenda generated");
        Ok(items)
    }

    fn react(&self, event_id: &str, outcome: LoadOutcome) -> LoadOutcome {
        if outcome.is_access_lost() {
            self.purge_event(event_id);
        }
        outcome
    }
}

/// Streamed feed fetch: publishes the accumulated events after every batch
/// and forwards each snapshot to `batches`.
async fn stream_feed(
    backend: Arc<dyn PlannerBackend>,
    publisher: Publisher<Event>,
    batches: mpsc::UnboundedSender<Vec<Event>>,
) -> Result<Vec<Event>, RpcError> {
    let owner = publisher.parent_id().to_string();
    let mut stream = match backend.stream_events(&owner, FEED_BATCH_SIZE).await {
        Ok(stream) => stream,
        Err(err) => {
            tracing::warn!(error = %err, "Feed stream unavailable, falling back to full fetch");
            return backend.list_events(&owner).await;
        }
    };

    let mut received: Vec<Event> = Vec::new();
    while let Some(batch) = stream.next().await {
        match batch {
            Ok(batch) => {
                received.extend(batch.items);
                if !publisher.publish(received.clone()) {
                    tracing::debug!(owner_id = %owner, "Feed cleared while streaming, stopping");
                    return Err(RpcError::Cancelled);
                }
                let _ = batches.send(received.clone());
            }
            Err(err) => {
                tracing::warn!(
                    error = %err,
                    received = received.len(),
                    "Feed stream failed, falling back to full fetch"
                );
                return backend.list_events(&owner).await;
            }
        }
    }

    tracing::debug!(owner_id = %owner, len = received.len(), "Feed streamed");
    Ok(received)
}
