//! Push-driven cache invalidation.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::store::{DataStores, EntityKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Upsert,
    Remove,
    BulkRefresh,
    /// The user lost access to the parent: purge instead of refresh.
    RemoveParent,
}

/// A push notice naming what changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidationEvent {
    pub kind: EntityKind,
    pub parent_id: String,
    pub change: ChangeKind,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PayloadError {
    #[error("Missing field: {0}")]
    MissingField(&'static str),

    #[error("Unknown invalidation type: {0}")]
    UnknownType(String),
}

impl InvalidationEvent {
    pub fn new(kind: EntityKind, parent_id: impl Into<String>, change: ChangeKind) -> Self {
        Self {
            kind,
            parent_id: parent_id.into(),
            change,
        }
    }

    /// Parse a push payload of the form `{type, parentId}`.
    pub fn from_payload(payload: &HashMap<String, String>) -> Result<Self, PayloadError> {
        let kind_name = payload
            .get("type")
            .ok_or(PayloadError::MissingField("type"))?;
        let parent_id = payload
            .get("parentId")
            .or_else(|| payload.get("parent_id"))
            .filter(|id| !id.is_empty())
            .ok_or(PayloadError::MissingField("parentId"))?;

        let (kind, change) = match kind_name.as_str() {
            "event_updated" => (EntityKind::Event, ChangeKind::Upsert),
            "guest_updated" => (EntityKind::Guest, ChangeKind::Upsert),
            "task_updated" => (EntityKind::Task, ChangeKind::Upsert),
            "agenda_updated" => (EntityKind::Agenda, ChangeKind::Upsert),
            "expense_updated" => (EntityKind::Expense, ChangeKind::Upsert),
            "guest_removed" => (EntityKind::Guest, ChangeKind::Remove),
            "task_removed" => (EntityKind::Task, ChangeKind::Remove),
            "agenda_removed" => (EntityKind::Agenda, ChangeKind::Remove),
            "expense_removed" => (EntityKind::Expense, ChangeKind::Remove),
            "bulk_refresh" => (EntityKind::Event, ChangeKind::BulkRefresh),
            "event_removed" | "cohost_removed" => (EntityKind::Event, ChangeKind::RemoveParent),
            other => return Err(PayloadError::UnknownType(other.to_string())),
        };

        Ok(Self::new(kind, parent_id.clone(), change))
    }
}

/// Applies invalidation events to the stores.
pub struct InvalidationListener {
    stores: Arc<DataStores>,
}

impl InvalidationListener {
    pub fn new(stores: Arc<DataStores>) -> Self {
        Self { stores }
    }

    pub async fn handle(&self, event: InvalidationEvent) {
        tracing::debug!(
            kind = %event.kind,
            parent_id = %event.parent_id,
            change = ?event.change,
            "Invalidation received"
        );

        match event.change {
            ChangeKind::RemoveParent => self.stores.purge_event(&event.parent_id),
            ChangeKind::BulkRefresh => {
                self.stores.refresh_event_tree(&event.parent_id).await;
            }
            ChangeKind::Upsert | ChangeKind::Remove => {
                self.stores.refresh(event.kind, &event.parent_id).await;
            }
        }
    }

    /// Parse and apply a raw push payload. Unrecognised payloads are logged
    /// and dropped.
    pub async fn handle_payload(&self, payload: &HashMap<String, String>) -> Result<(), PayloadError> {
        match InvalidationEvent::from_payload(payload) {
            Ok(event) => {
                self.handle(event).await;
                Ok(())
            }
            Err(err) => {
                tracing::warn!(error = %err, "Ignoring invalidation payload");
                Err(err)
            }
        }
    }

    /// Consume events until the channel closes or `shutdown` fires. Each event
    /// is handled on its own task; on channel close the loop waits for those
    /// tasks, on shutdown it aborts them.
    pub async fn run(self: Arc<Self>, mut rx: mpsc::Receiver<InvalidationEvent>, shutdown: CancellationToken) {
        let mut tasks = JoinSet::new();
        tracing::info!("Invalidation listener started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!(pending = tasks.len(), "Invalidation listener shutting down");
                    tasks.abort_all();
                    return;
                }
                Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
                event = rx.recv() => {
                    match event {
                        Some(event) => {
                            let listener = self.clone();
                            tasks.spawn(async move { listener.handle(event).await });
                        }
                        None => break,
                    }
                }
            }
        }

        while tasks.join_next().await.is_some() {}
        tracing::info!("Invalidation channel closed");
    }
}
