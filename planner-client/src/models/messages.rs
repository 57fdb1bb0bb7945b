//! Request and response envelopes.

use client_core::grpc::{Batch, BatchPayload, GenerationPayload, GenerationUpdate};

use super::entities::{AgendaItem, Event, Expense, Guest, Task};

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Empty {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ListEventsRequest {
    #[prost(string, tag = "1")]
    pub owner_id: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ListEventsResponse {
    #[prost(message, repeated, tag = "1")]
    pub events: Vec<Event>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StreamEventsRequest {
    #[prost(string, tag = "1")]
    pub owner_id: String,
    #[prost(uint32, tag = "2")]
    pub batch_size: u32,
}

/// One page of the progressively loaded home feed.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct EventBatch {
    #[prost(message, repeated, tag = "1")]
    pub events: Vec<Event>,
    #[prost(bool, tag = "2")]
    pub is_last: bool,
}

impl BatchPayload for EventBatch {
    type Item = Event;

    fn into_batch(self) -> Batch<Event> {
        Batch {
            items: self.events,
            is_last: self.is_last,
        }
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetEventRequest {
    #[prost(string, tag = "1")]
    pub event_id: String,
}

/// Request addressing one event's child collection.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ListByEventRequest {
    #[prost(string, tag = "1")]
    pub event_id: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ListGuestsResponse {
    #[prost(message, repeated, tag = "1")]
    pub guests: Vec<Guest>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ListTasksResponse {
    #[prost(message, repeated, tag = "1")]
    pub tasks: Vec<Task>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ListAgendaResponse {
    #[prost(message, repeated, tag = "1")]
    pub items: Vec<AgendaItem>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ListExpensesResponse {
    #[prost(message, repeated, tag = "1")]
    pub expenses: Vec<Expense>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DeleteGuestsRequest {
    #[prost(string, tag = "1")]
    pub event_id: String,
    #[prost(string, repeated, tag = "2")]
    pub guest_ids: Vec<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UpsertTaskRequest {
    #[prost(message, optional, tag = "1")]
    pub task: Option<Task>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UpsertTaskResponse {
    #[prost(message, optional, tag = "1")]
    pub task: Option<Task>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AcceptInvitationRequest {
    /// One-time invitation secret; redeeming it twice fails.
    #[prost(string, tag = "1")]
    pub secret: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AcceptInvitationResponse {
    #[prost(message, optional, tag = "1")]
    pub event: Option<Event>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GenerateAgendaRequest {
    #[prost(string, tag = "1")]
    pub event_id: String,
    #[prost(string, tag = "2")]
    pub prompt: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GenerationProgress {
    #[prost(float, tag = "1")]
    pub fraction: f32,
    #[prost(string, tag = "2")]
    pub message: String,
}

/// Tagged payload of the agenda generation stream.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GenerateAgendaUpdate {
    #[prost(oneof = "generate_agenda_update::Payload", tags = "1, 2")]
    pub payload: Option<generate_agenda_update::Payload>,
}

pub mod generate_agenda_update {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Payload {
        #[prost(message, tag = "1")]
        Progress(super::GenerationProgress),
        #[prost(message, tag = "2")]
        Item(super::AgendaItem),
    }
}

impl GenerationPayload for GenerateAgendaUpdate {
    type Item = AgendaItem;

    fn into_update(self) -> Option<GenerationUpdate<AgendaItem>> {
        match self.payload? {
            generate_agenda_update::Payload::Progress(p) => Some(GenerationUpdate::Progress {
                fraction: p.fraction,
                message: p.message,
            }),
            generate_agenda_update::Payload::Item(item) => Some(GenerationUpdate::Result(item)),
        }
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MigrateAccountRequest {
    #[prost(uint32, tag = "1")]
    pub from_version: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MigrateAccountResponse {
    #[prost(uint32, tag = "1")]
    pub version: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RegisterDeviceRequest {
    #[prost(string, tag = "1")]
    pub device_token: String,
    #[prost(string, tag = "2")]
    pub platform: String,
}
