//! Domain entities held in the client caches.

use chrono::{DateTime, Utc};

/// A planned event; the parent of guests, tasks, agenda items and expenses.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Event {
    #[prost(string, tag = "1")]
    pub id: String,
    /// User who created the event.
    #[prost(string, tag = "2")]
    pub owner_id: String,
    #[prost(string, tag = "3")]
    pub title: String,
    #[prost(string, tag = "4")]
    pub location: String,
    /// Start time in unix milliseconds.
    #[prost(int64, tag = "5")]
    pub starts_at: i64,
    /// Users the event is shared with.
    #[prost(string, repeated, tag = "6")]
    pub cohost_ids: Vec<String>,
}

impl Event {
    pub fn starts_at_utc(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.starts_at)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum RsvpStatus {
    Unspecified = 0,
    Pending = 1,
    Accepted = 2,
    Declined = 3,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Guest {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(string, tag = "2")]
    pub event_id: String,
    #[prost(string, tag = "3")]
    pub name: String,
    #[prost(string, tag = "4")]
    pub email: String,
    #[prost(enumeration = "RsvpStatus", tag = "5")]
    pub rsvp: i32,
    #[prost(uint32, tag = "6")]
    pub plus_ones: u32,
}

impl Guest {
    /// Head count including plus-ones, zero unless accepted.
    pub fn attending_count(&self) -> u32 {
        match RsvpStatus::try_from(self.rsvp) {
            Ok(RsvpStatus::Accepted) => 1 + self.plus_ones,
            _ => 0,
        }
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Task {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(string, tag = "2")]
    pub event_id: String,
    #[prost(string, tag = "3")]
    pub title: String,
    #[prost(bool, tag = "4")]
    pub done: bool,
    /// Due date in unix milliseconds, zero when unset.
    #[prost(int64, tag = "5")]
    pub due_at: i64,
    #[prost(string, tag = "6")]
    pub assignee_id: String,
}

impl Task {
    pub fn due_at_utc(&self) -> Option<DateTime<Utc>> {
        if self.due_at == 0 {
            return None;
        }
        DateTime::from_timestamp_millis(self.due_at)
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AgendaItem {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(string, tag = "2")]
    pub event_id: String,
    #[prost(string, tag = "3")]
    pub title: String,
    #[prost(int64, tag = "4")]
    pub starts_at: i64,
    #[prost(int64, tag = "5")]
    pub ends_at: i64,
    #[prost(string, tag = "6")]
    pub notes: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Expense {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(string, tag = "2")]
    pub event_id: String,
    #[prost(string, tag = "3")]
    pub description: String,
    /// Amount in minor currency units.
    #[prost(int64, tag = "4")]
    pub amount_cents: i64,
    /// ISO 4217 code.
    #[prost(string, tag = "5")]
    pub currency: String,
    #[prost(string, tag = "6")]
    pub category: String,
}

/// The authenticated user's server-side profile.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UserProfile {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(string, tag = "2")]
    pub display_name: String,
    #[prost(string, tag = "3")]
    pub email: String,
}
