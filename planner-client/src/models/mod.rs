//! Wire messages exchanged with the planner backend.
//!
//! Declared directly with prost derives; field tags must match the server's
//! `planner.v1` protos.

pub mod entities;
pub mod messages;

pub use entities::{AgendaItem, Event, Expense, Guest, RsvpStatus, Task, UserProfile};
pub use messages::*;

/// Fully qualified gRPC service names.
pub mod services {
    pub const EVENT_SERVICE: &str = "planner.v1.EventService";
    pub const GUEST_SERVICE: &str = "planner.v1.GuestService";
    pub const TASK_SERVICE: &str = "planner.v1.TaskService";
    pub const AGENDA_SERVICE: &str = "planner.v1.AgendaService";
    pub const EXPENSE_SERVICE: &str = "planner.v1.ExpenseService";
    pub const INVITATION_SERVICE: &str = "planner.v1.InvitationService";
    pub const ACCOUNT_SERVICE: &str = "planner.v1.AccountService";
}
