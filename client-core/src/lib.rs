//! client-core: Shared remote-data runtime for planner clients.
pub mod config;
pub mod error;
pub mod grpc;
pub mod observability;

pub use futures;
pub use prost;
pub use serde;
pub use tokio;
pub use tonic;
pub use tracing;
