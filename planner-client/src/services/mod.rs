pub mod auth;
pub mod backend;
pub mod entitlements;
pub mod preferences;

pub use auth::{AuthError, AuthTokenProvider, AuthUser, StaticTokenProvider};
pub use backend::{GrpcPlannerBackend, PlannerBackend};
pub use entitlements::{EntitlementProvider, EntitlementStatus, HttpEntitlementProvider};
pub use preferences::{KeyValueStore, MemoryKeyValueStore, Preferences};
