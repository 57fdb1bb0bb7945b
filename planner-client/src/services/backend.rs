//! Typed facade over the planner's remote procedures.

use std::sync::Arc;

use async_trait::async_trait;
use client_core::error::RpcError;
use client_core::grpc::{
    BatchStream, ConnectionManager, GenerationStream, RetryExecutor, RetryPolicy, StreamingLoader,
};

use crate::models::services::{
    ACCOUNT_SERVICE, AGENDA_SERVICE, EVENT_SERVICE, EXPENSE_SERVICE, GUEST_SERVICE,
    INVITATION_SERVICE, TASK_SERVICE,
};
use crate::models::{
    AcceptInvitationRequest, AcceptInvitationResponse, AgendaItem, DeleteGuestsRequest, Empty,
    Event, EventBatch, Expense, GenerateAgendaRequest, GenerateAgendaUpdate, GetEventRequest,
    Guest, ListAgendaResponse, ListByEventRequest, ListEventsRequest, ListEventsResponse,
    ListExpensesResponse, ListGuestsResponse, ListTasksResponse, MigrateAccountRequest,
    MigrateAccountResponse, RegisterDeviceRequest, StreamEventsRequest, Task, UpsertTaskRequest,
    UpsertTaskResponse, UserProfile,
};

/// Everything the stores and the session need from the backend.
#[async_trait]
pub trait PlannerBackend: Send + Sync {
    async fn list_events(&self, owner_id: &str) -> Result<Vec<Event>, RpcError>;

    /// Home feed as a sequence of small batches.
    async fn stream_events(&self, owner_id: &str, batch_size: u32) -> Result<BatchStream<Event>, RpcError>;

    async fn get_event(&self, event_id: &str) -> Result<Event, RpcError>;

    async fn list_guests(&self, event_id: &str) -> Result<Vec<Guest>, RpcError>;

    async fn list_tasks(&self, event_id: &str) -> Result<Vec<Task>, RpcError>;

    async fn list_agenda(&self, event_id: &str) -> Result<Vec<AgendaItem>, RpcError>;

    async fn list_expenses(&self, event_id: &str) -> Result<Vec<Expense>, RpcError>;

    async fn delete_guests(&self, event_id: &str, guest_ids: &[String]) -> Result<(), RpcError>;

    /// Create or update a task; the returned task carries the server id.
    async fn upsert_task(&self, task: Task) -> Result<Task, RpcError>;

    /// Redeem a one-time invitation secret. Never retried.
    async fn accept_invitation(&self, secret: &str) -> Result<Event, RpcError>;

    async fn generate_agenda(
        &self,
        event_id: &str,
        prompt: &str,
    ) -> Result<GenerationStream<AgendaItem>, RpcError>;

    /// Run the account migration, returning the version now in effect.
    async fn migrate_account(&self, from_version: u32) -> Result<u32, RpcError>;

    async fn fetch_profile(&self) -> Result<UserProfile, RpcError>;

    async fn register_device(&self, device_token: &str, platform: &str) -> Result<(), RpcError>;
}

/// `PlannerBackend` over gRPC, with every read and idempotent write run
/// through the retry executor.
pub struct GrpcPlannerBackend {
    connection: Arc<ConnectionManager>,
    retry: Arc<RetryExecutor>,
    streaming: StreamingLoader,
    policy: RetryPolicy,
}

impl GrpcPlannerBackend {
    pub fn new(
        connection: Arc<ConnectionManager>,
        retry: Arc<RetryExecutor>,
        streaming: StreamingLoader,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            connection,
            retry,
            streaming,
            policy,
        }
    }

    async fn unary<Req, Resp>(
        &self,
        policy: &RetryPolicy,
        service: &'static str,
        method: &'static str,
        request: Req,
    ) -> Result<Resp, RpcError>
    where
        Req: prost::Message + Clone + Send + Sync + 'static,
        Resp: prost::Message + Default + 'static,
    {
        self.retry
            .execute(policy, method, || {
                self.connection.call(service, method, request.clone())
            })
            .await
    }
}

#[async_trait]
impl PlannerBackend for GrpcPlannerBackend {
    async fn list_events(&self, owner_id: &str) -> Result<Vec<Event>, RpcError> {
        let request = ListEventsRequest {
            owner_id: owner_id.to_string(),
        };
        let response: ListEventsResponse = self
            .unary(&self.policy, EVENT_SERVICE, "ListEvents", request)
            .await?;
        Ok(response.events)
    }

    async fn stream_events(&self, owner_id: &str, batch_size: u32) -> Result<BatchStream<Event>, RpcError> {
        let request = StreamEventsRequest {
            owner_id: owner_id.to_string(),
            batch_size,
        };
        self.retry
            .execute(&self.policy, "StreamEvents", || {
                self.streaming.stream_batches::<_, EventBatch>(
                    EVENT_SERVICE,
                    "StreamEvents",
                    request.clone(),
                )
            })
            .await
    }

    async fn get_event(&self, event_id: &str) -> Result<Event, RpcError> {
        let request = GetEventRequest {
            event_id: event_id.to_string(),
        };
        self.unary(&self.policy, EVENT_SERVICE, "GetEvent", request)
            .await
    }

    async fn list_guests(&self, event_id: &str) -> Result<Vec<Guest>, RpcError> {
        let request = ListByEventRequest {
            event_id: event_id.to_string(),
        };
        let response: ListGuestsResponse = self
            .unary(&self.policy, GUEST_SERVICE, "ListGuests", request)
            .await?;
        Ok(response.guests)
    }

    async fn list_tasks(&self, event_id: &str) -> Result<Vec<Task>, RpcError> {
        let request = ListByEventRequest {
            event_id: event_id.to_string(),
        };
        let response: ListTasksResponse = self
            .unary(&self.policy, TASK_SERVICE, "ListTasks", request)
            .await?;
        Ok(response.tasks)
    }

    async fn list_agenda(&self, event_id: &str) -> Result<Vec<AgendaItem>, RpcError> {
        let request = ListByEventRequest {
            event_id: event_id.to_string(),
        };
        let response: ListAgendaResponse = self
            .unary(&self.policy, AGENDA_SERVICE, "ListAgenda", request)
            .await?;
        Ok(response.items)
    }

    async fn list_expenses(&self, event_id: &str) -> Result<Vec<Expense>, RpcError> {
        let request = ListByEventRequest {
            event_id: event_id.to_string(),
        };
        let response: ListExpensesResponse = self
            .unary(&self.policy, EXPENSE_SERVICE, "ListExpenses", request)
            .await?;
        Ok(response.expenses)
    }

    async fn delete_guests(&self, event_id: &str, guest_ids: &[String]) -> Result<(), RpcError> {
        let request = DeleteGuestsRequest {
            event_id: event_id.to_string(),
            guest_ids: guest_ids.to_vec(),
        };
        let _: Empty = self
            .unary(&self.policy, GUEST_SERVICE, "DeleteGuests", request)
            .await?;
        Ok(())
    }

    async fn upsert_task(&self, task: Task) -> Result<Task, RpcError> {
        let request = UpsertTaskRequest { task: Some(task) };
        let response: UpsertTaskResponse = self
            .unary(&self.policy, TASK_SERVICE, "UpsertTask", request)
            .await?;
        response.task.ok_or(RpcError::NoResultsProduced)
    }

    async fn accept_invitation(&self, secret: &str) -> Result<Event, RpcError> {
        let request = AcceptInvitationRequest {
            secret: secret.to_string(),
        };
        let response: AcceptInvitationResponse = self
            .unary(&RetryPolicy::none(), INVITATION_SERVICE, "AcceptInvitation", request)
            .await?;
        response.event.ok_or(RpcError::NoResultsProduced)
    }

    async fn generate_agenda(
        &self,
        event_id: &str,
        prompt: &str,
    ) -> Result<GenerationStream<AgendaItem>, RpcError> {
        let request = GenerateAgendaRequest {
            event_id: event_id.to_string(),
            prompt: prompt.to_string(),
        };
        // Only opening the stream is retried; a generation in progress is not restartable.
        self.retry
            .execute(&RetryPolicy::quick(), "GenerateAgenda", || {
                self.streaming.stream_generation::<_, GenerateAgendaUpdate>(
                    AGENDA_SERVICE,
                    "GenerateAgenda",
                    request.clone(),
                )
            })
            .await
    }

    /// Migrations can rewrite a whole account, so they run under the
    /// long-operation deadline.
    async fn migrate_account(&self, from_version: u32) -> Result<u32, RpcError> {
        let timeout = self
            .connection
            .long_operation_timeout()
            .ok_or(RpcError::NotConnected)?;
        let request = MigrateAccountRequest { from_version };
        let response: MigrateAccountResponse = self
            .retry
            .execute(&self.policy, "MigrateAccount", || {
                self.connection.call_with_timeout(
                    ACCOUNT_SERVICE,
                    "MigrateAccount",
                    request.clone(),
                    timeout,
                )
            })
            .await?;
        Ok(response.version)
    }

    async fn fetch_profile(&self) -> Result<UserProfile, RpcError> {
        self.unary(&self.policy, ACCOUNT_SERVICE, "GetProfile", Empty {})
            .await
    }

    /// Runs in the background after login, so it retries harder than reads.
    async fn register_device(&self, device_token: &str, platform: &str) -> Result<(), RpcError> {
        let request = RegisterDeviceRequest {
            device_token: device_token.to_string(),
            platform: platform.to_string(),
        };
        let _: Empty = self
            .unary(&RetryPolicy::aggressive(), ACCOUNT_SERVICE, "RegisterDevice", request)
            .await?;
        Ok(())
    }
}
