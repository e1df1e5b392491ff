use axum::{response::IntoResponse, routing::get, Json, Router};
use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Farm Service API",
        version = "0.1.0",
        description = r#"
# Farm Service API

Back office for agricultural service providers: clients, machines, machine-hour
tasks and the billing archive.

## Authentication

Every `/api/v1` endpoint requires a session token obtained from `POST /auth/login`,
sent either as `Authorization: Bearer <token>` or through the `token` cookie.

## Form rejections

Task create and edit reject recoverable input with `422` and a body that carries
the form context (clients, machines, and the task being edited) next to the message.
        "#
    ),
    servers(
        (url = "http://localhost:8080", description = "Local development")
    ),
    tags(
        (name = "Tasks", description = "Task lifecycle and machine ledger"),
        (name = "History", description = "Archived completed tasks")
    ),
    paths(
        // Tasks
        crate::handlers::tasks::list_tasks,
        crate::handlers::tasks::task_form,
        crate::handlers::tasks::create_task,
        crate::handlers::tasks::get_task,
        crate::handlers::tasks::update_task,
        crate::handlers::tasks::set_task_payment,
        crate::handlers::tasks::delete_task,
        crate::handlers::tasks::task_report,

        // History
        crate::handlers::history::list_history,
        crate::handlers::history::get_history,
        crate::handlers::history::set_history_payment,
        crate::handlers::history::history_report,
    ),
    components(
        schemas(
            crate::errors::ErrorResponse,
            crate::errors::FormErrorResponse,
            crate::services::clients::CreateClientRequest,
            crate::services::clients::UpdateClientRequest,
            crate::services::machines::CreateMachineRequest,
            crate::services::machines::UpdateMachineRequest,
            crate::services::machines::MachineUsage,
            crate::services::users::RegisterRequest,
            crate::services::users::LoginRequest,
            crate::handlers::auth::SessionResponse,
            crate::health::HealthInfo,
        )
    )
)]
pub struct ApiDocV1;

async fn openapi_json() -> impl IntoResponse {
    Json(ApiDocV1::openapi())
}

/// Serves the generated document at `/api-docs/openapi.json`
pub fn openapi_routes<S>() -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    Router::new().route("/api-docs/openapi.json", get(openapi_json))
}
