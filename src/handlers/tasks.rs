use super::common::{
    created_response, no_content_response, report_response, success_response, PaymentRequest,
    ReportQuery,
};
use crate::{
    auth::AuthUser,
    errors::ServiceError,
    services::{
        reports::BillingReport,
        tasks::{
            CreateTaskRequest, FormContext, TaskStatus, TaskUpdateOutcome, TaskView,
            UpdateTaskRequest,
        },
    },
    ApiResponse, AppState,
};
use axum::{
    extract::{Json, Path, Query, State},
    response::IntoResponse,
    routing::{get, put},
    Router,
};
use serde::Deserialize;
use utoipa::IntoParams;

#[derive(Debug, Default, Deserialize, IntoParams)]
pub struct TaskListQuery {
    /// `open` or `completed`; omit for all tasks
    pub status: Option<TaskStatus>,
}

#[utoipa::path(
    get,
    path = "/api/v1/tasks",
    params(TaskListQuery),
    responses(
        (status = 200, description = "Tasks of the caller, newest first", body = ApiResponse<Vec<TaskView>>),
        (status = 401, description = "Unauthorized", body = crate::errors::ErrorResponse),
    ),
    tag = "Tasks"
)]
pub async fn list_tasks(
    State(state): State<AppState>,
    user: AuthUser,
    Query(query): Query<TaskListQuery>,
) -> Result<impl IntoResponse, ServiceError> {
    let tasks = state.services.tasks.list(user.user_id, query.status).await?;
    Ok(success_response(tasks))
}

#[utoipa::path(
    get,
    path = "/api/v1/tasks/form",
    responses(
        (status = 200, description = "Client and machine options for a new task", body = ApiResponse<FormContext>),
    ),
    tag = "Tasks"
)]
pub async fn task_form(
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<impl IntoResponse, ServiceError> {
    let form = state.services.tasks.form_context(user.user_id, None).await?;
    Ok(success_response(form))
}

#[utoipa::path(
    post,
    path = "/api/v1/tasks",
    request_body = CreateTaskRequest,
    responses(
        (status = 201, description = "Task created with its machines attached", body = ApiResponse<TaskView>),
        (status = 422, description = "Form rejected; body carries the form context", body = crate::errors::FormErrorResponse),
    ),
    tag = "Tasks"
)]
pub async fn create_task(
    State(state): State<AppState>,
    user: AuthUser,
    Json(payload): Json<CreateTaskRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let task = state.services.tasks.create(user.user_id, payload).await?;
    Ok(created_response(task))
}

/// Task detail together with the option lists of the edit form.
#[utoipa::path(
    get,
    path = "/api/v1/tasks/{id}",
    params(("id" = i32, Path, description = "Task id")),
    responses(
        (status = 200, description = "Task with edit form options", body = ApiResponse<FormContext>),
        (status = 404, description = "Task not found", body = crate::errors::ErrorResponse),
    ),
    tag = "Tasks"
)]
pub async fn get_task(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<i32>,
) -> Result<impl IntoResponse, ServiceError> {
    let task = state.services.tasks.get(user.user_id, id).await?;
    let form = state
        .services
        .tasks
        .form_context(user.user_id, Some(task))
        .await?;
    Ok(success_response(form))
}

#[utoipa::path(
    put,
    path = "/api/v1/tasks/{id}",
    params(("id" = i32, Path, description = "Task id")),
    request_body = UpdateTaskRequest,
    responses(
        (status = 200, description = "Task updated; completed and archived once every line is finished", body = ApiResponse<TaskUpdateOutcome>),
        (status = 400, description = "Invalid end reading or task already completed", body = crate::errors::ErrorResponse),
        (status = 404, description = "Task or ledger line not found", body = crate::errors::ErrorResponse),
        (status = 422, description = "Form rejected", body = crate::errors::FormErrorResponse),
    ),
    tag = "Tasks"
)]
pub async fn update_task(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<i32>,
    Json(payload): Json<UpdateTaskRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let outcome = state.services.tasks.update(user.user_id, id, payload).await?;
    Ok(success_response(outcome))
}

#[utoipa::path(
    put,
    path = "/api/v1/tasks/{id}/payment",
    params(("id" = i32, Path, description = "Task id")),
    request_body = PaymentRequest,
    responses(
        (status = 200, description = "Payment flag set on the task and its snapshot", body = ApiResponse<TaskView>),
        (status = 404, description = "Task not found", body = crate::errors::ErrorResponse),
    ),
    tag = "Tasks"
)]
pub async fn set_task_payment(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<i32>,
    Json(payload): Json<PaymentRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let task = state
        .services
        .tasks
        .set_paid(user.user_id, id, payload.paid)
        .await?;
    Ok(success_response(task))
}

#[utoipa::path(
    delete,
    path = "/api/v1/tasks/{id}",
    params(("id" = i32, Path, description = "Task id")),
    responses(
        (status = 204, description = "Task and its ledger lines removed; history kept"),
        (status = 404, description = "Task not found", body = crate::errors::ErrorResponse),
    ),
    tag = "Tasks"
)]
pub async fn delete_task(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<i32>,
) -> Result<impl IntoResponse, ServiceError> {
    state.services.tasks.delete(user.user_id, id).await?;
    Ok(no_content_response())
}

#[utoipa::path(
    get,
    path = "/api/v1/tasks/{id}/report",
    params(("id" = i32, Path, description = "Task id"), ReportQuery),
    responses(
        (status = 200, description = "Billing report input", body = ApiResponse<BillingReport>),
        (status = 404, description = "Neither the task nor a snapshot exists", body = crate::errors::ErrorResponse),
        (status = 422, description = "Task has no machines or unfinished lines", body = crate::errors::ErrorResponse),
    ),
    tag = "Tasks"
)]
pub async fn task_report(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<i32>,
    Query(query): Query<ReportQuery>,
) -> Result<impl IntoResponse, ServiceError> {
    let report = state.services.reports.for_task(user.user_id, id).await?;
    Ok(report_response(report, &query))
}

pub fn task_routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_tasks).post(create_task))
        .route("/form", get(task_form))
        .route("/:id", get(get_task).put(update_task).delete(delete_task))
        .route("/:id/payment", put(set_task_payment))
        .route("/:id/report", get(task_report))
}
