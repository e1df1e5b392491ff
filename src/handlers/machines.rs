use super::common::{created_response, no_content_response, success_response};
use crate::{
    auth::AuthUser,
    errors::ServiceError,
    services::machines::{CreateMachineRequest, MachineResponse, UpdateMachineRequest},
    AppState,
};
use axum::{
    extract::{Json, Path, State},
    response::IntoResponse,
    routing::get,
    Router,
};

async fn list_machines(
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<impl IntoResponse, ServiceError> {
    let machines: Vec<MachineResponse> = state
        .services
        .machines
        .list(user.user_id)
        .await?
        .into_iter()
        .map(Into::into)
        .collect();
    Ok(success_response(machines))
}

async fn create_machine(
    State(state): State<AppState>,
    user: AuthUser,
    Json(payload): Json<CreateMachineRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let machine = state.services.machines.create(user.user_id, payload).await?;
    Ok(created_response(MachineResponse::from(machine)))
}

async fn get_machine(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<i32>,
) -> Result<impl IntoResponse, ServiceError> {
    let machine = state.services.machines.get(user.user_id, id).await?;
    Ok(success_response(MachineResponse::from(machine)))
}

async fn update_machine(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<i32>,
    Json(payload): Json<UpdateMachineRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let machine = state
        .services
        .machines
        .update(user.user_id, id, payload)
        .await?;
    Ok(success_response(MachineResponse::from(machine)))
}

/// Whether an unfinished task currently holds the machine
async fn machine_usage(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<i32>,
) -> Result<impl IntoResponse, ServiceError> {
    let usage = state.services.machines.usage(user.user_id, id).await?;
    Ok(success_response(usage))
}

async fn delete_machine(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<i32>,
) -> Result<impl IntoResponse, ServiceError> {
    state.services.machines.delete(user.user_id, id).await?;
    Ok(no_content_response())
}

pub fn machine_routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_machines).post(create_machine))
        .route(
            "/:id",
            get(get_machine).put(update_machine).delete(delete_machine),
        )
        .route("/:id/usage", get(machine_usage))
}
