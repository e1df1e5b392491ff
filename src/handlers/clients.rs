use super::common::{created_response, no_content_response, success_response};
use crate::{
    auth::AuthUser,
    errors::ServiceError,
    services::clients::{ClientResponse, CreateClientRequest, UpdateClientRequest},
    AppState,
};
use axum::{
    extract::{Json, Path, State},
    response::IntoResponse,
    routing::get,
    Router,
};

async fn list_clients(
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<impl IntoResponse, ServiceError> {
    let clients: Vec<ClientResponse> = state
        .services
        .clients
        .list(user.user_id)
        .await?
        .into_iter()
        .map(Into::into)
        .collect();
    Ok(success_response(clients))
}

async fn create_client(
    State(state): State<AppState>,
    user: AuthUser,
    Json(payload): Json<CreateClientRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let client = state.services.clients.create(user.user_id, payload).await?;
    Ok(created_response(ClientResponse::from(client)))
}

async fn get_client(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<i32>,
) -> Result<impl IntoResponse, ServiceError> {
    let client = state.services.clients.get(user.user_id, id).await?;
    Ok(success_response(ClientResponse::from(client)))
}

async fn update_client(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<i32>,
    Json(payload): Json<UpdateClientRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let client = state
        .services
        .clients
        .update(user.user_id, id, payload)
        .await?;
    Ok(success_response(ClientResponse::from(client)))
}

async fn delete_client(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<i32>,
) -> Result<impl IntoResponse, ServiceError> {
    state.services.clients.delete(user.user_id, id).await?;
    Ok(no_content_response())
}

pub fn client_routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_clients).post(create_client))
        .route(
            "/:id",
            get(get_client).put(update_client).delete(delete_client),
        )
}
