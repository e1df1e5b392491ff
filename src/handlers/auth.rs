use super::common::{created_response, success_response};
use crate::{
    auth::{AuthUser, IssuedToken},
    errors::ServiceError,
    services::users::{LoginRequest, RegisterRequest, UserResponse},
    AppState,
};
use axum::{
    extract::{Json, State},
    http::{header, HeaderValue},
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::Serialize;
use tracing::info;
use utoipa::ToSchema;

/// Login response: the profile plus the token also set as a cookie
#[derive(Debug, Serialize, ToSchema)]
pub struct SessionResponse {
    pub user: UserResponse,
    #[serde(flatten)]
    pub token: IssuedToken,
}

fn cookie_header(value: String) -> Result<HeaderValue, ServiceError> {
    HeaderValue::from_str(&value)
        .map_err(|e| ServiceError::InternalError(format!("invalid cookie header: {}", e)))
}

/// Register handler
pub async fn register(
    State(state): State<AppState>,
    Json(payload): Json<RegisterRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let user = state.services.users.register(payload).await?;
    Ok(created_response(user))
}

/// Login handler
pub async fn login(
    State(state): State<AppState>,
    Json(payload): Json<LoginRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let user = state.services.users.login(payload).await?;
    let token = state.services.auth.generate_token(user.id)?;
    let cookie = cookie_header(state.services.auth.session_cookie(&token.access_token))?;

    let mut response = success_response(SessionResponse { user, token });
    response.headers_mut().insert(header::SET_COOKIE, cookie);
    Ok(response)
}

/// Logout handler: clears the session cookie
pub async fn logout(State(state): State<AppState>) -> Result<impl IntoResponse, ServiceError> {
    let cookie = cookie_header(state.services.auth.clear_cookie())?;

    let mut response = success_response(serde_json::json!({ "logged_out": true }));
    let headers = response.headers_mut();
    headers.insert(header::SET_COOKIE, cookie);
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    info!("session cleared");
    Ok(response)
}

/// Get current user handler
pub async fn get_current_user(
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<impl IntoResponse, ServiceError> {
    let profile = state.services.users.get(user.user_id).await?;
    Ok(success_response(profile))
}

pub fn auth_router() -> Router<AppState> {
    Router::new()
        .route("/register", post(register))
        .route("/login", post(login))
        .route("/logout", post(logout))
        .route("/me", get(get_current_user))
}
