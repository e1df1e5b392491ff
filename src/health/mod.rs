/*!
 * # Health Check Module
 *
 * - Basic health check (`/health`) with a database ping
 * - Liveness check (`/health/live`) that never touches the database
 * - Version info (`/health/version`)
 */

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::get,
    Router,
};
use chrono::{DateTime, Utc};
use sea_orm::DatabaseConnection;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, error};
use utoipa::ToSchema;

/// Basic health status
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Up,
    Down,
}

/// Body of `GET /health`
#[derive(Serialize, Deserialize, Debug, Clone, ToSchema)]
pub struct HealthInfo {
    pub status: HealthStatus,
    pub version: String,
    pub timestamp: DateTime<Utc>,
    pub database: HealthStatus,
}

/// Pings the database and summarizes the result.
pub async fn check(db: &DatabaseConnection) -> HealthInfo {
    let database = match db.ping().await {
        Ok(()) => HealthStatus::Up,
        Err(e) => {
            error!("Database health check failed: {}", e);
            HealthStatus::Down
        }
    };

    HealthInfo {
        status: database,
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: Utc::now(),
        database,
    }
}

/// Basic health check endpoint
pub async fn health_check(State(db): State<Arc<DatabaseConnection>>) -> impl IntoResponse {
    debug!("Health check endpoint called");

    let health = check(&db).await;
    let status_code = match health.status {
        HealthStatus::Up => StatusCode::OK,
        HealthStatus::Down => StatusCode::SERVICE_UNAVAILABLE,
    };

    (status_code, Json(health))
}

/// Liveness check endpoint
pub async fn liveness_check() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(json!({
            "alive": true,
            "timestamp": Utc::now(),
        })),
    )
}

/// Returns build and version information
pub async fn version_info() -> impl IntoResponse {
    Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "commit": option_env!("GIT_HASH").unwrap_or("unknown"),
    }))
}

/// Health routes, mounted under `/health`
pub fn health_routes<S>() -> Router<S>
where
    S: Clone + Send + Sync + 'static,
    Arc<DatabaseConnection>: axum::extract::FromRef<S>,
{
    Router::new()
        .route("/", get(health_check))
        .route("/live", get(liveness_check))
        .route("/version", get(version_info))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_database_reports_up() {
        let db = crate::db::establish_connection("sqlite::memory:")
            .await
            .unwrap();
        let health = check(&db).await;
        assert_eq!(health.status, HealthStatus::Up);
        assert_eq!(health.database, HealthStatus::Up);
        assert_eq!(health.version, env!("CARGO_PKG_VERSION"));
    }
}
