use super::common::{
    parse_date_param, report_response, success_response, PaymentRequest, ReportQuery,
};
use crate::{
    auth::AuthUser,
    errors::ServiceError,
    services::{
        history::{HistoryFilter, HistoryPage, HistoryView},
        reports::BillingReport,
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
pub struct HistoryQuery {
    /// Exact client name as archived
    pub client_name: Option<String>,
    /// Inclusive lower bound on the service date (YYYY-MM-DD)
    pub from: Option<String>,
    /// Inclusive upper bound on the service date (YYYY-MM-DD)
    pub to: Option<String>,
    pub page: Option<u64>,
}

impl HistoryQuery {
    fn into_filter(self) -> Result<HistoryFilter, ServiceError> {
        Ok(HistoryFilter {
            from: parse_date_param("from", self.from.as_deref())?,
            to: parse_date_param("to", self.to.as_deref())?,
            client_name: self
                .client_name
                .map(|n| n.trim().to_string())
                .filter(|n| !n.is_empty()),
            page: self.page.unwrap_or(1).max(1),
        })
    }
}

#[utoipa::path(
    get,
    path = "/api/v1/history",
    params(HistoryQuery),
    responses(
        (status = 200, description = "Archived tasks, newest completion first, 10 per page", body = ApiResponse<HistoryPage>),
        (status = 400, description = "Malformed date filter", body = crate::errors::ErrorResponse),
    ),
    tag = "History"
)]
pub async fn list_history(
    State(state): State<AppState>,
    user: AuthUser,
    Query(query): Query<HistoryQuery>,
) -> Result<impl IntoResponse, ServiceError> {
    let page = state
        .services
        .history
        .list(user.user_id, query.into_filter()?)
        .await?;
    Ok(success_response(page))
}

#[utoipa::path(
    get,
    path = "/api/v1/history/{id}",
    params(("id" = i32, Path, description = "History id")),
    responses(
        (status = 200, description = "Snapshot with its machine lines", body = ApiResponse<HistoryView>),
        (status = 404, description = "Snapshot not found", body = crate::errors::ErrorResponse),
    ),
    tag = "History"
)]
pub async fn get_history(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<i32>,
) -> Result<impl IntoResponse, ServiceError> {
    let history = state.services.history.get(user.user_id, id).await?;
    Ok(success_response(history))
}

#[utoipa::path(
    put,
    path = "/api/v1/history/{id}/payment",
    params(("id" = i32, Path, description = "History id")),
    request_body = PaymentRequest,
    responses(
        (status = 200, description = "Payment flag set on the snapshot and the live task", body = ApiResponse<HistoryView>),
        (status = 404, description = "Snapshot not found", body = crate::errors::ErrorResponse),
    ),
    tag = "History"
)]
pub async fn set_history_payment(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<i32>,
    Json(payload): Json<PaymentRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let history = state
        .services
        .history
        .set_paid(user.user_id, id, payload.paid)
        .await?;
    Ok(success_response(history))
}

#[utoipa::path(
    get,
    path = "/api/v1/history/{id}/report",
    params(("id" = i32, Path, description = "History id"), ReportQuery),
    responses(
        (status = 200, description = "Billing report input from the snapshot", body = ApiResponse<BillingReport>),
        (status = 404, description = "Snapshot not found", body = crate::errors::ErrorResponse),
    ),
    tag = "History"
)]
pub async fn history_report(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<i32>,
    Query(query): Query<ReportQuery>,
) -> Result<impl IntoResponse, ServiceError> {
    let report = state.services.reports.for_history(user.user_id, id).await?;
    Ok(report_response(report, &query))
}

pub fn history_routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_history))
        .route("/:id", get(get_history))
        .route("/:id/payment", put(set_history_payment))
        .route("/:id/report", get(history_report))
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn blank_filters_are_ignored() {
        let filter = HistoryQuery {
            client_name: Some("  ".into()),
            from: Some(String::new()),
            to: None,
            page: Some(0),
        }
        .into_filter()
        .unwrap();
        assert!(filter.client_name.is_none());
        assert!(filter.from.is_none());
        assert_eq!(filter.page, 1);
    }

    #[test]
    fn malformed_dates_are_rejected() {
        let query = HistoryQuery {
            from: Some("yesterday".into()),
            ..Default::default()
        };
        assert_matches!(query.into_filter(), Err(ServiceError::BadRequest(_)));
    }
}
