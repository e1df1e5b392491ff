use crate::{errors::ServiceError, services::reports::BillingReport, ApiResponse};
use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::NaiveDate;
use serde::{de, Deserialize, Deserializer, Serialize};
use utoipa::{IntoParams, ToSchema};

/// Standard success response
pub fn success_response<T: Serialize>(data: T) -> Response {
    (StatusCode::OK, Json(ApiResponse::success(data))).into_response()
}

/// Standard created response
pub fn created_response<T: Serialize>(data: T) -> Response {
    (StatusCode::CREATED, Json(ApiResponse::success(data))).into_response()
}

/// Standard no content response
pub fn no_content_response() -> Response {
    StatusCode::NO_CONTENT.into_response()
}

/// Reads checkbox-ish values: `true`, `"true"`, `"on"`, `"1"`, `1`.
fn flag<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flag {
        Bool(bool),
        Number(i64),
        Text(String),
    }

    match Flag::deserialize(deserializer)? {
        Flag::Bool(value) => Ok(value),
        Flag::Number(value) => Ok(value != 0),
        Flag::Text(value) => match value.trim().to_ascii_lowercase().as_str() {
            "true" | "on" | "1" | "yes" => Ok(true),
            "false" | "off" | "0" | "no" | "" => Ok(false),
            other => Err(de::Error::custom(format!("invalid paid flag: {}", other))),
        },
    }
}

/// Body of the payment toggles
#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct PaymentRequest {
    #[serde(deserialize_with = "flag")]
    #[schema(value_type = bool)]
    pub paid: bool,
}

/// `?format=text` switches a report to the plain-text statement
#[derive(Debug, Default, Deserialize, IntoParams)]
pub struct ReportQuery {
    pub format: Option<String>,
}

impl ReportQuery {
    fn wants_text(&self) -> bool {
        self.format
            .as_deref()
            .map(|f| f.eq_ignore_ascii_case("text"))
            .unwrap_or(false)
    }
}

/// Renders a report as JSON, or as text when asked to.
pub fn report_response(report: BillingReport, query: &ReportQuery) -> Response {
    if query.wants_text() {
        return (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            report.render_text(),
        )
            .into_response();
    }
    success_response(report)
}

/// Parses an optional `YYYY-MM-DD` query value; blank means absent.
pub fn parse_date_param(name: &str, raw: Option<&str>) -> Result<Option<NaiveDate>, ServiceError> {
    match raw.map(str::trim).filter(|v| !v.is_empty()) {
        None => Ok(None),
        Some(value) => NaiveDate::parse_from_str(value, "%Y-%m-%d")
            .map(Some)
            .map_err(|_| {
                ServiceError::BadRequest(format!("{} must be a date in YYYY-MM-DD format", name))
            }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use rstest::rstest;

    #[rstest]
    #[case(serde_json::json!({ "paid": true }), true)]
    #[case(serde_json::json!({ "paid": "on" }), true)]
    #[case(serde_json::json!({ "paid": 1 }), true)]
    #[case(serde_json::json!({ "paid": "false" }), false)]
    #[case(serde_json::json!({ "paid": 0 }), false)]
    fn payment_flag_accepts_form_values(#[case] body: serde_json::Value, #[case] expected: bool) {
        let request: PaymentRequest = serde_json::from_value(body).unwrap();
        assert_eq!(request.paid, expected);
    }

    #[test]
    fn payment_flag_rejects_garbage() {
        assert!(serde_json::from_value::<PaymentRequest>(serde_json::json!({ "paid": "maybe" }))
            .is_err());
    }

    #[test]
    fn date_params() {
        assert_eq!(parse_date_param("from", Some("")).unwrap(), None);
        assert_eq!(
            parse_date_param("from", Some("2024-01-31")).unwrap(),
            NaiveDate::from_ymd_opt(2024, 1, 31)
        );
        assert_matches!(
            parse_date_param("to", Some("31/01/2024")),
            Err(ServiceError::BadRequest(_))
        );
    }
}
