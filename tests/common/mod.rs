#![allow(dead_code)]

use std::sync::Arc;

use axum::{
    body::Body,
    http::{header, Method, Request, StatusCode},
    response::Response,
    Router,
};
use farm_service_api::{config::AppConfig, db, AppState};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

pub const TEST_SECRET: &str =
    "Xq9vL2mN7pR4tW8yB3cF6hJ1kZ5sD0gQ-farm-ops-signing-material-uvwMNOP";
pub const TEST_PASSWORD: &str = "Harvest2024";

/// Helper harness for spinning up the full router over an in-memory SQLite database.
pub struct TestApp {
    router: Router,
    pub state: AppState,
}

impl TestApp {
    /// Construct a new test application with fresh database state.
    pub async fn new() -> Self {
        let mut cfg = AppConfig::new(
            "sqlite::memory:".to_string(),
            TEST_SECRET.to_string(),
            "127.0.0.1".to_string(),
            18_080,
            "test".to_string(),
        );
        cfg.cors_allow_any_origin = true;

        let pool = db::establish_connection_from_app_config(&cfg)
            .await
            .expect("failed to create test database");
        db::run_migrations(&pool)
            .await
            .expect("failed to run migrations in tests");

        let state = AppState::new(Arc::new(pool), cfg);
        let router = farm_service_api::build_router(state.clone());

        Self { router, state }
    }

    /// Send a request against the router with an optional bearer token.
    pub async fn request(
        &self,
        method: Method,
        uri: &str,
        body: Option<Value>,
        token: Option<&str>,
    ) -> Response {
        let mut builder = Request::builder().method(method).uri(uri);

        if let Some(tok) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", tok));
        }

        let body = if let Some(json) = body {
            builder = builder.header(header::CONTENT_TYPE, "application/json");
            Body::from(serde_json::to_vec(&json).expect("failed to serialize json request body"))
        } else {
            Body::empty()
        };

        let request = builder.body(body).expect("failed to build request");
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router error during test request")
    }

    /// Sends a request carrying only the session cookie.
    pub async fn request_with_cookie(&self, method: Method, uri: &str, cookie: &str) -> Response {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header(header::COOKIE, cookie)
            .body(Body::empty())
            .expect("failed to build request");
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router error during test request")
    }

    /// Registers an account and logs it in, returning the access token.
    pub async fn login_as(&self, email: &str) -> String {
        let response = self
            .request(
                Method::POST,
                "/auth/register",
                Some(json!({
                    "name": "Test Operator",
                    "email": email,
                    "password": TEST_PASSWORD,
                })),
                None,
            )
            .await;
        assert_eq!(response.status(), StatusCode::CREATED, "register {}", email);

        let response = self
            .request(
                Method::POST,
                "/auth/login",
                Some(json!({ "email": email, "password": TEST_PASSWORD })),
                None,
            )
            .await;
        assert_eq!(response.status(), StatusCode::OK, "login {}", email);
        let body = response_json(response).await;
        body["data"]["access_token"]
            .as_str()
            .expect("access token in login response")
            .to_string()
    }

    /// Creates a client and returns its id.
    pub async fn create_client(&self, token: &str, name: &str) -> i64 {
        let response = self
            .request(
                Method::POST,
                "/api/v1/clients",
                Some(json!({ "name": name, "email": "billing@greenacres.com" })),
                Some(token),
            )
            .await;
        assert_eq!(response.status(), StatusCode::CREATED);
        response_json(response).await["data"]["id"]
            .as_i64()
            .expect("client id")
    }

    /// Creates a machine and returns its id.
    pub async fn create_machine(&self, token: &str, name: &str) -> i64 {
        let response = self
            .request(
                Method::POST,
                "/api/v1/machines",
                Some(json!({ "name": name, "type": "Tractor" })),
                Some(token),
            )
            .await;
        assert_eq!(response.status(), StatusCode::CREATED);
        response_json(response).await["data"]["id"]
            .as_i64()
            .expect("machine id")
    }

    /// Creates a task through the API and returns the raw response.
    pub async fn post_task(&self, token: &str, body: Value) -> Response {
        self.request(Method::POST, "/api/v1/tasks", Some(body), Some(token))
            .await
    }

    /// Creates a task expected to succeed and returns its JSON view.
    pub async fn create_task(&self, token: &str, body: Value) -> Value {
        let response = self.post_task(token, body).await;
        assert_eq!(response.status(), StatusCode::CREATED);
        response_json(response).await["data"].clone()
    }
}

/// Standard task body: one machine line plus the required location fields.
pub fn task_body(service_name: &str, client_id: i64, lines: Value) -> Value {
    json!({
        "clientId": client_id,
        "serviceName": service_name,
        "serviceDate": "2024-03-01",
        "location": "North field",
        "locationNumber": "12",
        "machines": lines,
    })
}

pub async fn response_json(response: Response) -> Value {
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("read response body")
        .to_bytes();
    serde_json::from_slice(&bytes).expect("response body is json")
}

pub async fn response_text(response: Response) -> String {
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("read response body")
        .to_bytes();
    String::from_utf8(bytes.to_vec()).expect("response body is utf-8")
}
