mod common;

use axum::http::{Method, StatusCode};
use common::{response_json, task_body, TestApp};
use serde_json::{json, Value};

fn task_line_id(task: &Value) -> i64 {
    task["machines"][0]["task_machine"]["id"]
        .as_i64()
        .expect("ledger line id")
}

async fn history_items(app: &TestApp, token: &str) -> Vec<Value> {
    let response = app
        .request(Method::GET, "/api/v1/history", None, Some(token))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    response_json(response).await["data"]["items"]
        .as_array()
        .cloned()
        .unwrap_or_default()
}

#[tokio::test]
async fn finishing_the_only_line_completes_and_archives_the_task() {
    let app = TestApp::new().await;
    let token = app.login_as("ana@greenacres.com").await;
    let client_id = app.create_client(&token, "Green Acres").await;
    let machine_id = app.create_machine(&token, "Tractor 1").await;

    let task = app
        .create_task(
            &token,
            task_body(
                "Ploughing",
                client_id,
                json!([{ "machineId": machine_id, "startTime": "100", "hourlyRate": "50" }]),
            ),
        )
        .await;
    assert_eq!(task["completed"], json!(false));
    assert_eq!(task["machines"].as_array().map(Vec::len), Some(1));
    let line_id = task_line_id(&task);
    let task_id = task["id"].as_i64().unwrap();

    let response = app
        .request(
            Method::PUT,
            &format!("/api/v1/tasks/{}", task_id),
            Some(json!({ "finish": [{ "taskMachineId": line_id, "endTime": "105" }] })),
            Some(&token),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let outcome = response_json(response).await["data"].clone();

    assert_eq!(outcome["completed_now"], json!(true));
    assert!(outcome["history_id"].is_i64());
    let line = &outcome["task"]["machines"][0]["task_machine"];
    assert_eq!(line["endTime"], json!(105.0));
    assert_eq!(line["hoursWorked"], json!(5.0));
    assert_eq!(line["totalAmount"], json!(250.0));
    assert_eq!(outcome["task"]["completed"], json!(true));

    let items = history_items(&app, &token).await;
    assert_eq!(items.len(), 1);
    assert_eq!(items[0]["serviceName"], json!("Ploughing"));
    assert_eq!(items[0]["clientName"], json!("Green Acres"));
    assert_eq!(items[0]["totalAmount"], json!(250.0));
    let machines = items[0]["machines"].as_array().unwrap();
    assert_eq!(machines.len(), 1);
    assert_eq!(machines[0]["machineName"], json!("Tractor 1"));
    assert_eq!(machines[0]["hoursWorked"], json!(5.0));
}

#[tokio::test]
async fn positional_form_arrays_attach_machines() {
    let app = TestApp::new().await;
    let token = app.login_as("ana@greenacres.com").await;
    let first = app.create_machine(&token, "Tractor 1").await;
    let second = app.create_machine(&token, "Harvester").await;

    let task = app
        .create_task(
            &token,
            json!({
                "serviceName": "Harvest",
                "location": "South field",
                "locationNumber": "3",
                "machine_ids": [first.to_string(), second.to_string(), ""],
                "start_times": ["10", "", ""],
                "hourly_rates": ["80", "90", ""],
            }),
        )
        .await;

    // Only the machine with a start reading gets a ledger line
    let machines = task["machines"].as_array().unwrap();
    assert_eq!(machines.len(), 1);
    assert_eq!(machines[0]["id"], json!(first));
    assert_eq!(machines[0]["task_machine"]["hourlyRate"], json!(80.0));
    assert!(task["client"].is_null());
}

#[tokio::test]
async fn machine_on_an_unfinished_task_cannot_be_reused() {
    let app = TestApp::new().await;
    let token = app.login_as("ana@greenacres.com").await;
    let client_id = app.create_client(&token, "Green Acres").await;
    let machine_id = app.create_machine(&token, "Tractor 1").await;

    app.create_task(
        &token,
        task_body(
            "Ploughing",
            client_id,
            json!([{ "machineId": machine_id, "startTime": 100, "hourlyRate": 50 }]),
        ),
    )
    .await;

    let response = app
        .post_task(
            &token,
            task_body(
                "Seeding",
                client_id,
                json!([{ "machineId": machine_id, "startTime": 200, "hourlyRate": 50 }]),
            ),
        )
        .await;
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    let body = response_json(response).await;
    let message = body["message"].as_str().unwrap();
    assert!(message.contains("Ploughing"), "{}", message);
    assert!(message.contains("Tractor 1"), "{}", message);
    assert_eq!(body["form"]["machines"].as_array().map(Vec::len), Some(1));

    // The rejected create left nothing behind
    let response = app
        .request(Method::GET, "/api/v1/tasks", None, Some(&token))
        .await;
    let tasks = response_json(response).await["data"].clone();
    assert_eq!(tasks.as_array().map(Vec::len), Some(1));
}

#[tokio::test]
async fn machine_is_free_again_once_its_line_is_finished() {
    let app = TestApp::new().await;
    let token = app.login_as("ana@greenacres.com").await;
    let machine_id = app.create_machine(&token, "Tractor 1").await;

    let task = app
        .create_task(
            &token,
            task_body(
                "Ploughing",
                0,
                json!([{ "machineId": machine_id, "startTime": 100, "hourlyRate": 50 }]),
            ),
        )
        .await;
    let line_id = task_line_id(&task);

    let response = app
        .request(
            Method::GET,
            &format!("/api/v1/machines/{}/usage", machine_id),
            None,
            Some(&token),
        )
        .await;
    let usage = response_json(response).await["data"].clone();
    assert_eq!(usage["in_use"], json!(true));
    assert_eq!(usage["serviceName"], json!("Ploughing"));

    let response = app
        .request(
            Method::PUT,
            &format!("/api/v1/tasks/{}", task["id"]),
            Some(json!({ "task_machine_ids": [line_id.to_string()], "end_times": ["112.5"] })),
            Some(&token),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .post_task(
            &token,
            task_body(
                "Seeding",
                0,
                json!([{ "machineId": machine_id, "startTime": 112.5, "hourlyRate": 50 }]),
            ),
        )
        .await;
    assert_eq!(response.status(), StatusCode::CREATED);
}

#[tokio::test]
async fn duplicate_machine_selection_is_rejected() {
    let app = TestApp::new().await;
    let token = app.login_as("ana@greenacres.com").await;
    let machine_id = app.create_machine(&token, "Tractor 1").await;

    let response = app
        .post_task(
            &token,
            task_body(
                "Ploughing",
                0,
                json!([
                    { "machineId": machine_id, "startTime": 100, "hourlyRate": 50 },
                    { "machineId": machine_id.to_string(), "startTime": 300, "hourlyRate": 50 },
                ]),
            ),
        )
        .await;
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    let body = response_json(response).await;
    assert_eq!(
        body["message"],
        json!("The same machine cannot be added more than once to a task")
    );
}

#[tokio::test]
async fn missing_location_is_rejected_with_form_context() {
    let app = TestApp::new().await;
    let token = app.login_as("ana@greenacres.com").await;
    app.create_client(&token, "Green Acres").await;

    let response = app
        .post_task(
            &token,
            json!({ "serviceName": "Ploughing", "location": "  ", "locationNumber": "1" }),
        )
        .await;
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    let body = response_json(response).await;
    assert_eq!(body["message"], json!("Location is required"));
    assert_eq!(body["form"]["clients"][0]["name"], json!("Green Acres"));
    assert!(body["form"]["notice"].is_string());
}

#[tokio::test]
async fn blank_location_number_on_edit_is_rejected_with_the_task() {
    let app = TestApp::new().await;
    let token = app.login_as("ana@greenacres.com").await;
    let machine_id = app.create_machine(&token, "Tractor 1").await;
    let task = app
        .create_task(
            &token,
            task_body(
                "Ploughing",
                0,
                json!([{ "machineId": machine_id, "startTime": 100, "hourlyRate": 50 }]),
            ),
        )
        .await;
    let task_id = task["id"].as_i64().unwrap();
    let uri = format!("/api/v1/tasks/{}", task_id);

    let response = app
        .request(
            Method::PUT,
            &uri,
            Some(json!({ "locationNumber": "   " })),
            Some(&token),
        )
        .await;
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    let body = response_json(response).await;
    assert_eq!(body["message"], json!("Location number is required"));
    assert_eq!(body["form"]["task"]["id"], json!(task_id));
    assert_eq!(
        body["form"]["task"]["machines"].as_array().map(Vec::len),
        Some(1)
    );

    // Omitted fields keep their stored values.
    let response = app
        .request(Method::PUT, &uri, Some(json!({})), Some(&token))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let updated = response_json(response).await["data"]["task"].clone();
    assert_eq!(updated["location"], json!("North field"));
    assert_eq!(updated["locationNumber"], json!("12"));
    assert_eq!(updated["completed"], json!(false));
}

#[tokio::test]
async fn invalid_end_reading_changes_nothing() {
    let app = TestApp::new().await;
    let token = app.login_as("ana@greenacres.com").await;
    let machine_id = app.create_machine(&token, "Tractor 1").await;
    let task = app
        .create_task(
            &token,
            task_body(
                "Ploughing",
                0,
                json!([{ "machineId": machine_id, "startTime": 100, "hourlyRate": 50 }]),
            ),
        )
        .await;
    let line_id = task_line_id(&task);
    let uri = format!("/api/v1/tasks/{}", task["id"]);

    let response = app
        .request(
            Method::PUT,
            &uri,
            Some(json!({
                "location": "Changed",
                "finish": [{ "taskMachineId": line_id, "endTime": "0" }],
            })),
            Some(&token),
        )
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = app.request(Method::GET, &uri, None, Some(&token)).await;
    let stored = response_json(response).await["data"]["task"].clone();
    assert_eq!(stored["location"], json!("North field"));
    assert!(stored["machines"][0]["task_machine"]["endTime"].is_null());
    assert_eq!(stored["completed"], json!(false));
}

#[tokio::test]
async fn partial_finish_keeps_the_task_open() {
    let app = TestApp::new().await;
    let token = app.login_as("ana@greenacres.com").await;
    let first = app.create_machine(&token, "Tractor 1").await;
    let second = app.create_machine(&token, "Sprayer").await;
    let task = app
        .create_task(
            &token,
            task_body(
                "Spraying",
                0,
                json!([
                    { "machineId": first, "startTime": 10, "hourlyRate": 40 },
                    { "machineId": second, "startTime": 20, "hourlyRate": 60 },
                ]),
            ),
        )
        .await;
    let line_id = task["machines"][0]["task_machine"]["id"].as_i64().unwrap();

    let response = app
        .request(
            Method::PUT,
            &format!("/api/v1/tasks/{}", task["id"]),
            Some(json!({ "finish": [{ "taskMachineId": line_id, "endTime": 12 }] })),
            Some(&token),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let outcome = response_json(response).await["data"].clone();
    assert_eq!(outcome["completed_now"], json!(false));
    assert_eq!(outcome["task"]["completed"], json!(false));
    assert_eq!(outcome["task"]["totalAmount"], json!(80.0));

    assert!(history_items(&app, &token).await.is_empty());
}

#[tokio::test]
async fn completed_task_only_accepts_payment_changes() {
    let app = TestApp::new().await;
    let token = app.login_as("ana@greenacres.com").await;
    let machine_id = app.create_machine(&token, "Tractor 1").await;
    let task = app
        .create_task(
            &token,
            task_body(
                "Ploughing",
                0,
                json!([{ "machineId": machine_id, "startTime": 100, "hourlyRate": 50 }]),
            ),
        )
        .await;
    let line_id = task_line_id(&task);
    let uri = format!("/api/v1/tasks/{}", task["id"]);

    let response = app
        .request(
            Method::PUT,
            &uri,
            Some(json!({ "finish": [{ "taskMachineId": line_id, "endTime": 101 }] })),
            Some(&token),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .request(
            Method::PUT,
            &uri,
            Some(json!({ "location": "Elsewhere" })),
            Some(&token),
        )
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = app
        .request(
            Method::PUT,
            &format!("{}/payment", uri),
            Some(json!({ "paid": true })),
            Some(&token),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn ledger_line_of_another_task_is_not_found() {
    let app = TestApp::new().await;
    let token = app.login_as("ana@greenacres.com").await;
    let first = app.create_machine(&token, "Tractor 1").await;
    let second = app.create_machine(&token, "Tractor 2").await;
    let task_a = app
        .create_task(
            &token,
            task_body(
                "A",
                0,
                json!([{ "machineId": first, "startTime": 1, "hourlyRate": 1 }]),
            ),
        )
        .await;
    let task_b = app
        .create_task(
            &token,
            task_body(
                "B",
                0,
                json!([{ "machineId": second, "startTime": 1, "hourlyRate": 1 }]),
            ),
        )
        .await;
    let foreign_line = task_line_id(&task_b);

    let response = app
        .request(
            Method::PUT,
            &format!("/api/v1/tasks/{}", task_a["id"]),
            Some(json!({ "finish": [{ "taskMachineId": foreign_line, "endTime": 5 }] })),
            Some(&token),
        )
        .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = app
        .request(
            Method::GET,
            &format!("/api/v1/tasks/{}", task_b["id"]),
            None,
            Some(&token),
        )
        .await;
    let stored = response_json(response).await["data"]["task"].clone();
    assert!(stored["machines"][0]["task_machine"]["endTime"].is_null());
}

#[tokio::test]
async fn payment_flag_is_mirrored_between_task_and_history() {
    let app = TestApp::new().await;
    let token = app.login_as("ana@greenacres.com").await;
    let machine_id = app.create_machine(&token, "Tractor 1").await;
    let task = app
        .create_task(
            &token,
            task_body(
                "Ploughing",
                0,
                json!([{ "machineId": machine_id, "startTime": 100, "hourlyRate": 50 }]),
            ),
        )
        .await;
    let line_id = task_line_id(&task);
    let task_uri = format!("/api/v1/tasks/{}", task["id"]);

    let response = app
        .request(
            Method::PUT,
            &task_uri,
            Some(json!({ "finish": [{ "taskMachineId": line_id, "endTime": 104 }] })),
            Some(&token),
        )
        .await;
    let history_id = response_json(response).await["data"]["history_id"]
        .as_i64()
        .unwrap();

    let response = app
        .request(
            Method::PUT,
            &format!("{}/payment", task_uri),
            Some(json!({ "paid": "on" })),
            Some(&token),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let history_uri = format!("/api/v1/history/{}", history_id);
    let response = app
        .request(Method::GET, &history_uri, None, Some(&token))
        .await;
    assert_eq!(response_json(response).await["data"]["paid"], json!(true));

    let response = app
        .request(
            Method::PUT,
            &format!("{}/payment", history_uri),
            Some(json!({ "paid": false })),
            Some(&token),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let response = app.request(Method::GET, &task_uri, None, Some(&token)).await;
    assert_eq!(
        response_json(response).await["data"]["task"]["paid"],
        json!(false)
    );
}

#[tokio::test]
async fn deleting_a_task_keeps_its_history() {
    let app = TestApp::new().await;
    let token = app.login_as("ana@greenacres.com").await;
    let machine_id = app.create_machine(&token, "Tractor 1").await;
    let task = app
        .create_task(
            &token,
            task_body(
                "Ploughing",
                0,
                json!([{ "machineId": machine_id, "startTime": 100, "hourlyRate": 50 }]),
            ),
        )
        .await;
    let line_id = task_line_id(&task);
    let task_uri = format!("/api/v1/tasks/{}", task["id"]);

    app.request(
        Method::PUT,
        &task_uri,
        Some(json!({ "finish": [{ "taskMachineId": line_id, "endTime": 110 }] })),
        Some(&token),
    )
    .await;

    let response = app
        .request(Method::DELETE, &task_uri, None, Some(&token))
        .await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let response = app.request(Method::GET, &task_uri, None, Some(&token)).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let items = history_items(&app, &token).await;
    assert_eq!(items.len(), 1);
    assert_eq!(items[0]["totalAmount"], json!(500.0));

    // The archive still answers for the deleted task
    let response = app
        .request(
            Method::GET,
            &format!("{}/report", task_uri),
            None,
            Some(&token),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response_json(response).await["data"]["source"],
        json!("archive")
    );
}

#[tokio::test]
async fn tasks_are_scoped_to_their_owner() {
    let app = TestApp::new().await;
    let owner = app.login_as("ana@greenacres.com").await;
    let other = app.login_as("bruno@hillside.com").await;
    let machine_id = app.create_machine(&owner, "Tractor 1").await;
    let task = app
        .create_task(
            &owner,
            task_body(
                "Ploughing",
                0,
                json!([{ "machineId": machine_id, "startTime": 100, "hourlyRate": 50 }]),
            ),
        )
        .await;

    let response = app
        .request(
            Method::GET,
            &format!("/api/v1/tasks/{}", task["id"]),
            None,
            Some(&other),
        )
        .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    // Another user's machine is not selectable
    let response = app
        .post_task(
            &other,
            task_body(
                "Stolen",
                0,
                json!([{ "machineId": machine_id, "startTime": 1, "hourlyRate": 1 }]),
            ),
        )
        .await;
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
}
