use crate::{
    db::{is_unique_violation, DbPool},
    entities::{client, machine, task, task_history, task_machine},
    errors::ServiceError,
    services::{
        clients::{clean, ClientResponse},
        history,
        ledger::{self, FieldValue, FinishError, FinishLine, LineItem, SelectionError},
        machines::MachineResponse,
    },
};
use chrono::{DateTime, NaiveDate, Utc};
use metrics::counter;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseTransaction, DbErr, EntityTrait,
    QueryFilter, QueryOrder, Set, TransactionTrait,
};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use utoipa::ToSchema;

const LOCATION_REQUIRED: &str = "Location is required";
const LOCATION_NUMBER_REQUIRED: &str = "Location number is required";
const DUPLICATE_MACHINE: &str = "The same machine cannot be added more than once to a task";
const UNKNOWN_MACHINE: &str = "Selected machine does not exist";
const UNKNOWN_CLIENT: &str = "Selected client does not exist";
const INVALID_SERVICE_DATE: &str = "Service date must be a valid date (YYYY-MM-DD)";

/// Nested usage figures of one machine on one task.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct TaskMachineView {
    pub id: i32,
    #[serde(rename = "startTime")]
    pub start_time: f64,
    #[serde(rename = "endTime")]
    pub end_time: Option<f64>,
    #[serde(rename = "hoursWorked")]
    pub hours_worked: f64,
    #[serde(rename = "totalAmount")]
    pub total_amount: f64,
    #[serde(rename = "hourlyRate")]
    pub hourly_rate: f64,
}

impl From<&task_machine::Model> for TaskMachineView {
    fn from(line: &task_machine::Model) -> Self {
        Self {
            id: line.id,
            start_time: line.start_time,
            end_time: line.end_time,
            hours_worked: line.hours_worked,
            total_amount: line.total_amount,
            hourly_rate: line.hourly_rate,
        }
    }
}

/// A machine attached to a task, annotated with its ledger line.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct TaskMachineEntry {
    pub id: i32,
    pub name: String,
    pub machine_type: Option<String>,
    pub description: Option<String>,
    pub task_machine: TaskMachineView,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ClientSummary {
    pub id: i32,
    pub name: String,
    pub email: Option<String>,
}

/// Task as handed to presentation layers. Field names are part of the
/// contract with existing templates.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct TaskView {
    pub id: i32,
    pub user_id: i32,
    pub client_id: Option<i32>,
    #[serde(rename = "serviceName")]
    pub service_name: String,
    pub service_date: NaiveDate,
    pub location: String,
    #[serde(rename = "locationNumber")]
    pub location_number: String,
    pub description: Option<String>,
    pub completed: bool,
    pub paid: bool,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
    pub client: Option<ClientSummary>,
    pub machines: Vec<TaskMachineEntry>,
    #[serde(rename = "totalAmount")]
    pub total_amount: f64,
}

/// Everything a task form needs to be shown (again).
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct FormContext {
    pub clients: Vec<ClientResponse>,
    pub machines: Vec<MachineResponse>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task: Option<TaskView>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notice: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    Many(Vec<Option<FieldValue>>),
    One(Option<FieldValue>),
}

/// Accepts `"3"`, `3` or `["3", ""]` for positional form arrays.
fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<Option<FieldValue>>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::Many(values) => values,
        OneOrMany::One(value) => vec![value],
    })
}

/// Distinguishes an absent key (`None`) from an explicit `null` (`Some(None)`).
fn present<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    T::deserialize(deserializer).map(Some)
}

#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
pub struct CreateTaskRequest {
    #[serde(default, alias = "clientId")]
    pub client_id: Option<FieldValue>,
    #[serde(default, alias = "serviceName")]
    pub service_name: Option<String>,
    #[serde(default, alias = "serviceDate")]
    pub service_date: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default, alias = "locationNumber")]
    pub location_number: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    /// Line items; when empty the positional arrays below are used
    #[serde(default)]
    pub machines: Vec<LineItem>,
    #[serde(default, deserialize_with = "one_or_many")]
    #[schema(value_type = Vec<Object>)]
    pub machine_ids: Vec<Option<FieldValue>>,
    #[serde(default, deserialize_with = "one_or_many")]
    #[schema(value_type = Vec<Object>)]
    pub start_times: Vec<Option<FieldValue>>,
    #[serde(default, deserialize_with = "one_or_many")]
    #[schema(value_type = Vec<Object>)]
    pub hourly_rates: Vec<Option<FieldValue>>,
}

/// Edit payload. Absent keys leave the stored value untouched.
#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
pub struct UpdateTaskRequest {
    #[serde(default, alias = "clientId", deserialize_with = "present")]
    #[schema(value_type = Option<Object>)]
    pub client_id: Option<Option<FieldValue>>,
    #[serde(default, alias = "serviceName")]
    pub service_name: Option<String>,
    #[serde(default, alias = "serviceDate")]
    pub service_date: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default, alias = "locationNumber")]
    pub location_number: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub finish: Vec<FinishLine>,
    #[serde(default, deserialize_with = "one_or_many")]
    #[schema(value_type = Vec<Object>)]
    pub task_machine_ids: Vec<Option<FieldValue>>,
    #[serde(default, deserialize_with = "one_or_many")]
    #[schema(value_type = Vec<Object>)]
    pub end_times: Vec<Option<FieldValue>>,
}

impl UpdateTaskRequest {
    fn touches_task(&self) -> bool {
        self.client_id.is_some()
            || self.service_name.is_some()
            || self.service_date.is_some()
            || self.location.is_some()
            || self.location_number.is_some()
            || self.description.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Open,
    Completed,
}

/// Result of an edit: the task as stored plus whether this edit completed it.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct TaskUpdateOutcome {
    pub task: TaskView,
    pub completed_now: bool,
    pub history_id: Option<i32>,
}

/// Why a write was abandoned: recoverable on the form, or terminal.
enum Rejection {
    Form(String),
    MachineRace(i32),
    Fatal(ServiceError),
}

impl From<ServiceError> for Rejection {
    fn from(err: ServiceError) -> Self {
        Rejection::Fatal(err)
    }
}

impl From<DbErr> for Rejection {
    fn from(err: DbErr) -> Self {
        Rejection::Fatal(ServiceError::db_error(err))
    }
}

fn parse_service_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    NaiveDate::parse_from_str(raw, "%Y-%m-%d").ok().or_else(|| {
        DateTime::parse_from_rfc3339(raw)
            .ok()
            .map(|dt| dt.with_timezone(&Utc).date_naive())
    })
}

fn in_use_message(machine_name: &str, service_name: &str) -> String {
    format!(
        "Machine \"{}\" is already in use on task \"{}\", which has not been finished yet. \
         Finish that task before using this machine.",
        machine_name, service_name
    )
}

/// Task lifecycle engine: creation with machine attachment, edits that
/// finalize ledger lines, completion and archival, payment and deletion.
#[derive(Clone)]
pub struct TaskService {
    db: Arc<DbPool>,
}

impl TaskService {
    pub fn new(db: Arc<DbPool>) -> Self {
        Self { db }
    }

    /// Lists the user's tasks, newest first.
    #[instrument(skip(self))]
    pub async fn list(
        &self,
        user_id: i32,
        status: Option<TaskStatus>,
    ) -> Result<Vec<TaskView>, ServiceError> {
        let mut query = task::Entity::find().filter(task::Column::UserId.eq(user_id));
        match status {
            Some(TaskStatus::Open) => query = query.filter(task::Column::Completed.eq(false)),
            Some(TaskStatus::Completed) => query = query.filter(task::Column::Completed.eq(true)),
            None => {}
        }
        let tasks = query
            .order_by_desc(task::Column::CreatedAt)
            .order_by_desc(task::Column::Id)
            .all(&*self.db)
            .await
            .map_err(ServiceError::db_error)?;

        build_views(&*self.db, user_id, tasks)
            .await
            .map_err(ServiceError::db_error)
    }

    #[instrument(skip(self))]
    pub async fn get(&self, user_id: i32, id: i32) -> Result<TaskView, ServiceError> {
        let task = find_task(&*self.db, user_id, id).await?;
        let mut views = build_views(&*self.db, user_id, vec![task])
            .await
            .map_err(ServiceError::db_error)?;
        views
            .pop()
            .ok_or_else(|| ServiceError::NotFound(format!("Task {} not found", id)))
    }

    /// Loads the option lists every task form needs, once.
    #[instrument(skip(self, task))]
    pub async fn form_context(
        &self,
        user_id: i32,
        task: Option<TaskView>,
    ) -> Result<FormContext, ServiceError> {
        let clients = client::Entity::find()
            .filter(client::Column::UserId.eq(user_id))
            .order_by_asc(client::Column::Name)
            .all(&*self.db)
            .await
            .map_err(ServiceError::db_error)?;
        let machines = machine::Entity::find()
            .filter(machine::Column::UserId.eq(user_id))
            .order_by_asc(machine::Column::Name)
            .all(&*self.db)
            .await
            .map_err(ServiceError::db_error)?;

        let notice = match (clients.is_empty(), machines.is_empty()) {
            (true, true) => Some(
                "Register at least one client and one machine before creating a task.".to_string(),
            ),
            (true, false) => {
                Some("Register at least one client before creating a task.".to_string())
            }
            (false, true) => {
                Some("Register at least one machine before creating a task.".to_string())
            }
            (false, false) => None,
        };

        Ok(FormContext {
            clients: clients.into_iter().map(Into::into).collect(),
            machines: machines.into_iter().map(Into::into).collect(),
            task,
            notice,
        })
    }

    /// Creates a task and opens one ledger line per selected machine that has
    /// a start reading. The exclusivity check and the inserts share one
    /// transaction; the partial unique index catches concurrent attachers.
    #[instrument(skip(self, request))]
    pub async fn create(
        &self,
        user_id: i32,
        request: CreateTaskRequest,
    ) -> Result<TaskView, ServiceError> {
        let txn = self.db.begin().await.map_err(ServiceError::db_error)?;

        match create_in(&txn, user_id, request).await {
            Ok(task_id) => {
                txn.commit().await.map_err(ServiceError::db_error)?;
                counter!("farm_service.tasks.created", 1);
                info!(task_id, user_id, "task created");
                self.get(user_id, task_id).await
            }
            Err(rejection) => {
                txn.rollback().await.map_err(ServiceError::db_error)?;
                Err(self.reject(user_id, None, rejection).await)
            }
        }
    }

    /// Applies field edits and end readings. When every ledger line ends up
    /// finished the task is completed and archived in the same transaction.
    #[instrument(skip(self, request))]
    pub async fn update(
        &self,
        user_id: i32,
        id: i32,
        request: UpdateTaskRequest,
    ) -> Result<TaskUpdateOutcome, ServiceError> {
        let txn = self.db.begin().await.map_err(ServiceError::db_error)?;

        match update_in(&txn, user_id, id, request).await {
            Ok(history_id) => {
                txn.commit().await.map_err(ServiceError::db_error)?;
                if let Some(history_id) = history_id {
                    counter!("farm_service.tasks.completed", 1);
                    info!(task_id = id, history_id, "task completed and archived");
                }
                Ok(TaskUpdateOutcome {
                    task: self.get(user_id, id).await?,
                    completed_now: history_id.is_some(),
                    history_id,
                })
            }
            Err(rejection) => {
                txn.rollback().await.map_err(ServiceError::db_error)?;
                Err(self.reject(user_id, Some(id), rejection).await)
            }
        }
    }

    /// Sets paid/unpaid on the task and on its archive snapshot, if any.
    #[instrument(skip(self))]
    pub async fn set_paid(
        &self,
        user_id: i32,
        id: i32,
        paid: bool,
    ) -> Result<TaskView, ServiceError> {
        let txn = self.db.begin().await.map_err(ServiceError::db_error)?;

        let task = find_task(&txn, user_id, id).await?;
        let mut active: task::ActiveModel = task.into();
        active.paid = Set(paid);
        active.update(&txn).await.map_err(ServiceError::db_error)?;

        task_history::Entity::update_many()
            .col_expr(
                task_history::Column::Paid,
                sea_orm::sea_query::Expr::value(paid),
            )
            .filter(task_history::Column::TaskId.eq(id))
            .filter(task_history::Column::UserId.eq(user_id))
            .exec(&txn)
            .await
            .map_err(ServiceError::db_error)?;

        txn.commit().await.map_err(ServiceError::db_error)?;

        counter!("farm_service.tasks.payment_toggled", 1);
        info!(task_id = id, paid, "task payment status changed");
        self.get(user_id, id).await
    }

    /// Removes the task and its ledger lines. Archived snapshots stay.
    #[instrument(skip(self))]
    pub async fn delete(&self, user_id: i32, id: i32) -> Result<(), ServiceError> {
        let txn = self.db.begin().await.map_err(ServiceError::db_error)?;

        let task = find_task(&txn, user_id, id).await?;
        task_machine::Entity::delete_many()
            .filter(task_machine::Column::TaskId.eq(task.id))
            .exec(&txn)
            .await
            .map_err(ServiceError::db_error)?;
        task::Entity::delete_by_id(task.id)
            .exec(&txn)
            .await
            .map_err(ServiceError::db_error)?;

        txn.commit().await.map_err(ServiceError::db_error)?;

        counter!("farm_service.tasks.deleted", 1);
        info!(task_id = id, user_id, "task deleted");
        Ok(())
    }

    /// Turns a rejection into the error the caller sees. Runs after the
    /// transaction is gone, so form context reads use the pool.
    async fn reject(&self, user_id: i32, task_id: Option<i32>, rejection: Rejection) -> ServiceError {
        let message = match rejection {
            Rejection::Fatal(err) => return err,
            Rejection::Form(message) => message,
            Rejection::MachineRace(machine_id) => {
                match open_usage_conflict(&*self.db, user_id, machine_id).await {
                    Ok(Some(message)) => message,
                    Ok(None) => {
                        "Machine is already in use on another task that has not been finished yet"
                            .to_string()
                    }
                    Err(err) => return ServiceError::db_error(err),
                }
            }
        };

        counter!("farm_service.tasks.rejected", 1);
        warn!(user_id, ?task_id, %message, "task form rejected");

        let task = match task_id {
            Some(id) => match self.get(user_id, id).await {
                Ok(view) => Some(view),
                Err(err) => return err,
            },
            None => None,
        };
        match self.form_context(user_id, task).await {
            Ok(form) => ServiceError::form(message, form),
            Err(err) => err,
        }
    }
}

async fn find_task<C: ConnectionTrait>(
    conn: &C,
    user_id: i32,
    id: i32,
) -> Result<task::Model, ServiceError> {
    task::Entity::find_by_id(id)
        .filter(task::Column::UserId.eq(user_id))
        .one(conn)
        .await
        .map_err(ServiceError::db_error)?
        .ok_or_else(|| ServiceError::NotFound(format!("Task {} not found", id)))
}

/// Names the open line holding `machine_id` among the user's tasks.
async fn open_usage_conflict<C: ConnectionTrait>(
    conn: &C,
    user_id: i32,
    machine_id: i32,
) -> Result<Option<String>, DbErr> {
    let open = task_machine::Entity::find()
        .filter(task_machine::Column::MachineId.eq(machine_id))
        .filter(task_machine::Column::EndTime.is_null())
        .find_also_related(task::Entity)
        .filter(task::Column::UserId.eq(user_id))
        .one(conn)
        .await?;

    let Some((_, Some(blocking))) = open else {
        return Ok(None);
    };
    let machine_name = machine::Entity::find_by_id(machine_id)
        .one(conn)
        .await?
        .map(|m| m.name)
        .unwrap_or_else(|| "Machine".to_string());

    Ok(Some(in_use_message(&machine_name, &blocking.service_name)))
}

async fn owned_client(
    txn: &DatabaseTransaction,
    user_id: i32,
    value: &FieldValue,
) -> Result<i32, Rejection> {
    let id = value
        .to_id()
        .ok_or_else(|| Rejection::Form(UNKNOWN_CLIENT.to_string()))?;
    client::Entity::find_by_id(id)
        .filter(client::Column::UserId.eq(user_id))
        .one(txn)
        .await?
        .map(|c| c.id)
        .ok_or_else(|| Rejection::Form(UNKNOWN_CLIENT.to_string()))
}

fn required(value: Option<&str>, message: &str) -> Result<String, Rejection> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or_else(|| Rejection::Form(message.to_string()))
}

async fn create_in(
    txn: &DatabaseTransaction,
    user_id: i32,
    request: CreateTaskRequest,
) -> Result<i32, Rejection> {
    let location = required(request.location.as_deref(), LOCATION_REQUIRED)?;
    let location_number = required(request.location_number.as_deref(), LOCATION_NUMBER_REQUIRED)?;

    let items = ledger::align_line_items(
        request.machines,
        &request.machine_ids,
        &request.start_times,
        &request.hourly_rates,
    );
    let selected = ledger::selected_machine_ids(&items).map_err(|err| match err {
        SelectionError::Duplicate => Rejection::Form(DUPLICATE_MACHINE.to_string()),
        SelectionError::Invalid(_) => Rejection::Form(UNKNOWN_MACHINE.to_string()),
    })?;

    let client_id = match request.client_id.as_ref().filter(|v| v.is_truthy()) {
        Some(value) => Some(owned_client(txn, user_id, value).await?),
        None => None,
    };

    let service_date = match request.service_date.as_deref().map(str::trim) {
        Some(raw) if !raw.is_empty() => parse_service_date(raw)
            .ok_or_else(|| Rejection::Form(INVALID_SERVICE_DATE.to_string()))?,
        _ => Utc::now().date_naive(),
    };

    let owned: HashMap<i32, machine::Model> = machine::Entity::find()
        .filter(machine::Column::UserId.eq(user_id))
        .filter(machine::Column::Id.is_in(selected.clone()))
        .all(txn)
        .await?
        .into_iter()
        .map(|m| (m.id, m))
        .collect();
    if selected.iter().any(|id| !owned.contains_key(id)) {
        return Err(Rejection::Form(UNKNOWN_MACHINE.to_string()));
    }

    for machine_id in &selected {
        if let Some(message) = open_usage_conflict(txn, user_id, *machine_id).await? {
            return Err(Rejection::Form(message));
        }
    }

    let task = task::ActiveModel {
        user_id: Set(user_id),
        client_id: Set(client_id),
        service_name: Set(request
            .service_name
            .map(|s| s.trim().to_string())
            .unwrap_or_default()),
        service_date: Set(service_date),
        location: Set(location),
        location_number: Set(location_number),
        description: Set(clean(request.description)),
        completed: Set(false),
        paid: Set(false),
        ..Default::default()
    }
    .insert(txn)
    .await?;

    for attachment in ledger::plan_attachments(&items) {
        let inserted = task_machine::ActiveModel {
            task_id: Set(task.id),
            machine_id: Set(attachment.machine_id),
            start_time: Set(attachment.start_time),
            end_time: Set(None),
            hourly_rate: Set(attachment.hourly_rate),
            hours_worked: Set(0.0),
            total_amount: Set(0.0),
            ..Default::default()
        }
        .insert(txn)
        .await;

        match inserted {
            Ok(_) => {}
            Err(err) if is_unique_violation(&err) => {
                return Err(Rejection::MachineRace(attachment.machine_id))
            }
            Err(err) => return Err(err.into()),
        }
    }

    Ok(task.id)
}

/// Returns the new history id when the edit completed the task.
async fn update_in(
    txn: &DatabaseTransaction,
    user_id: i32,
    id: i32,
    request: UpdateTaskRequest,
) -> Result<Option<i32>, Rejection> {
    let task = find_task(txn, user_id, id).await?;

    let finish_lines = ledger::align_finish_lines(
        request.finish.clone(),
        &request.task_machine_ids,
        &request.end_times,
    );
    // Bad end readings fail the whole request before any other gate.
    let finishes = ledger::plan_finishes(&finish_lines).map_err(|err| match err {
        FinishError::InvalidEndTime(_) => {
            Rejection::Fatal(ServiceError::BadRequest(err.to_string()))
        }
        FinishError::UnknownLine(_) => Rejection::Fatal(ServiceError::NotFound(err.to_string())),
    })?;

    if task.completed {
        if request.touches_task() || !finishes.is_empty() {
            return Err(Rejection::Fatal(ServiceError::BadRequest(
                "Task is already completed; only its payment status can change".to_string(),
            )));
        }
        return Ok(None);
    }

    let location = match request.location.as_deref() {
        Some(raw) => Some(required(Some(raw), LOCATION_REQUIRED)?),
        None => None,
    };
    let location_number = match request.location_number.as_deref() {
        Some(raw) => Some(required(Some(raw), LOCATION_NUMBER_REQUIRED)?),
        None => None,
    };
    let client_id = match &request.client_id {
        None => None,
        Some(value) => match value.as_ref().filter(|v| v.is_truthy()) {
            Some(value) => Some(Some(owned_client(txn, user_id, value).await?)),
            None => Some(None),
        },
    };
    let service_date = match request.service_date.as_deref() {
        Some(raw) => Some(
            parse_service_date(raw)
                .ok_or_else(|| Rejection::Form(INVALID_SERVICE_DATE.to_string()))?,
        ),
        None => None,
    };

    let lines: HashMap<i32, task_machine::Model> = task_machine::Entity::find()
        .filter(task_machine::Column::TaskId.eq(task.id))
        .all(txn)
        .await?
        .into_iter()
        .map(|line| (line.id, line))
        .collect();
    if let Some(stray) = finishes
        .iter()
        .find(|f| !lines.contains_key(&f.task_machine_id))
    {
        return Err(Rejection::Fatal(ServiceError::NotFound(format!(
            "Ledger line {} not found on task {}",
            stray.task_machine_id, task.id
        ))));
    }

    if request.touches_task() {
        let mut active: task::ActiveModel = task.clone().into();
        if let Some(location) = location {
            active.location = Set(location);
        }
        if let Some(location_number) = location_number {
            active.location_number = Set(location_number);
        }
        if let Some(client_id) = client_id {
            active.client_id = Set(client_id);
        }
        if let Some(service_date) = service_date {
            active.service_date = Set(service_date);
        }
        if let Some(service_name) = request.service_name {
            active.service_name = Set(service_name.trim().to_string());
        }
        if request.description.is_some() {
            active.description = Set(clean(request.description));
        }
        active.update(txn).await?;
    }

    for finish in &finishes {
        let Some(line) = lines.get(&finish.task_machine_id) else {
            continue;
        };
        let usage = ledger::compute_usage(line.start_time, finish.end_time, line.hourly_rate);
        let mut active: task_machine::ActiveModel = line.clone().into();
        active.end_time = Set(Some(finish.end_time));
        active.hours_worked = Set(usage.hours_worked);
        active.total_amount = Set(usage.total_amount);
        active.update(txn).await?;
        counter!("farm_service.tasks.lines_finalized", 1);
        info!(
            task_id = id,
            task_machine_id = finish.task_machine_id,
            hours_worked = usage.hours_worked,
            total_amount = usage.total_amount,
            "ledger line finalized"
        );
    }

    if finishes.is_empty() {
        return Ok(None);
    }

    complete_if_finished(txn, user_id, id).await
}

/// Re-reads the ledger; when every line is finished marks the task completed
/// and writes its archive snapshot.
async fn complete_if_finished(
    txn: &DatabaseTransaction,
    user_id: i32,
    id: i32,
) -> Result<Option<i32>, Rejection> {
    let lines = task_machine::Entity::find()
        .filter(task_machine::Column::TaskId.eq(id))
        .order_by_asc(task_machine::Column::Id)
        .find_also_related(machine::Entity)
        .all(txn)
        .await?;

    if !ledger::all_lines_finished(lines.iter().map(|(line, _)| line.end_time)) {
        return Ok(None);
    }

    let task = find_task(txn, user_id, id).await?;
    let client = match task.client_id {
        Some(client_id) => client::Entity::find_by_id(client_id).one(txn).await?,
        None => None,
    };

    let mut active: task::ActiveModel = task.clone().into();
    active.completed = Set(true);
    let task = active.update(txn).await?;

    let record = history::snapshot(&task, client.as_ref(), &lines, Utc::now());
    let archived = history::archive(txn, record).await?;
    Ok(Some(archived.id))
}

/// Annotates tasks with their client and machines. Lines whose machine is
/// not owned by the user are left out of the view.
pub(crate) async fn build_views<C: ConnectionTrait>(
    conn: &C,
    user_id: i32,
    tasks: Vec<task::Model>,
) -> Result<Vec<TaskView>, DbErr> {
    if tasks.is_empty() {
        return Ok(Vec::new());
    }

    let task_ids: Vec<i32> = tasks.iter().map(|t| t.id).collect();
    let lines = task_machine::Entity::find()
        .filter(task_machine::Column::TaskId.is_in(task_ids))
        .order_by_asc(task_machine::Column::Id)
        .all(conn)
        .await?;

    let mut machine_ids: Vec<i32> = lines.iter().map(|l| l.machine_id).collect();
    machine_ids.sort_unstable();
    machine_ids.dedup();
    let machines: HashMap<i32, machine::Model> = machine::Entity::find()
        .filter(machine::Column::UserId.eq(user_id))
        .filter(machine::Column::Id.is_in(machine_ids))
        .all(conn)
        .await?
        .into_iter()
        .map(|m| (m.id, m))
        .collect();

    let mut client_ids: Vec<i32> = tasks.iter().filter_map(|t| t.client_id).collect();
    client_ids.sort_unstable();
    client_ids.dedup();
    let clients: HashMap<i32, client::Model> = client::Entity::find()
        .filter(client::Column::UserId.eq(user_id))
        .filter(client::Column::Id.is_in(client_ids))
        .all(conn)
        .await?
        .into_iter()
        .map(|c| (c.id, c))
        .collect();

    let mut by_task: HashMap<i32, Vec<TaskMachineEntry>> = HashMap::new();
    for line in &lines {
        let Some(machine) = machines.get(&line.machine_id) else {
            continue;
        };
        by_task
            .entry(line.task_id)
            .or_default()
            .push(TaskMachineEntry {
                id: machine.id,
                name: machine.name.clone(),
                machine_type: machine.machine_type.clone(),
                description: machine.description.clone(),
                task_machine: line.into(),
            });
    }

    Ok(tasks
        .into_iter()
        .map(|t| {
            let machines = by_task.remove(&t.id).unwrap_or_default();
            let total_amount = machines.iter().map(|m| m.task_machine.total_amount).sum();
            let client = t
                .client_id
                .and_then(|id| clients.get(&id))
                .map(|c| ClientSummary {
                    id: c.id,
                    name: c.name.clone(),
                    email: c.email.clone(),
                });
            TaskView {
                id: t.id,
                user_id: t.user_id,
                client_id: t.client_id,
                service_name: t.service_name,
                service_date: t.service_date,
                location: t.location,
                location_number: t.location_number,
                description: t.description,
                completed: t.completed,
                paid: t.paid,
                created_at: t.created_at,
                client,
                machines,
                total_amount,
            }
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positional_arrays_accept_scalars_and_lists() {
        let req: CreateTaskRequest = serde_json::from_value(serde_json::json!({
            "location": "Farm",
            "locationNumber": "1",
            "machine_ids": "4",
            "start_times": ["100"],
            "hourly_rates": [50]
        }))
        .unwrap();
        assert_eq!(req.machine_ids, vec![Some(FieldValue::from("4"))]);
        assert_eq!(req.hourly_rates, vec![Some(FieldValue::Number(50.0))]);
        assert_eq!(req.location_number.as_deref(), Some("1"));
    }

    #[test]
    fn update_request_tells_absent_from_null_client() {
        let absent: UpdateTaskRequest = serde_json::from_value(serde_json::json!({})).unwrap();
        assert!(absent.client_id.is_none());
        assert!(!absent.touches_task());

        let cleared: UpdateTaskRequest =
            serde_json::from_value(serde_json::json!({ "client_id": null })).unwrap();
        assert_eq!(cleared.client_id, Some(None));
        assert!(cleared.touches_task());
    }

    #[test]
    fn service_dates_accept_plain_and_rfc3339() {
        assert_eq!(
            parse_service_date("2024-05-01"),
            NaiveDate::from_ymd_opt(2024, 5, 1)
        );
        assert_eq!(
            parse_service_date("2024-05-01T10:00:00Z"),
            NaiveDate::from_ymd_opt(2024, 5, 1)
        );
        assert_eq!(parse_service_date("01/05/2024"), None);
    }

    #[test]
    fn in_use_message_names_machine_and_task() {
        let message = in_use_message("Tractor", "Harvest North");
        assert!(message.contains("\"Tractor\""));
        assert!(message.contains("\"Harvest North\""));
    }

    /// Seeds one user with one machine held open by a "Harvest North" task.
    async fn seeded_pool() -> (DbPool, i32, i32) {
        use crate::entities::user;

        let pool = crate::db::establish_connection("sqlite::memory:")
            .await
            .expect("connect");
        crate::db::run_migrations(&pool).await.expect("migrate");

        let owner = user::ActiveModel {
            name: Set("Ana".to_string()),
            username: Set("ana@greenacres.com".to_string()),
            password_hash: Set("x".to_string()),
            ..Default::default()
        }
        .insert(&pool)
        .await
        .expect("user");
        let tractor = machine::ActiveModel {
            user_id: Set(owner.id),
            name: Set("Tractor 1".to_string()),
            ..Default::default()
        }
        .insert(&pool)
        .await
        .expect("machine");
        let job = task::ActiveModel {
            user_id: Set(owner.id),
            service_name: Set("Harvest North".to_string()),
            service_date: Set(NaiveDate::from_ymd_opt(2024, 3, 1).expect("date")),
            location: Set("North field".to_string()),
            location_number: Set("12".to_string()),
            completed: Set(false),
            paid: Set(false),
            ..Default::default()
        }
        .insert(&pool)
        .await
        .expect("task");
        task_machine::ActiveModel {
            task_id: Set(job.id),
            machine_id: Set(tractor.id),
            start_time: Set(100.0),
            end_time: Set(None),
            hourly_rate: Set(50.0),
            hours_worked: Set(0.0),
            total_amount: Set(0.0),
            ..Default::default()
        }
        .insert(&pool)
        .await
        .expect("open line");

        (pool, owner.id, tractor.id)
    }

    #[tokio::test]
    async fn open_usage_conflict_names_the_blocking_task() {
        let (pool, user_id, machine_id) = seeded_pool().await;

        let message = open_usage_conflict(&pool, user_id, machine_id)
            .await
            .expect("query")
            .expect("machine is held");
        assert!(message.contains("\"Tractor 1\""));
        assert!(message.contains("\"Harvest North\""));

        let other_user = open_usage_conflict(&pool, user_id + 1, machine_id)
            .await
            .expect("query");
        assert!(other_user.is_none());
    }

    #[tokio::test]
    async fn index_race_is_reported_as_machine_in_use() {
        let (pool, user_id, machine_id) = seeded_pool().await;
        let service = TaskService::new(Arc::new(pool));

        let err = service
            .reject(user_id, None, Rejection::MachineRace(machine_id))
            .await;
        assert_matches::assert_matches!(&err, ServiceError::FormRejected(_));
        assert!(err.to_string().contains("\"Harvest North\""));
    }
}
