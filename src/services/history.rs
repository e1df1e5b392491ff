use crate::{
    db::DbPool,
    entities::{client, machine, task, task_history, task_history_machine, task_machine},
    errors::ServiceError,
};
use chrono::{DateTime, NaiveDate, Utc};
use metrics::counter;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DbErr, EntityTrait, PaginatorTrait,
    QueryFilter, QueryOrder, QuerySelect, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument};
use utoipa::ToSchema;

/// Fixed page size of the history listing
pub const HISTORY_PAGE_SIZE: u64 = 10;

/// Denormalized copy of a completed task, ready to be written.
#[derive(Debug, Clone, PartialEq)]
pub struct HistorySnapshot {
    pub task_id: i32,
    pub user_id: i32,
    pub service_name: String,
    pub service_date: NaiveDate,
    pub location: String,
    pub location_number: String,
    pub description: Option<String>,
    pub client_name: String,
    pub client_email: Option<String>,
    pub paid: bool,
    pub total_amount: f64,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HistoryMachineSnapshot {
    pub machine_name: String,
    pub machine_type: Option<String>,
    pub start_time: f64,
    pub end_time: f64,
    pub hours_worked: f64,
    pub hourly_rate: f64,
    pub total_amount: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ArchiveRecord {
    pub history: HistorySnapshot,
    pub machines: Vec<HistoryMachineSnapshot>,
}

/// Builds the archive record for a finished task. Names and e-mail are copied
/// as they are right now, so later edits to the client or machines do not
/// reach the archive.
pub fn snapshot(
    task: &task::Model,
    client: Option<&client::Model>,
    lines: &[(task_machine::Model, Option<machine::Model>)],
    completed_at: DateTime<Utc>,
) -> ArchiveRecord {
    let machines: Vec<HistoryMachineSnapshot> = lines
        .iter()
        .map(|(line, machine)| HistoryMachineSnapshot {
            machine_name: machine.as_ref().map(|m| m.name.clone()).unwrap_or_default(),
            machine_type: machine.as_ref().and_then(|m| m.machine_type.clone()),
            start_time: line.start_time,
            end_time: line.end_time.unwrap_or_default(),
            hours_worked: line.hours_worked,
            hourly_rate: line.hourly_rate,
            total_amount: line.total_amount,
        })
        .collect();

    let total_amount = lines.iter().map(|(line, _)| line.total_amount).sum();

    ArchiveRecord {
        history: HistorySnapshot {
            task_id: task.id,
            user_id: task.user_id,
            service_name: task.service_name.clone(),
            service_date: task.service_date,
            location: task.location.clone(),
            location_number: task.location_number.clone(),
            description: task.description.clone(),
            client_name: client.map(|c| c.name.clone()).unwrap_or_default(),
            client_email: client.and_then(|c| c.email.clone()),
            paid: task.paid,
            total_amount,
            completed_at,
        },
        machines,
    }
}

/// Writes an archive record; callers run this inside their transaction.
pub async fn archive<C: ConnectionTrait>(
    conn: &C,
    record: ArchiveRecord,
) -> Result<task_history::Model, DbErr> {
    let h = record.history;
    let history = task_history::ActiveModel {
        task_id: Set(h.task_id),
        user_id: Set(h.user_id),
        service_name: Set(h.service_name),
        service_date: Set(h.service_date),
        location: Set(h.location),
        location_number: Set(h.location_number),
        description: Set(h.description),
        client_name: Set(h.client_name),
        client_email: Set(h.client_email),
        paid: Set(h.paid),
        total_amount: Set(h.total_amount),
        completed_at: Set(h.completed_at),
        ..Default::default()
    }
    .insert(conn)
    .await?;

    for m in record.machines {
        task_history_machine::ActiveModel {
            history_id: Set(history.id),
            machine_name: Set(m.machine_name),
            machine_type: Set(m.machine_type),
            start_time: Set(m.start_time),
            end_time: Set(m.end_time),
            hours_worked: Set(m.hours_worked),
            hourly_rate: Set(m.hourly_rate),
            total_amount: Set(m.total_amount),
            ..Default::default()
        }
        .insert(conn)
        .await?;
    }

    Ok(history)
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct HistoryMachineView {
    pub id: i32,
    #[serde(rename = "machineName")]
    pub machine_name: String,
    #[serde(rename = "machineType")]
    pub machine_type: Option<String>,
    #[serde(rename = "startTime")]
    pub start_time: f64,
    #[serde(rename = "endTime")]
    pub end_time: f64,
    #[serde(rename = "hoursWorked")]
    pub hours_worked: f64,
    #[serde(rename = "hourlyRate")]
    pub hourly_rate: f64,
    #[serde(rename = "totalAmount")]
    pub total_amount: f64,
}

impl From<task_history_machine::Model> for HistoryMachineView {
    fn from(m: task_history_machine::Model) -> Self {
        Self {
            id: m.id,
            machine_name: m.machine_name,
            machine_type: m.machine_type,
            start_time: m.start_time,
            end_time: m.end_time,
            hours_worked: m.hours_worked,
            hourly_rate: m.hourly_rate,
            total_amount: m.total_amount,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct HistoryView {
    pub id: i32,
    pub task_id: i32,
    #[serde(rename = "serviceName")]
    pub service_name: String,
    pub service_date: NaiveDate,
    pub location: String,
    #[serde(rename = "locationNumber")]
    pub location_number: String,
    pub description: Option<String>,
    #[serde(rename = "clientName")]
    pub client_name: String,
    #[serde(rename = "clientEmail")]
    pub client_email: Option<String>,
    pub paid: bool,
    #[serde(rename = "totalAmount")]
    pub total_amount: f64,
    pub user_id: i32,
    #[serde(rename = "completedAt")]
    pub completed_at: DateTime<Utc>,
    #[serde(default)]
    pub machines: Vec<HistoryMachineView>,
}

impl HistoryView {
    fn from_parts(h: task_history::Model, machines: Vec<task_history_machine::Model>) -> Self {
        Self {
            id: h.id,
            task_id: h.task_id,
            service_name: h.service_name,
            service_date: h.service_date,
            location: h.location,
            location_number: h.location_number,
            description: h.description,
            client_name: h.client_name,
            client_email: h.client_email,
            paid: h.paid,
            total_amount: h.total_amount,
            user_id: h.user_id,
            completed_at: h.completed_at,
            machines: machines.into_iter().map(Into::into).collect(),
        }
    }
}

/// Listing filters; every bound is optional and inclusive.
#[derive(Debug, Clone, Default)]
pub struct HistoryFilter {
    pub client_name: Option<String>,
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
    pub page: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct HistoryPage {
    pub items: Vec<HistoryView>,
    pub total: u64,
    pub page: u64,
    pub limit: u64,
    pub total_pages: u64,
    /// Distinct client names across the user's archive, for the filter
    pub client_names: Vec<String>,
}

/// Read side of the archive plus the payment flag
#[derive(Clone)]
pub struct HistoryService {
    db: Arc<DbPool>,
}

impl HistoryService {
    pub fn new(db: Arc<DbPool>) -> Self {
        Self { db }
    }

    /// Lists snapshots newest first, [`HISTORY_PAGE_SIZE`] per page.
    #[instrument(skip(self))]
    pub async fn list(
        &self,
        user_id: i32,
        filter: HistoryFilter,
    ) -> Result<HistoryPage, ServiceError> {
        let mut query =
            task_history::Entity::find().filter(task_history::Column::UserId.eq(user_id));

        if let Some(name) = filter.client_name.as_deref().filter(|n| !n.is_empty()) {
            query = query.filter(task_history::Column::ClientName.eq(name));
        }
        if let Some(from) = filter.from {
            query = query.filter(task_history::Column::ServiceDate.gte(from));
        }
        if let Some(to) = filter.to {
            query = query.filter(task_history::Column::ServiceDate.lte(to));
        }

        let page = filter.page.max(1);
        let paginator = query
            .order_by_desc(task_history::Column::CompletedAt)
            .order_by_desc(task_history::Column::Id)
            .paginate(&*self.db, HISTORY_PAGE_SIZE);

        let total = paginator.num_items().await.map_err(ServiceError::db_error)?;
        let rows = paginator
            .fetch_page(page - 1)
            .await
            .map_err(ServiceError::db_error)?;

        let ids: Vec<i32> = rows.iter().map(|h| h.id).collect();
        let mut lines = task_history_machine::Entity::find()
            .filter(task_history_machine::Column::HistoryId.is_in(ids))
            .order_by_asc(task_history_machine::Column::Id)
            .all(&*self.db)
            .await
            .map_err(ServiceError::db_error)?;

        let items = rows
            .into_iter()
            .map(|h| {
                let (mine, rest): (Vec<_>, Vec<_>) =
                    lines.drain(..).partition(|m| m.history_id == h.id);
                lines = rest;
                HistoryView::from_parts(h, mine)
            })
            .collect();

        let client_names: Vec<String> = task_history::Entity::find()
            .select_only()
            .column(task_history::Column::ClientName)
            .distinct()
            .filter(task_history::Column::UserId.eq(user_id))
            .order_by_asc(task_history::Column::ClientName)
            .into_tuple()
            .all(&*self.db)
            .await
            .map_err(ServiceError::db_error)?;

        Ok(HistoryPage {
            items,
            total,
            page,
            limit: HISTORY_PAGE_SIZE,
            total_pages: total.div_ceil(HISTORY_PAGE_SIZE),
            client_names,
        })
    }

    /// One snapshot with its machine lines
    #[instrument(skip(self))]
    pub async fn get(&self, user_id: i32, id: i32) -> Result<HistoryView, ServiceError> {
        let history = task_history::Entity::find_by_id(id)
            .filter(task_history::Column::UserId.eq(user_id))
            .one(&*self.db)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| ServiceError::NotFound(format!("History {} not found", id)))?;
        self.with_machines(history).await
    }

    /// Latest snapshot of a task, if it was ever archived.
    #[instrument(skip(self))]
    pub async fn find_for_task(
        &self,
        user_id: i32,
        task_id: i32,
    ) -> Result<Option<HistoryView>, ServiceError> {
        let history = task_history::Entity::find()
            .filter(task_history::Column::UserId.eq(user_id))
            .filter(task_history::Column::TaskId.eq(task_id))
            .order_by_desc(task_history::Column::CompletedAt)
            .one(&*self.db)
            .await
            .map_err(ServiceError::db_error)?;
        match history {
            Some(h) => Ok(Some(self.with_machines(h).await?)),
            None => Ok(None),
        }
    }

    async fn with_machines(
        &self,
        history: task_history::Model,
    ) -> Result<HistoryView, ServiceError> {
        let machines = task_history_machine::Entity::find()
            .filter(task_history_machine::Column::HistoryId.eq(history.id))
            .order_by_asc(task_history_machine::Column::Id)
            .all(&*self.db)
            .await
            .map_err(ServiceError::db_error)?;
        Ok(HistoryView::from_parts(history, machines))
    }

    /// Toggles the snapshot's payment flag and, when the task still exists,
    /// the live task's flag too.
    #[instrument(skip(self))]
    pub async fn set_paid(
        &self,
        user_id: i32,
        id: i32,
        paid: bool,
    ) -> Result<HistoryView, ServiceError> {
        let txn = self.db.begin().await.map_err(ServiceError::db_error)?;

        let history = task_history::Entity::find_by_id(id)
            .filter(task_history::Column::UserId.eq(user_id))
            .one(&txn)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| ServiceError::NotFound(format!("History {} not found", id)))?;

        let task_id = history.task_id;
        let mut active: task_history::ActiveModel = history.into();
        active.paid = Set(paid);
        let history = active.update(&txn).await.map_err(ServiceError::db_error)?;

        task::Entity::update_many()
            .col_expr(task::Column::Paid, sea_orm::sea_query::Expr::value(paid))
            .filter(task::Column::Id.eq(task_id))
            .filter(task::Column::UserId.eq(user_id))
            .exec(&txn)
            .await
            .map_err(ServiceError::db_error)?;

        txn.commit().await.map_err(ServiceError::db_error)?;

        counter!("farm_service.history.payment_toggled", 1);
        info!(history_id = id, task_id, paid, "history payment status changed");

        self.with_machines(history).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task_model() -> task::Model {
        task::Model {
            id: 7,
            user_id: 1,
            client_id: Some(3),
            service_name: "Harvest".into(),
            service_date: NaiveDate::from_ymd_opt(2024, 4, 2).unwrap(),
            location: "North field".into(),
            location_number: "12".into(),
            description: Some("soy".into()),
            completed: false,
            paid: true,
            created_at: Utc::now(),
            updated_at: None,
        }
    }

    fn line(id: i32, machine_id: i32, start: f64, end: f64, rate: f64) -> task_machine::Model {
        let usage = crate::services::ledger::compute_usage(start, end, rate);
        task_machine::Model {
            id,
            task_id: 7,
            machine_id,
            start_time: start,
            end_time: Some(end),
            hourly_rate: rate,
            hours_worked: usage.hours_worked,
            total_amount: usage.total_amount,
            created_at: Utc::now(),
        }
    }

    fn machine_model(id: i32, name: &str, kind: Option<&str>) -> machine::Model {
        machine::Model {
            id,
            user_id: 1,
            name: name.into(),
            machine_type: kind.map(Into::into),
            description: None,
            created_at: Utc::now(),
            updated_at: None,
        }
    }

    #[test]
    fn snapshot_copies_task_client_and_lines() {
        let client = client::Model {
            id: 3,
            user_id: 1,
            name: "Fazenda Boa Vista".into(),
            email: Some("contato@boavista.com.br".into()),
            phone: None,
            address: None,
            created_at: Utc::now(),
            updated_at: None,
        };
        let lines = vec![
            (
                line(1, 10, 100.0, 105.0, 50.0),
                Some(machine_model(10, "Tractor", Some("JD 6110"))),
            ),
            (
                line(2, 11, 20.0, 22.5, 40.0),
                Some(machine_model(11, "Sprayer", None)),
            ),
        ];
        let completed_at = Utc::now();

        let record = snapshot(&task_model(), Some(&client), &lines, completed_at);

        assert_eq!(record.history.task_id, 7);
        assert_eq!(record.history.client_name, "Fazenda Boa Vista");
        assert_eq!(
            record.history.client_email.as_deref(),
            Some("contato@boavista.com.br")
        );
        assert_eq!(record.history.total_amount, 350.0);
        assert!(record.history.paid);
        assert_eq!(record.history.completed_at, completed_at);
        assert_eq!(record.machines.len(), 2);
        assert_eq!(record.machines[0].machine_name, "Tractor");
        assert_eq!(record.machines[0].machine_type.as_deref(), Some("JD 6110"));
        assert_eq!(record.machines[0].hours_worked, 5.0);
        assert_eq!(record.machines[1].end_time, 22.5);
    }

    #[test]
    fn snapshot_without_client_uses_empty_name() {
        let lines = vec![(line(1, 10, 0.0, 1.0, 10.0), None)];
        let record = snapshot(&task_model(), None, &lines, Utc::now());
        assert_eq!(record.history.client_name, "");
        assert!(record.history.client_email.is_none());
        assert_eq!(record.machines[0].machine_name, "");
    }
}
