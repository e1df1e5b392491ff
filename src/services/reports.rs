use crate::{
    db::DbPool,
    entities::task,
    errors::ServiceError,
    services::{
        history::{HistoryService, HistoryView},
        ledger,
        tasks::{build_views, TaskView},
    },
};
use chrono::{DateTime, NaiveDate, Utc};
use sea_orm::{ColumnTrait, EntityTrait, QueryFilter};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::sync::Arc;
use tracing::{info, instrument};
use utoipa::ToSchema;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum ReportSource {
    Live,
    Archive,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ReportLine {
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

/// Data handed to the billing statement renderer.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct BillingReport {
    pub source: ReportSource,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub history_id: Option<i32>,
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
    #[serde(rename = "completedAt", skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub lines: Vec<ReportLine>,
    #[serde(rename = "totalAmount")]
    pub total_amount: f64,
}

impl BillingReport {
    /// Report from a live task. Refused until every line has an end reading.
    pub fn from_live(task: TaskView) -> Result<Self, ServiceError> {
        if task.machines.is_empty() {
            return Err(ServiceError::PreconditionFailed(format!(
                "Task \"{}\" has no machines to bill",
                task.service_name
            )));
        }
        if !ledger::all_lines_finished(task.machines.iter().map(|m| m.task_machine.end_time)) {
            return Err(ServiceError::PreconditionFailed(format!(
                "Task \"{}\" still has machines without an end reading",
                task.service_name
            )));
        }

        let lines: Vec<ReportLine> = task
            .machines
            .into_iter()
            .map(|m| ReportLine {
                machine_name: m.name,
                machine_type: m.machine_type,
                start_time: m.task_machine.start_time,
                end_time: m.task_machine.end_time.unwrap_or_default(),
                hours_worked: m.task_machine.hours_worked,
                hourly_rate: m.task_machine.hourly_rate,
                total_amount: m.task_machine.total_amount,
            })
            .collect();
        let (client_name, client_email) = match task.client {
            Some(c) => (c.name, c.email),
            None => (String::new(), None),
        };

        Ok(Self {
            source: ReportSource::Live,
            task_id: Some(task.id),
            history_id: None,
            service_name: task.service_name,
            service_date: task.service_date,
            location: task.location,
            location_number: task.location_number,
            description: task.description,
            client_name,
            client_email,
            paid: task.paid,
            completed_at: None,
            total_amount: lines.iter().map(|l| l.total_amount).sum(),
            lines,
        })
    }

    pub fn from_archive(history: HistoryView) -> Self {
        Self {
            source: ReportSource::Archive,
            task_id: Some(history.task_id),
            history_id: Some(history.id),
            service_name: history.service_name,
            service_date: history.service_date,
            location: history.location,
            location_number: history.location_number,
            description: history.description,
            client_name: history.client_name,
            client_email: history.client_email,
            paid: history.paid,
            completed_at: Some(history.completed_at),
            total_amount: history.total_amount,
            lines: history
                .machines
                .into_iter()
                .map(|m| ReportLine {
                    machine_name: m.machine_name,
                    machine_type: m.machine_type,
                    start_time: m.start_time,
                    end_time: m.end_time,
                    hours_worked: m.hours_worked,
                    hourly_rate: m.hourly_rate,
                    total_amount: m.total_amount,
                })
                .collect(),
        }
    }

    /// Plain-text billing statement.
    pub fn render_text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "SERVICE STATEMENT");
        let _ = writeln!(out, "=================");
        let _ = writeln!(out, "Service:   {}", self.service_name);
        let _ = writeln!(out, "Date:      {}", self.service_date.format("%d/%m/%Y"));
        let _ = writeln!(
            out,
            "Location:  {} (no. {})",
            self.location, self.location_number
        );
        let client = if self.client_name.is_empty() {
            "-"
        } else {
            self.client_name.as_str()
        };
        match &self.client_email {
            Some(email) => {
                let _ = writeln!(out, "Client:    {} <{}>", client, email);
            }
            None => {
                let _ = writeln!(out, "Client:    {}", client);
            }
        }
        if let Some(description) = &self.description {
            let _ = writeln!(out, "Notes:     {}", description);
        }
        let _ = writeln!(out);

        for line in &self.lines {
            let label = match &line.machine_type {
                Some(kind) => format!("{} ({})", line.machine_name, kind),
                None => line.machine_name.clone(),
            };
            let _ = writeln!(out, "{}", label);
            let _ = writeln!(
                out,
                "  {:.2} -> {:.2} = {:.2} h x {:.2} = {:.2}",
                line.start_time,
                line.end_time,
                line.hours_worked,
                line.hourly_rate,
                line.total_amount
            );
        }

        let _ = writeln!(out);
        let _ = writeln!(out, "TOTAL: {:.2}", self.total_amount);
        let _ = writeln!(out, "Status: {}", if self.paid { "PAID" } else { "UNPAID" });
        out
    }
}

/// Resolves report input from a live task or its archive snapshot.
#[derive(Clone)]
pub struct ReportService {
    db: Arc<DbPool>,
    history: HistoryService,
}

impl ReportService {
    pub fn new(db: Arc<DbPool>, history: HistoryService) -> Self {
        Self { db, history }
    }

    /// Live task first; when it no longer exists, its archived snapshot.
    #[instrument(skip(self))]
    pub async fn for_task(&self, user_id: i32, task_id: i32) -> Result<BillingReport, ServiceError> {
        let live = task::Entity::find_by_id(task_id)
            .filter(task::Column::UserId.eq(user_id))
            .one(&*self.db)
            .await
            .map_err(ServiceError::db_error)?;

        if let Some(live) = live {
            let view = build_views(&*self.db, user_id, vec![live])
                .await
                .map_err(ServiceError::db_error)?
                .pop()
                .ok_or_else(|| ServiceError::NotFound(format!("Task {} not found", task_id)))?;
            let report = BillingReport::from_live(view)?;
            info!(task_id, "report built from live task");
            return Ok(report);
        }

        match self.history.find_for_task(user_id, task_id).await? {
            Some(history) => {
                info!(task_id, history_id = history.id, "report built from archive");
                Ok(BillingReport::from_archive(history))
            }
            None => Err(ServiceError::NotFound(format!(
                "Task {} not found",
                task_id
            ))),
        }
    }

    #[instrument(skip(self))]
    pub async fn for_history(&self, user_id: i32, id: i32) -> Result<BillingReport, ServiceError> {
        let history = self.history.get(user_id, id).await?;
        Ok(BillingReport::from_archive(history))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::tasks::{ClientSummary, TaskMachineEntry, TaskMachineView};
    use assert_matches::assert_matches;

    fn entry(id: i32, end: Option<f64>) -> TaskMachineEntry {
        TaskMachineEntry {
            id,
            name: format!("Machine {}", id),
            machine_type: Some("Tractor".into()),
            description: None,
            task_machine: TaskMachineView {
                id: id * 10,
                start_time: 100.0,
                end_time: end,
                hours_worked: end.map(|e| e - 100.0).unwrap_or(0.0),
                total_amount: end.map(|e| (e - 100.0) * 50.0).unwrap_or(0.0),
                hourly_rate: 50.0,
            },
        }
    }

    fn view(machines: Vec<TaskMachineEntry>) -> TaskView {
        TaskView {
            id: 1,
            user_id: 1,
            client_id: Some(2),
            service_name: "Spraying".into(),
            service_date: NaiveDate::from_ymd_opt(2024, 3, 9).unwrap(),
            location: "South plot".into(),
            location_number: "4".into(),
            description: None,
            completed: false,
            paid: false,
            created_at: Utc::now(),
            client: Some(ClientSummary {
                id: 2,
                name: "Sítio Esperança".into(),
                email: None,
            }),
            total_amount: machines.iter().map(|m| m.task_machine.total_amount).sum(),
            machines,
        }
    }

    #[test]
    fn live_report_requires_machines() {
        assert_matches!(
            BillingReport::from_live(view(vec![])),
            Err(ServiceError::PreconditionFailed(_))
        );
    }

    #[test]
    fn live_report_requires_every_end_reading() {
        assert_matches!(
            BillingReport::from_live(view(vec![entry(1, Some(105.0)), entry(2, None)])),
            Err(ServiceError::PreconditionFailed(_))
        );
    }

    #[test]
    fn live_report_sums_lines() {
        let report =
            BillingReport::from_live(view(vec![entry(1, Some(105.0)), entry(2, Some(102.0))]))
                .unwrap();
        assert_eq!(report.source, ReportSource::Live);
        assert_eq!(report.lines.len(), 2);
        assert_eq!(report.total_amount, 350.0);
        assert_eq!(report.client_name, "Sítio Esperança");

        let text = report.render_text();
        assert!(text.contains("Spraying"));
        assert!(text.contains("TOTAL: 350.00"));
        assert!(text.contains("UNPAID"));
    }
}
