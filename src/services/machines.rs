use crate::{
    db::DbPool,
    entities::{machine, task, task_machine},
    errors::ServiceError,
    services::clients::clean,
};
use chrono::{DateTime, Utc};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, EntityTrait, PaginatorTrait, QueryFilter, QueryOrder, Set,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument};
use utoipa::ToSchema;
use validator::Validate;

#[derive(Debug, Clone, Serialize, Deserialize, Validate, ToSchema)]
pub struct CreateMachineRequest {
    #[validate(length(min = 1, max = 120, message = "name must be between 1 and 120 characters"))]
    pub name: String,
    #[serde(default, alias = "type", alias = "machineType")]
    #[validate(length(max = 80))]
    pub machine_type: Option<String>,
    #[validate(length(max = 2000))]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate, ToSchema)]
pub struct UpdateMachineRequest {
    #[validate(length(min = 1, max = 120, message = "name must be between 1 and 120 characters"))]
    pub name: Option<String>,
    #[serde(default, alias = "type", alias = "machineType")]
    #[validate(length(max = 80))]
    pub machine_type: Option<String>,
    #[validate(length(max = 2000))]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct MachineResponse {
    pub id: i32,
    pub name: String,
    pub machine_type: Option<String>,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl From<machine::Model> for MachineResponse {
    fn from(model: machine::Model) -> Self {
        Self {
            id: model.id,
            name: model.name,
            machine_type: model.machine_type,
            description: model.description,
            created_at: model.created_at,
            updated_at: model.updated_at,
        }
    }
}

/// Whether a machine is currently held by an open ledger line.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct MachineUsage {
    pub machine_id: i32,
    pub in_use: bool,
    pub task_id: Option<i32>,
    #[serde(rename = "serviceName")]
    pub service_name: Option<String>,
    pub task_machine_id: Option<i32>,
    #[serde(rename = "startTime")]
    pub start_time: Option<f64>,
}

/// Per-user machine catalog
#[derive(Clone)]
pub struct MachineService {
    db: Arc<DbPool>,
}

impl MachineService {
    pub fn new(db: Arc<DbPool>) -> Self {
        Self { db }
    }

    /// Lists the user's machines by name
    #[instrument(skip(self))]
    pub async fn list(&self, user_id: i32) -> Result<Vec<machine::Model>, ServiceError> {
        machine::Entity::find()
            .filter(machine::Column::UserId.eq(user_id))
            .order_by_asc(machine::Column::Name)
            .all(&*self.db)
            .await
            .map_err(ServiceError::db_error)
    }

    #[instrument(skip(self))]
    pub async fn get(&self, user_id: i32, id: i32) -> Result<machine::Model, ServiceError> {
        machine::Entity::find_by_id(id)
            .filter(machine::Column::UserId.eq(user_id))
            .one(&*self.db)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| ServiceError::NotFound(format!("Machine {} not found", id)))
    }

    #[instrument(skip(self, request))]
    pub async fn create(
        &self,
        user_id: i32,
        request: CreateMachineRequest,
    ) -> Result<machine::Model, ServiceError> {
        let request = CreateMachineRequest {
            name: request.name.trim().to_string(),
            machine_type: clean(request.machine_type),
            description: clean(request.description),
        };
        request.validate()?;

        let model = machine::ActiveModel {
            user_id: Set(user_id),
            name: Set(request.name),
            machine_type: Set(request.machine_type),
            description: Set(request.description),
            ..Default::default()
        }
        .insert(&*self.db)
        .await
        .map_err(ServiceError::db_error)?;

        info!(machine_id = model.id, user_id, "machine created");
        Ok(model)
    }

    #[instrument(skip(self, request))]
    pub async fn update(
        &self,
        user_id: i32,
        id: i32,
        request: UpdateMachineRequest,
    ) -> Result<machine::Model, ServiceError> {
        let name = request.name.map(|n| n.trim().to_string());
        let machine_type = request.machine_type.map(|v| clean(Some(v)));
        let description = request.description.map(|v| clean(Some(v)));

        UpdateMachineRequest {
            name: name.clone(),
            machine_type: machine_type.clone().flatten(),
            description: description.clone().flatten(),
        }
        .validate()?;

        let existing = self.get(user_id, id).await?;
        let mut active: machine::ActiveModel = existing.into();
        if let Some(name) = name {
            active.name = Set(name);
        }
        if let Some(machine_type) = machine_type {
            active.machine_type = Set(machine_type);
        }
        if let Some(description) = description {
            active.description = Set(description);
        }

        active
            .update(&*self.db)
            .await
            .map_err(ServiceError::db_error)
    }

    /// Reports the open ledger line holding the machine, if any.
    #[instrument(skip(self))]
    pub async fn usage(&self, user_id: i32, id: i32) -> Result<MachineUsage, ServiceError> {
        let machine = self.get(user_id, id).await?;

        let open = task_machine::Entity::find()
            .filter(task_machine::Column::MachineId.eq(machine.id))
            .filter(task_machine::Column::EndTime.is_null())
            .find_also_related(task::Entity)
            .one(&*self.db)
            .await
            .map_err(ServiceError::db_error)?;

        Ok(match open {
            Some((line, task)) => MachineUsage {
                machine_id: machine.id,
                in_use: true,
                task_id: Some(line.task_id),
                service_name: task.map(|t| t.service_name),
                task_machine_id: Some(line.id),
                start_time: Some(line.start_time),
            },
            None => MachineUsage {
                machine_id: machine.id,
                in_use: false,
                task_id: None,
                service_name: None,
                task_machine_id: None,
                start_time: None,
            },
        })
    }

    /// Deletes a machine that no ledger line references.
    #[instrument(skip(self))]
    pub async fn delete(&self, user_id: i32, id: i32) -> Result<(), ServiceError> {
        let existing = self.get(user_id, id).await?;

        let referencing = task_machine::Entity::find()
            .filter(task_machine::Column::MachineId.eq(existing.id))
            .count(&*self.db)
            .await
            .map_err(ServiceError::db_error)?;
        if referencing > 0 {
            return Err(ServiceError::Conflict(format!(
                "Machine \"{}\" is used on {} task line(s)",
                existing.name, referencing
            )));
        }

        machine::Entity::delete_by_id(existing.id)
            .exec(&*self.db)
            .await
            .map_err(ServiceError::db_error)?;

        info!(machine_id = id, user_id, "machine deleted");
        Ok(())
    }
}
