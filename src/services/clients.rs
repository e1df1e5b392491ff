use crate::{
    db::DbPool,
    entities::{client, task},
    errors::ServiceError,
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
pub struct CreateClientRequest {
    #[validate(length(min = 1, max = 120, message = "name must be between 1 and 120 characters"))]
    pub name: String,
    #[validate(email(message = "email is not a valid address"))]
    pub email: Option<String>,
    #[validate(length(max = 40))]
    pub phone: Option<String>,
    #[validate(length(max = 255))]
    pub address: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate, ToSchema)]
pub struct UpdateClientRequest {
    #[validate(length(min = 1, max = 120, message = "name must be between 1 and 120 characters"))]
    pub name: Option<String>,
    #[validate(email(message = "email is not a valid address"))]
    pub email: Option<String>,
    #[validate(length(max = 40))]
    pub phone: Option<String>,
    #[validate(length(max = 255))]
    pub address: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ClientResponse {
    pub id: i32,
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub address: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl From<client::Model> for ClientResponse {
    fn from(model: client::Model) -> Self {
        Self {
            id: model.id,
            name: model.name,
            email: model.email,
            phone: model.phone,
            address: model.address,
            created_at: model.created_at,
            updated_at: model.updated_at,
        }
    }
}

/// Trims and drops empty optional text.
pub(crate) fn clean(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Per-user client catalog
#[derive(Clone)]
pub struct ClientService {
    db: Arc<DbPool>,
}

impl ClientService {
    pub fn new(db: Arc<DbPool>) -> Self {
        Self { db }
    }

    /// Lists the user's clients by name
    #[instrument(skip(self))]
    pub async fn list(&self, user_id: i32) -> Result<Vec<client::Model>, ServiceError> {
        client::Entity::find()
            .filter(client::Column::UserId.eq(user_id))
            .order_by_asc(client::Column::Name)
            .all(&*self.db)
            .await
            .map_err(ServiceError::db_error)
    }

    #[instrument(skip(self))]
    pub async fn get(&self, user_id: i32, id: i32) -> Result<client::Model, ServiceError> {
        client::Entity::find_by_id(id)
            .filter(client::Column::UserId.eq(user_id))
            .one(&*self.db)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| ServiceError::NotFound(format!("Client {} not found", id)))
    }

    #[instrument(skip(self, request))]
    pub async fn create(
        &self,
        user_id: i32,
        request: CreateClientRequest,
    ) -> Result<client::Model, ServiceError> {
        let request = CreateClientRequest {
            name: request.name.trim().to_string(),
            email: clean(request.email),
            phone: clean(request.phone),
            address: clean(request.address),
        };
        request.validate()?;

        let model = client::ActiveModel {
            user_id: Set(user_id),
            name: Set(request.name),
            email: Set(request.email),
            phone: Set(request.phone),
            address: Set(request.address),
            ..Default::default()
        }
        .insert(&*self.db)
        .await
        .map_err(ServiceError::db_error)?;

        info!(client_id = model.id, user_id, "client created");
        Ok(model)
    }

    #[instrument(skip(self, request))]
    pub async fn update(
        &self,
        user_id: i32,
        id: i32,
        request: UpdateClientRequest,
    ) -> Result<client::Model, ServiceError> {
        // Present-but-blank clears an optional field
        let email = request.email.map(|v| clean(Some(v)));
        let phone = request.phone.map(|v| clean(Some(v)));
        let address = request.address.map(|v| clean(Some(v)));
        let name = request.name.map(|n| n.trim().to_string());

        UpdateClientRequest {
            name: name.clone(),
            email: email.clone().flatten(),
            phone: phone.clone().flatten(),
            address: address.clone().flatten(),
        }
        .validate()?;

        let existing = self.get(user_id, id).await?;
        let mut active: client::ActiveModel = existing.into();

        if let Some(name) = name {
            active.name = Set(name);
        }
        if let Some(email) = email {
            active.email = Set(email);
        }
        if let Some(phone) = phone {
            active.phone = Set(phone);
        }
        if let Some(address) = address {
            active.address = Set(address);
        }

        active
            .update(&*self.db)
            .await
            .map_err(ServiceError::db_error)
    }

    /// Deletes a client that no live task references. Archived history keeps
    /// its own copy of the client's name and is unaffected.
    #[instrument(skip(self))]
    pub async fn delete(&self, user_id: i32, id: i32) -> Result<(), ServiceError> {
        let existing = self.get(user_id, id).await?;

        let referencing = task::Entity::find()
            .filter(task::Column::ClientId.eq(existing.id))
            .count(&*self.db)
            .await
            .map_err(ServiceError::db_error)?;
        if referencing > 0 {
            return Err(ServiceError::Conflict(format!(
                "Client \"{}\" is referenced by {} task(s)",
                existing.name, referencing
            )));
        }

        client::Entity::delete_by_id(existing.id)
            .exec(&*self.db)
            .await
            .map_err(ServiceError::db_error)?;

        info!(client_id = id, user_id, "client deleted");
        Ok(())
    }
}
