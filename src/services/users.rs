use crate::{
    auth::{email, hash_password, verify_password, PasswordPolicy},
    db::{is_unique_violation, DbPool},
    entities::user,
    errors::ServiceError,
};
use chrono::{DateTime, Utc};
use metrics::counter;
use sea_orm::{ActiveModelTrait, ColumnTrait, EntityTrait, QueryFilter, Set};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use utoipa::ToSchema;
use validator::{Validate, ValidationError};

const INVALID_CREDENTIALS: &str = "invalid email or password";

fn validate_name(name: &str) -> Result<(), ValidationError> {
    let length = name.trim().chars().count();
    if (2..=100).contains(&length) {
        Ok(())
    } else {
        let mut err = ValidationError::new("name_length");
        err.message = Some("name must be between 2 and 100 characters".into());
        Err(err)
    }
}

fn validate_username(username: &str) -> Result<(), ValidationError> {
    email::validate(&email::normalize(username)).map_err(|e| {
        let mut err = ValidationError::new("email");
        err.message = Some(e.to_string().into());
        err
    })
}

fn validate_password(password: &str) -> Result<(), ValidationError> {
    PasswordPolicy::default().validate(password).map_err(|e| {
        let mut err = ValidationError::new("password_policy");
        err.message = Some(e.to_string().into());
        err
    })
}

#[derive(Debug, Clone, Deserialize, Validate, ToSchema)]
pub struct RegisterRequest {
    #[validate(custom = "validate_name")]
    pub name: String,
    /// E-mail address used as login
    #[serde(alias = "email")]
    #[validate(custom = "validate_username")]
    pub username: String,
    #[validate(custom = "validate_password")]
    pub password: String,
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct LoginRequest {
    #[serde(alias = "email")]
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct UserResponse {
    pub id: i32,
    pub name: String,
    pub username: String,
    pub created_at: DateTime<Utc>,
}

impl From<user::Model> for UserResponse {
    fn from(model: user::Model) -> Self {
        Self {
            id: model.id,
            name: model.name,
            username: model.username,
            created_at: model.created_at,
        }
    }
}

/// Account registration and credential checks
#[derive(Clone)]
pub struct UserService {
    db: Arc<DbPool>,
}

impl UserService {
    pub fn new(db: Arc<DbPool>) -> Self {
        Self { db }
    }

    #[instrument(skip(self, request), fields(username = %request.username))]
    pub async fn register(&self, request: RegisterRequest) -> Result<UserResponse, ServiceError> {
        request.validate()?;
        let username = email::normalize(&request.username);

        let existing = user::Entity::find()
            .filter(user::Column::Username.eq(username.as_str()))
            .one(&*self.db)
            .await
            .map_err(ServiceError::db_error)?;
        if existing.is_some() {
            return Err(ServiceError::ValidationError(
                "email already registered".to_string(),
            ));
        }

        let password_hash = hash_password(&request.password)?;
        let inserted = user::ActiveModel {
            name: Set(request.name.trim().to_string()),
            username: Set(username),
            password_hash: Set(password_hash),
            ..Default::default()
        }
        .insert(&*self.db)
        .await;

        let model = match inserted {
            Ok(model) => model,
            Err(err) if is_unique_violation(&err) => {
                return Err(ServiceError::ValidationError(
                    "email already registered".to_string(),
                ))
            }
            Err(err) => return Err(ServiceError::db_error(err)),
        };

        counter!("farm_service.users.registered", 1);
        info!(user_id = model.id, "user registered");
        Ok(model.into())
    }

    /// Returns the user when the credentials match.
    #[instrument(skip(self, request), fields(username = %request.username))]
    pub async fn login(&self, request: LoginRequest) -> Result<UserResponse, ServiceError> {
        let username = email::normalize(&request.username);

        let Some(model) = user::Entity::find()
            .filter(user::Column::Username.eq(username.as_str()))
            .one(&*self.db)
            .await
            .map_err(ServiceError::db_error)?
        else {
            warn!("login for unknown user");
            return Err(ServiceError::AuthError(INVALID_CREDENTIALS.to_string()));
        };

        if !verify_password(&request.password, &model.password_hash)? {
            warn!(user_id = model.id, "login with wrong password");
            return Err(ServiceError::AuthError(INVALID_CREDENTIALS.to_string()));
        }

        info!(user_id = model.id, "user logged in");
        Ok(model.into())
    }

    #[instrument(skip(self))]
    pub async fn get(&self, user_id: i32) -> Result<UserResponse, ServiceError> {
        user::Entity::find_by_id(user_id)
            .one(&*self.db)
            .await
            .map_err(ServiceError::db_error)?
            .map(Into::into)
            .ok_or_else(|| ServiceError::NotFound(format!("User {} not found", user_id)))
    }
}
