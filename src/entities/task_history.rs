use chrono::{DateTime, NaiveDate, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Immutable snapshot of a completed task. `task_id` may point at a task that
/// has since been deleted.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "task_histories")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
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

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::task_history_machine::Entity")]
    Machines,
}

impl Related<super::task_history_machine::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Machines.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
