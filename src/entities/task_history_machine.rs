use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "task_history_machines")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    pub history_id: i32,
    pub machine_name: String,
    pub machine_type: Option<String>,
    pub start_time: f64,
    pub end_time: f64,
    pub hours_worked: f64,
    pub hourly_rate: f64,
    pub total_amount: f64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::task_history::Entity",
        from = "Column::HistoryId",
        to = "super::task_history::Column::Id",
        on_delete = "Cascade"
    )]
    History,
}

impl Related<super::task_history::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::History.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
