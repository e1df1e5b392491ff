pub mod auth;
pub mod clients;
pub mod common;
pub mod history;
pub mod machines;
pub mod tasks;

use crate::{
    auth::AuthService,
    db::DbPool,
    services::{
        clients::ClientService, history::HistoryService, machines::MachineService,
        reports::ReportService, tasks::TaskService, users::UserService,
    },
};
use std::sync::Arc;

// Re-export AppState so handler modules can import it as crate::handlers::AppState
pub use crate::AppState;

/// Services layer that encapsulates business logic used by HTTP handlers
#[derive(Clone)]
pub struct AppServices {
    pub auth: Arc<AuthService>,
    pub users: Arc<UserService>,
    pub clients: Arc<ClientService>,
    pub machines: Arc<MachineService>,
    pub tasks: Arc<TaskService>,
    pub history: Arc<HistoryService>,
    pub reports: Arc<ReportService>,
}

impl AppServices {
    pub fn new(db_pool: Arc<DbPool>, auth_service: Arc<AuthService>) -> Self {
        let history = HistoryService::new(db_pool.clone());
        let reports = ReportService::new(db_pool.clone(), history.clone());

        Self {
            auth: auth_service,
            users: Arc::new(UserService::new(db_pool.clone())),
            clients: Arc::new(ClientService::new(db_pool.clone())),
            machines: Arc::new(MachineService::new(db_pool.clone())),
            tasks: Arc::new(TaskService::new(db_pool)),
            history: Arc::new(history),
            reports: Arc::new(reports),
        }
    }
}
