pub mod client;
pub mod machine;
pub mod task;
pub mod task_history;
pub mod task_history_machine;
pub mod task_machine;
pub mod user;
