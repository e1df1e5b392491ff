// Catalogs
pub mod clients;
pub mod machines;

// Task lifecycle
pub mod ledger;
pub mod tasks;

// Archive and billing
pub mod history;
pub mod reports;

// Accounts
pub mod users;
