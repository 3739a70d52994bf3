pub mod backups;
pub mod connections;
pub mod error;
pub mod health;
pub mod jobs;
pub mod operations;
pub mod schedules;
pub mod settings;
